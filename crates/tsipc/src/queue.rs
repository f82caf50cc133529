//! Bounded record queues in shared memory.
//!
//! A `ShmQueue` is a fixed-capacity ring of variable-length records (up to a
//! fixed maximum) living entirely inside a named shared-memory segment, so
//! that producer and consumers may be different processes. Blocking uses a
//! process-shared pthread mutex and two condition variables stored in the
//! segment header.
//!
//! Zero-length records are valid; the fabric uses one as its end-of-stream
//! sentinel on the work-item queue.

use crate::shm::{SharedRegion, ShmError};
use std::time::Duration;
use thiserror::Error;

/// Error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying shared-memory failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// A record exceeds the queue's fixed maximum size.
    #[error("record of {len} bytes exceeds maximum {max}")]
    RecordTooLarge {
        /// Offered record length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The attached segment does not contain a queue with these parameters.
    #[error("segment {0} is not a compatible queue")]
    IncompatibleSegment(String),
    /// A pthread call failed.
    #[error("pthread {0} failed: {1}")]
    Pthread(&'static str, i32),
}

const QUEUE_MAGIC: u64 = 0x7473_5f71_7565_7565; // "ts_queue"

#[repr(C)]
struct QueueHeader {
    mutex: libc::pthread_mutex_t,
    not_empty: libc::pthread_cond_t,
    not_full: libc::pthread_cond_t,
    magic: u64,
    capacity: u64,
    max_record_size: u64,
    count: u64,
    head: u64,
    tail: u64,
}

/// A bounded multi-process record queue in a named shared-memory segment.
pub struct ShmQueue {
    region: SharedRegion,
    slot_stride: usize,
}

// SAFETY: all mutable state inside the region is guarded by the
// process-shared mutex in the header.
unsafe impl Send for ShmQueue {}
unsafe impl Sync for ShmQueue {}

impl ShmQueue {
    /// Creates a queue of `capacity` records of at most `max_record_size`
    /// bytes in a new named segment.
    pub fn create(name: &str, capacity: usize, max_record_size: usize) -> Result<Self, QueueError> {
        let slot_stride = Self::stride(max_record_size);
        let len = Self::header_len() + capacity * slot_stride;
        let region = SharedRegion::create(name, len)?;

        let queue = Self {
            region,
            slot_stride,
        };
        // SAFETY: freshly created exclusive mapping, large enough for the
        // header by construction.
        unsafe {
            let hdr = queue.header();
            Self::init_sync(hdr)?;
            (*hdr).magic = QUEUE_MAGIC;
            (*hdr).capacity = capacity as u64;
            (*hdr).max_record_size = max_record_size as u64;
            (*hdr).count = 0;
            (*hdr).head = 0;
            (*hdr).tail = 0;
        }
        Ok(queue)
    }

    /// Attaches to an existing queue segment.
    pub fn open(name: &str) -> Result<Self, QueueError> {
        let region = SharedRegion::open(name)?;
        if region.len() < Self::header_len() {
            return Err(QueueError::IncompatibleSegment(name.to_owned()));
        }
        let queue = Self {
            region,
            slot_stride: 0,
        };
        // SAFETY: length checked above; the creator initialized the header.
        let (magic, max_record_size, capacity) = unsafe {
            let hdr = queue.header();
            ((*hdr).magic, (*hdr).max_record_size, (*hdr).capacity)
        };
        if magic != QUEUE_MAGIC {
            return Err(QueueError::IncompatibleSegment(name.to_owned()));
        }
        let slot_stride = Self::stride(max_record_size as usize);
        if queue.region.len() < Self::header_len() + capacity as usize * slot_stride {
            return Err(QueueError::IncompatibleSegment(name.to_owned()));
        }
        Ok(Self {
            slot_stride,
            ..queue
        })
    }

    /// The maximum record size in bytes.
    pub fn max_record_size(&self) -> usize {
        // SAFETY: header validated at construction.
        unsafe { (*self.header()).max_record_size as usize }
    }

    /// Sends a record, blocking while the queue is full.
    pub fn send(&self, record: &[u8]) -> Result<(), QueueError> {
        self.check_len(record.len())?;
        // SAFETY: mutex/conds initialized by the creator; lock discipline
        // below is plain monitor style.
        unsafe {
            let hdr = self.header();
            self.lock(hdr)?;
            while (*hdr).count == (*hdr).capacity {
                let rc = libc::pthread_cond_wait(&raw mut (*hdr).not_full, &raw mut (*hdr).mutex);
                if rc != 0 {
                    self.unlock(hdr);
                    return Err(QueueError::Pthread("cond_wait", rc));
                }
            }
            self.write_slot(hdr, record);
            libc::pthread_cond_signal(&raw mut (*hdr).not_empty);
            self.unlock(hdr);
        }
        Ok(())
    }

    /// Receives a record, blocking while the queue is empty.
    pub fn recv(&self) -> Result<Vec<u8>, QueueError> {
        // SAFETY: as in `send`.
        unsafe {
            let hdr = self.header();
            self.lock(hdr)?;
            while (*hdr).count == 0 {
                let rc = libc::pthread_cond_wait(&raw mut (*hdr).not_empty, &raw mut (*hdr).mutex);
                if rc != 0 {
                    self.unlock(hdr);
                    return Err(QueueError::Pthread("cond_wait", rc));
                }
            }
            let record = self.read_slot(hdr);
            libc::pthread_cond_signal(&raw mut (*hdr).not_full);
            self.unlock(hdr);
            Ok(record)
        }
    }

    /// Receives a record, giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, QueueError> {
        let deadline = Self::abstime_after(timeout);
        // SAFETY: as in `send`.
        unsafe {
            let hdr = self.header();
            self.lock(hdr)?;
            while (*hdr).count == 0 {
                let rc = libc::pthread_cond_timedwait(
                    &raw mut (*hdr).not_empty,
                    &raw mut (*hdr).mutex,
                    &deadline,
                );
                if rc == libc::ETIMEDOUT {
                    self.unlock(hdr);
                    return Ok(None);
                }
                if rc != 0 {
                    self.unlock(hdr);
                    return Err(QueueError::Pthread("cond_timedwait", rc));
                }
            }
            let record = self.read_slot(hdr);
            libc::pthread_cond_signal(&raw mut (*hdr).not_full);
            self.unlock(hdr);
            Ok(Some(record))
        }
    }

    /// Receives a record if one is immediately available.
    pub fn try_recv(&self) -> Result<Option<Vec<u8>>, QueueError> {
        // SAFETY: as in `send`.
        unsafe {
            let hdr = self.header();
            self.lock(hdr)?;
            if (*hdr).count == 0 {
                self.unlock(hdr);
                return Ok(None);
            }
            let record = self.read_slot(hdr);
            libc::pthread_cond_signal(&raw mut (*hdr).not_full);
            self.unlock(hdr);
            Ok(Some(record))
        }
    }

    /// Number of records currently queued.
    pub fn len(&self) -> usize {
        // SAFETY: a torn read is impossible under the mutex.
        unsafe {
            let hdr = self.header();
            if self.lock(hdr).is_err() {
                return 0;
            }
            let n = (*hdr).count as usize;
            self.unlock(hdr);
            n
        }
    }

    /// Returns true if no records are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---------------------------------------------------------------------
    // INTERNALS
    // ---------------------------------------------------------------------

    fn header(&self) -> *mut QueueHeader {
        self.region.as_mut_ptr().cast::<QueueHeader>()
    }

    fn header_len() -> usize {
        // slots start 8-byte aligned after the header
        (std::mem::size_of::<QueueHeader>() + 7) & !7
    }

    fn stride(max_record_size: usize) -> usize {
        // u32 length prefix + payload, kept 8-byte aligned
        (4 + max_record_size + 7) & !7
    }

    fn check_len(&self, len: usize) -> Result<(), QueueError> {
        let max = self.max_record_size();
        if len > max {
            return Err(QueueError::RecordTooLarge { len, max });
        }
        Ok(())
    }

    unsafe fn slot_ptr(&self, index: u64) -> *mut u8 {
        let hdr = self.header();
        let slot = (index % (*hdr).capacity) as usize;
        self.region
            .as_mut_ptr()
            .add(Self::header_len() + slot * self.slot_stride)
    }

    unsafe fn write_slot(&self, hdr: *mut QueueHeader, record: &[u8]) {
        let slot = self.slot_ptr((*hdr).tail);
        slot.cast::<u32>().write_unaligned(record.len() as u32);
        std::ptr::copy_nonoverlapping(record.as_ptr(), slot.add(4), record.len());
        (*hdr).tail = (*hdr).tail.wrapping_add(1);
        (*hdr).count += 1;
    }

    unsafe fn read_slot(&self, hdr: *mut QueueHeader) -> Vec<u8> {
        let slot = self.slot_ptr((*hdr).head);
        let len = slot.cast::<u32>().read_unaligned() as usize;
        let mut record = vec![0u8; len];
        std::ptr::copy_nonoverlapping(slot.add(4), record.as_mut_ptr(), len);
        (*hdr).head = (*hdr).head.wrapping_add(1);
        (*hdr).count -= 1;
        record
    }

    unsafe fn lock(&self, hdr: *mut QueueHeader) -> Result<(), QueueError> {
        let rc = libc::pthread_mutex_lock(&raw mut (*hdr).mutex);
        if rc != 0 {
            return Err(QueueError::Pthread("mutex_lock", rc));
        }
        Ok(())
    }

    unsafe fn unlock(&self, hdr: *mut QueueHeader) {
        libc::pthread_mutex_unlock(&raw mut (*hdr).mutex);
    }

    unsafe fn init_sync(hdr: *mut QueueHeader) -> Result<(), QueueError> {
        let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let mut rc = libc::pthread_mutexattr_init(&mut mattr);
        if rc == 0 {
            rc = libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
        }
        if rc == 0 {
            rc = libc::pthread_mutex_init(&raw mut (*hdr).mutex, &mattr);
        }
        libc::pthread_mutexattr_destroy(&mut mattr);
        if rc != 0 {
            return Err(QueueError::Pthread("mutex_init", rc));
        }

        for cond in [&raw mut (*hdr).not_empty, &raw mut (*hdr).not_full] {
            let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
            let mut rc = libc::pthread_condattr_init(&mut cattr);
            if rc == 0 {
                rc = libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
            }
            if rc == 0 {
                rc = libc::pthread_cond_init(cond, &cattr);
            }
            libc::pthread_condattr_destroy(&mut cattr);
            if rc != 0 {
                return Err(QueueError::Pthread("cond_init", rc));
            }
        }
        Ok(())
    }

    fn abstime_after(timeout: Duration) -> libc::timespec {
        // SAFETY: clock_gettime with a valid out-pointer.
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000),
            tv_nsec: nanos % 1_000_000_000,
        }
    }
}

impl std::fmt::Debug for ShmQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmQueue")
            .field("name", &self.region.name())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        format!("tsipc_queue_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let q = ShmQueue::create(&unique_name("rt"), 4, 64).unwrap();
        q.send(b"hello").unwrap();
        q.send(b"").unwrap(); // zero-length sentinel record
        assert_eq!(q.recv().unwrap(), b"hello");
        assert_eq!(q.recv().unwrap(), b"");
        assert!(q.is_empty());
    }

    #[test]
    fn test_record_too_large() {
        let q = ShmQueue::create(&unique_name("large"), 4, 8).unwrap();
        assert!(matches!(
            q.send(&[0u8; 9]),
            Err(QueueError::RecordTooLarge { len: 9, max: 8 })
        ));
    }

    #[test]
    fn test_recv_timeout_empty() {
        let q = ShmQueue::create(&unique_name("timeout"), 4, 8).unwrap();
        let got = q.recv_timeout(Duration::from_millis(20)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_blocking_handoff_between_threads() {
        let name = unique_name("threads");
        let q = Arc::new(ShmQueue::create(&name, 2, 16).unwrap());

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0u32..32 {
                    q.send(&i.to_le_bytes()).unwrap();
                }
            })
        };

        let mut expected = 0u32;
        while expected < 32 {
            let record = q.recv().unwrap();
            assert_eq!(record, expected.to_le_bytes());
            expected += 1;
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_open_attaches_to_same_queue() {
        let name = unique_name("attach");
        let creator = ShmQueue::create(&name, 4, 32).unwrap();
        let attached = ShmQueue::open(&name).unwrap();
        creator.send(b"from creator").unwrap();
        assert_eq!(attached.recv().unwrap(), b"from creator");
    }
}
