//! Data sources feeding the input rings.
//!
//! A data source owns the paired input rings (byte-granular data arena,
//! typed descriptor arena) and fills them continuously; the sender reads
//! them and releases space back through the acknowledgement pointers.
//! Implementations are interchangeable behind [`DataSource`]; the one
//! shipped here is the synthetic pattern generator used for commissioning
//! and tests.

use crate::params::Parameters;
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tsipc::desc::MicrosliceDescriptor;
use wrapring::RingBuffer;

/// Capability set of a data source.
///
/// The sender holds a handle to this capability, not to a concrete
/// implementation.
pub trait DataSource: Send + Sync {
    /// The data arena (bytes), written by the source.
    fn data_buffer(&self) -> &RingBuffer<u8>;

    /// The descriptor arena, written by the source in index order.
    fn desc_buffer(&self) -> &RingBuffer<MicrosliceDescriptor>;

    /// Blocks until at least `min_desc_index` descriptors exist; returns
    /// the current written descriptor count.
    fn wait_for_data(&self, min_desc_index: u64) -> u64;

    /// Releases consumed space back to the source (non-blocking).
    fn update_ack_pointers(&self, acked_data: u64, acked_desc: u64);
}

/// Computes the deterministic pattern word at `byte_offset` within a
/// microslice of input `input_index`.
pub fn pattern_word(input_index: u64, byte_offset: u64) -> u64 {
    (input_index << 48) | byte_offset
}

/// Fills `content` with the deterministic pattern of `input_index`.
pub fn fill_pattern(content: &mut [u8], input_index: u64) {
    let mut offset = 0usize;
    while offset < content.len() {
        let word = pattern_word(input_index, offset as u64).to_le_bytes();
        let n = word.len().min(content.len() - offset);
        content[offset..offset + n].copy_from_slice(&word[..n]);
        offset += n;
    }
}

struct Cursors {
    written_data: u64,
    written_desc: u64,
    acked_data: u64,
    acked_desc: u64,
}

/// Synthetic data source generating patterned microslices.
///
/// A producer thread fills the rings as long as space is available and
/// publishes its cursors in batches; backpressure parks it on a condition
/// variable until the sender acknowledges.
pub struct PatternGenerator {
    data_buffer: RingBuffer<u8>,
    desc_buffer: RingBuffer<MicrosliceDescriptor>,
    input_index: u64,
    cursors: Mutex<Cursors>,
    cond_producer: Condvar,
    cond_consumer: Condvar,
    stopped: AtomicBool,
}

impl PatternGenerator {
    /// Creates the generator and starts its producer thread.
    pub fn start(
        params: &Parameters,
        input_index: u64,
    ) -> Result<(Arc<Self>, thread::JoinHandle<()>), wrapring::RingError> {
        let generator = Arc::new(Self {
            data_buffer: RingBuffer::new(params.in_data_buffer_size_exp)?,
            desc_buffer: RingBuffer::new(params.in_desc_buffer_size_exp)?,
            input_index,
            cursors: Mutex::new(Cursors {
                written_data: 0,
                written_desc: 0,
                acked_data: 0,
                acked_desc: 0,
            }),
            cond_producer: Condvar::new(),
            cond_consumer: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let producer = Arc::clone(&generator);
        let typical = params.typical_content_size;
        let randomize = params.randomize_sizes;
        let handle = thread::Builder::new()
            .name(format!("pattern_gen_{input_index}"))
            .spawn(move || producer.produce_data(typical, randomize))
            .expect("spawning pattern generator thread");
        Ok((generator, handle))
    }

    /// Asks the producer thread to exit and wakes it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cond_producer.notify_all();
        self.cond_consumer.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The producer loop.
    fn produce_data(&self, typical_content_size: u32, randomize_sizes: bool) {
        let mut rng = SmallRng::seed_from_u64(self.input_index);

        let data_bytes = self.data_buffer.bytes() as u64;
        let desc_entries = self.desc_buffer.size() as u64;
        // keep a quarter of each ring free before parking, and publish in
        // quarter-ring batches to bound cursor traffic
        let min_avail_data = data_bytes / 4;
        let min_avail_desc = desc_entries / 4;
        let min_publish_data = data_bytes / 4;
        let min_publish_desc = desc_entries / 4;

        let mut written_data: u64 = 0;
        let mut written_desc: u64 = 0;
        let mut last_published_data: u64 = 0;
        let mut last_published_desc: u64 = 0;

        loop {
            let (acked_data, acked_desc) = {
                let mut cursors = self.cursors.lock().unwrap();
                cursors.written_data = written_data;
                cursors.written_desc = written_desc;
                self.cond_consumer.notify_all();
                while (written_data - cursors.acked_data + min_avail_data > data_bytes)
                    || (written_desc - cursors.acked_desc + min_avail_desc > desc_entries)
                {
                    if self.is_stopped() {
                        return;
                    }
                    cursors = self.cond_producer.wait(cursors).unwrap();
                }
                if self.is_stopped() {
                    return;
                }
                (cursors.acked_data, cursors.acked_desc)
            };

            loop {
                let content_bytes = if randomize_sizes {
                    // 8-byte aligned, uniform around the typical size
                    (rng.gen_range(0..=2 * u64::from(typical_content_size)) + 7) & !7
                } else {
                    u64::from(typical_content_size)
                };

                if written_data - acked_data + content_bytes > data_bytes
                    || written_desc - acked_desc + 1 > desc_entries
                {
                    break;
                }

                let offset = written_data;
                let mut crc_hasher = crc32fast::Hasher::new();
                let mut remaining = content_bytes;
                let mut pos = offset;
                while remaining > 0 {
                    let word =
                        pattern_word(self.input_index, pos - offset).to_le_bytes();
                    let n = (word.len() as u64).min(remaining) as usize;
                    self.data_buffer.copy_in_wrapping(pos, &word[..n]);
                    crc_hasher.update(&word[..n]);
                    pos += n as u64;
                    remaining -= n as u64;
                }
                written_data += content_bytes;

                self.desc_buffer.write_at(
                    written_desc,
                    MicrosliceDescriptor {
                        hdr_id: 0xdd,
                        hdr_ver: 0x01,
                        eq_id: 0x1001,
                        flags: 0x0000,
                        sys_id: 0x01,
                        sys_ver: 0x01,
                        idx: written_desc,
                        crc: crc_hasher.finalize(),
                        size: content_bytes as u32,
                        offset,
                    },
                );
                written_desc += 1;

                if written_desc >= last_published_desc + min_publish_desc
                    || written_data >= last_published_data + min_publish_data
                {
                    last_published_desc = written_desc;
                    last_published_data = written_data;
                    let mut cursors = self.cursors.lock().unwrap();
                    cursors.written_data = written_data;
                    cursors.written_desc = written_desc;
                    drop(cursors);
                    self.cond_consumer.notify_all();
                }
            }
        }
    }
}

impl DataSource for PatternGenerator {
    fn data_buffer(&self) -> &RingBuffer<u8> {
        &self.data_buffer
    }

    fn desc_buffer(&self) -> &RingBuffer<MicrosliceDescriptor> {
        &self.desc_buffer
    }

    fn wait_for_data(&self, min_desc_index: u64) -> u64 {
        let mut cursors = self.cursors.lock().unwrap();
        while cursors.written_desc < min_desc_index && !self.is_stopped() {
            cursors = self.cond_consumer.wait(cursors).unwrap();
        }
        cursors.written_desc
    }

    fn update_ack_pointers(&self, acked_data: u64, acked_desc: u64) {
        {
            let mut cursors = self.cursors.lock().unwrap();
            cursors.acked_data = acked_data;
            cursors.acked_desc = acked_desc;
        }
        self.cond_producer.notify_all();
        debug!(
            "[i{}] source acks advanced: data={acked_data} desc={acked_desc}",
            self.input_index
        );
    }
}
