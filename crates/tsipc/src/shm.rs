//! Named POSIX shared-memory regions.
//!
//! A compute node creates its arenas as named segments so that worker
//! processes can map them read-only by identifier; the record queues of
//! [`crate::queue`] live in segments of their own. The creator owns the
//! name and unlinks it on drop; attachers only unmap.

use std::ffi::CString;
use std::io;
use thiserror::Error;

/// Error type for shared-memory operations.
#[derive(Debug, Error)]
pub enum ShmError {
    /// A system call failed.
    #[error("shared memory {op} failed for {name}: {source}")]
    Sys {
        /// The failing operation.
        op: &'static str,
        /// The segment name.
        name: String,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The segment name contains an interior NUL byte.
    #[error("invalid shared memory name {0:?}")]
    InvalidName(String),
}

fn sys_err(op: &'static str, name: &str) -> ShmError {
    ShmError::Sys {
        op,
        name: name.to_owned(),
        source: io::Error::last_os_error(),
    }
}

/// A named, memory-mapped shared-memory region.
pub struct SharedRegion {
    name: String,
    ptr: *mut u8,
    len: usize,
    owner: bool,
}

// SAFETY: the mapping is process-wide; access discipline is carried by the
// structures placed inside the region.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates a new named region of `len` bytes, failing if it exists.
    ///
    /// The returned handle owns the name and unlinks it on drop.
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        Self::acquire(name, len, true)
    }

    /// Opens an existing named region created by another process.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let c_name = Self::c_name(name)?;
        // SAFETY: plain POSIX calls with a valid C string.
        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0);
            if fd < 0 {
                return Err(sys_err("shm_open", name));
            }
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = sys_err("fstat", name);
                libc::close(fd);
                return Err(err);
            }
            let len = stat.st_size as usize;
            let ptr = Self::map(fd, len, name)?;
            libc::close(fd);
            Ok(Self {
                name: name.to_owned(),
                ptr,
                len,
                owner: false,
            })
        }
    }

    fn acquire(name: &str, len: usize, owner: bool) -> Result<Self, ShmError> {
        let c_name = Self::c_name(name)?;
        // SAFETY: plain POSIX calls with a valid C string.
        unsafe {
            let fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            );
            if fd < 0 {
                return Err(sys_err("shm_open", name));
            }
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                let err = sys_err("ftruncate", name);
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(err);
            }
            let ptr = match Self::map(fd, len, name) {
                Ok(ptr) => ptr,
                Err(err) => {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                    return Err(err);
                }
            };
            libc::close(fd);
            Ok(Self {
                name: name.to_owned(),
                ptr,
                len,
                owner,
            })
        }
    }

    unsafe fn map(fd: libc::c_int, len: usize, name: &str) -> Result<*mut u8, ShmError> {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(sys_err("mmap", name));
        }
        Ok(ptr.cast::<u8>())
    }

    fn c_name(name: &str) -> Result<CString, ShmError> {
        // POSIX shared memory names carry a single leading slash.
        let full = format!("/{name}");
        CString::new(full).map_err(|_| ShmError::InvalidName(name.to_owned()))
    }

    /// The logical segment name (without the leading slash).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mutable base pointer of the mapping.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if this handle owns (and will unlink) the name.
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap above.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
        if self.owner {
            if let Ok(c_name) = Self::c_name(&self.name) {
                // SAFETY: unlinking a name we created.
                unsafe {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}
