//! The OS binding surface consumed by the shared-memory transport: named shared
//!  regions, named auto-reset signals, and a named rendezvous mutex.
//!
//! The protocol layer only ever talks to these traits. [InProcessNamespace] is the
//!  implementation used by tests and single-process deployments; [MmapRegion] maps a
//!  file-backed region for cross-process sharing. Bindings to OS named-event system
//!  calls plug in behind the same traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelResult};

/// One named region of shared bytes. Offset arithmetic happens in the typed
///  [crate::shmem::layout::RegionView] on top of this; implementations only
///  bounds-check.
pub trait SharedRegion: Send + Sync {
    fn len(&self) -> usize;

    fn read(&self, offset: usize, dst: &mut [u8]) -> ChannelResult<()>;

    fn write(&self, offset: usize, src: &[u8]) -> ChannelResult<()>;
}

/// A named cross-process binary signal with auto-reset semantics: `set` wakes one
///  waiter (or is remembered until the next `wait`), `wait` consumes the signal.
#[async_trait]
pub trait NamedSignal: Send + Sync {
    async fn wait(&self, deadline: Deadline) -> ChannelResult<()>;

    fn set(&self);
}

/// The mutex serializing client rendezvous during connection establishment.
#[async_trait]
pub trait RendezvousMutex: Send + Sync {
    async fn lock(&self, deadline: Deadline) -> ChannelResult<RendezvousGuard>;
}

/// Type-erased guard; dropping it releases the mutex.
pub struct RendezvousGuard {
    _held: Box<dyn Send + Sync>,
}

/// Factory for the named primitives, scoped to one naming domain. Passed in
///  explicitly wherever the transport needs it - no process-wide registry.
pub trait IpcNamespace: Send + Sync + 'static {
    fn create_region(&self, name: &str, size: usize) -> ChannelResult<Arc<dyn SharedRegion>>;

    fn open_region(&self, name: &str) -> ChannelResult<Arc<dyn SharedRegion>>;

    /// Signals are get-or-create: both sides resolve the same name to the same signal.
    fn signal(&self, name: &str) -> ChannelResult<Arc<dyn NamedSignal>>;

    fn rendezvous_mutex(&self, name: &str) -> ChannelResult<Arc<dyn RendezvousMutex>>;

    /// Release every named object whose name starts with `prefix`.
    fn remove_prefix(&self, prefix: &str);
}

// ---------------------------------------------------------------------------
// in-process implementation
// ---------------------------------------------------------------------------

struct InProcessRegion {
    bytes: Mutex<Box<[u8]>>,
}

impl SharedRegion for InProcessRegion {
    fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> ChannelResult<()> {
        let bytes = self.bytes.lock().unwrap();
        let end = offset.checked_add(dst.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| ChannelError::logic("region read out of bounds"))?;
        dst.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> ChannelResult<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let end = offset.checked_add(src.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| ChannelError::logic("region write out of bounds"))?;
        bytes[offset..end].copy_from_slice(src);
        Ok(())
    }
}

struct InProcessSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl InProcessSignal {
    fn new() -> InProcessSignal {
        InProcessSignal {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl NamedSignal for InProcessSignal {
    async fn wait(&self, deadline: Deadline) -> ChannelResult<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.flag.swap(false, Ordering::AcqRel) {
                return Ok(());
            }

            deadline
                .run("wait for named signal", async {
                    notified.await;
                    Ok(())
                })
                .await?;
        }
    }

    fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct InProcessMutex {
    inner: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl RendezvousMutex for InProcessMutex {
    async fn lock(&self, deadline: Deadline) -> ChannelResult<RendezvousGuard> {
        let inner = self.inner.clone();
        let guard = deadline
            .run("acquire rendezvous mutex", async {
                Ok(inner.lock_owned().await)
            })
            .await?;
        Ok(RendezvousGuard {
            _held: Box::new(guard),
        })
    }
}

/// Registry-backed namespace for a single process: tests, and deployments where both
///  endpoints live in one process.
#[derive(Default)]
pub struct InProcessNamespace {
    regions: Mutex<FxHashMap<String, Arc<InProcessRegion>>>,
    signals: Mutex<FxHashMap<String, Arc<InProcessSignal>>>,
    mutexes: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InProcessNamespace {
    pub fn new() -> Arc<InProcessNamespace> {
        Arc::new(InProcessNamespace::default())
    }
}

impl IpcNamespace for InProcessNamespace {
    fn create_region(&self, name: &str, size: usize) -> ChannelResult<Arc<dyn SharedRegion>> {
        let mut regions = self.regions.lock().unwrap();
        if regions.contains_key(name) {
            return Err(ChannelError::LogicError {
                detail: format!("shared region '{}' already exists", name),
            });
        }
        let region = Arc::new(InProcessRegion {
            bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
        });
        regions.insert(name.to_string(), region.clone());
        Ok(region)
    }

    fn open_region(&self, name: &str) -> ChannelResult<Arc<dyn SharedRegion>> {
        self.regions
            .lock().unwrap()
            .get(name)
            .map(|r| r.clone() as Arc<dyn SharedRegion>)
            .ok_or_else(|| ChannelError::DestinationUnreachable {
                host: name.to_string(),
                detail: format!("no shared region named '{}'", name),
            })
    }

    fn signal(&self, name: &str) -> ChannelResult<Arc<dyn NamedSignal>> {
        let mut signals = self.signals.lock().unwrap();
        let signal = signals
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InProcessSignal::new()))
            .clone();
        Ok(signal)
    }

    fn rendezvous_mutex(&self, name: &str) -> ChannelResult<Arc<dyn RendezvousMutex>> {
        let mut mutexes = self.mutexes.lock().unwrap();
        let inner = mutexes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Ok(Arc::new(InProcessMutex { inner }))
    }

    fn remove_prefix(&self, prefix: &str) {
        self.regions.lock().unwrap().retain(|name, _| !name.starts_with(prefix));
        self.signals.lock().unwrap().retain(|name, _| !name.starts_with(prefix));
        self.mutexes.lock().unwrap().retain(|name, _| !name.starts_with(prefix));
    }
}

// ---------------------------------------------------------------------------
// file-backed mmap region (unix)
// ---------------------------------------------------------------------------

/// A region mapped from a file so two processes can share it. Signals still come
///  from the namespace; only the byte storage is cross-process here.
#[cfg(unix)]
pub struct MmapRegion {
    base: *mut u8,
    len: usize,
}

#[cfg(unix)]
unsafe impl Send for MmapRegion {}
#[cfg(unix)]
unsafe impl Sync for MmapRegion {}

#[cfg(unix)]
impl MmapRegion {
    /// Map `path`, creating and sizing the file first if `create` is set; otherwise
    ///  the file must already exist with at least `len` bytes.
    pub fn map_file(path: &std::path::Path, len: usize, create: bool) -> ChannelResult<MmapRegion> {
        use std::os::unix::io::AsRawFd;

        let io_err = |e: std::io::Error| ChannelError::from_io("map shared region", e);

        let file = if create {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(io_err)?;
            file.set_len(len as u64).map_err(io_err)?;
            file
        }
        else {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(io_err)?;
            let meta = file.metadata().map_err(io_err)?;
            if (meta.len() as usize) < len {
                return Err(ChannelError::IncorrectData {
                    detail: format!(
                        "shared region file is {} bytes, expected at least {}",
                        meta.len(),
                        len
                    ),
                });
            }
            file
        };

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ChannelError::from_io(
                "map shared region",
                std::io::Error::last_os_error(),
            ));
        }

        Ok(MmapRegion {
            base: ptr as *mut u8,
            len,
        })
    }
}

#[cfg(unix)]
impl SharedRegion for MmapRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> ChannelResult<()> {
        if offset.checked_add(dst.len()).map_or(true, |end| end > self.len) {
            return Err(ChannelError::logic("region read out of bounds"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> ChannelResult<()> {
        if offset.checked_add(src.len()).map_or(true, |end| end > self.len) {
            return Err(ChannelError::logic("region write out of bounds"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len());
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
