use crate::error::{StromError, StromResult};
use crate::kmod::sysfs;
use crate::utils::{align_up, host_page_size};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const MPOL_BIND: libc::c_int = 2;

/// A host buffer backed by an anonymous shared-memory file, bound to a NUMA
/// node. The file descriptor is the transferable handle: the caller maps it
/// to see the same pages the engine fills.
#[derive(Debug)]
pub struct DmaBuffer {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    map_len: usize,
    node: i32,
    leased: AtomicBool,
}

// The mapping is plain shared memory reached only through raw, bounds-checked
// copies. Engine writes come from the single task holding the lease.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    fn create(len: usize, node: i32) -> StromResult<Self> {
        let map_len = align_up(len as u64, host_page_size() as u64) as usize;

        let raw = unsafe { libc::memfd_create(c"strom-dmabuf".as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let Ok(size) = libc::off_t::try_from(map_len) else {
            return Err(StromError::OutOfMemory);
        };
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
            return Err(map_alloc_error(io::Error::last_os_error()));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(map_alloc_error(io::Error::last_os_error()));
        }
        let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
            return Err(StromError::OutOfMemory);
        };

        let buf = Self {
            fd,
            ptr,
            len,
            map_len,
            node,
            leased: AtomicBool::new(false),
        };
        if let Ok(node) = u32::try_from(node)
            && let Err(e) = buf.bind(node)
        {
            // Placement is a hint; the memory stays usable on any node.
            tracing::warn!(node, error = %e, "mbind failed, buffer left unbound");
        }
        Ok(buf)
    }

    fn bind(&self, node: u32) -> io::Result<()> {
        let words = node as usize / 64 + 1;
        let mut mask = vec![0u64; words];
        mask[node as usize / 64] |= 1 << (node % 64);
        let maxnode = (words * 64 + 1) as libc::c_ulong;

        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                self.ptr.as_ptr().cast::<libc::c_void>(),
                self.map_len,
                MPOL_BIND,
                mask.as_ptr(),
                maxnode,
                0 as libc::c_uint,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Requested node, or `-1` for no binding.
    #[must_use]
    pub const fn node(&self) -> i32 {
        self.node
    }

    fn check(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside DMA buffer",
            )),
        }
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read_at(&self, offset: usize, len: usize) -> io::Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Read `len` bytes of `file` at `file_offset` straight into the buffer.
    /// Returns the number of bytes read; less than `len` means end of file.
    pub(crate) fn fill_from(
        &self,
        file: &File,
        file_offset: u64,
        offset: usize,
        len: usize,
    ) -> io::Result<usize> {
        self.check(offset, len)?;
        let mut done = 0;
        while done < len {
            let Ok(pos) = libc::off_t::try_from(file_offset + done as u64) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "file offset out of range",
                ));
            };
            let ret = unsafe {
                libc::pread(
                    file.as_raw_fd(),
                    self.ptr.as_ptr().add(offset + done).cast::<libc::c_void>(),
                    len - done,
                    pos,
                )
            };
            match ret {
                0 => break,
                n if n > 0 => done += n as usize,
                _ => {
                    let e = io::Error::last_os_error();
                    if e.kind() != io::ErrorKind::Interrupted {
                        return Err(e);
                    }
                }
            }
        }
        Ok(done)
    }
}

/// Exclusive use of a buffer by one outstanding task.
#[derive(Debug)]
pub struct BufferLease {
    buffer: Arc<DmaBuffer>,
}

impl BufferLease {
    #[must_use]
    pub const fn buffer(&self) -> &Arc<DmaBuffer> {
        &self.buffer
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.buffer.leased.store(false, Ordering::Release);
    }
}

impl AsFd for DmaBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.map_len);
        }
    }
}

fn map_alloc_error(e: io::Error) -> StromError {
    match e.raw_os_error() {
        Some(libc::ENOMEM | libc::ENOSPC | libc::EFBIG) => StromError::OutOfMemory,
        _ => e.into(),
    }
}

#[derive(Debug)]
struct BufferEntry {
    owner: u32,
    buffer: Arc<DmaBuffer>,
}

/// Hands out NUMA-bound host buffers and tracks them by handle.
#[derive(Debug)]
pub struct BufferAllocator {
    sysfs_root: PathBuf,
    max_bytes: usize,
    next_handle: AtomicU64,
    buffers: Mutex<HashMap<u64, BufferEntry>>,
}

impl BufferAllocator {
    #[must_use]
    pub fn new(sysfs_root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            max_bytes,
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, BufferEntry>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `len` bytes bound to `node` (`-1`: no binding).
    ///
    /// # Errors
    /// `InvalidArgument` for a zero length, `OutOfMemory` above the configured
    /// ceiling or when the kernel refuses, `InvalidNode` for an unknown node.
    pub fn allocate(
        &self,
        len: usize,
        node: i32,
        owner: u32,
    ) -> StromResult<(u64, Arc<DmaBuffer>)> {
        if len == 0 {
            return Err(StromError::InvalidArgument("zero length DMA buffer".into()));
        }
        if len > self.max_bytes {
            return Err(StromError::OutOfMemory);
        }
        if node < -1 {
            return Err(StromError::InvalidNode(node));
        }
        if let Ok(n) = u32::try_from(node)
            && !sysfs::numa_node_exists(&self.sysfs_root, n)
        {
            return Err(StromError::InvalidNode(node));
        }

        let buffer = Arc::new(DmaBuffer::create(len, node)?);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            handle,
            BufferEntry {
                owner,
                buffer: Arc::clone(&buffer),
            },
        );
        tracing::debug!(handle, len, node, "allocated DMA buffer");
        Ok((handle, buffer))
    }

    /// Release a buffer. In-flight tasks holding it keep the memory alive.
    ///
    /// # Errors
    /// `UnknownHandle` (including on a second release) or `PermissionDenied`.
    pub fn release(&self, handle: u64, caller: u32) -> StromResult<()> {
        let mut buffers = self.lock();
        let entry = buffers
            .get(&handle)
            .ok_or(StromError::UnknownHandle(handle))?;
        if caller != 0 && caller != entry.owner {
            return Err(StromError::PermissionDenied);
        }
        buffers.remove(&handle);
        drop(buffers);
        tracing::debug!(handle, "released DMA buffer");
        Ok(())
    }

    /// Look up a live buffer.
    ///
    /// # Errors
    /// `UnknownHandle` or `PermissionDenied`.
    pub fn get(&self, handle: u64, caller: u32) -> StromResult<Arc<DmaBuffer>> {
        let buffers = self.lock();
        let entry = buffers
            .get(&handle)
            .ok_or(StromError::UnknownHandle(handle))?;
        if caller != 0 && caller != entry.owner {
            return Err(StromError::PermissionDenied);
        }
        Ok(Arc::clone(&entry.buffer))
    }

    /// Reserve a buffer as the target of one task.
    ///
    /// # Errors
    /// `UnknownHandle`, `PermissionDenied`, or `BufferBusy` while another
    /// outstanding task holds it.
    pub fn lease(&self, handle: u64, caller: u32) -> StromResult<BufferLease> {
        let buffer = self.get(handle, caller)?;
        if buffer
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StromError::BufferBusy(handle));
        }
        Ok(BufferLease { buffer })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
