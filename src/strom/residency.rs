//! Page-cache residency probe.

use crate::utils::{align_down, align_up, host_page_size};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

/// Whether every page of `[offset, offset + len)` of `file` is in the page cache.
///
/// Ranges reaching past end of file are reported as not resident.
pub fn is_resident(file: &File, offset: u64, len: u64) -> io::Result<bool> {
    let size = file.metadata()?.len();
    if len == 0 || offset.saturating_add(len) > size {
        return Ok(false);
    }

    let page = host_page_size() as u64;
    let start = align_down(offset, page);
    let map_len = (align_up(offset + len, page) - start) as usize;
    let Ok(map_off) = libc::off_t::try_from(start) else {
        return Ok(false);
    };

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            map_len,
            libc::PROT_READ,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            map_off,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    let mut vec = vec![0u8; map_len.div_ceil(page as usize)];
    let ret = unsafe { libc::mincore(addr, map_len, vec.as_mut_ptr()) };
    let err = io::Error::last_os_error();
    unsafe {
        libc::munmap(addr, map_len);
    }
    if ret != 0 {
        return Err(err);
    }
    Ok(vec.iter().all(|v| v & 1 != 0))
}
