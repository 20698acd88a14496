#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

use std::sync::OnceLock;

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_NONE: u32 = 0;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

/// Equivalent of the C `_IO(type, nr)` macro. The control surface encodes
/// every command without a direction or size.
#[must_use]
pub const fn io(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_NONE, type_, nr, 0)
}

/// Free-running cycle counter used by the statistics aggregator.
///
/// Reads the TSC on x86; elsewhere falls back to monotonic nanoseconds since
/// the first call.
#[inline]
#[must_use]
pub fn cycles() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc has no memory side effects.
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
        EPOCH.get_or_init(std::time::Instant::now).elapsed().as_nanos() as u64
    }
}

/// Round `val` up to a multiple of `align` (power of two).
#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// Round `val` down to a multiple of `align` (power of two).
#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

/// System page size, cached after the first query.
#[must_use]
pub fn host_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 { sz as usize } else { 4096 }
    })
}
