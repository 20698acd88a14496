pub mod ioctl;
pub mod sysfs;
