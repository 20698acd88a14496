//! Direct storage-to-accelerator transfer engine.
//!
//! A userspace take on NVMe-Strom: registers accelerator memory ranges, routes
//! file chunks either straight into them or through a host writeback buffer,
//! and runs the transfers asynchronously behind a submit/wait interface.

pub mod config;
pub mod error;
pub mod kmod;
pub mod strom;
pub mod utils;

pub use config::StromConfig;
pub use error::{StromError, StromResult};
pub use strom::{Engine, Session};
