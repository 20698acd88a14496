pub mod accel;
pub mod buffer;
pub mod context;
pub mod control;
pub mod descriptor;
pub mod orchestrator;
pub mod region;
pub mod residency;
pub mod stats;
pub mod task;
pub mod topology;

// Re-export the entry points for easy access
pub use accel::{AcceleratorMemory, SimulatedAccelerator};
pub use context::{Engine, Session, acquire, release};
pub use control::{Request, Response};
pub use orchestrator::{DirectRequest, DirectSubmitted, HostRequest, HostSubmitted};
pub use task::{FailedStage, TaskId, TaskStatus};
