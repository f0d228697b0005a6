//! Data structures for durable orchestration.
//!
//! Everything an instance *is* lives here: the history events that record
//! what happened to it, the instance state derived from them, the failure
//! taxonomy, and the video pipeline value types.

pub mod failure;
pub mod history;
pub mod instance;
pub mod video;

pub use failure::{FailureCategory, TaskError, WorkflowFailure};
pub use history::{EventKind, HistoryEvent, ParentLink};
pub use instance::{Instance, InstanceStatus};
pub use video::{PipelineLocations, PipelineResult, TranscodeRequest, VideoFileInfo};
