//! Stream orchestration for mediarelay
//!
//! - [`orchestrator`]: lineage registration, playback, relaying and deletion
//! - [`process`]: relay process control
//! - [`remote`]: calls to other servers over the broker
//! - [`consumer`]: answers calls from other servers

pub mod consumer;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod remote;
pub mod status;

pub use consumer::DownstreamConsumer;
pub use error::{RelayError, RelayResult};
pub use orchestrator::{
    DeleteOutcome, OrchestratorSettings, PlaybackAnswer, PlaybackKind, PlaybackPlan,
    StreamOrchestrator,
};
pub use process::{ProcessController, ProcessHandle, RelayProcessManager};
pub use remote::RemoteStreams;
pub use status::{StatusProvider, StoreStatusProvider};
