pub mod camera;
pub mod pagination;
pub mod server;
pub mod stream;

pub use camera::Camera;
pub use pagination::{Page, PageParams};
pub use server::{derive_stream_id, downstream_topic, ServerRole};
pub use stream::{
    HopState, RegisterDraft, RegisteredLineage, StreamKind, StreamRecord, StreamStatus,
    StreamTelemetry, StreamType, StreamView,
};
