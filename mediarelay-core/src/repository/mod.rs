pub mod camera;
pub mod memory;
pub mod stream;

pub use camera::{CameraDirectory, PgCameraRepository};
pub use memory::{MemoryCameraDirectory, MemoryStreamStore};
pub use stream::{PgStreamStore, StreamFilter, StreamStore};
