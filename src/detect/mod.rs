mod backend;
mod backends;
mod pool;
mod registry;
mod result;
pub mod yolo;

pub use backend::DetectorBackend;
pub use backends::{MotionBackend, MotionMemory, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use pool::{DetectionPool, PoolConfig, PoolStats, ResultHandler, SubmitOutcome};
pub use registry::{BackendFactory, BackendRegistry, DetectorSettings};
pub use result::{BoundingBox, Detection, DetectionResult};
