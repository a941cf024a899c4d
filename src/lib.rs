// Configuration documents and typed patches
pub mod model;

// Control-plane envelopes and fan-out message encoding
pub mod event;

// Pub/sub transport (NATS, in-process)
pub mod transport;

// Configuration document storage
pub mod storage;

// Credit-based fan-out queue (Redis, in-process)
pub mod backpressure;

// Service configuration
pub mod config;

pub use event::{ConnectionState, StreamEventType, StreamRef};
pub use model::{ConfigKind, Configuration, DeepConfig};
