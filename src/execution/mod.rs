//! # Execution
//!
//! Everything on the dispatcher side of the pipeline.
//!
//! - [`worker_pool`]: arena of connected units with Free/Busy membership
//! - [`dispatcher`]: the actor that assigns jobs, arms timers and reconciles
//!   completions, timeouts and disconnects with queue acknowledgement
//! - [`transport`]: `process` / `complete` frames exchanged with units
//! - [`server`]: axum WebSocket endpoint units connect to
//! - [`fetch`], [`storage`]: source download and result upload

pub mod dispatcher;
pub mod fetch;
pub mod server;
pub mod storage;
pub mod transport;
pub mod worker_pool;

pub use dispatcher::{
    DisconnectReason, DispatcherCommand, DispatcherConfig, DispatcherError, DispatcherHandle,
    WorkerPoolDispatcher,
};
pub use fetch::{FetchError, FetchedImage, HttpImageFetcher, ImageFetcher, InMemoryImageFetcher};
pub use storage::{
    object_key, BlobStore, InMemoryBlobStore, PutObjectRequest, S3BlobStore, StorageError,
};
pub use transport::{ProcessTask, ProtocolError, UnitMessage};
pub use worker_pool::{
    AssignmentId, AssignmentPhase, AssignmentRecord, ConnectionId, PoolSnapshot, UnitSnapshot,
    WorkerPool, WorkerPoolError,
};
