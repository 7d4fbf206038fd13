//! # Events
//!
//! Typed pipeline payloads and the [`EventBus`] that publishes them and
//! re-emits incoming deliveries to in-process listeners.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventHandler};
pub use types::{decode_event, EventPayload, EventType, ResizeJob, UploadedImageEvent};
