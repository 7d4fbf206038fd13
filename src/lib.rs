#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # rszr
//!
//! Queue-driven image resize pipeline.
//!
//! ## Overview
//!
//! An upload notification (`image-uploaded`) is fanned out into one resize job
//! per configured preset (`image-resize`). A dispatcher hands each job to one
//! of a pool of remote resize units connected over WebSockets, uploads the
//! unit's result to object storage and acknowledges the job. Stalled, failed
//! or orphaned work goes back to the broker with a fixed delay.
//!
//! ```text
//! ingress ──image-uploaded──▶ FanOutOrchestrator ──image-resize × N──▶ WorkerPoolDispatcher
//!                                                                         │   ▲
//!                                                               process   │   │ complete
//!                                                                         ▼   │
//!                                                                      remote units
//! ```
//!
//! ## Module Organization
//!
//! - [`messaging`] - Queue client: NSQ and in-memory providers, deliveries with finish/requeue
//! - [`events`] - Typed payloads and the [`events::EventBus`] façade
//! - [`orchestration`] - Preset catalog, target naming and the fan-out orchestrator
//! - [`execution`] - Worker pool, dispatcher actor, unit transport and external collaborators
//! - [`config`] - Layered configuration loading
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate-level error type

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod test_utils;

pub use config::RszrConfig;
pub use error::{Result, RszrError};
pub use events::{EventBus, EventType, ResizeJob, UploadedImageEvent};
pub use execution::{DispatcherHandle, WorkerPoolDispatcher};
pub use messaging::{MessagingError, MessagingProvider, MessagingService, QueueDelivery};
pub use orchestration::{FanOutOrchestrator, PresetCatalog, ResizePreset};
