//! # Queue Client
//!
//! Provider-agnostic publish/subscribe with explicit acknowledgement.
//!
//! ## Architecture
//!
//! ```text
//! MessagingProvider (enum)      <- dispatch, no vtable
//!   ├── Nsq(NsqMessagingService)
//!   └── InMemory(InMemoryMessagingService)
//!
//! Subscription ──recv()──▶ QueueDelivery ──finish() / requeue(delay)──▶ Acknowledger
//! ```
//!
//! ## Delivery contract
//!
//! - Every delivery is resolved at most once: the first `finish`/`requeue`
//!   wins, later calls fail with [`MessagingError::DeliveryAlreadyResolved`].
//! - Unresolved deliveries come back after the broker's in-flight timeout.
//! - Payloads are JSON through the [`QueueMessage`] blanket impl; decode
//!   failures surface as [`MessagingError::MalformedPayload`] and go through
//!   the [`DeadLetterPolicy`].

pub mod dead_letter;
pub mod errors;
mod provider;
pub mod providers;
mod traits;
mod types;

pub use dead_letter::{DeadLetterOutcome, DeadLetterPolicy};
pub use errors::{MessagingError, MessagingResult};
pub use provider::MessagingProvider;
pub use providers::{InMemoryConfig, InMemoryMessagingService, NsqConfig, NsqMessagingService};
pub use traits::{MessagingService, QueueMessage};
pub use types::{
    Acknowledger, ChannelStats, DeliveryState, MessageId, QueueDelivery, Subscription,
};
