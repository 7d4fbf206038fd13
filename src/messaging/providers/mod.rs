//! Concrete [`MessagingService`](super::MessagingService) implementations.

pub mod in_memory;
pub mod nsq;

pub use in_memory::{InMemoryConfig, InMemoryMessagingService};
pub use nsq::{NsqConfig, NsqMessagingService};
