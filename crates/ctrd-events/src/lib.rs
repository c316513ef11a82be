//! Event sink for ctrd.
//!
//! Stores publish lifecycle notifications (namespace, content and snapshot
//! changes, GC completion) into an [`Exchange`], which fans them out to
//! subscribers over `tokio` broadcast channels. Delivery is best-effort and
//! never tied to the success of the store mutation that produced the event.

pub mod error;
pub mod event;
pub mod exchange;

pub use error::{EventError, Result};
pub use event::{Envelope, Event};
pub use exchange::{EventFilter, EventStream, Exchange, NoopPublisher, Publisher};
