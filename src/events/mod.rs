//! Event system — lifecycle events, filters, and the replayable bus.

pub mod bus;
pub mod model;

pub use bus::{EventBus, Subscription};
pub use model::{AgentSnapshot, Event, EventFilter, EventKind, EventPayload};
