//! Task domain — lifecycle state machine and snapshots.

pub mod model;

pub use model::{StatusBucket, Task, TaskState};
