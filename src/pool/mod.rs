//! Bounded concurrent task execution
//!
//! Subscribers hand every inbound payload to a [`WorkerPool`] so slow socket
//! writes on one session cannot stall the broker consumer. Delivery work is
//! wrapped in a [`RetryPolicy`].

pub mod retry;
pub mod task;
pub mod worker;

pub use retry::RetryPolicy;
pub use task::{Task, TaskHandle};
pub use worker::{PoolOptions, WorkerPool};
