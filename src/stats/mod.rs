//! Runtime statistics

pub mod metrics;

pub use metrics::{DeliverySnapshot, DeliveryStats};
