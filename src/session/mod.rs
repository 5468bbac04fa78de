//! Live sessions on this node
//!
//! The registry is an explicit object shared by the gateway (which adds and
//! removes sessions) and the fanout subscribers (which deliver to them).
//!
//! ```text
//!   broker ──► subscriber ──► pool task ──► registry.broadcast_filter(pred)
//!                                                   │
//!                                  ┌────────────────┼────────────────┐
//!                                  ▼                ▼                ▼
//!                              session tx       session tx       session tx
//!                                  │                │                │
//!                                  ▼                ▼                ▼
//!                              WebSocket        WebSocket        WebSocket
//! ```

pub mod context;
pub mod registry;

pub use context::{SessionAttrs, SessionKind};
pub use registry::{SessionHandle, SessionRegistry};
