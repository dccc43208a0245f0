//! # Signaling core
//!
//! The signaling service behind the polling protocol: per-channel
//! sequenced command queues, the call and call-forward state machines, the
//! inbound command dispatcher, and the HTTP surface that the (external)
//! boundary layer talks to.
//!
//! - **channel**: channel registration and the sequenced command queue;
//!   the poll/acknowledge protocol lives here
//! - **call**: dial/accept/terminate/mute state machine and its fan-out
//! - **forward**: operator-mediated three-way transfer orchestration
//! - **dispatch**: closed command-method table and policy enforcement
//! - **notify**: push-notification collaborator seam
//! - **server**: configuration, service wiring and the axum routes
//!
//! Ordering is guaranteed per channel only. Every mutating operation takes
//! the owning entity's lock before validating, so losing concurrent
//! requests observe final state and fail cleanly instead of corrupting it.

pub mod call;
pub mod channel;
pub mod dispatch;
pub mod forward;
pub mod notify;
pub mod server;
