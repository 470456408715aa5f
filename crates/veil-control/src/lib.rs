//! LocalRP control plane
//!
//! Agents without a public address register a control connection, receive
//! notifications of queued client requests over it, and answer each one with
//! a second connection that the server pairs with the waiting client.
pub mod agent_set;
pub mod controller;
pub mod error;
pub mod pending;
pub mod task_tracker;

pub use agent_set::{AgentSet, TunnelAgent};
pub use controller::{LocalRpConfig, LocalRpController, LocalRpStats};
pub use error::LocalRpError;
pub use pending::{Completion, ConnSlot, PendingHandle, PendingRequest};
pub use task_tracker::TaskTracker;
