// src/bridge/mod.rs

//! Publishing handles through the system registry's activity service.
//!
//! The registry offers no way to register an arbitrary service, so the
//! daemon piggybacks on a well-known one. Each bridge transaction uses
//! [`BRIDGE_TRANSACTION_CODE`], a code the host never uses itself, and is
//! framed as:
//!
//! ```text
//! request:  interface token (BRIDGE_DESCRIPTOR) | i32 opcode | [handle]
//! reply:    exception marker                    | [handle]
//! ```
//!
//! Inside the host, [`server::BridgeServer`] sits in front of the host's own
//! dispatcher and steers matching transactions to itself; the daemon side,
//! [`client::BridgeClient`], sends them with polling and retries and
//! re-publishes after the host restarts.
//!
//! [`BRIDGE_TRANSACTION_CODE`]: crate::constants::BRIDGE_TRANSACTION_CODE
//! [`BRIDGE_DESCRIPTOR`]: crate::constants::BRIDGE_DESCRIPTOR

pub mod client;
pub mod server;

pub use client::BridgeClient;
pub use server::{BridgeServer, InterceptingHandler};

use crate::binder::BinderRef;
use crate::constants::BridgeAction;
use crate::error::Result;
use std::time::Duration;

/// Upper-layer callbacks of the sending side.
pub trait BridgeListener: Send + Sync {
    /// The registry host came back after dying; per-session state is stale.
    fn on_system_server_restarted(&self);

    /// Final outcome of one publish, after retries.
    fn on_response_from_bridge_service(&self, response: bool);
}

/// The three operations the daemon needs from the piggyback channel.
pub trait RegistryTransport: Send + Sync {
    /// Publishes `binder` under `action`; returns whether the host accepted it.
    fn publish(&self, action: BridgeAction, binder: BinderRef) -> bool;

    /// Fetches the current management handle, if one was published.
    fn fetch(&self) -> Result<Option<BinderRef>>;

    /// Handles the death of the registry host.
    fn on_host_restart(&self);
}

/// Timing of the sender's registry poll and transaction retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between registry lookups while the host is missing.
    pub poll_interval: Duration,
    /// Transaction attempts per publish.
    pub attempts: u32,
    /// Delay between failed attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}
