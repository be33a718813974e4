// src/lib.rs

//! Brokerage core of the LSPosed daemon.
//!
//! The daemon never runs inside the processes it serves. Everything it hands
//! out travels over one of two channels:
//!
//! - the platform IPC fabric, where the daemon service and the manager
//!   handle are parked with a bridge hosted by the system server
//!   ([`bridge`]), and module handles are pushed to module processes through
//!   their content providers ([`module_service`]);
//! - plain Unix sockets, where the compiler wrapper receives a descriptor of
//!   the stock `dex2oat` binary ([`dex2oat`]).
//!
//! [`daemon::Core`] wires these parts together and is what an embedding
//! runtime constructs; the `lspd` binary only runs the broker.

pub mod auth;
pub mod binder;
pub mod bridge;
pub mod constants;
pub mod daemon;
pub mod dex2oat;
pub mod error;
pub mod liveness;
pub mod manager;
pub mod module_service;
pub mod parcel;
pub mod platform;
pub mod registry;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
