// src/error.rs

//! Error taxonomy shared by the brokerage components.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The registry has no entry for the host service.
    #[error("service `{0}` is not registered")]
    HostUnavailable(String),
    /// The host handle is present but does not answer a ping.
    #[error("service `{0}` does not respond")]
    HostDead(String),
    /// The transaction itself failed.
    #[error("transaction failed: {0}")]
    Transport(String),
    /// The remote side marshalled an exception into the reply.
    #[error("remote exception {code}: {message}")]
    RemoteException { code: i32, message: String },
    #[error("peer is not allowed to {operation}")]
    PeerDenied { operation: &'static str },
    #[error("remote object is dead")]
    PeerGone,
    #[error("{what} is unavailable: {source}")]
    ResourceUnavailable {
        what: String,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl Error {
    /// Whether this failure means the registry host has to be re-resolved.
    pub fn resets_host(&self) -> bool {
        matches!(self, Error::HostUnavailable(_) | Error::HostDead(_))
    }

    pub fn resource(what: impl Into<String>, source: std::io::Error) -> Self {
        Error::ResourceUnavailable {
            what: what.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
