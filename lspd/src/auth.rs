// src/auth.rs

//! Peer authorization for every externally reachable operation.
//!
//! | Operation                                  | Required peer                          |
//! |--------------------------------------------|----------------------------------------|
//! | `SEND_SERVICE_HANDLE` / `SEND_MANAGEMENT_HANDLE` | uid 0                            |
//! | `GET_MANAGEMENT_HANDLE`                    | installer of the manager package       |
//! | compiler descriptor accept                 | anyone the socket label lets through   |
//! | module handle dispatch                     | uid owned by an enabled module         |
//!
//! A refusal is an `Error::PeerDenied`; callers turn it into a negative
//! acknowledgement instead of propagating it across the IPC boundary.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;

/// Identity of the peer on the other end of a transaction or connection,
/// captured when the request arrives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub uid: u32,
    pub pid: i32,
    pub label: Option<String>,
}

impl PeerIdentity {
    pub fn new(uid: u32, pid: i32) -> Self {
        Self {
            uid,
            pid,
            label: None,
        }
    }

    /// Identity of this process.
    pub fn current() -> Self {
        Self::new(
            rustix::process::getuid().as_raw(),
            std::process::id() as i32,
        )
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} pid={}", self.uid, self.pid)?;
        if let Some(label) = &self.label {
            write!(f, " label={label}")?;
        }
        Ok(())
    }
}

/// Answers package-ownership questions about a uid.
pub trait PackageOracle: Send + Sync {
    /// Whether `uid` installed the manager package.
    fn is_installer(&self, uid: u32) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SendHandle,
    GetManagementHandle,
}

impl Operation {
    fn describe(self) -> &'static str {
        match self {
            Operation::SendHandle => "send a handle",
            Operation::GetManagementHandle => "get the management handle",
        }
    }

    fn denied(self) -> Error {
        Error::PeerDenied {
            operation: self.describe(),
        }
    }
}

pub struct Authorizer {
    packages: Arc<dyn PackageOracle>,
}

impl Authorizer {
    pub fn new(packages: Arc<dyn PackageOracle>) -> Self {
        Self { packages }
    }

    /// Gate for operations initiated by `peer`.
    pub fn check(&self, operation: Operation, peer: &PeerIdentity) -> Result<()> {
        let allowed = match operation {
            Operation::SendHandle => peer.is_root(),
            // A failing lookup counts as a refusal.
            Operation::GetManagementHandle => match self.packages.is_installer(peer.uid) {
                Ok(installer) => installer,
                Err(e) => {
                    warn!("Installer lookup for uid {} failed: {}", peer.uid, e);
                    false
                }
            },
        };
        if allowed {
            debug!("Allowed {} to {}", peer, operation.describe());
            Ok(())
        } else {
            warn!("Denied {} to {}", peer, operation.describe());
            Err(operation.denied())
        }
    }
}

/// Gate for pushing a module handle to `uid`: the uid must belong to an
/// enabled module, which is returned.
pub fn check_module_target<T>(uid: u32, module: Option<T>) -> Result<T> {
    module.ok_or_else(|| {
        debug!("uid {} does not belong to an enabled module", uid);
        Error::PeerDenied {
            operation: "receive a module handle",
        }
    })
}
