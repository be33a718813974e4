// src/binder.rs

//! Transportable handles to objects living in another process.
//!
//! [`Binder`] is the seam to whatever IPC driver carries the handles. A
//! handle answers pings, carries transactions, and notifies every linked
//! [`DeathRecipient`] exactly once when the hosting process goes away.
//!
//! [`LocalBinder`] hosts an object in this process. Each reference to it is
//! stamped with the identity of the process holding that reference, which is
//! what the receiving handler sees as its caller, the way the kernel driver
//! stamps the sender of every transaction.

use crate::auth::PeerIdentity;
use crate::constants::TransactionFlags;
use crate::error::{Error, Result};
use crate::parcel::Parcel;
use crate::utils::lock;
use log::{trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type BinderRef = Arc<dyn Binder>;

/// Identity of the remote object behind a handle; equal for every reference
/// to the same object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinderId(u64);

pub trait DeathRecipient: Send + Sync {
    fn binder_died(&self, who: BinderId);
}

pub trait Binder: Send + Sync {
    fn id(&self) -> BinderId;

    fn interface_descriptor(&self) -> String;

    /// Round-trips to the hosting process.
    fn ping(&self) -> bool;

    fn is_alive(&self) -> bool {
        self.ping()
    }

    /// Delivers `data` to the remote object. `Ok(false)` means the remote
    /// side did not handle the code.
    fn transact(
        &self,
        code: u32,
        data: &Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
    ) -> Result<bool>;

    /// Fails with [`Error::PeerGone`] when the object is already dead.
    fn link_to_death(&self, recipient: Arc<dyn DeathRecipient>) -> Result<()>;

    /// Returns whether the recipient was still linked.
    fn unlink_to_death(&self, recipient: &Arc<dyn DeathRecipient>) -> bool;
}

impl fmt::Debug for dyn Binder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binder({:?}, {})", self.id(), self.interface_descriptor())
    }
}

/// Whether two recipient references name the same recipient.
pub fn same_recipient(a: &Arc<dyn DeathRecipient>, b: &Arc<dyn DeathRecipient>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Server side of a locally hosted object.
pub trait TransactionHandler: Send + Sync {
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
        caller: &PeerIdentity,
    ) -> Result<bool>;
}

static NEXT_BINDER_ID: AtomicU64 = AtomicU64::new(1);

struct Node {
    id: BinderId,
    descriptor: String,
    handler: Arc<dyn TransactionHandler>,
    alive: AtomicBool,
    recipients: Mutex<Vec<Arc<dyn DeathRecipient>>>,
}

/// A reference to an object hosted in this process.
pub struct LocalBinder {
    node: Arc<Node>,
    caller: PeerIdentity,
}

impl LocalBinder {
    /// Hosts `handler` under `descriptor`; `owner` is the identity seen by
    /// the handler for transactions issued through this reference.
    pub fn new(
        descriptor: &str,
        handler: Arc<dyn TransactionHandler>,
        owner: PeerIdentity,
    ) -> Arc<Self> {
        let id = BinderId(NEXT_BINDER_ID.fetch_add(1, Ordering::Relaxed));
        trace!("Hosting {} as {:?}", descriptor, id);
        Arc::new(Self {
            node: Arc::new(Node {
                id,
                descriptor: descriptor.to_string(),
                handler,
                alive: AtomicBool::new(true),
                recipients: Mutex::new(Vec::new()),
            }),
            caller: owner,
        })
    }

    /// A reference to the same object as held by `caller`.
    pub fn proxy(&self, caller: PeerIdentity) -> Arc<Self> {
        Arc::new(Self {
            node: Arc::clone(&self.node),
            caller,
        })
    }

    /// Tears the object down and notifies every linked recipient.
    pub fn die(&self) {
        if !self.node.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let recipients = std::mem::take(&mut *lock(&self.node.recipients));
        trace!(
            "{:?} died, notifying {} recipient(s)",
            self.node.id,
            recipients.len()
        );
        // Recipients run without the list locked so they may relink elsewhere.
        for recipient in recipients {
            recipient.binder_died(self.node.id);
        }
    }
}

impl Binder for LocalBinder {
    fn id(&self) -> BinderId {
        self.node.id
    }

    fn interface_descriptor(&self) -> String {
        self.node.descriptor.clone()
    }

    fn ping(&self) -> bool {
        self.node.alive.load(Ordering::SeqCst)
    }

    fn transact(
        &self,
        code: u32,
        data: &Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
    ) -> Result<bool> {
        if !self.ping() {
            return Err(Error::PeerGone);
        }
        let mut data = data.clone();
        data.set_data_position(0);
        reply.clear();
        let handled = self
            .node
            .handler
            .on_transact(code, &mut data, reply, flags, &self.caller);
        reply.set_data_position(0);
        if let Err(e) = &handled {
            warn!("Transaction {:#x} on {:?} failed: {}", code, self.node.id, e);
        }
        handled
    }

    fn link_to_death(&self, recipient: Arc<dyn DeathRecipient>) -> Result<()> {
        let mut recipients = lock(&self.node.recipients);
        // Checked under the lock so a concurrent `die` cannot miss us.
        if !self.ping() {
            return Err(Error::PeerGone);
        }
        recipients.push(recipient);
        Ok(())
    }

    fn unlink_to_death(&self, recipient: &Arc<dyn DeathRecipient>) -> bool {
        let mut recipients = lock(&self.node.recipients);
        let before = recipients.len();
        recipients.retain(|linked| !same_recipient(linked, recipient));
        recipients.len() != before
    }
}
