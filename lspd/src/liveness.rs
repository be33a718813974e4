// src/liveness.rs

//! Death-subscription bookkeeping for every remote handle the daemon keeps.
//!
//! A [`Linked`] handle owns its subscription: linking happens when it is
//! created and unlinking when it is dropped, so subscribe/unsubscribe on any
//! stored handle is always balanced. [`Endpoint`] is the slot such a handle
//! lives in.

use crate::binder::{BinderId, BinderRef, DeathRecipient};
use crate::error::Result;
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// A remote handle together with the death recipient linked to it.
pub struct Linked {
    binder: BinderRef,
    recipient: Arc<dyn DeathRecipient>,
}

impl Linked {
    /// Links `recipient` to `binder`; fails if the object is already dead.
    pub fn link(binder: BinderRef, recipient: Arc<dyn DeathRecipient>) -> Result<Self> {
        binder.link_to_death(recipient.clone())?;
        trace!("Linked death recipient to {:?}", binder.id());
        Ok(Self { binder, recipient })
    }

    pub fn binder(&self) -> &BinderRef {
        &self.binder
    }

    pub fn id(&self) -> BinderId {
        self.binder.id()
    }

    pub fn is_alive(&self) -> bool {
        self.binder.is_alive()
    }
}

impl Drop for Linked {
    fn drop(&mut self) {
        self.binder.unlink_to_death(&self.recipient);
        trace!("Unlinked death recipient from {:?}", self.binder.id());
    }
}

/// Slot holding a remote endpoint.
#[derive(Default)]
pub enum Endpoint {
    Alive(Linked),
    #[default]
    Dead,
}

impl Endpoint {
    /// Stores `linked`, releasing whatever was held before.
    pub fn replace(&mut self, linked: Linked) {
        *self = Endpoint::Alive(linked);
    }

    /// Releases the held handle, if any.
    pub fn clear(&mut self) {
        *self = Endpoint::Dead;
    }

    /// Releases the held handle only if it is the object `id`.
    pub fn clear_if(&mut self, id: BinderId) -> bool {
        if self.id() == Some(id) {
            self.clear();
            true
        } else {
            false
        }
    }

    pub fn binder(&self) -> Option<BinderRef> {
        match self {
            Endpoint::Alive(linked) => Some(linked.binder.clone()),
            Endpoint::Dead => None,
        }
    }

    pub fn id(&self) -> Option<BinderId> {
        match self {
            Endpoint::Alive(linked) => Some(linked.id()),
            Endpoint::Dead => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, Endpoint::Alive(linked) if linked.is_alive())
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
/// Running, and another death arrived since the current round started.
const RERUN: u8 = 2;

/// Serializes reconnect handling: only one caller at a time gets a
/// [`ReconnectGuard`]. A caller turned away while a round is running is not
/// lost; the holder is told to run another round.
#[derive(Default)]
pub struct ReconnectGate {
    state: AtomicU8,
}

impl ReconnectGate {
    pub fn try_begin(&self) -> Option<ReconnectGuard<'_>> {
        loop {
            if self
                .state
                .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ReconnectGuard {
                    gate: self,
                    finished: false,
                });
            }
            match self
                .state
                .compare_exchange(RUNNING, RERUN, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) | Err(RERUN) => return None,
                // The holder finished in between; take over.
                Err(_) => continue,
            }
        }
    }
}

pub struct ReconnectGuard<'a> {
    gate: &'a ReconnectGate,
    finished: bool,
}

impl ReconnectGuard<'_> {
    /// Ends the current round. Returns true if another caller arrived during
    /// it, in which case the holder keeps the gate and must run again.
    pub fn again(&mut self) -> bool {
        if self.finished {
            return false;
        }
        match self
            .gate
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.finished = true;
                false
            }
            Err(_) => {
                self.gate.state.store(RUNNING, Ordering::Release);
                true
            }
        }
    }
}

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.gate.state.store(IDLE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{Binder, LocalBinder};
    use crate::testing::{CountingBinder, CountingRecipient, NoopHandler, daemon_identity};

    #[test]
    fn subscriptions_are_balanced_across_replacement_and_clear() {
        let first = CountingBinder::wrap(LocalBinder::new(
            "a",
            Arc::new(NoopHandler),
            daemon_identity(),
        ));
        let second = CountingBinder::wrap(LocalBinder::new(
            "b",
            Arc::new(NoopHandler),
            daemon_identity(),
        ));
        let recipient: Arc<dyn DeathRecipient> = Arc::new(CountingRecipient::default());

        let mut slot = Endpoint::default();
        slot.replace(Linked::link(first.clone(), recipient.clone()).unwrap());
        slot.replace(Linked::link(second.clone(), recipient.clone()).unwrap());
        assert_eq!(first.links(), 1);
        assert_eq!(first.unlinks(), 1);
        assert_eq!(second.unlinks(), 0);

        assert!(!slot.clear_if(first.id()));
        assert!(slot.clear_if(second.id()));
        assert_eq!(second.links(), second.unlinks());
        assert!(slot.binder().is_none());
    }

    #[test]
    fn dead_object_is_never_stored() {
        let object = LocalBinder::new("a", Arc::new(NoopHandler), daemon_identity());
        object.die();
        let recipient: Arc<dyn DeathRecipient> = Arc::new(CountingRecipient::default());
        assert!(Linked::link(object, recipient).is_err());
    }

    #[test]
    fn endpoint_reports_death_of_held_object() {
        let object = LocalBinder::new("a", Arc::new(NoopHandler), daemon_identity());
        let recipient = Arc::new(CountingRecipient::default());
        let mut slot = Endpoint::default();
        slot.replace(Linked::link(object.clone(), recipient.clone()).unwrap());
        assert!(slot.is_alive());
        object.die();
        assert!(!slot.is_alive());
        assert_eq!(recipient.deaths(), 1);
    }

    #[test]
    fn reconnect_gate_admits_one_holder() {
        let gate = ReconnectGate::default();
        let mut guard = gate.try_begin().unwrap();
        assert!(!guard.again());
        drop(guard);
        assert!(gate.try_begin().is_some());
    }

    #[test]
    fn reconnect_request_during_a_round_is_replayed_once() {
        let gate = ReconnectGate::default();
        let mut guard = gate.try_begin().unwrap();
        assert!(gate.try_begin().is_none());
        assert!(gate.try_begin().is_none());
        assert!(guard.again());
        assert!(gate.try_begin().is_none());
        assert!(guard.again());
        assert!(!guard.again());
        drop(guard);
        assert!(gate.try_begin().is_some());
    }
}
