// src/bridge/server.rs

//! Receiving side of the bridge, living inside the registry host.

use crate::auth::{Authorizer, Operation, PeerIdentity};
use crate::binder::{BinderId, BinderRef, DeathRecipient, TransactionHandler};
use crate::constants::{BRIDGE_DESCRIPTOR, BRIDGE_TRANSACTION_CODE, BridgeAction, TransactionFlags};
use crate::error::{Error, Result};
use crate::liveness::{Endpoint, Linked};
use crate::parcel::{EX_ILLEGAL_ARGUMENT, EX_ILLEGAL_STATE, EX_SECURITY, Parcel};
use crate::utils::lock;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, Weak};

pub struct BridgeServer {
    authorizer: Authorizer,
    service: Mutex<Endpoint>,
    manager: Mutex<Endpoint>,
    peer_recipient: Arc<dyn DeathRecipient>,
}

/// Fires when the daemon that published the handles dies.
struct PeerDeathRecipient {
    server: Weak<BridgeServer>,
}

impl DeathRecipient for PeerDeathRecipient {
    fn binder_died(&self, who: BinderId) {
        error!("Published handle {:?} is dead", who);
        if let Some(server) = self.server.upgrade() {
            // Both handles come from the same process.
            lock(&server.service).clear();
            lock(&server.manager).clear();
        }
    }
}

fn exception_code(error: &Error) -> i32 {
    match error {
        Error::PeerDenied { .. } => EX_SECURITY,
        Error::ProtocolMismatch(_) => EX_ILLEGAL_ARGUMENT,
        _ => EX_ILLEGAL_STATE,
    }
}

impl BridgeServer {
    pub fn new(authorizer: Authorizer) -> Arc<Self> {
        Arc::new_cyclic(|server| Self {
            authorizer,
            service: Mutex::new(Endpoint::Dead),
            manager: Mutex::new(Endpoint::Dead),
            peer_recipient: Arc::new(PeerDeathRecipient {
                server: server.clone(),
            }),
        })
    }

    pub fn service(&self) -> Option<BinderRef> {
        lock(&self.service).binder()
    }

    pub fn manager(&self) -> Option<BinderRef> {
        lock(&self.manager).binder()
    }

    /// Entry point ahead of the host's own dispatcher. Returns `false` when
    /// the transaction is not ours and must be passed on untouched.
    pub fn exec_transact(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
        caller: &PeerIdentity,
    ) -> bool {
        if code != BRIDGE_TRANSACTION_CODE {
            return false;
        }
        let descriptor = data.read_interface_descriptor();
        data.set_data_position(0);
        match descriptor {
            Ok(descriptor) if descriptor == BRIDGE_DESCRIPTOR => {}
            _ => return false,
        }

        match self.on_transact(data, reply, caller) {
            Ok(handled) => handled,
            Err(e) => {
                if flags.contains(TransactionFlags::ONEWAY) {
                    warn!("Caught an error from a one-way bridge call: {}", e);
                } else {
                    reply.clear();
                    reply.write_exception(exception_code(&e), &e.to_string());
                }
                true
            }
        }
    }

    fn on_transact(&self, data: &mut Parcel, reply: &mut Parcel, caller: &PeerIdentity) -> Result<bool> {
        data.enforce_interface(BRIDGE_DESCRIPTOR)?;
        let raw = data.read_i32()?;
        let action = BridgeAction::try_from(raw)
            .map_err(|_| Error::ProtocolMismatch(format!("unknown bridge action {raw}")))?;
        debug!("onTransact: action={:?}, caller={}", action, caller);

        match action {
            BridgeAction::SendServiceHandle | BridgeAction::SendManagementHandle => {
                if self.authorizer.check(Operation::SendHandle, caller).is_err() {
                    return Ok(false);
                }
                self.receive(action, data.read_strong_binder()?);
                reply.write_no_exception();
                Ok(true)
            }
            BridgeAction::GetManagementHandle => {
                if self
                    .authorizer
                    .check(Operation::GetManagementHandle, caller)
                    .is_err()
                {
                    return Ok(false);
                }
                let manager = self.manager();
                debug!("Saved management handle is {:?}", manager.as_ref().map(|m| m.id()));
                reply.write_no_exception();
                reply.write_strong_binder(manager.as_ref());
                Ok(true)
            }
        }
    }

    fn receive(&self, action: BridgeAction, binder: Option<BinderRef>) {
        let Some(binder) = binder else {
            error!("Received an empty handle for {:?}", action);
            return;
        };
        let slot = match action {
            BridgeAction::SendServiceHandle => &self.service,
            BridgeAction::SendManagementHandle => &self.manager,
            BridgeAction::GetManagementHandle => return,
        };
        match Linked::link(binder, self.peer_recipient.clone()) {
            Ok(linked) => {
                lock(slot).replace(linked);
                info!("Received handle for {:?}", action);
            }
            Err(e) => warn!("Dropping handle for {:?}: {}", action, e),
        }
    }
}

/// Host dispatcher wrapped so that bridge transactions are consulted first.
pub struct InterceptingHandler {
    bridge: Arc<BridgeServer>,
    inner: Arc<dyn TransactionHandler>,
}

impl InterceptingHandler {
    pub fn new(bridge: Arc<BridgeServer>, inner: Arc<dyn TransactionHandler>) -> Self {
        Self { bridge, inner }
    }
}

impl TransactionHandler for InterceptingHandler {
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
        caller: &PeerIdentity,
    ) -> Result<bool> {
        if self.bridge.exec_transact(code, data, reply, flags, caller) {
            return Ok(true);
        }
        data.set_data_position(0);
        self.inner.on_transact(code, data, reply, flags, caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{Binder, LocalBinder};
    use crate::testing::{FakePackages, NoopHandler, RecordingHandler, daemon_identity};

    const INSTALLER: u32 = 10_100;

    fn server() -> Arc<BridgeServer> {
        BridgeServer::new(Authorizer::new(Arc::new(FakePackages::installer(INSTALLER))))
    }

    fn request(action: i32, binder: Option<&BinderRef>) -> Parcel {
        let mut data = Parcel::new();
        data.write_interface_token(BRIDGE_DESCRIPTOR);
        data.write_i32(action);
        if binder.is_some() {
            data.write_strong_binder(binder);
        }
        data.set_data_position(0);
        data
    }

    fn handle(name: &str) -> Arc<LocalBinder> {
        LocalBinder::new(name, Arc::new(NoopHandler), daemon_identity())
    }

    #[test]
    fn later_management_handle_replaces_earlier_one() {
        let server = server();
        let h1 = handle("h1");
        let h2 = handle("h2");
        let h1_ref: BinderRef = h1.clone();
        let h2_ref: BinderRef = h2.clone();
        let root = PeerIdentity::new(0, 1);
        let mut reply = Parcel::new();

        for h in [&h1_ref, &h2_ref] {
            let mut data = request(BridgeAction::SendManagementHandle as i32, Some(h));
            assert!(server.exec_transact(
                BRIDGE_TRANSACTION_CODE,
                &mut data,
                &mut reply,
                TransactionFlags::empty(),
                &root,
            ));
        }

        let mut data = request(BridgeAction::GetManagementHandle as i32, None);
        assert!(server.exec_transact(
            BRIDGE_TRANSACTION_CODE,
            &mut data,
            &mut reply,
            TransactionFlags::empty(),
            &PeerIdentity::new(INSTALLER, 5),
        ));
        reply.set_data_position(0);
        reply.read_exception().unwrap();
        assert_eq!(reply.read_strong_binder().unwrap().unwrap().id(), h2.id());

        // The replaced handle is no longer watched.
        h1.die();
        assert_eq!(server.manager().unwrap().id(), h2.id());
    }

    #[test]
    fn death_of_the_publisher_clears_both_handles() {
        let server = server();
        let service = handle("S");
        let manager = handle("M");
        let service_ref: BinderRef = service.clone();
        let manager_ref: BinderRef = manager.clone();
        let root = PeerIdentity::new(0, 1);
        let mut reply = Parcel::new();
        for (action, h) in [
            (BridgeAction::SendServiceHandle, &service_ref),
            (BridgeAction::SendManagementHandle, &manager_ref),
        ] {
            let mut data = request(action as i32, Some(h));
            server.exec_transact(
                BRIDGE_TRANSACTION_CODE,
                &mut data,
                &mut reply,
                TransactionFlags::empty(),
                &root,
            );
        }
        assert!(server.service().is_some());

        service.die();
        assert!(server.service().is_none());
        assert!(server.manager().is_none());
    }

    #[test]
    fn unknown_action_is_reported_as_an_exception() {
        let server = server();
        let mut data = request(7, None);
        let mut reply = Parcel::new();
        assert!(server.exec_transact(
            BRIDGE_TRANSACTION_CODE,
            &mut data,
            &mut reply,
            TransactionFlags::empty(),
            &PeerIdentity::new(0, 1),
        ));
        reply.set_data_position(0);
        assert!(matches!(
            reply.read_exception(),
            Err(Error::RemoteException { code: EX_ILLEGAL_ARGUMENT, .. })
        ));
    }

    #[test]
    fn one_way_failure_leaves_the_reply_empty() {
        let server = server();
        let mut data = request(7, None);
        let mut reply = Parcel::new();
        assert!(server.exec_transact(
            BRIDGE_TRANSACTION_CODE,
            &mut data,
            &mut reply,
            TransactionFlags::ONEWAY,
            &PeerIdentity::new(0, 1),
        ));
        assert_eq!(reply.data_size(), 0);
    }

    #[test]
    fn foreign_transactions_reach_the_host_dispatcher() {
        let server = server();
        let inner = Arc::new(RecordingHandler::default());
        let host = LocalBinder::new(
            BRIDGE_DESCRIPTOR,
            Arc::new(InterceptingHandler::new(server.clone(), inner.clone())),
            PeerIdentity::new(0, 1),
        );
        let mut reply = Parcel::new();

        // Our code, someone else's descriptor.
        let mut foreign = Parcel::new();
        foreign.write_interface_token("android.os.IServiceManager");
        foreign.write_i32(0);
        host.transact(BRIDGE_TRANSACTION_CODE, &foreign, &mut reply, TransactionFlags::empty())
            .unwrap();
        // Someone else's code.
        host.transact(1, &request(0, None), &mut reply, TransactionFlags::empty())
            .unwrap();

        assert_eq!(inner.codes(), vec![BRIDGE_TRANSACTION_CODE, 1]);
        assert!(server.service().is_none());
    }
}
