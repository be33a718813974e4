// src/bridge/client.rs

//! Sending side of the bridge, running in the daemon.

use super::{BridgeListener, RegistryTransport, RetryPolicy};
use crate::binder::{BinderId, BinderRef, DeathRecipient};
use crate::constants::{
    BRIDGE_DESCRIPTOR, BRIDGE_SERVICE_NAME, BRIDGE_TRANSACTION_CODE, BridgeAction,
    TransactionFlags,
};
use crate::error::{Error, Result};
use crate::liveness::{Endpoint, Linked, ReconnectGate};
use crate::parcel::Parcel;
use crate::registry::{CacheInvalidator, ServiceRegistry};
use crate::utils::lock;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// Handles this process published, re-sent whenever the host restarts.
#[derive(Default)]
struct Published {
    service: Option<BinderRef>,
    manager: Option<BinderRef>,
}

pub struct BridgeClient {
    registry: Arc<dyn ServiceRegistry>,
    invalidator: Arc<dyn CacheInvalidator>,
    policy: RetryPolicy,
    listener: Mutex<Option<Arc<dyn BridgeListener>>>,
    published: Mutex<Published>,
    host: Mutex<Endpoint>,
    host_recipient: Arc<dyn DeathRecipient>,
    reconnect: ReconnectGate,
}

/// Fires when the registry host dies.
struct HostDeathRecipient {
    client: Weak<BridgeClient>,
}

impl DeathRecipient for HostDeathRecipient {
    fn binder_died(&self, who: BinderId) {
        info!("Service {} ({:?}) is dead", BRIDGE_SERVICE_NAME, who);
        if let Some(client) = self.client.upgrade() {
            client.on_host_restart();
        }
    }
}

impl BridgeClient {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        invalidator: Arc<dyn CacheInvalidator>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|client| Self {
            registry,
            invalidator,
            policy,
            listener: Mutex::new(None),
            published: Mutex::new(Published::default()),
            host: Mutex::new(Endpoint::Dead),
            host_recipient: Arc::new(HostDeathRecipient {
                client: client.clone(),
            }),
            reconnect: ReconnectGate::default(),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn BridgeListener>) {
        *lock(&self.listener) = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn BridgeListener>> {
        lock(&self.listener).clone()
    }

    /// Publishes the module-facing service handle.
    pub fn send_service(&self, binder: BinderRef) -> bool {
        lock(&self.published).service = Some(binder.clone());
        self.send_to_bridge(BridgeAction::SendServiceHandle, &binder, false)
    }

    /// Publishes the management handle.
    pub fn send_manager(&self, binder: BinderRef) -> bool {
        lock(&self.published).manager = Some(binder.clone());
        self.send_to_bridge(BridgeAction::SendManagementHandle, &binder, false)
    }

    /// Forgets the published handles so a host restart does not re-send them.
    pub fn retract(&self) {
        let mut published = lock(&self.published);
        published.service = None;
        published.manager = None;
        info!("Retracted published handles");
    }

    /// Whether the registry host we last talked to is still alive.
    pub fn is_connected(&self) -> bool {
        lock(&self.host).is_alive()
    }

    /// Blocks until the registry hands out a host that answers a ping.
    fn await_host(&self) -> BinderRef {
        loop {
            match self.registry.get_service(BRIDGE_SERVICE_NAME) {
                Some(host) if host.ping() => return host,
                Some(_) => debug!("{}", Error::HostDead(BRIDGE_SERVICE_NAME.to_string())),
                None => debug!("{}", Error::HostUnavailable(BRIDGE_SERVICE_NAME.to_string())),
            }
            info!(
                "Service {} is not started, wait {:?}.",
                BRIDGE_SERVICE_NAME, self.policy.poll_interval
            );
            thread::sleep(self.policy.poll_interval);
        }
    }

    /// Finds a live host and subscribes to its death.
    fn connect_host(&self) -> BinderRef {
        loop {
            let host = self.await_host();
            let mut slot = lock(&self.host);
            if slot.id() == Some(host.id()) {
                return host;
            }
            match Linked::link(host.clone(), self.host_recipient.clone()) {
                Ok(linked) => {
                    slot.replace(linked);
                    return host;
                }
                Err(e) => {
                    drop(slot);
                    warn!("Failed to link to the death of {}: {}", BRIDGE_SERVICE_NAME, e);
                    self.reset_host();
                }
            }
        }
    }

    /// Drops the host subscription and the registry's cached lookups.
    fn reset_host(&self) {
        lock(&self.host).clear();
        if let Err(e) = self.invalidator.invalidate() {
            warn!("Failed to clear the service manager cache: {}", e);
        }
    }

    fn transact_once(&self, host: &BinderRef, action: BridgeAction, binder: &BinderRef) -> Result<()> {
        // Fresh buffers per attempt.
        let mut data = Parcel::new();
        let mut reply = Parcel::new();
        data.write_interface_token(BRIDGE_DESCRIPTOR);
        data.write_i32(action as i32);
        data.write_strong_binder(Some(binder));
        debug!("Sending {:?} with {:?}", action, binder.id());

        let handled = host
            .transact(BRIDGE_TRANSACTION_CODE, &data, &mut reply, TransactionFlags::empty())
            .map_err(|e| match e {
                Error::PeerGone => Error::HostDead(BRIDGE_SERVICE_NAME.to_string()),
                Error::Transport(_) | Error::HostDead(_) => e,
                other => Error::Transport(other.to_string()),
            })?;
        if !handled {
            return Err(Error::Transport(format!("{action:?} was not handled")));
        }
        reply.read_exception()
    }

    /// Sends one handle to the host, polling for it and retrying per the policy.
    fn send_to_bridge(&self, action: BridgeAction, binder: &BinderRef, is_restart: bool) -> bool {
        let mut host = self.connect_host();
        if is_restart {
            if let Some(listener) = self.listener() {
                listener.on_system_server_restarted();
            }
        }

        let mut response = false;
        for attempt in 1..=self.policy.attempts {
            let lost_host = match self.transact_once(&host, action, binder) {
                Ok(()) => {
                    response = true;
                    break;
                }
                Err(e) => {
                    error!("Send {:?} (attempt {}): {}", action, attempt, e);
                    e.resets_host()
                }
            };
            if lost_host {
                self.reset_host();
            }
            if attempt < self.policy.attempts {
                warn!("No response from bridge, retry in {:?}", self.policy.backoff);
                thread::sleep(self.policy.backoff);
                if lost_host {
                    host = self.connect_host();
                }
            }
        }

        if let Some(listener) = self.listener() {
            listener.on_response_from_bridge_service(response);
        }
        response
    }
}

impl RegistryTransport for BridgeClient {
    fn publish(&self, action: BridgeAction, binder: BinderRef) -> bool {
        match action {
            BridgeAction::SendServiceHandle => self.send_service(binder),
            BridgeAction::SendManagementHandle => self.send_manager(binder),
            BridgeAction::GetManagementHandle => {
                warn!("{:?} does not publish anything", action);
                false
            }
        }
    }

    fn fetch(&self) -> Result<Option<BinderRef>> {
        let host = self
            .registry
            .get_service(BRIDGE_SERVICE_NAME)
            .ok_or_else(|| Error::HostUnavailable(BRIDGE_SERVICE_NAME.to_string()))?;

        let mut data = Parcel::new();
        let mut reply = Parcel::new();
        data.write_interface_token(BRIDGE_DESCRIPTOR);
        data.write_i32(BridgeAction::GetManagementHandle as i32);
        let handled = host.transact(
            BRIDGE_TRANSACTION_CODE,
            &data,
            &mut reply,
            TransactionFlags::empty(),
        )?;
        if !handled {
            return Err(Error::PeerDenied {
                operation: "get the management handle",
            });
        }
        reply.read_exception()?;
        reply.read_strong_binder()
    }

    fn on_host_restart(&self) {
        let Some(mut reconnect) = self.reconnect.try_begin() else {
            debug!("Reconnect already in flight, another round queued");
            return;
        };
        loop {
            self.republish();
            if !reconnect.again() {
                break;
            }
            info!("Service {} died again while reconnecting", BRIDGE_SERVICE_NAME);
        }
    }
}

impl BridgeClient {
    /// One reconnect round: drop the dead host and re-send what was published.
    fn republish(&self) {
        self.reset_host();

        let (service, manager) = {
            let published = lock(&self.published);
            (published.service.clone(), published.manager.clone())
        };
        // Only the first re-send reports the restart upward.
        let mut is_restart = true;
        if let Some(service) = service {
            self.send_to_bridge(BridgeAction::SendServiceHandle, &service, is_restart);
            is_restart = false;
        }
        if let Some(manager) = manager {
            self.send_to_bridge(BridgeAction::SendManagementHandle, &manager, is_restart);
            is_restart = false;
        }
        if is_restart {
            if let Some(listener) = self.listener() {
                listener.on_system_server_restarted();
            }
        }
    }
}
