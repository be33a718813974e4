// src/daemon.rs

//! The daemon core: one aggregate owning every brokerage component.
//!
//! [`Core`] publishes two handles through the bridge. The service handle is
//! what the registry host calls back into (launch hooks, uid lifecycle,
//! manager sessions); the management handle is the one the manager UI
//! fetches.
//!
//! This is the embedding entry point. The standalone `lspd` binary has no
//! IPC fabric to hand in, so it never builds a [`Core`]; the runtime that
//! does fills a [`CoreConfig`] with its registry, activity manager and
//! module config source, then calls [`Core::new`] and [`Core::publish`].

use crate::auth::PeerIdentity;
use crate::binder::{BinderRef, LocalBinder, TransactionHandler};
use crate::bridge::{BridgeClient, BridgeListener, RetryPolicy};
use crate::constants::{SYSTEM_UID, TransactionFlags};
use crate::dex2oat::{BrokerConfig, Dex2OatService};
use crate::error::{Error, Result};
use crate::manager::{LaunchDecision, ManagerConfig, ManagerInfo, ManagerService};
use crate::module_service::{ConfigSource, ModuleDispatcher};
use crate::parcel::Parcel;
use crate::platform::{ActivityManager, Intent};
use crate::registry::{CacheInvalidator, ServiceRegistry};
use log::{debug, error, info, warn};
use std::sync::{Arc, Weak};

pub const SERVICE_DESCRIPTOR: &str = "org.lsposed.lspd.ILSPosedService";

/// Collaborators and tunables the core is built from.
pub struct CoreConfig {
    pub registry: Arc<dyn ServiceRegistry>,
    pub invalidator: Arc<dyn CacheInvalidator>,
    pub activity: Arc<dyn ActivityManager>,
    pub modules: Arc<dyn ConfigSource>,
    pub sdk: i32,
    pub retry: RetryPolicy,
    pub manager: ManagerConfig,
    pub broker: BrokerConfig,
}

/// Everything the daemon serves, wired to the collaborators in [`CoreConfig`].
pub struct Core {
    bridge: Arc<BridgeClient>,
    manager: Arc<ManagerService>,
    dispatcher: ModuleDispatcher,
    broker: Dex2OatService,
    service: Arc<LocalBinder>,
}

/// Receives bridge events on behalf of the core.
struct CoreListener {
    core: Weak<Core>,
}

impl BridgeListener for CoreListener {
    fn on_system_server_restarted(&self) {
        info!("System server restarted, resetting session state");
        if let Some(core) = self.core.upgrade() {
            core.manager.on_system_server_died();
            core.dispatcher.reset();
        }
    }

    fn on_response_from_bridge_service(&self, response: bool) {
        if response {
            info!("Sent handle to the bridge");
        } else {
            error!("Bridge did not accept the handle");
        }
    }
}

/// Transaction surface of the service handle.
struct ServiceHandler {
    core: Weak<Core>,
}

impl ServiceHandler {
    const PRE_START_MANAGER: u32 = 1;
    const SHOULD_START_MANAGER: u32 = 2;
    const UID_STARTS: u32 = 3;
    const UID_GONE: u32 = 4;
    const REQUEST_MANAGER_BINDER: u32 = 5;

    fn read_intent(data: &mut Parcel) -> Result<Intent> {
        let mut intent = Intent::new();
        intent.action = data.read_string16()?;
        intent.component = data.read_string16()?;
        intent.mime_type = data.read_string16()?;
        for category in data.read_string_list()? {
            intent.add_category(category);
        }
        Ok(intent)
    }
}

impl TransactionHandler for ServiceHandler {
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        _flags: TransactionFlags,
        caller: &PeerIdentity,
    ) -> Result<bool> {
        data.enforce_interface(SERVICE_DESCRIPTOR)?;
        let core = self.core.upgrade().ok_or(Error::PeerGone)?;

        // Lifecycle hooks only come from the host.
        let from_host = caller.is_root() || caller.uid == SYSTEM_UID;
        if code != Self::REQUEST_MANAGER_BINDER && !from_host {
            warn!("Ignoring hook {} from {}", code, caller);
            return Ok(false);
        }

        match code {
            Self::PRE_START_MANAGER => {
                let package = data.read_string16()?.unwrap_or_default();
                let intent = Self::read_intent(data)?;
                let decision = core.manager.pre_start_manager(&package, &intent);
                reply.write_no_exception();
                reply.write_i32((decision == LaunchDecision::Allow) as i32);
            }
            Self::SHOULD_START_MANAGER => {
                let pid = data.read_i32()?;
                let uid = data.read_i32()? as u32;
                let process_name = data.read_string16()?.unwrap_or_default();
                let start = core.manager.should_start_manager(pid, uid, &process_name);
                reply.write_no_exception();
                reply.write_i32(start as i32);
            }
            Self::UID_STARTS => {
                core.dispatcher.uid_starts(data.read_i32()? as u32);
                reply.write_no_exception();
            }
            Self::UID_GONE => {
                core.dispatcher.uid_gone(data.read_i32()? as u32);
                reply.write_no_exception();
            }
            Self::REQUEST_MANAGER_BINDER => {
                let heartbeat = data
                    .read_strong_binder()?
                    .ok_or_else(|| Error::ProtocolMismatch("missing heartbeat".to_string()))?;
                let binder = if core.manager.post_start_manager(caller.pid, caller.uid) {
                    Some(core.manager.obtain_manager_binder(heartbeat, caller.pid, caller.uid)?)
                } else {
                    debug!("{} is not the manager", caller);
                    None
                };
                reply.write_no_exception();
                reply.write_strong_binder(binder.as_ref());
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl Core {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        let core = Arc::new_cyclic(|core: &Weak<Core>| Self {
            bridge: BridgeClient::new(config.registry, config.invalidator, config.retry),
            manager: ManagerService::new(config.activity.clone(), config.manager),
            dispatcher: ModuleDispatcher::new(config.modules, config.activity, config.sdk),
            broker: Dex2OatService::new(config.broker),
            service: LocalBinder::new(
                SERVICE_DESCRIPTOR,
                Arc::new(ServiceHandler { core: core.clone() }),
                PeerIdentity::current(),
            ),
        });
        core.bridge.set_listener(Arc::new(CoreListener {
            core: Arc::downgrade(&core),
        }));
        core
    }

    pub fn service_binder(&self) -> BinderRef {
        self.service.clone()
    }

    pub fn manager(&self) -> &Arc<ManagerService> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &ModuleDispatcher {
        &self.dispatcher
    }

    pub fn bridge(&self) -> &Arc<BridgeClient> {
        &self.bridge
    }

    /// Publishes the service and management handles; true if both landed.
    pub fn publish(&self) -> bool {
        let service = self.bridge.send_service(self.service_binder());
        let manager = self.bridge.send_manager(self.manager.binder());
        service && manager
    }

    pub fn retract(&self) {
        self.bridge.retract();
    }

    /// The process currently holding the management session.
    pub fn current_manager(&self) -> Option<ManagerInfo> {
        self.manager.guard_snapshot()
    }

    /// Delivers the module handle to `uid` again.
    pub fn push_module(&self, uid: u32) {
        self.dispatcher.push(uid);
    }

    pub fn start_broker(&self) -> anyhow::Result<()> {
        self.broker.start()
    }

    pub fn broker_alive(&self) -> bool {
        self.broker.is_alive()
    }

    /// Respawns dead broker workers.
    pub fn supervise_broker(&self) -> anyhow::Result<usize> {
        self.broker.restart_dead()
    }
}
