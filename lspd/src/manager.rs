// src/manager.rs

//! Launch arbitration for the manager injected into a host package.
//!
//! Starting the injected manager means stopping whatever instance of the
//! target package is running and starting it again. Stopping it from the
//! launch hook itself would deadlock the host, so the first launch is denied
//! and re-issued from a worker thread with a one-shot session token added as
//! an intent category. The token is what lets that relaunch through.
//!
//! ```text
//!            LAUNCH_MANAGER              process spawned
//!   Idle ─────────────────▶ PendingManager ─────────────▶ ManagerRunning
//!    ▲   (deny + relaunch)       │  timeout                    │
//!    └───────────────────────────┘◀── guard death or timeout ──┘
//! ```

use crate::auth::PeerIdentity;
use crate::binder::{BinderId, BinderRef, DeathRecipient, LocalBinder, TransactionHandler};
use crate::constants::{
    BRIDGE_SERVICE_NAME, LAUNCH_MANAGER_CATEGORY, MANAGER_INJECTED_PKG_NAME,
    MANAGER_INJECTED_UID, SYSTEM_PACKAGE_NAME, TransactionFlags, VENDOR_HELPER_COMPONENT,
    VERSION_CODE, VERSION_NAME, XPOSED_API_VERSION,
};
use crate::error::Result;
use crate::liveness::Linked;
use crate::parcel::Parcel;
use crate::platform::{ActivityManager, Intent, ServiceBinding};
use crate::utils::{is_miui, lock};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const MANAGER_DESCRIPTOR: &str = "org.lsposed.lspd.ILSPManagerService";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    /// Our relaunch carrying `token` is on its way.
    PendingManager { token: Uuid, since: Instant },
    /// `pid` is set until the manager picks up its handle.
    ManagerRunning {
        token: Uuid,
        pid: Option<i32>,
        since: Instant,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// How long a denied launch waits for its relaunch, and how long a
    /// spawned manager has to pick up its handle, before giving up.
    pub pending_timeout: Duration,
    /// Keep the vendor helper bound while a manager session is open.
    pub bind_vendor_helper: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(10),
            bind_vendor_helper: is_miui(),
        }
    }
}

/// Who currently holds the management session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerInfo {
    pub pid: i32,
    pub uid: u32,
}

/// Keeps a manager session alive as long as its heartbeat handle is.
struct ManagerGuard {
    heartbeat: Linked,
    info: ManagerInfo,
    binding: Option<ServiceBinding>,
}

struct Inner {
    state: LaunchState,
    guard: Option<ManagerGuard>,
}

impl Inner {
    /// Falls back to idle from a state nothing will ever complete.
    fn expire_stale(&mut self, timeout: Duration) {
        let guarded = self.live_guard().is_some();
        match &self.state {
            LaunchState::PendingManager { token, since } if since.elapsed() >= timeout => {
                warn!("Relaunch {} never arrived, back to idle", token);
                self.state = LaunchState::Idle;
            }
            LaunchState::ManagerRunning {
                pid: Some(pid),
                since,
                ..
            } if !guarded && since.elapsed() >= timeout => {
                warn!("Manager pid {} never picked up its handle, back to idle", pid);
                self.state = LaunchState::Idle;
            }
            LaunchState::ManagerRunning { pid: None, .. } if !guarded => {
                debug!("Manager session is gone, back to idle");
                self.state = LaunchState::Idle;
            }
            _ => {}
        }
    }

    fn token(&self) -> Option<Uuid> {
        match self.state {
            LaunchState::Idle => None,
            LaunchState::PendingManager { token, .. } | LaunchState::ManagerRunning { token, .. } => {
                Some(token)
            }
        }
    }

    fn live_guard(&self) -> Option<&ManagerGuard> {
        self.guard.as_ref().filter(|guard| guard.heartbeat.is_alive())
    }

    fn post_start(&self, pid: i32, uid: u32) -> bool {
        matches!(self.state, LaunchState::ManagerRunning { pid: Some(p), .. } if p == pid)
            && uid == MANAGER_INJECTED_UID
    }
}

pub struct ManagerService {
    activity: Arc<dyn ActivityManager>,
    config: ManagerConfig,
    inner: Mutex<Inner>,
    guard_recipient: Arc<dyn DeathRecipient>,
    binder: Arc<LocalBinder>,
}

struct GuardDeathRecipient {
    service: Weak<ManagerService>,
}

impl DeathRecipient for GuardDeathRecipient {
    fn binder_died(&self, who: BinderId) {
        if let Some(service) = self.service.upgrade() {
            service.on_guard_died(who);
        }
    }
}

/// Transaction surface of the management handle.
struct ManagerHandler {
    service: Weak<ManagerService>,
}

impl ManagerHandler {
    const GET_API_VERSION: u32 = 1;
    const GET_VERSION_CODE: u32 = 2;
    const GET_VERSION_NAME: u32 = 3;
    const IS_RUNNING_MANAGER: u32 = 4;
}

impl TransactionHandler for ManagerHandler {
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        _flags: TransactionFlags,
        caller: &PeerIdentity,
    ) -> Result<bool> {
        data.enforce_interface(MANAGER_DESCRIPTOR)?;
        match code {
            Self::GET_API_VERSION => {
                reply.write_no_exception();
                reply.write_i32(XPOSED_API_VERSION);
            }
            Self::GET_VERSION_CODE => {
                reply.write_no_exception();
                reply.write_i32(VERSION_CODE);
            }
            Self::GET_VERSION_NAME => {
                reply.write_no_exception();
                reply.write_string16(Some(VERSION_NAME));
            }
            Self::IS_RUNNING_MANAGER => {
                let running = self
                    .service
                    .upgrade()
                    .is_some_and(|service| service.is_running_manager(caller.pid, caller.uid));
                reply.write_no_exception();
                reply.write_i32(running as i32);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl ManagerService {
    pub fn new(activity: Arc<dyn ActivityManager>, config: ManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|service: &Weak<ManagerService>| Self {
            activity,
            config,
            inner: Mutex::new(Inner {
                state: LaunchState::Idle,
                guard: None,
            }),
            guard_recipient: Arc::new(GuardDeathRecipient {
                service: service.clone(),
            }),
            binder: LocalBinder::new(
                MANAGER_DESCRIPTOR,
                Arc::new(ManagerHandler {
                    service: service.clone(),
                }),
                PeerIdentity::current(),
            ),
        })
    }

    /// The management handle published over the bridge.
    pub fn binder(&self) -> BinderRef {
        self.binder.clone()
    }

    pub fn state(&self) -> LaunchState {
        let mut inner = lock(&self.inner);
        inner.expire_stale(self.config.pending_timeout);
        inner.state.clone()
    }

    /// Decides whether a launch of `package` may proceed.
    pub fn pre_start_manager(&self, package: &str, intent: &Intent) -> LaunchDecision {
        if package != MANAGER_INJECTED_PKG_NAME {
            return LaunchDecision::Allow;
        }
        debug!("Starting target app of parasitic manager");

        let mut inner = lock(&self.inner);
        inner.expire_stale(self.config.pending_timeout);
        let ours = inner
            .token()
            .is_some_and(|token| intent.has_category(&token.to_string()));

        if intent.has_category(LAUNCH_MANAGER_CATEGORY) {
            debug!("Requesting launch of manager");
            let running = matches!(inner.state, LaunchState::ManagerRunning { .. })
                || inner
                    .live_guard()
                    .is_some_and(|guard| guard.info.uid == MANAGER_INJECTED_UID);
            if ours || running {
                debug!("Manager is still running or is on its way");
                return LaunchDecision::Allow;
            }
            if let LaunchState::PendingManager { .. } = inner.state {
                debug!("Relaunch of manager is already on its way");
                return LaunchDecision::Deny;
            }
            let token = Uuid::new_v4();
            inner.state = LaunchState::PendingManager {
                token,
                since: Instant::now(),
            };
            drop(inner);
            self.stop_and_start(package, intent.clone(), Some(token));
            debug!("Requested to launch manager");
            LaunchDecision::Deny
        } else if let LaunchState::PendingManager { .. } = inner.state {
            if ours {
                return LaunchDecision::Allow;
            }
            debug!("Previous request is not yet done");
            LaunchDecision::Deny
        } else {
            debug!("Launching the target app normally");
            LaunchDecision::Allow
        }
    }

    /// Force-stops `package` and starts `intent` again, off the caller's thread.
    fn stop_and_start(&self, package: &str, mut intent: Intent, token: Option<Uuid>) {
        let activity = self.activity.clone();
        let package = package.to_string();
        thread::spawn(move || {
            if let Err(e) = activity.force_stop_package(&package, 0) {
                error!("Failed to stop {}: {}", package, e);
                return;
            }
            debug!("Stopped old package");
            if let Some(token) = token {
                intent.add_category(token.to_string());
            }
            match activity.start_activity_as_user(SYSTEM_PACKAGE_NAME, &intent, 0) {
                Ok(()) => debug!("Relaunching {}", package),
                Err(e) => error!("Failed to relaunch {}: {}", package, e),
            }
        });
    }

    /// Relaunches the target package without injecting the manager.
    pub fn restart_for(&self, intent: &Intent) {
        self.stop_and_start(MANAGER_INJECTED_PKG_NAME, intent.clone(), None);
    }

    /// Whether the process being spawned should become the manager.
    pub fn should_start_manager(&self, pid: i32, uid: u32, process_name: &str) -> bool {
        if uid != MANAGER_INJECTED_UID || process_name != MANAGER_INJECTED_PKG_NAME {
            return false;
        }
        let mut inner = lock(&self.inner);
        inner.expire_stale(self.config.pending_timeout);
        let LaunchState::PendingManager { token, .. } = inner.state else {
            return false;
        };
        inner.state = LaunchState::ManagerRunning {
            token,
            pid: Some(pid),
            since: Instant::now(),
        };
        info!(
            "Starting injected manager: pid = {} uid = {} processName = {}",
            pid, uid, process_name
        );
        true
    }

    /// Whether `pid`/`uid` is the manager process still waiting for its handle.
    pub fn post_start_manager(&self, pid: i32, uid: u32) -> bool {
        lock(&self.inner).post_start(pid, uid)
    }

    /// Opens a management session for `pid`/`uid` held open by `heartbeat`.
    pub fn obtain_manager_binder(&self, heartbeat: BinderRef, pid: i32, uid: u32) -> Result<BinderRef> {
        let binding = if self.config.bind_vendor_helper {
            let helper = Intent::new().with_component(VENDOR_HELPER_COMPONENT);
            match self.activity.bind_service(&helper, SYSTEM_PACKAGE_NAME, 0) {
                Ok(binding) => Some(binding),
                Err(e) => {
                    warn!("Failed to bind vendor helper: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let heartbeat = match Linked::link(heartbeat, self.guard_recipient.clone()) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                error!("Manager heartbeat of pid {} is already dead", pid);
                self.release(binding);
                return Err(e);
            }
        };

        let replaced = {
            let mut inner = lock(&self.inner);
            if inner.post_start(pid, uid) {
                // The guard now carries the pid.
                if let LaunchState::ManagerRunning { pid: pending, .. } = &mut inner.state {
                    *pending = None;
                }
            }
            inner.guard.replace(ManagerGuard {
                heartbeat,
                info: ManagerInfo { pid, uid },
                binding,
            })
        };
        if let Some(old) = replaced {
            debug!("Replacing manager session of pid {}", old.info.pid);
            self.release(old.binding);
        }
        Ok(self.binder())
    }

    pub fn is_running_manager(&self, pid: i32, uid: u32) -> bool {
        let inner = lock(&self.inner);
        inner.post_start(pid, uid)
            || inner
                .live_guard()
                .is_some_and(|guard| guard.info == ManagerInfo { pid, uid })
    }

    /// The live management session, if any.
    pub fn guard_snapshot(&self) -> Option<ManagerInfo> {
        lock(&self.inner).live_guard().map(|guard| guard.info)
    }

    /// The registry host went away and took every session with it.
    pub fn on_system_server_died(&self) {
        let guard = {
            let mut inner = lock(&self.inner);
            inner.state = LaunchState::Idle;
            inner.guard.take()
        };
        // Bindings died with the host; nothing to unbind.
        if let Some(guard) = guard {
            info!(
                "Dropping manager session of pid {} after {} died",
                guard.info.pid, BRIDGE_SERVICE_NAME
            );
        }
    }

    fn on_guard_died(&self, who: BinderId) {
        let guard = {
            let mut inner = lock(&self.inner);
            if inner.guard.as_ref().map(|guard| guard.heartbeat.id()) != Some(who) {
                return;
            }
            if let LaunchState::ManagerRunning { .. } = inner.state {
                inner.state = LaunchState::Idle;
            }
            inner.guard.take()
        };
        if let Some(guard) = guard {
            info!("Manager pid {} is gone", guard.info.pid);
            self.release(guard.binding);
        }
    }

    fn release(&self, binding: Option<ServiceBinding>) {
        if let Some(binding) = binding {
            if let Err(e) = self.activity.unbind_service(binding) {
                warn!("Failed to unbind vendor helper: {}", e);
            }
        }
    }
}
