// src/module_service.rs

//! Per-module service handles and their delivery to module processes.
//!
//! Every enabled module owns a [`ModuleService`]. When a process of one of
//! the module's uids starts, [`ModuleDispatcher`] hands the module its handle
//! by calling `SendBinder` on the provider the module exports under
//! `<package>.XposedService`.

use crate::auth::{PeerIdentity, check_module_target};
use crate::binder::{BinderRef, LocalBinder, TransactionHandler};
use crate::constants::{
    AUTHORITY_SUFFIX, BINDER_EXTRA_KEY, IMPLEMENTATION_NAME, MODULE_SERVICE_DESCRIPTOR,
    PER_USER_RANGE, SEND_BINDER, TransactionFlags, VERSION_CODE, VERSION_NAME,
    XPOSED_API_VERSION,
};
use crate::error::{Error, Result};
use crate::parcel::Parcel;
use crate::platform::{ActivityManager, Bundle, ProviderCaller};
use crate::utils::lock;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

/// Read-only view of the module configuration.
pub trait ConfigSource: Send + Sync {
    fn enabled_modules(&self) -> Vec<String>;

    /// Packages the module is enabled for, or `None` if it is not enabled.
    fn get_module_scope(&self, package: &str) -> Option<Vec<String>>;

    /// The enabled module owning `uid`.
    fn get_module(&self, uid: u32) -> Option<Arc<ModuleRegistration>>;
}

pub struct ModuleRegistration {
    pub package_name: String,
    pub uids: BTreeSet<u32>,
    pub service: Arc<ModuleService>,
}

impl ModuleRegistration {
    pub fn new(package_name: &str, uids: impl IntoIterator<Item = u32>, service: Arc<ModuleService>) -> Self {
        Self {
            package_name: package_name.to_string(),
            uids: uids.into_iter().collect(),
            service,
        }
    }
}

pub struct ModuleService {
    package_name: String,
    /// Private directory backing the module's remote files.
    files_dir: PathBuf,
    config: Weak<dyn ConfigSource>,
    binder: Arc<LocalBinder>,
}

struct ModuleServiceHandler {
    service: Weak<ModuleService>,
}

impl ModuleServiceHandler {
    const GET_API_VERSION: u32 = 1;
    const IMPLEMENTATION_NAME: u32 = 2;
    const IMPLEMENTATION_VERSION: u32 = 3;
    const IMPLEMENTATION_VERSION_CODE: u32 = 4;
    const GET_SCOPE: u32 = 5;
}

impl TransactionHandler for ModuleServiceHandler {
    fn on_transact(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        _flags: TransactionFlags,
        _caller: &PeerIdentity,
    ) -> Result<bool> {
        data.enforce_interface(MODULE_SERVICE_DESCRIPTOR)?;
        let Some(service) = self.service.upgrade() else {
            return Err(Error::PeerGone);
        };
        match code {
            Self::GET_API_VERSION => {
                reply.write_no_exception();
                reply.write_i64(XPOSED_API_VERSION.into());
            }
            Self::IMPLEMENTATION_NAME => {
                reply.write_no_exception();
                reply.write_string16(Some(IMPLEMENTATION_NAME));
            }
            Self::IMPLEMENTATION_VERSION => {
                reply.write_no_exception();
                reply.write_string16(Some(VERSION_NAME));
            }
            Self::IMPLEMENTATION_VERSION_CODE => {
                reply.write_no_exception();
                reply.write_i64(VERSION_CODE.into());
            }
            Self::GET_SCOPE => {
                reply.write_no_exception();
                reply.write_string_list(&service.scope());
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl ModuleService {
    pub fn new(package_name: &str, files_dir: PathBuf, config: Weak<dyn ConfigSource>) -> Arc<Self> {
        Arc::new_cyclic(|service: &Weak<ModuleService>| Self {
            package_name: package_name.to_string(),
            files_dir,
            config,
            binder: LocalBinder::new(
                MODULE_SERVICE_DESCRIPTOR,
                Arc::new(ModuleServiceHandler {
                    service: service.clone(),
                }),
                PeerIdentity::current(),
            ),
        })
    }

    pub fn binder(&self) -> BinderRef {
        self.binder.clone()
    }

    pub fn scope(&self) -> Vec<String> {
        self.config
            .upgrade()
            .and_then(|config| config.get_module_scope(&self.package_name))
            .unwrap_or_default()
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            warn!("{} asked for {:?} outside its directory", self.package_name, path);
            return Err(Error::PeerDenied {
                operation: "access files outside its directory",
            });
        }
        Ok(self.files_dir.join(relative))
    }

    /// Opens `path` under the module's directory, creating it when writable.
    pub fn open_remote_file(&self, path: &str, writable: bool) -> Result<File> {
        let absolute = self.resolve(path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::resource(parent.display().to_string(), e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(&absolute)
            .map_err(|e| Error::resource(absolute.display().to_string(), e))
    }

    /// Returns whether a file was removed.
    pub fn delete_remote_file(&self, path: &str) -> Result<bool> {
        let absolute = self.resolve(path)?;
        match fs::remove_file(&absolute) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::resource(absolute.display().to_string(), e)),
        }
    }
}

#[derive(Default)]
struct UidSets {
    /// Uids that hold their module handle.
    live: HashSet<u32>,
    /// Uids with a dispatch in progress.
    in_flight: HashSet<u32>,
}

pub struct ModuleDispatcher {
    config: Arc<dyn ConfigSource>,
    activity: Arc<dyn ActivityManager>,
    caller: Option<ProviderCaller>,
    uids: Mutex<UidSets>,
}

impl ModuleDispatcher {
    /// `sdk` selects the provider call signature.
    pub fn new(config: Arc<dyn ConfigSource>, activity: Arc<dyn ActivityManager>, sdk: i32) -> Self {
        let caller = ProviderCaller::for_sdk(sdk);
        if caller.is_none() {
            warn!("Module handles cannot be delivered on sdk {}", sdk);
        }
        Self {
            config,
            activity,
            caller,
            uids: Mutex::new(UidSets::default()),
        }
    }

    pub fn is_live(&self, uid: u32) -> bool {
        lock(&self.uids).live.contains(&uid)
    }

    /// A process of `uid` started.
    pub fn uid_starts(&self, uid: u32) {
        {
            let mut uids = lock(&self.uids);
            if uids.live.contains(&uid) || !uids.in_flight.insert(uid) {
                return;
            }
        }

        let delivered = match check_module_target(uid, self.config.get_module(uid)) {
            Ok(module) => match self.send_binder(&module, uid) {
                Ok(true) => {
                    debug!("Sent module binder to {}", module.package_name);
                    true
                }
                Ok(false) => {
                    warn!("Failed to send module binder to {}", module.package_name);
                    false
                }
                Err(e) => {
                    warn!("Failed to send module binder for uid {}: {}", uid, e);
                    false
                }
            },
            Err(_) => false,
        };

        let mut uids = lock(&self.uids);
        // A uid_gone in between wins.
        if uids.in_flight.remove(&uid) && delivered {
            uids.live.insert(uid);
        }
    }

    /// Every process of `uid` is gone.
    pub fn uid_gone(&self, uid: u32) {
        let mut uids = lock(&self.uids);
        uids.live.remove(&uid);
        uids.in_flight.remove(&uid);
    }

    /// Delivers the handle to `uid` again even if it already has one.
    pub fn push(&self, uid: u32) {
        lock(&self.uids).live.remove(&uid);
        self.uid_starts(uid);
    }

    /// Forgets every delivery; the receiving processes are gone with the host.
    pub fn reset(&self) {
        let enabled = self.config.enabled_modules().len();
        let mut uids = lock(&self.uids);
        info!(
            "Forgetting {} module handle deliveries ({} modules enabled)",
            uids.live.len(),
            enabled
        );
        uids.live.clear();
        uids.in_flight.clear();
    }

    fn send_binder(&self, module: &ModuleRegistration, uid: u32) -> Result<bool> {
        let Some(caller) = &self.caller else {
            return Ok(false);
        };
        let user_id = uid / PER_USER_RANGE;
        let authority = format!("{}{}", module.package_name, AUTHORITY_SUFFIX);
        let Some(provider) = self.activity.get_content_provider(&authority, user_id)? else {
            debug!("No service provider for {}", module.package_name);
            return Ok(false);
        };
        let mut extras = Bundle::new();
        extras.put_binder(BINDER_EXTRA_KEY, module.service.binder());
        let reply = provider.call(caller, &authority, SEND_BINDER, None, &extras)?;
        Ok(reply.is_some())
    }
}
