// src/registry.rs

//! Process-local client of the system service registry.
//!
//! Lookups go through a lazily connected directory singleton and land in a
//! per-name cache. Neither notices on its own that the registry host died:
//! after a host restart both still point at dead objects until
//! [`CacheInvalidator::invalidate`] purges them.

use crate::binder::BinderRef;
use crate::error::Result;
use crate::utils::lock;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The remote service directory, reached through one connection to its host.
pub trait ServiceDirectory: Send + Sync {
    fn check_service(&self, name: &str) -> Option<BinderRef>;
}

/// Opens a connection to the registry host, if it is up.
pub trait DirectoryConnector: Send + Sync {
    fn connect(&self) -> Option<Arc<dyn ServiceDirectory>>;
}

pub trait ServiceRegistry: Send + Sync {
    fn get_service(&self, name: &str) -> Option<BinderRef>;
}

/// Forgets everything a registry client resolved so far.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self) -> Result<()>;
}

pub struct ServiceManagerClient {
    connector: Arc<dyn DirectoryConnector>,
    singleton: Mutex<Option<Arc<dyn ServiceDirectory>>>,
    cache: Mutex<HashMap<String, BinderRef>>,
}

impl ServiceManagerClient {
    pub fn new(connector: Arc<dyn DirectoryConnector>) -> Self {
        Self {
            connector,
            singleton: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn directory(&self) -> Option<Arc<dyn ServiceDirectory>> {
        let mut singleton = lock(&self.singleton);
        if singleton.is_none() {
            *singleton = self.connector.connect();
        }
        singleton.clone()
    }

    pub fn cached_names(&self) -> Vec<String> {
        lock(&self.cache).keys().cloned().collect()
    }
}

impl ServiceRegistry for ServiceManagerClient {
    fn get_service(&self, name: &str) -> Option<BinderRef> {
        if let Some(binder) = lock(&self.cache).get(name) {
            return Some(binder.clone());
        }
        let binder = self.directory()?.check_service(name)?;
        debug!("Resolved service {} to {:?}", name, binder.id());
        lock(&self.cache).insert(name.to_string(), binder.clone());
        Some(binder)
    }
}

impl CacheInvalidator for ServiceManagerClient {
    fn invalidate(&self) -> Result<()> {
        lock(&self.singleton).take();
        lock(&self.cache).clear();
        info!("Cleared service manager singleton and lookup cache");
        Ok(())
    }
}
