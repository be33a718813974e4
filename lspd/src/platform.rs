// src/platform.rs

//! Contracts of the platform services the daemon drives.
//!
//! The activity manager and content providers live in the registry host;
//! the daemon only ever talks to them through these traits.

use crate::binder::BinderRef;
use crate::constants::{SDK_Q, SDK_R, SDK_S, SYSTEM_PACKAGE_NAME, SYSTEM_UID};
use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Launch or bind request for an app component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Intent {
    pub action: Option<String>,
    /// Flattened `package/class` name.
    pub component: Option<String>,
    pub categories: BTreeSet<String>,
    pub mime_type: Option<String>,
}

impl Intent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.add_category(category);
        self
    }

    pub fn add_category(&mut self, category: impl Into<String>) {
        self.categories.insert(category.into());
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains(category)
    }
}

/// Keyed handle extras of a provider call.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    binders: BTreeMap<String, BinderRef>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_binder(&mut self, key: &str, binder: BinderRef) {
        self.binders.insert(key.to_string(), binder);
    }

    pub fn get_binder(&self, key: &str) -> Option<BinderRef> {
        self.binders.get(key).cloned()
    }
}

/// Who a provider call is made on behalf of. The call signature changed
/// twice across platform versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCaller {
    /// S and later.
    AttributionSource { uid: u32, package: String },
    /// R: package plus attribution tag.
    PackageWithFeature {
        package: String,
        feature: Option<String>,
    },
    /// Q.
    Package { package: String },
}

impl ProviderCaller {
    /// The platform identity in the shape `sdk` expects; `None` before Q.
    pub fn for_sdk(sdk: i32) -> Option<Self> {
        let package = SYSTEM_PACKAGE_NAME.to_string();
        if sdk >= SDK_S {
            Some(ProviderCaller::AttributionSource {
                uid: SYSTEM_UID,
                package,
            })
        } else if sdk == SDK_R {
            Some(ProviderCaller::PackageWithFeature {
                package,
                feature: None,
            })
        } else if sdk == SDK_Q {
            Some(ProviderCaller::Package { package })
        } else {
            None
        }
    }
}

pub trait ContentProvider: Send + Sync {
    fn call(
        &self,
        caller: &ProviderCaller,
        authority: &str,
        method: &str,
        arg: Option<&str>,
        extras: &Bundle,
    ) -> Result<Option<Bundle>>;
}

/// Token for a service binding, handed back to unbind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceBinding(pub u64);

pub trait ActivityManager: Send + Sync {
    fn force_stop_package(&self, package: &str, user_id: u32) -> Result<()>;

    /// Starts `intent` on behalf of `caller_package`.
    fn start_activity_as_user(&self, caller_package: &str, intent: &Intent, user_id: u32)
    -> Result<()>;

    /// Binds the service named by `intent`, creating it if needed.
    fn bind_service(
        &self,
        intent: &Intent,
        caller_package: &str,
        user_id: u32,
    ) -> Result<ServiceBinding>;

    fn unbind_service(&self, binding: ServiceBinding) -> Result<()>;

    fn get_content_provider(
        &self,
        authority: &str,
        user_id: u32,
    ) -> Result<Option<Arc<dyn ContentProvider>>>;
}
