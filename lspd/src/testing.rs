// src/testing.rs

//! Fakes of the platform collaborators, shared by the unit tests.

use crate::auth::{Authorizer, PackageOracle, PeerIdentity};
use crate::binder::{Binder, BinderId, BinderRef, DeathRecipient, LocalBinder, TransactionHandler};
use crate::bridge::{BridgeListener, BridgeServer, InterceptingHandler};
use crate::constants::{BRIDGE_DESCRIPTOR, BRIDGE_SERVICE_NAME, SYSTEM_UID, TransactionFlags};
use crate::error::{Error, Result};
use crate::module_service::{ConfigSource, ModuleRegistration, ModuleService};
use crate::parcel::Parcel;
use crate::platform::{ActivityManager, Bundle, ContentProvider, Intent, ProviderCaller, ServiceBinding};
use crate::registry::{
    CacheInvalidator, DirectoryConnector, ServiceDirectory, ServiceManagerClient, ServiceRegistry,
};
use crate::utils::lock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub const INSTALLER_UID: u32 = 10_100;

pub fn daemon_identity() -> PeerIdentity {
    PeerIdentity::new(0, 500)
}

pub fn system_identity() -> PeerIdentity {
    PeerIdentity::new(SYSTEM_UID, 600)
}

// --- Handlers and recipients ---

pub struct NoopHandler;

impl TransactionHandler for NoopHandler {
    fn on_transact(
        &self,
        _code: u32,
        _data: &mut Parcel,
        _reply: &mut Parcel,
        _flags: TransactionFlags,
        _caller: &PeerIdentity,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Accepts everything and remembers the codes it saw.
#[derive(Default)]
pub struct RecordingHandler {
    codes: Mutex<Vec<u32>>,
}

impl RecordingHandler {
    pub fn codes(&self) -> Vec<u32> {
        lock(&self.codes).clone()
    }
}

impl TransactionHandler for RecordingHandler {
    fn on_transact(
        &self,
        code: u32,
        _data: &mut Parcel,
        _reply: &mut Parcel,
        _flags: TransactionFlags,
        _caller: &PeerIdentity,
    ) -> Result<bool> {
        lock(&self.codes).push(code);
        Ok(true)
    }
}

#[derive(Default)]
pub struct CountingRecipient {
    deaths: AtomicUsize,
}

impl CountingRecipient {
    pub fn deaths(&self) -> usize {
        self.deaths.load(Ordering::SeqCst)
    }
}

impl DeathRecipient for CountingRecipient {
    fn binder_died(&self, _who: BinderId) {
        self.deaths.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts death subscriptions made through it.
pub struct CountingBinder {
    inner: Arc<LocalBinder>,
    links: AtomicUsize,
    unlinks: AtomicUsize,
}

impl CountingBinder {
    pub fn wrap(inner: Arc<LocalBinder>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            links: AtomicUsize::new(0),
            unlinks: AtomicUsize::new(0),
        })
    }

    pub fn links(&self) -> usize {
        self.links.load(Ordering::SeqCst)
    }

    pub fn unlinks(&self) -> usize {
        self.unlinks.load(Ordering::SeqCst)
    }
}

impl Binder for CountingBinder {
    fn id(&self) -> BinderId {
        self.inner.id()
    }

    fn interface_descriptor(&self) -> String {
        self.inner.interface_descriptor()
    }

    fn ping(&self) -> bool {
        self.inner.ping()
    }

    fn transact(
        &self,
        code: u32,
        data: &Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
    ) -> Result<bool> {
        self.inner.transact(code, data, reply, flags)
    }

    fn link_to_death(&self, recipient: Arc<dyn DeathRecipient>) -> Result<()> {
        self.inner.link_to_death(recipient)?;
        self.links.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unlink_to_death(&self, recipient: &Arc<dyn DeathRecipient>) -> bool {
        self.unlinks.fetch_add(1, Ordering::SeqCst);
        self.inner.unlink_to_death(recipient)
    }
}

// --- Packages ---

pub struct FakePackages {
    installer: Option<u32>,
}

impl FakePackages {
    pub fn installer(uid: u32) -> Self {
        Self {
            installer: Some(uid),
        }
    }

    /// A package service that fails every lookup.
    pub fn broken() -> Self {
        Self { installer: None }
    }
}

impl PackageOracle for FakePackages {
    fn is_installer(&self, uid: u32) -> Result<bool> {
        match self.installer {
            Some(installer) => Ok(installer == uid),
            None => Err(Error::Transport("package service unavailable".to_string())),
        }
    }
}

// --- Registry ---

#[derive(Default)]
struct DirectoryState {
    services: Mutex<HashMap<String, Arc<LocalBinder>>>,
    connections: AtomicUsize,
}

/// Service directory whose lookups hand out references stamped with `caller`.
pub struct FakeDirectory {
    state: Arc<DirectoryState>,
    caller: PeerIdentity,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(DirectoryState::default()),
            caller: daemon_identity(),
        })
    }

    /// The same directory as seen by `caller`.
    pub fn view(&self, caller: PeerIdentity) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::clone(&self.state),
            caller,
        })
    }

    pub fn register(&self, name: &str, binder: Arc<LocalBinder>) {
        lock(&self.state.services).insert(name.to_string(), binder);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl DirectoryConnector for FakeDirectory {
    fn connect(&self) -> Option<Arc<dyn ServiceDirectory>> {
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Some(self.view(self.caller.clone()))
    }
}

impl ServiceDirectory for FakeDirectory {
    fn check_service(&self, name: &str) -> Option<BinderRef> {
        lock(&self.state.services)
            .get(name)
            .map(|binder| -> BinderRef { binder.proxy(self.caller.clone()) })
    }
}

/// Always resolves the bridge service to one handle.
pub struct StaticRegistry {
    binder: BinderRef,
}

impl StaticRegistry {
    pub fn serving(binder: BinderRef) -> Arc<Self> {
        Arc::new(Self { binder })
    }
}

impl ServiceRegistry for StaticRegistry {
    fn get_service(&self, name: &str) -> Option<BinderRef> {
        (name == BRIDGE_SERVICE_NAME).then(|| self.binder.clone())
    }
}

#[derive(Default)]
pub struct CountingInvalidator {
    count: AtomicUsize,
    inner: Option<Arc<dyn CacheInvalidator>>,
}

impl CountingInvalidator {
    pub fn forwarding(inner: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            inner: Some(inner),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl CacheInvalidator for CountingInvalidator {
    fn invalidate(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.invalidate(),
            None => Ok(()),
        }
    }
}

// --- Bridge ---

#[derive(Default)]
pub struct RecordingListener {
    restarts: AtomicUsize,
    responses: Mutex<Vec<bool>>,
}

impl RecordingListener {
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn responses(&self) -> Vec<bool> {
        lock(&self.responses).clone()
    }
}

impl BridgeListener for RecordingListener {
    fn on_system_server_restarted(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_response_from_bridge_service(&self, response: bool) {
        lock(&self.responses).push(response);
    }
}

struct FlakyHandler {
    calls: AtomicUsize,
    failures: usize,
    fatal: bool,
}

impl TransactionHandler for FlakyHandler {
    fn on_transact(
        &self,
        _code: u32,
        _data: &mut Parcel,
        reply: &mut Parcel,
        _flags: TransactionFlags,
        _caller: &PeerIdentity,
    ) -> Result<bool> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(if self.fatal {
                Error::PeerGone
            } else {
                Error::Transport("EAGAIN".to_string())
            });
        }
        reply.write_no_exception();
        Ok(true)
    }
}

/// Bridge host that fails its first transactions.
pub struct FlakyHost {
    handler: Arc<FlakyHandler>,
    binder: Arc<LocalBinder>,
}

impl FlakyHost {
    pub fn failing(failures: usize) -> Self {
        Self::with(failures, false)
    }

    /// Host whose first `failures` transactions report the peer as gone.
    pub fn dying(failures: usize) -> Self {
        Self::with(failures, true)
    }

    fn with(failures: usize, fatal: bool) -> Self {
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            failures,
            fatal,
        });
        let binder = LocalBinder::new(BRIDGE_DESCRIPTOR, handler.clone(), daemon_identity());
        Self { handler, binder }
    }

    pub fn binder(&self) -> BinderRef {
        self.binder.clone()
    }

    pub fn calls(&self) -> usize {
        self.handler.calls.load(Ordering::SeqCst)
    }
}

/// A registry host running the bridge in front of its own dispatcher.
pub struct HostHarness {
    directory: Arc<FakeDirectory>,
    daemon: Arc<ServiceManagerClient>,
    invalidator: Arc<CountingInvalidator>,
    host: Mutex<Arc<LocalBinder>>,
    server: Mutex<Arc<BridgeServer>>,
}

impl HostHarness {
    fn spawn_host() -> (Arc<BridgeServer>, Arc<LocalBinder>) {
        let server = BridgeServer::new(Authorizer::new(Arc::new(FakePackages::installer(
            INSTALLER_UID,
        ))));
        let host = LocalBinder::new(
            BRIDGE_DESCRIPTOR,
            Arc::new(InterceptingHandler::new(server.clone(), Arc::new(NoopHandler))),
            system_identity(),
        );
        (server, host)
    }

    pub fn start() -> Self {
        let directory = FakeDirectory::new();
        let (server, host) = Self::spawn_host();
        directory.register(BRIDGE_SERVICE_NAME, host.clone());
        let daemon = Arc::new(ServiceManagerClient::new(directory.clone()));
        let invalidator = Arc::new(CountingInvalidator::forwarding(daemon.clone()));
        Self {
            directory,
            daemon,
            invalidator,
            host: Mutex::new(host),
            server: Mutex::new(server),
        }
    }

    /// Registry client of the root daemon.
    pub fn daemon_registry(&self) -> Arc<dyn ServiceRegistry> {
        self.daemon.clone()
    }

    pub fn invalidator(&self) -> Arc<dyn CacheInvalidator> {
        self.invalidator.clone()
    }

    pub fn invalidations(&self) -> usize {
        self.invalidator.count()
    }

    /// Registry client of the app that installed the manager.
    pub fn installer_registry(&self) -> Arc<dyn ServiceRegistry> {
        self.registry_for(PeerIdentity::new(INSTALLER_UID, 300))
    }

    pub fn app_registry(&self, uid: u32) -> Arc<dyn ServiceRegistry> {
        self.registry_for(PeerIdentity::new(uid, 400))
    }

    fn registry_for(&self, caller: PeerIdentity) -> Arc<dyn ServiceRegistry> {
        Arc::new(ServiceManagerClient::new(self.directory.view(caller)))
    }

    pub fn server(&self) -> Arc<BridgeServer> {
        lock(&self.server).clone()
    }

    /// Kills the host; a fresh one is registered before the old one dies.
    pub fn restart_host(&self) {
        let (server, host) = Self::spawn_host();
        self.directory.register(BRIDGE_SERVICE_NAME, host.clone());
        *lock(&self.server) = server;
        let old = std::mem::replace(&mut *lock(&self.host), host);
        old.die();
    }
}

// --- Platform ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmCall {
    ForceStop(String, u32),
    Start(Intent),
    Bind(Intent, ServiceBinding),
    Unbind(ServiceBinding),
    GetProvider(String, u32),
}

type StartHook = Arc<dyn Fn(&Intent) + Send + Sync>;

#[derive(Default)]
pub struct FakeActivityManager {
    calls: Mutex<Vec<AmCall>>,
    on_start: Mutex<Option<StartHook>>,
    providers: Mutex<HashMap<String, Arc<dyn ContentProvider>>>,
    next_binding: AtomicU64,
}

impl FakeActivityManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<AmCall> {
        lock(&self.calls).clone()
    }

    /// Runs `hook` for every started activity, after recording it.
    pub fn on_start(&self, hook: impl Fn(&Intent) + Send + Sync + 'static) {
        *lock(&self.on_start) = Some(Arc::new(hook));
    }

    pub fn add_provider(&self, authority: &str, provider: Arc<dyn ContentProvider>) {
        lock(&self.providers).insert(authority.to_string(), provider);
    }

    fn record(&self, call: AmCall) {
        lock(&self.calls).push(call);
    }
}

impl ActivityManager for FakeActivityManager {
    fn force_stop_package(&self, package: &str, user_id: u32) -> Result<()> {
        self.record(AmCall::ForceStop(package.to_string(), user_id));
        Ok(())
    }

    fn start_activity_as_user(&self, _caller_package: &str, intent: &Intent, _user_id: u32) -> Result<()> {
        self.record(AmCall::Start(intent.clone()));
        let hook = lock(&self.on_start).clone();
        if let Some(hook) = hook {
            hook(intent);
        }
        Ok(())
    }

    fn bind_service(&self, intent: &Intent, _caller_package: &str, _user_id: u32) -> Result<ServiceBinding> {
        let binding = ServiceBinding(self.next_binding.fetch_add(1, Ordering::SeqCst));
        self.record(AmCall::Bind(intent.clone(), binding));
        Ok(binding)
    }

    fn unbind_service(&self, binding: ServiceBinding) -> Result<()> {
        self.record(AmCall::Unbind(binding));
        Ok(())
    }

    fn get_content_provider(
        &self,
        authority: &str,
        user_id: u32,
    ) -> Result<Option<Arc<dyn ContentProvider>>> {
        self.record(AmCall::GetProvider(authority.to_string(), user_id));
        Ok(lock(&self.providers).get(authority).cloned())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub caller: ProviderCaller,
    pub authority: String,
    pub method: String,
    pub binder: Option<BinderId>,
}

enum ProviderBehaviour {
    Reply,
    Silent,
    Fail,
}

pub struct FakeProvider {
    behaviour: ProviderBehaviour,
    calls: Mutex<Vec<ProviderCall>>,
}

impl FakeProvider {
    fn with(behaviour: ProviderBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn replying() -> Arc<Self> {
        Self::with(ProviderBehaviour::Reply)
    }

    /// Answers every call with no bundle.
    pub fn silent() -> Arc<Self> {
        Self::with(ProviderBehaviour::Silent)
    }

    pub fn failing() -> Arc<Self> {
        Self::with(ProviderBehaviour::Fail)
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }
}

impl ContentProvider for FakeProvider {
    fn call(
        &self,
        caller: &ProviderCaller,
        authority: &str,
        method: &str,
        _arg: Option<&str>,
        extras: &Bundle,
    ) -> Result<Option<Bundle>> {
        lock(&self.calls).push(ProviderCall {
            caller: caller.clone(),
            authority: authority.to_string(),
            method: method.to_string(),
            binder: extras.get_binder(crate::constants::BINDER_EXTRA_KEY).map(|b| b.id()),
        });
        match self.behaviour {
            ProviderBehaviour::Reply => Ok(Some(Bundle::new())),
            ProviderBehaviour::Silent => Ok(None),
            ProviderBehaviour::Fail => Err(Error::PeerGone),
        }
    }
}

// --- Module configuration ---

pub struct FakeConfig {
    files_root: PathBuf,
    this: Weak<FakeConfig>,
    modules: Mutex<Vec<Arc<ModuleRegistration>>>,
    scopes: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeConfig {
    pub fn new(files_root: &Path) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            files_root: files_root.to_path_buf(),
            this: this.clone(),
            modules: Mutex::new(Vec::new()),
            scopes: Mutex::new(HashMap::new()),
        })
    }

    pub fn enable(&self, package: &str, uids: impl IntoIterator<Item = u32>) -> Arc<ModuleRegistration> {
        let config: Weak<dyn ConfigSource> = self.this.clone();
        let service = ModuleService::new(package, self.files_root.join(package), config);
        let registration = Arc::new(ModuleRegistration::new(package, uids, service));
        lock(&self.modules).push(registration.clone());
        registration
    }

    pub fn set_scope(&self, package: &str, scope: Vec<String>) {
        lock(&self.scopes).insert(package.to_string(), scope);
    }
}

impl ConfigSource for FakeConfig {
    fn enabled_modules(&self) -> Vec<String> {
        lock(&self.modules)
            .iter()
            .map(|module| module.package_name.clone())
            .collect()
    }

    fn get_module_scope(&self, package: &str) -> Option<Vec<String>> {
        if let Some(scope) = lock(&self.scopes).get(package) {
            return Some(scope.clone());
        }
        self.enabled_modules()
            .iter()
            .any(|name| name == package)
            .then(Vec::new)
    }

    fn get_module(&self, uid: u32) -> Option<Arc<ModuleRegistration>> {
        lock(&self.modules)
            .iter()
            .find(|module| module.uids.contains(&uid))
            .cloned()
    }
}
