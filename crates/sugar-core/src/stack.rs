//! The persistence stack
//!
//! [`Stack`] ties the pieces together: it resolves the store path, opens the
//! store (locally, or inside a cloud container when one is configured and
//! available), builds the context hierarchy and hands out contexts.
//!
//! The cloud-backed variant opens the store on its own lane. Until that
//! completes, requesting a context fails with a configuration error.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::cloud::{CloudContainerResolver, CloudLocator, DirectoryContainerResolver};
use crate::config::{CloudDescriptor, StackConfig};
use crate::context::{CommitOutcome, Context, ContextHierarchy};
use crate::error::{ErrorHandler, LoggingErrorHandler, StackError, StackResult};
use crate::lane::{MainQueue, SerialLane};
use crate::merge::ChangeMergeBroker;
use crate::model::Model;
use crate::storage::{
    InitializerState, MigrationOutcome, StoreCoordinator, StoreInitializer, StoreLocator,
    StoreOptions,
};

/// Name of the lane cloud initialization runs on
pub const CLOUD_LANE_NAME: &str = "sugar-cloud";

/// How the store gets opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOpenStrategy {
    /// Open the resolved local path on the calling thread
    Local,
    /// Relocate into a cloud container first, on a background lane
    CloudBacked(CloudDescriptor),
}

impl StoreOpenStrategy {
    pub fn for_config(config: &StackConfig) -> Self {
        match &config.cloud {
            Some(descriptor) => StoreOpenStrategy::CloudBacked(descriptor.clone()),
            None => StoreOpenStrategy::Local,
        }
    }
}

/// Published on [`Stack::subscribe_status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackStatus {
    Uninitialized,
    Initializing,
    Ready(MigrationOutcome),
    Failed {
        outcome: MigrationOutcome,
        message: String,
    },
}

impl StackStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, StackStatus::Ready(_))
    }

    /// Initialization has finished, one way or the other
    pub fn is_settled(&self) -> bool {
        matches!(self, StackStatus::Ready(_) | StackStatus::Failed { .. })
    }
}

/// Result of [`Stack::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initialization {
    Completed(MigrationOutcome),
    /// Running in the background; watch [`Stack::subscribe_status`]
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LiveToken(u64);

/// Tokens for background work that must not outlive a cleanup
#[derive(Debug, Default)]
struct LiveRegistry {
    next: AtomicU64,
    live: Mutex<HashSet<LiveToken>>,
}

impl LiveRegistry {
    fn live(&self) -> MutexGuard<'_, HashSet<LiveToken>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn issue(&self) -> LiveToken {
        let token = LiveToken(self.next.fetch_add(1, Ordering::Relaxed));
        self.live().insert(token);
        token
    }

    fn is_live(&self, token: LiveToken) -> bool {
        self.live().contains(&token)
    }

    fn retire(&self, token: LiveToken) {
        self.live().remove(&token);
    }

    fn revoke_all(&self) -> usize {
        let mut live = self.live();
        let revoked = live.len();
        live.clear();
        revoked
    }
}

type Completion = Box<dyn FnOnce(StackResult<MigrationOutcome>) + Send + 'static>;

/// State shared with the cloud lane
struct StackCore {
    config: StackConfig,
    model: Option<Arc<Model>>,
    errors: Arc<dyn ErrorHandler>,
    coordinator: Arc<StoreCoordinator>,
    local_path: Option<PathBuf>,
    /// Set once, before the first open
    store_path: OnceLock<PathBuf>,
    main_queue: MainQueue,
    broker: Arc<ChangeMergeBroker>,
    hierarchy: Mutex<Option<ContextHierarchy>>,
    initializer_state: Mutex<InitializerState>,
    status: watch::Sender<StackStatus>,
    registry: LiveRegistry,
    started: AtomicBool,
}

impl StackCore {
    fn report<T>(&self, result: StackResult<T>) -> StackResult<T> {
        if let Err(ref e) = result {
            self.errors.handle(e);
        }
        result
    }

    fn hierarchy(&self) -> MutexGuard<'_, Option<ContextHierarchy>> {
        self.hierarchy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_initializer_state(&self, state: InitializerState) {
        *self
            .initializer_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn store_path(&self) -> Option<PathBuf> {
        self.store_path
            .get()
            .cloned()
            .or_else(|| self.local_path.clone())
    }

    fn local_path(&self) -> StackResult<PathBuf> {
        self.local_path.clone().ok_or_else(|| {
            StackError::Configuration("no database path or name is configured".to_string())
        })
    }

    fn begin(&self) -> StackResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StackError::Configuration(
                "the stack is already initialized".to_string(),
            ));
        }
        self.status.send_replace(StackStatus::Initializing);
        Ok(())
    }

    fn fail(&self, error: &StackError) {
        self.started.store(false, Ordering::Release);
        self.status.send_replace(StackStatus::Failed {
            outcome: MigrationOutcome::FatalOpenError,
            message: error.to_string(),
        });
    }

    fn initialize_local(&self) -> StackResult<MigrationOutcome> {
        let local = self.local_path()?;
        let path = self.store_path.get_or_init(|| local).clone();
        self.open_and_install(
            path,
            StoreOptions::for_automigration(self.config.automigrating),
            None,
        )
    }

    fn initialize_cloud(
        &self,
        resolver: Arc<dyn CloudContainerResolver>,
        descriptor: CloudDescriptor,
        token: LiveToken,
    ) -> StackResult<MigrationOutcome> {
        let local = self.local_path()?;
        let file_name = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StackError::Configuration(format!("store path {:?} has no file name", local))
            })?;
        let local_options = StoreOptions::for_automigration(self.config.automigrating);

        let (target, options) = match CloudLocator::new(resolver, descriptor).relocate(&file_name)
        {
            Ok(relocation) => (relocation.store_path, relocation.options),
            Err(e) => {
                info!("{}; using the local store", e);
                (local, local_options.clone())
            }
        };

        let path = self.store_path.get_or_init(|| target.clone()).clone();
        let options = if path == target {
            options
        } else {
            warn!(
                "Store path is already fixed at {:?}; ignoring relocation to {:?}",
                path, target
            );
            local_options
        };
        self.open_and_install(path, options, Some(token))
    }

    fn open_and_install(
        &self,
        path: PathBuf,
        options: StoreOptions,
        token: Option<LiveToken>,
    ) -> StackResult<MigrationOutcome> {
        let mut initializer = StoreInitializer::new(Arc::clone(&self.coordinator), path, options);
        let opened = initializer.open();
        self.set_initializer_state(initializer.state());
        let opened = opened?;
        let outcome = opened.outcome;

        let hierarchy = ContextHierarchy::build(
            opened.store,
            self.model.clone(),
            Arc::clone(&self.broker),
            self.main_queue.owner(),
            Arc::clone(&self.errors),
        )?;

        let mut slot = self.hierarchy();
        if let Some(token) = token {
            if !self.registry.is_live(token) {
                drop(slot);
                drop(hierarchy);
                self.coordinator.detach();
                return Err(StackError::Configuration(
                    "the stack was cleaned up before initialization completed".to_string(),
                ));
            }
        }
        *slot = Some(hierarchy);
        drop(slot);

        self.status.send_replace(StackStatus::Ready(outcome));
        info!("Stack ready ({:?})", outcome);
        Ok(outcome)
    }

    fn root(&self) -> Option<Context> {
        self.hierarchy().as_ref().map(|h| h.root().clone())
    }
}

/// Builder for [`Stack`]
pub struct StackBuilder {
    config: StackConfig,
    model: Option<Model>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    cloud_resolver: Option<Arc<dyn CloudContainerResolver>>,
    locator: Option<StoreLocator>,
}

impl StackBuilder {
    /// Schema for the store; without one the stack adopts whatever the store has
    pub fn model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn cloud_resolver(mut self, resolver: Arc<dyn CloudContainerResolver>) -> Self {
        self.cloud_resolver = Some(resolver);
        self
    }

    /// Locator used when the config names the store instead of giving a path
    pub fn locator(mut self, locator: StoreLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Build the stack; the calling thread becomes the main thread
    pub fn build(self) -> Stack {
        let config = self.config;
        let errors = self
            .error_handler
            .unwrap_or_else(|| Arc::new(LoggingErrorHandler));
        let locator = self.locator;
        let local_path = config.database_path.clone().or_else(|| {
            config.database_name.as_deref().map(|name| {
                locator
                    .unwrap_or_else(|| StoreLocator::new(config.app_name.as_deref()))
                    .resolve(name)
            })
        });

        let model = self.model.map(Arc::new);
        let main_queue = MainQueue::for_current_thread();
        let broker = Arc::new(ChangeMergeBroker::new(
            main_queue.clone(),
            Arc::clone(&errors),
        ));
        let (status, _) = watch::channel(StackStatus::Uninitialized);
        let strategy = StoreOpenStrategy::for_config(&config);

        debug!("Stack store path: {:?}", local_path);
        Stack {
            core: Arc::new(StackCore {
                coordinator: Arc::new(StoreCoordinator::new(model.clone())),
                config,
                model,
                errors,
                local_path,
                store_path: OnceLock::new(),
                main_queue,
                broker,
                hierarchy: Mutex::new(None),
                initializer_state: Mutex::new(InitializerState::Unopened),
                status,
                registry: LiveRegistry::default(),
                started: AtomicBool::new(false),
            }),
            strategy,
            cloud_resolver: self
                .cloud_resolver
                .unwrap_or_else(|| Arc::new(DirectoryContainerResolver::default())),
            cloud_lane: Mutex::new(None),
        }
    }
}

/// A persistence stack: one store, one root writer, one main context
pub struct Stack {
    core: Arc<StackCore>,
    strategy: StoreOpenStrategy,
    cloud_resolver: Arc<dyn CloudContainerResolver>,
    cloud_lane: Mutex<Option<Arc<SerialLane>>>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name())
            .field("store_path", &self.store_path())
            .field("status", &self.status())
            .finish()
    }
}

impl Stack {
    pub fn builder(config: StackConfig) -> StackBuilder {
        StackBuilder {
            config,
            model: None,
            error_handler: None,
            cloud_resolver: None,
            locator: None,
        }
    }

    pub fn new(config: StackConfig, model: Option<Model>) -> Self {
        let builder = match model {
            Some(model) => Self::builder(config).model(model),
            None => Self::builder(config),
        };
        builder.build()
    }

    pub fn name(&self) -> &'static str {
        match self.strategy {
            StoreOpenStrategy::Local => "DefaultStack",
            StoreOpenStrategy::CloudBacked(_) => "CloudStack",
        }
    }

    pub fn description(&self) -> String {
        let location = match self.store_path() {
            Some(path) => path.display().to_string(),
            None => "no store path".to_string(),
        };
        match self.strategy {
            StoreOpenStrategy::Local => format!(
                "Default stack with a private root writer, a main context and per-thread workers ({})",
                location
            ),
            StoreOpenStrategy::CloudBacked(ref descriptor) => format!(
                "Cloud stack synced through '{}' with a private root writer, a main context and per-thread workers ({})",
                descriptor.identity_token, location
            ),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.core.config
    }

    pub fn strategy(&self) -> &StoreOpenStrategy {
        &self.strategy
    }

    /// Store path, after cloud relocation once that has happened
    pub fn store_path(&self) -> Option<PathBuf> {
        self.core.store_path()
    }

    /// Queue of merge deliveries for the main context
    ///
    /// The host drains it with [`MainQueue::run_pending`] on the thread that
    /// built the stack.
    pub fn main_queue(&self) -> &MainQueue {
        &self.core.main_queue
    }

    pub fn status(&self) -> StackStatus {
        self.core.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StackStatus> {
        self.core.status.subscribe()
    }

    pub fn initializer_state(&self) -> InitializerState {
        *self
            .core
            .initializer_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_initialized(&self) -> bool {
        self.core.hierarchy().is_some()
    }

    /// Open the store and build the contexts
    ///
    /// Local stacks complete before returning. Cloud-backed stacks return
    /// [`Initialization::Pending`] and finish on the cloud lane.
    pub fn initialize(&self) -> StackResult<Initialization> {
        match &self.strategy {
            StoreOpenStrategy::Local => {
                self.core.report(self.core.begin())?;
                let result = self.core.initialize_local();
                if let Err(ref e) = result {
                    self.core.fail(e);
                }
                self.core.report(result).map(Initialization::Completed)
            }
            StoreOpenStrategy::CloudBacked(descriptor) => {
                self.start_cloud(descriptor.clone(), None)?;
                Ok(Initialization::Pending)
            }
        }
    }

    /// Like [`initialize`](Self::initialize), reporting completion to `callback`
    ///
    /// For cloud-backed stacks the callback runs on the cloud lane. Only
    /// precondition failures are returned directly.
    pub fn initialize_with<F>(&self, callback: F) -> StackResult<()>
    where
        F: FnOnce(StackResult<MigrationOutcome>) + Send + 'static,
    {
        match &self.strategy {
            StoreOpenStrategy::Local => {
                self.core.report(self.core.begin())?;
                let result = self.core.initialize_local();
                if let Err(ref e) = result {
                    self.core.fail(e);
                }
                callback(self.core.report(result));
                Ok(())
            }
            StoreOpenStrategy::CloudBacked(descriptor) => {
                self.start_cloud(descriptor.clone(), Some(Box::new(callback)))
            }
        }
    }

    fn cloud_lane(&self) -> StackResult<Arc<SerialLane>> {
        let mut lane = self
            .cloud_lane
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(ref lane) = *lane {
            return Ok(Arc::clone(lane));
        }
        let spawned = Arc::new(SerialLane::spawn(CLOUD_LANE_NAME).map_err(|e| {
            StackError::Configuration(format!("could not start the cloud lane: {}", e))
        })?);
        *lane = Some(Arc::clone(&spawned));
        Ok(spawned)
    }

    fn start_cloud(
        &self,
        descriptor: CloudDescriptor,
        callback: Option<Completion>,
    ) -> StackResult<()> {
        self.core.report(self.core.begin())?;
        let lane = match self.cloud_lane() {
            Ok(lane) => lane,
            Err(e) => {
                self.core.fail(&e);
                return self.core.report(Err(e));
            }
        };

        let token = self.core.registry.issue();
        let core = Arc::clone(&self.core);
        let resolver = Arc::clone(&self.cloud_resolver);
        debug!("Resolving cloud container '{}'", descriptor.identity_token);

        let queued = lane.perform(move || {
            let result = if core.registry.is_live(token) {
                core.initialize_cloud(resolver, descriptor, token)
            } else {
                Err(StackError::Configuration(
                    "the stack was cleaned up before initialization started".to_string(),
                ))
            };
            if let Err(ref e) = result {
                if core.registry.is_live(token) {
                    core.fail(e);
                }
            }
            core.registry.retire(token);
            let result = core.report(result);
            if let Some(callback) = callback {
                callback(result);
            }
        });

        if let Err(e) = queued {
            self.core.registry.retire(token);
            self.core.fail(&e);
            return self.core.report(Err(e));
        }
        Ok(())
    }

    /// The main context; fails until initialization has completed
    pub fn main_context(&self) -> StackResult<Context> {
        let main = self.core.hierarchy().as_ref().map(|h| h.main().clone());
        self.core.report(main.ok_or_else(|| {
            StackError::Configuration(
                "main context requested before the stack finished initializing".to_string(),
            )
        }))
    }

    /// A fresh worker context confined to the calling thread
    pub fn worker_context(&self) -> StackResult<Context> {
        let parents = self
            .core
            .hierarchy()
            .as_ref()
            .map(|h| (h.root().clone(), h.main().clone()));
        let result = match parents {
            Some((root, main)) => ContextHierarchy::create_worker(Some(&root), Some(&main)),
            None => ContextHierarchy::create_worker(None, None),
        };
        self.core.report(result)
    }

    /// Write the root context's pending changes to disk
    pub fn commit_root(&self) -> StackResult<CommitOutcome> {
        let root = self.core.root().ok_or_else(|| {
            StackError::Configuration("no root context; initialize the stack first".to_string())
        });
        self.core.report(root)?.commit()
    }

    fn save_root(&self, reason: &str) -> StackResult<CommitOutcome> {
        let Some(root) = self.core.root() else {
            debug!("Nothing to save on {}: stack is not initialized", reason);
            return Ok(CommitOutcome::NoChanges);
        };
        if !root.has_changes()? {
            return Ok(CommitOutcome::NoChanges);
        }
        info!("Saving root context on {}", reason);
        root.commit()
    }

    /// The host is about to become inactive
    pub fn on_resign_active(&self) -> StackResult<CommitOutcome> {
        self.save_root("resign active")
    }

    /// The host is about to exit
    pub fn on_terminate(&self) -> StackResult<CommitOutcome> {
        self.save_root("terminate")
    }

    pub fn on_enter_foreground(&self) {
        trace!("Entered foreground");
    }

    /// Delete the primary store file
    pub fn remove_database(&self) -> StackResult<()> {
        let result = match self.store_path() {
            None => Err(StackError::Deletion {
                path: None,
                reason: "no database path is configured".to_string(),
            }),
            Some(path) => match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("Removed database {:?}", path);
                    Ok(())
                }
                Err(e) => Err(StackError::Deletion {
                    path: Some(path),
                    reason: e.to_string(),
                }),
            },
        };
        self.core.report(result)
    }

    /// Tear down contexts and registrations; the stack can be initialized again
    pub fn cleanup(&self) {
        let revoked = self.core.registry.revoke_all();
        let hierarchy = self.core.hierarchy().take();
        let registrations = self.core.broker.clear();
        let discarded = self.core.main_queue.discard_pending();
        drop(hierarchy);
        self.core.coordinator.detach();

        self.core.set_initializer_state(InitializerState::Unopened);
        self.core.started.store(false, Ordering::Release);
        self.core.status.send_replace(StackStatus::Uninitialized);
        debug!(revoked, registrations, discarded, "Stack cleaned up");
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingHandler {
        count: AtomicUsize,
    }

    impl ErrorHandler for CountingHandler {
        fn handle(&self, _error: &StackError) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_live_registry() {
        let registry = LiveRegistry::default();
        let first = registry.issue();
        let second = registry.issue();
        assert_ne!(first, second);
        assert!(registry.is_live(first));

        registry.retire(first);
        assert!(!registry.is_live(first));
        assert_eq!(registry.revoke_all(), 1);
        assert!(!registry.is_live(second));
    }

    #[test]
    fn test_name_follows_strategy() {
        let local = Stack::new(StackConfig::at_path("/tmp/unused.sqlite"), None);
        assert_eq!(local.name(), "DefaultStack");
        assert_eq!(local.strategy(), &StoreOpenStrategy::Local);

        let cloud = Stack::new(
            StackConfig::at_path("/tmp/unused.sqlite").with_cloud(CloudDescriptor::new("id")),
            None,
        );
        assert_eq!(cloud.name(), "CloudStack");
        assert!(cloud.description().contains("'id'"));
    }

    #[test]
    fn test_named_store_uses_locator() {
        let temp_dir = TempDir::new().unwrap();
        let stack = Stack::builder(StackConfig::named("sugar.sqlite"))
            .locator(StoreLocator::with_base(temp_dir.path(), Some("app")))
            .build();
        assert_eq!(
            stack.store_path(),
            Some(temp_dir.path().join("app").join("sugar.sqlite"))
        );
    }

    #[test]
    fn test_contexts_before_initialize_are_configuration_errors() {
        let handler = Arc::new(CountingHandler::default());
        let stack = Stack::builder(StackConfig::at_path("/tmp/unused.sqlite"))
            .error_handler(handler.clone())
            .build();

        assert!(matches!(
            stack.main_context(),
            Err(StackError::Configuration(_))
        ));
        assert!(matches!(
            stack.worker_context(),
            Err(StackError::Configuration(_))
        ));
        assert!(matches!(
            stack.commit_root(),
            Err(StackError::Configuration(_))
        ));
        assert_eq!(handler.count.load(Ordering::SeqCst), 3);
        // Lifecycle hooks are quiet without a stack
        assert_eq!(stack.on_terminate().unwrap(), CommitOutcome::NoChanges);
    }

    #[test]
    fn test_second_initialize_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let stack = Stack::new(
            StackConfig::at_path(temp_dir.path().join("sugar.sqlite")),
            None,
        );
        assert_eq!(
            stack.initialize().unwrap(),
            Initialization::Completed(MigrationOutcome::Opened)
        );
        assert!(matches!(
            stack.initialize(),
            Err(StackError::Configuration(_))
        ));

        stack.cleanup();
        assert!(!stack.is_initialized());
        assert_eq!(stack.status(), StackStatus::Uninitialized);
        assert!(stack.initialize().is_ok());
    }

    #[test]
    fn test_unconfigured_stack_fails_to_initialize() {
        let stack = Stack::new(StackConfig::unconfigured(), None);
        assert!(stack.store_path().is_none());
        assert!(matches!(
            stack.initialize(),
            Err(StackError::Configuration(_))
        ));
        assert!(matches!(stack.status(), StackStatus::Failed { .. }));
    }
}
