//! Controller manager
//!
//! Every resource kind runs on its own `kube::runtime::Controller`, which
//! reconciles one object at a time per key and different keys concurrently.
//! Controllers are declared up front as [`ControllerDef`]s and launched
//! together; [`RunningManager::stop`] shuts them all down gracefully.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::deletions::{watch_with_tombstones, Source, TombstoneHandle};
use super::report::{Failure, FailureReporter, ATTEMPT_TIMEOUT};
use crate::clientset::TypedClient;
use crate::identity::{ObjectKey, ResourceIdentity};
use crate::Error;

/// Fixed delay before a failed key is reconciled again
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(60);

/// Default concurrent reconciles per controller
pub const DEFAULT_WORKERS: u16 = 4;

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Requeue retryable errors after [`DEFAULT_REQUEUE`]; wait for a change otherwise
pub fn default_error_policy(error: &Error) -> Action {
    if error.is_retryable() {
        Action::requeue(DEFAULT_REQUEUE)
    } else {
        Action::await_change()
    }
}

/// Reconciles one resource kind, addressed by object key
///
/// The key is all a reconcile gets: the object is fetched fresh, and a
/// missing object means it was deleted.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Drive the object at `key` toward agreement with its backing state
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error>;

    /// Decide what happens to `key` after `reconcile` failed with `error`
    fn error_policy(&self, _key: &ObjectKey, error: &Error) -> Action {
        default_error_policy(error)
    }
}

/// Runtime settings shared by every controller of a manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Concurrent reconciles per controller
    pub concurrency: u16,
    /// Deadline for a single reconcile attempt
    pub attempt_timeout: Option<Duration>,
    /// Server-side timeout for watch requests
    pub watch_timeout_secs: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKERS,
            attempt_timeout: None,
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
        }
    }
}

/// What a controller is handed when it is launched
struct Launch {
    options: ManagerOptions,
    failures: Arc<dyn FailureReporter>,
    shutdown: oneshot::Receiver<()>,
    abort: CancellationToken,
}

type Launcher = Box<dyn FnOnce(Launch) -> BoxFuture<'static, ()> + Send>;

/// A named controller waiting to be launched by a [`ControllerManager`]
pub struct ControllerDef {
    name: String,
    identity: ResourceIdentity,
    launch: Launcher,
}

impl ControllerDef {
    /// Controller watching every namespace through `client`
    ///
    /// Deleted objects are reconciled once more so their backing state can
    /// be removed.
    pub fn watching<K>(
        name: impl Into<String>,
        client: &TypedClient,
        reconciler: Arc<dyn Reconciler>,
    ) -> Result<Self, Error>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let api = client.api::<K>(None)?;
        let name = name.into();
        let identity = client.identity().clone();
        let launch_name = name.clone();
        let launch_identity = identity.clone();
        Ok(Self {
            name,
            identity,
            launch: Box::new(move |launch: Launch| {
                let config =
                    watcher::Config::default().timeout(launch.options.watch_timeout_secs);
                let source = watch_with_tombstones(api, config);
                run_controller(launch_name, launch_identity, source, reconciler, launch)
            }),
        })
    }

    /// Controller fed by `trigger`, reading objects from `reader`
    ///
    /// Objects are reconciled only while present in `reader`.
    pub fn for_stream<K>(
        name: impl Into<String>,
        trigger: BoxStream<'static, Result<K, watcher::Error>>,
        reader: Store<K>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let name = name.into();
        let identity = ResourceIdentity::of::<K>();
        let launch_name = name.clone();
        let launch_identity = identity.clone();
        Self {
            name,
            identity,
            launch: Box::new(move |launch: Launch| {
                let source = Source {
                    trigger,
                    reader,
                    tombstones: None,
                };
                run_controller(launch_name, launch_identity, source, reconciler, launch)
            }),
        }
    }

    /// Controller name, unique within a manager
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource kind this controller reconciles
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }
}

impl Debug for ControllerDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerDef")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Collects controllers and launches them together
pub struct ControllerManager {
    options: ManagerOptions,
    failures: Arc<dyn FailureReporter>,
    controllers: Vec<ControllerDef>,
}

impl ControllerManager {
    /// Create an empty manager
    pub fn new(options: ManagerOptions, failures: Arc<dyn FailureReporter>) -> Self {
        Self {
            options,
            failures,
            controllers: Vec::new(),
        }
    }

    /// Register a controller; names must be unique
    pub fn add(&mut self, controller: ControllerDef) -> Result<(), Error> {
        if self.controllers.iter().any(|c| c.name == controller.name) {
            return Err(Error::config(format!(
                "controller {} is registered twice",
                controller.name
            )));
        }
        self.controllers.push(controller);
        Ok(())
    }

    /// Names of registered controllers, in registration order
    pub fn controller_names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.name.as_str()).collect()
    }

    /// Spawn every controller
    pub fn start(self) -> RunningManager {
        let abort = CancellationToken::new();
        let mut shutdowns = Vec::with_capacity(self.controllers.len());
        let mut tasks = Vec::with_capacity(self.controllers.len());

        for def in self.controllers {
            let (tx, rx) = oneshot::channel();
            info!(
                controller = %def.name,
                kind = %def.identity,
                concurrency = self.options.concurrency,
                "Starting controller"
            );
            let run = (def.launch)(Launch {
                options: self.options.clone(),
                failures: self.failures.clone(),
                shutdown: rx,
                abort: abort.clone(),
            });
            tasks.push(tokio::spawn(run));
            shutdowns.push(tx);
        }

        RunningManager {
            shutdowns,
            abort,
            tasks,
        }
    }
}

/// Handle to launched controllers
pub struct RunningManager {
    shutdowns: Vec<oneshot::Sender<()>>,
    abort: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningManager {
    /// Number of running controllers
    pub fn controller_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop intake and wait for in-flight reconciles
    ///
    /// When `abort` fires before the reconciles finish they are cancelled.
    /// Nothing is requeued once this is called.
    pub async fn stop(self, abort: CancellationToken) {
        info!(controllers = self.tasks.len(), "Stopping controllers");
        for tx in self.shutdowns {
            let _ = tx.send(());
        }

        let mut drain = Box::pin(futures::future::join_all(self.tasks));
        let results = tokio::select! {
            results = &mut drain => results,
            _ = abort.cancelled() => {
                warn!("Shutdown deadline reached, cancelling in-flight reconciles");
                self.abort.cancel();
                drain.await
            }
        };

        for result in results {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Controller task panicked");
                }
            }
        }
        info!("Controllers stopped");
    }
}

struct Context<K: Resource<DynamicType = ()>> {
    name: String,
    identity: ResourceIdentity,
    reconciler: Arc<dyn Reconciler>,
    failures: Arc<dyn FailureReporter>,
    attempt_timeout: Option<Duration>,
    abort: CancellationToken,
    tombstones: Option<TombstoneHandle<K>>,
}

fn run_controller<K>(
    name: String,
    identity: ResourceIdentity,
    source: Source<K>,
    reconciler: Arc<dyn Reconciler>,
    launch: Launch,
) -> BoxFuture<'static, ()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let ctx = Arc::new(Context {
        name: name.clone(),
        identity,
        reconciler,
        failures: launch.failures,
        attempt_timeout: launch.options.attempt_timeout,
        abort: launch.abort,
        tombstones: source.tombstones,
    });

    Controller::for_stream(source.trigger, source.reader)
        .with_config(controller::Config::default().concurrency(launch.options.concurrency))
        .graceful_shutdown_on(launch.shutdown.map(|_| ()))
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(move |result| {
            match result {
                Ok((obj, action)) => debug!(controller = %name, object = %obj, ?action, "Reconcile completed"),
                // already logged and reported by `reconcile`
                Err(controller::Error::ReconcilerFailed(_, _)) => {}
                Err(controller::Error::QueueError(e)) => {
                    warn!(controller = %name, error = %e, "Watch stream error, backing off")
                }
                Err(e) => error!(controller = %name, error = %e, "Controller error"),
            }
            futures::future::ready(())
        })
        .boxed()
}

fn object_key<K: Resource>(obj: &K) -> Result<ObjectKey, Error> {
    ObjectKey::from_meta(obj.meta())
        .ok_or_else(|| Error::internal_with_context("reconcile", "object without a name"))
}

async fn reconcile<K>(obj: Arc<K>, ctx: Arc<Context<K>>) -> Result<Action, Error>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let key = object_key(obj.as_ref())?;
    let obj_ref = ObjectRef::from_obj(obj.as_ref());
    let deleted = ctx
        .tombstones
        .as_ref()
        .and_then(|t| t.deleted_uid(&obj_ref));

    let attempt = async {
        match ctx.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, ctx.reconciler.reconcile(&key))
                .await
                .unwrap_or_else(|_| Err(Error::cancelled(ATTEMPT_TIMEOUT))),
            None => ctx.reconciler.reconcile(&key).await,
        }
    };
    let result = tokio::select! {
        biased;
        _ = ctx.abort.cancelled() => Err(Error::cancelled("shutdown")),
        result = attempt => result,
    };

    match result {
        Ok(action) => {
            if let (Some(tombstones), Some(uid)) = (ctx.tombstones.as_ref(), deleted) {
                tombstones.settle(obj_ref, uid);
            }
            Ok(action)
        }
        Err(e) => {
            error!(controller = %ctx.name, key = %key, error = %e, "Reconcile failed");
            if !ctx.abort.is_cancelled() {
                ctx.failures
                    .report(&ctx.identity, &key, Failure::of(&e), e.to_string())
                    .await;
            }
            Err(e)
        }
    }
}

fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context<K>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    match object_key(obj.as_ref()) {
        Ok(key) => ctx.reconciler.error_policy(&key, error),
        Err(_) => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::report::NoopReporter;
    use futures::channel::mpsc;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::runtime::reflector::{self, store::Writer};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hand-fed trigger over a store the test controls
    struct Feed {
        tx: mpsc::UnboundedSender<Result<ConfigMap, watcher::Error>>,
        writer: Writer<ConfigMap>,
    }

    impl Feed {
        fn new() -> (Self, BoxStream<'static, Result<ConfigMap, watcher::Error>>, Store<ConfigMap>) {
            let (reader, mut writer) = reflector::store();
            writer.apply_watcher_event(&watcher::Event::Init);
            writer.apply_watcher_event(&watcher::Event::InitDone);
            let (tx, rx) = mpsc::unbounded();
            (Self { tx, writer }, rx.boxed(), reader)
        }

        fn touch(&mut self, name: &str) {
            let mut cm = ConfigMap::default();
            cm.metadata.name = Some(name.to_string());
            cm.metadata.namespace = Some("ns".to_string());
            self.writer
                .apply_watcher_event(&watcher::Event::Apply(cm.clone()));
            self.tx.unbounded_send(Ok(cm)).expect("controller is running");
        }
    }

    /// Records every attempt; optionally sleeps and fails
    #[derive(Default)]
    struct Recording {
        log: Mutex<Vec<String>>,
        attempts: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl Reconciler for Recording {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(format!("start {}", key.name));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().push(format!("end {}", key.name));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::internal("store unavailable"))
            } else {
                Ok(Action::await_change())
            }
        }
    }

    #[derive(Default)]
    struct CountingFailures {
        seen: Mutex<Vec<(String, Failure)>>,
    }

    #[async_trait]
    impl FailureReporter for CountingFailures {
        async fn report(
            &self,
            _identity: &ResourceIdentity,
            key: &ObjectKey,
            failure: Failure,
            _message: String,
        ) {
            self.seen.lock().push((key.name.clone(), failure));
        }
    }

    fn start(
        reconciler: Arc<dyn Reconciler>,
        options: ManagerOptions,
        failures: Arc<dyn FailureReporter>,
    ) -> (Feed, RunningManager) {
        let (feed, trigger, reader) = Feed::new();
        let mut mgr = ControllerManager::new(options, failures);
        mgr.add(ControllerDef::for_stream("configmaps", trigger, reader, reconciler))
            .expect("register");
        (feed, mgr.start())
    }

    fn concurrency(concurrency: u16) -> ManagerOptions {
        ManagerOptions {
            concurrency,
            ..Default::default()
        }
    }

    #[test]
    fn default_policy_requeues_only_retryable_errors() {
        assert_eq!(
            default_error_policy(&Error::internal("io")),
            Action::requeue(DEFAULT_REQUEUE)
        );
        assert_eq!(
            default_error_policy(&Error::validation_for("ds", "no uid")),
            Action::await_change()
        );
    }

    #[test]
    fn duplicate_controller_names_are_rejected() {
        let mut mgr = ControllerManager::new(concurrency(1), Arc::new(NoopReporter));
        let reconciler: Arc<dyn Reconciler> = Arc::new(Recording::default());
        let (_f1, t1, r1) = Feed::new();
        let (_f2, t2, r2) = Feed::new();

        mgr.add(ControllerDef::for_stream("configmaps", t1, r1, reconciler.clone()))
            .expect("first registration");
        let err = mgr
            .add(ControllerDef::for_stream("configmaps", t2, r2, reconciler))
            .expect_err("second registration");
        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(mgr.controller_names(), vec!["configmaps"]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_is_never_reconciled_concurrently() {
        let reconciler = Arc::new(Recording {
            delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let (mut feed, running) =
            start(reconciler.clone(), concurrency(4), Arc::new(NoopReporter));

        feed.touch("cm-1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        feed.touch("cm-1");
        feed.touch("cm-1");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(reconciler.max_in_flight.load(Ordering::SeqCst), 1);
        // first attempt plus one coalesced follow-up
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            *reconciler.log.lock(),
            vec!["start cm-1", "end cm-1", "start cm-1", "end cm-1"]
        );

        running.stop(CancellationToken::new()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_in_parallel() {
        let reconciler = Arc::new(Recording {
            delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let (mut feed, running) =
            start(reconciler.clone(), concurrency(4), Arc::new(NoopReporter));

        for name in ["a", "b", "c"] {
            feed.touch(name);
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(reconciler.max_in_flight.load(Ordering::SeqCst), 3);

        running.stop(CancellationToken::new()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_retried_once_per_fixed_delay_and_reported() {
        let reconciler = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let failures = Arc::new(CountingFailures::default());
        let (mut feed, running) = start(reconciler.clone(), concurrency(1), failures.clone());

        feed.touch("cm-1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(58)).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 1, "no retry before the delay");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 2, "exactly one retry");
        assert_eq!(
            *failures.seen.lock(),
            vec![
                ("cm-1".to_string(), Failure::Errored),
                ("cm-1".to_string(), Failure::Errored)
            ]
        );

        running.stop(CancellationToken::new()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_requeued_as_cancelled() {
        let reconciler = Arc::new(Recording {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let failures = Arc::new(CountingFailures::default());
        let options = ManagerOptions {
            concurrency: 1,
            attempt_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let (mut feed, running) = start(reconciler.clone(), options, failures.clone());

        feed.touch("slow");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*failures.seen.lock(), vec![("slow".to_string(), Failure::TimedOut)]);

        tokio::time::sleep(DEFAULT_REQUEUE).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 2);

        running.stop(CancellationToken::new()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_attempts() {
        let reconciler = Arc::new(Recording {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (mut feed, running) =
            start(reconciler.clone(), concurrency(1), Arc::new(NoopReporter));

        feed.touch("cm-1");
        tokio::time::sleep(Duration::from_millis(100)).await;

        running.stop(CancellationToken::new()).await;
        assert_eq!(*reconciler.log.lock(), vec!["start cm-1", "end cm-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_in_flight_attempts_without_requeue() {
        let reconciler = Arc::new(Recording {
            delay: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let failures = Arc::new(CountingFailures::default());
        let (mut feed, running) = start(reconciler.clone(), concurrency(1), failures.clone());

        feed.touch("stuck");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let abort = CancellationToken::new();
        abort.cancel();
        running.stop(abort).await;

        assert_eq!(*reconciler.log.lock(), vec!["start stuck"]);
        assert!(failures.seen.lock().is_empty());
        tokio::time::sleep(DEFAULT_REQUEUE * 2).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 1);
    }
}
