//! DataSource reconciliation
//!
//! Control-plane authoritative, level-triggered sync of one DataSource into
//! the store:
//!
//! ```text
//! Fetching ─┬─ NotFound ── delete(namespace, name) ──────────── Done
//!           └─ Fetched ─── lookup(uid) ─┬─ not found ── insert ── Done
//!                                       ├─ found ────── update ── Done
//!                                       └─ other error ────────── Requeue
//! ```
//!
//! Any failed step requeues after the fixed delay, except records that can
//! never be written (no UID, non-numeric resourceVersion), which wait for the
//! next change.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use kubebridge_common::runtime::{default_error_policy, Action, Reconciler};
use kubebridge_common::{Error, ObjectGetter, ObjectKey};

use crate::crd::DataSource;
use crate::mapping::to_record;
use crate::store::DataSourceStore;

/// Controller name registered with the runtime
pub const CONTROLLER_NAME: &str = "datasources-controller";

/// Terminal outcome of a successful sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The object is gone and its record was removed (or already absent)
    Deleted,
    /// A new record was created
    Inserted,
    /// The existing record was overwritten
    Updated,
}

/// Reconciles DataSource objects into a [`DataSourceStore`]
pub struct DataSourceReconciler {
    objects: Arc<dyn ObjectGetter<DataSource>>,
    store: Arc<dyn DataSourceStore>,
}

impl DataSourceReconciler {
    /// Create a reconciler reading from `objects` and writing to `store`
    pub fn new(
        objects: Arc<dyn ObjectGetter<DataSource>>,
        store: Arc<dyn DataSourceStore>,
    ) -> Self {
        Self { objects, store }
    }

    /// Run one sync attempt for `key`
    pub async fn sync(&self, key: &ObjectKey) -> Result<SyncOutcome, Error> {
        let Some(ds) = self.objects.get(key).await? else {
            return self.sync_deleted(key).await;
        };

        let record = to_record(&ds)?;
        match self.store.get(&record.uid).await {
            Err(e) if e.is_not_found() => {
                self.store.insert(&record).await?;
                info!(key = %key, uid = %record.uid, "Inserted data source into store");
                Ok(SyncOutcome::Inserted)
            }
            Err(e) => Err(e.into()),
            Ok(_) => {
                record.store_version()?;
                self.store.update(&record).await?;
                debug!(
                    key = %key,
                    uid = %record.uid,
                    version = %record.resource_version,
                    "Updated data source in store"
                );
                Ok(SyncOutcome::Updated)
            }
        }
    }

    async fn sync_deleted(&self, key: &ObjectKey) -> Result<SyncOutcome, Error> {
        let namespace = key.namespace.as_deref().unwrap_or_default();
        match self.store.delete(namespace, &key.name).await {
            Ok(()) => {
                info!(key = %key, "Deleted data source from store");
                Ok(SyncOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Data source already absent from store");
                Ok(SyncOutcome::Deleted)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Reconciler for DataSourceReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error> {
        let outcome = self.sync(key).await?;
        debug!(key = %key, ?outcome, "Data source reconciled");
        Ok(Action::await_change())
    }

    fn error_policy(&self, key: &ObjectKey, error: &Error) -> Action {
        if !error.is_retryable() {
            warn!(key = %key, error = %error, "Data source cannot be synced until it changes");
        }
        default_error_policy(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DataSourceSpec;
    use crate::store::{DataSourceRecord, MemoryStore, MockDataSourceStore};
    use futures::channel::mpsc;
    use futures::StreamExt;
    use kube::runtime::{reflector, watcher};
    use kubebridge_common::runtime::{
        ControllerDef, ControllerManager, ManagerOptions, NoopReporter, DEFAULT_REQUEUE,
    };
    use kubebridge_common::StoreError;
    use mockall::Sequence;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    mockall::mock! {
        Objects {}

        #[async_trait]
        impl ObjectGetter<DataSource> for Objects {
            async fn get(&self, key: &ObjectKey) -> Result<Option<DataSource>, Error>;
        }
    }

    fn datasource(uid: &str, name: &str, version: &str, url: &str) -> DataSource {
        let mut ds = DataSource::new(
            name,
            DataSourceSpec {
                type_: "prometheus".to_string(),
                url: url.to_string(),
                ..Default::default()
            },
        );
        ds.metadata.namespace = Some("ns".to_string());
        ds.metadata.uid = Some(uid.to_string());
        ds.metadata.resource_version = Some(version.to_string());
        ds
    }

    fn objects_returning(ds: Option<DataSource>) -> MockObjects {
        let mut objects = MockObjects::new();
        objects.expect_get().returning(move |_| Ok(ds.clone()));
        objects
    }

    fn reconciler(objects: MockObjects, store: impl DataSourceStore + 'static) -> DataSourceReconciler {
        DataSourceReconciler::new(Arc::new(objects), Arc::new(store))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("ns", name)
    }

    #[tokio::test]
    async fn absent_record_is_inserted() {
        let mut store = MockDataSourceStore::new();
        let mut seq = Sequence::new();
        store
            .expect_get()
            .withf(|uid| uid == "abc")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|uid| Err(StoreError::not_found(uid)));
        store
            .expect_insert()
            .withf(|r: &DataSourceRecord| {
                r.uid == "abc"
                    && r.name == "ds-1"
                    && r.resource_version == "3"
                    && r.type_ == "prometheus"
                    && r.url == "http://x"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store.expect_update().never();

        let r = reconciler(
            objects_returning(Some(datasource("abc", "ds-1", "3", "http://x"))),
            store,
        );
        assert_eq!(r.sync(&key("ds-1")).await.expect("synced"), SyncOutcome::Inserted);
    }

    #[tokio::test]
    async fn not_found_object_deletes_by_namespace_and_name_once() {
        let mut store = MockDataSourceStore::new();
        store
            .expect_delete()
            .withf(|namespace, name| namespace == "ns" && name == "ds-1")
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_get().never();

        let r = reconciler(objects_returning(None), store);
        let action = r.reconcile(&key("ds-1")).await.expect("done");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deleting_an_absent_record_is_done() {
        let mut store = MockDataSourceStore::new();
        store
            .expect_delete()
            .returning(|_, name| Err(StoreError::not_found(name)));

        let r = reconciler(objects_returning(None), store);
        assert_eq!(r.sync(&key("ds-1")).await.expect("done"), SyncOutcome::Deleted);
    }

    #[tokio::test]
    async fn deletion_in_one_namespace_keeps_same_name_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(&DataSourceRecord {
                uid: "uid-b".to_string(),
                name: "ds-1".to_string(),
                namespace: "team-b".to_string(),
                resource_version: "1".to_string(),
                ..Default::default()
            })
            .await
            .expect("insert");

        let r = DataSourceReconciler::new(Arc::new(objects_returning(None)), store.clone());
        let outcome = r
            .sync(&ObjectKey::namespaced("team-a", "ds-1"))
            .await
            .expect("nothing to delete in team-a");

        assert_eq!(outcome, SyncOutcome::Deleted);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("uid-b").await.expect("kept").namespace, "team-b");
    }

    #[tokio::test]
    async fn failed_delete_is_requeued() {
        let mut store = MockDataSourceStore::new();
        store
            .expect_delete()
            .returning(|_, _| Err(StoreError::unavailable("connection refused")));

        let r = reconciler(objects_returning(None), store);
        let err = r.reconcile(&key("ds-1")).await.expect_err("delete failed");
        assert_eq!(r.error_policy(&key("ds-1"), &err), Action::requeue(DEFAULT_REQUEUE));
    }

    #[tokio::test]
    async fn fetch_error_is_requeued() {
        let mut objects = MockObjects::new();
        objects
            .expect_get()
            .returning(|_| Err(Error::internal_with_context("get", "apiserver unavailable")));
        let mut store = MockDataSourceStore::new();
        store.expect_get().never();
        store.expect_delete().never();

        let r = reconciler(objects, store);
        let err = r.reconcile(&key("ds-1")).await.expect_err("fetch failed");
        assert_eq!(r.error_policy(&key("ds-1"), &err), Action::requeue(DEFAULT_REQUEUE));
    }

    #[tokio::test]
    async fn lookup_error_skips_insert_and_update() {
        let mut store = MockDataSourceStore::new();
        store
            .expect_get()
            .returning(|_| Err(StoreError::unavailable("timeout")));
        store.expect_insert().never();
        store.expect_update().never();

        let r = reconciler(
            objects_returning(Some(datasource("abc", "ds-1", "3", "http://x"))),
            store,
        );
        let err = r.reconcile(&key("ds-1")).await.expect_err("lookup failed");
        assert!(err.is_retryable());
        assert_eq!(r.error_policy(&key("ds-1"), &err), Action::requeue(DEFAULT_REQUEUE));
    }

    #[tokio::test]
    async fn failed_insert_is_not_done() {
        let mut store = MockDataSourceStore::new();
        store
            .expect_get()
            .returning(|uid| Err(StoreError::not_found(uid)));
        store
            .expect_insert()
            .times(1)
            .returning(|_| Err(StoreError::unavailable("disk full")));

        let r = reconciler(
            objects_returning(Some(datasource("abc", "ds-1", "3", "http://x"))),
            store,
        );
        let err = r.reconcile(&key("ds-1")).await.expect_err("insert failed");
        assert_eq!(r.error_policy(&key("ds-1"), &err), Action::requeue(DEFAULT_REQUEUE));
    }

    #[tokio::test]
    async fn stale_update_is_retried() {
        let mut store = MockDataSourceStore::new();
        store
            .expect_get()
            .returning(|uid| Ok(DataSourceRecord { uid: uid.to_string(), ..Default::default() }));
        store
            .expect_update()
            .returning(|r| Err(StoreError::stale(&r.uid, "newer version stored")));

        let r = reconciler(
            objects_returning(Some(datasource("abc", "ds-1", "3", "http://x"))),
            store,
        );
        let err = r.reconcile(&key("ds-1")).await.expect_err("stale");
        assert!(err.is_stale_version());
        assert_eq!(r.error_policy(&key("ds-1"), &err), Action::requeue(DEFAULT_REQUEUE));
    }

    #[tokio::test]
    async fn non_numeric_resource_version_is_fatal_for_update() {
        let mut store = MockDataSourceStore::new();
        store
            .expect_get()
            .returning(|uid| Ok(DataSourceRecord { uid: uid.to_string(), ..Default::default() }));
        store.expect_update().never();

        let r = reconciler(
            objects_returning(Some(datasource("abc", "ds-1", "not-a-number", "http://x"))),
            store,
        );
        let err = r.reconcile(&key("ds-1")).await.expect_err("invalid version");
        assert!(matches!(err, Error::InvalidResourceVersion { .. }));
        assert_eq!(r.error_policy(&key("ds-1"), &err), Action::await_change());
    }

    #[tokio::test]
    async fn insert_then_update_converges() {
        let store = Arc::new(MemoryStore::new());
        let r = DataSourceReconciler::new(
            Arc::new(objects_returning(Some(datasource("abc", "ds-1", "3", "http://x")))),
            store.clone(),
        );

        assert_eq!(r.sync(&key("ds-1")).await.expect("first"), SyncOutcome::Inserted);
        let after_insert = store.get("abc").await.expect("record exists");

        assert_eq!(r.sync(&key("ds-1")).await.expect("second"), SyncOutcome::Updated);
        let after_update = store.get("abc").await.expect("record exists");

        assert_eq!(after_insert, after_update);
        assert_eq!(store.len(), 1);
        assert_eq!(after_update.json_data, json!({}));
    }

    /// Object getter whose answer changes between calls
    struct Sequenced {
        answers: Mutex<Vec<Option<DataSource>>>,
    }

    #[async_trait]
    impl ObjectGetter<DataSource> for Sequenced {
        async fn get(&self, _key: &ObjectKey) -> Result<Option<DataSource>, Error> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut answers = self.answers.lock().expect("lock");
            Ok(if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers.first().cloned().flatten()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_notifications_apply_in_arrival_order() {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(Sequenced {
            answers: Mutex::new(vec![
                Some(datasource("abc", "ds-1", "3", "http://old")),
                Some(datasource("abc", "ds-1", "4", "http://new")),
            ]),
        });
        let reconciler = Arc::new(DataSourceReconciler::new(objects, store.clone()));

        let (reader, mut writer) = reflector::store::<DataSource>();
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitDone);
        let (tx, rx) = mpsc::unbounded::<Result<DataSource, watcher::Error>>();

        let mut mgr = ControllerManager::new(
            ManagerOptions {
                concurrency: 4,
                ..Default::default()
            },
            Arc::new(NoopReporter),
        );
        mgr.add(ControllerDef::for_stream(
            CONTROLLER_NAME,
            rx.boxed(),
            reader,
            reconciler,
        ))
        .expect("register");
        let running = mgr.start();

        let notify = |writer: &mut reflector::store::Writer<DataSource>, version: &str| {
            let ds = datasource("abc", "ds-1", version, "http://x");
            writer.apply_watcher_event(&watcher::Event::Apply(ds.clone()));
            tx.unbounded_send(Ok(ds)).expect("controller is running");
        };
        notify(&mut writer, "3");
        tokio::time::sleep(Duration::from_millis(10)).await;
        notify(&mut writer, "4");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let record = store.get("abc").await.expect("record exists");
        assert_eq!(record.url, "http://new");
        assert_eq!(record.resource_version, "4");

        running.stop(CancellationToken::new()).await;
    }
}
