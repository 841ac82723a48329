//! Watch trigger that keeps deleted objects reconcilable
//!
//! `kube::runtime::Controller` only reconciles objects present in its
//! reflector store, and a plain reflector forgets an object as soon as its
//! delete event arrives. The trigger built here feeds the controller from its
//! own reflector writer and keeps the last state of a deleted object in the
//! store as a tombstone, so the delete is reconciled like any other change.
//! A tombstone is dropped once a reconcile that started after the deletion
//! succeeds. Objects that disappear across a relist are treated as deleted.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

type Tombstones<K> = Arc<Mutex<HashMap<ObjectRef<K>, String>>>;

/// Reconcile trigger plus the store the controller reads objects from
pub(crate) struct Source<K: Resource<DynamicType = ()> + 'static> {
    pub(crate) trigger: BoxStream<'static, Result<K, watcher::Error>>,
    pub(crate) reader: Store<K>,
    pub(crate) tombstones: Option<TombstoneHandle<K>>,
}

/// Lets reconciles report that a deletion has been handled
pub(crate) struct TombstoneHandle<K: Resource<DynamicType = ()>> {
    tombstones: Tombstones<K>,
    settled: mpsc::UnboundedSender<(ObjectRef<K>, String)>,
}

impl<K> TombstoneHandle<K>
where
    K: Resource<DynamicType = ()>,
{
    /// UID of the tombstone for `obj_ref`, if the object is deleted
    pub(crate) fn deleted_uid(&self, obj_ref: &ObjectRef<K>) -> Option<String> {
        self.tombstones.lock().get(obj_ref).cloned()
    }

    /// Drop the tombstone for `obj_ref` unless it was replaced meanwhile
    pub(crate) fn settle(&self, obj_ref: ObjectRef<K>, uid: String) {
        // the receiver only goes away with the controller itself
        let _ = self.settled.unbounded_send((obj_ref, uid));
    }
}

enum Input<K: Resource<DynamicType = ()>> {
    Watch(Result<Event<K>, watcher::Error>),
    Settled((ObjectRef<K>, String)),
}

/// Watch `api` and build a trigger that reconciles deletions too
pub(crate) fn watch_with_tombstones<K>(api: Api<K>, config: watcher::Config) -> Source<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut writer = Writer::<K>::default();
    let reader = writer.as_reader();
    let tombstones: Tombstones<K> = Arc::default();
    let (settled_tx, settled_rx) = mpsc::unbounded();

    let events = watcher::watcher(api, config).default_backoff().map(Input::Watch);
    let settled = settled_rx.map(Input::Settled);

    let store = reader.clone();
    let tracked = tombstones.clone();
    let trigger = stream::select(events, settled)
        .flat_map(move |input| {
            let out = match input {
                Input::Watch(Ok(event)) => apply(&mut writer, &store, &tracked, event),
                Input::Watch(Err(e)) => vec![Err(e)],
                Input::Settled((obj_ref, uid)) => {
                    forget(&mut writer, &store, &tracked, obj_ref, &uid);
                    Vec::new()
                }
            };
            stream::iter(out)
        })
        .boxed();

    Source {
        trigger,
        reader,
        tombstones: Some(TombstoneHandle {
            tombstones,
            settled: settled_tx,
        }),
    }
}

fn apply<K>(
    writer: &mut Writer<K>,
    store: &Store<K>,
    tombstones: &Tombstones<K>,
    event: Event<K>,
) -> Vec<Result<K, watcher::Error>>
where
    K: Resource<DynamicType = ()> + Clone,
{
    match event {
        Event::Apply(obj) | Event::InitApply(obj) => {
            tombstones.lock().remove(&ObjectRef::from_obj(&obj));
            writer.apply_watcher_event(&Event::Apply(obj.clone()));
            vec![Ok(obj)]
        }
        Event::Delete(obj) => {
            bury(writer, tombstones, &obj);
            vec![Ok(obj)]
        }
        Event::Init => {
            writer.apply_watcher_event(&Event::Init);
            Vec::new()
        }
        Event::InitDone => {
            let before = store.state();
            writer.apply_watcher_event(&Event::InitDone);
            before
                .into_iter()
                .filter(|old| store.get(&ObjectRef::from_obj(old.as_ref())).is_none())
                .map(|old| {
                    let obj = K::clone(&old);
                    debug!(object = %ObjectRef::from_obj(&obj), "Object vanished during relist");
                    bury(writer, tombstones, &obj);
                    Ok(obj)
                })
                .collect()
        }
    }
}

/// Keep `obj` in the store as a tombstone for its deletion
fn bury<K>(writer: &mut Writer<K>, tombstones: &Tombstones<K>, obj: &K)
where
    K: Resource<DynamicType = ()> + Clone,
{
    let uid = obj.uid().unwrap_or_default();
    tombstones.lock().insert(ObjectRef::from_obj(obj), uid);
    writer.apply_watcher_event(&Event::Apply(obj.clone()));
}

fn forget<K>(
    writer: &mut Writer<K>,
    store: &Store<K>,
    tombstones: &Tombstones<K>,
    obj_ref: ObjectRef<K>,
    uid: &str,
) where
    K: Resource<DynamicType = ()> + Clone,
{
    let mut tracked = tombstones.lock();
    if tracked.get(&obj_ref).map(String::as_str) != Some(uid) {
        return;
    }
    tracked.remove(&obj_ref);
    if let Some(obj) = store.get(&obj_ref) {
        writer.apply_watcher_event(&Event::Delete(K::clone(&obj)));
    }
}
