//! Object model store - the live mirror of firmware state.
//!
//! A single JSON document guarded by a reader-writer lock. The packet
//! router's ingress path is the only writer; every other component takes
//! shared read access. Each write bumps a monotonic revision, and
//! subscribers are notified through a watch channel once the write is
//! released.
//!
//! # Patch Semantics
//!
//! [`ObjectModelStore::apply_patch`] implements JSON Merge Patch with
//! two extensions: path segments may address array elements by integer
//! index, and `null` removes the addressed key. Applying the same patch
//! twice yields the same document.
//!
//! # Subscriptions
//!
//! A [`ModelSubscription`] yields the whole document on its first poll
//! (and after a firmware reset, which clears the delta log); afterwards
//! it yields the patches recorded since the revision it last saw.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tracing::{debug, trace};

/// Patches retained for delta subscriptions; older gaps fall back to a
/// full snapshot.
const PATCH_LOG_CAP: usize = 64;

/// One recorded patch, for delta subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRecord {
    /// Revision this patch produced.
    pub revision: u64,
    /// Dotted path of the patched subtree.
    pub path: String,
    /// The patch value.
    pub value: Value,
}

/// What a subscriber sees on one update.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    /// The entire document at the given revision.
    Full(Value, u64),
    /// The patches between the subscriber's last revision and the given
    /// one, in order.
    Delta(Vec<PatchRecord>, u64),
}

struct ModelDocument {
    root: Value,
    revision: u64,
    patch_log: VecDeque<PatchRecord>,
}

/// Lock, revision counter and notifier, shared with subscriptions.
struct Shared {
    doc: RwLock<ModelDocument>,
    revision_tx: watch::Sender<u64>,
}

/// Reader-writer guarded object model document.
pub struct ObjectModelStore {
    shared: Arc<Shared>,
}

impl ObjectModelStore {
    /// Creates an empty store at revision 0.
    #[must_use]
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                doc: RwLock::new(ModelDocument {
                    root: Value::Object(serde_json::Map::new()),
                    revision: 0,
                    patch_log: VecDeque::new(),
                }),
                revision_tx,
            }),
        }
    }

    /// Takes shared read access to the document.
    ///
    /// Many holders may exist concurrently; the ingress writer waits
    /// until they release.
    pub async fn read_only_access(&self) -> RwLockReadGuard<'_, Value> {
        RwLockReadGuard::map(self.shared.doc.read().await, |doc| &doc.root)
    }

    /// Takes exclusive access to the document.
    ///
    /// Observers are not notified until the returned guard drops; the
    /// delta log is cleared because out-of-band edits are not
    /// expressible as patches, so subscribers fall back to a full
    /// snapshot.
    pub async fn read_write_access(&self) -> ModelWriteAccess<'_> {
        ModelWriteAccess {
            guard: self.shared.doc.write().await,
            revision_tx: &self.shared.revision_tx,
        }
    }

    /// Clones the value at a dotted path, or `None` if absent.
    pub async fn get(&self, path: &str) -> Option<Value> {
        let doc = self.shared.doc.read().await;
        lookup(&doc.root, path).cloned()
    }

    /// Current revision.
    pub async fn revision(&self) -> u64 {
        self.shared.doc.read().await.revision
    }

    /// Applies a firmware patch at `path` and notifies subscribers.
    ///
    /// This is the ingress write path; it holds the write lock only for
    /// the duration of the merge.
    pub async fn apply_patch(&self, path: &str, patch: Value) -> u64 {
        let revision = {
            let mut doc = self.shared.doc.write().await;
            apply_at_path(&mut doc.root, path, &patch);
            doc.revision += 1;
            let revision = doc.revision;
            doc.patch_log.push_back(PatchRecord {
                revision,
                path: path.to_string(),
                value: patch,
            });
            while doc.patch_log.len() > PATCH_LOG_CAP {
                doc.patch_log.pop_front();
            }
            revision
        };
        trace!(path, revision, "object model patched");
        let _ = self.shared.revision_tx.send(revision);
        revision
    }

    /// Replaces the whole document, as after a firmware reset.
    ///
    /// Clears the delta log so every subscriber receives a full
    /// snapshot next.
    pub async fn reset(&self, root: Value) -> u64 {
        let revision = {
            let mut doc = self.shared.doc.write().await;
            doc.root = root;
            doc.revision += 1;
            doc.patch_log.clear();
            doc.revision
        };
        debug!(revision, "object model reset");
        let _ = self.shared.revision_tx.send(revision);
        revision
    }

    /// Creates a subscription; its first poll yields the full document.
    #[must_use]
    pub fn subscribe(&self) -> ModelSubscription {
        self.subscribe_filtered(None)
    }

    /// Creates a subscription restricted to the subtree at `filter`
    /// (a dotted path); `None` subscribes to everything.
    #[must_use]
    pub fn subscribe_filtered(&self, filter: Option<String>) -> ModelSubscription {
        ModelSubscription {
            shared: Arc::clone(&self.shared),
            rx: self.shared.revision_tx.subscribe(),
            last_revision: None,
            filter,
        }
    }
}

impl Default for ObjectModelStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive write access to the document.
///
/// Revision bump and subscriber notification happen when this guard
/// drops.
pub struct ModelWriteAccess<'a> {
    guard: tokio::sync::RwLockWriteGuard<'a, ModelDocument>,
    revision_tx: &'a watch::Sender<u64>,
}

impl std::ops::Deref for ModelWriteAccess<'_> {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.guard.root
    }
}

impl std::ops::DerefMut for ModelWriteAccess<'_> {
    fn deref_mut(&mut self) -> &mut Value {
        &mut self.guard.root
    }
}

impl Drop for ModelWriteAccess<'_> {
    fn drop(&mut self) {
        self.guard.revision += 1;
        self.guard.patch_log.clear();
        let _ = self.revision_tx.send(self.guard.revision);
    }
}

/// A change feed over the object model.
pub struct ModelSubscription {
    shared: Arc<Shared>,
    rx: watch::Receiver<u64>,
    last_revision: Option<u64>,
    /// Dotted-path subtree restriction, or `None` for the whole
    /// document.
    filter: Option<String>,
}

impl ModelSubscription {
    /// Waits for the next update.
    ///
    /// The first call resolves immediately with the full document (or
    /// the filtered subtree); subsequent calls suspend until the
    /// revision moves, then yield a delta when the patch log still
    /// covers the gap and a full snapshot otherwise.
    pub async fn next(&mut self) -> ModelUpdate {
        let since = match self.last_revision {
            Some(since) => since,
            None => {
                let doc = self.shared.doc.read().await;
                self.last_revision = Some(doc.revision);
                return ModelUpdate::Full(self.snapshot(&doc.root), doc.revision);
            }
        };

        loop {
            {
                let doc = self.shared.doc.read().await;
                if doc.revision > since {
                    self.last_revision = Some(doc.revision);
                    return self.delta_or_full(&doc, since);
                }
            }
            if self.rx.changed().await.is_err() {
                // Store torn down; report the last known state.
                let doc = self.shared.doc.read().await;
                self.last_revision = Some(doc.revision);
                return ModelUpdate::Full(self.snapshot(&doc.root), doc.revision);
            }
        }
    }

    fn snapshot(&self, root: &Value) -> Value {
        match &self.filter {
            Some(path) => lookup(root, path).cloned().unwrap_or(Value::Null),
            None => root.clone(),
        }
    }

    fn delta_or_full(&self, doc: &ModelDocument, since: u64) -> ModelUpdate {
        let covered = doc
            .patch_log
            .front()
            .is_some_and(|oldest| oldest.revision <= since + 1);
        if !covered {
            return ModelUpdate::Full(self.snapshot(&doc.root), doc.revision);
        }

        let patches: Vec<PatchRecord> = doc
            .patch_log
            .iter()
            .filter(|p| p.revision > since && self.touches_filter(&p.path))
            .cloned()
            .collect();
        // A patch above the filtered subtree cannot be narrowed to a
        // delta; fall back to a snapshot.
        if patches
            .iter()
            .any(|p| self.filter.as_deref().is_some_and(|f| !p.path.starts_with(f)))
        {
            return ModelUpdate::Full(self.snapshot(&doc.root), doc.revision);
        }
        ModelUpdate::Delta(patches, doc.revision)
    }

    /// Whether a patch path is relevant under the filter: inside the
    /// subtree, or an ancestor of it.
    fn touches_filter(&self, path: &str) -> bool {
        match self.filter.as_deref() {
            None => true,
            Some(filter) => path.starts_with(filter) || filter.starts_with(path),
        }
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match (current, segment.parse::<usize>()) {
            (Value::Array(items), Ok(index)) => items.get(index)?,
            (Value::Object(map), _) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

fn apply_at_path(root: &mut Value, path: &str, patch: &Value) {
    if path.is_empty() {
        merge_patch(root, patch);
        return;
    }

    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last().expect("path not empty");

    let mut current = root;
    for segment in parents {
        current = descend(current, segment);
    }

    // null at a leaf removes the key outright.
    if patch.is_null() {
        if let Value::Object(map) = current {
            map.remove(*last);
        }
        return;
    }
    merge_patch(descend(current, last), patch);
}

/// Steps into `segment`, materialising missing containers.
fn descend<'a>(current: &'a mut Value, segment: &str) -> &'a mut Value {
    if let Ok(index) = segment.parse::<usize>() {
        if !current.is_array() {
            *current = Value::Array(Vec::new());
        }
        let items = current.as_array_mut().expect("array just ensured");
        while items.len() <= index {
            items.push(Value::Null);
        }
        &mut items[index]
    } else {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current
            .as_object_mut()
            .expect("object just ensured")
            .entry(segment.to_string())
            .or_insert(Value::Null)
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let map = target.as_object_mut().expect("object just ensured");
            for (key, value) in entries {
                if value.is_null() {
                    map.remove(key);
                } else {
                    merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn patch_merges_objects() {
        let store = ObjectModelStore::new();
        store
            .apply_patch("", json!({"state": {"status": "idle", "upTime": 5}}))
            .await;
        store
            .apply_patch("", json!({"state": {"status": "processing"}}))
            .await;

        let doc = store.read_only_access().await;
        assert_eq!(doc["state"]["status"], "processing");
        assert_eq!(doc["state"]["upTime"], 5);
    }

    #[tokio::test]
    async fn null_removes_key() {
        let store = ObjectModelStore::new();
        store.apply_patch("", json!({"job": {"file": "a.g"}})).await;
        store.apply_patch("", json!({"job": {"file": null}})).await;

        let doc = store.read_only_access().await;
        assert_eq!(doc["job"], json!({}));
    }

    #[tokio::test]
    async fn array_index_in_path() {
        let store = ObjectModelStore::new();
        store
            .apply_patch("heat.heaters.1", json!({"active": 60.0}))
            .await;

        let doc = store.read_only_access().await;
        assert_eq!(doc["heat"]["heaters"][0], Value::Null);
        assert_eq!(doc["heat"]["heaters"][1]["active"], 60.0);
    }

    #[tokio::test]
    async fn revisions_are_strictly_monotone() {
        let store = ObjectModelStore::new();
        let a = store.apply_patch("", json!({"a": 1})).await;
        let b = store.apply_patch("", json!({"b": 2})).await;
        let c = store.reset(json!({})).await;
        assert!(a < b && b < c);
        assert_eq!(store.revision().await, c);
    }

    #[tokio::test]
    async fn same_patch_twice_is_idempotent() {
        let store = ObjectModelStore::new();
        let patch = json!({"move": {"axes": [{"homed": true}]}});
        store.apply_patch("", patch.clone()).await;
        let first = store.read_only_access().await.clone();
        store.apply_patch("", patch).await;
        let second = store.read_only_access().await.clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn subscriber_gets_full_then_delta() {
        let store = Arc::new(ObjectModelStore::new());
        store.apply_patch("", json!({"state": {"status": "idle"}})).await;

        let mut sub = store.subscribe();
        let first = sub.next().await;
        assert!(matches!(first, ModelUpdate::Full(_, 1)));

        store
            .apply_patch("state", json!({"status": "processing"}))
            .await;
        match sub.next().await {
            ModelUpdate::Delta(patches, 2) => {
                assert_eq!(patches.len(), 1);
                assert_eq!(patches[0].path, "state");
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filtered_subscription_narrows_to_subtree() {
        let store = Arc::new(ObjectModelStore::new());
        store
            .apply_patch("", json!({"heat": {"bed": 60}, "move": {"speed": 100}}))
            .await;

        let mut sub = store.subscribe_filtered(Some("heat".into()));
        match sub.next().await {
            ModelUpdate::Full(value, _) => assert_eq!(value, json!({"bed": 60})),
            other => panic!("expected snapshot, got {other:?}"),
        }

        // A patch inside the subtree arrives as a delta.
        store.apply_patch("heat", json!({"bed": 65})).await;
        match sub.next().await {
            ModelUpdate::Delta(patches, _) => {
                assert_eq!(patches.len(), 1);
                assert_eq!(patches[0].path, "heat");
            }
            other => panic!("expected delta, got {other:?}"),
        }

        // A patch above the subtree falls back to a snapshot.
        store.apply_patch("", json!({"heat": {"bed": 70}})).await;
        match sub.next().await {
            ModelUpdate::Full(value, _) => assert_eq!(value, json!({"bed": 70})),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_forces_full_snapshot() {
        let store = Arc::new(ObjectModelStore::new());
        let mut sub = store.subscribe();
        sub.next().await;

        store.reset(json!({"state": {"status": "starting"}})).await;
        assert!(matches!(sub.next().await, ModelUpdate::Full(_, _)));
    }

    #[tokio::test]
    async fn write_access_notifies_on_release() {
        let store = Arc::new(ObjectModelStore::new());
        {
            let mut access = store.read_write_access().await;
            access["custom"] = json!(true);
        }
        assert_eq!(store.revision().await, 1);
        assert_eq!(store.get("custom").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn get_resolves_dotted_paths() {
        let store = ObjectModelStore::new();
        store
            .apply_patch("", json!({"tools": [{"number": 0}, {"number": 1}]}))
            .await;
        assert_eq!(store.get("tools.1.number").await, Some(json!(1)));
        assert_eq!(store.get("tools.5").await, None);
        assert_eq!(store.get("nope").await, None);
    }
}
