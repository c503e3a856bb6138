//! Removal manager - TTL sweeps and cascading deletes
//!
//! Every pass walks the given handles and removes matching entities through
//! them, so removals replicate like any other write. A removal that fails
//! is logged and counted; it never stops the rest of the pass. Passes over
//! several handles also remove whatever holds a hard reference to an
//! entity they removed.

use crate::error::StoreResult;
use crate::handle::Handle;
use crate::Storage;
use async_trait::async_trait;
use replica_core::{RawEntity, ReferenceId, StorageKey, TimeSource};
use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one removal pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: usize,
    pub failed: usize,
}

impl AddAssign for RemovalReport {
    fn add_assign(&mut self, other: Self) {
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

/// Entities a step removed, keyed the way references name them.
type Removed = Vec<(StorageKey, ReferenceId)>;

/// Decides whether an id in a foreign namespace still exists.
#[async_trait]
pub trait ForeignReferenceChecker: Send + Sync {
    async fn is_valid(&self, namespace: &str, id: &str) -> bool;
}

pub struct RemovalManager {
    time: Arc<dyn TimeSource>,
}

impl RemovalManager {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self { time }
    }

    /// Removes every entity whose expiration is at or before now.
    pub async fn remove_expired(&self, handle: &Handle) -> RemovalReport {
        let now = self.time.current_time_millis();
        remove_where(handle, |entity| entity.is_expired(now)).await.0
    }

    /// Removes expired entities from every handle, then whatever holds a
    /// hard reference to one of them.
    pub async fn sweep_expired(&self, handles: &[Arc<Handle>]) -> RemovalReport {
        let now = self.time.current_time_millis();
        let mut report = RemovalReport::default();
        let mut removed = Removed::new();
        for handle in handles {
            let (step, gone) = remove_where(handle, |entity| entity.is_expired(now)).await;
            report += step;
            removed.extend(gone);
        }
        report += self.cascade(handles, removed).await;
        report
    }

    /// Removes entities created in `[start, end]`; an open end means now.
    pub async fn remove_created_between(&self, handle: &Handle, start: i64, end: Option<i64>) -> RemovalReport {
        let end = end.unwrap_or_else(|| self.time.current_time_millis());
        remove_where(handle, |entity| {
            entity
                .creation_timestamp
                .is_some_and(|created| created >= start && created <= end)
        })
        .await
        .0
    }

    pub async fn remove_all(&self, handle: &Handle) -> RemovalReport {
        remove_where(handle, |_| true).await.0
    }

    /// Empties every handle once the backend grows past `max_bytes`.
    pub async fn enforce_storage_budget(
        &self,
        handles: &[Arc<Handle>],
        storage: &dyn Storage,
        max_bytes: usize,
    ) -> StoreResult<RemovalReport> {
        let stats = storage.stats().await?;
        let mut report = RemovalReport::default();
        if stats.total_size_bytes <= max_bytes {
            return Ok(report);
        }
        info!(
            size = stats.total_size_bytes,
            budget = max_bytes,
            "Storage over budget, clearing all handles"
        );
        let mut removed = Removed::new();
        for handle in handles {
            let (step, gone) = remove_where(handle, |_| true).await;
            report += step;
            removed.extend(gone);
        }
        report += self.cascade(handles, removed).await;
        Ok(report)
    }

    /// Removes every entity holding a hard reference to `id` under
    /// `storage_key`, wherever in the entity the reference sits, and then
    /// whatever hard-references those in turn.
    pub async fn trigger_hard_reference_deletion(
        &self,
        handles: &[Arc<Handle>],
        storage_key: &StorageKey,
        id: &str,
    ) -> RemovalReport {
        self.cascade(handles, vec![(storage_key.clone(), id.to_string())])
            .await
    }

    /// Removes entities with a hard foreign reference the checker rejects.
    pub async fn remove_invalid_foreign_references(
        &self,
        handles: &[Arc<Handle>],
        checker: &dyn ForeignReferenceChecker,
    ) -> RemovalReport {
        let mut report = RemovalReport::default();
        let mut removed = Removed::new();
        for handle in handles {
            let mut doomed = Vec::new();
            for entity in handle.fetch_all_unfiltered() {
                if has_invalid_foreign_reference(&entity, checker).await {
                    doomed.push(entity);
                }
            }
            let (step, gone) = remove_each(handle, doomed).await;
            report += step;
            removed.extend(gone);
        }
        report += self.cascade(handles, removed).await;
        report
    }

    /// An id in `namespace` was deleted externally.
    pub async fn trigger_foreign_deletion(&self, handles: &[Arc<Handle>], namespace: &str, id: &str) -> RemovalReport {
        self.trigger_hard_reference_deletion(handles, &StorageKey::foreign(namespace), id)
            .await
    }

    /// Follows hard references from `removed` until nothing more goes.
    async fn cascade(&self, handles: &[Arc<Handle>], mut removed: Removed) -> RemovalReport {
        let mut report = RemovalReport::default();
        let mut visited = HashSet::new();
        while let Some((key, id)) = removed.pop() {
            if !visited.insert((key.to_string(), id.clone())) {
                continue;
            }
            let mut step = RemovalReport::default();
            for handle in handles {
                let (part, gone) =
                    remove_where(handle, |entity| entity.has_hard_reference_to(Some(&key), &id)).await;
                step += part;
                removed.extend(gone);
            }
            if step.removed > 0 {
                info!(key = %key, id = %id, removed = step.removed, "Cascaded hard delete");
            }
            report += step;
        }
        report
    }
}

async fn has_invalid_foreign_reference(entity: &RawEntity, checker: &dyn ForeignReferenceChecker) -> bool {
    for reference in entity.hard_references() {
        if let StorageKey::Foreign { namespace } = &reference.storage_key {
            if !checker.is_valid(namespace, &reference.id).await {
                return true;
            }
        }
    }
    false
}

async fn remove_where(handle: &Handle, predicate: impl Fn(&RawEntity) -> bool) -> (RemovalReport, Removed) {
    let doomed: Vec<RawEntity> = handle
        .fetch_all_unfiltered()
        .into_iter()
        .filter(|entity| predicate(entity))
        .collect();
    remove_each(handle, doomed).await
}

async fn remove_each(handle: &Handle, entities: Vec<RawEntity>) -> (RemovalReport, Removed) {
    let mut report = RemovalReport::default();
    let mut removed = Removed::new();
    let key = handle.entity_storage_key();
    for entity in entities {
        match handle.remove(&entity).await {
            Ok(true) => {
                debug!(handle = handle.name(), id = %entity.id, "Removed");
                report.removed += 1;
                removed.push((key.clone(), entity.id));
            }
            Ok(false) => {
                warn!(handle = handle.name(), id = %entity.id, "Store refused removal");
                report.failed += 1;
            }
            Err(e) => {
                warn!(handle = handle.name(), id = %entity.id, error = %e, "Removal failed");
                report.failed += 1;
            }
        }
    }
    (report, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandleOptions, MemoryStorage, StoreManager};
    use replica_core::{CrdtKind, FakeTimeSource, FieldValue, Reference, Ttl};
    use std::collections::HashSet;

    struct Fixture {
        manager: StoreManager,
        time: Arc<FakeTimeSource>,
        removal: RemovalManager,
    }

    impl Fixture {
        fn new() -> Self {
            let time = Arc::new(FakeTimeSource::new(1_000));
            Self {
                manager: StoreManager::new(Arc::new(MemoryStorage::new())),
                removal: RemovalManager::new(time.clone()),
                time,
            }
        }

        async fn handle(&self, path: &str, ttl: Ttl) -> Arc<Handle> {
            let store = self
                .manager
                .get(&StorageKey::ramdisk(path), CrdtKind::Set)
                .await
                .unwrap();
            let options = HandleOptions {
                ttl,
                time: self.time.clone(),
            };
            let handle = Handle::open("sweeper", store, options).await.unwrap();
            handle.idle().await;
            handle
        }
    }

    impl Fixture {
        async fn reference_mode_handle(&self, collection: &str, name: &str) -> Arc<Handle> {
            let key = StorageKey::reference_mode(StorageKey::ramdisk("entities"), StorageKey::ramdisk(collection));
            let store = self.manager.get(&key, CrdtKind::Set).await.unwrap();
            let options = HandleOptions {
                ttl: Ttl::Infinite,
                time: self.time.clone(),
            };
            let handle = Handle::open(name, store, options).await.unwrap();
            handle.idle().await;
            handle
        }
    }

    fn ids(handle: &Handle) -> Vec<String> {
        handle.fetch_all_unfiltered().into_iter().map(|e| e.id).collect()
    }

    #[tokio::test]
    async fn test_expired_entities_are_swept_only_when_asked() {
        let fx = Fixture::new();
        let handle = fx.handle("ttl", Ttl::Minutes(1)).await;
        handle.store(RawEntity::new("old")).await.unwrap();
        fx.time.advance(30_000);
        handle.store(RawEntity::new("new")).await.unwrap();

        fx.time.advance(31_000);
        // Hidden from reads, but still stored until the sweep.
        assert_eq!(handle.fetch_all().len(), 1);
        assert_eq!(ids(&handle), vec!["new", "old"]);

        let report = fx.removal.remove_expired(&handle).await;
        assert_eq!(report, RemovalReport { removed: 1, failed: 0 });
        assert_eq!(ids(&handle), vec!["new"]);
    }

    #[tokio::test]
    async fn test_remove_created_between() {
        let fx = Fixture::new();
        let handle = fx.handle("window", Ttl::Infinite).await;
        for (id, at) in [("a", 1_000), ("b", 2_000), ("c", 3_000)] {
            fx.time.set(at);
            handle.store(RawEntity::new(id)).await.unwrap();
        }

        let report = fx.removal.remove_created_between(&handle, 1_500, Some(2_500)).await;
        assert_eq!(report.removed, 1);
        assert_eq!(ids(&handle), vec!["a", "c"]);

        let report = fx.removal.remove_created_between(&handle, 2_000, None).await;
        assert_eq!(report.removed, 1);
        assert_eq!(ids(&handle), vec!["a"]);
    }

    #[tokio::test]
    async fn test_hard_reference_deletion_cascades_everywhere() {
        let fx = Fixture::new();
        let target_key = StorageKey::ramdisk("people");
        let hard = Reference::new("p1", target_key.clone()).hard();
        let soft = Reference::new("p1", target_key.clone());
        let other = Reference::new("p2", target_key.clone()).hard();

        let notes = fx.handle("notes", Ttl::Infinite).await;
        let inline = RawEntity::new("inline").with_singleton("owner", Some(hard.clone().into()));
        let nested = RawEntity::new("nested").with_singleton(
            "meta",
            Some(RawEntity::new("m").with_singleton("owner", Some(hard.clone().into())).into()),
        );
        let listed = RawEntity::new("listed").with_collection("owners", vec![FieldValue::List(vec![hard.into()])]);
        let weak = RawEntity::new("weak").with_singleton("owner", Some(soft.into()));
        let unrelated = RawEntity::new("unrelated").with_singleton("owner", Some(other.into()));
        for entity in [inline, nested, listed, weak, unrelated] {
            notes.store(entity).await.unwrap();
        }
        let others = fx.handle("others", Ttl::Infinite).await;
        others
            .store(RawEntity::new("x").with_singleton(
                "owner",
                Some(Reference::new("p1", StorageKey::ramdisk("elsewhere")).hard().into()),
            ))
            .await
            .unwrap();

        let report = fx
            .removal
            .trigger_hard_reference_deletion(&[notes.clone(), others.clone()], &target_key, "p1")
            .await;
        assert_eq!(report, RemovalReport { removed: 3, failed: 0 });
        assert_eq!(ids(&notes), vec!["unrelated", "weak"]);
        assert_eq!(ids(&others), vec!["x"]);
    }

    struct AllowList(HashSet<&'static str>);

    #[async_trait]
    impl ForeignReferenceChecker for AllowList {
        async fn is_valid(&self, namespace: &str, id: &str) -> bool {
            namespace == "users" && self.0.contains(id)
        }
    }

    #[tokio::test]
    async fn test_foreign_references() {
        let fx = Fixture::new();
        let handle = fx.handle("posts", Ttl::Infinite).await;
        let by = |id: &str, user: &str| {
            RawEntity::new(id).with_singleton(
                "author",
                Some(Reference::new(user, StorageKey::foreign("users")).hard().into()),
            )
        };
        for entity in [by("post1", "ann"), by("post2", "bob"), by("post3", "cy")] {
            handle.store(entity).await.unwrap();
        }
        let handles = [handle.clone()];

        let checker = AllowList(["ann", "cy"].into_iter().collect());
        let report = fx.removal.remove_invalid_foreign_references(&handles, &checker).await;
        assert_eq!(report.removed, 1);
        assert_eq!(ids(&handle), vec!["post1", "post3"]);

        let report = fx.removal.trigger_foreign_deletion(&handles, "users", "cy").await;
        assert_eq!(report.removed, 1);
        assert_eq!(ids(&handle), vec!["post1"]);
    }

    #[tokio::test]
    async fn test_foreign_deletion_reaches_nested_references_in_reference_mode() {
        let fx = Fixture::new();
        let writer = fx.reference_mode_handle("parents", "writer").await;
        let user = || FieldValue::from(Reference::new("id1", StorageKey::foreign("users")).hard());

        let child = RawEntity::new("c1").with_singleton("owner", Some(user()));
        let p1 = RawEntity::new("p1").with_singleton("child", Some(child.into()));
        let meta = RawEntity::new("m1").with_collection("owners", vec![FieldValue::List(vec![user()])]);
        let p2 = RawEntity::new("p2").with_singleton("meta", Some(meta.into()));
        writer.store(p1).await.unwrap();
        writer.store(p2).await.unwrap();
        writer.idle().await;

        let reader = fx.reference_mode_handle("parents", "reader").await;
        assert_eq!(ids(&reader), vec!["p1", "p2"]);

        let report = fx
            .removal
            .trigger_foreign_deletion(&[reader.clone()], "users", "id1")
            .await;
        assert_eq!(report, RemovalReport { removed: 2, failed: 0 });
        writer.idle().await;
        assert!(ids(&reader).is_empty());
        assert!(ids(&writer).is_empty());

        let fresh = fx.reference_mode_handle("parents", "fresh").await;
        assert_eq!(fresh.fetch_all_unfiltered().len(), 0);
    }

    #[tokio::test]
    async fn test_hard_deletes_follow_chains() {
        let fx = Fixture::new();
        let people = fx.handle("people", Ttl::Infinite).await;
        let notes = fx.handle("notes", Ttl::Infinite).await;
        let pins = fx.handle("pins", Ttl::Infinite).await;

        people.store(RawEntity::new("ann")).await.unwrap();
        let owner = people.create_reference(&RawEntity::new("ann"), true).unwrap();
        let note = RawEntity::new("n1").with_singleton("owner", Some(owner.into()));
        notes.store(note.clone()).await.unwrap();
        let pinned = notes.create_reference(&note, true).unwrap();
        pins.store(RawEntity::new("pin1").with_singleton("note", Some(pinned.into())))
            .await
            .unwrap();

        let handles = [people.clone(), notes.clone(), pins.clone()];
        let report = fx
            .removal
            .trigger_hard_reference_deletion(&handles, &StorageKey::ramdisk("people"), "ann")
            .await;
        assert_eq!(report.removed, 2);
        assert_eq!(ids(&people), vec!["ann"]);
        assert!(ids(&notes).is_empty());
        assert!(ids(&pins).is_empty());
    }

    #[tokio::test]
    async fn test_sweep_cascades_from_expired_entities() {
        let fx = Fixture::new();
        let sessions = fx.handle("sessions", Ttl::Minutes(1)).await;
        let logs = fx.handle("logs", Ttl::Infinite).await;
        sessions.store(RawEntity::new("s1")).await.unwrap();
        let session = sessions.create_reference(&RawEntity::new("s1"), true).unwrap();
        logs.store(RawEntity::new("l1").with_singleton("session", Some(session.into())))
            .await
            .unwrap();
        logs.store(RawEntity::new("l2")).await.unwrap();

        fx.time.advance(60_000);
        let report = fx.removal.sweep_expired(&[sessions.clone(), logs.clone()]).await;
        assert_eq!(report, RemovalReport { removed: 2, failed: 0 });
        assert!(ids(&sessions).is_empty());
        assert_eq!(ids(&logs), vec!["l2"]);
    }

    #[tokio::test]
    async fn test_storage_budget() {
        let fx = Fixture::new();
        let handle = fx.handle("big", Ttl::Infinite).await;
        for n in 0..5 {
            handle.store(RawEntity::new(format!("e{}", n))).await.unwrap();
        }
        handle.idle().await;
        let storage = fx.manager.storage().clone();
        let handles = [handle.clone()];

        let report = fx
            .removal
            .enforce_storage_budget(&handles, storage.as_ref(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(report, RemovalReport::default());
        assert_eq!(ids(&handle).len(), 5);

        let report = fx
            .removal
            .enforce_storage_budget(&handles, storage.as_ref(), 1)
            .await
            .unwrap();
        assert_eq!(report.removed, 5);
        assert!(ids(&handle).is_empty());
    }
}
