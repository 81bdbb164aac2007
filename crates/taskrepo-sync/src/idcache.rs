//! Identifier stability: short display numbers mapped to durable uuids.
//!
//! The cache lives in the repository's git directory and is never
//! committed. [`reconcile`] is pure; only [`IdCacheStore::save`] writes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use taskrepo_core::{DisplayId, TaskRecord, TaskUuid};

use crate::error::SyncError;

/// Cached display id of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCacheEntry {
    pub display_id: DisplayId,
    pub last_seen_modified: DateTime<Utc>,
}

/// `uuid -> display id` for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdCache {
    entries: BTreeMap<TaskUuid, IdCacheEntry>,
}

impl IdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, uuid: &TaskUuid) -> Option<&IdCacheEntry> {
        self.entries.get(uuid)
    }

    pub fn insert(&mut self, uuid: TaskUuid, entry: IdCacheEntry) {
        self.entries.insert(uuid, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskUuid, &IdCacheEntry)> {
        self.entries.iter()
    }

    pub fn display_id_of(&self, uuid: &TaskUuid) -> Option<DisplayId> {
        self.entries.get(uuid).map(|e| e.display_id)
    }

    pub fn uuid_of(&self, display_id: DisplayId) -> Option<&TaskUuid> {
        self.entries
            .iter()
            .find(|(_, e)| e.display_id == display_id)
            .map(|(uuid, _)| uuid)
    }
}

/// How [`reconcile`] numbers records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdMode {
    /// Keep existing numbers, gap-fill new records.
    Stable,
    /// Renumber `1..N` in listing order.
    Rebalance,
}

/// Display ids in listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisplayAssignment {
    pub ordered: Vec<(TaskUuid, DisplayId)>,
    /// Records whose number differs from the previous cache (new ones included).
    pub changed: usize,
}

/// Assign display ids for `records` against the previous cache.
///
/// `order` is the listing comparator; ties fall back to the uuid so the
/// result is deterministic.
pub fn reconcile<F>(
    records: &[TaskRecord],
    previous: &IdCache,
    mode: IdMode,
    order: F,
) -> (IdCache, DisplayAssignment)
where
    F: Fn(&TaskRecord, &TaskRecord) -> Ordering,
{
    let mut listed: Vec<&TaskRecord> = records.iter().collect();
    listed.sort_by(|a, b| order(a, b).then_with(|| a.uuid.cmp(&b.uuid)));

    let mut assigned: Vec<Option<DisplayId>> = vec![None; listed.len()];
    let mut seen = HashSet::new();
    match mode {
        IdMode::Rebalance => {
            for (slot, n) in assigned.iter_mut().zip(1u32..) {
                *slot = DisplayId::new(n);
            }
        }
        IdMode::Stable => {
            let mut used = BTreeSet::new();
            for (slot, record) in assigned.iter_mut().zip(&listed) {
                if !seen.insert(&record.uuid) {
                    continue;
                }
                if let Some(entry) = previous.get(&record.uuid) {
                    if used.insert(entry.display_id.get()) {
                        *slot = Some(entry.display_id);
                    } else {
                        warn!(uuid = %record.uuid, display_id = %entry.display_id, "Duplicate display id in cache; reassigning");
                    }
                }
            }
            let mut candidate = 1u32;
            for slot in assigned.iter_mut().filter(|s| s.is_none()) {
                while used.contains(&candidate) {
                    candidate += 1;
                }
                used.insert(candidate);
                *slot = DisplayId::new(candidate);
            }
        }
    }

    let mut cache = IdCache::new();
    let mut assignment = DisplayAssignment::default();
    for (record, display_id) in listed.iter().zip(assigned) {
        let Some(display_id) = display_id else { continue };
        if cache.get(&record.uuid).is_some() {
            continue;
        }
        if previous.display_id_of(&record.uuid) != Some(display_id) {
            assignment.changed += 1;
        }
        cache.insert(
            record.uuid.clone(),
            IdCacheEntry {
                display_id,
                last_seen_modified: record.modified,
            },
        );
        assignment.ordered.push((record.uuid.clone(), display_id));
    }
    debug!(records = cache.len(), changed = assignment.changed, ?mode, "Reconciled display ids");
    (cache, assignment)
}

/// One listing sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Priority,
    Due,
    Created,
    Modified,
    Status,
    Title,
    Project,
}

impl std::str::FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(Self::Priority),
            "due" => Ok(Self::Due),
            "created" => Ok(Self::Created),
            "modified" => Ok(Self::Modified),
            "status" => Ok(Self::Status),
            "title" => Ok(Self::Title),
            "project" => Ok(Self::Project),
            other => Err(format!("unknown sort key '{other}'")),
        }
    }
}

/// Listing order built from sort keys such as `["priority", "-due"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingOrder {
    keys: Vec<(SortKey, bool)>,
}

impl Default for ListingOrder {
    fn default() -> Self {
        Self {
            keys: vec![(SortKey::Priority, false), (SortKey::Due, false)],
        }
    }
}

impl ListingOrder {
    /// Parse keys; a leading `-` sorts that key descending.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self, String> {
        let keys = fields
            .iter()
            .map(|field| {
                let field = field.as_ref().trim();
                match field.strip_prefix('-') {
                    Some(name) => name.parse().map(|key| (key, true)),
                    None => field.parse().map(|key| (key, false)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }

    pub fn compare(&self, a: &TaskRecord, b: &TaskRecord) -> Ordering {
        for (key, descending) in &self.keys {
            let ord = compare_key(*key, a, b);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.uuid.cmp(&b.uuid)
    }
}

/// Present values first, then missing ones.
fn some_first<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_key(key: SortKey, a: &TaskRecord, b: &TaskRecord) -> Ordering {
    match key {
        SortKey::Priority => a.priority.rank().cmp(&b.priority.rank()),
        SortKey::Due => some_first(a.due.map(|d| d.sort_key()), b.due.map(|d| d.sort_key())),
        SortKey::Created => a.created.cmp(&b.created),
        SortKey::Modified => a.modified.cmp(&b.modified),
        SortKey::Status => a.status.rank().cmp(&b.status.rank()),
        SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        SortKey::Project => some_first(a.project.as_deref(), b.project.as_deref()),
    }
}

/// Identifier cache file of one repository.
#[derive(Debug, Clone)]
pub struct IdCacheStore {
    path: PathBuf,
}

impl IdCacheStore {
    /// `relative` is resolved against the repository's git directory.
    pub fn new(git_dir: &Path, relative: &Path) -> Self {
        Self {
            path: git_dir.join(relative),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cache. A missing or unreadable cache starts empty.
    pub fn load(&self) -> Result<IdCache, SyncError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(IdCache::new()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&text) {
            Ok(cache) => Ok(cache),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Identifier cache is corrupt; rebuilding");
                Ok(IdCache::new())
            }
        }
    }

    pub fn save(&self, cache: &IdCache) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(cache)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use taskrepo_core::Priority;
    use tempfile::TempDir;

    fn record(uuid: &str, hour: u32) -> TaskRecord {
        let t = Utc.with_ymd_and_hms(2025, 5, 1, hour, 0, 0).unwrap();
        TaskRecord::new(format!("task {uuid}"))
            .with_uuid(uuid)
            .with_timestamps(t, t)
    }

    fn by_created(a: &TaskRecord, b: &TaskRecord) -> Ordering {
        a.created.cmp(&b.created)
    }

    fn cache_of(pairs: &[(&str, u32)]) -> IdCache {
        let mut cache = IdCache::new();
        for (uuid, id) in pairs {
            cache.insert(
                TaskUuid::new(*uuid),
                IdCacheEntry {
                    display_id: DisplayId::new(*id).unwrap(),
                    last_seen_modified: Utc::now(),
                },
            );
        }
        cache
    }

    fn ids(cache: &IdCache, uuids: &[&str]) -> Vec<u32> {
        uuids
            .iter()
            .map(|u| cache.display_id_of(&TaskUuid::new(*u)).unwrap().get())
            .collect()
    }

    #[test]
    fn test_stable_mode_gap_fills_freed_slot() {
        let previous = cache_of(&[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]);
        let records = vec![
            record("a", 1),
            record("b", 2),
            record("d", 4),
            record("e", 5),
            record("n", 6),
        ];

        let (cache, assignment) = reconcile(&records, &previous, IdMode::Stable, by_created);
        assert_eq!(ids(&cache, &["a", "b", "d", "e", "n"]), vec![1, 2, 4, 5, 3]);
        assert_eq!(assignment.changed, 1);
        assert!(cache.get(&TaskUuid::new("c")).is_none());
    }

    #[test]
    fn test_rebalance_renumbers_in_listing_order() {
        let previous = cache_of(&[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]);
        let records = vec![record("a", 1), record("b", 2), record("d", 4), record("e", 5)];

        let (cache, assignment) = reconcile(&records, &previous, IdMode::Rebalance, by_created);
        assert_eq!(ids(&cache, &["a", "b", "d", "e"]), vec![1, 2, 3, 4]);
        assert_eq!(assignment.changed, 2);
        assert_eq!(
            assignment.ordered.iter().map(|(u, _)| u.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "d", "e"]
        );
    }

    #[test]
    fn test_duplicate_ids_keep_first_claimant() {
        let previous = cache_of(&[("a", 1), ("b", 1), ("c", 2)]);
        let records = vec![record("a", 1), record("b", 2), record("c", 3)];

        let (cache, _) = reconcile(&records, &previous, IdMode::Stable, by_created);
        assert_eq!(ids(&cache, &["a", "b", "c"]), vec![1, 3, 2]);
    }

    #[test]
    fn test_reconcile_is_pure_and_lookups_are_consistent() {
        let previous = cache_of(&[("a", 7)]);
        let records = vec![record("a", 1), record("b", 2)];
        let (cache, _) = reconcile(&records, &previous, IdMode::Stable, by_created);
        assert_eq!(previous.display_id_of(&TaskUuid::new("a")).unwrap().get(), 7);
        assert_eq!(cache.uuid_of(DisplayId::new(1).unwrap()).unwrap().as_str(), "b");
        assert_eq!(cache.uuid_of(DisplayId::new(7).unwrap()).unwrap().as_str(), "a");
    }

    #[test]
    fn test_listing_order_keys() {
        let order = ListingOrder::from_fields(&["priority", "-created"]).unwrap();
        let high = record("h", 1).with_priority(Priority::High);
        let old = record("o", 1);
        let new = record("n", 5);
        let mut listed = vec![&old, &high, &new];
        listed.sort_by(|a, b| order.compare(a, b));
        assert_eq!(
            listed.iter().map(|r| r.uuid.as_str()).collect::<Vec<_>>(),
            vec!["h", "n", "o"]
        );
        assert!(ListingOrder::from_fields(&["size"]).is_err());
    }

    #[test]
    fn test_store_round_trip_and_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let store = IdCacheStore::new(dir.path(), Path::new("taskrepo/id_cache.json"));
        assert!(store.load().unwrap().is_empty());

        let cache = cache_of(&[("a", 1), ("b", 2)]);
        store.save(&cache).unwrap();
        assert_eq!(store.load().unwrap(), cache);

        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
