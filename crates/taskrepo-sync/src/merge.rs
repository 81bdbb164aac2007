//! Field-level three-way merge of task records.
//!
//! Every field has a fixed policy:
//!
//! | category | fields | rule when both sides changed |
//! |---|---|---|
//! | simple   | priority, project, due | later `modified` wins, tie keeps local |
//! | semantic | status | remote wins |
//! | content  | title, description | manual if too dissimilar, else simple rule |
//! | list     | assignees, tags, links, depends | union, or side-respecting union under a major edit |
//!
//! A change made on one side only always wins.

use std::time::Duration;

use serde::Serialize;
use similar::TextDiff;

use taskrepo_core::{OrderedSet, TaskRecord};

use crate::config::{MergeStrategy, SyncPolicy};

/// Titles less similar than this need a human.
pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.70;

/// Descriptions less similar than this need a human.
pub const DESCRIPTION_SIMILARITY_THRESHOLD: f64 = 0.50;

/// Contested content/semantic fields that make a record a major edit.
const MAJOR_EDIT_FIELD_COUNT: usize = 2;

/// Fields that take part in a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Description,
    Status,
    Priority,
    Project,
    Due,
    Assignees,
    Tags,
    Links,
    Depends,
}

/// Merge policy group a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCategory {
    Simple,
    List,
    Semantic,
    Content,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Title,
        Field::Description,
        Field::Status,
        Field::Priority,
        Field::Project,
        Field::Due,
        Field::Assignees,
        Field::Tags,
        Field::Links,
        Field::Depends,
    ];

    pub fn category(&self) -> FieldCategory {
        match self {
            Self::Title | Self::Description => FieldCategory::Content,
            Self::Status => FieldCategory::Semantic,
            Self::Priority | Self::Project | Self::Due => FieldCategory::Simple,
            Self::Assignees | Self::Tags | Self::Links | Self::Depends => FieldCategory::List,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::Project => "project",
            Self::Due => "due",
            Self::Assignees => "assignees",
            Self::Tags => "tags",
            Self::Links => "links",
            Self::Depends => "depends",
        }
    }

    /// Human-readable value of this field on a record.
    pub fn display_value(&self, record: &TaskRecord) -> String {
        fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
            items.collect::<Vec<_>>().join(", ")
        }
        match self {
            Self::Title => record.title.clone(),
            Self::Description => record.description.clone(),
            Self::Status => record.status.as_str().to_string(),
            Self::Priority => record.priority.as_str().to_string(),
            Self::Project => record.project.clone().unwrap_or_default(),
            Self::Due => record.due.map(|d| d.to_string()).unwrap_or_default(),
            Self::Assignees => join(record.assignees.iter().map(String::as_str)),
            Self::Tags => join(record.tags.iter().map(String::as_str)),
            Self::Links => join(record.links.iter().map(String::as_str)),
            Self::Depends => join(record.depends.iter().map(|d| d.as_str())),
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one field of a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldResolution {
    LocalWins,
    RemoteWins,
    Union,
    ManualRequired,
}

/// One of the two diverged versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

/// Resolution chosen for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldDecision {
    pub field: Field,
    pub resolution: FieldResolution,
}

/// Result of merging one conflict candidate.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Merged record. Manual-required fields provisionally hold the local value.
    pub merged: TaskRecord,

    /// One decision per field on which local and remote disagree.
    pub decisions: Vec<FieldDecision>,

    /// Side that performed a major edit, if the record is under one.
    pub major_edit: Option<Side>,

    pub title_similarity: f64,
    pub description_similarity: f64,

    base: Option<TaskRecord>,
    local: TaskRecord,
    remote: TaskRecord,
}

impl MergeOutcome {
    /// True when no field needs a human.
    pub fn is_resolved(&self) -> bool {
        self.manual_fields().is_empty()
    }

    /// Fields marked manual-required.
    pub fn manual_fields(&self) -> Vec<Field> {
        self.decisions
            .iter()
            .filter(|d| d.resolution == FieldResolution::ManualRequired)
            .map(|d| d.field)
            .collect()
    }

    /// Resolution recorded for a field, if local and remote disagreed on it.
    pub fn resolution(&self, field: Field) -> Option<FieldResolution> {
        self.decisions
            .iter()
            .find(|d| d.field == field)
            .map(|d| d.resolution)
    }

    pub fn base(&self) -> Option<&TaskRecord> {
        self.base.as_ref()
    }

    pub fn local(&self) -> &TaskRecord {
        &self.local
    }

    pub fn remote(&self) -> &TaskRecord {
        &self.remote
    }

    /// Apply externally chosen resolutions (e.g. from an interactive prompt).
    ///
    /// A `ManualRequired` selection leaves the field unresolved.
    pub fn apply(&mut self, selections: &[FieldDecision]) {
        for selection in selections {
            let Some(slot) = self
                .decisions
                .iter_mut()
                .find(|d| d.field == selection.field)
            else {
                continue;
            };
            match selection.resolution {
                FieldResolution::LocalWins => copy_field(selection.field, &self.local, &mut self.merged),
                FieldResolution::RemoteWins => copy_field(selection.field, &self.remote, &mut self.merged),
                FieldResolution::Union => {
                    if !union_field(selection.field, &self.local, &self.remote, &mut self.merged) {
                        continue;
                    }
                }
                FieldResolution::ManualRequired => {}
            }
            slot.resolution = selection.resolution;
        }
    }

    /// The merged record, or the fields still needing a human.
    pub fn into_record(self) -> Result<TaskRecord, Vec<Field>> {
        let manual = self.manual_fields();
        if manual.is_empty() {
            Ok(self.merged)
        } else {
            Err(manual)
        }
    }
}

/// Character-level similarity ratio in `0.0..=1.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let diff = TextDiff::configure()
        .timeout(Duration::from_millis(250))
        .diff_chars(a, b);
    f64::from(diff.ratio())
}

/// Merge with the automatic field policy.
pub fn merge(base: Option<&TaskRecord>, local: &TaskRecord, remote: &TaskRecord) -> MergeOutcome {
    let title_similarity = similarity(&local.title, &remote.title);
    let description_similarity = similarity(&local.description, &remote.description);

    let changed = |field: Field, side: &TaskRecord| base.map_or(true, |b| !field_eq(field, b, side));
    let contested = |field: Field| {
        !field_eq(field, local, remote) && changed(field, local) && changed(field, remote)
    };

    let title_manual = contested(Field::Title) && title_similarity < TITLE_SIMILARITY_THRESHOLD;
    let description_manual = contested(Field::Description)
        && description_similarity < DESCRIPTION_SIMILARITY_THRESHOLD;
    let contested_count = [Field::Title, Field::Description, Field::Status]
        .into_iter()
        .filter(|f| contested(*f))
        .count();
    let major_edit = (title_manual || description_manual || contested_count >= MAJOR_EDIT_FIELD_COUNT)
        .then(|| major_edit_side(base, local, remote));

    let mut merged = local.clone();
    let mut decisions = Vec::new();

    for field in Field::ALL {
        if field_eq(field, local, remote) {
            continue;
        }
        let one_sided = match (changed(field, local), changed(field, remote)) {
            (true, false) => Some(Side::Local),
            (false, true) => Some(Side::Remote),
            _ => None,
        };

        let resolution = match (field.category(), one_sided) {
            (_, Some(Side::Local)) => FieldResolution::LocalWins,
            (_, Some(Side::Remote)) => FieldResolution::RemoteWins,
            (FieldCategory::Semantic, None) => FieldResolution::RemoteWins,
            (FieldCategory::Content, None)
                if (field == Field::Title && title_manual)
                    || (field == Field::Description && description_manual) =>
            {
                FieldResolution::ManualRequired
            }
            (FieldCategory::Content | FieldCategory::Simple, None) => newer_side(local, remote),
            (FieldCategory::List, None) => match major_edit {
                Some(side) => respect_side(field, base, local, remote, side, &mut merged),
                None => {
                    union_field(field, local, remote, &mut merged);
                    FieldResolution::Union
                }
            },
        };

        match resolution {
            FieldResolution::RemoteWins => copy_field(field, remote, &mut merged),
            FieldResolution::LocalWins | FieldResolution::ManualRequired => {
                copy_field(field, local, &mut merged)
            }
            FieldResolution::Union => {}
        }
        decisions.push(FieldDecision { field, resolution });
    }

    finish(&mut merged, local, remote);

    MergeOutcome {
        merged,
        decisions,
        major_edit,
        title_similarity,
        description_similarity,
        base: base.cloned(),
        local: local.clone(),
        remote: remote.clone(),
    }
}

/// Merge honouring the session policy.
pub fn merge_with_policy(
    base: Option<&TaskRecord>,
    local: &TaskRecord,
    remote: &TaskRecord,
    policy: &SyncPolicy,
) -> MergeOutcome {
    let forced = match policy.strategy {
        MergeStrategy::PreferLocal => Some(FieldResolution::LocalWins),
        MergeStrategy::PreferRemote => Some(FieldResolution::RemoteWins),
        MergeStrategy::Auto | MergeStrategy::Interactive if !policy.auto_merge => {
            Some(FieldResolution::ManualRequired)
        }
        MergeStrategy::Auto | MergeStrategy::Interactive => None,
    };

    let mut outcome = merge(base, local, remote);
    if let Some(resolution) = forced {
        let mut merged = match resolution {
            FieldResolution::RemoteWins => remote.clone(),
            _ => local.clone(),
        };
        finish(&mut merged, local, remote);
        outcome.merged = merged;
        for decision in &mut outcome.decisions {
            decision.resolution = resolution;
        }
    }
    outcome
}

fn finish(merged: &mut TaskRecord, local: &TaskRecord, remote: &TaskRecord) {
    merged.uuid = local.uuid.clone();
    merged.display_id = local.display_id;
    merged.created = local.created.min(remote.created);
    merged.modified = local.modified.max(remote.modified).max(merged.created);
    let mut extra = remote.extra.clone();
    extra.extend(local.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extra = extra;
}

fn newer_side(local: &TaskRecord, remote: &TaskRecord) -> FieldResolution {
    if remote.modified > local.modified {
        FieldResolution::RemoteWins
    } else {
        FieldResolution::LocalWins
    }
}

/// Which side moved the content furthest from base.
fn major_edit_side(base: Option<&TaskRecord>, local: &TaskRecord, remote: &TaskRecord) -> Side {
    if let Some(base) = base {
        let distance = |r: &TaskRecord| {
            (1.0 - similarity(&base.title, &r.title))
                + (1.0 - similarity(&base.description, &r.description))
                + if base.status != r.status { 1.0 } else { 0.0 }
        };
        let (l, r) = (distance(local), distance(remote));
        if (l - r).abs() > f64::EPSILON {
            return if l > r { Side::Local } else { Side::Remote };
        }
    }
    match newer_side(local, remote) {
        FieldResolution::RemoteWins => Side::Remote,
        _ => Side::Local,
    }
}

fn field_eq(field: Field, a: &TaskRecord, b: &TaskRecord) -> bool {
    match field {
        Field::Title => a.title == b.title,
        Field::Description => a.description == b.description,
        Field::Status => a.status == b.status,
        Field::Priority => a.priority == b.priority,
        Field::Project => a.project == b.project,
        Field::Due => a.due == b.due,
        Field::Assignees => a.assignees == b.assignees,
        Field::Tags => a.tags == b.tags,
        Field::Links => a.links == b.links,
        Field::Depends => a.depends == b.depends,
    }
}

fn copy_field(field: Field, from: &TaskRecord, to: &mut TaskRecord) {
    match field {
        Field::Title => to.title = from.title.clone(),
        Field::Description => to.description = from.description.clone(),
        Field::Status => to.status = from.status,
        Field::Priority => to.priority = from.priority,
        Field::Project => to.project = from.project.clone(),
        Field::Due => to.due = from.due,
        Field::Assignees => to.assignees = from.assignees.clone(),
        Field::Tags => to.tags = from.tags.clone(),
        Field::Links => to.links = from.links.clone(),
        Field::Depends => to.depends = from.depends.clone(),
    }
}

/// Plain union for list fields. Returns false for non-list fields.
fn union_field(field: Field, local: &TaskRecord, remote: &TaskRecord, to: &mut TaskRecord) -> bool {
    match field {
        Field::Assignees => to.assignees = local.assignees.union(&remote.assignees),
        Field::Tags => to.tags = local.tags.union(&remote.tags),
        Field::Links => to.links = local.links.union(&remote.links),
        Field::Depends => to.depends = local.depends.union(&remote.depends),
        _ => return false,
    }
    true
}

/// Keep the major-edit side's list and add only what the other side newly
/// introduced, so values the editor removed do not come back.
fn respect_side(
    field: Field,
    base: Option<&TaskRecord>,
    local: &TaskRecord,
    remote: &TaskRecord,
    side: Side,
    to: &mut TaskRecord,
) -> FieldResolution {
    let (keep, other) = match side {
        Side::Local => (local, remote),
        Side::Remote => (remote, local),
    };
    let added = match field {
        Field::Assignees => {
            let (value, added) = respect(base.map(|b| &b.assignees), &keep.assignees, &other.assignees);
            to.assignees = value;
            added
        }
        Field::Tags => {
            let (value, added) = respect(base.map(|b| &b.tags), &keep.tags, &other.tags);
            to.tags = value;
            added
        }
        Field::Links => {
            let (value, added) = respect(base.map(|b| &b.links), &keep.links, &other.links);
            to.links = value;
            added
        }
        Field::Depends => {
            let (value, added) = respect(base.map(|b| &b.depends), &keep.depends, &other.depends);
            to.depends = value;
            added
        }
        _ => false,
    };
    match (added, side) {
        (true, _) => FieldResolution::Union,
        (false, Side::Local) => FieldResolution::LocalWins,
        (false, Side::Remote) => FieldResolution::RemoteWins,
    }
}

fn respect<T: PartialEq + Clone>(
    base: Option<&OrderedSet<T>>,
    keep: &OrderedSet<T>,
    other: &OrderedSet<T>,
) -> (OrderedSet<T>, bool) {
    let mut value = keep.clone();
    let mut added = false;
    if let Some(base) = base {
        for item in other.iter().filter(|item| !base.contains(*item)) {
            added |= value.insert(item.clone());
        }
    }
    (value, added)
}
