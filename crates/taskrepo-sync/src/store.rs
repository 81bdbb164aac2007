//! Record store: reads and writes task files in a repository working tree.
//!
//! Each record lives in `tasks/task-<uuid>.md` (archived ones under
//! `tasks/archive/`) as a YAML front matter block followed by the
//! description body. Keys this version does not know are carried through
//! untouched.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::warn;

use taskrepo_core::{CoreError, Due, OrderedSet, Priority, Status, TaskRecord, TaskUuid};

use crate::error::SyncError;

const TASKS_DIR: &str = "tasks";
const ARCHIVE_DIR: &str = "archive";
const FRONT_MATTER_DELIMITER: &str = "---";

/// Keys owned by [`TaskRecord`], in the order they are written.
const KNOWN_KEYS: [&str; 13] = [
    "uuid",
    "title",
    "status",
    "priority",
    "project",
    "assignees",
    "tags",
    "links",
    "depends",
    "due",
    "created",
    "modified",
    "display_id",
];

/// A task file that could not be loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub path: PathBuf,
    pub error: CoreError,
}

/// Result of listing a repository: good records plus the files that failed.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<TaskRecord>,
    pub issues: Vec<ValidationIssue>,
}

/// Record counts derived from two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// `uuid -> modified` for every loadable record at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: BTreeMap<TaskUuid, DateTime<Utc>>,
}

impl Snapshot {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        Self {
            entries: records
                .into_iter()
                .map(|r| (r.uuid.clone(), r.modified))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count what changed going from `self` to `after`.
    pub fn diff(&self, after: &Snapshot) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for (uuid, modified) in &after.entries {
            match self.entries.get(uuid) {
                None => counts.created += 1,
                Some(before) if before != modified => counts.updated += 1,
                Some(_) => {}
            }
        }
        counts.deleted = self
            .entries
            .keys()
            .filter(|uuid| !after.entries.contains_key(*uuid))
            .count();
        counts
    }
}

/// File-backed store for one repository's working tree.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
    tasks_dir: PathBuf,
}

impl RecordStore {
    /// Open the store rooted at a repository working tree, creating `tasks/`.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let tasks_dir = root.join(TASKS_DIR);
        fs::create_dir_all(&tasks_dir)?;
        Ok(Self { root, tasks_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the active (non-archived) file for a record.
    pub fn path_for(&self, uuid: &TaskUuid) -> PathBuf {
        self.tasks_dir.join(file_name(uuid))
    }

    /// Path of the archived file for a record.
    pub fn archive_path_for(&self, uuid: &TaskUuid) -> PathBuf {
        self.tasks_dir.join(ARCHIVE_DIR).join(file_name(uuid))
    }

    /// Parse every task file. Malformed files are reported, not fatal.
    pub fn list(&self, include_archived: bool) -> io::Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut dirs = vec![self.tasks_dir.clone()];
        if include_archived {
            dirs.push(self.tasks_dir.join(ARCHIVE_DIR));
        }

        for dir in dirs {
            for path in task_files(&dir)? {
                match self.load_path(&path) {
                    Ok(record) => report.records.push(record),
                    Err(SyncError::Validation { path, source }) => {
                        warn!(path = %path.display(), error = %source, "Skipping malformed task file");
                        report.issues.push(ValidationIssue {
                            path,
                            error: source,
                        });
                    }
                    Err(SyncError::Io(e)) => return Err(e),
                    Err(other) => return Err(io::Error::other(other.to_string())),
                }
            }
        }

        Ok(report)
    }

    /// Load a record by uuid from the active or archived location.
    pub fn load(&self, uuid: &TaskUuid) -> Result<Option<TaskRecord>, SyncError> {
        for path in [self.path_for(uuid), self.archive_path_for(uuid)] {
            if path.exists() {
                return self.load_path(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Load and validate one file.
    pub fn load_path(&self, path: &Path) -> Result<TaskRecord, SyncError> {
        let text = fs::read_to_string(path)?;
        parse_record(&text).map_err(|source| SyncError::Validation {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write a record, keeping it in the archive if it already lives there.
    pub fn save(&self, record: &TaskRecord) -> Result<PathBuf, SyncError> {
        let archived = self.archive_path_for(&record.uuid);
        let path = if archived.exists() {
            archived
        } else {
            self.path_for(&record.uuid)
        };
        record.validate().map_err(|source| SyncError::Validation {
            path: path.clone(),
            source,
        })?;
        let text = render_record(record)?;
        write_atomic(&path, &text)?;
        Ok(path)
    }

    /// Remove a record's file. Returns false if there was none.
    pub fn delete(&self, uuid: &TaskUuid) -> io::Result<bool> {
        for path in [self.path_for(uuid), self.archive_path_for(uuid)] {
            if path.exists() {
                fs::remove_file(path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Read a file relative to the repository root.
    pub fn read_raw(&self, relative: &Path) -> io::Result<String> {
        fs::read_to_string(self.root.join(relative))
    }

    /// Atomically replace a file relative to the repository root.
    pub fn write_raw(&self, relative: &Path, text: &str) -> io::Result<()> {
        write_atomic(&self.root.join(relative), text)
    }

    /// Snapshot of every loadable record, archived ones included.
    pub fn snapshot(&self) -> io::Result<Snapshot> {
        let report = self.list(true)?;
        Ok(Snapshot::from_records(&report.records))
    }
}

fn file_name(uuid: &TaskUuid) -> String {
    format!("task-{}.md", uuid)
}

/// True for paths that look like task files (`task-*.md`).
pub fn is_task_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with("task-") && name.ends_with(".md")
}

/// True for paths a task repository is expected to hold: task files under
/// `tasks/` (archive included), `README.md`, `.gitkeep` and `.gitignore`.
pub fn is_expected_file(path: &Path) -> bool {
    let first = path.components().next().map(|c| c.as_os_str());
    if first == Some(OsStr::new(".git")) {
        return true;
    }
    if first == Some(OsStr::new(TASKS_DIR)) && is_task_file(path) {
        return true;
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    matches!(name, "README.md" | ".gitkeep" | ".gitignore")
}

/// Group unexpected paths by the pattern that would ignore them:
/// `.dir/*` for hidden directories, `*.ext` by extension, else the name.
pub fn unexpected_patterns(paths: &[PathBuf]) -> BTreeMap<String, Vec<PathBuf>> {
    let mut grouped: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for path in paths {
        let mut components = path.components();
        let first = components
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        let pattern = if first.starts_with('.') && components.next().is_some() {
            format!("{first}/*")
        } else if let Some(ext) = path.extension() {
            format!("*.{}", ext.to_string_lossy())
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(first)
        };
        grouped.entry(pattern).or_default().push(path.clone());
    }
    grouped
}

fn task_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_task_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn write_atomic(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("task.md");
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

// ============================================================================
// Document format
// ============================================================================

/// Split a document into its front matter and body.
pub fn split_front_matter(text: &str) -> Result<(&str, &str), CoreError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let rest = text
        .strip_prefix(FRONT_MATTER_DELIMITER)
        .and_then(|r| r.strip_prefix('\n').or_else(|| r.strip_prefix("\r\n")))
        .ok_or(CoreError::MissingFrontMatter)?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONT_MATTER_DELIMITER {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((front, body));
        }
        offset += line.len();
    }
    Err(CoreError::MissingFrontMatter)
}

/// Parse a task document strictly.
pub fn parse_record(text: &str) -> Result<TaskRecord, CoreError> {
    let (front, body) = split_front_matter(text)?;
    let value: Value = serde_yaml::from_str(front)
        .map_err(|e| CoreError::InvalidFrontMatter(e.to_string()))?;
    let Value::Mapping(mut map) = value else {
        return Err(CoreError::InvalidFrontMatter(
            "front matter must be a mapping".to_string(),
        ));
    };

    let uuid = take_scalar(&mut map, "uuid")?
        .filter(|s| !s.trim().is_empty())
        .ok_or(CoreError::MissingField("uuid"))?;
    let created =
        take_timestamp(&mut map, "created")?.ok_or(CoreError::MissingField("created"))?;
    let modified = take_timestamp(&mut map, "modified")?.unwrap_or(created);

    let status = match take_scalar(&mut map, "status")? {
        Some(raw) => Status::parse(&raw).ok_or(CoreError::InvalidField {
            field: "status",
            value: raw,
        })?,
        None => Status::default(),
    };
    let priority = match take_scalar(&mut map, "priority")? {
        Some(raw) => Priority::parse(&raw).ok_or(CoreError::InvalidField {
            field: "priority",
            value: raw,
        })?,
        None => Priority::default(),
    };
    let due = match take_scalar(&mut map, "due")? {
        Some(raw) if !raw.trim().is_empty() => Some(Due::parse(&raw).ok_or(
            CoreError::InvalidField {
                field: "due",
                value: raw,
            },
        )?),
        _ => None,
    };

    let record = TaskRecord {
        uuid: TaskUuid::new(uuid),
        display_id: None,
        title: take_scalar(&mut map, "title")?.unwrap_or_default(),
        status,
        priority,
        project: take_scalar(&mut map, "project")?.filter(|p| !p.is_empty()),
        assignees: take_set(&mut map, "assignees")?,
        tags: take_set(&mut map, "tags")?,
        due,
        description: normalize_body(body),
        depends: take_set::<String>(&mut map, "depends")?
            .iter()
            .map(|s| TaskUuid::new(s.as_str()))
            .collect(),
        links: take_set(&mut map, "links")?,
        created,
        modified,
        extra: {
            // Display ids are cache state, never file state.
            map.remove("display_id");
            collect_extra(map)
        },
    };
    record.validate()?;
    Ok(record)
}

/// Best-effort parse used when a document is damaged.
///
/// Reads `key: value` lines (and `- item` list continuations) from the
/// front matter, skipping anything it cannot interpret. Unknown keys land
/// in `extra`. Only `uuid` is required.
pub fn parse_lenient(text: &str) -> Option<TaskRecord> {
    let (front, body) = match split_front_matter(text) {
        Ok(parts) => parts,
        Err(_) => (text, ""),
    };

    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut scalars: BTreeMap<String, String> = BTreeMap::new();
    let mut extra: BTreeMap<String, Value> = BTreeMap::new();
    let mut current_list: Option<String> = None;

    for line in front.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(item) = trimmed.strip_prefix("- ") {
            if let Some(key) = &current_list {
                fields
                    .entry(key.clone())
                    .or_default()
                    .push(unquote(item).to_string());
            }
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            current_list = None;
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();
        if value.is_empty() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                extra.insert(key.clone(), Value::Null);
            }
            current_list = Some(key);
            continue;
        }
        current_list = None;
        if !KNOWN_KEYS.contains(&key.as_str()) {
            // Unknown keys keep their YAML value when it still parses.
            let parsed = serde_yaml::from_str::<Value>(value)
                .unwrap_or_else(|_| Value::String(unquote(value).to_string()));
            extra.insert(key, parsed);
        } else if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            let items = inner
                .split(',')
                .map(|item| unquote(item.trim()).to_string())
                .filter(|item| !item.is_empty())
                .collect();
            fields.insert(key, items);
        } else {
            scalars.insert(key, unquote(value).to_string());
        }
    }

    for (key, items) in &fields {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            extra.insert(key.clone(), string_seq(items.iter()));
        }
    }

    let uuid = scalars.get("uuid").filter(|u| !u.is_empty())?;
    let stamp = |key: &str| {
        scalars
            .get(key)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    let created = stamp("created")
        .or_else(|| stamp("modified"))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let modified = stamp("modified").unwrap_or(created).max(created);
    let set = |key: &str| -> OrderedSet<String> {
        fields
            .get(key)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    };

    Some(TaskRecord {
        uuid: TaskUuid::new(uuid.as_str()),
        display_id: None,
        title: scalars.get("title").cloned().unwrap_or_default(),
        status: scalars
            .get("status")
            .and_then(|s| Status::parse(s))
            .unwrap_or_default(),
        priority: scalars
            .get("priority")
            .and_then(|p| Priority::parse(p))
            .unwrap_or_default(),
        project: scalars.get("project").cloned().filter(|p| !p.is_empty()),
        assignees: set("assignees"),
        tags: set("tags"),
        due: scalars.get("due").and_then(|d| Due::parse(d)),
        description: normalize_body(body),
        depends: set("depends").iter().map(|d| TaskUuid::new(d.as_str())).collect(),
        links: set("links"),
        created,
        modified,
        extra,
    })
}

/// Render a record as a task document.
pub fn render_record(record: &TaskRecord) -> Result<String, serde_yaml::Error> {
    let mut map = Mapping::new();
    let mut put = |key: &str, value: Value| {
        map.insert(Value::String(key.to_string()), value);
    };

    put("uuid", Value::String(record.uuid.to_string()));
    put("title", Value::String(record.title.clone()));
    put("status", Value::String(record.status.as_str().to_string()));
    put("priority", Value::String(record.priority.as_str().to_string()));
    if let Some(project) = &record.project {
        put("project", Value::String(project.clone()));
    }
    put("assignees", string_seq(record.assignees.iter()));
    put("tags", string_seq(record.tags.iter()));
    put("links", string_seq(record.links.iter()));
    put("depends", string_seq(record.depends.iter().map(TaskUuid::as_str)));
    if let Some(due) = &record.due {
        put("due", Value::String(due.to_string()));
    }
    put("created", Value::String(format_timestamp(&record.created)));
    put("modified", Value::String(format_timestamp(&record.modified)));
    for (key, value) in &record.extra {
        put(key, value.clone());
    }

    let yaml = serde_yaml::to_string(&map)?;
    let mut out = String::with_capacity(yaml.len() + record.description.len() + 16);
    out.push_str(FRONT_MATTER_DELIMITER);
    out.push('\n');
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(FRONT_MATTER_DELIMITER);
    out.push('\n');
    if !record.description.is_empty() {
        out.push('\n');
        out.push_str(&record.description);
        out.push('\n');
    }
    Ok(out)
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

fn string_seq<S: AsRef<str>>(items: impl Iterator<Item = S>) -> Value {
    Value::Sequence(
        items
            .map(|s| Value::String(s.as_ref().to_string()))
            .collect(),
    )
}

fn normalize_body(body: &str) -> String {
    body.trim_start_matches(['\r', '\n']).trim_end().to_string()
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = raw.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return inner;
        }
    }
    raw
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn take_scalar(map: &mut Mapping, key: &'static str) -> Result<Option<String>, CoreError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_text(&value).map(Some).ok_or(CoreError::InvalidField {
            field: key,
            value: format!("{value:?}"),
        }),
    }
}

fn take_timestamp(
    map: &mut Mapping,
    key: &'static str,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    let Some(raw) = take_scalar(map, key)? else {
        return Ok(None);
    };
    match Due::parse(&raw) {
        Some(due) => Ok(Some(due.sort_key())),
        None => Err(CoreError::InvalidField { field: key, value: raw }),
    }
}

fn take_set<T>(map: &mut Mapping, key: &'static str) -> Result<OrderedSet<T>, CoreError>
where
    T: PartialEq + From<String>,
{
    let items: Vec<String> = match map.remove(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                scalar_text(v).ok_or(CoreError::InvalidField {
                    field: key,
                    value: format!("{v:?}"),
                })
            })
            .collect::<Result<_, _>>()?,
        Some(other) => vec![scalar_text(&other).ok_or(CoreError::InvalidField {
            field: key,
            value: format!("{other:?}"),
        })?],
    };
    let mut seen: Vec<&String> = Vec::with_capacity(items.len());
    for item in &items {
        if seen.contains(&item) {
            return Err(CoreError::DuplicateEntry {
                field: key,
                value: item.clone(),
            });
        }
        seen.push(item);
    }
    Ok(items.into_iter().map(T::from).collect())
}

fn collect_extra(map: Mapping) -> BTreeMap<String, Value> {
    map.into_iter()
        .filter_map(|(k, v)| {
            let key = scalar_text(&k)?;
            (!KNOWN_KEYS.contains(&key.as_str())).then_some((key, v))
        })
        .collect()
}
