//! Task record type.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};

use crate::{CoreError, DisplayId, OrderedSet, Priority, Status, TaskUuid};

/// Due date of a record: either a calendar day or an exact instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Due {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl Due {
    /// Parse `YYYY-MM-DD`, RFC 3339, or a naive `YYYY-MM-DD[T ]HH:MM[:SS]`
    /// interpreted as UTC.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
            return Some(Self::DateTime(instant.with_timezone(&Utc)));
        }
        for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(Self::DateTime(Utc.from_utc_datetime(&naive)));
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .map(Self::Date)
    }

    /// Instant used when ordering records by due date. Dates sort at midnight UTC.
    pub fn sort_key(&self) -> DateTime<Utc> {
        match self {
            Self::Date(day) => Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::default())),
            Self::DateTime(instant) => *instant,
        }
    }
}

impl fmt::Display for Due {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date(day) => write!(f, "{}", day.format("%Y-%m-%d")),
            Self::DateTime(instant) => {
                write!(f, "{}", instant.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

/// A task record as stored in a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// Durable identity.
    pub uuid: TaskUuid,

    /// Display number assigned by the identifier cache. Never persisted with
    /// the record itself.
    pub display_id: Option<DisplayId>,

    pub title: String,
    pub status: Status,
    pub priority: Priority,
    pub project: Option<String>,

    /// Handles, e.g. `@alice`.
    pub assignees: OrderedSet<String>,
    pub tags: OrderedSet<String>,
    pub due: Option<Due>,

    /// Markdown body.
    pub description: String,

    /// Durable identities of records this one depends on.
    pub depends: OrderedSet<TaskUuid>,
    pub links: OrderedSet<String>,

    /// When the record was created. Immutable.
    pub created: DateTime<Utc>,

    /// When any field last changed.
    pub modified: DateTime<Utc>,

    /// Front matter keys this version does not know about, kept verbatim.
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl TaskRecord {
    /// Create a new pending record with a fresh uuid.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now().trunc_subsecs(0);
        Self {
            uuid: TaskUuid::generate(),
            display_id: None,
            title: title.into(),
            status: Status::Pending,
            priority: Priority::Medium,
            project: None,
            assignees: OrderedSet::new(),
            tags: OrderedSet::new(),
            due: None,
            description: String::new(),
            depends: OrderedSet::new(),
            links: OrderedSet::new(),
            created: now,
            modified: now,
            extra: BTreeMap::new(),
        }
    }

    /// Builder method to set a specific uuid (useful for testing).
    pub fn with_uuid(mut self, uuid: impl Into<TaskUuid>) -> Self {
        self.uuid = uuid.into();
        self
    }

    /// Builder method to set the status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Builder method to add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Builder method to add an assignee.
    pub fn with_assignee(mut self, handle: impl Into<String>) -> Self {
        self.assignees.insert(handle.into());
        self
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder method to set the due date.
    pub fn with_due(mut self, due: Due) -> Self {
        self.due = Some(due);
        self
    }

    /// Builder method to set both timestamps.
    pub fn with_timestamps(mut self, created: DateTime<Utc>, modified: DateTime<Utc>) -> Self {
        self.created = created;
        self.modified = modified;
        self
    }

    /// Record that a field changed now.
    pub fn touch(&mut self) {
        let now = Utc::now().trunc_subsecs(0);
        self.modified = now.max(self.created);
    }

    /// Check the record invariants.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.uuid.as_str().trim().is_empty() {
            return Err(CoreError::MissingField("uuid"));
        }
        if self.modified < self.created {
            return Err(CoreError::ModifiedBeforeCreated {
                created: self.created.to_rfc3339(),
                modified: self.modified.to_rfc3339(),
            });
        }
        Ok(())
    }
}
