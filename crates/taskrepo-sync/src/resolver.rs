//! Interactive collaborator seam for manual-required fields.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SyncError;
use crate::merge::{Field, FieldDecision, MergeOutcome};

/// One field awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChoice {
    pub field: Field,
    pub base: Option<String>,
    pub local: String,
    pub remote: String,
}

/// Everything shown to the user for one conflicted record.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictPrompt {
    pub path: PathBuf,
    pub uuid: String,
    pub title: String,
    pub choices: Vec<FieldChoice>,
}

impl ConflictPrompt {
    /// Side-by-side view of the manual-required fields of an outcome.
    pub fn from_outcome(path: impl Into<PathBuf>, outcome: &MergeOutcome) -> Self {
        let choices = outcome
            .manual_fields()
            .into_iter()
            .map(|field| FieldChoice {
                field,
                base: outcome.base().map(|b| field.display_value(b)),
                local: field.display_value(outcome.local()),
                remote: field.display_value(outcome.remote()),
            })
            .collect();
        Self {
            path: path.into(),
            uuid: outcome.local().uuid.to_string(),
            title: outcome.local().title.clone(),
            choices,
        }
    }
}

/// Something that can settle manual-required fields, typically a person at
/// a terminal.
#[async_trait]
pub trait InteractiveResolver: Send + Sync {
    /// Return one selection per field the user decided. Fields left out stay
    /// manual-required.
    async fn resolve(&self, prompt: &ConflictPrompt) -> Result<Vec<FieldDecision>, SyncError>;
}
