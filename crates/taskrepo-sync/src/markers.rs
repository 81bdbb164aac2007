//! Conflict marker scanning and resolution.
//!
//! A conflicted file is parsed into a tree of plain text and conflict
//! regions. Regions may nest; the local view takes the local side at every
//! depth and the remote view the remote side. Resolution then tries, in
//! order:
//!
//! 1. strict parse of both views and a field merge,
//! 2. lenient reconstruction of both views and a field merge,
//! 3. the preferred side's view kept verbatim and flagged for review.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use taskrepo_core::TaskRecord;

use crate::config::{MergeStrategy, SyncPolicy};
use crate::merge::{merge_with_policy, MergeOutcome, Side};
use crate::store::{parse_lenient, parse_record, render_record};

pub const CONFLICT_START: &str = "<<<<<<<";
pub const CONFLICT_BASE: &str = "|||||||";
pub const CONFLICT_SEPARATOR: &str = "=======";
pub const CONFLICT_END: &str = ">>>>>>>";

/// Marker structure could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkerError {
    #[error("conflict opened at line {line} is never closed")]
    Unclosed { line: usize },

    #[error("unexpected {marker} at line {line}")]
    Unexpected { marker: &'static str, line: usize },
}

/// Parsed piece of a conflicted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Conflict {
        ours: Vec<Segment>,
        base: Option<Vec<Segment>>,
        theirs: Vec<Segment>,
    },
}

/// Which tier produced the resolved text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "side")]
pub enum AppliedStrategy {
    /// No markers present.
    Clean,
    /// Both views parsed strictly and were field-merged.
    FieldMerge,
    /// Both views were reconstructed leniently and field-merged.
    PartialReconstruction,
    /// One view was kept as-is.
    Verbatim(Side),
    /// Nothing could be produced.
    Unresolved,
}

/// Result of resolving one file.
#[derive(Debug, Clone)]
pub struct MarkerResolution {
    /// Resolved file content, absent when a human is needed.
    pub text: Option<String>,
    pub was_conflicted: bool,
    pub strategy: AppliedStrategy,
    /// Field merge result for the tiers that merged.
    pub outcome: Option<MergeOutcome>,
    pub requires_manual: bool,
    pub needs_review: bool,
    pub warnings: Vec<String>,
}

impl MarkerResolution {
    fn clean(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            was_conflicted: false,
            strategy: AppliedStrategy::Clean,
            outcome: None,
            requires_manual: false,
            needs_review: false,
            warnings: Vec::new(),
        }
    }

    fn unresolved(warning: String) -> Self {
        Self {
            text: None,
            was_conflicted: true,
            strategy: AppliedStrategy::Unresolved,
            outcome: None,
            requires_manual: true,
            needs_review: false,
            warnings: vec![warning],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerLine {
    Start,
    Base,
    Separator,
    End,
}

/// Shortest marker run git writes. Inner regions of recursive merges use
/// longer runs.
const MARKER_WIDTH: usize = CONFLICT_START.len();

/// Classify a marker line, returning its kind and run width.
fn classify(line: &str) -> Option<(MarkerLine, usize)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let first = line.chars().next()?;
    let kind = match first {
        '<' => MarkerLine::Start,
        '|' => MarkerLine::Base,
        '=' => MarkerLine::Separator,
        '>' => MarkerLine::End,
        _ => return None,
    };
    let width = line.len() - line.trim_start_matches(first).len();
    if width < MARKER_WIDTH {
        return None;
    }
    let rest = &line[width..];
    let terminated = match kind {
        MarkerLine::Separator => rest.is_empty(),
        _ => rest.is_empty() || rest.starts_with(' '),
    };
    terminated.then_some((kind, width))
}

/// True if any line opens or closes a conflict region, whatever its width.
pub fn contains_markers(text: &str) -> bool {
    text.lines().any(|l| {
        matches!(
            classify(l),
            Some((MarkerLine::Start | MarkerLine::End, _))
        )
    })
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
    /// Widths of the regions currently open, innermost last.
    open: Vec<usize>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.split_inclusive('\n').collect(),
            pos: 0,
            open: Vec::new(),
        }
    }

    /// Parse until a marker that closes a section of the innermost region.
    fn block(&mut self) -> Result<(Vec<Segment>, Option<MarkerLine>), MarkerError> {
        let mut segments = Vec::new();
        let mut text = String::new();

        while let Some(line) = self.lines.get(self.pos).copied() {
            match classify(line) {
                Some((MarkerLine::Start, width)) => {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    let opened_at = self.pos + 1;
                    self.pos += 1;
                    segments.push(self.conflict(width, opened_at)?);
                }
                Some((marker, width)) if self.open.last() == Some(&width) => {
                    if !text.is_empty() {
                        segments.push(Segment::Text(text));
                    }
                    self.pos += 1;
                    return Ok((segments, Some(marker)));
                }
                Some((MarkerLine::End, _)) => {
                    return Err(MarkerError::Unexpected {
                        marker: CONFLICT_END,
                        line: self.pos + 1,
                    })
                }
                // Separators and base lines of another width are content,
                // and outside a region they are ordinary markdown.
                Some(_) | None => {
                    text.push_str(line);
                    self.pos += 1;
                }
            }
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok((segments, None))
    }

    fn conflict(&mut self, width: usize, opened_at: usize) -> Result<Segment, MarkerError> {
        self.open.push(width);
        let segment = self.sections(opened_at);
        self.open.pop();
        segment
    }

    fn sections(&mut self, opened_at: usize) -> Result<Segment, MarkerError> {
        let unclosed = MarkerError::Unclosed { line: opened_at };

        let (ours, mut terminator) = self.block()?;
        let mut base = None;
        if terminator == Some(MarkerLine::Base) {
            let (section, next) = self.block()?;
            base = Some(section);
            terminator = next;
        }
        match terminator {
            Some(MarkerLine::Separator) => {}
            Some(MarkerLine::End) => {
                return Err(MarkerError::Unexpected {
                    marker: CONFLICT_END,
                    line: self.pos,
                })
            }
            Some(MarkerLine::Base) => {
                return Err(MarkerError::Unexpected {
                    marker: CONFLICT_BASE,
                    line: self.pos,
                })
            }
            Some(MarkerLine::Start) | None => return Err(unclosed),
        }

        let (theirs, terminator) = self.block()?;
        match terminator {
            Some(MarkerLine::End) => Ok(Segment::Conflict { ours, base, theirs }),
            Some(MarkerLine::Separator) => Err(MarkerError::Unexpected {
                marker: CONFLICT_SEPARATOR,
                line: self.pos,
            }),
            Some(MarkerLine::Base) => Err(MarkerError::Unexpected {
                marker: CONFLICT_BASE,
                line: self.pos,
            }),
            Some(MarkerLine::Start) | None => Err(unclosed),
        }
    }
}

/// Parse a possibly conflicted file into segments.
pub fn parse_segments(text: &str) -> Result<Vec<Segment>, MarkerError> {
    let mut parser = Parser::new(text);
    let (segments, _) = parser.block()?;
    Ok(segments)
}

/// Reassemble one side of the file.
pub fn render_side(segments: &[Segment], side: Side) -> String {
    let mut out = String::new();
    render_into(segments, side, &mut out);
    out
}

fn render_into(segments: &[Segment], side: Side, out: &mut String) {
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Conflict { ours, theirs, .. } => match side {
                Side::Local => render_into(ours, side, out),
                Side::Remote => render_into(theirs, side, out),
            },
        }
    }
}

/// Reassemble the common ancestor if every region carries a diff3 base.
pub fn render_base(segments: &[Segment]) -> Option<String> {
    let mut out = String::new();
    base_into(segments, &mut out).then_some(out)
}

fn base_into(segments: &[Segment], out: &mut String) -> bool {
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Conflict { base: Some(base), .. } => {
                if !base_into(base, out) {
                    return false;
                }
            }
            Segment::Conflict { base: None, .. } => return false,
        }
    }
    true
}

/// Resolves conflict markers in record files.
#[derive(Debug, Clone, Default)]
pub struct MarkerResolver {
    policy: SyncPolicy,
}

impl MarkerResolver {
    pub fn new(policy: SyncPolicy) -> Self {
        Self { policy }
    }

    /// Resolve one file. `base` is the common ancestor record, if known.
    pub fn resolve(&self, text: &str, base: Option<&TaskRecord>) -> MarkerResolution {
        if !contains_markers(text) {
            return MarkerResolution::clean(text);
        }

        let segments = match parse_segments(text) {
            Ok(segments) => segments,
            Err(err) => {
                warn!(error = %err, "Conflict markers are unbalanced");
                return MarkerResolution::unresolved(err.to_string());
            }
        };

        let local_view = render_side(&segments, Side::Local);
        let remote_view = render_side(&segments, Side::Remote);
        let diff3_base = match base {
            Some(_) => None,
            None => render_base(&segments).and_then(|b| parse_record(&b).ok()),
        };
        let base = base.or(diff3_base.as_ref());

        let mut resolution = match (parse_record(&local_view), parse_record(&remote_view)) {
            (Ok(local), Ok(remote)) => {
                debug!(uuid = %local.uuid, "Both sides parse; merging fields");
                self.merged(AppliedStrategy::FieldMerge, base, &local, &remote, Vec::new())
            }
            (local, remote) => {
                let mut warnings = Vec::new();
                if let Err(err) = &local {
                    warnings.push(format!("local side does not parse: {err}"));
                }
                if let Err(err) = &remote {
                    warnings.push(format!("remote side does not parse: {err}"));
                }
                match (parse_lenient(&local_view), parse_lenient(&remote_view)) {
                    (Some(local), Some(remote)) => self.merged(
                        AppliedStrategy::PartialReconstruction,
                        base,
                        &local,
                        &remote,
                        warnings,
                    ),
                    _ => self.verbatim(&local_view, &remote_view, warnings),
                }
            }
        };

        if resolution.text.as_deref().is_some_and(contains_markers) {
            resolution.text = None;
            resolution.strategy = AppliedStrategy::Unresolved;
            resolution.requires_manual = true;
            resolution
                .warnings
                .push("markers remain after resolution".to_string());
        }
        resolution
    }

    fn merged(
        &self,
        strategy: AppliedStrategy,
        base: Option<&TaskRecord>,
        local: &TaskRecord,
        remote: &TaskRecord,
        mut warnings: Vec<String>,
    ) -> MarkerResolution {
        let outcome = merge_with_policy(base, local, remote, &self.policy);
        let requires_manual = !outcome.is_resolved();
        let text = if requires_manual {
            None
        } else {
            match render_record(&outcome.merged) {
                Ok(text) => Some(text),
                Err(err) => {
                    warnings.push(format!("merged record does not render: {err}"));
                    None
                }
            }
        };
        let failed = text.is_none() && !requires_manual;
        MarkerResolution {
            text,
            was_conflicted: true,
            strategy: if failed {
                AppliedStrategy::Unresolved
            } else {
                strategy
            },
            outcome: Some(outcome),
            requires_manual: requires_manual || failed,
            needs_review: false,
            warnings,
        }
    }

    fn verbatim(&self, local_view: &str, remote_view: &str, mut warnings: Vec<String>) -> MarkerResolution {
        let side = match self.policy.strategy {
            MergeStrategy::PreferRemote => Side::Remote,
            _ => Side::Local,
        };
        let text = match side {
            Side::Local => local_view,
            Side::Remote => remote_view,
        };
        warnings.push(format!("kept {side:?} side verbatim; review required").to_lowercase());
        MarkerResolution {
            text: Some(text.to_string()),
            was_conflicted: true,
            strategy: AppliedStrategy::Verbatim(side),
            outcome: None,
            requires_manual: false,
            needs_review: true,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{Field, FieldResolution};
    use taskrepo_core::Status;

    const OURS: &str = "---\nuuid: t1\ntitle: Fix login\nstatus: in-progress\npriority: H\n\
tags:\n- auth\ncreated: 2025-10-01T10:00:00Z\nmodified: 2025-10-02T10:00:00Z\n---\n\nBody\n";

    fn conflicted() -> String {
        "---\nuuid: t1\ntitle: Fix login\n\
<<<<<<< HEAD\nstatus: in-progress\npriority: H\ntags:\n- auth\n\
=======\nstatus: done\npriority: L\ntags:\n- web\n\
>>>>>>> origin/main\n\
<<<<<<< HEAD\ncreated: 2025-10-01T10:00:00Z\nmodified: 2025-10-02T10:00:00Z\n\
=======\ncreated: 2025-10-01T10:00:00Z\nmodified: 2025-10-03T10:00:00Z\n\
>>>>>>> origin/main\n---\n\nBody\n"
            .to_string()
    }

    #[test]
    fn test_clean_text_passes_through() {
        let resolution = MarkerResolver::default().resolve(OURS, None);
        assert_eq!(resolution.strategy, AppliedStrategy::Clean);
        assert!(!resolution.was_conflicted);
        assert_eq!(resolution.text.as_deref(), Some(OURS));
    }

    #[test]
    fn test_setext_heading_is_not_a_marker() {
        let text = "---\nuuid: t1\n---\n\nHeading\n=======\n";
        assert!(!contains_markers(text));
        assert_eq!(parse_segments(text).unwrap().len(), 1);
    }

    #[test]
    fn test_field_merge_of_both_views() {
        let resolution = MarkerResolver::default().resolve(&conflicted(), None);
        assert_eq!(resolution.strategy, AppliedStrategy::FieldMerge);
        assert!(!resolution.requires_manual);

        let merged = parse_record(resolution.text.as_deref().unwrap()).unwrap();
        assert_eq!(merged.status, Status::Done);
        assert!(merged.tags.contains(&"auth".to_string()));
        assert!(merged.tags.contains(&"web".to_string()));
        assert_eq!(merged.priority.as_str(), "L");

        let outcome = resolution.outcome.unwrap();
        assert_eq!(outcome.resolution(Field::Tags), Some(FieldResolution::Union));
    }

    #[test]
    fn test_nested_regions_take_one_side_at_every_depth() {
        let text = "a\n<<<<<<< HEAD\nb\n<<<<<<< inner\nc\n=======\nd\n>>>>>>> inner\ne\n\
=======\nf\n>>>>>>> origin/main\ng\n";
        let segments = parse_segments(text).unwrap();
        assert_eq!(render_side(&segments, Side::Local), "a\nb\nc\ne\ng\n");
        assert_eq!(render_side(&segments, Side::Remote), "a\nf\ng\n");
    }

    #[test]
    fn test_longer_markers_pair_by_width() {
        let text = "<<<<<<<<< HEAD\nx\n=======\nstill x\n=========\ny\n>>>>>>>>> other\n";
        let segments = parse_segments(text).unwrap();
        assert_eq!(render_side(&segments, Side::Local), "x\n=======\nstill x\n");
        assert_eq!(render_side(&segments, Side::Remote), "y\n");
        assert!(contains_markers(">>>>>>>>>>> theirs\n"));

        let mismatched = "<<<<<<< HEAD\nx\n=========\ny\n>>>>>>> other\n";
        assert!(parse_segments(mismatched).is_err());
    }

    #[test]
    fn test_nested_wide_region_resolves_to_one_side() {
        let text = "---\nuuid: t1\ntitle: Fix login\n\
<<<<<<< HEAD\nstatus: in-progress\n\
<<<<<<<<< HEAD\npriority: H\n=========\npriority: L\n>>>>>>>>> feature\n\
=======\nstatus: in-progress\npriority: M\n>>>>>>> origin/main\n\
created: 2025-10-01T10:00:00Z\nmodified: 2025-10-02T10:00:00Z\n---\n\nBody\n";
        let resolution = MarkerResolver::default().resolve(text, None);
        assert_eq!(resolution.strategy, AppliedStrategy::FieldMerge);
        assert!(!resolution.requires_manual);

        let resolved = resolution.text.unwrap();
        assert!(!contains_markers(&resolved));
        assert!(!resolved.contains("<<<<") && !resolved.contains(">>>>"));
        let merged = parse_record(&resolved).unwrap();
        assert_eq!(merged.priority.as_str(), "H");
        assert_eq!(merged.status, Status::InProgress);
    }

    #[test]
    fn test_diff3_base_section() {
        let text = "<<<<<<< HEAD\nours\n||||||| base\norig\n=======\ntheirs\n>>>>>>> x\n";
        let segments = parse_segments(text).unwrap();
        assert_eq!(render_base(&segments).as_deref(), Some("orig\n"));
        assert_eq!(render_side(&segments, Side::Remote), "theirs\n");
    }

    #[test]
    fn test_unbalanced_markers_require_manual() {
        let text = "---\nuuid: t1\n<<<<<<< HEAD\nstatus: done\n=======\nstatus: pending\n---\n";
        assert!(matches!(parse_segments(text), Err(MarkerError::Unclosed { line: 3 })));

        let resolution = MarkerResolver::default().resolve(text, None);
        assert_eq!(resolution.strategy, AppliedStrategy::Unresolved);
        assert!(resolution.requires_manual);
        assert!(resolution.text.is_none());
    }

    #[test]
    fn test_unparseable_views_kept_verbatim() {
        let text = "garbage\n<<<<<<< HEAD\nmine\n=======\ntheirs\n>>>>>>> x\n";
        let resolution = MarkerResolver::default().resolve(text, None);
        assert_eq!(resolution.strategy, AppliedStrategy::Verbatim(Side::Local));
        assert!(resolution.needs_review);
        assert_eq!(resolution.text.as_deref(), Some("garbage\nmine\n"));

        let prefer_remote = MarkerResolver::new(SyncPolicy {
            strategy: MergeStrategy::PreferRemote,
            ..SyncPolicy::default()
        });
        let resolution = prefer_remote.resolve(text, None);
        assert_eq!(resolution.text.as_deref(), Some("garbage\ntheirs\n"));
    }

    #[test]
    fn test_lenient_reconstruction_when_strict_parse_fails() {
        let text = "---\nuuid: t1\ntitle: Broken\n\
<<<<<<< HEAD\nstatus: done\ncreated: 2025-10-01T10:00:00Z\nmodified: yesterday\n\
=======\nstatus: cancelled\ncreated: 2025-10-01T10:00:00Z\nmodified: 2025-10-03T10:00:00Z\n\
>>>>>>> x\n---\n\nBody\n";
        let resolution = MarkerResolver::default().resolve(text, None);
        assert_eq!(resolution.strategy, AppliedStrategy::PartialReconstruction);
        assert!(!resolution.warnings.is_empty());
        let merged = parse_record(resolution.text.as_deref().unwrap()).unwrap();
        assert_eq!(merged.status, Status::Cancelled);
    }

    #[test]
    fn test_lenient_reconstruction_keeps_unknown_keys() {
        let text = "---\nuuid: t1\ntitle: Broken\n\
<<<<<<< HEAD\nstatus: done\ngcal_event_id: abc123\ncreated: 2025-10-01T10:00:00Z\nmodified: yesterday\n\
=======\nstatus: cancelled\ncreated: 2025-10-01T10:00:00Z\nmodified: 2025-10-03T10:00:00Z\n\
>>>>>>> x\n---\n\nBody\n";
        let resolution = MarkerResolver::default().resolve(text, None);
        assert_eq!(resolution.strategy, AppliedStrategy::PartialReconstruction);
        let resolved = resolution.text.unwrap();
        assert!(resolved.contains("gcal_event_id: abc123"));
        let merged = parse_record(&resolved).unwrap();
        assert_eq!(
            merged.extra.get("gcal_event_id"),
            Some(&serde_yaml::Value::String("abc123".to_string()))
        );
    }
}
