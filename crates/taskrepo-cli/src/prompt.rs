//! Line-based interactive conflict resolution on the terminal.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;

use taskrepo_sync::merge::FieldCategory;
use taskrepo_sync::resolver::FieldChoice;
use taskrepo_sync::{ConflictPrompt, FieldDecision, FieldResolution, InteractiveResolver, SyncError};

/// Asks on stdin/stdout for each manual-required field.
#[derive(Debug, Default)]
pub struct PromptResolver;

impl PromptResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InteractiveResolver for PromptResolver {
    async fn resolve(&self, prompt: &ConflictPrompt) -> Result<Vec<FieldDecision>, SyncError> {
        let prompt = prompt.clone();
        tokio::task::spawn_blocking(move || ask(&prompt))
            .await
            .map_err(|e| SyncError::Interactive(e.to_string()))?
            .map_err(|e| SyncError::Interactive(e.to_string()))
    }
}

fn ask(prompt: &ConflictPrompt) -> io::Result<Vec<FieldDecision>> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout().lock();

    writeln!(out)?;
    writeln!(out, "Conflict in {} ({})", prompt.path.display(), prompt.title)?;

    let mut decisions = Vec::new();
    for choice in &prompt.choices {
        show(&mut out, choice)?;
        let lists = choice.field.category() == FieldCategory::List;
        loop {
            if lists {
                write!(out, "  keep [l]ocal, [r]emote, [u]nion or [s]kip? ")?;
            } else {
                write!(out, "  keep [l]ocal, [r]emote or [s]kip? ")?;
            }
            out.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                return Ok(decisions);
            }
            let resolution = match line.trim() {
                "l" | "local" => FieldResolution::LocalWins,
                "r" | "remote" => FieldResolution::RemoteWins,
                "u" | "union" if lists => FieldResolution::Union,
                "s" | "skip" => break,
                _ => continue,
            };
            decisions.push(FieldDecision {
                field: choice.field,
                resolution,
            });
            break;
        }
    }
    Ok(decisions)
}

fn show(out: &mut impl Write, choice: &FieldChoice) -> io::Result<()> {
    writeln!(out, "  {}:", choice.field)?;
    if let Some(base) = &choice.base {
        writeln!(out, "    base:   {}", one_line(base))?;
    }
    writeln!(out, "    local:  {}", one_line(&choice.local))?;
    writeln!(out, "    remote: {}", one_line(&choice.remote))
}

fn one_line(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 72 {
        let cut: String = flat.chars().take(69).collect();
        format!("{cut}...")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_line_truncates_long_descriptions() {
        let long = "word ".repeat(40);
        let flat = one_line(&long);
        assert_eq!(flat.chars().count(), 72);
        assert!(flat.ends_with("..."));
        assert_eq!(one_line("a\n\nb"), "a b");
    }
}
