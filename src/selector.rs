//! LLM-driven ranking of few-shot examples.
//!
//! Large example libraries blow out the context window, so each group asks
//! the model to pick the examples worth replaying for its particular files.
//! The verdict is JSON with 1-based example ids; malformed entries are
//! warned about and skipped rather than failing the attempt.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::examples::{FileContent, MigrationExample};
use crate::llm::{GenerationClient, Message};
use crate::parse::parse_json_response;

pub const EXAMPLE_SELECTION_PROMPT: &str = r#"You are an expert at analyzing code migration patterns. Your task is to select the most relevant examples for migrating specific target files.

Analyze the target files and all available example pairs. Then select only the examples that demonstrate patterns and transformations that will be most helpful for migrating the target.

Consider:
1. Language features and syntax
2. Similar patterns or structures
3. Related functionality or domain
4. Migration complexity and scope

IMPORTANT: You must provide your response in the following JSON format:

{
    "analysis": "Brief analysis of what needs to be migrated in the target files",
    "selected_examples": [
        {
            "id": "Example number (integer)",
            "reason": "Detailed justification for selecting this example"
        }
    ],
    "excluded_examples": [
        {
            "id": "Example number (integer)",
            "reason": "Brief reason for excluding this example"
        }
    ]
}

Notes:
- Example numbers should be integers (1, 2, 3, etc.)
- Provide clear, specific reasons for each selection and exclusion
- Focus on selecting examples that demonstrate patterns needed for this specific migration
- Ensure the response is valid JSON that can be parsed programmatically"#;

/// Outcome of a ranking call.
#[derive(Debug, Default)]
pub struct ExampleSelection {
    pub selected: Vec<MigrationExample>,
    pub analysis: String,
    /// Reason per selected example, keyed by example name.
    pub selection_reasons: BTreeMap<String, String>,
    /// Reason per excluded example, keyed by example name.
    pub exclusion_reasons: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SelectionVerdict {
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    selected_examples: Vec<VerdictEntry>,
    #[serde(default)]
    excluded_examples: Vec<VerdictEntry>,
}

/// One id/reason pair. `id` stays loose because models reply with either
/// `3` or `"3"`.
#[derive(Debug, Deserialize)]
struct VerdictEntry {
    id: serde_json::Value,
    #[serde(default)]
    reason: String,
}

impl VerdictEntry {
    /// 0-based index into the available examples, if the id is usable.
    fn index(&self, len: usize) -> Option<usize> {
        let id = match &self.id {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }?;
        let idx = usize::try_from(id.checked_sub(1)?).ok()?;
        (idx < len).then_some(idx)
    }
}

/// Build the `[system, user]` ranking request.
pub fn selection_request(
    targets: &[FileContent],
    available: &[MigrationExample],
) -> Vec<Message> {
    let target_content: Vec<String> = targets
        .iter()
        .map(|f| format!("### `{}`\n```\n{}\n```", f.name, f.content))
        .collect();

    let examples_content: Vec<String> = available
        .iter()
        .enumerate()
        .map(|(i, example)| {
            let mut example_files = Vec::new();
            for old_file in &example.old_files {
                example_files.push(format!(
                    "### `{}`\n```\n{}\n```",
                    old_file.name, old_file.content
                ));
                if let Some(new_file) =
                    example.new_files.iter().find(|n| n.name == old_file.name)
                {
                    example_files.push(format!(
                        "### `{}` (migrated)\n```\n{}\n```",
                        new_file.name, new_file.content
                    ));
                }
            }
            format!("Example {} ({}):\n{}", i + 1, example.name, example_files.join("\n"))
        })
        .collect();

    let prompt = format!(
        "{EXAMPLE_SELECTION_PROMPT}\n\nTarget Files:\n{}\n\nAvailable Examples:\n\n{}",
        target_content.join("\n"),
        examples_content.join("\n")
    );

    vec![Message::system(EXAMPLE_SELECTION_PROMPT), Message::user(prompt)]
}

/// Map a raw verdict back onto the available examples.
pub fn parse_selection(
    content: &str,
    available: &[MigrationExample],
) -> Result<ExampleSelection> {
    let verdict: SelectionVerdict =
        parse_json_response(content).context("Example ranking response was not usable")?;

    let mut selection = ExampleSelection {
        analysis: verdict.analysis,
        ..ExampleSelection::default()
    };

    for entry in &verdict.selected_examples {
        match entry.index(available.len()) {
            Some(idx) => {
                let example = &available[idx];
                selection.selected.push(example.clone());
                selection
                    .selection_reasons
                    .insert(example.name.clone(), entry.reason.clone());
            }
            None => eprintln!("Warning: Invalid selected example id: {:?}", entry.id),
        }
    }

    for entry in &verdict.excluded_examples {
        match entry.index(available.len()) {
            Some(idx) => {
                selection
                    .exclusion_reasons
                    .insert(available[idx].name.clone(), entry.reason.clone());
            }
            None => eprintln!("Warning: Invalid excluded example id: {:?}", entry.id),
        }
    }

    Ok(selection)
}

/// Ask the model which examples matter for these targets.
///
/// An empty library short-circuits to an empty selection without a call.
pub async fn select_relevant_examples<C: GenerationClient>(
    client: &C,
    targets: &[FileContent],
    available: &[MigrationExample],
) -> Result<ExampleSelection> {
    if available.is_empty() {
        return Ok(ExampleSelection::default());
    }
    let messages = selection_request(targets, available);
    let response = client.generate(&messages).await?;
    parse_selection(&response, available)
}
