//! Parsing of model responses.
//!
//! Migration replies are markdown: prose, `### `file`` headers, and fenced
//! code blocks. Ranking replies are JSON, sometimes wrapped in fences or
//! chatter. Both parsers here are line/character scanners with no grammar
//! beyond what the prompts ask for.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

/// A fenced code block, with the filename from its `### `name`` header when
/// one immediately preceded it.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlock {
    pub filename: Option<String>,
    pub code: String,
}

/// A response split into code blocks and the prose around them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodeResponse {
    pub code_blocks: Vec<CodeBlock>,
    /// Non-code lines, with each block's position marked by `<code>`.
    pub other_text: String,
}

impl CodeResponse {
    /// Blocks that carry a filename header, as `(name, code)` pairs.
    pub fn named_blocks(&self) -> impl Iterator<Item = (&str, &str)> {
        self.code_blocks
            .iter()
            .filter_map(|b| b.filename.as_deref().map(|name| (name, b.code.as_str())))
    }
}

/// Split a markdown response into fenced code blocks and surrounding text.
///
/// A header line of the form `### `name`` (exactly two backticks on the
/// line) names the next code block. The name resets after each block, so a
/// block without its own header stays anonymous.
pub fn extract_code_blocks(markdown: &str) -> CodeResponse {
    let mut blocks = Vec::new();
    let mut other_text: Vec<&str> = Vec::new();
    let mut filename: Option<String> = None;

    let mut lines = markdown.lines();
    while let Some(line) = lines.next() {
        let stripped = line.trim_start();
        if stripped.starts_with("### ") && line.matches('`').count() == 2 {
            let mut ticks = line.match_indices('`').map(|(i, _)| i);
            if let (Some(start), Some(end)) = (ticks.next(), ticks.next()) {
                filename = Some(line[start + 1..end].to_string());
            }
        } else if stripped.starts_with("```") {
            let mut code: Vec<&str> = Vec::new();
            for inner in lines.by_ref() {
                if inner.trim_start().starts_with("```") {
                    break;
                }
                code.push(inner);
            }
            blocks.push(CodeBlock {
                filename: filename.take(),
                code: code.join("\n"),
            });
            other_text.push("<code>");
        } else {
            other_text.push(line);
        }
    }

    CodeResponse {
        code_blocks: blocks,
        other_text: other_text.join("\n"),
    }
}

/// Parse a JSON value out of a model reply.
///
/// Tries the raw text, then the contents of a markdown fence, then the first
/// balanced `{...}` region, accepting the first candidate that deserializes.
pub fn parse_json_response<T: DeserializeOwned>(content: &str) -> Result<T> {
    let trimmed = content.trim();

    let mut candidates: Vec<String> = vec![trimmed.to_string()];
    if let Some(fenced) = strip_markdown_fences(trimmed) {
        candidates.push(fenced);
    }
    if let Some(balanced) = extract_balanced_object(trimmed) {
        candidates.push(balanced);
    }

    let mut last_err = None;
    for candidate in &candidates {
        match serde_json::from_str::<T>(candidate) {
            Ok(value) => return Ok(value),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => anyhow!("Response is not valid JSON: {err}"),
        None => anyhow!("Response is empty"),
    })
}

/// Contents of the first fenced block, tolerating a language tag.
fn strip_markdown_fences(content: &str) -> Option<String> {
    let start = content.find("```")?;
    let after_fence = &content[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

/// First balanced `{...}` region, ignoring braces inside string literals.
fn extract_balanced_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in content[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(content[start..start + i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
