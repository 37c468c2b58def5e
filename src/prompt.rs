//! Prompt assembly for migration conversations.
//!
//! A migration transcript opens with the project's system prompt, replays
//! each few-shot example as a request/response pair, and ends with the same
//! request for the target files. Files travel as `### `name`` headers over
//! fenced code blocks; [`crate::parse::extract_code_blocks`] is the inverse.

use crate::examples::{FileContent, MigrationExample};
use crate::llm::Message;

const MIGRATE_INSTRUCTION: &str = "Migrate this code to the new format:";
const MIGRATE_SUFFIX: &str =
    ". Return the full content for all files mentioned, don't leave anything out. You can rename a file if necessary.";
const RESPONSE_PREFIX: &str = "Here's the migrated code:";

/// Starter system prompt written by `init`. Projects are expected to replace
/// the placeholder section with migration-specific guidance.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert software engineer performing a code migration.

Rewrite the files you are given from the old format to the new format. Follow the patterns shown in the examples exactly. Keep behavior identical unless the migration requires otherwise.

Respond with every file in full, each introduced by a `### `filename`` header and wrapped in a fenced code block. Do not abbreviate or omit unchanged sections.

<!-- Describe the migration here: what changes, what stays, known pitfalls. -->
";

/// Fence language tag for a filename, by extension.
pub fn language_for(filename: &str) -> &str {
    let ext = filename.rsplit('.').next().unwrap_or_default();
    match ext {
        "kt" | "kts" => "kotlin",
        "py" => "python",
        "rs" => "rust",
        "java" => "java",
        "js" | "jsx" | "mjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "rb" => "ruby",
        "swift" => "swift",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "scala" => "scala",
        "sh" => "bash",
        "sql" => "sql",
        "md" => "markdown",
        "yml" | "yaml" => "yaml",
        "json" => "json",
        "toml" => "toml",
        other => other,
    }
}

/// Render one file as a header plus fenced block.
pub fn file_block(name: &str, content: &str) -> String {
    format!(
        "### `{}`\n```{}\n{}\n```",
        name,
        language_for(name),
        content.trim()
    )
}

fn files_block(files: &[FileContent]) -> String {
    files
        .iter()
        .map(|f| file_block(&f.name, &f.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The user-turn migration request for a set of files.
pub fn migration_request(files: &[FileContent]) -> String {
    format!("{MIGRATE_INSTRUCTION}\n\n{}{MIGRATE_SUFFIX}", files_block(files))
}

/// An example replayed as a request/response pair. Examples without migrated
/// counterparts contribute only the request turn.
pub fn example_messages(example: &MigrationExample) -> Vec<Message> {
    let mut messages = vec![Message::user(migration_request(&example.old_files))];
    if !example.new_files.is_empty() {
        messages.push(Message::assistant(format!(
            "{RESPONSE_PREFIX}\n{}",
            files_block(&example.new_files)
        )));
    }
    messages
}

/// Full opening transcript: system prompt, examples, then the live request.
pub fn initial_transcript(
    system_prompt: &str,
    examples: &[MigrationExample],
    targets: &[FileContent],
) -> Vec<Message> {
    let mut messages = vec![Message::system(system_prompt)];
    for example in examples {
        messages.extend(example_messages(example));
    }
    messages.push(Message::user(migration_request(targets)));
    messages
}

/// Corrective turn after a failed verification.
pub fn verification_feedback(output: &str) -> Message {
    Message::user(format!(
        "Verification failed with this output:\n\n```\n{output}\n```\n\nFix the code and return the full content for all files again."
    ))
}

/// Corrective turn after a malformed response.
pub fn protocol_feedback(detail: &str, files: &[String]) -> Message {
    Message::user(format!(
        "Your last response could not be applied: {detail}. Respond again with a `### `name`` header followed by a fenced code block for each of these files, in full: {}.",
        files.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(name: &str, body: &str) -> FileContent {
        FileContent::new(name, body)
    }

    #[test]
    fn test_migration_request_single_file() {
        let files = vec![content(
            "main.kt",
            "\nfun main() {\n    apiv1(\"Hello, world!\")\n}\n",
        )];
        assert_eq!(
            migration_request(&files),
            "Migrate this code to the new format:\n\n### `main.kt`\n```kotlin\nfun main() {\n    apiv1(\"Hello, world!\")\n}\n```. Return the full content for all files mentioned, don't leave anything out. You can rename a file if necessary."
        );
    }

    #[test]
    fn test_migration_request_multiple_files() {
        let files = vec![
            content("main.kt", "fun main() {}"),
            content("util.kt", "fun helper() {}"),
        ];
        assert_eq!(
            migration_request(&files),
            "Migrate this code to the new format:\n\n### `main.kt`\n```kotlin\nfun main() {}\n```\n\n### `util.kt`\n```kotlin\nfun helper() {}\n```. Return the full content for all files mentioned, don't leave anything out. You can rename a file if necessary."
        );
    }

    #[test]
    fn test_example_pair_renders_both_turns() {
        let example = MigrationExample {
            name: "greet".into(),
            old_files: vec![content("greet.py", "print('hi')")],
            new_files: vec![content("greet.py", "print('hello')")],
        };
        let messages = example_messages(&example);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(
            messages[1].content,
            "Here's the migrated code:\n### `greet.py`\n```python\nprint('hello')\n```"
        );
    }

    #[test]
    fn test_example_without_new_files_is_request_only() {
        let example = MigrationExample {
            name: "orphan".into(),
            old_files: vec![content("a.py", "x = 1")],
            new_files: vec![],
        };
        let messages = example_messages(&example);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn test_initial_transcript_order() {
        let example = MigrationExample {
            name: "ex".into(),
            old_files: vec![content("a.py", "old")],
            new_files: vec![content("a.py", "new")],
        };
        let transcript = initial_transcript("be careful", &[example], &[content("t.py", "target")]);
        let roles: Vec<&str> = transcript.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(transcript[0].content, "be careful");
        assert!(transcript[3].content.contains("### `t.py`"));
    }

    #[test]
    fn test_language_fallback_is_extension() {
        assert_eq!(language_for("query.graphql"), "graphql");
        assert_eq!(language_for("Makefile"), "Makefile");
    }
}
