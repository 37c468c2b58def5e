//! Few-shot migration examples loaded from a project's `examples/` directory.
//!
//! Two layouts are recognized, side by side:
//!
//! - sibling files `name.old.ext` / `name.new.ext`
//! - a directory per example containing `old/` and `new/` subtrees, for
//!   migrations that touch several files at once
//!
//! Each example carries the pre-migration files and their migrated
//! counterparts; prompts replay them as a worked request/response pair.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// A named file with its full contents.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContent {
    pub name: String,
    pub content: String,
}

impl FileContent {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        FileContent {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// One worked example: the files before and after migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationExample {
    pub name: String,
    pub old_files: Vec<FileContent>,
    pub new_files: Vec<FileContent>,
}

/// Load every example under `examples_dir`, sorted by example name.
///
/// A missing directory is treated as "no examples". An `.old.` file without
/// its `.new.` sibling is skipped with a warning rather than failing the run.
pub fn load_examples(examples_dir: &Path) -> Result<Vec<MigrationExample>> {
    if !examples_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = fs::read_dir(examples_dir)
        .with_context(|| format!("Failed to read {}", examples_dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to read {}", examples_dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    let mut examples = Vec::new();
    for entry in entries {
        let path = entry.path();
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if path.is_dir() {
            if let Some(example) = load_dir_example(&path, &name)? {
                examples.push(example);
            }
            continue;
        }

        // Sibling pairs are keyed off the `.old.` file; `.new.` files are
        // picked up when their counterpart is visited.
        let Some((stem, ext)) = split_marker(&name, ".old.") else {
            continue;
        };
        let new_path = examples_dir.join(format!("{stem}.new.{ext}"));
        if !new_path.is_file() {
            eprintln!(
                "Warning: example '{}' has no matching {}",
                path.display(),
                new_path.display()
            );
            continue;
        }
        let file = format!("{stem}.{ext}");
        let old = read_example_file(&path)?;
        let new = read_example_file(&new_path)?;
        examples.push(MigrationExample {
            name: stem.to_string(),
            old_files: vec![FileContent::new(&file, old)],
            new_files: vec![FileContent::new(&file, new)],
        });
    }

    Ok(examples)
}

fn load_dir_example(dir: &Path, name: &str) -> Result<Option<MigrationExample>> {
    let old_dir = dir.join("old");
    let new_dir = dir.join("new");
    if !old_dir.is_dir() || !new_dir.is_dir() {
        return Ok(None);
    }
    Ok(Some(MigrationExample {
        name: name.to_string(),
        old_files: read_tree(&old_dir)?,
        new_files: read_tree(&new_dir)?,
    }))
}

/// Read every file under `root`, named by its path relative to `root`.
fn read_tree(root: &Path) -> Result<Vec<FileContent>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("Failed to walk {}", root.display()))?;
        let rel = rel
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        let content = read_example_file(entry.path())?;
        files.push(FileContent::new(rel, content));
    }
    Ok(files)
}

fn read_example_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Split `name` around `marker`, returning the stem and trailing extension.
fn split_marker<'a>(name: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let at = name.find(marker)?;
    let stem = &name[..at];
    let ext = &name[at + marker.len()..];
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some((stem, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_sibling_pairs() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("greet.old.py"), "print('hi')\n");
        write(&dir.path().join("greet.new.py"), "print('hello')\n");

        let examples = load_examples(dir.path()).unwrap();
        assert_eq!(examples.len(), 1);
        let ex = &examples[0];
        assert_eq!(ex.name, "greet");
        assert_eq!(ex.old_files, vec![FileContent::new("greet.py", "print('hi')\n")]);
        assert_eq!(ex.new_files, vec![FileContent::new("greet.py", "print('hello')\n")]);
    }

    #[test]
    fn test_load_directory_example_with_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let ex_dir = dir.path().join("example1");
        write(&ex_dir.join("old/src/file1.py"), "old one\n");
        write(&ex_dir.join("old/file2.py"), "old two\n");
        write(&ex_dir.join("new/src/file1.py"), "new one\n");
        write(&ex_dir.join("new/file2.py"), "new two\n");

        let examples = load_examples(dir.path()).unwrap();
        assert_eq!(examples.len(), 1);
        let ex = &examples[0];
        assert_eq!(ex.name, "example1");
        let old_names: Vec<&str> = ex.old_files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(old_names, vec!["file2.py", "src/file1.py"]);
        assert_eq!(ex.new_files[1].content, "new one\n");
    }

    #[test]
    fn test_mixed_layouts_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("zeta.old.kt"), "old\n");
        write(&dir.path().join("zeta.new.kt"), "new\n");
        let ex_dir = dir.path().join("alpha");
        write(&ex_dir.join("old/a.kt"), "old\n");
        write(&ex_dir.join("new/a.kt"), "new\n");

        let examples = load_examples(dir.path()).unwrap();
        let names: Vec<&str> = examples.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_old_without_new_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("orphan.old.py"), "old\n");
        let examples = load_examples(dir.path()).unwrap();
        assert!(examples.is_empty());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let examples = load_examples(&dir.path().join("examples")).unwrap();
        assert!(examples.is_empty());
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("README.md"), "docs\n");
        write(&dir.path().join("plain"), "not an example\n");
        let examples = load_examples(dir.path()).unwrap();
        assert!(examples.is_empty());
    }
}
