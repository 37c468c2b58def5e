//! Migration manifests: the persisted record of which file groups have been
//! migrated and how each one fared.
//!
//! A manifest is a JSON document listing file groups alongside run settings
//! (prompt path, verify commands, repository refs). Runs never rewrite a
//! manifest in place; each run writes a fresh timestamped snapshot, and
//! resuming merges the newest snapshot back into the source manifest.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default prompt file inside a project directory.
pub const SYSTEM_PROMPT_FILE: &str = "system_prompt.md";
/// Default verification script inside a project directory.
pub const VERIFY_SCRIPT_FILE: &str = "verify.py";

/// Outcome of a file group, as persisted in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MigrateResult {
    /// Not yet attempted (or attempted before this manifest existed).
    #[default]
    #[serde(rename = "?")]
    Unknown,
    #[serde(rename = "pass")]
    Pass,
    #[serde(rename = "fail")]
    Fail,
    /// The group was already broken before any generation ran.
    #[serde(rename = "fail-pre-verify")]
    FailPreVerify,
}

impl MigrateResult {
    pub fn is_fail(self) -> bool {
        matches!(self, MigrateResult::Fail | MigrateResult::FailPreVerify)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrateResult::Unknown => "?",
            MigrateResult::Pass => "pass",
            MigrateResult::Fail => "fail",
            MigrateResult::FailPreVerify => "fail-pre-verify",
        }
    }
}

impl fmt::Display for MigrateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrateResult {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "?" => Ok(MigrateResult::Unknown),
            "pass" => Ok(MigrateResult::Pass),
            "fail" => Ok(MigrateResult::Fail),
            "fail-pre-verify" => Ok(MigrateResult::FailPreVerify),
            other => anyhow::bail!("Unknown result '{other}' (expected ?, pass, fail, or fail-pre-verify)"),
        }
    }
}

/// Collapse a relative path into a single filesystem-safe component.
pub fn flatten(filename: &str) -> String {
    filename.replace('/', "__")
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Single-file manifest entry. Kept for older manifests that predate groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    pub filename: String,
    #[serde(default)]
    pub result: MigrateResult,
}

impl FileEntry {
    pub fn group_name(&self) -> String {
        flatten(&self.filename)
    }
}

/// A set of files migrated together in one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileGroup {
    pub files: Vec<String>,
    #[serde(default)]
    pub result: MigrateResult,
}

impl FileGroup {
    pub fn new(files: Vec<String>) -> Self {
        FileGroup {
            files,
            result: MigrateResult::Unknown,
        }
    }

    pub fn single(filename: impl Into<String>) -> Self {
        FileGroup::new(vec![filename.into()])
    }

    /// Stable identifier for the group, independent of file order.
    ///
    /// Single-file groups flatten the path directly. Multi-file groups take
    /// the flattened lexicographically-first member plus a short digest of
    /// the sorted member list, so any two groups with the same files (in any
    /// order) collide and no others do.
    pub fn group_name(&self) -> String {
        match self.files.as_slice() {
            [only] => flatten(only),
            files => {
                let mut sorted: Vec<&str> = files.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                let digest = sha256_hex(&sorted.join(","));
                let first = sorted.first().copied().unwrap_or_default();
                format!("{}-{}", flatten(first), &digest[..8])
            }
        }
    }

    /// Human-facing label used in status lines and log file names.
    pub fn task_name(&self) -> String {
        let first = self
            .files
            .first()
            .map(|f| {
                Path::new(f)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| f.clone())
            })
            .unwrap_or_default();
        if self.files.len() > 1 {
            format!("{} (+{})", first, self.files.len() - 1)
        } else {
            first
        }
    }
}

/// One manifest entry, in either of the two accepted shapes.
///
/// Objects carrying `filename` parse as [`FileEntry`]; objects carrying
/// `files` parse as [`FileGroup`]. Both shapes reject unknown keys, so an
/// object matching neither shape (or claiming both) is a parse error rather
/// than a silent guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestEntry {
    Group(FileGroup),
    Single(FileEntry),
}

impl ManifestEntry {
    pub fn group_name(&self) -> String {
        match self {
            ManifestEntry::Group(g) => g.group_name(),
            ManifestEntry::Single(e) => e.group_name(),
        }
    }

    pub fn result(&self) -> MigrateResult {
        match self {
            ManifestEntry::Group(g) => g.result,
            ManifestEntry::Single(e) => e.result,
        }
    }

    pub fn set_result(&mut self, result: MigrateResult) {
        match self {
            ManifestEntry::Group(g) => g.result = result,
            ManifestEntry::Single(e) => e.result = result,
        }
    }

    /// Normalize either shape into a group.
    pub fn to_group(&self) -> FileGroup {
        match self {
            ManifestEntry::Group(g) => g.clone(),
            ManifestEntry::Single(e) => FileGroup {
                files: vec![e.filename.clone()],
                result: e.result,
            },
        }
    }
}

impl From<FileGroup> for ManifestEntry {
    fn from(group: FileGroup) -> Self {
        ManifestEntry::Group(group)
    }
}

/// Top-level manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub target_repo_ref: String,
    pub target_repo_remote: String,
    pub migrate_repo_ref: String,
    pub files: Vec<ManifestEntry>,
    /// Path template for the system prompt; `{project_dir}` is substituted.
    pub system_prompt: String,
    /// Command template; `{py}` and `{project_dir}` are substituted, and the
    /// group's file paths are appended as arguments.
    pub verify_cmd: String,
    /// Like `verify_cmd`, run before generation. Empty string disables it.
    pub pre_verify_cmd: String,
    pub time: NaiveDateTime,
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest {
            target_repo_ref: String::new(),
            target_repo_remote: String::new(),
            migrate_repo_ref: String::new(),
            files: Vec::new(),
            system_prompt: format!("{{project_dir}}/{SYSTEM_PROMPT_FILE}"),
            verify_cmd: format!("{{py}} {{project_dir}}/{VERIFY_SCRIPT_FILE}"),
            pre_verify_cmd: format!("{{py}} {{project_dir}}/{VERIFY_SCRIPT_FILE} --pre"),
            time: Local::now().naive_local(),
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Manifest> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest at {}", path.display()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize manifest")
    }

    /// Write this manifest as `manifest-<timestamp>.json` under `dir`.
    ///
    /// Existing snapshots are never overwritten: a name collision bumps a
    /// numeric suffix until creation succeeds.
    pub fn write_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create results dir {}", dir.display()))?;
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let body = self.to_json_pretty()?;

        let mut path = dir.join(format!("manifest-{stamp}.json"));
        let mut suffix = 1u32;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(body.as_bytes())
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    path = dir.join(format!("manifest-{stamp}-{suffix}.json"));
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to create {}", path.display()));
                }
            }
        }
    }
}

/// Fold the results of `incoming` into `base`.
///
/// Only `pass` travels: a base entry whose group also passed in `incoming`
/// becomes `pass`. Everything else about `base` (entry set, order, non-pass
/// results) is kept as is, so repeated merges can only grow the passing set.
pub fn merge_manifests(base: &Manifest, incoming: &Manifest) -> Manifest {
    let mut merged = base.clone();
    let index: HashMap<String, usize> = merged
        .files
        .iter()
        .enumerate()
        .map(|(i, entry)| (entry.group_name(), i))
        .collect();
    for entry in &incoming.files {
        if entry.result() == MigrateResult::Pass {
            if let Some(&i) = index.get(&entry.group_name()) {
                merged.files[i].set_result(MigrateResult::Pass);
            }
        }
    }
    merged
}

/// Newest results snapshot in `dir`, by timestamp then collision suffix.
pub fn find_latest_snapshot(dir: &Path) -> Result<Option<PathBuf>> {
    let pattern = Regex::new(r"^manifest-(\d{8}-\d{6})(?:-(\d+))?\.json$")
        .context("Invalid snapshot pattern")?;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to list {}", dir.display()));
        }
    };

    let mut best: Option<((String, u64), PathBuf)> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(caps) = pattern.captures(name) else { continue };
        let stamp = caps[1].to_string();
        let suffix = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(1);
        let key = (stamp, suffix);
        if best.as_ref().map_or(true, |(k, _)| key > *k) {
            best = Some((key, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(files: &[&str], result: MigrateResult) -> ManifestEntry {
        ManifestEntry::Group(FileGroup {
            files: files.iter().map(|f| f.to_string()).collect(),
            result,
        })
    }

    #[test]
    fn test_flatten_replaces_separators() {
        assert_eq!(flatten("src/app/main.kt"), "src__app__main.kt");
        assert_eq!(flatten("main.kt"), "main.kt");
    }

    #[test]
    fn test_group_name_single_file() {
        let g = FileGroup::single("src/app/main.kt");
        assert_eq!(g.group_name(), "src__app__main.kt");
    }

    #[test]
    fn test_group_name_order_invariant() {
        let a = FileGroup::new(vec!["src/b.kt".into(), "src/a.kt".into()]);
        let b = FileGroup::new(vec!["src/a.kt".into(), "src/b.kt".into()]);
        assert_eq!(a.group_name(), b.group_name());
        // Prefix comes from the sorted list, not listing order.
        assert!(a.group_name().starts_with("src__a.kt-"));
        let suffix = a.group_name().rsplit('-').next().map(str::to_string);
        assert_eq!(suffix.map(|s| s.len()), Some(8));
    }

    #[test]
    fn test_group_name_distinct_groups_differ() {
        let a = FileGroup::new(vec!["a.kt".into(), "b.kt".into()]);
        let b = FileGroup::new(vec!["a.kt".into(), "c.kt".into()]);
        assert_ne!(a.group_name(), b.group_name());
    }

    #[test]
    fn test_task_name_uses_basename_and_count() {
        let single = FileGroup::single("src/app/main.kt");
        assert_eq!(single.task_name(), "main.kt");
        let multi = FileGroup::new(vec!["src/main.kt".into(), "src/util.kt".into()]);
        assert_eq!(multi.task_name(), "main.kt (+1)");
    }

    #[test]
    fn test_parse_legacy_entries() {
        let json = r#"{
            "target_repo_ref": "abc123",
            "files": [
                {"filename": "app/main.kt", "result": "pass"},
                {"filename": "app/util.kt"}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.target_repo_ref, "abc123");
        assert_eq!(manifest.files.len(), 2);
        match &manifest.files[0] {
            ManifestEntry::Single(e) => {
                assert_eq!(e.filename, "app/main.kt");
                assert_eq!(e.result, MigrateResult::Pass);
            }
            other => panic!("expected single entry, got {other:?}"),
        }
        assert_eq!(manifest.files[1].result(), MigrateResult::Unknown);
        // Defaults fill in the unspecified settings.
        assert_eq!(manifest.system_prompt, "{project_dir}/system_prompt.md");
        assert_eq!(manifest.verify_cmd, "{py} {project_dir}/verify.py");
        assert_eq!(manifest.pre_verify_cmd, "{py} {project_dir}/verify.py --pre");
    }

    #[test]
    fn test_parse_mixed_entry_shapes() {
        let json = r#"{
            "files": [
                {"filename": "a.py", "result": "fail"},
                {"files": ["b.py", "c.py"], "result": "fail-pre-verify"}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert!(matches!(manifest.files[0], ManifestEntry::Single(_)));
        assert!(matches!(manifest.files[1], ManifestEntry::Group(_)));
        assert_eq!(manifest.files[1].result(), MigrateResult::FailPreVerify);
        assert_eq!(manifest.files[1].to_group().files, vec!["b.py", "c.py"]);
    }

    #[test]
    fn test_parse_rejects_ambiguous_entry() {
        let json = r#"{"files": [{"filename": "a.py", "files": ["a.py"]}]}"#;
        assert!(serde_json::from_str::<Manifest>(json).is_err());
    }

    #[test]
    fn test_parse_rejects_entry_with_neither_shape() {
        let json = r#"{"files": [{"result": "pass"}]}"#;
        assert!(serde_json::from_str::<Manifest>(json).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_result() {
        let json = r#"{"files": [{"filename": "a.py", "result": "maybe"}]}"#;
        assert!(serde_json::from_str::<Manifest>(json).is_err());
    }

    #[test]
    fn test_roundtrip_preserves_shapes() {
        let manifest = Manifest {
            files: vec![
                ManifestEntry::Single(FileEntry {
                    filename: "a.py".into(),
                    result: MigrateResult::Pass,
                }),
                group(&["b.py", "c.py"], MigrateResult::Unknown),
            ],
            ..Manifest::default()
        };
        let json = manifest.to_json_pretty().unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.files, manifest.files);
    }

    #[test]
    fn test_merge_promotes_matching_pass() {
        let base = Manifest {
            files: vec![
                group(&["a.py"], MigrateResult::Fail),
                group(&["b.py"], MigrateResult::Unknown),
            ],
            ..Manifest::default()
        };
        let incoming = Manifest {
            files: vec![group(&["a.py"], MigrateResult::Pass)],
            ..Manifest::default()
        };
        let merged = merge_manifests(&base, &incoming);
        assert_eq!(merged.files[0].result(), MigrateResult::Pass);
        assert_eq!(merged.files[1].result(), MigrateResult::Unknown);
    }

    #[test]
    fn test_merge_never_downgrades_pass() {
        let base = Manifest {
            files: vec![group(&["a.py"], MigrateResult::Pass)],
            ..Manifest::default()
        };
        let incoming = Manifest {
            files: vec![group(&["a.py"], MigrateResult::Fail)],
            ..Manifest::default()
        };
        let merged = merge_manifests(&base, &incoming);
        assert_eq!(merged.files[0].result(), MigrateResult::Pass);
    }

    #[test]
    fn test_merge_ignores_entries_missing_from_base() {
        let base = Manifest {
            files: vec![group(&["a.py"], MigrateResult::Unknown)],
            ..Manifest::default()
        };
        let incoming = Manifest {
            files: vec![
                group(&["a.py"], MigrateResult::Pass),
                group(&["z.py"], MigrateResult::Pass),
            ],
            ..Manifest::default()
        };
        let merged = merge_manifests(&base, &incoming);
        assert_eq!(merged.files.len(), 1);
        assert_eq!(merged.files[0].result(), MigrateResult::Pass);
    }

    #[test]
    fn test_merge_matches_groups_by_content_not_order() {
        let base = Manifest {
            files: vec![group(&["a.py", "b.py"], MigrateResult::Unknown)],
            ..Manifest::default()
        };
        let incoming = Manifest {
            files: vec![group(&["b.py", "a.py"], MigrateResult::Pass)],
            ..Manifest::default()
        };
        let merged = merge_manifests(&base, &incoming);
        assert_eq!(merged.files[0].result(), MigrateResult::Pass);
    }

    #[test]
    fn test_merge_matches_entry_and_group_shapes() {
        let base = Manifest {
            files: vec![ManifestEntry::Single(FileEntry {
                filename: "a.py".into(),
                result: MigrateResult::Unknown,
            })],
            ..Manifest::default()
        };
        let incoming = Manifest {
            files: vec![group(&["a.py"], MigrateResult::Pass)],
            ..Manifest::default()
        };
        let merged = merge_manifests(&base, &incoming);
        assert_eq!(merged.files[0].result(), MigrateResult::Pass);
    }

    #[test]
    fn test_snapshot_write_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::default();
        let first = manifest.write_snapshot(dir.path()).unwrap();
        let second = manifest.write_snapshot(dir.path()).unwrap();
        assert!(first.exists());
        assert!(second.exists());
        assert_ne!(first, second);
        // Collision within the same second takes a numeric suffix.
        let second_name = second.file_name().unwrap().to_string_lossy().into_owned();
        if second_name.matches('-').count() > 2 {
            assert!(second_name.ends_with("-2.json"));
        }
    }

    #[test]
    fn test_find_latest_snapshot_orders_by_stamp_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "manifest-20250101-120000.json",
            "manifest-20250101-120000-2.json",
            "manifest-20241231-235959.json",
            "manifest-notes.json",
            "other.json",
        ] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        let latest = find_latest_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_string_lossy(),
            "manifest-20250101-120000-2.json"
        );
    }

    #[test]
    fn test_find_latest_snapshot_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(find_latest_snapshot(&missing).unwrap().is_none());
    }

    #[test]
    fn test_time_roundtrip_without_timezone() {
        let json = r#"{"time": "2025-02-10T11:26:33.969758"}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        let back = serde_json::to_string(&manifest).unwrap();
        assert!(back.contains("2025-02-10T11:26:33.969758"));
    }
}
