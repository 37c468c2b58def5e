//! Evaluation artifact capture.
//!
//! Every passing migration can be snapshotted as a future regression case:
//! the pre-migration sources plus a manifest pointing at the verify command
//! that accepted the result. Artifacts land under `evals/<group>-<n>/`,
//! where `n` is the first free index.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::examples::FileContent;
use crate::manifest::{FileGroup, Manifest, ManifestEntry, MigrateResult};

/// Write one eval case for a migration that just passed.
///
/// `sources` are the original (pre-migration) file contents, named by their
/// group-declared names. Returns the created case directory.
pub fn capture_eval_case(
    evals_dir: &Path,
    group: &FileGroup,
    sources: &[FileContent],
    verify_cmd: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(evals_dir)
        .with_context(|| format!("Failed to create {}", evals_dir.display()))?;

    let case_dir = claim_case_dir(evals_dir, &group.group_name())?;
    let source_dir = case_dir.join("source");

    for file in sources {
        let dest = source_dir.join(contained_name(&file.name));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to write eval source for {}", file.name))?;
        }
        fs::write(&dest, &file.content)
            .with_context(|| format!("Failed to write eval source for {}", file.name))?;
    }

    let manifest = Manifest {
        files: vec![ManifestEntry::Group(FileGroup {
            files: group.files.clone(),
            result: MigrateResult::Pass,
        })],
        verify_cmd: verify_cmd.to_string(),
        ..Manifest::default()
    };
    let manifest_path = case_dir.join("manifest.json");
    fs::write(&manifest_path, manifest.to_json_pretty()?)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

    Ok(case_dir)
}

/// Strip root and parent-dir components so absolute target paths land
/// inside the case directory instead of back at their real location.
fn contained_name(name: &str) -> PathBuf {
    Path::new(name)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Create `<evals_dir>/<group>-<n>` for the first free `n`, atomically.
fn claim_case_dir(evals_dir: &Path, group_name: &str) -> Result<PathBuf> {
    for n in 1..10_000u32 {
        let candidate = evals_dir.join(format!("{group_name}-{n}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to create {}", candidate.display()));
            }
        }
    }
    bail!("Too many eval cases for group {group_name}");
}
