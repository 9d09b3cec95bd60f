//! Split-file campaign storage with content-hash dirty tracking.
//!
//! Each entity category of a campaign lives in its own JSON file
//! (`characters.json`, `npcs.json`, ...). [`SplitStorage`] owns one campaign
//! directory and offers exactly one atomicity level: a *batch* of files whose
//! `.tmp` siblings are all written and fsynced first, then renamed over their
//! targets one by one. A crash between renames can leave a mix of old and new
//! files on disk; the session store detects that at resume time by validating
//! a per-snapshot [`Manifest`] whose checksum covers every file's content
//! hash.
//!
//! Writes are skipped when the serialized content hash matches the last
//! committed hash for that file, so unchanged categories cost nothing.
//!
//! All JSON leaves the engine in canonical form: UTF-8, stable key order,
//! 2-space indent, trailing newline (see [`canonical_json`]).
//!
//! Concurrency: one `SplitStorage` instance serializes writes for one
//! campaign; concurrent campaigns are independent instances. Callers hold it
//! inside the session actor, so the file operations here are plain blocking
//! `std::fs`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Entity categories that map 1:1 onto campaign files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Character,
    Npc,
    Location,
    Quest,
    Encounter,
    GameState,
}

impl EntityCategory {
    /// The campaign file this category persists to.
    pub fn file_name(self) -> &'static str {
        match self {
            EntityCategory::Character => "characters.json",
            EntityCategory::Npc => "npcs.json",
            EntityCategory::Location => "locations.json",
            EntityCategory::Quest => "quests.json",
            EntityCategory::Encounter => "encounters.json",
            EntityCategory::GameState => "game_state.json",
        }
    }
}

/// Errors surfaced by storage operations.
#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    /// Serialization produced something that is not a JSON document.
    Serialization(String),
    /// A batch failed mid-commit; the campaign may hold mixed file versions.
    BatchAborted {
        failed_file: String,
        reason: String,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "Storage I/O error: {}", e),
            StorageError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StorageError::BatchAborted {
                failed_file,
                reason,
            } => write!(f, "Batch aborted at '{}': {}", failed_file, reason),
        }
    }
}

impl Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// Per-snapshot record of every campaign file's content hash.
///
/// The `checksum` covers the sorted `path:hash` pairs, so any file that
/// changed (or went missing) after the manifest was committed is detectable
/// with a single comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// Relative path -> SHA-256 hex of file content.
    pub files: BTreeMap<String, String>,
    /// SHA-256 hex over the sorted `path:hash` lines.
    pub checksum: String,
}

impl Manifest {
    /// Build a manifest from `(path, content_hash)` pairs.
    pub fn from_hashes(files: BTreeMap<String, String>) -> Self {
        let checksum = manifest_checksum(&files);
        Self { files, checksum }
    }

    /// True when the stored checksum matches the file table.
    pub fn is_self_consistent(&self) -> bool {
        manifest_checksum(&self.files) == self.checksum
    }
}

fn manifest_checksum(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, hash) in files {
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Serialize a JSON value canonically: stable key order (serde_json maps are
/// ordered), 2-space indent, trailing newline.
pub fn canonical_json(value: &serde_json::Value) -> Result<String, StorageError> {
    let mut out = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    out.push('\n');
    Ok(out)
}

/// SHA-256 hex of serialized content.
pub fn content_hash(serialized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex_string(&hasher.finalize())
}

/// Result of committing a batch.
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    /// Files actually rewritten.
    pub written: Vec<String>,
    /// Files skipped because their content hash was unchanged.
    pub skipped: Vec<String>,
}

/// One campaign directory's split-file store.
#[derive(Debug)]
pub struct SplitStorage {
    root: PathBuf,
    last_hashes: HashMap<String, String>,
}

impl SplitStorage {
    /// Open (creating if needed) the campaign directory at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            last_hashes: HashMap::new(),
        })
    }

    /// The campaign root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a relative campaign file.
    pub fn path_of(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Read and parse a campaign file. `Ok(None)` when it does not exist.
    pub fn read_json(&self, rel: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let path = self.path_of(rel);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let value = serde_json::from_str(&text)
            .map_err(|e| StorageError::Serialization(format!("{}: {}", rel, e)))?;
        Ok(Some(value))
    }

    /// Write a single file as its own batch.
    ///
    /// Returns `true` when the file was rewritten, `false` when the content
    /// hash was unchanged and the write was skipped.
    pub fn write_json(&mut self, rel: &str, value: &serde_json::Value) -> Result<bool, StorageError> {
        let report = self.write_batch(&[(rel.to_string(), value.clone())])?;
        Ok(!report.written.is_empty())
    }

    /// Commit a set of files that must land together.
    ///
    /// Phase 1 serializes every changed file to `<name>.tmp` and fsyncs it.
    /// Phase 2 renames each `.tmp` over its target. A failure in phase 1
    /// aborts cleanly (targets untouched); a failure in phase 2 removes the
    /// remaining `.tmp` files best-effort and reports
    /// [`StorageError::BatchAborted`], since already-renamed files cannot be
    /// taken back.
    pub fn write_batch(
        &mut self,
        files: &[(String, serde_json::Value)],
    ) -> Result<BatchReport, StorageError> {
        let mut report = BatchReport::default();
        // (rel, tmp_path, final_path, new_hash)
        let mut staged: Vec<(String, PathBuf, PathBuf, String)> = Vec::new();

        // Phase 1: serialize, hash, stage.
        for (rel, value) in files {
            let serialized = canonical_json(value)?;
            let hash = content_hash(&serialized);
            if self.last_hashes.get(rel) == Some(&hash) {
                report.skipped.push(rel.clone());
                continue;
            }
            let final_path = self.path_of(rel);
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp_path = final_path.with_extension(tmp_extension(&final_path));
            match write_and_sync(&tmp_path, &serialized) {
                Ok(()) => staged.push((rel.clone(), tmp_path, final_path, hash)),
                Err(e) => {
                    // Abort before any rename: remove everything staged so far.
                    for (_, tmp, _, _) in &staged {
                        let _ = fs::remove_file(tmp);
                    }
                    let _ = fs::remove_file(&tmp_path);
                    return Err(StorageError::Io(e));
                }
            }
        }

        // Phase 2: rename over the targets.
        for (i, (rel, tmp_path, final_path, hash)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(tmp_path, final_path) {
                log::error!(
                    "batch rename failed for {}: {}; removing {} staged tmp file(s)",
                    rel,
                    e,
                    staged.len() - i - 1
                );
                for (_, tmp, _, _) in &staged[i..] {
                    let _ = fs::remove_file(tmp);
                }
                return Err(StorageError::BatchAborted {
                    failed_file: rel.clone(),
                    reason: e.to_string(),
                });
            }
            self.last_hashes.insert(rel.clone(), hash.clone());
            report.written.push(rel.clone());
        }

        if !report.written.is_empty() {
            log::debug!(
                "committed batch under {}: {} written, {} skipped",
                self.root.display(),
                report.written.len(),
                report.skipped.len()
            );
        }
        Ok(report)
    }

    /// Append one JSON line to a `.jsonl` file, fsyncing the append.
    pub fn append_jsonl(&self, rel: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        let path = self.path_of(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    /// Build a manifest over the given relative paths from the files as they
    /// exist on disk right now. Missing files hash as the empty string.
    pub fn manifest_for(&self, rels: &[String]) -> Result<Manifest, StorageError> {
        let mut files = BTreeMap::new();
        for rel in rels {
            let path = self.path_of(rel);
            let hash = if path.exists() {
                content_hash(&fs::read_to_string(&path)?)
            } else {
                String::new()
            };
            files.insert(rel.clone(), hash);
        }
        Ok(Manifest::from_hashes(files))
    }

    /// Compare the manifest against what is on disk. Returns the relative
    /// paths whose content differs (or which are missing).
    pub fn verify_manifest(&self, manifest: &Manifest) -> Result<Vec<String>, StorageError> {
        if !manifest.is_self_consistent() {
            // A corrupted manifest invalidates everything it covers.
            return Ok(manifest.files.keys().cloned().collect());
        }
        let mut mismatched = Vec::new();
        for (rel, expected) in &manifest.files {
            let path = self.path_of(rel);
            let actual = if path.exists() {
                content_hash(&fs::read_to_string(&path)?)
            } else {
                String::new()
            };
            if &actual != expected {
                mismatched.push(rel.clone());
            }
        }
        Ok(mismatched)
    }

    /// Forget dirty-tracking state (e.g., after an external rollback).
    pub fn reset_dirty_tracking(&mut self) {
        self.last_hashes.clear();
    }
}

/// `characters.json` stages as `characters.json.tmp` (the `.tmp` suffix goes
/// after the full name, not in place of the extension).
fn tmp_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.tmp", ext),
        None => "tmp".to_string(),
    }
}

fn write_and_sync(path: &Path, content: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unchanged_content_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = SplitStorage::open(dir.path()).unwrap();
        let value = json!({"name": "Durgan", "hp": 20});

        assert!(storage.write_json("npcs.json", &value).unwrap());
        assert!(!storage.write_json("npcs.json", &value).unwrap());
        assert!(storage.write_json("npcs.json", &json!({"hp": 14})).unwrap());
    }

    #[test]
    fn canonical_form_is_stable() {
        let a = canonical_json(&json!({"b": 1, "a": 2})).unwrap();
        let b = canonical_json(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with('\n'));
        assert!(a.contains("  \"a\""));
    }

    #[test]
    fn batch_commits_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = SplitStorage::open(dir.path()).unwrap();
        let report = storage
            .write_batch(&[
                ("characters.json".to_string(), json!([{"id": "pA"}])),
                ("game_state.json".to_string(), json!({"round": 1})),
            ])
            .unwrap();
        assert_eq!(report.written.len(), 2);
        assert!(dir.path().join("characters.json").exists());
        assert!(dir.path().join("game_state.json").exists());
        assert!(!dir.path().join("characters.json.tmp").exists());
    }

    #[test]
    fn manifest_detects_out_of_band_edits() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = SplitStorage::open(dir.path()).unwrap();
        storage.write_json("quests.json", &json!([])).unwrap();

        let rels = vec!["quests.json".to_string()];
        let manifest = storage.manifest_for(&rels).unwrap();
        assert!(storage.verify_manifest(&manifest).unwrap().is_empty());

        // Simulate a crash that left a partially renamed file set.
        std::fs::write(dir.path().join("quests.json"), "[{\"id\": 1}]\n").unwrap();
        let mismatched = storage.verify_manifest(&manifest).unwrap();
        assert_eq!(mismatched, vec!["quests.json".to_string()]);
    }

    #[test]
    fn jsonl_appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SplitStorage::open(dir.path()).unwrap();
        storage
            .append_jsonl("party/actions.jsonl", &json!({"id": 1}))
            .unwrap();
        storage
            .append_jsonl("party/actions.jsonl", &json!({"id": 2}))
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join("party/actions.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
