//! On-disk layout of installed weights under the weights volume.
//!
//! Each install lives at `{storage}/{target}` where `target` is a sanitized
//! relative path (usually the HuggingFace id, e.g. `Qwen/Qwen2.5-7B`), with
//! a `.model-manager` metadata file recording where it came from.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ControlError, Result};

pub const METADATA_FILENAME: &str = ".model-manager";
const RESERVED_NAMES: [&str; 3] = [".hf-cache", "modules", "lost+found"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightInfo {
    pub path: String,
    pub name: String,
    pub size_bytes: u64,
    pub file_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WeightMetadata {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub installed_at: DateTime<Utc>,
}

fn sanitize_segment(part: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let replaced = match RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").ok()) {
        Some(re) => re.replace_all(part, "-").into_owned(),
        None => part.to_string(),
    };
    replaced.trim_matches('-').to_string()
}

/// Normalize a user-supplied relative path: backslashes become slashes,
/// each segment is sanitized, and empty, `.` and `..` segments are dropped.
pub fn normalize_relative_path(raw: &str) -> Option<String> {
    let raw = raw.trim().replace('\\', "/");
    let cleaned: Vec<String> = raw
        .split('/')
        .map(sanitize_segment)
        .filter(|seg| !seg.is_empty() && seg != "." && seg != "..")
        .collect();
    (!cleaned.is_empty()).then(|| cleaned.join("/"))
}

/// Install directory for a model: the override when it normalizes to
/// something, otherwise the model id.
pub fn canonical_target(model_id: &str, target_override: Option<&str>) -> Result<String> {
    target_override
        .and_then(normalize_relative_path)
        .or_else(|| normalize_relative_path(model_id))
        .ok_or_else(|| ControlError::invalid("failed to derive target directory"))
}

pub fn is_reserved(rel: &str) -> bool {
    let trimmed = rel.trim_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    trimmed
        .split('/')
        .any(|seg| seg.is_empty() || seg.starts_with('.') || RESERVED_NAMES.contains(&seg))
}

/// Read-side view of the weights volume. Blocking filesystem calls; run on
/// a blocking thread from async code.
#[derive(Debug, Clone)]
pub struct WeightInventory {
    storage_path: PathBuf,
}

impl WeightInventory {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Absolute path for a relative install name, rejecting reserved paths.
    pub fn resolve(&self, name: &str) -> Result<(String, PathBuf)> {
        let rel = normalize_relative_path(name)
            .ok_or_else(|| ControlError::invalid(format!("invalid model path: {name}")))?;
        if is_reserved(&rel) {
            return Err(ControlError::WeightsNotFound(rel));
        }
        let path = rel.split('/').fold(self.storage_path.clone(), |p, seg| p.join(seg));
        Ok((rel, path))
    }

    /// All installs, largest first.
    pub fn list(&self) -> Result<Vec<WeightInfo>> {
        let mut weights: Vec<WeightInfo> = self
            .install_roots()?
            .into_iter()
            .filter_map(|rel| {
                let path = rel.split('/').fold(self.storage_path.clone(), |p, seg| p.join(seg));
                match weight_info(&path, &rel) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!(name = %rel, error = %e, "failed to inspect weights");
                        None
                    }
                }
            })
            .collect();
        weights.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
        Ok(weights)
    }

    pub fn get(&self, name: &str) -> Result<WeightInfo> {
        let (rel, path) = self.resolve(name)?;
        if !path.exists() {
            return Err(ControlError::WeightsNotFound(rel));
        }
        weight_info(&path, &rel)
    }

    /// Remove an install and any parents it leaves empty.
    pub fn delete(&self, name: &str) -> Result<()> {
        let (rel, path) = self.resolve(name)?;
        if !path.exists() {
            return Err(ControlError::WeightsNotFound(rel));
        }
        let root = std::fs::canonicalize(&self.storage_path)?;
        let target = std::fs::canonicalize(&path)?;
        if !target.starts_with(&root) || target == root {
            return Err(ControlError::invalid("invalid model path: path traversal detected"));
        }
        std::fs::remove_dir_all(&target)?;
        self.prune_empty_parents(&target, &root);
        Ok(())
    }

    fn prune_empty_parents(&self, removed: &Path, root: &Path) {
        let mut current = removed.parent();
        while let Some(dir) = current {
            if !dir.starts_with(root) || dir == root {
                return;
            }
            let empty = std::fs::read_dir(dir).map(|mut it| it.next().is_none()).unwrap_or(false);
            if !empty || std::fs::remove_dir(dir).is_err() {
                return;
            }
            current = dir.parent();
        }
    }

    /// Directories holding a metadata file; when none exist, every
    /// non-reserved top-level directory.
    fn install_roots(&self) -> Result<Vec<String>> {
        if !self.storage_path.exists() {
            return Ok(Vec::new());
        }
        let mut roots = Vec::new();
        collect_metadata_dirs(&self.storage_path, &self.storage_path, &mut roots)?;
        if roots.is_empty() {
            for entry in std::fs::read_dir(&self.storage_path)?.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().is_dir() && !is_reserved(&name) && !name.ends_with(".tmp") {
                    roots.push(name);
                }
            }
        }
        roots.sort();
        Ok(roots)
    }
}

fn collect_metadata_dirs(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            collect_metadata_dirs(base, &path, out)?;
        } else if entry.file_name() == METADATA_FILENAME && dir != base {
            if let Ok(rel) = dir.strip_prefix(base) {
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                out.push(rel.join("/"));
            }
        }
    }
    Ok(())
}

/// Size, file count and newest mtime of a directory tree, skipping metadata.
pub(crate) fn dir_stats(path: &Path) -> (u64, u32, Option<SystemTime>) {
    let mut size = 0u64;
    let mut count = 0u32;
    let mut newest: Option<SystemTime> = None;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if entry.file_name() != METADATA_FILENAME {
                size += meta.len();
                count += 1;
                if let Ok(modified) = meta.modified() {
                    newest = Some(newest.map_or(modified, |n| n.max(modified)));
                }
            }
        }
    }
    (size, count, newest)
}

pub(crate) fn weight_info(path: &Path, name: &str) -> Result<WeightInfo> {
    if !path.is_dir() {
        return Err(ControlError::WeightsNotFound(name.to_string()));
    }
    let (size_bytes, file_count, modified) = dir_stats(path);
    let meta = read_metadata(path);
    Ok(WeightInfo {
        path: path.to_string_lossy().to_string(),
        name: name.to_string(),
        size_bytes,
        file_count,
        modified_time: modified.map(DateTime::<Utc>::from),
        hf_model_id: meta.as_ref().map(|m| m.model_id.clone()),
        revision: meta.as_ref().and_then(|m| m.revision.clone()),
        installed_at: meta.map(|m| m.installed_at),
    })
}

pub(crate) fn write_metadata(dir: &Path, meta: &WeightMetadata) -> Result<()> {
    std::fs::write(dir.join(METADATA_FILENAME), serde_json::to_vec(meta)?)?;
    Ok(())
}

fn read_metadata(dir: &Path) -> Option<WeightMetadata> {
    let data = std::fs::read(dir.join(METADATA_FILENAME)).ok()?;
    serde_json::from_slice(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_target_sanitizes_segments() {
        assert_eq!(canonical_target("Qwen/Qwen2.5-7B", None).unwrap(), "Qwen/Qwen2.5-7B");
        assert_eq!(
            canonical_target("org/name", Some(" ../weird name!!/./x ")).unwrap(),
            "weird-name/x"
        );
        assert_eq!(canonical_target("org\\name", Some("")).unwrap(), "org/name");
        assert!(canonical_target("..", Some("/")).is_err());
    }

    #[test]
    fn test_reserved_paths() {
        assert!(is_reserved(".hf-cache"));
        assert!(is_reserved("org/modules"));
        assert!(is_reserved("org/.git"));
        assert!(is_reserved(""));
        assert!(!is_reserved("org/model"));
    }

    #[test]
    fn test_list_prefers_metadata_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let model = tmp.path().join("org/model");
        std::fs::create_dir_all(&model).unwrap();
        std::fs::write(model.join("weights.bin"), vec![0u8; 64]).unwrap();
        write_metadata(
            &model,
            &WeightMetadata {
                model_id: "org/model".into(),
                revision: Some("main".into()),
                installed_at: Utc::now(),
            },
        )
        .unwrap();
        std::fs::create_dir_all(tmp.path().join("lost+found")).unwrap();

        let inv = WeightInventory::new(tmp.path());
        let listed = inv.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "org/model");
        assert_eq!(listed[0].size_bytes, 64);
        assert_eq!(listed[0].file_count, 1);
        assert_eq!(listed[0].hf_model_id.as_deref(), Some("org/model"));
    }

    #[test]
    fn test_list_falls_back_to_top_level_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("small")).unwrap();
        std::fs::create_dir_all(tmp.path().join("big")).unwrap();
        std::fs::write(tmp.path().join("big/a"), vec![0u8; 10]).unwrap();
        std::fs::create_dir_all(tmp.path().join("modules")).unwrap();

        let names: Vec<_> = WeightInventory::new(tmp.path())
            .list()
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["big", "small"]);
    }

    #[test]
    fn test_delete_prunes_empty_parents() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("org/model")).unwrap();
        std::fs::write(tmp.path().join("org/model/f"), b"x").unwrap();

        let inv = WeightInventory::new(tmp.path());
        inv.delete("org/model").unwrap();
        assert!(!tmp.path().join("org").exists());
        assert!(tmp.path().exists());
        assert!(matches!(inv.get("org/model"), Err(ControlError::WeightsNotFound(_))));
        assert!(matches!(inv.delete("modules"), Err(ControlError::WeightsNotFound(_))));
    }
}
