use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};

pub const TRASH_DIR_NAME: &str = ".trash";
const FILE_URI_PREFIX: &str = "file://";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseDirs {
    roots: Vec<PathBuf>,
}

impl BaseDirs {
    pub fn new<I, P>(roots: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut out = Vec::new();
        for root in roots {
            let root = normalize(&root.into());
            if !root.is_absolute() {
                return Err(SyncError::Configuration(format!(
                    "base directory must be absolute: {}",
                    root.display()
                )));
            }
            if !out.contains(&root) {
                out.push(root);
            }
        }
        Ok(Self { roots: out })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn split_base(&self, path: &Path) -> SyncResult<(PathBuf, PathBuf)> {
        let path = normalize(path);
        let mut best: Option<&PathBuf> = None;
        for root in &self.roots {
            if !path.starts_with(root) {
                continue;
            }
            match best {
                Some(current) if current.as_os_str().len() >= root.as_os_str().len() => {}
                _ => best = Some(root),
            }
        }

        let root = best.ok_or_else(|| SyncError::PathResolution(path.clone()))?;
        let offset = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| SyncError::PathResolution(path.clone()))?;
        Ok((root.clone(), offset))
    }

    pub fn trash_path_for(&self, path: &Path, today: NaiveDate) -> SyncResult<PathBuf> {
        let (root, offset) = self.split_base(path)?;
        if offset.as_os_str().is_empty() {
            return Err(SyncError::TrashRefused(root));
        }
        Ok(root
            .join(TRASH_DIR_NAME)
            .join(today.format("%Y-%m-%d").to_string())
            .join(offset))
    }

    pub fn trash_path_for_today(&self, path: &Path) -> SyncResult<PathBuf> {
        self.trash_path_for(path, Local::now().date_naive())
    }

    pub fn trash(&self, uri: &str) -> SyncResult<bool> {
        self.trash_on(uri, Local::now().date_naive())
    }

    pub fn trash_on(&self, uri: &str, today: NaiveDate) -> SyncResult<bool> {
        let path = uri_to_path(uri)?;
        self.trash_path(&path, today)
    }

    pub fn trash_path(&self, path: &Path, today: NaiveDate) -> SyncResult<bool> {
        let destination = self.trash_path_for(path, today)?;
        if fs::symlink_metadata(path).is_err() {
            info!("nothing to trash at {}", path.display());
            return Ok(false);
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let destination = unused_destination(destination);
        fs::rename(path, &destination)?;
        info!("trashed {} -> {}", path.display(), destination.display());
        Ok(true)
    }
}

fn unused_destination(candidate: PathBuf) -> PathBuf {
    if fs::symlink_metadata(&candidate).is_err() {
        return candidate;
    }
    let file_name = candidate
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut suffix = 1_u32;
    loop {
        let next = candidate.with_file_name(format!("{file_name}.{suffix}"));
        if fs::symlink_metadata(&next).is_err() {
            warn!(
                "trash destination {} already taken; using {}",
                candidate.display(),
                next.display()
            );
            return next;
        }
        suffix += 1;
    }
}

/// Lexically removes `.` and `..` so prefix checks cannot be escaped.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn uri_to_path(uri: &str) -> SyncResult<PathBuf> {
    let raw = uri
        .strip_prefix(FILE_URI_PREFIX)
        .ok_or_else(|| SyncError::UnsupportedUri(uri.to_string()))?;
    let decoded = percent_decode(raw).ok_or_else(|| SyncError::UnsupportedUri(uri.to_string()))?;
    let path = PathBuf::from(decoded);
    if !path.is_absolute() {
        return Err(SyncError::UnsupportedUri(uri.to_string()));
    }
    Ok(path)
}

pub fn path_to_uri(path: &Path) -> String {
    let text = path.to_string_lossy();
    let mut out = String::with_capacity(FILE_URI_PREFIX.len() + text.len());
    out.push_str(FILE_URI_PREFIX);
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || b"/-_.~+=,:@".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = raw.get(index + 1..index + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(out).ok()
}
