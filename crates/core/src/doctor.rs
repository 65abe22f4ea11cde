use std::env;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::SyncConfig;
use crate::pathset::{cache_max_age, PathSetBuilder};
use crate::paths::TRASH_DIR_NAME;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub cache_dir: String,
    pub cache_writable: bool,
    pub base_dirs: Vec<BaseDirStatus>,
    pub collections: Vec<CollectionCacheStatus>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseDirStatus {
    pub path: String,
    pub exists: bool,
    pub has_trash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionCacheStatus {
    pub name: String,
    pub cache_path: String,
    pub cache_age_minutes: Option<i64>,
    pub fresh: bool,
}

pub fn collect_doctor_info(config: &SyncConfig) -> DoctorInfo {
    collect_doctor_info_at(config, Utc::now())
}

pub fn collect_doctor_info_at(config: &SyncConfig, now: DateTime<Utc>) -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());
    let mut notes = Vec::new();

    let base_dirs = config
        .base_dirs
        .iter()
        .map(|path| BaseDirStatus {
            path: path.display().to_string(),
            exists: path.is_dir(),
            has_trash: path.join(TRASH_DIR_NAME).is_dir(),
        })
        .collect::<Vec<_>>();
    if base_dirs.is_empty() {
        notes.push("No base directories configured; every location will fail to resolve.".to_string());
    }
    for status in base_dirs.iter().filter(|status| !status.exists) {
        notes.push(format!("Base directory {} does not exist.", status.path));
    }

    let cache_writable = check_writable(&config.cache_dir);
    if !cache_writable {
        notes.push(format!(
            "Cache directory {} is not writable; every run will rebuild its path set.",
            config.cache_dir.display()
        ));
    }

    let builder = PathSetBuilder::new(&config.cache_dir).with_clock(now);
    let collections = config
        .collections
        .iter()
        .map(|collection| {
            let age = builder.cache_age(collection);
            CollectionCacheStatus {
                name: collection.name.clone(),
                cache_path: builder.cache_path(collection).display().to_string(),
                cache_age_minutes: age.map(|age| age.num_minutes()),
                fresh: age.is_some_and(|age| age < cache_max_age()),
            }
        })
        .collect::<Vec<_>>();

    if let Err(err) = config.registry() {
        notes.push(format!("Collection registry rejected: {err}"));
    }
    notes.push("Fixes are only applied when a fix flag is passed; trust levels never enable them.".to_string());

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        current_dir,
        cache_dir: config.cache_dir.display().to_string(),
        cache_writable,
        base_dirs,
        collections,
        notes,
    }
}

fn check_writable(dir: &Path) -> bool {
    fs::create_dir_all(dir).is_ok() && NamedTempFile::new_in(dir).is_ok()
}
