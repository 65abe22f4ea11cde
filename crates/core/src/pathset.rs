use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{GlobBuilder, GlobMatcher};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::collection::{has_glob_meta, pattern_root, Collection};
use crate::error::{SyncError, SyncResult};
use crate::paths::{path_to_uri, TRASH_DIR_NAME};

pub const CACHE_FILE_NAME: &str = "locations.trie";
const CACHE_HEADER: &str = "catalog-sync-pathset";
const CACHE_FORMAT_VERSION: u32 = 1;

pub fn cache_max_age() -> Duration {
    Duration::hours(12)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    uris: BTreeSet<String>,
}

impl PathSet {
    pub fn contains(&self, uri: &str) -> bool {
        self.uris.contains(uri)
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.uris.iter().map(String::as_str)
    }

    pub fn iter_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.uris
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |uri| uri.starts_with(prefix))
            .map(String::as_str)
    }

    pub fn write_to(&self, writer: impl Write) -> SyncResult<()> {
        let mut encoder = GzEncoder::new(BufWriter::new(writer), Compression::default());
        writeln!(
            encoder,
            "{CACHE_HEADER} {CACHE_FORMAT_VERSION} {}",
            self.uris.len()
        )?;
        let mut previous = "";
        for uri in &self.uris {
            let shared = shared_prefix_len(previous, uri);
            writeln!(encoder, "{shared}\t{}", &uri[shared..])?;
            previous = uri;
        }
        encoder.finish()?.flush()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> SyncResult<Self> {
        let corrupt = |message: String| SyncError::Cache {
            path: path.to_path_buf(),
            message,
        };

        let reader = BufReader::new(GzDecoder::new(File::open(path)?));
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| corrupt("empty cache blob".to_string()))?
            .map_err(|err| corrupt(err.to_string()))?;
        let expected = parse_header(&header).ok_or_else(|| corrupt(format!("bad header {header:?}")))?;

        let mut uris = BTreeSet::new();
        let mut previous = String::new();
        for line in lines {
            let line = line.map_err(|err| corrupt(err.to_string()))?;
            let (shared, suffix) = line
                .split_once('\t')
                .ok_or_else(|| corrupt(format!("bad entry {line:?}")))?;
            let shared = shared
                .parse::<usize>()
                .map_err(|_| corrupt(format!("bad prefix length in {line:?}")))?;
            let prefix = previous
                .get(..shared)
                .ok_or_else(|| corrupt(format!("prefix length {shared} out of range")))?;
            let uri = format!("{prefix}{suffix}");
            uris.insert(uri.clone());
            previous = uri;
        }

        if uris.len() != expected {
            return Err(corrupt(format!(
                "expected {expected} entries, found {}",
                uris.len()
            )));
        }
        Ok(Self { uris })
    }
}

impl FromIterator<String> for PathSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            uris: iter.into_iter().collect(),
        }
    }
}

fn parse_header(header: &str) -> Option<usize> {
    let mut parts = header.split_whitespace();
    if parts.next()? != CACHE_HEADER {
        return None;
    }
    if parts.next()?.parse::<u32>().ok()? != CACHE_FORMAT_VERSION {
        return None;
    }
    parts.next()?.parse::<usize>().ok()
}

fn shared_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .take_while(|((_, left), right)| left == right)
        .last()
        .map(|((index, ch), _)| index + ch.len_utf8())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSetBuild {
    pub path_set: PathSet,
    pub cache_path: PathBuf,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct PathSetBuilder {
    cache_dir: PathBuf,
    now: Option<DateTime<Utc>>,
    force_rebuild: bool,
}

impl PathSetBuilder {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            now: None,
            force_rebuild: false,
        }
    }

    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }

    pub fn cache_path(&self, collection: &Collection) -> PathBuf {
        self.cache_dir
            .join(collection.cache_key())
            .join(CACHE_FILE_NAME)
    }

    pub fn cache_age(&self, collection: &Collection) -> Option<Duration> {
        let modified = fs::metadata(self.cache_path(collection))
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from)?;
        Some(self.now() - modified)
    }

    pub fn build(&self, collection: &Collection, catalog: &dyn Catalog) -> SyncResult<PathSetBuild> {
        let cache_path = self.cache_path(collection);

        if !self.force_rebuild {
            if let Some(age) = self.cache_age(collection) {
                if age < cache_max_age() {
                    match PathSet::read_from(&cache_path) {
                        Ok(path_set) => {
                            info!(
                                "loaded {} cached locations for {} ({} old)",
                                path_set.len(),
                                collection.name,
                                format_age(age)
                            );
                            return Ok(PathSetBuild {
                                path_set,
                                cache_path,
                                from_cache: true,
                            });
                        }
                        Err(err) => warn!("ignoring unreadable path-set cache: {err}"),
                    }
                } else {
                    debug!(
                        "path-set cache for {} is stale ({}); rebuilding",
                        collection.name,
                        format_age(age)
                    );
                }
            }
        }

        let mut uris = catalog.iter_all_uris(&collection.query)?.collect::<BTreeSet<_>>();
        let indexed = uris.len();
        for pattern in &collection.file_patterns {
            expand_pattern(pattern, &mut uris)?;
        }
        uris.retain(|uri| {
            let keep = !uri.contains('\n');
            if !keep {
                warn!("dropping location with embedded newline: {uri:?}");
            }
            keep
        });
        info!(
            "built path set for {}: {} catalog locations, {} total",
            collection.name,
            indexed,
            uris.len()
        );

        let path_set = PathSet { uris };
        write_atomically(&path_set, &cache_path)?;
        Ok(PathSetBuild {
            path_set,
            cache_path,
            from_cache: false,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }
}

fn write_atomically(path_set: &PathSet, cache_path: &Path) -> SyncResult<()> {
    let dir = cache_path
        .parent()
        .ok_or_else(|| SyncError::Cache {
            path: cache_path.to_path_buf(),
            message: "cache path has no parent directory".to_string(),
        })?;
    fs::create_dir_all(dir)?;
    let temp = NamedTempFile::new_in(dir)?;
    path_set.write_to(temp.as_file())?;
    temp.as_file().sync_all()?;
    temp.persist(cache_path).map_err(|err| SyncError::Io(err.error))?;
    Ok(())
}

fn expand_pattern(pattern: &str, uris: &mut BTreeSet<String>) -> SyncResult<()> {
    let root = pattern_root(pattern);
    if !has_glob_meta(pattern) {
        if fs::symlink_metadata(&root).is_ok() {
            uris.insert(path_to_uri(&root));
        }
        return Ok(());
    }
    if !root.is_dir() {
        warn!("glob root {} does not exist; skipping {}", root.display(), pattern);
        return Ok(());
    }

    let matcher = compile_pattern(pattern)?;
    let mut walker = WalkDir::new(&root).follow_links(false).min_depth(1);
    if let Some(depth) = pattern_depth(pattern, &root) {
        walker = walker.max_depth(depth);
    }

    let mut matched = 0_u64;
    let iter = walker
        .into_iter()
        .filter_entry(|entry| entry.file_name() != TRASH_DIR_NAME);
    for item in iter {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                debug!("walk error under {}: {}", root.display(), err);
                continue;
            }
        };
        if matcher.is_match(entry.path()) {
            uris.insert(path_to_uri(entry.path()));
            matched += 1;
        }
    }
    debug!("{pattern} matched {matched} paths");
    Ok(())
}

fn compile_pattern(pattern: &str) -> SyncResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| SyncError::Configuration(format!("invalid glob {pattern:?}: {err}")))
}

/// Walk depth needed below `root`, or `None` when `**` makes it unbounded.
fn pattern_depth(pattern: &str, root: &Path) -> Option<usize> {
    if pattern.contains("**") {
        return None;
    }
    let total = Path::new(pattern).components().count();
    Some(total.saturating_sub(root.components().count()))
}

fn format_age(age: Duration) -> String {
    format!("{}m", age.num_minutes())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    use super::{pattern_depth, shared_prefix_len, PathSet, PathSetBuilder};
    use crate::catalog::{CatalogDataset, MemoryCatalog};
    use crate::collection::{CatalogQuery, Collection};
    use crate::identity::DatasetId;
    use crate::paths::path_to_uri;

    fn collection(root: &Path) -> Collection {
        Collection::new(
            "ls8_nbar",
            CatalogQuery::new().with("product", "ls8_nbar"),
            vec![format!("{}/scenes/*/*.nc", root.display())],
        )
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"data").expect("write");
    }

    #[test]
    fn prefix_iteration_and_membership() {
        let set = [
            "file:///a/1.nc",
            "file:///a/2.nc",
            "file:///ab/3.nc",
            "file:///b/4.nc",
        ]
        .into_iter()
        .map(String::from)
        .collect::<PathSet>();

        assert!(set.contains("file:///a/2.nc"));
        assert!(!set.contains("file:///a"));
        assert_eq!(
            set.iter_prefix("file:///a/").collect::<Vec<_>>(),
            vec!["file:///a/1.nc", "file:///a/2.nc"]
        );
        assert_eq!(set.iter_prefix("file:///a").count(), 3);
    }

    #[test]
    fn shared_prefix_respects_char_boundaries() {
        assert_eq!(shared_prefix_len("file:///é1", "file:///é2"), "file:///é".len());
        assert_eq!(shared_prefix_len("file:///é", "file:///è"), "file:///".len());
        assert_eq!(shared_prefix_len("", "abc"), 0);
    }

    #[test]
    fn blob_round_trip_preserves_entries() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("locations.trie");
        let set = ["file:///g/x/1.nc", "file:///g/x/10.nc", "file:///g/y/é.nc"]
            .into_iter()
            .map(String::from)
            .collect::<PathSet>();
        set.write_to(fs::File::create(&path).expect("create")).expect("write");
        assert_eq!(PathSet::read_from(&path).expect("read"), set);

        fs::write(&path, b"not gzip").expect("corrupt");
        assert!(PathSet::read_from(&path).is_err());
    }

    #[test]
    fn depth_is_bounded_without_double_star() {
        let root = Path::new("/g/data/scenes");
        assert_eq!(pattern_depth("/g/data/scenes/*/*.nc", root), Some(2));
        assert_eq!(pattern_depth("/g/data/scenes/**/*.nc", root), None);
    }

    #[test]
    fn builds_union_of_catalog_and_disk() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path();
        let on_disk = root.join("scenes/2019/a.nc");
        touch(&on_disk);
        touch(&root.join("scenes/2019/a.txt"));
        touch(&root.join("scenes/2019/deeper/b.nc"));

        let catalog = MemoryCatalog::with_datasets([
            CatalogDataset::new(DatasetId::random())
                .with_field("product", "ls8_nbar")
                .with_location("file:///elsewhere/gone.nc"),
            CatalogDataset::new(DatasetId::random())
                .with_field("product", "ls7_nbar")
                .with_location("file:///elsewhere/other-product.nc"),
        ]);

        let builder = PathSetBuilder::new(root.join("cache"));
        let build = builder.build(&collection(root), &catalog).expect("build");
        assert!(!build.from_cache);
        assert!(build.cache_path.ends_with("locations.trie"));
        assert!(build.path_set.contains(&path_to_uri(&on_disk)));
        assert!(build.path_set.contains("file:///elsewhere/gone.nc"));
        assert!(!build.path_set.contains("file:///elsewhere/other-product.nc"));
        assert_eq!(build.path_set.len(), 2);
    }

    #[test]
    fn fresh_cache_is_loaded_verbatim_and_stale_cache_rebuilt() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path();
        touch(&root.join("scenes/2019/a.nc"));
        let catalog = MemoryCatalog::new();
        let collection = collection(root);

        let builder = PathSetBuilder::new(root.join("cache"));
        let first = builder.build(&collection, &catalog).expect("first build");
        assert_eq!(first.path_set.len(), 1);

        touch(&root.join("scenes/2019/b.nc"));
        let cached = builder.build(&collection, &catalog).expect("cached build");
        assert!(cached.from_cache);
        assert_eq!(cached.path_set, first.path_set);

        let later = PathSetBuilder::new(root.join("cache"))
            .with_clock(Utc::now() + Duration::hours(13));
        let rebuilt = later.build(&collection, &catalog).expect("rebuild");
        assert!(!rebuilt.from_cache);
        assert_eq!(rebuilt.path_set.len(), 2);

        let reread = PathSet::read_from(&rebuilt.cache_path).expect("overwritten cache");
        assert_eq!(reread, rebuilt.path_set);
    }

    #[test]
    fn corrupt_fresh_cache_is_rebuilt() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path();
        touch(&root.join("scenes/2019/a.nc"));
        let catalog = MemoryCatalog::new();
        let collection = collection(root);
        let builder = PathSetBuilder::new(root.join("cache"));

        let cache_path = builder.cache_path(&collection);
        fs::create_dir_all(cache_path.parent().expect("parent")).expect("mkdir");
        fs::write(&cache_path, b"\x1f\x8bgarbage").expect("corrupt cache");
        assert!(builder.cache_age(&collection).expect("fresh") < Duration::hours(1));

        let build = builder.build(&collection, &catalog).expect("rebuild");
        assert!(!build.from_cache);
        assert_eq!(build.path_set.len(), 1);
        assert_eq!(
            PathSet::read_from(&cache_path).expect("rewritten cache"),
            build.path_set
        );
    }
}
