// Line numbers from pprof are i64 and source maps use u32
#![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
use pprof::protos::{Function, Profile};
use walkdir::{DirEntry, WalkDir};

use super::names::extract_function_name;
use super::parser::{Position, SearchBias, SourceMap};
use crate::sampling::intern;

/// Directory names that hold third-party trees and are not walked unless a
/// package inside them is named explicitly.
const VENDORED_DIRS: &[&str] = &["node_modules", "target", "vendor", ".git"];

const MAP_EXTENSION: &str = "map";

/// A location in a file. `line` is 1-based, `column` 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub name: Option<String>,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self { file: file.into(), line, column, name: None }
    }
}

/// How far [`SourcemapIndex::resolve`] searches along a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Only the segment at or before the column.
    Strict,
    /// Strict first, then the nearest segment at or after the column.
    LeastUpperBound,
}

/// One indexed map and the directory its relative paths are resolved from.
#[derive(Debug, Clone)]
pub struct SourcemapEntry {
    pub map: SourceMap,
    pub directory: PathBuf,
}

impl SourcemapEntry {
    /// Path of an original source, resolved against the map's directory.
    fn source_path(&self, source_index: usize) -> String {
        let source = &self.map.sources()[source_index];
        if source.contains("://") || Path::new(source).is_absolute() {
            return source.clone();
        }
        normalize(&self.directory.join(source)).to_string_lossy().into_owned()
    }
}

/// Generated file → source map index.
///
/// Built once before capture starts and read-only afterwards; share it
/// through an `Arc`.
#[derive(Debug, Default)]
pub struct SourcemapIndex {
    entries: HashMap<PathBuf, SourcemapEntry>,
}

#[derive(Debug, Default)]
struct Scan {
    entries: HashMap<PathBuf, SourcemapEntry>,
    failed: usize,
    orphaned: usize,
}

impl Scan {
    fn merge(&mut self, other: Scan) {
        for (path, entry) in other.entries {
            self.entries.entry(path).or_insert(entry);
        }
        self.failed += other.failed;
        self.orphaned += other.orphaned;
    }
}

impl SourcemapIndex {
    /// Scan directories and packages for `.map` files and index them.
    ///
    /// Directory and package scans run on separate threads; package entries
    /// are merged into the directory entries afterwards, directory entries
    /// winning on conflicts. Never fails: unreadable directories are skipped
    /// and unparseable maps are counted and reported once.
    #[must_use]
    pub fn build(dirs: &[PathBuf], packages: &[String]) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let cargo_home = cargo_home();
        let mut scan = std::thread::scope(|s| {
            let package_scan = s.spawn(|| scan_packages(packages, &cwd, cargo_home.as_deref()));
            let mut dir_scan = Scan::default();
            for dir in dirs {
                dir_scan.merge(scan_directory(dir, false));
            }
            match package_scan.join() {
                Ok(package_scan) => dir_scan.merge(package_scan),
                Err(_) => warn!("Package source map scan panicked; continuing without it"),
            }
            dir_scan
        });

        if scan.failed > 0 {
            warn!("{} source map(s) could not be loaded and were skipped", scan.failed);
        }
        if scan.orphaned > 0 {
            debug!("{} source map(s) had no generated file next to them", scan.orphaned);
        }
        info!("Indexed {} source map(s)", scan.entries.len());

        Self { entries: std::mem::take(&mut scan.entries) }
    }

    /// Index a single map file. Returns `false` when the map is orphaned or
    /// cannot be parsed.
    pub fn insert_map(&mut self, map_path: &Path) -> bool {
        match load_map(map_path) {
            MapLoad::Loaded(generated, entry) => {
                self.entries.insert(generated, entry);
                true
            }
            MapLoad::Orphaned | MapLoad::Failed => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `generated` (absolute path) has a map.
    #[must_use]
    pub fn contains(&self, generated: &Path) -> bool {
        self.entry_for(&generated.to_string_lossy()).is_some()
    }

    /// Translate a generated location to its original location.
    ///
    /// Returns `location` unchanged when nothing maps it.
    #[must_use]
    pub fn resolve(&self, location: &Location, bias: Bias) -> Location {
        self.resolve_cached(location, bias, &mut LineCache::default())
    }

    fn resolve_cached(&self, location: &Location, bias: Bias, cache: &mut LineCache) -> Location {
        let Some(entry) = self.cached_entry_for(&location.file, cache) else {
            return location.clone();
        };
        let Some(line) = location.line.checked_sub(1) else {
            return location.clone();
        };

        let generated = Position::new(line, location.column);
        let hit = entry
            .map
            .original_position_for(generated, SearchBias::GreatestLowerBound)
            .or_else(|| match bias {
                // Loader padding at the start of a line has no segment of its own
                Bias::LeastUpperBound => {
                    entry.map.original_position_for(generated, SearchBias::LeastUpperBound)
                }
                Bias::Strict => None,
            });
        let Some(hit) = hit else {
            return location.clone();
        };

        let file = entry.source_path(hit.source_index);
        let name = hit
            .name
            .or_else(|| {
                cache
                    .line(entry, hit.source_index, &file, hit.position.line)
                    .and_then(extract_function_name)
            })
            .or_else(|| location.name.clone());

        Location { file, line: hit.position.line + 1, column: hit.position.column, name }
    }

    fn entry_for(&self, file: &str) -> Option<&SourcemapEntry> {
        let path = Path::new(file);
        self.entries.get(path).or_else(|| {
            let canonical = fs::canonicalize(path).ok()?;
            self.entries.get(&canonical)
        })
    }

    /// Like `entry_for`, but remembers files with no map so the fallback
    /// `canonicalize` runs once per file.
    fn cached_entry_for(&self, file: &str, cache: &mut LineCache) -> Option<&SourcemapEntry> {
        if cache.unmapped.contains(file) {
            return None;
        }
        let entry = self.entry_for(file);
        if entry.is_none() {
            cache.unmapped.insert(file.to_string());
        }
        entry
    }

    /// Rewrite every frame of `profile` that points into an indexed
    /// generated file. Returns the number of lines rewritten.
    pub fn rewrite_profile(&self, profile: &mut Profile) -> usize {
        if self.is_empty() {
            return 0;
        }

        let mut string_ids: HashMap<String, i64> = profile
            .string_table
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i64))
            .collect();
        let functions: HashMap<u64, (i64, i64)> =
            profile.function.iter().map(|f| (f.id, (f.name, f.filename))).collect();
        let mut function_ids: HashMap<(i64, i64), u64> =
            profile.function.iter().map(|f| ((f.name, f.filename), f.id)).collect();
        let mut next_function_id = profile.function.iter().map(|f| f.id).max().unwrap_or(0) + 1;
        let mut new_functions = Vec::new();
        let mut cache = LineCache::default();
        let mut rewritten = 0;

        for location in &mut profile.location {
            for line in &mut location.line {
                let Some(&(name_id, file_id)) = functions.get(&line.function_id) else {
                    continue;
                };
                let Some(file) = string_at(&profile.string_table, file_id) else {
                    continue;
                };
                let Ok(line_no) = u32::try_from(line.line) else {
                    continue;
                };

                let mut generated = Location::new(file, line_no, 0);
                generated.name = string_at(&profile.string_table, name_id).map(ToString::to_string);

                let resolved = self.resolve_cached(&generated, Bias::LeastUpperBound, &mut cache);
                if resolved == generated {
                    continue;
                }

                let name = resolved.name.unwrap_or_default();
                let name_id = intern(&mut profile.string_table, &mut string_ids, &name);
                let file_id = intern(&mut profile.string_table, &mut string_ids, &resolved.file);
                let function_id = *function_ids.entry((name_id, file_id)).or_insert_with(|| {
                    let id = next_function_id;
                    next_function_id += 1;
                    new_functions.push(Function {
                        id,
                        name: name_id,
                        system_name: name_id,
                        filename: file_id,
                        ..Default::default()
                    });
                    id
                });

                line.function_id = function_id;
                line.line = i64::from(resolved.line);
                rewritten += 1;
            }
        }

        profile.function.extend(new_functions);
        rewritten
    }
}

fn string_at(table: &[String], id: i64) -> Option<&str> {
    usize::try_from(id).ok().and_then(|i| table.get(i)).map(String::as_str)
}

/// Original source text split into lines, loaded on first use, plus the
/// generated files already known to have no map.
#[derive(Default)]
struct LineCache {
    files: HashMap<String, Option<Vec<String>>>,
    unmapped: HashSet<String>,
}

impl LineCache {
    fn line(&mut self, entry: &SourcemapEntry, source_index: usize, path: &str, line: u32) -> Option<&str> {
        let lines = self.files.entry(path.to_string()).or_insert_with(|| {
            let text = match entry.map.source_content(source_index) {
                Some(content) => Some(content.to_string()),
                None => fs::read_to_string(path).ok(),
            };
            text.map(|t| t.lines().map(ToString::to_string).collect())
        });
        lines.as_ref()?.get(line as usize).map(String::as_str)
    }
}

// ============================================================================
// Discovery
// ============================================================================

enum MapLoad {
    Loaded(PathBuf, SourcemapEntry),
    Orphaned,
    Failed,
}

fn is_vendored(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.file_name().to_str().is_some_and(|name| VENDORED_DIRS.contains(&name))
}

fn scan_directory(root: &Path, is_package: bool) -> Scan {
    let mut scan = Scan::default();

    // Unreadable directories come back as Err and are dropped
    let walker = WalkDir::new(root)
        .follow_links(is_package)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_vendored(e))
        .filter_map(Result::ok);

    for entry in walker {
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(MAP_EXTENSION)
        {
            continue;
        }
        match load_map(path) {
            MapLoad::Loaded(generated, map_entry) => {
                scan.entries.insert(generated, map_entry);
            }
            MapLoad::Orphaned => scan.orphaned += 1,
            MapLoad::Failed => scan.failed += 1,
        }
    }

    scan
}

fn load_map(map_path: &Path) -> MapLoad {
    let map = match fs::read_to_string(map_path)
        .map_err(crate::domain::SourcemapError::from)
        .and_then(|json| SourceMap::parse(&json))
    {
        Ok(map) => map,
        Err(e) => {
            debug!("Skipping {}: {e}", map_path.display());
            return MapLoad::Failed;
        }
    };

    let directory = map_path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    // (a) declared generated file, (b) the map path without `.map`
    let mut candidates = Vec::with_capacity(2);
    if let Some(file) = map.file() {
        candidates.push(directory.join(file));
    }
    candidates.push(map_path.with_extension(""));

    let Some(generated) = candidates.into_iter().find(|c| c.is_file()) else {
        return MapLoad::Orphaned;
    };
    let generated = fs::canonicalize(&generated).unwrap_or(generated);

    MapLoad::Loaded(generated, SourcemapEntry { map, directory })
}

fn scan_packages(packages: &[String], cwd: &Path, cargo_home: Option<&Path>) -> Scan {
    let mut scan = Scan::default();

    for package in packages {
        let roots = package_roots(package, cwd, cargo_home);
        if roots.is_empty() {
            warn!("Package {package} not found; no source maps loaded from it");
            continue;
        }
        for root in roots {
            scan.merge(scan_directory(&root, true));
        }
    }

    scan
}

fn cargo_home() -> Option<PathBuf> {
    std::env::var_os("CARGO_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cargo")))
}

/// Directories a package name can live in.
fn package_roots(name: &str, cwd: &Path, cargo_home: Option<&Path>) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = ["vendor", "node_modules"]
        .iter()
        .map(|tree| cwd.join(tree).join(name))
        .filter(|p| p.is_dir())
        .collect();

    if let Some(registry) = cargo_home.map(|home| home.join("registry").join("src")) {
        let prefix = format!("{name}-");
        let Ok(indexes) = fs::read_dir(&registry) else {
            return roots;
        };
        for index in indexes.flatten() {
            let Ok(crates) = fs::read_dir(index.path()) else {
                continue;
            };
            for krate in crates.flatten() {
                let file_name = krate.file_name();
                let file_name = file_name.to_string_lossy();
                let is_version = file_name
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.chars().next())
                    .is_some_and(|c| c.is_ascii_digit());
                if is_version && krate.path().is_dir() {
                    roots.push(krate.path());
                }
            }
        }
    }

    roots
}

/// Lexically remove `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pprof::protos::{Line, Location as PbLocation};

    const GENERATED: &str = "var a = 1;\n__loader();function run(){}\n";

    /// Map for `bundle.js`: line 2 has a single segment at column 10 that maps
    /// to `src/app.ts` line 3, column 0, without a name.
    fn write_bundle(dir: &Path) -> PathBuf {
        let js = dir.join("bundle.js");
        fs::write(&js, GENERATED).unwrap();
        let map = r#"{
            "version": 3,
            "file": "bundle.js",
            "sources": ["src/app.ts"],
            "sourcesContent": ["// app\n\nfunction run() {\n}\n"],
            "names": [],
            "mappings": ";UAEA"
        }"#;
        fs::write(dir.join("bundle.js.map"), map).unwrap();
        fs::canonicalize(js).unwrap()
    }

    #[test]
    fn test_build_indexes_maps() {
        let dir = tempfile::tempdir().unwrap();
        let js = write_bundle(dir.path());
        let index = SourcemapIndex::build(&[dir.path().to_path_buf()], &[]);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&js));
    }

    #[test]
    fn test_orphaned_map_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("gone.js.map"),
            r#"{"version":3,"file":"gone.js","sources":[],"mappings":""}"#,
        )
        .unwrap();
        let index = SourcemapIndex::build(&[dir.path().to_path_buf()], &[]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_vendored_trees_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let vendored = dir.path().join("node_modules").join("lib");
        fs::create_dir_all(&vendored).unwrap();
        write_bundle(&vendored);
        let index = SourcemapIndex::build(&[dir.path().to_path_buf()], &[]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_missing_directory_is_not_fatal() {
        let index = SourcemapIndex::build(&[PathBuf::from("/nonexistent/proftoggle")], &[]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_fallback_lookup_uses_later_column() {
        let dir = tempfile::tempdir().unwrap();
        let js = write_bundle(dir.path());
        let index = SourcemapIndex::build(&[dir.path().to_path_buf()], &[]);

        let generated = Location::new(js.to_string_lossy(), 2, 0);

        let strict = index.resolve(&generated, Bias::Strict);
        assert_eq!(strict, generated);

        let resolved = index.resolve(&generated, Bias::LeastUpperBound);
        assert!(resolved.file.ends_with("src/app.ts"));
        assert_eq!(resolved.line, 3);
        assert_eq!(resolved.column, 0);
        // recovered from sourcesContent
        assert_eq!(resolved.name.as_deref(), Some("run"));
    }

    #[test]
    fn test_unknown_file_is_unchanged() {
        let index = SourcemapIndex::default();
        let location = Location::new("/srv/app/main.js", 10, 4);
        assert_eq!(index.resolve(&location, Bias::LeastUpperBound), location);
    }

    #[test]
    fn test_rewrite_profile_points_frames_at_sources() {
        let dir = tempfile::tempdir().unwrap();
        let js = write_bundle(dir.path());
        let index = SourcemapIndex::build(&[dir.path().to_path_buf()], &[]);

        let mut profile = Profile {
            string_table: vec![String::new(), "anonymous".to_string(), js.to_string_lossy().into_owned()],
            function: vec![Function { id: 1, name: 1, system_name: 1, filename: 2, ..Default::default() }],
            location: vec![PbLocation {
                id: 1,
                line: vec![Line { function_id: 1, line: 2, ..Default::default() }],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(index.rewrite_profile(&mut profile), 1);

        let line = &profile.location[0].line[0];
        assert_eq!(line.line, 3);
        let function = profile.function.iter().find(|f| f.id == line.function_id).unwrap();
        assert_eq!(profile.string_table[function.name as usize], "run");
        assert!(profile.string_table[function.filename as usize].ends_with("src/app.ts"));
    }

    #[test]
    fn test_unmapped_files_are_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let js = write_bundle(dir.path());
        let index = SourcemapIndex::build(&[dir.path().to_path_buf()], &[]);
        let mut cache = LineCache::default();

        let unknown = Location::new("/srv/app/main.js", 10, 4);
        assert_eq!(index.resolve_cached(&unknown, Bias::LeastUpperBound, &mut cache), unknown);
        assert!(cache.unmapped.contains("/srv/app/main.js"));
        assert_eq!(index.resolve_cached(&unknown, Bias::LeastUpperBound, &mut cache), unknown);
        assert_eq!(cache.unmapped.len(), 1);

        let mapped = Location::new(js.to_string_lossy(), 2, 0);
        assert_ne!(index.resolve_cached(&mapped, Bias::LeastUpperBound, &mut cache), mapped);
        assert_eq!(cache.unmapped.len(), 1);
    }

    #[test]
    fn test_package_roots() {
        let cwd = tempfile::tempdir().unwrap();
        let cargo = tempfile::tempdir().unwrap();
        for dir in ["vendor/widgets", "node_modules/widgets", "node_modules/other"] {
            fs::create_dir_all(cwd.path().join(dir)).unwrap();
        }
        let registry = cargo.path().join("registry").join("src").join("index.crates.io-6f17d22bba15001f");
        for dir in ["widgets-1.0.0", "widgets-extra", "widgetsplus-2.0.0"] {
            fs::create_dir_all(registry.join(dir)).unwrap();
        }

        let mut roots = package_roots("widgets", cwd.path(), Some(cargo.path()));
        roots.sort();
        let mut expected = vec![
            cwd.path().join("vendor").join("widgets"),
            cwd.path().join("node_modules").join("widgets"),
            registry.join("widgets-1.0.0"),
        ];
        expected.sort();
        assert_eq!(roots, expected);

        assert!(package_roots("missing", cwd.path(), Some(cargo.path())).is_empty());
        assert_eq!(package_roots("widgets", cwd.path(), None).len(), 2);
    }

    #[test]
    fn test_named_package_in_node_modules_is_scanned() {
        let cwd = tempfile::tempdir().unwrap();
        let package = cwd.path().join("node_modules").join("widgets");
        fs::create_dir_all(&package).unwrap();
        let js = write_bundle(&package);

        let scan = scan_packages(&["widgets".to_string(), "missing".to_string()], cwd.path(), None);
        assert_eq!(scan.entries.len(), 1);
        assert!(scan.entries.contains_key(&js));
    }

    #[test]
    fn test_directory_entries_win_over_packages() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("app");
        fs::create_dir_all(&app).unwrap();
        let js = write_bundle(&app);

        // A package map that claims the same generated file
        let package = root.path().join("node_modules").join("widgets");
        fs::create_dir_all(&package).unwrap();
        fs::write(
            package.join("widget.js.map"),
            r#"{"version":3,"file":"../../app/bundle.js","sources":["lib/widget.ts"],"names":[],"mappings":";UAEA"}"#,
        )
        .unwrap();

        let package_scan = scan_packages(&["widgets".to_string()], root.path(), None);
        assert!(package_scan.entries.contains_key(&js));

        let mut scan = scan_directory(&app, false);
        scan.merge(package_scan);
        let index = SourcemapIndex { entries: scan.entries };
        assert_eq!(index.len(), 1);

        let resolved = index.resolve(&Location::new(js.to_string_lossy(), 2, 10), Bias::Strict);
        assert!(resolved.file.ends_with("src/app.ts"), "{}", resolved.file);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subdirectory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let js = write_bundle(dir.path());
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("notes.txt"), "x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let scan = scan_directory(dir.path(), false);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert!(scan.entries.contains_key(&js));
        assert_eq!(scan.failed, 0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d.ts")), PathBuf::from("/a/c/d.ts"));
    }
}
