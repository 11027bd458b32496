//! Candidate file discovery.
//!
//! Walks a project root and yields the files eligible for indexing: the
//! extension must be whitelisted, no exclusion glob may match the
//! forward-slash-normalized relative path, and the file must be readable,
//! under the size ceiling, and not binary. Symbolic links are not followed.
//!
//! Callers must not rely on emission order.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use thiserror::Error;
use tracing::{debug, warn};

/// Exclusions applied on every walk, in addition to caller patterns.
/// `.context` is the engine's own metadata directory and must never be
/// indexed back into the collection.
const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
    "**/dist/**",
    "**/__pycache__/**",
    "**/.context/**",
];

/// How many leading bytes are sniffed for NUL to classify a file as binary.
const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Error, Debug)]
pub enum WalkerError {
    #[error("project root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("invalid exclusion pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        source: globset::Error,
    },
}

/// One discovered file: absolute path plus its normalized relative path.
#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub absolute: PathBuf,
    /// Repository-relative, forward-slash separated.
    pub relative: String,
}

/// Counters for what the walk saw and skipped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalkStats {
    pub scanned: usize,
    pub matched: usize,
    pub oversize: usize,
    pub unreadable: usize,
    pub binary: usize,
    /// Relative paths that matched but could not be read. The controller
    /// keeps these out of both the changed and the deleted set.
    pub unreadable_paths: Vec<String>,
}

#[derive(Debug)]
pub struct FileWalker {
    root: PathBuf,
    extensions: Vec<String>,
    excludes: GlobSet,
    max_file_bytes: u64,
}

impl FileWalker {
    /// Build a walker for `root`. `extensions` are matched without the
    /// leading dot, case-insensitively. `exclude_globs` are evaluated
    /// against root-relative forward-slash paths.
    pub fn new(
        root: &Path,
        extensions: &[String],
        exclude_globs: &[String],
        max_file_bytes: u64,
    ) -> Result<Self, WalkerError> {
        if !root.exists() {
            return Err(WalkerError::MissingRoot(root.to_path_buf()));
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES
            .iter()
            .map(|s| s.to_string())
            .chain(exclude_globs.iter().cloned())
        {
            let glob = Glob::new(&pattern).map_err(|source| WalkerError::BadPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|source| WalkerError::BadPattern {
                pattern: "<combined>".to_string(),
                source,
            })?;

        Ok(Self {
            root: root.to_path_buf(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            excludes,
            max_file_bytes,
        })
    }

    /// Enumerate eligible files. Unreadable files are skipped with a
    /// warning; oversize and binary files are skipped and counted.
    pub fn walk(&self) -> (Vec<WalkedFile>, WalkStats) {
        let mut files = Vec::new();
        let mut stats = WalkStats::default();

        let walker = WalkBuilder::new(&self.root)
            .follow_links(false)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!("walk error: {err}");
                    stats.unreadable += 1;
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            stats.scanned += 1;

            let path = entry.path();
            if !self.extension_matches(path) {
                continue;
            }

            let relative = match path.strip_prefix(&self.root) {
                Ok(rel) => normalize_relative(rel),
                Err(_) => continue,
            };
            if self.excludes.is_match(&relative) {
                continue;
            }

            match fs::metadata(path) {
                Ok(meta) if meta.len() > self.max_file_bytes => {
                    debug!(path = %relative, bytes = meta.len(), "skipping oversize file");
                    stats.oversize += 1;
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %relative, "skipping unreadable file: {err}");
                    stats.unreadable += 1;
                    stats.unreadable_paths.push(relative);
                    continue;
                }
            }

            match is_binary(path) {
                Ok(true) => {
                    debug!(path = %relative, "skipping binary file");
                    stats.binary += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(path = %relative, "skipping unreadable file: {err}");
                    stats.unreadable += 1;
                    stats.unreadable_paths.push(relative);
                    continue;
                }
            }

            stats.matched += 1;
            files.push(WalkedFile {
                absolute: path.to_path_buf(),
                relative,
            });
        }

        (files, stats)
    }

    fn extension_matches(&self, path: &Path) -> bool {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(e) => e.to_ascii_lowercase(),
            None => return false,
        };
        self.extensions.iter().any(|allowed| *allowed == ext)
    }
}

fn normalize_relative(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        raw.into_owned()
    } else {
        raw.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

fn is_binary(path: &Path) -> std::io::Result<bool> {
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; BINARY_SNIFF_BYTES];
    let n = file.read(&mut buf)?;
    Ok(buf[..n].contains(&0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn walk_sorted(walker: &FileWalker) -> Vec<String> {
        let (files, _) = walker.walk();
        let mut rels: Vec<String> = files.into_iter().map(|f| f.relative).collect();
        rels.sort();
        rels
    }

    #[test]
    fn filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.ts", b"let a = 1;\n");
        write(dir.path(), "src/b.ts", b"let b = 2;\n");
        write(dir.path(), "README.md", b"# readme\n");

        let walker = FileWalker::new(dir.path(), &["ts".to_string()], &[], 1 << 20).unwrap();
        assert_eq!(walk_sorted(&walker), vec!["src/a.ts", "src/b.ts"]);
    }

    #[test]
    fn applies_exclusion_globs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/keep.rs", b"fn keep() {}\n");
        write(dir.path(), "vendor/skip.rs", b"fn skip() {}\n");

        let walker = FileWalker::new(
            dir.path(),
            &["rs".to_string()],
            &["vendor/**".to_string()],
            1 << 20,
        )
        .unwrap();
        assert_eq!(walk_sorted(&walker), vec!["src/keep.rs"]);
    }

    #[test]
    fn default_excludes_apply() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/lib.rs", b"fn lib() {}\n");
        write(dir.path(), "node_modules/pkg/index.js", b"x\n");
        write(dir.path(), ".context/file-hashes.json", b"{}\n");

        let walker =
            FileWalker::new(dir.path(), &["rs".into(), "js".into(), "json".into()], &[], 1 << 20)
                .unwrap();
        assert_eq!(walk_sorted(&walker), vec!["src/lib.rs"]);
    }

    #[test]
    fn skips_oversize_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "small.rs", b"fn s() {}\n");
        write(dir.path(), "big.rs", &vec![b'a'; 2048]);

        let walker = FileWalker::new(dir.path(), &["rs".to_string()], &[], 1024).unwrap();
        let (files, stats) = walker.walk();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative, "small.rs");
        assert_eq!(stats.oversize, 1);
    }

    #[test]
    fn skips_binary_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "text.rs", b"fn t() {}\n");
        write(dir.path(), "blob.rs", b"fn b() {}\x00\xff\xfe");

        let walker = FileWalker::new(dir.path(), &["rs".to_string()], &[], 1 << 20).unwrap();
        let (files, stats) = walker.walk();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative, "text.rs");
        assert_eq!(stats.binary, 1);
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Shouty.RS", b"fn s() {}\n");

        let walker = FileWalker::new(dir.path(), &[".rs".to_string()], &[], 1 << 20).unwrap();
        assert_eq!(walk_sorted(&walker), vec!["Shouty.RS"]);
    }

    #[test]
    fn missing_root_errors() {
        let err = FileWalker::new(Path::new("/definitely/not/here"), &[], &[], 0).unwrap_err();
        assert!(matches!(err, WalkerError::MissingRoot(_)));
    }

    #[test]
    fn bad_pattern_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileWalker::new(
            dir.path(),
            &["rs".to_string()],
            &["a{bad".to_string()],
            1 << 20,
        )
        .unwrap_err();
        assert!(matches!(err, WalkerError::BadPattern { .. }));
    }
}
