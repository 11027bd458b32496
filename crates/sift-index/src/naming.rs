//! Deterministic collection naming.
//!
//! Maps a project identity (git remote identifier or resolved filesystem
//! path) and the hybrid flag to a stable collection name, so every machine
//! that indexes the same project converges on the same collection.

use std::path::Path;

/// Prefix for dense-only collections.
pub const DENSE_PREFIX: &str = "code_chunks";

/// Prefix for dense + sparse collections.
pub const HYBRID_PREFIX: &str = "hybrid_code_chunks";

const SLUG_MAX_LEN: usize = 32;

/// Collection name for a project identified by a git repository identifier
/// (typically `host/org/repo` from the origin remote).
pub fn for_git_identifier(identifier: &str, hybrid: bool) -> String {
    let slug = slugify(identifier);
    let hash8 = md5_hash8(identifier.as_bytes());
    format!("{}_git_{}_{}", prefix(hybrid), slug, hash8)
}

/// Collection name for a project identified only by its filesystem path.
/// The path is canonicalized first so `/proj` and `/proj/../proj` agree.
pub fn for_project_path(path: &Path, hybrid: bool) -> String {
    let resolved = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let hash8 = md5_hash8(resolved.to_string_lossy().as_bytes());
    format!("{}_{}", prefix(hybrid), hash8)
}

fn prefix(hybrid: bool) -> &'static str {
    if hybrid {
        HYBRID_PREFIX
    } else {
        DENSE_PREFIX
    }
}

fn slugify(identifier: &str) -> String {
    identifier
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(SLUG_MAX_LEN)
        .collect()
}

fn md5_hash8(bytes: &[u8]) -> String {
    let digest = md5::compute(bytes);
    format!("{:x}", digest)[..8].to_string()
}
