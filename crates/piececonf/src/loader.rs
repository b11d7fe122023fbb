//! Path expansion and environment variable overlay.

use crate::SliceConfig;
use std::env;
use std::path::PathBuf;

/// Apply `PIECEWORK_*` environment overrides on top of a loaded config.
///
/// Returns the names of the variables that took effect.
pub fn apply_env_overrides(config: &mut SliceConfig) -> Vec<String> {
    let mut applied = Vec::new();

    if let Ok(v) = env::var("PIECEWORK_SLICE_SIZE") {
        if let Ok(size) = v.trim().parse() {
            config.slice_size = size;
            applied.push("PIECEWORK_SLICE_SIZE".to_string());
        }
    }
    if let Ok(v) = env::var("PIECEWORK_EXTRA_FILE_PATH") {
        config.extra_file_path = if v.is_empty() { None } else { Some(expand_path(&v)) };
        applied.push("PIECEWORK_EXTRA_FILE_PATH".to_string());
    }
    if let Ok(v) = env::var("PIECEWORK_EXTRA_FILE_SIZE") {
        config.extra_file_size_in_one_piece = if v.is_empty() { None } else { Some(v) };
        applied.push("PIECEWORK_EXTRA_FILE_SIZE".to_string());
    }

    applied
}

/// Expand a leading `~` or `~/` to the home directory.
///
/// Anything else, `~user` and `$VAR` included, is taken literally.
pub fn expand_path(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    let Some(dirs) = directories::BaseDirs::new() else {
        return PathBuf::from(path);
    };
    if rest.is_empty() {
        dirs.home_dir().to_path_buf()
    } else {
        dirs.home_dir().join(rest)
    }
}
