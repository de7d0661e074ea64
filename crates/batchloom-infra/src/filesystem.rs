//! Data directory layout.

use std::path::{Path, PathBuf};

/// Resolve the data directory.
///
/// Priority:
/// 1. `BATCHLOOM_DATA_DIR` environment variable
/// 2. `~/.batchloom`
/// 3. `./.batchloom`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BATCHLOOM_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".batchloom");
    }

    PathBuf::from(".batchloom")
}

/// `{data_dir}/batchloom.db`
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("batchloom.db")
}

/// `{data_dir}/batchloom.toml`
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("batchloom.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let data_dir = PathBuf::from("/srv/batchloom");
        assert_eq!(database_path(&data_dir), PathBuf::from("/srv/batchloom/batchloom.db"));
        assert_eq!(config_path(&data_dir), PathBuf::from("/srv/batchloom/batchloom.toml"));
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: no other test in this crate touches BATCHLOOM_DATA_DIR.
        unsafe {
            std::env::set_var("BATCHLOOM_DATA_DIR", "/tmp/test-batchloom");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-batchloom"));
        unsafe {
            std::env::remove_var("BATCHLOOM_DATA_DIR");
        }
    }
}
