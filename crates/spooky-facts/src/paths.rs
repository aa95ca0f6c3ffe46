//! Fact store location

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable overriding the store directory
pub const FACTS_PATH_ENV: &str = "SPOOKY_FACTS_PATH";

/// Database file name inside the store directory
pub const DATABASE_FILE: &str = "facts.redb";

/// Resolve the store directory
///
/// A non-empty `SPOOKY_FACTS_PATH`, then `configured`, then
/// `<state dir>/spooky/facts`, then `./.spooky/facts`.
#[must_use]
pub fn store_dir(configured: Option<&Path>) -> PathBuf {
    pick_store_dir(std::env::var_os(FACTS_PATH_ENV), configured, dirs::state_dir())
}

fn pick_store_dir(env: Option<OsString>, configured: Option<&Path>, state_dir: Option<PathBuf>) -> PathBuf {
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if let Some(path) = configured.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_path_buf();
    }

    state_dir
        .map(|dir| dir.join("spooky").join("facts"))
        .unwrap_or_else(|| PathBuf::from(".spooky").join("facts"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_wins() {
        let dir = pick_store_dir(
            Some(OsString::from("/srv/facts")),
            Some(Path::new("/etc/spooky/facts")),
            Some(PathBuf::from("/home/u/.local/state")),
        );
        assert_eq!(dir, PathBuf::from("/srv/facts"));
    }

    #[test]
    fn test_empty_env_falls_through() {
        let dir = pick_store_dir(
            Some(OsString::new()),
            Some(Path::new("/etc/spooky/facts")),
            Some(PathBuf::from("/home/u/.local/state")),
        );
        assert_eq!(dir, PathBuf::from("/etc/spooky/facts"));

        let dir = pick_store_dir(Some(OsString::new()), None, Some(PathBuf::from("/home/u/.local/state")));
        assert_eq!(dir, PathBuf::from("/home/u/.local/state/spooky/facts"));
    }

    #[test]
    fn test_state_dir_then_relative() {
        let dir = pick_store_dir(None, None, Some(PathBuf::from("/var/lib/state")));
        assert!(dir.ends_with("spooky/facts"));

        assert_eq!(pick_store_dir(None, None, None), PathBuf::from(".spooky/facts"));
    }
}
