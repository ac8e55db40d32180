use std::path::{Path, PathBuf};

pub use common_file_filter::CommonFileFilter;
pub use settings::SyncSettings;

pub mod common_file_filter;
pub mod settings;

const DATABASE_FILE: &str = "drivefs.db";

/// Where one account keeps its database and cached contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    account_dir: PathBuf,
    cache_dir: PathBuf,
}

impl AccountPaths {
    /// `<base_dir>/<account>/drivefs.db`, with the cache in `cache_dir` or
    /// `<base_dir>/<account>/cache`.
    pub fn new(base_dir: &Path, account: &str, cache_dir: Option<PathBuf>) -> Self {
        let account_dir = base_dir.join(account);
        let cache_dir = cache_dir.unwrap_or_else(|| account_dir.join("cache"));
        Self {
            account_dir,
            cache_dir,
        }
    }
    pub fn account_dir(&self) -> &Path {
        &self.account_dir
    }
    pub fn database(&self) -> PathBuf {
        self.account_dir.join(DATABASE_FILE)
    }
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_account_layout() {
        let paths = AccountPaths::new(Path::new("/var/lib/drivefs"), "me@example.com", None);
        assert_eq!(
            PathBuf::from("/var/lib/drivefs/me@example.com/drivefs.db"),
            paths.database()
        );
        assert_eq!(
            Path::new("/var/lib/drivefs/me@example.com/cache"),
            paths.cache_dir()
        );
        let paths = AccountPaths::new(Path::new("/b"), "a", Some("/fast/cache".into()));
        assert_eq!(Path::new("/fast/cache"), paths.cache_dir());
    }
}
