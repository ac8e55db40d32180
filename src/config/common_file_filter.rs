use std::path::{Path, PathBuf};

use anyhow::anyhow;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use crate::prelude::*;

/// Gitignore-style patterns for remote paths that should not be mirrored.
///
/// Paths are matched relative to the drive root, e.g. `Photos/2019/raw`.
#[derive(Debug)]
pub struct CommonFileFilter {
    pub filter: Gitignore,
}

impl CommonFileFilter {
    pub fn empty() -> Self {
        Self {
            filter: Gitignore::empty(),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let root = path.parent().unwrap_or(Path::new(""));
        let mut builder = GitignoreBuilder::new(root);
        if let Some(e) = builder.add(&path) {
            return Err(anyhow!("could not read ignore file {}: {}", path.display(), e));
        }
        let filter = builder.build()?;
        debug!("loaded {} ignore patterns from {}", filter.len(), path.display());
        Ok(Self { filter })
    }

    pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            builder.add_line(None, pattern)?;
        }
        Ok(Self {
            filter: builder.build()?,
        })
    }

    /// Whether `path` or one of its parent folders is ignored.
    pub fn is_filter_matched(&self, path: &Path, is_dir: bool) -> bool {
        self.filter
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn patterns_match_files_and_folders() {
        let filter = CommonFileFilter::from_patterns(["*.tmp", "Backups/", "!keep.tmp"]).unwrap();
        assert!(filter.is_filter_matched(Path::new("a/b.tmp"), false));
        assert!(!filter.is_filter_matched(Path::new("a/keep.tmp"), false));
        assert!(filter.is_filter_matched(Path::new("Backups"), true));
        assert!(filter.is_filter_matched(Path::new("Backups/old.zip"), false));
        assert!(!filter.is_filter_matched(Path::new("Docs/report.pdf"), false));
    }

    #[test]
    fn reads_an_ignore_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "*.iso").unwrap();
        let filter = CommonFileFilter::from_path(file.path()).unwrap();
        assert!(filter.is_filter_matched(Path::new("images/disk.iso"), false));
        assert!(!CommonFileFilter::empty().is_filter_matched(Path::new("disk.iso"), false));
    }
}
