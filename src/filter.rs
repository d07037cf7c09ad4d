use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::path::basename;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum FilterKind {
    /// basename glob matched against files
    File,
    /// basename glob matched against directories
    Directory,
    /// literal child name that disqualifies the directory containing it
    ParentDirectory,
}

#[derive(Debug, Default)]
struct GlobList {
    patterns: Vec<String>,
    set: GlobSet,
}

impl GlobList {
    fn rebuild(&mut self) {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => log::warn!("ignoring invalid glob {pattern:?}: {err}"),
            }
        }
        match builder.build() {
            Ok(set) => self.set = set,
            Err(err) => log::warn!("could not compile filter globs: {err}"),
        }
    }

    fn add(&mut self, pattern: &str) {
        self.patterns.push(pattern.to_owned());
        self.rebuild();
    }

    fn clear(&mut self) {
        self.patterns.clear();
        self.set = GlobSet::empty();
    }

    fn matches(&self, name: &str) -> bool {
        self.set.is_match(Path::new(name))
    }
}

/// The three filter lists of the indexing configuration plus the text
/// allowlist. Globs are evaluated against basenames only.
#[derive(Debug, Default)]
pub struct FilterSet {
    files: GlobList,
    directories: GlobList,
    /// literal names, globbing is not allowed here
    content_names: Vec<String>,
    text_allowlist: GlobList,
}

impl FilterSet {
    pub fn add(&mut self, kind: FilterKind, pattern: &str) {
        if Path::new(pattern).is_absolute() {
            log::warn!("absolute paths are not allowed in filters: {pattern:?}");
            return;
        }
        match kind {
            FilterKind::File => self.files.add(pattern),
            FilterKind::Directory => self.directories.add(pattern),
            FilterKind::ParentDirectory => {
                if pattern.contains('*') || pattern.contains('?') {
                    log::warn!("globs are not allowed in content filters: {pattern:?}");
                    return;
                }
                self.content_names.push(pattern.to_owned());
            }
        }
    }

    pub fn clear(&mut self, kind: FilterKind) {
        match kind {
            FilterKind::File => self.files.clear(),
            FilterKind::Directory => self.directories.clear(),
            FilterKind::ParentDirectory => self.content_names.clear(),
        }
    }

    pub fn matches(&self, kind: FilterKind, path: &Path) -> bool {
        let name = basename(path).to_string_lossy();
        match kind {
            FilterKind::File => self.files.matches(&name),
            FilterKind::Directory => self.directories.matches(&name),
            FilterKind::ParentDirectory => self.content_names.iter().any(|n| **n == *name),
        }
    }

    /// A directory is indexable by content iff none of the registered
    /// content filter names exist as children of it. Note that this
    /// deliberately applies to configured roots too, exempting roots is
    /// the caller's business (crawling exempts them, live monitor
    /// dispatch does not).
    pub fn parent_is_indexable(&self, parent: &Path) -> bool {
        !self
            .content_names
            .iter()
            .any(|name| parent.join(name).symlink_metadata().is_ok())
    }

    pub fn add_text_pattern(&mut self, pattern: &str) {
        self.text_allowlist.add(pattern);
    }

    pub fn clear_text_patterns(&mut self) {
        self.text_allowlist.clear();
    }

    pub fn has_allowed_text_extension(&self, path: &Path) -> bool {
        self.text_allowlist.matches(&basename(path).to_string_lossy())
    }

    pub fn patterns(&self, kind: FilterKind) -> &[String] {
        match kind {
            FilterKind::File => &self.files.patterns,
            FilterKind::Directory => &self.directories.patterns,
            FilterKind::ParentDirectory => &self.content_names,
        }
    }

    pub fn text_patterns(&self) -> &[String] {
        &self.text_allowlist.patterns
    }
}

/// Serialized snapshot of the filter and root configuration, written at
/// shutdown and compared on the next startup. Comparison is
/// order-independent set equality.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub text_allowlist: Vec<String>,
    pub ignored_files: Vec<String>,
    pub ignored_directories: Vec<String>,
    pub ignored_directories_with_content: Vec<String>,
    pub index_single_directories: Vec<PathBuf>,
    pub index_recursive_directories: Vec<PathBuf>,
}

fn set_eq<T: Ord>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&T> = a.iter().collect();
    let mut b: Vec<&T> = b.iter().collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

impl ConfigSnapshot {
    pub fn same_config(&self, other: &ConfigSnapshot) -> bool {
        set_eq(&self.text_allowlist, &other.text_allowlist)
            && set_eq(&self.ignored_files, &other.ignored_files)
            && set_eq(&self.ignored_directories, &other.ignored_directories)
            && set_eq(
                &self.ignored_directories_with_content,
                &other.ignored_directories_with_content,
            )
            && set_eq(&self.index_single_directories, &other.index_single_directories)
            && set_eq(&self.index_recursive_directories, &other.index_recursive_directories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_globs() {
        let mut filters = FilterSet::default();
        filters.add(FilterKind::File, "*.o");
        filters.add(FilterKind::File, "#*#");
        filters.add(FilterKind::Directory, "node_modules");

        assert!(filters.matches(FilterKind::File, Path::new("/src/main.o")));
        assert!(filters.matches(FilterKind::File, Path::new("/src/#f#")));
        assert!(!filters.matches(FilterKind::File, Path::new("/src/main.rs")));
        assert!(filters.matches(FilterKind::Directory, Path::new("/js/node_modules")));
        // directory globs don't leak into the file kind
        assert!(!filters.matches(FilterKind::File, Path::new("/js/node_modules")));

        filters.clear(FilterKind::File);
        assert!(!filters.matches(FilterKind::File, Path::new("/src/main.o")));
    }

    #[test]
    fn content_names_are_literal() {
        let mut filters = FilterSet::default();
        filters.add(FilterKind::ParentDirectory, "*.nomedia");
        assert!(filters.patterns(FilterKind::ParentDirectory).is_empty());
        filters.add(FilterKind::ParentDirectory, ".nomedia");
        assert!(filters.matches(FilterKind::ParentDirectory, Path::new("/x/.nomedia")));

        let dir = tempfile::TempDir::new().unwrap();
        assert!(filters.parent_is_indexable(dir.path()));
        std::fs::write(dir.path().join(".nomedia"), "").unwrap();
        assert!(!filters.parent_is_indexable(dir.path()));
    }

    #[test]
    fn snapshot_equality_ignores_order() {
        let a = ConfigSnapshot {
            ignored_files: vec!["*.o".into(), "*.lo".into()],
            ..Default::default()
        };
        let b = ConfigSnapshot {
            ignored_files: vec!["*.lo".into(), "*.o".into()],
            ..Default::default()
        };
        assert!(a.same_config(&b));
        let c = ConfigSnapshot { ignored_files: vec!["*.o".into()], ..Default::default() };
        assert!(!a.same_config(&c));
    }
}
