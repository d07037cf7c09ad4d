use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::filter::FilterKind;
use crate::tree::RootFlags;
use crate::Indexer;

/// The typed configuration key set the core observes. How these are
/// stored (gsettings, a file, a command line) is the application's
/// business; the controller only diffs and applies them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerConfig {
    pub index_recursive_directories: Vec<PathBuf>,
    pub index_single_directories: Vec<PathBuf>,
    pub ignored_files: Vec<String>,
    pub ignored_directories: Vec<String>,
    pub ignored_directories_with_content: Vec<String>,
    pub text_allowlist: Vec<String>,
    pub enable_monitors: bool,
    pub index_removable_devices: bool,
}

impl Default for IndexerConfig {
    fn default() -> IndexerConfig {
        IndexerConfig {
            index_recursive_directories: Vec::new(),
            index_single_directories: Vec::new(),
            ignored_files: Vec::new(),
            ignored_directories: Vec::new(),
            ignored_directories_with_content: Vec::new(),
            text_allowlist: Vec::new(),
            enable_monitors: true,
            index_removable_devices: false,
        }
    }
}

/// Translates configuration changes and removable-media events into
/// indexing-tree mutations on the handle.
pub struct Controller {
    indexer: Indexer,
    current: IndexerConfig,
    volumes: Vec<PathBuf>,
}

impl Controller {
    pub fn new(indexer: Indexer) -> Controller {
        Controller { indexer, current: IndexerConfig::default(), volumes: Vec::new() }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.current
    }

    fn root_flags(&self, recursive: bool) -> RootFlags {
        let mut flags = if recursive { RootFlags::RECURSE } else { RootFlags::empty() };
        if self.current.enable_monitors {
            flags |= RootFlags::MONITOR;
        }
        flags
    }

    /// Diffs `config` against the currently applied one and mutates the
    /// tree accordingly. Filters are replaced wholesale when their list
    /// changed; roots are added and removed individually.
    pub fn apply(&mut self, config: IndexerConfig) {
        let old = std::mem::replace(&mut self.current, config);
        let new = &self.current;

        if old.ignored_files != new.ignored_files {
            self.indexer.clear_filters(FilterKind::File);
            for pattern in &new.ignored_files {
                self.indexer.add_filter(FilterKind::File, pattern);
            }
        }
        if old.ignored_directories != new.ignored_directories {
            self.indexer.clear_filters(FilterKind::Directory);
            for pattern in &new.ignored_directories {
                self.indexer.add_filter(FilterKind::Directory, pattern);
            }
        }
        if old.ignored_directories_with_content != new.ignored_directories_with_content {
            self.indexer.clear_filters(FilterKind::ParentDirectory);
            for pattern in &new.ignored_directories_with_content {
                self.indexer.add_filter(FilterKind::ParentDirectory, pattern);
            }
        }
        if old.text_allowlist != new.text_allowlist {
            self.indexer.clear_allowed_text_patterns();
            for pattern in &new.text_allowlist {
                self.indexer.add_allowed_text_pattern(pattern);
            }
        }

        for path in &old.index_recursive_directories {
            if !new.index_recursive_directories.contains(path) {
                self.indexer.remove_root(path);
            }
        }
        for path in &old.index_single_directories {
            if !new.index_single_directories.contains(path) {
                self.indexer.remove_root(path);
            }
        }
        let recursive_flags = self.root_flags(true);
        for path in &self.current.index_recursive_directories {
            self.indexer.add_root_unchecked(path, recursive_flags);
        }
        let single_flags = self.root_flags(false);
        for path in &self.current.index_single_directories {
            self.indexer.add_root_unchecked(path, single_flags);
        }
    }

    /// A removable volume appeared. Indexed with PRESERVE so unplugging
    /// it does not wipe its contents from the store.
    pub fn mount_added(&mut self, mount_point: &Path) {
        if !self.current.index_removable_devices {
            return;
        }
        let mut flags =
            RootFlags::RECURSE | RootFlags::PRESERVE | RootFlags::PRIORITY | RootFlags::IS_VOLUME;
        if self.current.enable_monitors {
            flags |= RootFlags::MONITOR;
        }
        self.volumes.push(mount_point.to_owned());
        self.indexer.add_root_unchecked(mount_point, flags);
    }

    pub fn mount_removed(&mut self, mount_point: &Path) {
        self.volumes.retain(|path| path != mount_point);
        self.indexer.remove_root(mount_point);
    }
}
