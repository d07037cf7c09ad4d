use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::file_info::FileInfo;
use crate::filter::{ConfigSnapshot, FilterKind, FilterSet};
use crate::path::{is_descendant, is_descendant_or_equal, is_direct_child, is_hidden};

bitflags! {
    /// Per-root configuration flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RootFlags: u32 {
        /// index the whole subtree, not just direct children
        const RECURSE = 1 << 0;
        /// keep store contents when the root is removed
        const PRESERVE = 1 << 1;
        /// reconcile ahead of other pending roots
        const PRIORITY = 1 << 2;
        /// root lives on removable storage; advisory only, mount state
        /// is always taken from the live stat
        const IS_VOLUME = 1 << 3;
        /// install filesystem monitors while crawling
        const MONITOR = 1 << 4;
    }
}

/// Change notifications produced by tree mutations. The worker routes
/// these to the notifier and the miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    DirectoryAdded(PathBuf),
    DirectoryRemoved { path: PathBuf, flags: RootFlags },
    DirectoryUpdated(PathBuf),
    ChildUpdated { root: PathBuf, child: PathBuf },
}

#[derive(Debug)]
struct RootNode {
    path: PathBuf,
    flags: RootFlags,
}

/// The set of configured indexing roots plus the basename/content
/// filters. Answers "is this path indexable" and "what is the nearest
/// ancestor root". The virtual `file:///` master root is implicit,
/// containment is a pure path predicate so removing a root transparently
/// re-parents anything below it to the nearest surviving ancestor.
#[derive(Debug, Default)]
pub struct IndexingTree {
    roots: Vec<RootNode>,
    filters: FilterSet,
    filter_hidden: bool,
}

impl IndexingTree {
    pub fn new() -> IndexingTree {
        IndexingTree::default()
    }

    /// Adds `path` as an indexing root. Adding a known root overwrites
    /// its flags and emits `directory-updated` if they changed.
    pub fn add(&mut self, path: &Path, flags: RootFlags, events: &mut Vec<TreeEvent>) {
        if let Some(node) = self.roots.iter_mut().find(|node| node.path == path) {
            if node.flags != flags {
                log::debug!("overwriting flags for root {path:?}");
                node.flags = flags;
                events.push(TreeEvent::DirectoryUpdated(path.to_owned()));
            }
            return;
        }
        self.roots.push(RootNode { path: path.to_owned(), flags });
        events.push(TreeEvent::DirectoryAdded(path.to_owned()));
    }

    /// Removes a previously added root; unknown paths are a no-op.
    pub fn remove(&mut self, path: &Path, events: &mut Vec<TreeEvent>) {
        let Some(i) = self.roots.iter().position(|node| node.path == path) else {
            return;
        };
        let node = self.roots.remove(i);
        // flags are still valid at the moment of removal
        events.push(TreeEvent::DirectoryRemoved { path: node.path, flags: node.flags });
    }

    /// The deepest configured root containing `path` (roots contain
    /// themselves).
    pub fn get_root(&self, path: &Path) -> Option<(&Path, RootFlags)> {
        self.roots
            .iter()
            .filter(|node| is_descendant_or_equal(path, &node.path))
            .max_by_key(|node| node.path.as_os_str().len())
            .map(|node| (node.path.as_path(), node.flags))
    }

    pub fn file_is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|node| node.path == path)
    }

    pub fn list_roots(&self) -> impl Iterator<Item = (&Path, RootFlags)> {
        self.roots.iter().map(|node| (node.path.as_path(), node.flags))
    }

    /// The parent of all real roots.
    pub fn master_root(&self) -> &Path {
        Path::new("/")
    }

    /// Wether `path` should be indexed: some root must contain it (the
    /// root itself always passes), its basename must survive the filter
    /// of its file type, non-recursive roots only admit direct
    /// children, and hidden files are rejected when hidden filtering is
    /// on.
    pub fn file_is_indexable(&self, path: &Path, info: Option<&FileInfo>) -> bool {
        let Some((root, flags)) = self.get_root(path) else {
            return false;
        };
        if path == root {
            return true;
        }

        let queried;
        let info = match info {
            Some(info) => Some(info),
            None => {
                queried = FileInfo::query_quiet(path);
                queried.as_ref()
            }
        };

        let kind = match info {
            Some(info) if info.is_dir() => FilterKind::Directory,
            _ => FilterKind::File,
        };
        if self.filters.matches(kind, path) {
            return false;
        }
        if !flags.contains(RootFlags::RECURSE) && !is_direct_child(path, root) {
            return false;
        }
        if self.filter_hidden && (is_hidden(path) || info.is_some_and(|i| i.is_hidden)) {
            return false;
        }
        true
    }

    /// Wether a directory is indexable judging by its contents; see
    /// [`FilterSet::parent_is_indexable`] for the root caveat.
    pub fn parent_is_indexable(&self, parent: &Path) -> bool {
        self.filters.parent_is_indexable(parent)
    }

    pub fn file_matches_filter(&self, kind: FilterKind, path: &Path) -> bool {
        self.filters.matches(kind, path)
    }

    pub fn add_filter(&mut self, kind: FilterKind, pattern: &str) {
        self.filters.add(kind, pattern);
    }

    pub fn clear_filters(&mut self, kind: FilterKind) {
        self.filters.clear(kind);
    }

    pub fn set_filter_hidden(&mut self, filter_hidden: bool) {
        self.filter_hidden = filter_hidden;
    }

    pub fn filter_hidden(&self) -> bool {
        self.filter_hidden
    }

    pub fn add_allowed_text_pattern(&mut self, pattern: &str) {
        self.filters.add_text_pattern(pattern);
    }

    pub fn clear_allowed_text_patterns(&mut self) {
        self.filters.clear_text_patterns();
    }

    pub fn file_has_allowed_text_extension(&self, path: &Path) -> bool {
        self.filters.has_allowed_text_extension(path)
    }

    /// Emits `directory-updated` if `path` is a root, `child-updated`
    /// if it lives inside one (recursively, or as a direct child of a
    /// non-recursive root). With `recursive`, additionally emits
    /// `directory-updated` for every root strictly inside `path`.
    pub fn notify_update(
        &self,
        path: &Path,
        recursive: bool,
        events: &mut Vec<TreeEvent>,
    ) -> bool {
        let mut emitted = false;
        if self.file_is_root(path) {
            events.push(TreeEvent::DirectoryUpdated(path.to_owned()));
            emitted = true;
        } else if let Some((root, flags)) = self.get_root(path) {
            if flags.contains(RootFlags::RECURSE) || is_direct_child(path, root) {
                events.push(TreeEvent::ChildUpdated {
                    root: root.to_owned(),
                    child: path.to_owned(),
                });
                emitted = true;
            }
        }

        if recursive {
            for node in &self.roots {
                if is_descendant(&node.path, path) {
                    events.push(TreeEvent::DirectoryUpdated(node.path.clone()));
                    emitted = true;
                }
            }
        }
        emitted
    }

    pub fn update_all(&self, events: &mut Vec<TreeEvent>) {
        for node in &self.roots {
            self.notify_update(&node.path, false, events);
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let mut snapshot = ConfigSnapshot {
            text_allowlist: self.filters.text_patterns().to_vec(),
            ignored_files: self.filters.patterns(FilterKind::File).to_vec(),
            ignored_directories: self.filters.patterns(FilterKind::Directory).to_vec(),
            ignored_directories_with_content: self
                .filters
                .patterns(FilterKind::ParentDirectory)
                .to_vec(),
            ..Default::default()
        };
        for node in &self.roots {
            if node.flags.contains(RootFlags::RECURSE) {
                snapshot.index_recursive_directories.push(node.path.clone());
            } else {
                snapshot.index_single_directories.push(node.path.clone());
            }
        }
        snapshot
    }

    /// Persists the live configuration, see [`IndexingTree::check_config`].
    pub fn save_config(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot()).map_err(io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Compares the persisted snapshot against the live state. On any
    /// mismatch (or an unreadable snapshot) every root emits
    /// `directory-updated` and false is returned; the snapshot is
    /// replaced by the live state on the next save.
    pub fn check_config(&self, path: &Path, events: &mut Vec<TreeEvent>) -> bool {
        let stored = std::fs::read_to_string(path)
            .ok()
            .and_then(|json| serde_json::from_str::<ConfigSnapshot>(&json).ok());
        match stored {
            Some(stored) if stored.same_config(&self.snapshot()) => true,
            _ => {
                self.update_all(events);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(roots: &[(&str, RootFlags)]) -> IndexingTree {
        let mut tree = IndexingTree::new();
        let mut events = Vec::new();
        for (path, flags) in roots {
            tree.add(Path::new(path), *flags, &mut events);
        }
        tree
    }

    #[test]
    fn nearest_root_wins() {
        let tree = tree_with(&[
            ("/data", RootFlags::RECURSE),
            ("/data/photos", RootFlags::empty()),
        ]);
        assert_eq!(
            tree.get_root(Path::new("/data/photos/x.jpg")).unwrap().0,
            Path::new("/data/photos")
        );
        assert_eq!(tree.get_root(Path::new("/data/docs/a")).unwrap().0, Path::new("/data"));
        assert_eq!(tree.get_root(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn add_twice_updates_flags() {
        let mut tree = tree_with(&[("/data", RootFlags::RECURSE)]);
        let mut events = Vec::new();
        tree.add(Path::new("/data"), RootFlags::RECURSE, &mut events);
        assert_eq!(events, vec![]);
        tree.add(Path::new("/data"), RootFlags::empty(), &mut events);
        assert_eq!(events, vec![TreeEvent::DirectoryUpdated("/data".into())]);
    }

    #[test]
    fn remove_reparents_by_containment() {
        let mut tree = tree_with(&[
            ("/data", RootFlags::RECURSE),
            ("/data/photos", RootFlags::empty()),
        ]);
        let mut events = Vec::new();
        tree.remove(Path::new("/data/photos"), &mut events);
        assert_eq!(
            events,
            vec![TreeEvent::DirectoryRemoved {
                path: "/data/photos".into(),
                flags: RootFlags::empty()
            }]
        );
        // files below the removed node now belong to the outer root
        assert_eq!(
            tree.get_root(Path::new("/data/photos/x.jpg")).unwrap().0,
            Path::new("/data")
        );
    }

    #[test]
    fn indexability() {
        let mut tree = tree_with(&[
            ("/rec", RootFlags::RECURSE),
            ("/flat", RootFlags::empty()),
        ]);
        tree.add_filter(FilterKind::File, "*.o");

        assert!(tree.file_is_indexable(Path::new("/rec"), None));
        assert!(!tree.file_is_indexable(Path::new("/rec/a.o"), None));
        assert!(tree.file_is_indexable(Path::new("/rec/deep/a.txt"), None));
        assert!(tree.file_is_indexable(Path::new("/flat/a.txt"), None));
        assert!(!tree.file_is_indexable(Path::new("/flat/deep/a.txt"), None));
        assert!(!tree.file_is_indexable(Path::new("/outside"), None));

        tree.set_filter_hidden(true);
        assert!(!tree.file_is_indexable(Path::new("/rec/.cache"), None));
        // the root always passes, hidden or not
        let mut events = Vec::new();
        tree.add(Path::new("/rec/.config"), RootFlags::RECURSE, &mut events);
        assert!(tree.file_is_indexable(Path::new("/rec/.config"), None));
    }

    #[test]
    fn notify_update_routing() {
        let tree = tree_with(&[
            ("/rec", RootFlags::RECURSE),
            ("/flat", RootFlags::empty()),
        ]);
        let mut events = Vec::new();

        assert!(tree.notify_update(Path::new("/rec"), false, &mut events));
        assert_eq!(events, vec![TreeEvent::DirectoryUpdated("/rec".into())]);

        events.clear();
        assert!(tree.notify_update(Path::new("/rec/sub/file"), false, &mut events));
        assert_eq!(
            events,
            vec![TreeEvent::ChildUpdated { root: "/rec".into(), child: "/rec/sub/file".into() }]
        );

        events.clear();
        // not a direct child of the non-recursive root
        assert!(!tree.notify_update(Path::new("/flat/sub/file"), false, &mut events));

        events.clear();
        assert!(tree.notify_update(Path::new("/"), true, &mut events));
        assert_eq!(
            events,
            vec![
                TreeEvent::DirectoryUpdated("/rec".into()),
                TreeEvent::DirectoryUpdated("/flat".into()),
            ]
        );
    }

    #[test]
    fn config_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("config.json");
        let mut tree = tree_with(&[("/rec", RootFlags::RECURSE)]);
        tree.add_filter(FilterKind::File, "*.bak");

        tree.save_config(&config).unwrap();
        let mut events = Vec::new();
        assert!(tree.check_config(&config, &mut events));
        assert!(events.is_empty());

        tree.add_filter(FilterKind::File, "*.tmp");
        assert!(!tree.check_config(&config, &mut events));
        assert_eq!(events, vec![TreeEvent::DirectoryUpdated("/rec".into())]);

        tree.save_config(&config).unwrap();
        events.clear();
        assert!(tree.check_config(&config, &mut events));
    }
}
