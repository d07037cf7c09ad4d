use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::events::{FileEvent, MonitorEvent};
use crate::extract::ExtractorRegistry;
use crate::file_info::{FileInfo, FileType};
use crate::monitor::Monitor;
use crate::path::{
    extension_changed, file_uri, is_descendant_or_equal, is_direct_child, uri_to_path,
};
use crate::store::{StoreHandle, StoreRow};
use crate::tree::{IndexingTree, RootFlags, TreeEvent};

pub const CURSOR_BATCH_ITEMS: usize = 200;
pub const ENUMERATOR_BATCH_ITEMS: usize = 200;

bitflags! {
    /// Flags of a single queued reconciliation, as opposed to the
    /// configuration flags of the root it runs under.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ReconcileFlags: u32 {
        /// the event for the root file itself was already emitted by
        /// whoever queued the reconcile
        const IGNORE_ROOT_FILE = 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    None,
    Create,
    Update,
    Delete,
    /// unchanged on disk but the extractor module for its mimetype
    /// changed, needs re-extraction
    ExtractorUpdate,
}

/// Three-way comparison record for a single path: what the store
/// believes, what the disk says, and the state derived from both.
#[derive(Debug, Default)]
struct FileData {
    in_disk: bool,
    in_store: bool,
    is_dir_in_disk: bool,
    is_dir_in_store: bool,
    store_mtime: Option<DateTime<Utc>>,
    disk_mtime: Option<DateTime<Utc>>,
    extractor_hash: Option<String>,
    mimetype: Option<String>,
}

impl FileData {
    fn stamp_store(&mut self, row: &StoreRow) {
        self.in_store = true;
        self.is_dir_in_store = row.folder_urn.is_some();
        self.store_mtime = Some(row.modified);
        self.extractor_hash = row.extractor_hash.clone();
        self.mimetype = row.mimetype.clone();
    }

    fn stamp_disk(&mut self, info: &FileInfo) {
        self.in_disk = true;
        self.is_dir_in_disk = info.is_dir();
        self.disk_mtime = Some(info.mtime);
    }

    fn state(&self, extractors: &ExtractorRegistry) -> FileState {
        if self.in_disk {
            if !self.in_store {
                return FileState::Create;
            }
            if self.store_mtime != self.disk_mtime {
                return FileState::Update;
            }
            if let Some(mimetype) = &self.mimetype {
                if self.extractor_hash != extractors.hash_for(mimetype) {
                    return FileState::ExtractorUpdate;
                }
            }
            FileState::None
        } else if self.in_store {
            FileState::Delete
        } else {
            FileState::None
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotifierStats {
    pub files_found: u32,
    pub files_ignored: u32,
    pub files_updated: u32,
    pub files_reindexed: u32,
}

impl NotifierStats {
    fn merge(&mut self, other: &NotifierStats) {
        self.files_found += other.files_found;
        self.files_ignored += other.files_ignored;
        self.files_updated += other.files_updated;
        self.files_reindexed += other.files_reindexed;
    }
}

struct Enumerator {
    dir: PathBuf,
    walk: walkdir::IntoIter,
}

/// The in-memory state of one active reconcile.
struct IndexRoot {
    root: PathBuf,
    flags: RootFlags,
    reconcile: ReconcileFlags,
    cancel: Arc<AtomicBool>,
    /// store rows not yet compared against the disk
    cursor: Option<VecDeque<StoreRow>>,
    cursor_has_content: bool,
    /// directories awaiting crawl, depth first
    pending_dirs: VecDeque<PathBuf>,
    /// crawled directories whose subtrees are not finished yet
    pending_finish: VecDeque<PathBuf>,
    enumerator: Option<Enumerator>,
    current_dir: Option<PathBuf>,
    /// emit the root itself as a discovered file when its crawl starts
    emit_root_file: bool,
    /// store-side directories found deleted; their children inherit the
    /// deletion and must not produce events of their own
    deleted_dirs: Vec<PathBuf>,
    stats: NotifierStats,
    started: Instant,
}

impl IndexRoot {
    fn new(root: PathBuf, flags: RootFlags, reconcile: ReconcileFlags) -> IndexRoot {
        IndexRoot {
            root,
            flags,
            reconcile,
            cancel: Arc::new(AtomicBool::new(false)),
            cursor: None,
            cursor_has_content: false,
            pending_dirs: VecDeque::new(),
            pending_finish: VecDeque::new(),
            enumerator: None,
            current_dir: None,
            emit_root_file: false,
            deleted_dirs: Vec::new(),
            stats: NotifierStats::default(),
            started: Instant::now(),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(atomic::Ordering::Relaxed)
    }

    /// Drops `dir` and everything below it from the crawl queue.
    fn remove_directory(&mut self, dir: &Path) {
        self.pending_dirs.retain(|pending| !is_descendant_or_equal(pending, dir));
        if self.enumerator.as_ref().is_some_and(|e| is_descendant_or_equal(&e.dir, dir)) {
            self.enumerator = None;
        }
    }
}

/// Per-root reconciler and live monitor-event dispatcher. Produces the
/// minimal stream of logical events whose application makes the store
/// match the filesystem, then keeps translating monitor events after
/// the crawl. Long operations yield at batch boundaries; the worker
/// drives it one batch at a time through [`FileNotifier::step`].
pub struct FileNotifier {
    store: StoreHandle,
    monitor: Option<Monitor>,
    extractors: Arc<ExtractorRegistry>,
    pending_roots: VecDeque<IndexRoot>,
    current: Option<IndexRoot>,
    stopped: bool,
    high_water: bool,
    checked_monitor_limit: bool,
    totals: NotifierStats,
}

fn notify_state(
    state: FileState,
    path: PathBuf,
    info: Option<FileInfo>,
    is_dir_in_store: bool,
    out: &mut Vec<FileEvent>,
) {
    match state {
        FileState::Delete => out.push(FileEvent::Deleted { path, is_dir: is_dir_in_store }),
        FileState::Create => out.push(FileEvent::Created { path, info }),
        FileState::Update | FileState::ExtractorUpdate => {
            out.push(FileEvent::Updated { path, info, attributes_only: false })
        }
        FileState::None => (),
    }
}

impl FileNotifier {
    pub fn new(
        store: StoreHandle,
        monitor: Option<Monitor>,
        extractors: Arc<ExtractorRegistry>,
    ) -> FileNotifier {
        FileNotifier {
            store,
            monitor,
            extractors,
            pending_roots: VecDeque::new(),
            current: None,
            stopped: true,
            high_water: false,
            checked_monitor_limit: false,
            totals: NotifierStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some() || !self.pending_roots.is_empty()
    }

    /// Wether [`FileNotifier::step`] would make progress right now.
    pub fn can_step(&self) -> bool {
        !self.stopped && !self.high_water && self.is_active()
    }

    pub fn stats(&self) -> NotifierStats {
        self.totals
    }

    pub fn set_high_water(&mut self, high_water: bool) {
        self.high_water = high_water;
    }

    pub fn start(&mut self) {
        if self.stopped {
            self.stopped = false;
            if !self.checked_monitor_limit {
                self.checked_monitor_limit = true;
                self.check_disable_monitor();
            }
        }
    }

    /// Stops processing. The current root cannot resume from partial
    /// state, it is re-queued at the front with PRIORITY and restarts
    /// from scratch.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        if let Some(root) = self.current.take() {
            root.cancel.store(true, atomic::Ordering::Relaxed);
            self.pending_roots.push_front(IndexRoot::new(
                root.root,
                root.flags | RootFlags::PRIORITY,
                root.reconcile,
            ));
        }
        self.stopped = true;
    }

    pub fn queue_root(&mut self, path: PathBuf, flags: RootFlags, reconcile: ReconcileFlags) {
        let root = IndexRoot::new(path, flags, reconcile);
        if flags.contains(RootFlags::PRIORITY) {
            self.pending_roots.push_front(root);
        } else {
            self.pending_roots.push_back(root);
        }
    }

    /// If the store already tracks more folders than the platform can
    /// watch there is no point installing monitors one by one during
    /// the crawl, it only slows it down. Disable them wholesale and
    /// re-enable after `finished`.
    fn check_disable_monitor(&self) {
        let Some(monitor) = &self.monitor else { return };
        match self.store.folder_count() {
            Ok(count) if count > monitor.limit() as u64 => {
                log::info!(
                    "temporarily disabling monitors until crawling completes \
                     ({count} folders over the {} watch limit)",
                    monitor.limit()
                );
                monitor.set_enabled(false);
            }
            Ok(_) => (),
            Err(err) => log::warn!("could not get folder count: {err}"),
        }
    }

    /// Runs one batch of reconcile work: a cursor batch, an enumerator
    /// batch, a pending-directory pop or a root completion. Returns
    /// false when there is nothing to do (idle, stopped or
    /// high-water). High water is only sampled here, never mid-batch.
    pub fn step(&mut self, tree: &IndexingTree, out: &mut Vec<FileEvent>) -> bool {
        if self.stopped || self.high_water {
            return false;
        }

        let Some(mut root) = self.current.take() else {
            let Some(mut root) = self.pending_roots.pop_front() else {
                return false;
            };
            out.push(FileEvent::DirectoryStarted { path: root.root.clone() });
            root.started = Instant::now();
            match self.store.index_root_content(&file_uri(&root.root)) {
                Ok(rows) => {
                    root.cursor = Some(rows.into());
                    self.current = Some(root);
                }
                Err(err) => {
                    log::error!(
                        "could not query contents for indexed folder {:?}: {err}",
                        root.root
                    );
                    // abort this root and attempt the next one
                    self.maybe_finish(out);
                }
            }
            return true;
        };

        if root.cancelled() {
            // cancelled reconciles free their state without emitting
            // directory-finished for partial progress
            self.maybe_finish(out);
            return true;
        }

        if root.enumerator.is_some() {
            self.enumerate_batch(tree, &mut root, out);
            self.current = Some(root);
        } else if root.cursor.is_some() {
            self.cursor_batch(tree, &mut root, out);
            self.current = Some(root);
        } else if self.crawl_next(tree, &mut root, out) {
            self.current = Some(root);
        } else {
            self.complete_root(root, out);
        }
        true
    }

    fn complete_root(&mut self, root: IndexRoot, out: &mut Vec<FileEvent>) {
        log::debug!(
            "reconciled {:?} in {:.2}s: {} files found, {} ignored, {} updated, {} reindexed",
            root.root,
            root.started.elapsed().as_secs_f64(),
            root.stats.files_found,
            root.stats.files_ignored,
            root.stats.files_updated,
            root.stats.files_reindexed,
        );
        self.totals.merge(&root.stats);
        self.maybe_finish(out);
    }

    fn maybe_finish(&mut self, out: &mut Vec<FileEvent>) {
        if self.pending_roots.is_empty() {
            out.push(FileEvent::Finished);
            if let Some(monitor) = &self.monitor {
                if !monitor.enabled() {
                    log::info!("re-enabling directory monitors");
                    monitor.set_enabled(true);
                }
            }
        }
    }

    fn cursor_batch(&mut self, tree: &IndexingTree, root: &mut IndexRoot, out: &mut Vec<FileEvent>) {
        for _ in 0..CURSOR_BATCH_ITEMS {
            let Some(row) = root.cursor.as_mut().unwrap().pop_front() else {
                break;
            };
            root.cursor_has_content = true;
            self.handle_cursor_row(tree, root, row, out);
        }
        if root.cursor.as_ref().unwrap().is_empty() {
            if !root.cursor_has_content {
                // never indexed before, the query knows nothing about
                // this root; crawl it from scratch
                root.pending_dirs.push_back(root.root.clone());
                root.emit_root_file = !root.reconcile.contains(ReconcileFlags::IGNORE_ROOT_FILE);
            }
            root.cursor = None;
        }
    }

    fn handle_cursor_row(
        &mut self,
        tree: &IndexingTree,
        root: &mut IndexRoot,
        row: StoreRow,
        out: &mut Vec<FileEvent>,
    ) {
        let Some(path) = uri_to_path(&row.uri) else {
            log::debug!("ignoring non-file uri in store: {}", row.uri);
            return;
        };

        // children of a directory already found deleted inherit the
        // deletion, they must not produce events of their own
        if root.deleted_dirs.iter().any(|dir| is_descendant_or_equal(&path, dir)) {
            return;
        }

        let mut data = FileData::default();
        data.stamp_store(&row);
        root.stats.files_found += 1;

        let info = FileInfo::query(&path).ok();
        if let Some(info) = &info {
            let passes = if data.is_dir_in_store {
                self.check_directory_contents(tree, &path)
                    && self.check_directory(tree, &root.root, &path, info)
            } else {
                tree.file_is_indexable(&path, Some(info))
            };
            if passes {
                data.stamp_disk(info);
            }
        }

        let state = data.state(&self.extractors);

        if state == FileState::Delete && (data.is_dir_in_store || data.is_dir_in_disk) {
            root.deleted_dirs.push(path.clone());
        } else if data.is_dir_in_disk
            && ((root.flags.contains(RootFlags::RECURSE)
                && !info.as_ref().is_some_and(|i| i.is_mountpoint))
                || path == root.root)
            && self.check_directory_contents(tree, &path)
        {
            if let Some(monitor) = &self.monitor {
                if root.flags.contains(RootFlags::MONITOR) {
                    monitor.add(&path);
                }
            }
            // every reconcile performs the full three-state comparison,
            // every directory present on disk gets crawled
            root.pending_dirs.push_front(path.clone());
        }

        match state {
            FileState::ExtractorUpdate => root.stats.files_reindexed += 1,
            FileState::None => (),
            _ => root.stats.files_updated += 1,
        }

        notify_state(state, path, info, data.is_dir_in_store, out);
    }

    fn crawl_next(
        &mut self,
        tree: &IndexingTree,
        root: &mut IndexRoot,
        out: &mut Vec<FileEvent>,
    ) -> bool {
        let Some(dir) = root.pending_dirs.pop_front() else {
            return false;
        };
        root.current_dir = Some(dir.clone());

        if let Some(monitor) = &self.monitor {
            if root.flags.contains(RootFlags::MONITOR) {
                monitor.add(&dir);
            }
        }

        if dir == root.root && root.emit_root_file {
            root.emit_root_file = false;
            if let Some(info) = FileInfo::query_quiet(&dir) {
                root.stats.files_found += 1;
                self.handle_file_from_filesystem(tree, root, &dir, &info, out);
            }
        }

        let walk = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter();
        root.enumerator = Some(Enumerator { dir, walk });
        true
    }

    fn enumerate_batch(
        &mut self,
        tree: &IndexingTree,
        root: &mut IndexRoot,
        out: &mut Vec<FileEvent>,
    ) {
        let mut n_entries = 0;
        let mut exhausted = false;
        while n_entries < ENUMERATOR_BATCH_ITEMS {
            let Some(entry) = root.enumerator.as_mut().unwrap().walk.next() else {
                exhausted = true;
                break;
            };
            n_entries += 1;
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    // directories disappearing or turning unreadable
                    // mid-crawl are routine
                    log::debug!("error crawling: {err}");
                    continue;
                }
            };
            let path = entry.path();

            // updated and deleted files were already handled through
            // the store cursor, only files new to the store are left
            match self.store.file_exists(&file_uri(path)) {
                Ok(true) => continue,
                Ok(false) => (),
                Err(err) => log::error!("could not check {path:?} against the store: {err}"),
            }

            root.stats.files_found += 1;

            let Some(info) = FileInfo::query_quiet(path) else {
                continue;
            };
            if info.file_type == FileType::Other {
                root.stats.files_ignored += 1;
                continue;
            }
            let passes = if info.is_dir() {
                self.check_directory(tree, &root.root, path, &info)
            } else {
                tree.file_is_indexable(path, Some(&info))
            };
            if !passes {
                root.stats.files_ignored += 1;
                continue;
            }

            self.handle_file_from_filesystem(tree, root, path, &info, out);
        }

        if exhausted {
            let dir = root.enumerator.take().unwrap().dir;
            self.close_folder(root, dir, out);
        }
    }

    /// Post-order directory-finished delivery: a directory is finished
    /// once no descendant of it is still pending crawl. The pending
    /// queue is depth first, so checking the head suffices.
    fn close_folder(&mut self, root: &mut IndexRoot, dir: PathBuf, out: &mut Vec<FileEvent>) {
        root.pending_finish.push_front(dir);
        loop {
            let Some(head) = root.pending_finish.front() else { break };
            if root
                .pending_dirs
                .front()
                .is_some_and(|next| is_direct_child(next, head))
            {
                break;
            }
            let head = root.pending_finish.pop_front().unwrap();
            out.push(FileEvent::DirectoryFinished { path: head });
        }
    }

    fn handle_file_from_filesystem(
        &mut self,
        tree: &IndexingTree,
        root: &mut IndexRoot,
        path: &Path,
        info: &FileInfo,
        out: &mut Vec<FileEvent>,
    ) {
        let mut data = FileData::default();
        data.stamp_disk(info);
        let state = data.state(&self.extractors);

        if info.is_dir()
            && state == FileState::Create
            && root.flags.contains(RootFlags::RECURSE)
            && root.current_dir.as_deref() != Some(path)
            && self.check_directory_contents(tree, path)
            && !info.is_mountpoint
        {
            root.pending_dirs.push_front(path.to_owned());
        }

        match state {
            FileState::ExtractorUpdate => root.stats.files_reindexed += 1,
            FileState::None => (),
            _ => root.stats.files_updated += 1,
        }

        notify_state(state, path.to_owned(), Some(info.clone()), data.is_dir_in_store, out);
    }

    // content filters never disqualify a configured root: if the folder
    // is configured for indexing it is clearly not undesired
    fn check_directory_contents(&self, tree: &IndexingTree, parent: &Path) -> bool {
        let process = tree.file_is_root(parent) || tree.parent_is_indexable(parent);
        if !process {
            if let Some(monitor) = &self.monitor {
                monitor.remove(parent);
            }
        }
        process
    }

    // config roots other than the one being processed are bypassed
    // here, their own reconcile will visit them
    fn check_directory(
        &self,
        tree: &IndexingTree,
        current_root: &Path,
        dir: &Path,
        info: &FileInfo,
    ) -> bool {
        if tree.file_is_root(dir) && dir != current_root {
            return false;
        }
        tree.file_is_indexable(dir, Some(info))
    }

    fn current_root_remove_directory(&mut self, dir: &Path) {
        if let Some(root) = &mut self.current {
            root.remove_directory(dir);
        }
    }

    /// Translates a raw monitor event into logical events, per the
    /// live-dispatch rules.
    pub fn handle_monitor_event(
        &mut self,
        tree: &IndexingTree,
        event: MonitorEvent,
        out: &mut Vec<FileEvent>,
    ) {
        match event {
            MonitorEvent::ItemCreated { path, is_dir } => {
                self.monitor_created(tree, path, is_dir, out)
            }
            MonitorEvent::ItemUpdated { path, is_dir: _ } => {
                if tree.file_is_indexable(&path, None) {
                    out.push(FileEvent::Updated { path, info: None, attributes_only: false });
                }
            }
            MonitorEvent::ItemAttributeUpdated { path, is_dir: _ } => {
                if tree.file_is_indexable(&path, None) {
                    out.push(FileEvent::Updated { path, info: None, attributes_only: true });
                }
            }
            MonitorEvent::ItemDeleted { path, is_dir } => {
                self.monitor_deleted(tree, path, is_dir, out)
            }
            MonitorEvent::ItemMoved { source, dest, is_dir, source_monitored } => {
                self.monitor_moved(tree, source, dest, is_dir, source_monitored, out)
            }
            MonitorEvent::Overflow => {
                log::warn!("monitor event queue overflowed, reconciling every root");
                let roots: Vec<_> =
                    tree.list_roots().map(|(path, flags)| (path.to_owned(), flags)).collect();
                for (path, flags) in roots {
                    self.queue_root(path, flags, ReconcileFlags::empty());
                }
            }
        }
    }

    fn monitor_created(
        &mut self,
        tree: &IndexingTree,
        path: PathBuf,
        is_dir: bool,
        out: &mut Vec<FileEvent>,
    ) {
        let indexable = tree.file_is_indexable(&path, None);

        if !is_dir {
            if let Some(parent) = path.parent() {
                if !tree.parent_is_indexable(parent) {
                    // the new file triggered a directory content
                    // filter, the whole parent drops out of the index
                    out.push(FileEvent::Deleted { path: parent.to_owned(), is_dir: true });
                    self.current_root_remove_directory(parent);
                    if let Some(monitor) = &self.monitor {
                        monitor.remove_recursively(parent);
                    }
                    return;
                }
            }
            if !indexable {
                return;
            }
        } else {
            if !indexable {
                return;
            }
            let flags = tree.get_root(&path).map(|(_, flags)| flags).unwrap_or(RootFlags::empty());
            if flags.contains(RootFlags::RECURSE) {
                // crawl the new subtree; fall through so file-created
                // for the directory itself precedes any monitor events
                // from inside it
                self.queue_root(path.clone(), flags, ReconcileFlags::IGNORE_ROOT_FILE);
            }
        }

        out.push(FileEvent::Created { path, info: None });
    }

    fn monitor_deleted(
        &mut self,
        tree: &IndexingTree,
        path: PathBuf,
        mut is_dir: bool,
        out: &mut Vec<FileEvent>,
    ) {
        if let Some(monitor) = &self.monitor {
            if is_dir && tree.file_is_root(&path) {
                monitor.remove_children_recursively(&path);
            } else if is_dir {
                monitor.remove_recursively(&path);
            }
        }

        if !is_dir {
            // the monitor only knows about folders it watches, the
            // store knows what the deleted path used to be
            match self.store.file_mimetype(&file_uri(&path)) {
                Ok(Some(mimetype)) => is_dir = mimetype == "inode/directory",
                Ok(None) => (),
                Err(err) => log::debug!("could not query mimetype of {path:?}: {err}"),
            }
        }

        if !tree.file_is_indexable(&path, None) {
            return;
        }

        out.push(FileEvent::Deleted { path: path.clone(), is_dir });
        self.current_root_remove_directory(&path);
    }

    fn monitor_moved(
        &mut self,
        tree: &IndexingTree,
        source: PathBuf,
        dest: PathBuf,
        is_dir: bool,
        source_monitored: bool,
        out: &mut Vec<FileEvent>,
    ) {
        let dest_flags = tree.get_root(&dest).map(|(_, flags)| flags).unwrap_or(RootFlags::empty());

        if !source_monitored {
            if is_dir {
                if let Some(monitor) = &self.monitor {
                    monitor.remove_recursively(&source);
                }
                self.queue_root(dest, dest_flags, ReconcileFlags::empty());
            }
            // plain files surface through the destination monitor
            return;
        }

        let source_info = FileInfo::shallow(&source, is_dir);
        let dest_info = FileInfo::shallow(&dest, is_dir);
        let should_process = tree.file_is_indexable(&source, Some(&source_info));
        let should_process_other = tree.file_is_indexable(&dest, Some(&dest_info));

        if !should_process {
            // source wasn't indexable; the destination may be, index it
            // as if it were new
            if let Some(monitor) = &self.monitor {
                if is_dir {
                    monitor.remove_recursively(&source);
                }
            }
            if should_process_other {
                if is_dir && dest_flags.contains(RootFlags::RECURSE) {
                    self.queue_root(dest, dest_flags, ReconcileFlags::empty());
                } else {
                    // emit created only when the uri is new to the store
                    let known = self.store.file_exists(&file_uri(&dest)).unwrap_or(false);
                    if known {
                        out.push(FileEvent::Updated {
                            path: dest,
                            info: None,
                            attributes_only: false,
                        });
                    } else {
                        out.push(FileEvent::Created { path: dest, info: None });
                    }
                }
            }
        } else if !should_process_other {
            // moved out of the indexed universe
            if let Some(monitor) = &self.monitor {
                if is_dir {
                    monitor.remove_recursively(&source);
                }
            }
            out.push(FileEvent::Deleted { path: source.clone(), is_dir });
            self.current_root_remove_directory(&source);
        } else {
            if is_dir {
                if let Some(monitor) = &self.monitor {
                    monitor.rename(&source, &dest);
                }
                let source_flags =
                    tree.get_root(&source).map(|(_, flags)| flags).unwrap_or(RootFlags::empty());
                let source_recursive = source_flags.contains(RootFlags::RECURSE);
                let dest_recursive = dest_flags.contains(RootFlags::RECURSE);
                if source_recursive && !dest_recursive {
                    // the miner resolves this via remove_children on
                    // the source, nothing to synthesize here
                } else if !source_recursive && dest_recursive {
                    self.queue_root(dest.clone(), dest_flags, ReconcileFlags::IGNORE_ROOT_FILE);
                }
            } else {
                // possibly a replace, delete any pre-existing dest
                out.push(FileEvent::Deleted { path: dest.clone(), is_dir });
            }

            out.push(FileEvent::Moved {
                source: source.clone(),
                dest: dest.clone(),
                is_dir,
            });

            // a different extension means a different mimetype and
            // therefore different extractor work
            if extension_changed(&source, &dest) {
                out.push(FileEvent::Updated { path: dest, info: None, attributes_only: false });
            }
        }
    }

    /// Reacts to indexing-tree mutations.
    pub fn handle_tree_event(
        &mut self,
        tree: &IndexingTree,
        event: &TreeEvent,
        out: &mut Vec<FileEvent>,
    ) {
        match event {
            TreeEvent::DirectoryAdded(path) | TreeEvent::DirectoryUpdated(path) => {
                let flags =
                    tree.get_root(path).map(|(_, flags)| flags).unwrap_or(RootFlags::empty());
                self.queue_root(path.clone(), flags, ReconcileFlags::empty());
            }
            TreeEvent::ChildUpdated { child, .. } => {
                let info = FileInfo::query_quiet(child);
                let flags =
                    tree.get_root(child).map(|(_, flags)| flags).unwrap_or(RootFlags::empty());
                if info.as_ref().is_some_and(|i| i.is_dir())
                    && flags.contains(RootFlags::RECURSE)
                {
                    self.queue_root(child.clone(), flags, ReconcileFlags::empty());
                } else if tree.file_is_indexable(child, info.as_ref()) {
                    out.push(FileEvent::Updated {
                        path: child.clone(),
                        info,
                        attributes_only: false,
                    });
                }
            }
            TreeEvent::DirectoryRemoved { path, flags } => {
                if !flags.contains(RootFlags::PRESERVE) {
                    out.push(FileEvent::Deleted { path: path.clone(), is_dir: true });
                }
                self.pending_roots.retain(|root| root.root != *path);
                if let Some(root) = &self.current {
                    if root.root == *path {
                        // prompt at the next batch boundary; partial
                        // progress emits no directory-finished
                        root.cancel.store(true, atomic::Ordering::Relaxed);
                    }
                }
                if let Some(monitor) = &self.monitor {
                    monitor.remove_recursively(path);
                }
            }
        }
    }
}
