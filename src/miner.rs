use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use lru::LruCache;

use crate::buffer::SparqlBuffer;
use crate::events::{FileEvent, MinerEvent};
use crate::extract::{guess_mimetype, ExtractorRegistry};
use crate::file_info::FileInfo;
use crate::notifier::{FileNotifier, NotifierStats};
use crate::path::{basename, file_uri, is_descendant_or_equal};
use crate::queue::{EventQueue, QueueEvent, QueueEventKind};
use crate::report::ErrorReports;
use crate::store::{FileResource, StoreError};
use crate::tree::{IndexingTree, RootFlags, TreeEvent};

/// Events dispatched per scheduler tick.
pub const MAX_SIMULTANEOUS_ITEMS: usize = 64;
/// Cached path → content-identifier entries.
pub const URN_LRU_SIZE: usize = 100;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// The overridable part of the miner: every dispatched event lands in
/// one of these hooks, which render SPARQL into the buffer.
pub trait MinerDelegate: Send {
    fn process_file(&mut self, ctx: &mut MinerContext<'_>, file: &Path, info: &FileInfo, created: bool);
    fn process_file_attributes(&mut self, ctx: &mut MinerContext<'_>, file: &Path, info: &FileInfo);
    fn remove_file(&mut self, ctx: &mut MinerContext<'_>, file: &Path, is_dir: bool);
    fn remove_children(&mut self, ctx: &mut MinerContext<'_>, file: &Path);
    fn move_file(&mut self, ctx: &mut MinerContext<'_>, dest: &Path, source: &Path, recursive: bool);
    fn finish_directory(&mut self, ctx: &mut MinerContext<'_>, folder: &Path);
    /// Stable identifier for the content of `file`, independent of its
    /// current name.
    fn get_content_identifier(&mut self, file: &Path, info: &FileInfo) -> String;
}

/// What a delegate gets to work with while handling one event.
pub struct MinerContext<'a> {
    pub tree: &'a IndexingTree,
    pub buffer: &'a mut SparqlBuffer,
    urn_lru: &'a mut LruCache<PathBuf, String>,
}

impl MinerContext<'_> {
    /// Cached content identifier for `file`, avoiding repeated work
    /// during bursts on the same directory.
    pub fn cached_identifier(&mut self, file: &Path) -> Option<String> {
        self.urn_lru.get(file).cloned()
    }

    pub fn cache_identifier(&mut self, file: &Path, urn: String) {
        self.urn_lru.put(file.to_owned(), urn);
    }
}

/// Event queue, coalescer and scheduler: consumes the notifier's
/// logical events, applies priority and backpressure and drives the
/// delegate hooks which fill the [`SparqlBuffer`].
pub struct MinerFs {
    queue: EventQueue,
    buffer: SparqlBuffer,
    delegate: Box<dyn MinerDelegate>,
    urn_lru: LruCache<PathBuf, String>,
    reports: ErrorReports,
    /// pending event counts per root, for finished-root notifications
    roots_to_notify: HashMap<PathBuf, u64>,
    flushing: bool,
    queue_armed: bool,
    paused: bool,
    throttle: f64,
    started: Option<Instant>,
    last_status: Option<Instant>,
    changes_processed: u32,
    errors: u32,
}

impl MinerFs {
    pub fn new(
        buffer: SparqlBuffer,
        delegate: Box<dyn MinerDelegate>,
        reports: ErrorReports,
    ) -> MinerFs {
        MinerFs {
            queue: EventQueue::new(),
            buffer,
            delegate,
            urn_lru: LruCache::new(NonZeroUsize::new(URN_LRU_SIZE).unwrap()),
            reports,
            roots_to_notify: HashMap::new(),
            flushing: false,
            queue_armed: false,
            paused: false,
            throttle: 0.0,
            started: None,
            last_status: None,
            changes_processed: 0,
            errors: 0,
        }
    }

    pub fn set_throttle(&mut self, throttle: f64) {
        self.throttle = throttle.clamp(0.0, 1.0);
    }

    pub fn throttle(&self) -> f64 {
        self.throttle
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        if !paused {
            self.queue_armed = true;
        }
    }

    /// True while the event queue holds more than two batches worth of
    /// work; the notifier pauses between batches until it clears.
    pub fn high_water(&self) -> bool {
        self.queue.len() > 2 * self.buffer.limit()
    }

    /// Wether a dispatch tick would do anything right now.
    pub fn wants_tick(&self) -> bool {
        self.queue_armed && !self.paused && !self.buffer.limit_reached()
    }

    fn bump_root(&mut self, root: &Option<PathBuf>, delta: i64) {
        if let Some(root) = root {
            let count = self.roots_to_notify.entry(root.clone()).or_insert(0);
            *count = count.saturating_add_signed(delta);
        }
    }

    fn settle_dropped(&mut self, dropped: Vec<QueueEvent>) {
        for event in dropped {
            self.bump_root(&event.root.clone(), -1);
        }
    }

    /// Feeds one logical event from the notifier into the queue.
    pub fn handle_file_event(
        &mut self,
        tree: &IndexingTree,
        event: FileEvent,
        out: &mut Vec<MinerEvent>,
    ) {
        match event {
            FileEvent::Created { path, info } => {
                let mut queued = QueueEvent::new(QueueEventKind::Created, path);
                queued.is_dir = info.as_ref().is_some_and(|i| i.is_dir());
                queued.info = info;
                self.queue_event(tree, queued);
            }
            FileEvent::Updated { path, info, attributes_only } => {
                let mut queued = QueueEvent::new(QueueEventKind::Updated, path);
                queued.is_dir = info.as_ref().is_some_and(|i| i.is_dir());
                queued.attributes_update = attributes_only;
                queued.info = info;
                self.queue_event(tree, queued);
            }
            FileEvent::Deleted { path, is_dir } => {
                let mut queued = QueueEvent::new(QueueEventKind::Deleted, path);
                queued.is_dir = is_dir;
                self.queue_event(tree, queued);
            }
            FileEvent::Moved { source, dest, is_dir } => {
                self.queue_event(tree, QueueEvent::moved(source, dest, is_dir));
            }
            FileEvent::DirectoryStarted { path } => {
                let recursive = tree
                    .get_root(&path)
                    .is_some_and(|(_, flags)| flags.contains(RootFlags::RECURSE));
                let status = if recursive {
                    format!("Crawling recursively directory '{}'", file_uri(&path))
                } else {
                    format!("Crawling single directory '{}'", file_uri(&path))
                };
                if let Some((root, _)) = tree.get_root(&path) {
                    self.roots_to_notify.entry(root.to_owned()).or_insert(0);
                }
                out.push(MinerEvent::Status { status, progress: 0.01, remaining_time: None });
            }
            FileEvent::DirectoryFinished { path } => {
                self.queue_event(tree, QueueEvent::new(QueueEventKind::FinishDirectory, path));
            }
            FileEvent::Finished => {
                self.queue_armed = true;
            }
        }
    }

    fn queue_event(&mut self, tree: &IndexingTree, mut event: QueueEvent) {
        let subject = event.dest_path.as_deref().unwrap_or(&event.path);
        let mut priority = false;
        if let Some((root, flags)) = tree.get_root(subject) {
            event.root = Some(root.to_owned());
            priority = flags.contains(RootFlags::PRIORITY);
        }

        let mut dropped = Vec::new();
        if let Some(root) = self.queue.push(event, priority, &mut dropped) {
            self.bump_root(&root, 1);
        }
        self.settle_dropped(dropped);
        self.queue_armed = true;
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Sweeps queued events under a removed directory.
    pub fn handle_tree_event(&mut self, event: &TreeEvent) {
        if let TreeEvent::DirectoryRemoved { path, .. } = event {
            let mut dropped = Vec::new();
            self.queue.remove_descendants(path, &mut dropped);
            self.settle_dropped(dropped);
        }
    }

    fn maybe_update_status(&mut self, notifier: &FileNotifier, out: &mut Vec<MinerEvent>) {
        let due = self
            .last_status
            .is_none_or(|last| last.elapsed() >= STATUS_INTERVAL);
        if !due || notifier.is_active() {
            return;
        }
        self.last_status = Some(Instant::now());

        let remaining = self.queue.len() as u32;
        let processed = self.changes_processed;
        let total = processed + remaining;
        let progress = if total == 0 || remaining == 0 {
            1.0
        } else {
            f64::from(processed) / f64::from(total)
        };
        let remaining_time = self.started.and_then(|started| {
            (processed > 0).then(|| {
                let per_item = started.elapsed().as_secs_f64() / f64::from(processed);
                (per_item * f64::from(remaining)) as u64
            })
        });
        out.push(MinerEvent::Status {
            status: "Processing…".to_owned(),
            progress: progress.clamp(0.02, 1.0),
            remaining_time,
        });
    }

    /// One scheduler tick: dispatches up to [`MAX_SIMULTANEOUS_ITEMS`]
    /// events through the delegate. Returns false once the handler
    /// should disarm (queue drained, flush pending, or paused).
    pub fn dispatch_tick(
        &mut self,
        tree: &IndexingTree,
        notifier: &FileNotifier,
        out: &mut Vec<MinerEvent>,
    ) -> bool {
        if !self.wants_tick() {
            return false;
        }
        for _ in 0..MAX_SIMULTANEOUS_ITEMS {
            if !self.handle_next_item(tree, notifier, out) {
                self.queue_armed = false;
                return false;
            }
        }
        true
    }

    fn handle_next_item(
        &mut self,
        tree: &IndexingTree,
        notifier: &FileNotifier,
        out: &mut Vec<MinerEvent>,
    ) -> bool {
        self.maybe_update_status(notifier, out);

        let Some(event) = self.queue.pop() else {
            if !notifier.is_active() {
                if !self.flushing && self.buffer.task_count() == 0 {
                    self.process_stop(notifier.stats(), out);
                } else {
                    if self.buffer.flush("queue handlers none") {
                        self.flushing = true;
                    }
                    self.notify_roots_finished(out);
                }
            }
            return false;
        };

        self.changes_processed += 1;
        self.bump_root(&event.root.clone(), -1);
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }

        match event.kind {
            QueueEventKind::Created => {
                self.item_add_or_update(tree, &event.path, event.info, false, true)
            }
            QueueEventKind::Updated => self.item_add_or_update(
                tree,
                &event.path,
                event.info,
                event.attributes_update,
                false,
            ),
            QueueEventKind::Deleted => self.item_remove(tree, &event.path, event.is_dir, false),
            QueueEventKind::Moved => {
                let dest = event.dest_path.clone().unwrap();
                self.item_move(tree, &dest, &event.path, event.is_dir);
            }
            QueueEventKind::FinishDirectory => {
                let mut ctx = MinerContext {
                    tree,
                    buffer: &mut self.buffer,
                    urn_lru: &mut self.urn_lru,
                };
                self.delegate.finish_directory(&mut ctx, &event.path);
            }
        }

        let mut keep_processing = true;
        if self.buffer.limit_reached() {
            if self.buffer.flush("buffer limit reached") {
                self.flushing = true;
            } else {
                // a flush is already in flight, wait for it
                keep_processing = false;
            }
            self.notify_roots_finished(out);
        }
        keep_processing
    }

    fn item_add_or_update(
        &mut self,
        tree: &IndexingTree,
        file: &Path,
        info: Option<FileInfo>,
        attributes_update: bool,
        created: bool,
    ) {
        let Some(info) = info.or_else(|| FileInfo::query_quiet(file)) else {
            return;
        };
        let mut ctx = MinerContext { tree, buffer: &mut self.buffer, urn_lru: &mut self.urn_lru };
        if attributes_update {
            log::debug!("processing attributes of {file:?}");
            self.delegate.process_file_attributes(&mut ctx, file, &info);
        } else {
            log::debug!("processing {file:?}");
            self.delegate.process_file(&mut ctx, file, &info, created);
        }
    }

    fn invalidate_urns(&mut self, prefix: &Path) {
        let doomed: Vec<PathBuf> = self
            .urn_lru
            .iter()
            .map(|(path, _)| path.clone())
            .filter(|path| is_descendant_or_equal(path, prefix))
            .collect();
        for path in doomed {
            self.urn_lru.pop(&path);
        }
    }

    fn item_remove(&mut self, tree: &IndexingTree, file: &Path, is_dir: bool, only_children: bool) {
        log::debug!("removing {file:?} (deleted or no longer indexable)");
        self.invalidate_urns(file);
        let mut ctx = MinerContext { tree, buffer: &mut self.buffer, urn_lru: &mut self.urn_lru };
        if only_children {
            self.delegate.remove_children(&mut ctx, file);
        } else {
            self.delegate.remove_file(&mut ctx, file, is_dir);
        }
    }

    fn item_move(&mut self, tree: &IndexingTree, dest: &Path, source: &Path, is_dir: bool) {
        log::debug!("moving {source:?} to {dest:?}");
        self.invalidate_urns(source);

        let source_flags =
            tree.get_root(source).map(|(_, flags)| flags).unwrap_or(RootFlags::empty());
        let dest_flags = tree.get_root(dest).map(|(_, flags)| flags).unwrap_or(RootFlags::empty());
        let recursive = is_dir
            && source_flags.contains(RootFlags::RECURSE)
            && dest_flags.contains(RootFlags::RECURSE);

        // moving out of a recursive tree into a non-recursive one drops
        // the children from the index
        if !recursive && source_flags.contains(RootFlags::RECURSE) {
            self.item_remove(tree, source, is_dir, true);
        }

        let mut ctx = MinerContext { tree, buffer: &mut self.buffer, urn_lru: &mut self.urn_lru };
        self.delegate.move_file(&mut ctx, dest, source, recursive);
    }

    fn notify_roots_finished(&mut self, out: &mut Vec<MinerEvent>) {
        let finished: Vec<PathBuf> = self
            .roots_to_notify
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(root, _)| root.clone())
            .collect();
        for root in finished {
            self.roots_to_notify.remove(&root);
            out.push(MinerEvent::FinishedRoot(root));
        }
    }

    fn process_stop(&mut self, stats: NotifierStats, out: &mut Vec<MinerEvent>) {
        let elapsed = self.started.take().map(|t| t.elapsed()).unwrap_or_default();
        log::info!(
            "idle after {:.2}s: {} files found ({} ignored), {} changes processed ({} errors)",
            elapsed.as_secs_f64(),
            stats.files_found,
            stats.files_ignored,
            self.changes_processed,
            self.errors,
        );

        out.push(MinerEvent::Status {
            status: "Idle".to_owned(),
            progress: 1.0,
            remaining_time: Some(0),
        });

        // every root must be signalled before the main finished signal
        self.notify_roots_finished(out);
        out.push(MinerEvent::Finished {
            elapsed,
            files_found: stats.files_found,
            files_ignored: stats.files_ignored,
            files_updated: stats.files_updated,
            files_reindexed: stats.files_reindexed,
            changes_processed: self.changes_processed,
        });

        self.changes_processed = 0;
        self.errors = 0;
    }

    /// Routes the completion of a buffer flush: error reports per task,
    /// corrupt/no-space signals, and re-arming of the queue handler.
    pub fn on_flush_done(&mut self, result: Result<(), StoreError>, out: &mut Vec<MinerEvent>) {
        let tasks = self.buffer.flush_done(&result);
        self.flushing = false;

        match &result {
            Err(StoreError::Corrupt) => {
                out.push(MinerEvent::Corrupt);
                self.paused = true;
                return;
            }
            Err(StoreError::NoSpace) => {
                out.push(MinerEvent::NoSpace);
                self.paused = true;
                return;
            }
            Err(err) => {
                for task in &tasks {
                    self.reports.report(&task.path, &err.to_string(), &task.sparql);
                    self.errors += 1;
                }
            }
            Ok(()) => {
                for task in &tasks {
                    self.reports.delete(&task.path);
                }
            }
        }

        if self.buffer.limit_reached() {
            if self.buffer.flush("buffer still full after flush") {
                self.flushing = true;
            }
            self.notify_roots_finished(out);
        }
        self.queue_armed = true;
    }
}

/// The stock delegate: renders file and folder resources the way the
/// filesystem ontology expects and pairs deletions and moves with their
/// content statements.
pub struct FsDelegate {
    extractors: Arc<ExtractorRegistry>,
}

impl FsDelegate {
    pub fn new(extractors: Arc<ExtractorRegistry>) -> FsDelegate {
        FsDelegate { extractors }
    }

    fn build_resource(
        &mut self,
        ctx: &mut MinerContext<'_>,
        file: &Path,
        info: &FileInfo,
    ) -> FileResource {
        let uri = file_uri(file);
        let mimetype = guess_mimetype(file, info.is_dir());
        let extractor_hash = self.extractors.hash_for(&mimetype);
        let data_source = ctx.tree.get_root(file).map(|(root, _)| file_uri(root));
        let parent_uri = file.parent().map(file_uri);
        let folder_urn = info.is_dir().then(|| match ctx.cached_identifier(file) {
            Some(urn) => urn,
            None => {
                let urn = self.get_content_identifier(file, info);
                ctx.cache_identifier(file, urn.clone());
                urn
            }
        });
        FileResource {
            uri,
            filename: basename(file).to_string_lossy().into_owned(),
            modified: info.mtime,
            mimetype: Some(mimetype),
            extractor_hash,
            data_source,
            parent_uri,
            folder_urn,
        }
    }

    // plain text files on the allowlist get their content mirrored
    // into the documents graph for the extractor
    fn content_graph(ctx: &MinerContext<'_>, file: &Path, info: &FileInfo) -> Option<String> {
        (!info.is_dir() && ctx.tree.file_has_allowed_text_extension(file))
            .then(|| "tracker:Documents".to_owned())
    }
}

impl MinerDelegate for FsDelegate {
    fn process_file(
        &mut self,
        ctx: &mut MinerContext<'_>,
        file: &Path,
        info: &FileInfo,
        _created: bool,
    ) {
        let resource = self.build_resource(ctx, file, info);
        if info.is_dir() {
            let is_root = ctx.tree.file_is_root(file);
            ctx.buffer.log_folder(file, is_root, resource.clone(), resource);
        } else {
            let content =
                FsDelegate::content_graph(ctx, file, info).map(|graph| (graph, resource.clone()));
            ctx.buffer.log_file(file, resource, content);
        }
    }

    fn process_file_attributes(
        &mut self,
        ctx: &mut MinerContext<'_>,
        file: &Path,
        info: &FileInfo,
    ) {
        let resource = self.build_resource(ctx, file, info);
        ctx.buffer.log_attributes_update(file, resource, None);
    }

    fn remove_file(&mut self, ctx: &mut MinerContext<'_>, file: &Path, is_dir: bool) {
        if is_dir {
            ctx.buffer.log_delete_content(file);
        }
        ctx.buffer.log_delete(file);
    }

    fn remove_children(&mut self, ctx: &mut MinerContext<'_>, file: &Path) {
        ctx.buffer.log_delete_content(file);
    }

    fn move_file(
        &mut self,
        ctx: &mut MinerContext<'_>,
        dest: &Path,
        source: &Path,
        recursive: bool,
    ) {
        let data_source = ctx.tree.get_root(dest).map(|(root, _)| file_uri(root));
        ctx.buffer.log_move(source, dest, data_source.as_deref().unwrap_or_default());
        if recursive {
            ctx.buffer.log_move_content(source, dest);
        }
    }

    fn finish_directory(&mut self, ctx: &mut MinerContext<'_>, folder: &Path) {
        // the folder was written when it was discovered; re-stamp its
        // attributes now that its contents have settled
        let Some(info) = FileInfo::query_quiet(folder) else { return };
        let resource = self.build_resource(ctx, folder, &info);
        ctx.buffer.log_attributes_update(folder, resource, None);
    }

    fn get_content_identifier(&mut self, _file: &Path, info: &FileInfo) -> String {
        format!("urn:fileid:{:x}-{:x}", info.device, info.inode)
    }
}
