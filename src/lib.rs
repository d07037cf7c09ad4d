//! Core of a local-filesystem search indexer: discovers files under
//! configured roots, reconciles the filesystem against an RDF store and
//! emits the insert/update/delete/move stream keeping the store in
//! sync, with event coalescing and backpressure between the crawler and
//! the store writer.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use crate::events::{ControlMsg, Msg};
use crate::miner::MinerFs;
use crate::worker::Worker;

mod buffer;
mod controller;
mod events;
mod extract;
mod file_info;
mod filter;
mod miner;
mod monitor;
mod notifier;
mod path;
mod queue;
mod report;
mod store;
#[cfg(test)]
mod tests;
mod tree;
mod worker;

pub use buffer::{SparqlBuffer, Task, BUFFER_LIMIT};
pub use controller::{Controller, IndexerConfig};
pub use events::{MinerEvent, MonitorEvent};
pub use extract::ExtractorRegistry;
pub use file_info::{FileInfo, FileType};
pub use filter::{ConfigSnapshot, FilterKind};
pub use miner::{FsDelegate, MinerContext, MinerDelegate, MAX_SIMULTANEOUS_ITEMS, URN_LRU_SIZE};
pub use monitor::Monitor;
pub use notifier::NotifierStats;
pub use queue::BIG_QUEUE_THRESHOLD;
pub use report::{ErrorReport, ErrorReports};
pub use store::{
    FileResource, MemoryStore, Store, StoreError, StoreHandle, StoreRow, Update,
    FILESYSTEM_GRAPH,
};
pub use tree::{IndexingTree, RootFlags, TreeEvent};

use events::{Mailbox, MinerHandler};

/// Sentinel file the application writes into the store directory when
/// the previous run detected corruption; the next run backs the store
/// up and reindexes from scratch.
pub const CORRUPTION_SENTINEL: &str = ".localsearch.corrupted";

pub fn mark_store_corrupted(store_dir: &Path) -> io::Result<()> {
    std::fs::write(store_dir.join(CORRUPTION_SENTINEL), b"")
}

/// Checks and clears the corruption sentinel. Returns true when the
/// previous run flagged the store.
pub fn take_store_corrupted(store_dir: &Path) -> bool {
    let sentinel = store_dir.join(CORRUPTION_SENTINEL);
    if sentinel.symlink_metadata().is_ok() {
        let _ = std::fs::remove_file(sentinel);
        true
    } else {
        false
    }
}

pub(crate) struct SharedState {
    handlers: Mutex<Vec<MinerHandler>>,
}

impl SharedState {
    pub(crate) fn emit(&self, events: &mut Vec<MinerEvent>) {
        let mut handlers = self.handlers.lock().unwrap();
        for event in events.drain(..) {
            handlers.retain_mut(|handler| handler(&event));
        }
    }
}

/// Construction options for [`Indexer`].
pub struct Options {
    /// install a live filesystem monitor (disable for one-shot runs)
    pub monitor: bool,
    /// soft limit of buffered store tasks before a flush
    pub buffer_limit: usize,
    /// where failed-file reports are persisted; None disables them
    pub error_report_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Options {
        Options { monitor: true, buffer_limit: BUFFER_LIMIT, error_report_dir: None }
    }
}

/// The public handle onto the indexer pipeline. All state is owned by a
/// worker thread; the handle sends control messages and registers
/// signal handlers. Cloning yields another handle onto the same
/// pipeline.
#[derive(Clone)]
pub struct Indexer {
    state: Arc<SharedState>,
    mailbox: Arc<Mailbox>,
    monitor: Option<Monitor>,
    store: StoreHandle,
    extractors: Arc<ExtractorRegistry>,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer").finish_non_exhaustive()
    }
}

pub struct ShutdownOnDrop {
    indexer: Weak<SharedState>,
    mailbox: Arc<Mailbox>,
    monitor: Option<Monitor>,
    store: StoreHandle,
}

impl ShutdownOnDrop {
    pub fn cancel(&mut self) {
        self.indexer = Weak::new();
    }
}

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        if self.indexer.upgrade().is_some() {
            self.mailbox.push(Msg::Control(ControlMsg::Shutdown));
            if let Some(monitor) = &self.monitor {
                monitor.shutdown();
            }
            self.store.shutdown();
        }
    }
}

impl Indexer {
    /// Builds the pipeline with the stock delegate and default options.
    pub fn new(store: impl Store) -> io::Result<Indexer> {
        let extractors = Arc::new(ExtractorRegistry::new());
        let delegate = Box::new(FsDelegate::new(extractors.clone()));
        Indexer::with_delegate(store, delegate, extractors, Options::default())
    }

    pub fn with_options(store: impl Store, options: Options) -> io::Result<Indexer> {
        let extractors = Arc::new(ExtractorRegistry::new());
        let delegate = Box::new(FsDelegate::new(extractors.clone()));
        Indexer::with_delegate(store, delegate, extractors, options)
    }

    /// Full-control constructor: a custom delegate implements the
    /// `process_file`/`remove_file`/`move_file`/`finish_directory`
    /// hooks itself.
    pub fn with_delegate(
        store: impl Store,
        delegate: Box<dyn MinerDelegate>,
        extractors: Arc<ExtractorRegistry>,
        options: Options,
    ) -> io::Result<Indexer> {
        let mailbox = Arc::new(Mailbox::default());
        let store = StoreHandle::spawn(store, mailbox.clone());
        let monitor = if options.monitor { Some(Monitor::new(mailbox.clone())?) } else { None };
        let state = Arc::new(SharedState { handlers: Mutex::new(Vec::new()) });

        let tree = IndexingTree::new();
        let notifier =
            notifier::FileNotifier::new(store.clone(), monitor.clone(), extractors.clone());
        let buffer = SparqlBuffer::new(store.clone(), options.buffer_limit);
        let reports = ErrorReports::new(options.error_report_dir);
        let miner = MinerFs::new(buffer, delegate, reports);

        let worker = Worker::new(
            tree,
            notifier,
            miner,
            extractors.clone(),
            mailbox.clone(),
            state.clone(),
        );
        std::thread::spawn(move || worker.run());

        Ok(Indexer { state, mailbox, monitor, store, extractors })
    }

    fn control(&self, msg: ControlMsg) {
        self.mailbox.push(Msg::Control(msg));
    }

    /// Registers `path` for indexing. The path must exist; it is
    /// canonicalized before becoming the root's identity.
    pub fn add_root(&self, path: &Path, flags: RootFlags) -> io::Result<()> {
        let path = path.canonicalize()?;
        self.control(ControlMsg::AddRoot { path, flags });
        Ok(())
    }

    /// Like [`Indexer::add_root`] but takes the path as-is; used by the
    /// controller where mount points may already be gone.
    pub fn add_root_unchecked(&self, path: &Path, flags: RootFlags) {
        self.control(ControlMsg::AddRoot { path: path.to_owned(), flags });
    }

    pub fn remove_root(&self, path: &Path) {
        self.control(ControlMsg::RemoveRoot { path: path.to_owned() });
    }

    pub fn add_filter(&self, kind: FilterKind, pattern: &str) {
        self.control(ControlMsg::AddFilter { kind, pattern: pattern.to_owned() });
    }

    pub fn clear_filters(&self, kind: FilterKind) {
        self.control(ControlMsg::ClearFilters { kind });
    }

    pub fn add_allowed_text_pattern(&self, pattern: &str) {
        self.control(ControlMsg::AddTextPattern { pattern: pattern.to_owned() });
    }

    pub fn clear_allowed_text_patterns(&self) {
        self.control(ControlMsg::ClearTextPatterns);
    }

    pub fn set_filter_hidden(&self, filter_hidden: bool) {
        self.control(ControlMsg::SetFilterHidden(filter_hidden));
    }

    /// Indexing speed modifier: 0 runs at full speed, 1 waits a second
    /// between dispatch batches.
    pub fn set_throttle(&self, throttle: f64) {
        self.control(ControlMsg::SetThrottle(throttle));
    }

    pub fn set_extractor_hash(&self, mimetype: &str, hash: &str) {
        self.control(ControlMsg::SetExtractorHash {
            mimetype: mimetype.to_owned(),
            hash: hash.to_owned(),
        });
    }

    /// Requests a reconcile of `path` (and, with `recursive`, of every
    /// root below it).
    pub fn notify_update(&self, path: &Path, recursive: bool) {
        self.control(ControlMsg::NotifyUpdate { path: path.to_owned(), recursive });
    }

    pub fn save_config(&self, path: &Path) {
        self.control(ControlMsg::SaveConfig { path: path.to_owned() });
    }

    /// Compares the persisted snapshot against the live configuration,
    /// queueing a reconcile of every root on mismatch.
    pub fn check_config(&self, path: &Path) {
        self.control(ControlMsg::CheckConfig { path: path.to_owned() });
    }

    pub fn start(&self) {
        self.control(ControlMsg::Start);
    }

    /// Pauses processing; the current reconcile is re-queued with
    /// priority and restarts from scratch on the next start.
    pub fn stop(&self) {
        self.control(ControlMsg::Stop);
    }

    /// Registers a signal handler. Returning false unregisters it.
    pub fn add_handler(&self, handler: impl FnMut(&MinerEvent) -> bool + Send + 'static) {
        self.state.handlers.lock().unwrap().push(Box::new(handler));
    }

    pub fn extractors(&self) -> &ExtractorRegistry {
        &self.extractors
    }

    pub fn monitor(&self) -> Option<&Monitor> {
        self.monitor.as_ref()
    }

    pub fn shutdown(&self) {
        self.control(ControlMsg::Shutdown);
        if let Some(monitor) = &self.monitor {
            monitor.shutdown();
        }
        self.store.shutdown();
    }

    pub fn shutdown_guard(&self) -> ShutdownOnDrop {
        ShutdownOnDrop {
            indexer: Arc::downgrade(&self.state),
            mailbox: self.mailbox.clone(),
            monitor: self.monitor.clone(),
            store: self.store.clone(),
        }
    }
}
