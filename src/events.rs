use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::file_info::FileInfo;
use crate::filter::FilterKind;
use crate::store::StoreError;
use crate::tree::RootFlags;

/// Logical file events produced by the notifier and consumed by the
/// miner. Applying the stream to the store makes it match the
/// filesystem, modulo filters.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Created { path: PathBuf, info: Option<FileInfo> },
    Updated { path: PathBuf, info: Option<FileInfo>, attributes_only: bool },
    Deleted { path: PathBuf, is_dir: bool },
    Moved { source: PathBuf, dest: PathBuf, is_dir: bool },
    DirectoryStarted { path: PathBuf },
    /// every descendant event this reconcile pass will emit for `path`
    /// has already been emitted
    DirectoryFinished { path: PathBuf },
    /// no reconcile work left
    Finished,
}

/// Raw events out of the filesystem monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ItemCreated { path: PathBuf, is_dir: bool },
    ItemUpdated { path: PathBuf, is_dir: bool },
    ItemAttributeUpdated { path: PathBuf, is_dir: bool },
    /// `is_dir` is best effort, the notifier consults the store when
    /// the monitor cannot tell
    ItemDeleted { path: PathBuf, is_dir: bool },
    ItemMoved { source: PathBuf, dest: PathBuf, is_dir: bool, source_monitored: bool },
    /// the kernel event queue overflowed, everything needs a reconcile
    Overflow,
}

/// Signals surfaced to the application through registered handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum MinerEvent {
    Status { status: String, progress: f64, remaining_time: Option<u64> },
    /// all pending processing is done, the miner is idle
    Finished {
        elapsed: Duration,
        files_found: u32,
        files_ignored: u32,
        files_updated: u32,
        files_reindexed: u32,
        changes_processed: u32,
    },
    /// the store holds no more pending tasks under this root
    FinishedRoot(PathBuf),
    Corrupt,
    NoSpace,
}

pub type MinerHandler = Box<dyn FnMut(&MinerEvent) -> bool + Send>;

/// Control requests from the public handle into the worker.
#[derive(Debug)]
pub enum ControlMsg {
    AddRoot { path: PathBuf, flags: RootFlags },
    RemoveRoot { path: PathBuf },
    AddFilter { kind: FilterKind, pattern: String },
    ClearFilters { kind: FilterKind },
    AddTextPattern { pattern: String },
    ClearTextPatterns,
    SetFilterHidden(bool),
    SetThrottle(f64),
    SetExtractorHash { mimetype: String, hash: String },
    NotifyUpdate { path: PathBuf, recursive: bool },
    SaveConfig { path: PathBuf },
    CheckConfig { path: PathBuf },
    Start,
    Stop,
    Shutdown,
}

/// Everything that can wake the worker loop.
#[derive(Debug)]
pub enum Msg {
    Control(ControlMsg),
    Monitor(MonitorEvent),
    FlushDone { result: Result<(), StoreError> },
}

/// The worker's wakeup channel: monitor thread, store endpoint and the
/// public handle all push here, the worker drains between batches.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Msg>>,
    condvar: Condvar,
}

impl Mailbox {
    pub fn push(&self, msg: Msg) {
        self.queue.lock().unwrap().push_back(msg);
        self.condvar.notify_all();
    }

    pub fn drain(&self, dst: &mut Vec<Msg>) {
        let mut queue = self.queue.lock().unwrap();
        dst.extend(queue.drain(..));
    }

    /// Blocks until a message arrives or `timeout` passes; drains
    /// whatever is queued into `dst`. Returns true on timeout.
    pub fn wait(&self, dst: &mut Vec<Msg>, timeout: Duration) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let mut timed_out = false;
        if queue.is_empty() {
            let res;
            (queue, res) = self
                .condvar
                .wait_timeout_while(queue, timeout, |queue| queue.is_empty())
                .unwrap();
            timed_out = res.timed_out();
        }
        dst.extend(queue.drain(..));
        timed_out
    }
}
