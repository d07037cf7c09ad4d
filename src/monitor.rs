use std::path::{Path, PathBuf};
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, Mutex};
use std::{io, thread};

mod sys;

use hashbrown::{DefaultHashBuilder, HashMap};
use mio::{Poll, Waker};
use papaya::HashMap as ConcurrentMap;

use crate::events::{Mailbox, MonitorEvent, Msg};
use crate::monitor::sys::{Event, EventFlags, Inotify, Watch};
use crate::path::{is_descendant, is_descendant_or_equal};

const FALLBACK_WATCH_LIMIT: usize = 8192;

fn read_watch_limit() -> usize {
    std::fs::read_to_string("/proc/sys/fs/inotify/max_user_watches")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(FALLBACK_WATCH_LIMIT)
}

struct MonitorShared {
    notify: Inotify,
    waker: Waker,
    shutdown: AtomicBool,
    enabled: AtomicBool,
    limit: usize,
    /// watch descriptor -> directory, read by the event thread
    watches: ConcurrentMap<Watch, PathBuf, DefaultHashBuilder>,
    /// every requested directory; the watch is None while the monitor
    /// is disabled or the limit is exhausted
    paths: Mutex<HashMap<PathBuf, Option<Watch>>>,
    mailbox: Arc<Mailbox>,
}

/// Abstraction over OS filesystem-change notification for a set of
/// watched directories. Emits item-created/updated/attribute-updated/
/// deleted/moved for children of watched directories into the worker
/// mailbox; a dedicated thread drains the inotify fd.
#[derive(Clone)]
pub struct Monitor {
    shared: Arc<MonitorShared>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("enabled", &self.enabled())
            .field("limit", &self.shared.limit)
            .finish_non_exhaustive()
    }
}

// unpaired rename halves held between event batches
#[derive(Default)]
struct PendingMoves {
    moves: Vec<(u32, PathBuf, bool)>,
}

impl Monitor {
    pub fn new(mailbox: Arc<Mailbox>) -> io::Result<Monitor> {
        let mut poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), sys::MESSAGE)?;
        let shared = Arc::new(MonitorShared {
            waker,
            notify: Inotify::new()?,
            shutdown: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            limit: read_watch_limit(),
            watches: ConcurrentMap::with_capacity_and_hasher(1024, DefaultHashBuilder::default()),
            paths: Mutex::new(HashMap::new()),
            mailbox,
        });

        let shared_ = shared.clone();
        thread::spawn(move || {
            let mut pending = PendingMoves::default();
            let res = shared_.notify.event_loop(
                &mut poll,
                &mut pending,
                |pending, event| shared_.handle_event(pending, event),
                |pending| shared_.flush_pending(pending),
                |_| shared_.shutdown.load(atomic::Ordering::Relaxed),
            );
            if let Err(err) = res {
                log::error!("monitor event loop died: {err}");
            }
        });
        Ok(Monitor { shared })
    }

    /// Starts monitoring `dir`. Beyond the platform limit (or while
    /// disabled) the directory is only registered; the subscription is
    /// established lazily on [`Monitor::set_enabled`].
    pub fn add(&self, dir: &Path) {
        let shared = &self.shared;
        let mut paths = shared.paths.lock().unwrap();
        if paths.contains_key(dir) {
            return;
        }
        let mut watch = None;
        if shared.enabled.load(atomic::Ordering::Relaxed) {
            if paths.len() >= shared.limit {
                log::debug!("inotify watch limit reached, not monitoring {dir:?}");
            } else {
                watch = shared.subscribe(dir);
            }
        }
        paths.insert(dir.to_owned(), watch);
    }

    pub fn remove(&self, dir: &Path) -> bool {
        let mut paths = self.shared.paths.lock().unwrap();
        match paths.remove(dir) {
            Some(watch) => {
                self.shared.unsubscribe(watch);
                true
            }
            None => false,
        }
    }

    /// Removes the monitor on `dir` and every monitor below it.
    pub fn remove_recursively(&self, dir: &Path) {
        self.remove_matching(|path| is_descendant_or_equal(path, dir));
    }

    /// Removes every monitor strictly below `dir`, keeping `dir` itself
    /// monitored.
    pub fn remove_children_recursively(&self, dir: &Path) {
        self.remove_matching(|path| is_descendant(path, dir));
    }

    fn remove_matching(&self, matches: impl Fn(&Path) -> bool) {
        let mut paths = self.shared.paths.lock().unwrap();
        let doomed: Vec<PathBuf> = paths.keys().filter(|p| matches(p)).cloned().collect();
        for path in doomed {
            let watch = paths.remove(&path).unwrap();
            self.shared.unsubscribe(watch);
        }
    }

    /// Rewrites monitors under `source` to live under `dest`, keeping
    /// the kernel subscriptions alive across the rename.
    pub fn rename(&self, source: &Path, dest: &Path) {
        let mut paths = self.shared.paths.lock().unwrap();
        let moved: Vec<PathBuf> = paths
            .keys()
            .filter(|p| is_descendant_or_equal(p, source))
            .cloned()
            .collect();
        let watches = self.shared.watches.pin();
        for old_path in moved {
            let watch = paths.remove(&old_path).unwrap();
            let new_path = match old_path.strip_prefix(source) {
                Ok(rest) if rest.as_os_str().is_empty() => dest.to_owned(),
                Ok(rest) => dest.join(rest),
                Err(_) => continue,
            };
            if let Some(watch) = watch {
                watches.insert(watch, new_path.clone());
            }
            paths.insert(new_path, watch);
        }
    }

    pub fn is_monitored(&self, dir: &Path) -> bool {
        self.shared.paths.lock().unwrap().contains_key(dir)
    }

    pub fn count(&self) -> usize {
        self.shared.paths.lock().unwrap().len()
    }

    /// Platform limit on the number of watched directories.
    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(atomic::Ordering::Relaxed)
    }

    /// Disabling tears down all kernel subscriptions but keeps the
    /// registered set; enabling re-subscribes it. Bulk crawls disable
    /// the monitor when the store already holds more folders than the
    /// platform can watch.
    pub fn set_enabled(&self, enabled: bool) {
        let shared = &self.shared;
        if shared.enabled.swap(enabled, atomic::Ordering::Relaxed) == enabled {
            return;
        }
        let mut paths = shared.paths.lock().unwrap();
        if enabled {
            let mut subscribed = 0;
            for (path, watch) in paths.iter_mut() {
                if watch.is_none() && subscribed < shared.limit {
                    *watch = shared.subscribe(path);
                    subscribed += 1;
                }
            }
        } else {
            for (_, watch) in paths.iter_mut() {
                shared.unsubscribe(watch.take());
            }
        }
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, atomic::Ordering::Relaxed);
        let _ = self.shared.waker.wake();
    }
}

impl MonitorShared {
    fn subscribe(&self, dir: &Path) -> Option<Watch> {
        match self.notify.add_directory_watch(dir) {
            Ok(watch) => {
                self.watches.pin().insert(watch, dir.to_owned());
                Some(watch)
            }
            Err(err) => {
                log::debug!("failed to monitor {dir:?}: {err}");
                None
            }
        }
    }

    fn unsubscribe(&self, watch: Option<Watch>) {
        if let Some(watch) = watch {
            self.notify.remove_watch(watch);
            self.watches.pin().remove(&watch);
        }
    }

    fn emit(&self, event: MonitorEvent) {
        self.mailbox.push(Msg::Monitor(event));
    }

    fn handle_event(&self, pending: &mut PendingMoves, event: Event<'_>) {
        if event.flags.contains(EventFlags::QUEUE_OVERFLOW) {
            self.emit(MonitorEvent::Overflow);
            return;
        }
        let watches = self.watches.pin();
        let Some(dir) = watches.get(&event.wd) else {
            return;
        };

        if event.flags.contains(EventFlags::IGNORED) {
            // kernel dropped the watch (deleted or unmounted); the
            // parent's DELETE event carries the logical deletion
            watches.remove(&event.wd);
            self.paths.lock().unwrap().remove(dir.as_path());
            return;
        }
        if event
            .flags
            .intersects(EventFlags::DELETE_SELF | EventFlags::MOVE_SELF | EventFlags::UNMOUNT)
            || event.child.is_empty()
        {
            return;
        }

        let path = dir.join(event.child);
        let is_dir = event.flags.contains(EventFlags::ISDIR);
        if event.flags.contains(EventFlags::CREATE) {
            self.emit(MonitorEvent::ItemCreated { path, is_dir });
        } else if event.flags.contains(EventFlags::MODIFY) {
            self.emit(MonitorEvent::ItemUpdated { path, is_dir });
        } else if event.flags.contains(EventFlags::ATTRIB) {
            self.emit(MonitorEvent::ItemAttributeUpdated { path, is_dir });
        } else if event.flags.contains(EventFlags::DELETE) {
            self.emit(MonitorEvent::ItemDeleted { path, is_dir });
        } else if event.flags.contains(EventFlags::MOVED_FROM) {
            pending.moves.push((event.cookie, path, is_dir));
        } else if event.flags.contains(EventFlags::MOVED_TO) {
            let paired = pending
                .moves
                .iter()
                .position(|(cookie, ..)| *cookie == event.cookie);
            match paired {
                Some(i) => {
                    let (_, source, src_is_dir) = pending.moves.remove(i);
                    self.emit(MonitorEvent::ItemMoved {
                        source,
                        dest: path,
                        is_dir: is_dir || src_is_dir,
                        source_monitored: true,
                    });
                }
                // moved in from outside any watched directory
                None => self.emit(MonitorEvent::ItemCreated { path, is_dir }),
            }
        }
    }

    // a MOVED_FROM that never met its MOVED_TO within the batch left
    // the watched universe
    fn flush_pending(&self, pending: &mut PendingMoves) {
        for (_, path, is_dir) in pending.moves.drain(..) {
            self.emit(MonitorEvent::ItemDeleted { path, is_dir });
        }
    }
}
