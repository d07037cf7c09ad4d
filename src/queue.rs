use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::file_info::FileInfo;
use crate::path::is_descendant_or_equal;

/// Above this queue size the opportunistic descendant sweep on
/// directory deletes is skipped, iterating huge queues costs more than
/// dispatching a few doomed events.
pub const BIG_QUEUE_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    Created,
    Updated,
    Deleted,
    Moved,
    FinishDirectory,
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    pub path: PathBuf,
    /// destination, Moved only
    pub dest_path: Option<PathBuf>,
    pub info: Option<FileInfo>,
    pub attributes_update: bool,
    pub is_dir: bool,
    /// indexing root the event belongs to, for finished-root accounting
    pub root: Option<PathBuf>,
}

impl QueueEvent {
    pub fn new(kind: QueueEventKind, path: PathBuf) -> QueueEvent {
        debug_assert!(kind != QueueEventKind::Moved);
        QueueEvent {
            kind,
            path,
            dest_path: None,
            info: None,
            attributes_update: false,
            is_dir: false,
            root: None,
        }
    }

    pub fn moved(source: PathBuf, dest: PathBuf, is_dir: bool) -> QueueEvent {
        QueueEvent {
            kind: QueueEventKind::Moved,
            path: source,
            dest_path: Some(dest),
            info: None,
            attributes_update: false,
            is_dir,
            root: None,
        }
    }
}

enum Coalesce {
    /// keep both events
    None,
    DropOld,
    DropNew,
    DropBoth,
    /// drop both and enqueue the replacement instead
    Replace(QueueEvent),
}

// The table from the coalescing rules; `old` is the queued event,
// `new` the incoming one. Only called when one of `old`'s endpoints
// equals `new.path`.
fn coalesce(old: &QueueEvent, new: &QueueEvent) -> Coalesce {
    use QueueEventKind::*;

    match (old.kind, new.kind) {
        (Created, Created) => Coalesce::DropNew,
        (Created, Updated) => {
            if new.attributes_update {
                Coalesce::DropNew
            } else {
                Coalesce::DropOld
            }
        }
        (Created, Moved) => {
            let dest = new.dest_path.clone().unwrap();
            let mut replacement = QueueEvent::new(Created, dest);
            replacement.is_dir = new.is_dir;
            replacement.root = new.root.clone();
            Coalesce::Replace(replacement)
        }
        // the create may have been a replace of an already stored file,
        // the delete must survive
        (Created, Deleted) => Coalesce::DropOld,
        (Updated, Updated) => {
            if old.attributes_update && !new.attributes_update {
                Coalesce::DropOld
            } else {
                Coalesce::DropNew
            }
        }
        (Updated, Deleted) => Coalesce::DropOld,
        (Moved, Moved) => {
            // chained move; only fires when new.path == old dest
            if old.path == *new.dest_path.as_ref().unwrap() {
                // round trip, nothing happened
                Coalesce::DropBoth
            } else {
                let mut replacement = QueueEvent::moved(
                    old.path.clone(),
                    new.dest_path.clone().unwrap(),
                    old.is_dir,
                );
                replacement.root = new.root.clone();
                Coalesce::Replace(replacement)
            }
        }
        (Moved, Deleted) => {
            let mut replacement = QueueEvent::new(Deleted, old.path.clone());
            replacement.is_dir = old.is_dir || new.is_dir;
            replacement.root = old.root.clone();
            Coalesce::Replace(replacement)
        }
        (Deleted, Deleted) => Coalesce::DropNew,
        _ => Coalesce::None,
    }
}

/// Priority queue of pending events plus a by-path index for O(1)
/// coalescing. Two FIFO bands; slots are tombstoned on removal and the
/// arena resets whenever the queue drains.
#[derive(Debug, Default)]
pub struct EventQueue {
    slots: Vec<Option<QueueEvent>>,
    high: VecDeque<u32>,
    normal: VecDeque<u32>,
    /// most recent event per path; moved events are keyed under both
    /// endpoints
    by_path: HashMap<PathBuf, u32>,
    len: usize,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn unindex(&mut self, id: u32, event: &QueueEvent) {
        for key in [Some(&event.path), event.dest_path.as_ref()].into_iter().flatten() {
            if self.by_path.get(key) == Some(&id) {
                self.by_path.remove(key);
            }
        }
    }

    fn free(&mut self, id: u32, dropped: &mut Vec<QueueEvent>) {
        if let Some(event) = self.slots[id as usize].take() {
            self.unindex(id, &event);
            self.len -= 1;
            dropped.push(event);
        }
    }

    /// Enqueues `event`, applying the coalescing table against the
    /// queued event sharing a path with it. Previously queued events
    /// made redundant end up in `dropped` so the caller can settle
    /// per-root bookkeeping; the return value is `Some(root)` of the
    /// event that actually entered the queue (the incoming one or a
    /// synthesized replacement), `None` when everything coalesced away.
    pub fn push(
        &mut self,
        event: QueueEvent,
        high_priority: bool,
        dropped: &mut Vec<QueueEvent>,
    ) -> Option<Option<PathBuf>> {
        let mut event = Some(event);

        // a move obsoletes anything queued under its destination
        if let Some(dest) = event.as_ref().unwrap().dest_path.clone() {
            self.remove_descendants(&dest, dropped);
        }

        if let Some(&old_id) = self.by_path.get(&event.as_ref().unwrap().path) {
            let old = self.slots[old_id as usize].as_ref().unwrap();
            match coalesce(old, event.as_ref().unwrap()) {
                Coalesce::None => (),
                Coalesce::DropOld => self.free(old_id, dropped),
                Coalesce::DropNew => return None,
                Coalesce::DropBoth => {
                    self.free(old_id, dropped);
                    return None;
                }
                Coalesce::Replace(replacement) => {
                    self.free(old_id, dropped);
                    event = Some(replacement);
                }
            }
        }

        let event = event.unwrap();

        // opportunistically drop doomed descendant events
        if event.is_dir
            && event.kind == QueueEventKind::Deleted
            && self.len < BIG_QUEUE_THRESHOLD
        {
            let path = event.path.clone();
            self.remove_descendants(&path, dropped);
        }

        let root = event.root.clone();
        let id = self.slots.len() as u32;
        self.by_path.insert(event.path.clone(), id);
        if let Some(dest) = &event.dest_path {
            self.by_path.insert(dest.clone(), id);
        }
        self.slots.push(Some(event));
        self.len += 1;
        if high_priority {
            self.high.push_back(id);
        } else {
            self.normal.push_back(id);
        }
        Some(root)
    }

    pub fn pop(&mut self) -> Option<QueueEvent> {
        loop {
            let Some(id) = self.high.pop_front().or_else(|| self.normal.pop_front()) else {
                // fully drained, recycle the arena
                self.slots.clear();
                self.by_path.clear();
                return None;
            };
            if let Some(event) = self.slots[id as usize].take() {
                self.unindex(id, &event);
                self.len -= 1;
                if self.len == 0 {
                    self.slots.clear();
                    self.high.clear();
                    self.normal.clear();
                    self.by_path.clear();
                }
                return Some(event);
            }
        }
    }

    /// Removes every pending event whose path equals or descends from
    /// `prefix`.
    pub fn remove_descendants(&mut self, prefix: &Path, dropped: &mut Vec<QueueEvent>) {
        for id in 0..self.slots.len() as u32 {
            let matches = self.slots[id as usize]
                .as_ref()
                .is_some_and(|event| is_descendant_or_equal(&event.path, prefix));
            if matches {
                self.free(id, dropped);
            }
        }
    }
}
