use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::events::MinerEvent;
use crate::file_info::FileInfo;
use crate::filter::FilterKind;
use crate::miner::{FsDelegate, MinerContext, MinerDelegate};
use crate::store::{MemoryStore, StoreError};
use crate::tree::RootFlags;
use crate::{ExtractorRegistry, Indexer, Options, ShutdownOnDrop};

const TIMEOUT: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(25);

fn monitored() -> RootFlags {
    RootFlags::RECURSE | RootFlags::MONITOR
}

struct Fixture {
    _dir: TempDir,
    base: PathBuf,
    store: MemoryStore,
    indexer: Indexer,
    _guard: ShutdownOnDrop,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture::with_options(Options::default())
    }

    fn with_options(options: Options) -> Fixture {
        let _ = env_logger::builder().try_init();
        let dir = TempDir::new().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let store = MemoryStore::new();
        let indexer = Indexer::with_options(store.clone(), options).unwrap();
        let guard = indexer.shutdown_guard();
        Fixture { _dir: dir, base, store, indexer, _guard: guard }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }

    fn mkdir(&self, rel: &str) {
        fs::create_dir_all(self.path(rel)).unwrap();
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn rm_file(&self, rel: &str) {
        fs::remove_file(self.path(rel)).unwrap();
    }

    fn rename(&self, from: &str, to: &str) {
        fs::rename(self.path(from), self.path(to)).unwrap();
    }

    fn add_root(&self, rel: &str, flags: RootFlags) {
        self.indexer.add_root(&self.path(rel), flags).unwrap();
    }

    /// Store contents as sorted fixture-relative path strings.
    fn store_content(&self) -> Vec<String> {
        let mut content: Vec<String> = self
            .store
            .paths()
            .iter()
            .filter_map(|path| path.strip_prefix(&self.base).ok())
            .map(|rel| rel.to_string_lossy().into_owned())
            .collect();
        content.sort();
        content
    }

    /// Polls until the store matches `expected`; the final comparison
    /// produces a readable diff on timeout.
    #[track_caller]
    fn expect_content(&self, expected: &[&str]) {
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if self.store_content() == expected {
                return;
            }
            std::thread::sleep(POLL);
        }
        assert_eq!(self.store_content(), expected);
    }

    fn idle_waiter(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        self.indexer.add_handler(move |event| {
            if matches!(event, MinerEvent::Finished { .. }) {
                let _ = tx.send(());
                false
            } else {
                true
            }
        });
        rx
    }

    #[track_caller]
    fn wait_idle(&self, waiter: &mpsc::Receiver<()>) {
        waiter.recv_timeout(TIMEOUT).expect("indexer never became idle");
    }

    fn uri(&self, rel: &str) -> String {
        crate::path::file_uri(&self.path(rel))
    }
}

#[test]
fn recursive_indexing() {
    let f = Fixture::new();
    f.mkdir("recursive/1/2");
    f.mkdir("recursive/1/empty");
    f.write("recursive/1/a", "a");
    f.write("recursive/1/b", "b");
    f.write("recursive/1/2/c", "c");

    f.add_root("recursive", monitored());
    f.indexer.start();

    f.expect_content(&[
        "recursive",
        "recursive/1",
        "recursive/1/2",
        "recursive/1/2/c",
        "recursive/1/a",
        "recursive/1/b",
        "recursive/1/empty",
    ]);
}

#[test]
fn non_recursive_indexing() {
    let f = Fixture::new();
    f.mkdir("non-recursive/1/2");
    f.mkdir("non-recursive/empty");
    f.write("non-recursive/a", "a");
    f.write("non-recursive/1/b", "b");

    f.add_root("non-recursive", RootFlags::MONITOR);
    f.indexer.start();

    f.expect_content(&[
        "non-recursive",
        "non-recursive/1",
        "non-recursive/a",
        "non-recursive/empty",
    ]);
}

#[test]
fn separate_recursive_and_non_recursive() {
    let f = Fixture::new();
    f.mkdir("recursive/1/2");
    f.mkdir("non-recursive/1/2");
    f.write("recursive/a", "a");
    f.write("recursive/1/b", "b");
    f.write("non-recursive/a", "a");
    f.write("non-recursive/1/b", "b");

    f.add_root("recursive", monitored());
    f.add_root("non-recursive", RootFlags::MONITOR);
    f.indexer.start();

    f.expect_content(&[
        "non-recursive",
        "non-recursive/1",
        "non-recursive/a",
        "recursive",
        "recursive/1",
        "recursive/1/2",
        "recursive/1/b",
        "recursive/a",
    ]);
}

#[test]
fn non_recursive_in_recursive() {
    let f = Fixture::new();
    f.mkdir("recursive/1/non-recursive/2");
    f.write("recursive/a", "a");
    f.write("recursive/1/b", "b");
    f.write("recursive/1/non-recursive/c", "c");
    f.write("recursive/1/non-recursive/2/d", "d");

    f.add_root("recursive", monitored());
    f.add_root("recursive/1/non-recursive", RootFlags::MONITOR);
    f.indexer.start();

    f.expect_content(&[
        "recursive",
        "recursive/1",
        "recursive/1/b",
        "recursive/1/non-recursive",
        "recursive/1/non-recursive/2",
        "recursive/1/non-recursive/c",
        "recursive/a",
    ]);
}

#[test]
fn empty_root() {
    let f = Fixture::new();
    f.mkdir("empty");
    let waiter = f.idle_waiter();
    f.add_root("empty", monitored());
    f.indexer.start();
    f.wait_idle(&waiter);
    f.expect_content(&["empty"]);
}

#[test]
fn missing_root_is_rejected() {
    let f = Fixture::new();
    assert!(f.indexer.add_root(&f.path("nowhere"), monitored()).is_err());
}

#[test]
fn file_and_directory_filters() {
    let f = Fixture::new();
    f.write("r/keep.txt", "x");
    f.write("r/drop.o", "x");
    f.mkdir("r/node_modules/dep");
    f.write("r/node_modules/x.js", "x");

    f.indexer.add_filter(FilterKind::File, "*.o");
    f.indexer.add_filter(FilterKind::Directory, "node_modules");
    f.add_root("r", monitored());
    f.indexer.start();

    f.expect_content(&["r", "r/keep.txt"]);
}

#[test]
fn hidden_files() {
    let f = Fixture::new();
    f.write("r/.hidden", "x");
    f.write("r/visible", "x");

    f.indexer.set_filter_hidden(true);
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/visible"]);
}

#[test]
fn hidden_files_indexed_when_not_filtered() {
    let f = Fixture::new();
    f.write("r/.hidden", "x");
    f.write("r/visible", "x");

    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/.hidden", "r/visible"]);
}

#[test]
fn content_filter_excludes_directories() {
    let f = Fixture::new();
    f.write("r/plain/a", "x");
    f.write("r/excluded/.nomedia", "");
    f.write("r/excluded/b", "x");

    f.indexer.add_filter(FilterKind::ParentDirectory, ".nomedia");
    f.add_root("r", monitored());
    f.indexer.start();

    // the disqualified directory itself is indexed, its contents are not
    f.expect_content(&["r", "r/excluded", "r/plain", "r/plain/a"]);
}

#[test]
fn monitored_create_update_delete() {
    let f = Fixture::new();
    f.mkdir("r");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r"]);

    f.write("r/a.txt", "one");
    f.expect_content(&["r", "r/a.txt"]);
    let first = f.store.entry(&f.uri("r/a.txt")).unwrap();

    // mtime resolution is a second, make sure the update is visible
    std::thread::sleep(Duration::from_millis(1100));
    f.write("r/a.txt", "two");
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let entry = f.store.entry(&f.uri("r/a.txt")).unwrap();
        if entry.modified > first.modified {
            break;
        }
        assert!(Instant::now() < deadline, "update never reached the store");
        std::thread::sleep(POLL);
    }

    f.rm_file("r/a.txt");
    f.expect_content(&["r"]);
}

#[test]
fn monitored_subtree_create() {
    let f = Fixture::new();
    f.mkdir("r");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r"]);

    // a whole new subtree appears at once; the directory event queues a
    // reconcile that picks up the contents
    f.write("r/new/sub/file", "x");
    f.expect_content(&["r", "r/new", "r/new/sub", "r/new/sub/file"]);
}

#[test]
fn monitored_move_within_root() {
    let f = Fixture::new();
    f.write("r/a.txt", "x");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/a.txt"]);

    f.rename("r/a.txt", "r/b.txt");
    f.expect_content(&["r", "r/b.txt"]);
}

#[test]
fn monitored_move_across_root_flavors() {
    let f = Fixture::new();
    f.write("R/a", "x");
    f.write("N/2/c", "x");

    f.add_root("R", monitored());
    f.add_root("N", RootFlags::MONITOR);
    f.indexer.start();
    f.expect_content(&["N", "N/2", "R", "R/a"]);

    f.rename("N/2", "R/4");
    f.expect_content(&["N", "R", "R/4", "R/4/c", "R/a"]);
}

#[test]
fn move_out_of_indexed_area_deletes() {
    let f = Fixture::new();
    f.write("r/a", "x");
    f.mkdir("outside");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/a"]);

    f.rename("r/a", "outside/a");
    f.expect_content(&["r"]);
}

#[test]
fn create_then_delete_burst() {
    let f = Fixture::new();
    f.mkdir("r");
    let waiter = f.idle_waiter();
    f.add_root("r", monitored());
    f.indexer.start();
    f.wait_idle(&waiter);

    // hold dispatch so both events coalesce in the queue
    f.indexer.stop();
    f.write("r/a", "x");
    f.rm_file("r/a");
    std::thread::sleep(Duration::from_millis(500));
    f.indexer.start();

    f.expect_content(&["r"]);
    // the create never produced an insertion downstream
    let uri = f.uri("r/a");
    f.store.with_inner(|inner| {
        assert!(!inner
            .update_log
            .iter()
            .any(|sparql| sparql.starts_with("INSERT") && sparql.contains(&uri)));
    });
}

#[test]
fn atomic_replace_keeps_single_entity() {
    let f = Fixture::new();
    f.write("r/a", "old");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/a"]);

    f.indexer.stop();
    f.write("r/b", "new");
    f.rename("r/b", "r/a");
    std::thread::sleep(Duration::from_millis(500));
    f.indexer.start();

    f.expect_content(&["r", "r/a"]);
    // b never made it into the store on its own
    let uri = f.uri("r/b");
    f.store.with_inner(|inner| {
        assert!(!inner
            .update_log
            .iter()
            .any(|sparql| sparql.starts_with("INSERT") && sparql.contains(&uri)));
    });
}

#[test]
fn content_filter_trigger_empties_subtree() {
    let f = Fixture::new();
    f.write("r/a", "x");
    f.write("r/b", "x");
    f.indexer.add_filter(FilterKind::ParentDirectory, ".nomedia");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/a", "r/b"]);

    // the new file disqualifies the whole directory
    f.write("r/.nomedia", "");
    f.expect_content(&[]);
}

#[test]
fn root_removal_respects_preserve() {
    let f = Fixture::new();
    f.write("keep/a", "x");
    f.write("drop/a", "x");
    f.indexer
        .add_root(&f.path("keep"), monitored() | RootFlags::PRESERVE)
        .unwrap();
    f.add_root("drop", monitored());
    f.indexer.start();
    f.expect_content(&["drop", "drop/a", "keep", "keep/a"]);

    f.indexer.remove_root(&f.path("drop"));
    f.expect_content(&["keep", "keep/a"]);

    f.indexer.remove_root(&f.path("keep"));
    std::thread::sleep(Duration::from_millis(300));
    f.expect_content(&["keep", "keep/a"]);
}

#[test]
fn non_monitored_changes_found_by_reconcile() {
    let f = Fixture::new();
    f.write("r/a", "x");
    f.add_root("r", RootFlags::RECURSE);
    f.indexer.start();
    f.expect_content(&["r", "r/a"]);

    // no monitors installed, mutations surface on the next reconcile
    f.write("r/b", "x");
    f.rm_file("r/a");
    f.indexer.notify_update(&f.path("r"), false);
    f.expect_content(&["r", "r/b"]);
}

#[test]
fn extractor_hash_change_forces_reindex() {
    let f = Fixture::new();
    f.indexer.set_extractor_hash("text/plain", "hash-1");
    f.write("r/doc.txt", "x");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/doc.txt"]);

    let uri = f.uri("r/doc.txt");
    let deadline = Instant::now() + TIMEOUT;
    while f.store.entry(&uri).unwrap().extractor_hash.as_deref() != Some("hash-1") {
        assert!(Instant::now() < deadline);
        std::thread::sleep(POLL);
    }

    // same mtime, different module hash: reconcile must re-emit it
    f.indexer.set_extractor_hash("text/plain", "hash-2");
    f.indexer.notify_update(&f.path("r"), false);
    let deadline = Instant::now() + TIMEOUT;
    while f.store.entry(&uri).unwrap().extractor_hash.as_deref() != Some("hash-2") {
        assert!(Instant::now() < deadline, "file was never reindexed");
        std::thread::sleep(POLL);
    }
}

#[test]
fn filter_toggle_round_trips() {
    let f = Fixture::new();
    f.write("r/a.txt", "x");
    f.write("r/b.o", "x");
    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/a.txt", "r/b.o"]);

    f.indexer.add_filter(FilterKind::File, "*.o");
    f.indexer.notify_update(&f.path("r"), false);
    f.expect_content(&["r", "r/a.txt"]);

    f.indexer.clear_filters(FilterKind::File);
    f.indexer.notify_update(&f.path("r"), false);
    f.expect_content(&["r", "r/a.txt", "r/b.o"]);
}

#[test]
fn corrupt_store_raises_signal() {
    let f = Fixture::new();
    f.write("r/a", "x");

    let (tx, rx) = mpsc::channel();
    f.indexer.add_handler(move |event| {
        if matches!(event, MinerEvent::Corrupt) {
            let _ = tx.send(());
            false
        } else {
            true
        }
    });

    f.store.fail_next_batch(StoreError::Corrupt);
    f.add_root("r", monitored());
    f.indexer.start();
    rx.recv_timeout(TIMEOUT).expect("corrupt signal never arrived");
}

#[test]
fn batch_errors_become_reports_and_clear() {
    let report_dir = TempDir::new().unwrap();
    let options = Options {
        error_report_dir: Some(report_dir.path().to_owned()),
        ..Options::default()
    };
    let f = Fixture::with_options(options);
    f.write("r/a", "x");

    f.store.fail_next_batch(StoreError::Backend("constraint violated".into()));
    let waiter = f.idle_waiter();
    f.add_root("r", monitored());
    f.indexer.start();
    f.wait_idle(&waiter);

    // at least one report was filed for the failed batch
    let deadline = Instant::now() + TIMEOUT;
    while fs::read_dir(report_dir.path()).unwrap().count() == 0 {
        assert!(Instant::now() < deadline, "no error reports were written");
        std::thread::sleep(POLL);
    }

    // a successful pass clears them again
    f.indexer.notify_update(&f.path("r"), false);
    f.expect_content(&["r", "r/a"]);
    let deadline = Instant::now() + TIMEOUT;
    while fs::read_dir(report_dir.path()).unwrap().count() > 0 {
        assert!(Instant::now() < deadline, "error reports were never cleared");
        std::thread::sleep(POLL);
    }
}

#[test]
fn finished_root_is_signalled() {
    let f = Fixture::new();
    f.write("r/a", "x");

    let roots = Arc::new(Mutex::new(Vec::new()));
    let roots_ = roots.clone();
    f.indexer.add_handler(move |event| {
        if let MinerEvent::FinishedRoot(path) = event {
            roots_.lock().unwrap().push(path.clone());
        }
        true
    });

    f.add_root("r", monitored());
    f.indexer.start();
    f.expect_content(&["r", "r/a"]);

    let expected = f.path("r");
    let deadline = Instant::now() + TIMEOUT;
    while !roots.lock().unwrap().contains(&expected) {
        assert!(Instant::now() < deadline, "finished-root never arrived");
        std::thread::sleep(POLL);
    }
}

#[test]
fn controller_applies_config_diffs() {
    let f = Fixture::new();
    f.write("cfg/a", "x");
    f.write("cfg/b.tmp", "x");

    let mut controller = crate::Controller::new(f.indexer.clone());
    let mut config = crate::IndexerConfig::default();
    config.index_recursive_directories.push(f.path("cfg"));
    config.ignored_files.push("*.tmp".into());
    controller.apply(config.clone());

    f.indexer.start();
    f.expect_content(&["cfg", "cfg/a"]);

    // dropping the root from the configuration drops it from the store
    config.index_recursive_directories.clear();
    controller.apply(config);
    f.expect_content(&[]);
}

#[test]
fn removable_volumes_are_preserved_on_unmount() {
    let f = Fixture::new();
    f.write("vol/song.mp3", "x");

    let mut controller = crate::Controller::new(f.indexer.clone());
    let mut config = crate::IndexerConfig::default();
    config.index_removable_devices = true;
    controller.apply(config);

    controller.mount_added(&f.path("vol"));
    f.indexer.start();
    f.expect_content(&["vol", "vol/song.mp3"]);

    // unplugging must not wipe the volume's contents from the store
    controller.mount_removed(&f.path("vol"));
    std::thread::sleep(Duration::from_millis(300));
    f.expect_content(&["vol", "vol/song.mp3"]);
}

/// Delegate wrapper recording the dispatch order so the post-order
/// guarantee of directory-finished can be asserted.
struct RecordingDelegate {
    inner: FsDelegate,
    log: Arc<Mutex<Vec<(&'static str, PathBuf)>>>,
}

impl MinerDelegate for RecordingDelegate {
    fn process_file(
        &mut self,
        ctx: &mut MinerContext<'_>,
        file: &Path,
        info: &FileInfo,
        created: bool,
    ) {
        self.log.lock().unwrap().push(("process", file.to_owned()));
        self.inner.process_file(ctx, file, info, created);
    }

    fn process_file_attributes(
        &mut self,
        ctx: &mut MinerContext<'_>,
        file: &Path,
        info: &FileInfo,
    ) {
        self.inner.process_file_attributes(ctx, file, info);
    }

    fn remove_file(&mut self, ctx: &mut MinerContext<'_>, file: &Path, is_dir: bool) {
        self.log.lock().unwrap().push(("remove", file.to_owned()));
        self.inner.remove_file(ctx, file, is_dir);
    }

    fn remove_children(&mut self, ctx: &mut MinerContext<'_>, file: &Path) {
        self.inner.remove_children(ctx, file);
    }

    fn move_file(
        &mut self,
        ctx: &mut MinerContext<'_>,
        dest: &Path,
        source: &Path,
        recursive: bool,
    ) {
        self.inner.move_file(ctx, dest, source, recursive);
    }

    fn finish_directory(&mut self, ctx: &mut MinerContext<'_>, folder: &Path) {
        self.log.lock().unwrap().push(("finish", folder.to_owned()));
        self.inner.finish_directory(ctx, folder);
    }

    fn get_content_identifier(&mut self, file: &Path, info: &FileInfo) -> String {
        self.inner.get_content_identifier(file, info)
    }
}

#[test]
fn directory_finished_is_post_order() {
    let _ = env_logger::builder().try_init();
    let dir = TempDir::new().unwrap();
    let base = dir.path().canonicalize().unwrap();
    let store = MemoryStore::new();
    let extractors = Arc::new(ExtractorRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let delegate = Box::new(RecordingDelegate {
        inner: FsDelegate::new(extractors.clone()),
        log: log.clone(),
    });
    let indexer =
        Indexer::with_delegate(store.clone(), delegate, extractors, Options::default()).unwrap();
    let _guard = indexer.shutdown_guard();

    fs::create_dir_all(base.join("r/x/y")).unwrap();
    fs::write(base.join("r/x/y/deep"), "x").unwrap();
    fs::write(base.join("r/top"), "x").unwrap();

    let (tx, rx) = mpsc::channel();
    indexer.add_handler(move |event| {
        if matches!(event, MinerEvent::Finished { .. }) {
            let _ = tx.send(());
            false
        } else {
            true
        }
    });
    indexer.add_root(&base.join("r"), monitored()).unwrap();
    indexer.start();
    rx.recv_timeout(TIMEOUT).unwrap();

    let log = log.lock().unwrap();
    for (i, (op, path)) in log.iter().enumerate() {
        if *op != "finish" {
            continue;
        }
        // no event under this directory may be dispatched after it
        for (later_op, later_path) in &log[i + 1..] {
            if *later_op == "process" {
                assert!(
                    !later_path.starts_with(path),
                    "{later_path:?} dispatched after finish of {path:?}"
                );
            }
        }
    }
    // every crawled directory got its finish
    let finished: Vec<_> =
        log.iter().filter(|(op, _)| *op == "finish").map(|(_, p)| p.clone()).collect();
    assert!(finished.contains(&base.join("r")));
    assert!(finished.contains(&base.join("r/x/y")));
}
