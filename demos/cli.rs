use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use fileminer::{FilterKind, Indexer, MemoryStore, MinerEvent, RootFlags};

const HELP: &str = r#"
Index a directory into an in-memory store and keep it synchronized,
printing every store mutation.

Usage: fileminer [OPTIONS] [dir]

Arguments:
  [dir]
      The directory to index (default: the current directory).

Options:
  -H, --hidden
          Index hidden files and directories (default: skipped). Files
          and directories are considered hidden if their name starts
          with a `.` sign (dot).

  -R, --no-recurse
          Only index the directory itself and its direct children.

  -i, --ignore <GLOB>
          Skip files whose basename matches GLOB. Can be given several
          times.

  -t, --throttle <FACTOR>
          Slow down indexing; 0 is full speed, 1 waits a second between
          batches.
"#;

struct Args {
    root: PathBuf,
    hidden: bool,
    recurse: bool,
    ignores: Vec<String>,
    throttle: f64,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut args = Args {
        root: PathBuf::new(),
        hidden: false,
        recurse: true,
        ignores: Vec::new(),
        throttle: 0.0,
    };
    let mut root = None;
    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Short('H') | Long("hidden") => args.hidden = true,
            Short('R') | Long("no-recurse") => args.recurse = false,
            Short('i') | Long("ignore") => args.ignores.push(parser.value()?.string()?),
            Short('t') | Long("throttle") => {
                args.throttle = parser
                    .value()?
                    .parse()
                    .map_err(|err| lexopt::Error::Custom(Box::new(err)))?
            }
            Long("help") => {
                println!("{HELP}");
                std::process::exit(0);
            }
            Value(value) if root.is_none() => root = Some(PathBuf::from(value)),
            _ => return Err(arg.unexpected()),
        }
    }
    args.root = root
        .map(Ok)
        .unwrap_or_else(std::env::current_dir)
        .map_err(|err| lexopt::Error::Custom(Box::new(err)))?;
    Ok(args)
}

pub fn main() -> Result<(), lexopt::Error> {
    let _ = env_logger::builder().try_init();
    let args = parse_args()?;

    let store = MemoryStore::new();
    let indexer = Indexer::new(store.clone()).unwrap();

    indexer.set_filter_hidden(!args.hidden);
    indexer.set_throttle(args.throttle);
    for glob in &args.ignores {
        indexer.add_filter(FilterKind::File, glob);
    }

    let mut flags = RootFlags::MONITOR;
    if args.recurse {
        flags |= RootFlags::RECURSE;
    }
    indexer
        .add_root(&args.root, flags)
        .map_err(|err| lexopt::Error::Custom(Box::new(err)))?;

    let (tx, rx) = mpsc::channel();
    let printer = store.clone();
    let mut seen = 0;
    indexer.add_handler(move |event| {
        printer.with_inner(|inner| {
            for update in &inner.update_log[seen..] {
                println!("{update}");
            }
            seen = inner.update_log.len();
        });
        if let MinerEvent::Finished { files_found, files_ignored, changes_processed, .. } = event {
            println!(
                "-- idle: {files_found} files found, {files_ignored} ignored, \
                 {changes_processed} changes"
            );
            let _ = tx.send(());
        }
        true
    });

    indexer.start();
    // print the rest of the session's changes as they happen
    let _ = rx.recv_timeout(Duration::from_secs(600));
    std::thread::sleep(Duration::from_secs(60 * 60));
    Ok(())
}
