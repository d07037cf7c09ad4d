use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::path::is_hidden;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileType {
    Regular,
    Directory,
    /// symlinks, fifos, sockets and friends; never indexed
    Other,
}

/// A NOFOLLOW_SYMLINKS stat snapshot carrying the attribute set the
/// indexer cares about: file type, hidden flag, modification time and
/// wether the file is a mount point.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileInfo {
    pub file_type: FileType,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub inode: u64,
    pub device: u64,
    pub is_hidden: bool,
    pub is_mountpoint: bool,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// A synthetic snapshot for files that can no longer be statted
    /// (the source side of a move, typically): only the file type and
    /// the hidden flag are meaningful.
    pub fn shallow(path: &Path, is_dir: bool) -> FileInfo {
        FileInfo {
            file_type: if is_dir { FileType::Directory } else { FileType::Regular },
            mtime: DateTime::UNIX_EPOCH,
            size: 0,
            inode: 0,
            device: 0,
            is_hidden: is_hidden(path),
            is_mountpoint: false,
        }
    }

    /// Stats `path` without following symlinks. The mount point check
    /// compares device numbers against the parent directory, which
    /// costs a second stat and is therefore only done for directories.
    pub fn query(path: &Path) -> io::Result<FileInfo> {
        let stat = lstat(path)?;
        let parent_dev = if stat.file_type == FileType::Directory {
            path.parent().and_then(|parent| lstat(parent).ok()).map(|s| s.device)
        } else {
            None
        };
        Ok(FileInfo {
            is_mountpoint: parent_dev.is_some_and(|dev| dev != stat.device),
            is_hidden: is_hidden(path),
            ..stat
        })
    }

    /// Like [`FileInfo::query`] but with the §7 crawl error policy
    /// applied: NotFound and PermissionDenied are logged at debug level
    /// and swallowed, anything else is logged as an error.
    pub fn query_quiet(path: &Path) -> Option<FileInfo> {
        match FileInfo::query(path) {
            Ok(info) => Some(info),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                log::debug!("skipping {path:?}: {err}");
                None
            }
            Err(err) => {
                log::error!("failed to stat {path:?}: {err}");
                None
            }
        }
    }
}

#[cfg(unix)]
fn lstat(path: &Path) -> io::Result<FileInfo> {
    use rustix::fs::FileType as RawType;

    let stat = rustix::fs::lstat(path)?;
    let file_type = match RawType::from_raw_mode(stat.st_mode) {
        RawType::RegularFile => FileType::Regular,
        RawType::Directory => FileType::Directory,
        _ => FileType::Other,
    };
    // store comparisons happen at second precision, truncate here so
    // that disk and store mtimes compare cleanly
    let mtime = DateTime::from_timestamp(stat.st_mtime as i64, 0)
        .unwrap_or_else(|| DateTime::UNIX_EPOCH);
    Ok(FileInfo {
        file_type,
        mtime,
        size: stat.st_size as u64,
        inode: stat.st_ino as u64,
        device: stat.st_dev as u64,
        is_hidden: false,
        is_mountpoint: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_types() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("file"), "contents").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join(".dot"), "").unwrap();

        let file = FileInfo::query(&dir.path().join("file")).unwrap();
        assert_eq!(file.file_type, FileType::Regular);
        assert_eq!(file.size, 8);
        assert!(!file.is_hidden);

        let sub = FileInfo::query(&dir.path().join("sub")).unwrap();
        assert!(sub.is_dir());
        assert!(!sub.is_mountpoint);

        assert!(FileInfo::query(&dir.path().join(".dot")).unwrap().is_hidden);
        assert!(FileInfo::query(&dir.path().join("missing")).is_err());
        assert!(FileInfo::query_quiet(&dir.path().join("missing")).is_none());
    }
}
