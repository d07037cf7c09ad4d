use std::hash::BuildHasher;
use std::io;
use std::path::{Path, PathBuf};

use hashbrown::DefaultHashBuilder;
use serde::{Deserialize, Serialize};

use crate::path::file_uri;

/// A persisted record of a failed store write for one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub uri: String,
    pub message: String,
    pub sparql: String,
}

/// Error-report store keyed by file uri. Reports survive restarts so a
/// user can inspect why a file is missing from the index; a later
/// successful write for the same file clears its report.
#[derive(Debug, Default)]
pub struct ErrorReports {
    dir: Option<PathBuf>,
    hasher: DefaultHashBuilder,
}

impl ErrorReports {
    pub fn new(dir: Option<PathBuf>) -> ErrorReports {
        if let Some(dir) = &dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                log::warn!("cannot create error report directory {dir:?}: {err}");
            }
        }
        ErrorReports { dir, hasher: DefaultHashBuilder::default() }
    }

    fn report_path(&self, uri: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        Some(dir.join(format!("{:016x}.json", self.hasher.hash_one(uri))))
    }

    pub fn report(&self, file: &Path, message: &str, sparql: &str) {
        let uri = file_uri(file);
        log::debug!("filing error report for {uri}: {message}");
        let Some(path) = self.report_path(&uri) else { return };
        let report = ErrorReport {
            uri,
            message: message.to_owned(),
            sparql: sparql.to_owned(),
        };
        let write = || -> io::Result<()> {
            let json = serde_json::to_string_pretty(&report).map_err(io::Error::other)?;
            std::fs::write(&path, json)
        };
        if let Err(err) = write() {
            log::warn!("cannot write error report {path:?}: {err}");
        }
    }

    /// Clears the report for `file`, if any.
    pub fn delete(&self, file: &Path) {
        let uri = file_uri(file);
        if let Some(path) = self.report_path(&uri) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn get(&self, file: &Path) -> Option<ErrorReport> {
        let uri = file_uri(file);
        let path = self.report_path(&uri)?;
        let json = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let reports = ErrorReports::new(Some(dir.path().join("reports")));
        let file = Path::new("/r/broken.txt");

        assert_eq!(reports.get(file), None);
        reports.report(file, "constraint violated", "INSERT DATA { }");
        let report = reports.get(file).unwrap();
        assert_eq!(report.uri, "file:///r/broken.txt");
        assert_eq!(report.message, "constraint violated");

        reports.delete(file);
        assert_eq!(reports.get(file), None);
    }

    #[test]
    fn disabled_without_directory() {
        let reports = ErrorReports::new(None);
        reports.report(Path::new("/r/a"), "boom", "");
        assert_eq!(reports.get(Path::new("/r/a")), None);
    }
}
