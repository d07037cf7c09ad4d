use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::events::{Mailbox, Msg};
use crate::path::uri_to_path;

pub const FILESYSTEM_GRAPH: &str = "tracker:FileSystem";

/// Content specific graphs that indexing roots are mirrored into so
/// content queries can tell which roots are available.
pub const CONTENT_GRAPHS: [&str; 5] = [
    "tracker:Audio",
    "tracker:Documents",
    "tracker:Pictures",
    "tracker:Software",
    "tracker:Video",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// the database is beyond repair, the application is expected to
    /// back it up and reindex from scratch
    #[error("store is corrupt")]
    Corrupt,
    #[error("no space left on the store device")]
    NoSpace,
    #[error("{0}")]
    Backend(String),
}

/// One row of the index-root content query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRow {
    pub uri: String,
    /// present iff the stored resource is a folder
    pub folder_urn: Option<String>,
    pub modified: DateTime<Utc>,
    pub extractor_hash: Option<String>,
    pub mimetype: Option<String>,
}

/// A file or folder resource about to be written into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResource {
    pub uri: String,
    pub filename: String,
    pub modified: DateTime<Utc>,
    pub mimetype: Option<String>,
    pub extractor_hash: Option<String>,
    /// uri of the indexing root this file belongs to
    pub data_source: Option<String>,
    /// uri of the containing folder
    pub parent_uri: Option<String>,
    /// content identifier urn; folders carry one, plain files don't
    pub folder_urn: Option<String>,
}

/// One ordered element of an update batch. Updates are structured so
/// backends can execute them natively; `sparql()` renders the textual
/// form carried by tasks and error reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    DeleteFile { uri: String },
    DeleteFileContent { uri: String },
    DeleteFolderContents { uri: String },
    MoveFile {
        source_uri: String,
        dest_uri: String,
        new_filename: String,
        new_parent_uri: String,
        new_data_source: String,
    },
    MoveFolderContents { source_uri: String, dest_uri: String },
    InsertResource { graph: String, resource: FileResource },
}

fn xsd_datetime(datetime: &DateTime<Utc>) -> String {
    datetime.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Update {
    pub fn sparql(&self) -> String {
        match self {
            Update::DeleteFile { uri } => format!(
                "DELETE WHERE {{ GRAPH <{FILESYSTEM_GRAPH}> {{ <{uri}> a rdfs:Resource }} }}; \
                 DELETE WHERE {{ ?ie nie:isStoredAs <{uri}> ; a rdfs:Resource }}"
            ),
            Update::DeleteFileContent { uri } => format!(
                "DELETE WHERE {{ ?ie nie:isStoredAs <{uri}> . \
                 ?ie nie:interpretedAs ?content . ?content a rdfs:Resource }}"
            ),
            Update::DeleteFolderContents { uri } => format!(
                "DELETE WHERE {{ GRAPH <{FILESYSTEM_GRAPH}> {{ \
                 ?f nie:url ?url . FILTER (STRSTARTS (?url, \"{uri}/\")) }} }}"
            ),
            Update::MoveFile { source_uri, dest_uri, new_filename, new_parent_uri, new_data_source } => {
                format!(
                    "DELETE {{ <{source_uri}> nie:url ?url ; nfo:fileName ?name ; \
                     nfo:belongsToContainer ?parent ; nie:dataSource ?source }} \
                     INSERT {{ <{source_uri}> nie:url \"{dest_uri}\" ; \
                     nfo:fileName \"{new_filename}\" ; \
                     nfo:belongsToContainer <{new_parent_uri}> ; \
                     nie:dataSource <{new_data_source}> }} \
                     WHERE {{ <{source_uri}> nie:url ?url }}"
                )
            }
            Update::MoveFolderContents { source_uri, dest_uri } => format!(
                "DELETE {{ ?f nie:url ?url }} INSERT {{ ?f nie:url ?new }} \
                 WHERE {{ ?f nie:url ?url . FILTER (STRSTARTS (?url, \"{source_uri}/\")) . \
                 BIND (CONCAT (\"{dest_uri}/\", STRAFTER (?url, \"{source_uri}/\")) AS ?new) }}"
            ),
            Update::InsertResource { graph, resource } => {
                let mut sparql = format!(
                    "INSERT DATA {{ GRAPH <{graph}> {{ <{uri}> a nfo:FileDataObject ; \
                     nfo:fileName \"{name}\" ; nfo:fileLastModified \"{mtime}\"^^xsd:dateTime",
                    uri = resource.uri,
                    name = resource.filename,
                    mtime = xsd_datetime(&resource.modified),
                );
                if let Some(mimetype) = &resource.mimetype {
                    sparql.push_str(&format!(" ; nie:mimeType \"{mimetype}\""));
                }
                if let Some(hash) = &resource.extractor_hash {
                    sparql.push_str(&format!(" ; tracker:extractorHash \"{hash}\""));
                }
                if let Some(source) = &resource.data_source {
                    sparql.push_str(&format!(" ; nie:dataSource <{source}>"));
                }
                if let Some(parent) = &resource.parent_uri {
                    sparql.push_str(&format!(" ; nfo:belongsToContainer <{parent}>"));
                }
                if let Some(urn) = &resource.folder_urn {
                    sparql.push_str(&format!(
                        " . <{urn}> a nfo:Folder ; nie:isStoredAs <{uri}>",
                        uri = resource.uri
                    ));
                }
                sparql.push_str(" } }");
                sparql
            }
        }
    }
}

/// The SPARQL connection as the core sees it: the named queries it
/// issues plus the atomic ordered batch primitive. Implementations run
/// on the store endpoint thread.
pub trait Store: Send + 'static {
    /// `get-index-root-content.rq`: every file-data object whose
    /// `nie:dataSource` is `root_uri`, ordered by uri.
    fn index_root_content(&mut self, root_uri: &str) -> Result<Vec<StoreRow>, StoreError>;
    /// `get-file-mimetype.rq`
    fn file_mimetype(&mut self, uri: &str) -> Result<Option<String>, StoreError>;
    /// `ask-file-exists.rq`
    fn file_exists(&mut self, uri: &str) -> Result<bool, StoreError>;
    /// `get-folder-count.rq`
    fn folder_count(&mut self) -> Result<u64, StoreError>;
    /// Executes `updates` atomically, in order.
    fn execute_batch(&mut self, updates: &[Update]) -> Result<(), StoreError>;
}

enum StoreRequest {
    RootContent { root_uri: String, reply: mpsc::Sender<Result<Vec<StoreRow>, StoreError>> },
    Mimetype { uri: String, reply: mpsc::Sender<Result<Option<String>, StoreError>> },
    Exists { uri: String, reply: mpsc::Sender<Result<bool, StoreError>> },
    FolderCount { reply: mpsc::Sender<Result<u64, StoreError>> },
    Execute { updates: Vec<Update> },
    Shutdown,
}

/// Handle to the store endpoint thread. Queries are synchronous (the
/// pipeline only issues them at batch boundaries), batch execution is
/// asynchronous and completes into the worker mailbox.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreRequest>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

fn endpoint_gone<T>() -> Result<T, StoreError> {
    Err(StoreError::Backend("store endpoint is gone".to_owned()))
}

impl StoreHandle {
    pub fn spawn(mut store: impl Store, mailbox: Arc<Mailbox>) -> StoreHandle {
        let (tx, rx) = mpsc::channel::<StoreRequest>();
        thread::spawn(move || {
            while let Ok(request) = rx.recv() {
                match request {
                    StoreRequest::RootContent { root_uri, reply } => {
                        let _ = reply.send(store.index_root_content(&root_uri));
                    }
                    StoreRequest::Mimetype { uri, reply } => {
                        let _ = reply.send(store.file_mimetype(&uri));
                    }
                    StoreRequest::Exists { uri, reply } => {
                        let _ = reply.send(store.file_exists(&uri));
                    }
                    StoreRequest::FolderCount { reply } => {
                        let _ = reply.send(store.folder_count());
                    }
                    StoreRequest::Execute { updates } => {
                        let result = store.execute_batch(&updates);
                        mailbox.push(Msg::FlushDone { result });
                    }
                    StoreRequest::Shutdown => break,
                }
            }
        });
        StoreHandle { tx }
    }

    fn request<T>(
        &self,
        make: impl FnOnce(mpsc::Sender<Result<T, StoreError>>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (reply, rx) = mpsc::channel();
        if self.tx.send(make(reply)).is_err() {
            return endpoint_gone();
        }
        rx.recv().unwrap_or_else(|_| endpoint_gone())
    }

    pub fn index_root_content(&self, root_uri: &str) -> Result<Vec<StoreRow>, StoreError> {
        let root_uri = root_uri.to_owned();
        self.request(|reply| StoreRequest::RootContent { root_uri, reply })
    }

    pub fn file_mimetype(&self, uri: &str) -> Result<Option<String>, StoreError> {
        let uri = uri.to_owned();
        self.request(|reply| StoreRequest::Mimetype { uri, reply })
    }

    pub fn file_exists(&self, uri: &str) -> Result<bool, StoreError> {
        let uri = uri.to_owned();
        self.request(|reply| StoreRequest::Exists { uri, reply })
    }

    pub fn folder_count(&self) -> Result<u64, StoreError> {
        self.request(|reply| StoreRequest::FolderCount { reply })
    }

    /// Fire-and-forget; completion arrives as [`Msg::FlushDone`].
    pub fn execute_batch(&self, updates: Vec<Update>) {
        let _ = self.tx.send(StoreRequest::Execute { updates });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(StoreRequest::Shutdown);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub folder_urn: Option<String>,
    pub modified: DateTime<Utc>,
    pub extractor_hash: Option<String>,
    pub mimetype: Option<String>,
    pub data_source: Option<String>,
    pub content_cleared: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStoreInner {
    pub entries: BTreeMap<String, MemoryEntry>,
    pub update_log: Vec<String>,
    pub fail_next_batch: Option<StoreError>,
}

fn child_uris(entries: &BTreeMap<String, MemoryEntry>, uri: &str) -> Vec<String> {
    let prefix = format!("{uri}/");
    entries.keys().filter(|k| k.starts_with(&prefix)).cloned().collect()
}

impl MemoryStoreInner {
    fn apply(&mut self, update: &Update) {
        match update {
            Update::DeleteFile { uri } => {
                self.entries.remove(uri);
            }
            Update::DeleteFileContent { uri } => {
                if let Some(entry) = self.entries.get_mut(uri) {
                    entry.content_cleared = true;
                }
            }
            Update::DeleteFolderContents { uri } => {
                for child in child_uris(&self.entries, uri) {
                    self.entries.remove(&child);
                }
            }
            Update::MoveFile { source_uri, dest_uri, new_data_source, .. } => {
                if let Some(mut entry) = self.entries.remove(source_uri) {
                    entry.data_source = Some(new_data_source.clone());
                    self.entries.insert(dest_uri.clone(), entry);
                }
            }
            Update::MoveFolderContents { source_uri, dest_uri } => {
                for child in child_uris(&self.entries, source_uri) {
                    let entry = self.entries.remove(&child).unwrap();
                    let moved = format!("{dest_uri}{}", &child[source_uri.len()..]);
                    self.entries.insert(moved, entry);
                }
            }
            Update::InsertResource { graph, resource } => {
                // content graph mirrors don't hold file data
                if graph != FILESYSTEM_GRAPH {
                    return;
                }
                self.entries.insert(
                    resource.uri.clone(),
                    MemoryEntry {
                        folder_urn: resource.folder_urn.clone(),
                        modified: resource.modified,
                        extractor_hash: resource.extractor_hash.clone(),
                        mimetype: resource.mimetype.clone(),
                        data_source: resource.data_source.clone(),
                        content_cleared: false,
                    },
                );
            }
        }
    }
}

/// In-memory [`Store`] used by the tests and the demo. Cloning yields
/// another handle onto the same contents so tests can inspect the store
/// while the pipeline owns the other handle.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn with_inner<R>(&self, f: impl FnOnce(&mut MemoryStoreInner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    /// Sorted filesystem paths of everything currently stored.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.with_inner(|inner| inner.entries.keys().filter_map(|uri| uri_to_path(uri)).collect())
    }

    pub fn entry(&self, uri: &str) -> Option<MemoryEntry> {
        self.with_inner(|inner| inner.entries.get(uri).cloned())
    }

    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next batch execution fail with `error`.
    pub fn fail_next_batch(&self, error: StoreError) {
        self.with_inner(|inner| inner.fail_next_batch = Some(error));
    }
}

impl Store for MemoryStore {
    fn index_root_content(&mut self, root_uri: &str) -> Result<Vec<StoreRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.data_source.as_deref() == Some(root_uri))
            .map(|(uri, entry)| StoreRow {
                uri: uri.clone(),
                folder_urn: entry.folder_urn.clone(),
                modified: entry.modified,
                extractor_hash: entry.extractor_hash.clone(),
                mimetype: entry.mimetype.clone(),
            })
            .collect())
    }

    fn file_mimetype(&mut self, uri: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(uri).and_then(|entry| entry.mimetype.clone()))
    }

    fn file_exists(&mut self, uri: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.contains_key(uri))
    }

    fn folder_count(&mut self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.values().filter(|entry| entry.folder_urn.is_some()).count() as u64)
    }

    fn execute_batch(&mut self, updates: &[Update]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_batch.take() {
            return Err(error);
        }
        for update in updates {
            inner.update_log.push(update.sparql());
            inner.apply(update);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(uri: &str, source: &str, folder: bool) -> Update {
        Update::InsertResource {
            graph: FILESYSTEM_GRAPH.to_owned(),
            resource: FileResource {
                uri: uri.to_owned(),
                filename: uri.rsplit('/').next().unwrap().to_owned(),
                modified: DateTime::UNIX_EPOCH,
                mimetype: None,
                extractor_hash: None,
                data_source: Some(source.to_owned()),
                parent_uri: None,
                folder_urn: folder.then(|| format!("urn:test:{uri}")),
            },
        }
    }

    #[test]
    fn memory_store_reconciliation_queries() {
        let mut store = MemoryStore::new();
        store
            .execute_batch(&[
                resource("file:///r", "file:///r", true),
                resource("file:///r/a.txt", "file:///r", false),
                resource("file:///other/b", "file:///other", false),
            ])
            .unwrap();

        let rows = store.index_root_content("file:///r").unwrap();
        assert_eq!(rows.len(), 2);
        // ordered by uri
        assert_eq!(rows[0].uri, "file:///r");
        assert!(rows[0].folder_urn.is_some());
        assert!(store.file_exists("file:///r/a.txt").unwrap());
        assert!(!store.file_exists("file:///r/missing").unwrap());
        assert_eq!(store.folder_count().unwrap(), 1);
    }

    #[test]
    fn memory_store_moves_and_deletes() {
        let mut store = MemoryStore::new();
        store
            .execute_batch(&[
                resource("file:///r", "file:///r", true),
                resource("file:///r/d", "file:///r", true),
                resource("file:///r/d/x", "file:///r", false),
            ])
            .unwrap();

        store
            .execute_batch(&[
                Update::MoveFile {
                    source_uri: "file:///r/d".into(),
                    dest_uri: "file:///r/e".into(),
                    new_filename: "e".into(),
                    new_parent_uri: "file:///r".into(),
                    new_data_source: "file:///r".into(),
                },
                Update::MoveFolderContents {
                    source_uri: "file:///r/d".into(),
                    dest_uri: "file:///r/e".into(),
                },
            ])
            .unwrap();
        assert!(store.file_exists("file:///r/e/x").unwrap());
        assert!(!store.file_exists("file:///r/d").unwrap());

        store
            .execute_batch(&[
                Update::DeleteFolderContents { uri: "file:///r".into() },
                Update::DeleteFile { uri: "file:///r".into() },
            ])
            .unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn rendered_sparql_carries_the_uri() {
        let update = Update::DeleteFile { uri: "file:///r/a.txt".into() };
        assert!(update.sparql().contains("file:///r/a.txt"));
    }
}
