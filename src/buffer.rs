use std::mem::take;
use std::path::{Path, PathBuf};

use crate::path::{basename, file_uri};
use crate::store::{
    FileResource, StoreError, StoreHandle, Update, CONTENT_GRAPHS, FILESYSTEM_GRAPH,
};

/// Default soft limit on buffered tasks before upstream is told to
/// flush.
pub const BUFFER_LIMIT: usize = 800;

/// A file scoped unit of buffered work, kept for error reporting.
#[derive(Debug, Clone)]
pub struct Task {
    pub path: PathBuf,
    pub sparql: String,
}

/// Batched write buffer against the store: accumulates updates plus a
/// task per touched file, flushes asynchronously, at most one flush in
/// flight.
#[derive(Debug)]
pub struct SparqlBuffer {
    store: StoreHandle,
    batch: Vec<Update>,
    tasks: Vec<Task>,
    in_flight: Option<Vec<Task>>,
    limit: usize,
}

impl SparqlBuffer {
    pub fn new(store: StoreHandle, limit: usize) -> SparqlBuffer {
        SparqlBuffer { store, batch: Vec::new(), tasks: Vec::new(), in_flight: None, limit }
    }

    fn push(&mut self, path: &Path, update: Update) {
        self.tasks.push(Task { path: path.to_owned(), sparql: update.sparql() });
        self.batch.push(update);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len() + self.in_flight.as_ref().map_or(0, Vec::len)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True once the pending task count asks for a flush.
    pub fn limit_reached(&self) -> bool {
        self.tasks.len() >= self.limit
    }

    pub fn flushing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn log_delete(&mut self, file: &Path) {
        self.push(file, Update::DeleteFile { uri: file_uri(file) });
    }

    /// Removes everything stored below `dir`, not `dir` itself.
    pub fn log_delete_content(&mut self, dir: &Path) {
        self.push(dir, Update::DeleteFolderContents { uri: file_uri(dir) });
    }

    /// Drops the extracted content attached to `file`, keeping the file
    /// data object itself.
    pub fn log_clear_content(&mut self, file: &Path) {
        self.push(file, Update::DeleteFileContent { uri: file_uri(file) });
    }

    pub fn log_move(&mut self, source: &Path, dest: &Path, dest_data_source: &str) {
        let parent_uri = dest.parent().map(file_uri).unwrap_or_default();
        let update = Update::MoveFile {
            source_uri: file_uri(source),
            dest_uri: file_uri(dest),
            new_filename: basename(dest).to_string_lossy().into_owned(),
            new_parent_uri: parent_uri,
            new_data_source: dest_data_source.to_owned(),
        };
        self.push(dest, update);
    }

    pub fn log_move_content(&mut self, source_dir: &Path, dest_dir: &Path) {
        let update = Update::MoveFolderContents {
            source_uri: file_uri(source_dir),
            dest_uri: file_uri(dest_dir),
        };
        self.push(dest_dir, update);
    }

    pub fn log_file(
        &mut self,
        file: &Path,
        file_resource: FileResource,
        content: Option<(String, FileResource)>,
    ) {
        self.push(
            file,
            Update::InsertResource { graph: FILESYSTEM_GRAPH.to_owned(), resource: file_resource },
        );
        if let Some((graph, resource)) = content {
            self.push(file, Update::InsertResource { graph, resource });
        }
    }

    pub fn log_folder(
        &mut self,
        file: &Path,
        is_root: bool,
        file_resource: FileResource,
        folder_resource: FileResource,
    ) {
        // indexing roots are mirrored into the content specific graphs
        // so content queries know which roots are available
        if is_root {
            for graph in CONTENT_GRAPHS {
                self.push(
                    file,
                    Update::InsertResource {
                        graph: graph.to_owned(),
                        resource: folder_resource.clone(),
                    },
                );
            }
        }
        self.push(
            file,
            Update::InsertResource { graph: FILESYSTEM_GRAPH.to_owned(), resource: file_resource },
        );
        self.push(
            file,
            Update::InsertResource {
                graph: FILESYSTEM_GRAPH.to_owned(),
                resource: folder_resource,
            },
        );
    }

    pub fn log_attributes_update(
        &mut self,
        file: &Path,
        file_resource: FileResource,
        content: Option<(String, FileResource)>,
    ) {
        if let Some((graph, resource)) = content {
            self.push(file, Update::InsertResource { graph, resource });
        }
        self.push(
            file,
            Update::InsertResource { graph: FILESYSTEM_GRAPH.to_owned(), resource: file_resource },
        );
    }

    /// Sends the current batch to the store. Returns false without side
    /// effects when a flush is already in flight or there is nothing to
    /// flush; the caller retries after the in-flight flush completes.
    pub fn flush(&mut self, reason: &str) -> bool {
        if self.in_flight.is_some() || self.tasks.is_empty() {
            return false;
        }
        log::debug!("flushing sparql buffer ({} tasks), reason: {reason}", self.tasks.len());
        self.in_flight = Some(take(&mut self.tasks));
        self.store.execute_batch(take(&mut self.batch));
        true
    }

    /// Resolves the in-flight flush, handing back its tasks so the
    /// caller can clear or file error reports.
    pub fn flush_done(&mut self, result: &Result<(), StoreError>) -> Vec<Task> {
        let tasks = self.in_flight.take().unwrap_or_default();
        if let Err(err) = result {
            log::warn!("could not execute sparql batch of {} tasks: {err}", tasks.len());
        }
        tasks
    }
}
