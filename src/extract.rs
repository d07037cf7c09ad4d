use std::path::Path;
use std::sync::Mutex;

use hashbrown::HashMap;

/// Registry of metadata-extractor modules, keyed by mimetype. Each
/// module carries an opaque hash; a mismatch between the hash recorded
/// in the store and the current one forces re-extraction even when the
/// file itself did not change.
#[derive(Debug, Default)]
pub struct ExtractorRegistry {
    hashes: Mutex<HashMap<String, String>>,
}

impl ExtractorRegistry {
    pub fn new() -> ExtractorRegistry {
        ExtractorRegistry::default()
    }

    pub fn set_hash(&self, mimetype: &str, hash: &str) {
        self.hashes.lock().unwrap().insert(mimetype.to_owned(), hash.to_owned());
    }

    /// The hash of the module currently responsible for `mimetype`, or
    /// `None` when no extractor covers it.
    pub fn hash_for(&self, mimetype: &str) -> Option<String> {
        self.hashes.lock().unwrap().get(mimetype).cloned()
    }
}

/// Cheap extension based mimetype guess. The real sniffing happens in
/// the out-of-process extractor, the indexer only needs a stable tag to
/// route files to extractor modules.
pub fn guess_mimetype(path: &Path, is_dir: bool) -> String {
    if is_dir {
        return "inode/directory".to_owned();
    }
    let ext = path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
    let mime = match ext.as_deref() {
        Some("txt" | "text" | "log" | "md" | "rst") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("ogg" | "oga") => "audio/ogg",
        Some("mp4" | "m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    };
    mime.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_registry() {
        let registry = ExtractorRegistry::new();
        assert_eq!(registry.hash_for("text/plain"), None);
        registry.set_hash("text/plain", "abc1");
        assert_eq!(registry.hash_for("text/plain"), Some("abc1".into()));
        registry.set_hash("text/plain", "abc2");
        assert_eq!(registry.hash_for("text/plain"), Some("abc2".into()));
    }

    #[test]
    fn mimetypes() {
        assert_eq!(guess_mimetype(Path::new("/x"), true), "inode/directory");
        assert_eq!(guess_mimetype(Path::new("/x/a.TXT"), false), "text/plain");
        assert_eq!(guess_mimetype(Path::new("/x/a.bin"), false), "application/octet-stream");
    }
}
