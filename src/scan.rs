//! Library scanning: walk the picture root, extract metadata for new or
//! changed files and soft-delete rows whose files disappeared.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};
use crate::events::ScanResult;
use crate::meta::{Extracted, Extractor};
use crate::store::{Fingerprint, MetadataStore, Upsert, UpsertOutcome};

/// Formats the `image` build can decode.
const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

/// Rows written per store transaction.
const BATCH_SIZE: usize = 64;

/// Return `true` if `path` has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
}

pub struct LibraryScanner {
    store: MetadataStore,
    extractor: Arc<dyn Extractor>,
    follow_links: bool,
}

impl LibraryScanner {
    pub fn new(store: MetadataStore, extractor: Arc<dyn Extractor>, follow_links: bool) -> Self {
        Self {
            store,
            extractor,
            follow_links,
        }
    }

    /// Reconcile the store with the files under `root` (or `root/subdir`).
    ///
    /// Unchanged files are not re-read. A file whose extraction fails is
    /// still recorded with empty attributes so it stays displayable. When
    /// the walk hit errors or was cancelled, nothing is marked missing.
    ///
    /// # Errors
    /// Returns [`Error::LibraryUnavailable`] if the scan base is not a
    /// readable directory, or a store error.
    #[instrument(skip(self, cancel), fields(root = %root.display()))]
    pub fn scan(
        &self,
        root: &Path,
        subdir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        let started = Instant::now();
        let base = match subdir {
            Some(sub) => root.join(sub),
            None => root.to_path_buf(),
        };
        if !base.is_dir() {
            return Err(Error::LibraryUnavailable(base));
        }

        let stored = self.store.fingerprints()?;
        let version = self.extractor.version();
        let mut result = ScanResult::default();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut batch: Vec<Upsert> = Vec::with_capacity(BATCH_SIZE);
        let mut restored: Vec<PathBuf> = Vec::new();
        let mut walk_errors = 0usize;
        let mut cancelled = false;

        let walker = WalkDir::new(&base)
            .follow_links(self.follow_links)
            .into_iter()
            .filter_entry(|e| !is_hidden(e));

        for entry in walker {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    walk_errors += 1;
                    warn!(error = %err, "walk error");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_supported_image(entry.path()) {
                continue;
            }
            let path = entry.path().to_path_buf();
            let fingerprint = match entry.metadata() {
                Ok(md) => match Fingerprint::from_metadata(&md) {
                    Ok(fp) => fp,
                    Err(err) => {
                        walk_errors += 1;
                        warn!(path = %path.display(), error = %err, "unreadable file time");
                        continue;
                    }
                },
                Err(err) => {
                    walk_errors += 1;
                    warn!(path = %path.display(), error = %err, "stat failed");
                    continue;
                }
            };
            seen.insert(path.clone());

            if let Some(known) = stored.get(&path)
                && known.fingerprint == fingerprint
                && known.extractor_version >= version
            {
                if known.missing {
                    restored.push(path);
                }
                continue;
            }

            let extracted = match self.extractor.extract(&path) {
                Ok(extracted) => extracted,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "metadata extraction failed");
                    Extracted::default()
                }
            };
            batch.push(Upsert {
                path,
                fingerprint,
                extracted,
                extractor_version: version,
            });
            if batch.len() >= BATCH_SIZE {
                self.flush(&mut batch, &mut result)?;
            }
        }
        self.flush(&mut batch, &mut result)?;

        if !restored.is_empty() {
            self.store.restore(&restored)?;
            result.added.extend(restored);
        }

        if cancelled {
            info!(added = result.added.len(), updated = result.updated.len(), "scan cancelled");
            return Ok(result);
        }
        if walk_errors > 0 {
            warn!(walk_errors, "scan incomplete; skipping removal of unseen files");
        } else {
            let gone: Vec<PathBuf> = stored
                .iter()
                .filter(|(path, known)| {
                    !known.missing && path.starts_with(&base) && !seen.contains(*path)
                })
                .map(|(path, _)| path.clone())
                .collect();
            if !gone.is_empty() {
                self.store.mark_missing(&gone)?;
                result.removed = gone;
            }
        }

        info!(
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            seen = seen.len(),
            elapsed = %humantime::format_duration(round_millis(started.elapsed())),
            "library scan complete"
        );
        Ok(result)
    }

    fn flush(&self, batch: &mut Vec<Upsert>, result: &mut ScanResult) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let outcomes = self.store.upsert_batch(batch)?;
        for (entry, outcome) in batch.drain(..).zip(outcomes) {
            match outcome {
                UpsertOutcome::Inserted => result.added.push(entry.path),
                UpsertOutcome::Updated => result.updated.push(entry.path),
                UpsertOutcome::Unchanged => {}
            }
        }
        debug!(added = result.added.len(), updated = result.updated.len(), "scan batch written");
        Ok(())
    }
}

fn round_millis(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(d.as_millis() as u64)
}

/// Dot-files and dot-directories below the root are skipped.
fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Extractor for Counting {
        fn extract(&self, path: &Path) -> anyhow::Result<Extracted> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if path.to_string_lossy().contains("broken") {
                anyhow::bail!("corrupt image");
            }
            Ok(Extracted::default())
        }
    }

    fn scanner(store: &MetadataStore) -> (LibraryScanner, Arc<Counting>) {
        let counting = Arc::new(Counting::default());
        let scanner = LibraryScanner::new(store.clone(), counting.clone(), false);
        (scanner, counting)
    }

    #[test]
    fn supported_extensions_are_case_insensitive() {
        assert!(is_supported_image(Path::new("a/B.JPG")));
        assert!(is_supported_image(Path::new("scan.TIFF")));
        assert!(!is_supported_image(Path::new("x.heic")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("noext")));
    }

    #[test]
    fn hidden_entries_and_other_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".thumbs")).unwrap();
        fs::write(dir.path().join(".thumbs/a.jpg"), b"x").unwrap();
        fs::write(dir.path().join(".hidden.jpg"), b"x").unwrap();
        fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        fs::write(dir.path().join("shown.jpg"), b"x").unwrap();

        let store = MetadataStore::open_in_memory().unwrap();
        let (scanner, _) = scanner(&store);
        let result = scanner
            .scan(dir.path(), None, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.added, vec![dir.path().join("shown.jpg")]);
    }

    #[test]
    fn failed_extraction_still_records_the_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.jpg"), b"not an image").unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let (scanner, _) = scanner(&store);
        scanner
            .scan(dir.path(), None, &CancellationToken::new())
            .unwrap();
        let record = store.get(&dir.path().join("broken.jpg")).unwrap().unwrap();
        assert!(record.attributes.is_empty());
        assert!(record.captured_at.is_some());
    }

    #[test]
    fn missing_root_is_unavailable() {
        let store = MetadataStore::open_in_memory().unwrap();
        let (scanner, _) = scanner(&store);
        let err = scanner
            .scan(Path::new("/definitely/not/here"), None, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::LibraryUnavailable(_)));
    }

    #[test]
    fn reappearing_file_is_restored_without_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        fs::write(&file, b"x").unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let (scanner, counting) = scanner(&store);
        let cancel = CancellationToken::new();
        scanner.scan(dir.path(), None, &cancel).unwrap();

        store.mark_missing(std::slice::from_ref(&file)).unwrap();
        let result = scanner.scan(dir.path(), None, &cancel).unwrap();
        assert_eq!(result.added, vec![file.clone()]);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert!(!store.get(&file).unwrap().unwrap().missing);
    }

    #[test]
    fn cancelled_scan_marks_nothing_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let (scanner, _) = scanner(&store);
        scanner
            .scan(dir.path(), None, &CancellationToken::new())
            .unwrap();
        fs::remove_file(dir.path().join("a.jpg")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = scanner.scan(dir.path(), None, &cancel).unwrap();
        assert!(result.is_empty());
        assert_eq!(store.count().unwrap(), 1);
    }
}
