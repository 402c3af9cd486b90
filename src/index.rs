//! Filterable in-memory view over the metadata store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{ImageRecord, MetadataStore};

/// Active playback filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    /// Absolute directory; only images below it are eligible.
    pub subdirectory: Option<PathBuf>,
    /// Inclusive lower bound on capture time.
    pub date_from: Option<NaiveDateTime>,
    /// Inclusive upper bound on capture time.
    pub date_to: Option<NaiveDateTime>,
    /// Keep images carrying any of these keywords (case-insensitive).
    pub tags: Vec<String>,
}

/// Immutable, path-ordered set of images eligible for playback.
#[derive(Debug, Clone, Default)]
pub struct LibrarySnapshot {
    /// Increases every time a rebuilt snapshot is published.
    pub generation: u64,
    pub filters: Filters,
    records: Arc<[ImageRecord]>,
}

impl LibrarySnapshot {
    pub fn new(filters: Filters, records: Vec<ImageRecord>) -> Self {
        Self {
            generation: 0,
            filters,
            records: records.into(),
        }
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn get(&self, idx: usize) -> Option<&ImageRecord> {
        self.records.get(idx)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn position(&self, path: &Path) -> Option<usize> {
        self.records.iter().position(|r| r.path == path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.records.iter().map(|r| r.path.as_path())
    }
}

struct Published {
    filters: Filters,
    snapshot: Arc<LibrarySnapshot>,
}

/// Holds the current [`LibrarySnapshot`] and rebuilds it lazily after invalidation.
pub struct ImageIndex {
    store: MetadataStore,
    published: RwLock<Published>,
    /// Serializes rebuilds so a caller never reads a snapshot another caller
    /// is still replacing.
    rebuilding: Mutex<()>,
    stale: AtomicBool,
    generation: AtomicU64,
}

impl ImageIndex {
    pub fn new(store: MetadataStore, filters: Filters) -> Self {
        Self {
            store,
            published: RwLock::new(Published {
                filters,
                snapshot: Arc::new(LibrarySnapshot::default()),
            }),
            rebuilding: Mutex::new(()),
            stale: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        }
    }

    /// Query the store for `filters`. Does not touch the published snapshot.
    pub fn rebuild(&self, filters: &Filters) -> Result<LibrarySnapshot> {
        let records = self.store.query(filters)?;
        Ok(LibrarySnapshot::new(filters.clone(), records))
    }

    /// Mark the published snapshot stale; the next [`snapshot`](Self::snapshot) rebuilds it.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn filters(&self) -> Filters {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .filters
            .clone()
    }

    /// Replace the filters; returns `false` if they were already in effect.
    pub fn set_filters(&self, filters: Filters) -> bool {
        let mut published = self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if published.filters == filters {
            return false;
        }
        published.filters = filters;
        self.invalidate();
        true
    }

    /// Current snapshot, rebuilt first when stale. A caller arriving during
    /// another caller's rebuild waits for it. On a store error the last
    /// published snapshot is returned and the index stays stale.
    pub fn snapshot(&self) -> Arc<LibrarySnapshot> {
        let _rebuilding = self
            .rebuilding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while self.stale.swap(false, Ordering::AcqRel) {
            let filters = self.filters();
            let mut fresh = match self.rebuild(&filters) {
                Ok(fresh) => fresh,
                Err(err) => {
                    warn!(error = %err, "snapshot rebuild failed; keeping previous");
                    self.invalidate();
                    break;
                }
            };
            let mut published = self
                .published
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // filters moved on while we were querying; set_filters marked us stale again
            if published.filters != filters {
                continue;
            }
            fresh.generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(
                generation = fresh.generation,
                images = fresh.len(),
                "library snapshot published"
            );
            published.snapshot = Arc::new(fresh);
        }
        Arc::clone(
            &self
                .published
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot,
        )
    }
}
