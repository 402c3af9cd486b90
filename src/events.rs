use std::path::PathBuf;

use chrono::NaiveDateTime;

use crate::playlist::{Direction, PlayerState};
use crate::store::ImageRecord;

/// Outcome of one library scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub added: Vec<PathBuf>,
    pub updated: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ScanResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Settings a remote controller may change at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    /// Relative to the picture root; empty selects everything.
    pub subdirectory: String,
    pub date_from: Option<NaiveDateTime>,
    pub date_to: Option<NaiveDateTime>,
    pub tags_filter: Vec<String>,
    pub time_delay: f64,
    pub fade_time: f64,
    pub shuffle: bool,
    pub paused: bool,
    pub display_on: bool,
}

/// Consistent view of playback taken under one lock.
#[derive(Debug, Clone)]
pub struct Status {
    pub settings: RuntimeSettings,
    pub state: PlayerState,
    pub direction: Direction,
    pub current: ImageRecord,
    pub image_counter: usize,
    pub position: usize,
    pub epoch: u64,
}
