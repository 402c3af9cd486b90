//! The single runtime object shared by timers, transports and the renderer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Local;
use rand::rngs::StdRng;
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use crate::config::Configuration;
use crate::events::{RuntimeSettings, Status};
use crate::index::{Filters, ImageIndex};
use crate::playlist::{FrameRequest, PlaylistController, StateChange};
use crate::store::MetadataStore;

#[derive(Clone)]
pub struct Slideshow {
    inner: Arc<Inner>,
}

struct Inner {
    config: Configuration,
    store: MetadataStore,
    index: ImageIndex,
    playlist: Mutex<PlaylistController>,
    settings: Mutex<RuntimeSettings>,
    changes: watch::Sender<u64>,
    wake_timer: Notify,
    rescan: Notify,
    purge_requested: AtomicBool,
}

impl Slideshow {
    pub fn new(config: Configuration, store: MetadataStore, rng: StdRng) -> Self {
        let settings = RuntimeSettings {
            subdirectory: config.model.subdirectory.clone(),
            date_from: None,
            date_to: None,
            tags_filter: Vec::new(),
            time_delay: config.model.time_delay,
            fade_time: config.model.fade_time,
            shuffle: config.model.shuffle,
            paused: false,
            display_on: true,
        };
        let filters = filters_for(&config, &settings);
        let index = ImageIndex::new(store.clone(), filters);
        let playlist = PlaylistController::new(
            config.playlist_options(),
            config.model.no_files_img.clone(),
            rng,
        );
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                index,
                playlist: Mutex::new(playlist),
                settings: Mutex::new(settings),
                changes,
                wake_timer: Notify::new(),
                rescan: Notify::new(),
                purge_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.inner.store
    }

    pub fn index(&self) -> &ImageIndex {
        &self.inner.index
    }

    fn playlist(&self) -> MutexGuard<'_, PlaylistController> {
        self.inner
            .playlist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn settings_mut(&self) -> MutexGuard<'_, RuntimeSettings> {
        self.inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.settings_mut().clone()
    }

    /// Receiver that observes a new value after every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    fn publish(&self) {
        self.inner.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn log_change(change: Option<StateChange>) {
        if let Some(StateChange { from, to }) = change {
            info!(from = from.as_str(), to = to.as_str(), "player state changed");
        }
    }

    /// Install the index's current snapshot into the playlist. Without
    /// `reset` this is skipped when the snapshot generation is unchanged; an
    /// older generation than the installed one is never installed.
    /// Runs a store query when the index is stale; call from blocking context.
    pub fn refresh_library(&self, reset: bool) {
        let snapshot = self.inner.index.snapshot();
        let change = {
            let mut playlist = self.playlist();
            let installed = playlist.snapshot().generation;
            if snapshot.generation < installed || (!reset && snapshot.generation == installed) {
                return;
            }
            playlist.install_snapshot(snapshot, reset)
        };
        Self::log_change(change);
        self.inner.wake_timer.notify_one();
        self.publish();
    }

    /// The store changed underneath the index.
    pub fn library_changed(&self) {
        self.inner.index.invalidate();
        self.refresh_library(false);
    }

    pub fn frame(&self, now: Instant) -> FrameRequest {
        self.playlist().frame(now)
    }

    /// Paths in current play order.
    pub fn ordering(&self) -> Vec<PathBuf> {
        self.playlist()
            .ordering()
            .into_iter()
            .map(std::path::Path::to_path_buf)
            .collect()
    }

    pub fn next_advance_at(&self) -> Option<Instant> {
        self.playlist().next_advance_at()
    }

    /// Timed advance; returns the newly shown path.
    pub fn tick_due(&self, now: Instant) -> Option<PathBuf> {
        let shown = {
            let mut playlist = self.playlist();
            playlist
                .tick_due(now)
                .then(|| playlist.current().path.clone())
        };
        if shown.is_some() {
            self.publish();
        }
        shown
    }

    pub fn next(&self) -> bool {
        self.navigate(PlaylistController::next)
    }

    pub fn back(&self) -> bool {
        self.navigate(PlaylistController::previous)
    }

    fn navigate(&self, step: fn(&mut PlaylistController) -> bool) -> bool {
        let shown = {
            let mut playlist = self.playlist();
            step(&mut *playlist).then(|| playlist.current().path.clone())
        };
        let Some(path) = shown else {
            return false;
        };
        self.record_displayed(&path);
        self.inner.wake_timer.notify_one();
        self.publish();
        true
    }

    pub fn record_displayed(&self, path: &std::path::Path) {
        if let Err(err) = self
            .inner
            .store
            .record_displayed(path, Local::now().naive_local())
        {
            warn!(path = %path.display(), error = %err, "failed to record display");
        }
    }

    pub fn status(&self) -> Status {
        let settings = self.settings();
        let playlist = self.playlist();
        Status {
            settings,
            state: playlist.state(),
            direction: playlist.direction(),
            current: playlist.current().clone(),
            image_counter: playlist.len(),
            position: playlist.position(),
            epoch: playlist.epoch(),
        }
    }

    /// Apply a filter-affecting settings change and reset playback when the
    /// effective filters moved.
    pub fn update_filters(&self, update: impl FnOnce(&mut RuntimeSettings)) {
        // settings and index filters change together
        let moved = {
            let mut settings = self.settings_mut();
            update(&mut settings);
            self.inner
                .index
                .set_filters(filters_for(&self.inner.config, &settings))
        };
        if moved {
            self.refresh_library(true);
        } else {
            self.publish();
        }
    }

    pub fn set_time_delay(&self, seconds: f64) {
        self.update_timing(|s| s.time_delay = seconds);
    }

    pub fn set_fade_time(&self, seconds: f64) {
        self.update_timing(|s| s.fade_time = seconds);
    }

    fn update_timing(&self, update: impl FnOnce(&mut RuntimeSettings)) {
        let (delay, fade) = {
            let mut settings = self.settings_mut();
            update(&mut settings);
            (settings.time_delay, settings.fade_time.min(settings.time_delay))
        };
        self.playlist()
            .set_timing(Duration::from_secs_f64(delay), Duration::from_secs_f64(fade));
        self.inner.wake_timer.notify_one();
        self.publish();
    }

    pub fn set_shuffle(&self, shuffle: bool) {
        self.settings_mut().shuffle = shuffle;
        self.playlist().set_shuffle(shuffle);
        self.publish();
    }

    pub fn set_paused(&self, paused: bool) {
        self.settings_mut().paused = paused;
        let change = self.playlist().set_paused(paused);
        Self::log_change(change);
        self.inner.wake_timer.notify_one();
        self.publish();
    }

    /// Switching the display off also pauses the show; on resumes it.
    pub fn set_display(&self, on: bool) {
        self.settings_mut().display_on = on;
        self.set_paused(!on);
    }

    pub fn request_purge(&self) {
        self.inner.purge_requested.store(true, Ordering::Release);
        self.inner.rescan.notify_one();
    }

    pub fn take_purge_request(&self) -> bool {
        self.inner.purge_requested.swap(false, Ordering::AcqRel)
    }

    pub fn request_rescan(&self) {
        self.inner.rescan.notify_one();
    }

    pub async fn rescan_requested(&self) {
        self.inner.rescan.notified().await;
    }

    /// Resolves when the advance deadline may have moved.
    pub async fn timer_changed(&self) {
        self.inner.wake_timer.notified().await;
    }
}

fn filters_for(config: &Configuration, settings: &RuntimeSettings) -> Filters {
    let sub = settings.subdirectory.trim_matches('/');
    Filters {
        subdirectory: (!sub.is_empty()).then(|| config.model.pic_dir.join(sub)),
        date_from: settings.date_from,
        date_to: settings.date_to,
        tags: settings.tags_filter.clone(),
    }
}
