//! Playback position, shuffle and pause state over a [`LibrarySnapshot`].

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info};

use crate::index::LibrarySnapshot;
use crate::store::ImageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Playing,
    Paused,
    Empty,
}

impl PlayerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: PlayerState,
    pub to: PlayerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaylistOptions {
    pub shuffle: bool,
    /// Recently shown images kept out of the head of a fresh permutation.
    pub recent_n: usize,
    /// Full passes through one permutation before the next is drawn.
    pub reshuffle_num: u32,
    pub time_delay: Duration,
    pub fade_time: Duration,
}

/// What the renderer should draw right now.
#[derive(Debug, Clone)]
pub struct FrameRequest {
    pub state: PlayerState,
    pub current: ImageRecord,
    pub upcoming: Option<ImageRecord>,
    /// Cross-fade progress from `current` towards `upcoming`, `0.0..=1.0`.
    pub blend: f32,
}

/// Owns playback state. All methods are short and non-blocking; callers hold
/// one mutex around the controller.
pub struct PlaylistController {
    snapshot: Arc<LibrarySnapshot>,
    order: Vec<usize>,
    position: usize,
    paused: bool,
    direction: Direction,
    options: PlaylistOptions,
    epoch: u64,
    passes: u32,
    /// Permutation for the next pass, drawn once the last position is reached.
    pending: Option<Vec<usize>>,
    /// The picture on screen sits outside the head of a fresh permutation;
    /// the next forward step starts at position 0.
    lead_in: bool,
    recent: VecDeque<PathBuf>,
    shown_at: Instant,
    rng: StdRng,
    placeholder: ImageRecord,
}

impl PlaylistController {
    pub fn new(options: PlaylistOptions, placeholder: PathBuf, rng: StdRng) -> Self {
        Self {
            snapshot: Arc::new(LibrarySnapshot::default()),
            order: Vec::new(),
            position: 0,
            paused: false,
            direction: Direction::Forward,
            options,
            epoch: 0,
            passes: 0,
            pending: None,
            lead_in: false,
            recent: VecDeque::new(),
            shown_at: Instant::now(),
            rng,
            placeholder: ImageRecord::placeholder(placeholder),
        }
    }

    pub fn state(&self) -> PlayerState {
        if self.order.is_empty() {
            PlayerState::Empty
        } else if self.paused {
            PlayerState::Paused
        } else {
            PlayerState::Playing
        }
    }

    pub fn options(&self) -> &PlaylistOptions {
        &self.options
    }

    pub fn snapshot(&self) -> &Arc<LibrarySnapshot> {
        &self.snapshot
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Paths in current play order.
    pub fn ordering(&self) -> Vec<&Path> {
        self.order
            .iter()
            .filter_map(|&i| self.snapshot.get(i))
            .map(|r| r.path.as_path())
            .collect()
    }

    /// Image on screen, or the placeholder while empty.
    pub fn current(&self) -> &ImageRecord {
        self.order
            .get(self.position)
            .and_then(|&i| self.snapshot.get(i))
            .unwrap_or(&self.placeholder)
    }

    /// Image the next forward advance will show.
    pub fn upcoming(&self) -> Option<&ImageRecord> {
        if self.order.len() < 2 {
            return None;
        }
        let next = if self.lead_in {
            self.order[0]
        } else if self.position + 1 < self.order.len() {
            self.order[self.position + 1]
        } else {
            self.pending.as_ref().unwrap_or(&self.order)[0]
        };
        self.snapshot.get(next)
    }

    /// Deadline of the next timed advance, if playing.
    pub fn next_advance_at(&self) -> Option<Instant> {
        (self.state() == PlayerState::Playing).then(|| self.shown_at + self.options.time_delay)
    }

    pub fn frame(&self, now: Instant) -> FrameRequest {
        let state = self.state();
        let upcoming = self.upcoming().cloned();
        let blend = match (state, &upcoming) {
            (PlayerState::Playing, Some(_)) if !self.options.fade_time.is_zero() => {
                let elapsed = now.saturating_duration_since(self.shown_at);
                let fade_start = self.options.time_delay.saturating_sub(self.options.fade_time);
                let into_fade = elapsed.saturating_sub(fade_start);
                (into_fade.as_secs_f32() / self.options.fade_time.as_secs_f32()).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };
        FrameRequest {
            state,
            current: self.current().clone(),
            upcoming,
            blend,
        }
    }

    /// Install a new snapshot. With `reset` (filter change) playback restarts
    /// at the head of a fresh ordering; otherwise the current image is kept
    /// when it survived, or the next surviving entry is shown.
    pub fn install_snapshot(
        &mut self,
        snapshot: Arc<LibrarySnapshot>,
        reset: bool,
    ) -> Option<StateChange> {
        let before = self.state();
        let previous = (!self.order.is_empty()).then(|| self.current().path.clone());
        self.snapshot = snapshot;

        if reset {
            self.passes = 0;
            self.recent.clear();
            self.reorder();
            self.epoch = 0;
            self.position = 0;
        } else {
            match previous.as_deref() {
                Some(path) if self.snapshot.position(path).is_some() => {
                    self.reorder_keeping(path);
                }
                Some(path) => {
                    self.reorder();
                    self.position = self.successor_of(path);
                }
                None => {
                    self.reorder();
                    self.position = 0;
                }
            }
        }

        let after = self.state();
        // a picture that stays on screen keeps its dwell timer
        let kept = !reset && previous.as_deref() == Some(self.current().path.as_path());
        if !kept {
            self.mark_shown();
        }
        info!(
            images = self.order.len(),
            generation = self.snapshot.generation,
            epoch = self.epoch,
            reset,
            "playlist snapshot installed"
        );
        (before != after).then_some(StateChange {
            from: before,
            to: after,
        })
    }

    /// Timed advance; only honoured while playing.
    pub fn tick(&mut self) -> bool {
        if self.state() != PlayerState::Playing {
            return false;
        }
        self.step_forward();
        true
    }

    /// Advance when the dwell time has elapsed.
    pub fn tick_due(&mut self, now: Instant) -> bool {
        match self.next_advance_at() {
            Some(deadline) if now >= deadline => self.tick(),
            _ => false,
        }
    }

    /// Manual forward step; honoured while paused.
    pub fn next(&mut self) -> bool {
        if self.order.is_empty() {
            return false;
        }
        self.direction = Direction::Forward;
        self.step_forward();
        true
    }

    /// Manual backward step; honoured while paused.
    pub fn previous(&mut self) -> bool {
        if self.order.is_empty() {
            return false;
        }
        self.direction = Direction::Backward;
        self.lead_in = false;
        self.position = if self.position == 0 {
            self.order.len() - 1
        } else {
            self.position - 1
        };
        self.mark_shown();
        true
    }

    pub fn set_paused(&mut self, paused: bool) -> Option<StateChange> {
        let before = self.state();
        if self.paused != paused {
            self.paused = paused;
            if !paused {
                // resume with a full dwell on the current picture
                self.shown_at = Instant::now();
            }
        }
        let after = self.state();
        (before != after).then_some(StateChange {
            from: before,
            to: after,
        })
    }

    /// Toggle shuffle without interrupting the picture on screen.
    pub fn set_shuffle(&mut self, shuffle: bool) {
        if self.options.shuffle == shuffle {
            return;
        }
        self.options.shuffle = shuffle;
        self.reorder_current();
    }

    /// Draw a new permutation now, keeping the current picture on screen.
    pub fn reshuffle(&mut self) {
        self.reorder_current();
    }

    /// The fade never outlasts the dwell time.
    pub fn set_timing(&mut self, time_delay: Duration, fade_time: Duration) {
        self.options.time_delay = time_delay;
        self.options.fade_time = fade_time.min(time_delay);
    }

    fn reorder_current(&mut self) {
        if self.order.is_empty() {
            return;
        }
        let path = self.current().path.clone();
        self.reorder_keeping(&path);
    }

    fn step_forward(&mut self) {
        if self.lead_in {
            self.lead_in = false;
            self.position = 0;
            self.mark_shown();
            return;
        }
        self.position += 1;
        if self.position >= self.order.len() {
            self.position = 0;
            self.passes += 1;
            if self.reshuffle_due() {
                self.passes = 0;
                match self.pending.take() {
                    Some(order) => {
                        self.order = order;
                        self.epoch += 1;
                        debug!(epoch = self.epoch, "next pass started");
                    }
                    None => self.reorder(),
                }
            }
        }
        self.mark_shown();
    }

    fn reshuffle_due(&self) -> bool {
        self.options.shuffle && self.passes >= self.options.reshuffle_num.max(1)
    }

    /// On the last position of a pass that ends in a reshuffle, draw the next
    /// permutation now so `upcoming` names the picture the wrap will show.
    fn prepare_wrap(&mut self) {
        let last = self.order.len().saturating_sub(1);
        if self.pending.is_some()
            || self.lead_in
            || self.order.is_empty()
            || self.position != last
            || !self.options.shuffle
            || self.passes + 1 < self.options.reshuffle_num.max(1)
        {
            return;
        }
        self.pending = Some(self.permutation());
    }

    fn mark_shown(&mut self) {
        self.shown_at = Instant::now();
        if self.order.is_empty() {
            return;
        }
        let path = self.current().path.clone();
        debug!(path = %path.display(), position = self.position, "now showing");
        self.recent.retain(|p| p != &path);
        self.recent.push_back(path);
        while self.recent.len() > self.options.recent_n {
            self.recent.pop_front();
        }
        self.prepare_wrap();
    }

    /// Rebuild `order` for the current snapshot. Shuffled orderings put the
    /// recently shown images behind every fresh one.
    fn reorder(&mut self) {
        self.pending = None;
        self.lead_in = false;
        if !self.options.shuffle {
            self.order = (0..self.snapshot.len()).collect();
            return;
        }
        self.order = self.permutation();
        self.epoch += 1;
    }

    fn permutation(&mut self) -> Vec<usize> {
        let n = self.snapshot.len();
        let held: HashSet<&Path> = self.recent.iter().map(PathBuf::as_path).collect();
        let (mut fresh, mut stale): (Vec<usize>, Vec<usize>) = (0..n).partition(|&i| {
            self.snapshot
                .get(i)
                .is_some_and(|r| !held.contains(r.path.as_path()))
        });
        fresh.shuffle(&mut self.rng);
        stale.shuffle(&mut self.rng);
        debug!(images = n, held = stale.len(), "shuffle permutation drawn");
        fresh.extend(stale);
        fresh
    }

    fn reorder_keeping(&mut self, path: &Path) {
        self.reorder();
        let Some(snap_idx) = self.snapshot.position(path) else {
            self.position = 0;
            return;
        };
        if self.options.shuffle {
            // the picture on screen closes the new permutation
            self.order.retain(|&i| i != snap_idx);
            self.order.push(snap_idx);
            self.position = self.order.len() - 1;
            self.lead_in = true;
        } else {
            self.position = self
                .order
                .iter()
                .position(|&i| i == snap_idx)
                .unwrap_or(0);
        }
    }

    /// Position to show after `gone` vanished from the snapshot.
    fn successor_of(&self, gone: &Path) -> usize {
        if self.options.shuffle || self.order.is_empty() {
            return 0;
        }
        self.order
            .iter()
            .position(|&i| {
                self.snapshot
                    .get(i)
                    .is_some_and(|r| r.path.as_os_str() > gone.as_os_str())
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Filters;
    use rand::SeedableRng;

    fn options(shuffle: bool) -> PlaylistOptions {
        PlaylistOptions {
            shuffle,
            recent_n: 2,
            reshuffle_num: 1,
            time_delay: Duration::from_secs(10),
            fade_time: Duration::from_secs(2),
        }
    }

    fn snapshot(paths: &[&str]) -> Arc<LibrarySnapshot> {
        let records = paths.iter().map(|p| ImageRecord::placeholder(*p)).collect();
        Arc::new(LibrarySnapshot::new(Filters::default(), records))
    }

    fn controller(shuffle: bool, seed: u64) -> PlaylistController {
        PlaylistController::new(
            options(shuffle),
            PathBuf::from("/no_pictures.jpg"),
            StdRng::seed_from_u64(seed),
        )
    }

    #[test]
    fn empty_to_playing_and_back() {
        let mut pl = controller(false, 1);
        assert_eq!(pl.state(), PlayerState::Empty);
        assert_eq!(pl.current().path, PathBuf::from("/no_pictures.jpg"));

        let change = pl.install_snapshot(snapshot(&["/p/a.jpg"]), false);
        assert_eq!(
            change,
            Some(StateChange {
                from: PlayerState::Empty,
                to: PlayerState::Playing
            })
        );

        let change = pl.install_snapshot(snapshot(&[]), false);
        assert_eq!(change.map(|c| c.to), Some(PlayerState::Empty));
        assert!(!pl.next());
        assert!(!pl.previous());
        assert!(!pl.tick());
        assert_eq!(pl.current().path, PathBuf::from("/no_pictures.jpg"));
        assert!(pl.upcoming().is_none());
    }

    #[test]
    fn navigation_wraps_in_path_order() {
        let mut pl = controller(false, 1);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg"]), true);
        assert_eq!(pl.current().path, PathBuf::from("/p/a.jpg"));
        pl.previous();
        assert_eq!(pl.current().path, PathBuf::from("/p/c.jpg"));
        assert_eq!(pl.direction(), Direction::Backward);
        pl.next();
        assert_eq!(pl.current().path, PathBuf::from("/p/a.jpg"));
        assert_eq!(pl.upcoming().map(|r| r.path.clone()), Some(PathBuf::from("/p/b.jpg")));
    }

    #[test]
    fn pause_blocks_ticks_but_not_manual_navigation() {
        let mut pl = controller(false, 1);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg"]), true);
        let change = pl.set_paused(true);
        assert_eq!(change.map(|c| c.to), Some(PlayerState::Paused));
        assert!(pl.set_paused(true).is_none());
        assert!(!pl.tick());
        assert!(pl.next_advance_at().is_none());
        assert_eq!(pl.current().path, PathBuf::from("/p/a.jpg"));
        assert!(pl.next());
        assert_eq!(pl.current().path, PathBuf::from("/p/b.jpg"));
    }

    #[test]
    fn shuffle_is_a_permutation_of_the_snapshot() {
        let paths = ["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg", "/p/f.jpg"];
        let mut pl = controller(true, 7);
        pl.install_snapshot(snapshot(&paths), true);
        let mut ordered: Vec<_> = pl.ordering().into_iter().map(Path::to_path_buf).collect();
        ordered.sort();
        let expected: Vec<_> = paths.iter().map(PathBuf::from).collect();
        assert_eq!(ordered, expected);
    }

    #[test]
    fn recent_images_are_held_back_after_reshuffle() {
        for seed in 0..20 {
            let mut pl = controller(true, seed);
            pl.install_snapshot(
                snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg"]),
                true,
            );
            let first = pl.current().path.clone();
            pl.tick();
            let second = pl.current().path.clone();

            pl.reshuffle();
            assert_eq!(pl.current().path, second);
            let head: Vec<PathBuf> =
                pl.ordering().into_iter().take(3).map(Path::to_path_buf).collect();
            assert!(!head.contains(&first), "seed {seed}: {head:?}");
            assert!(!head.contains(&second), "seed {seed}: {head:?}");
            assert_eq!(pl.upcoming().map(|r| r.path.clone()).as_ref(), Some(&head[0]));

            let passes = pl.passes;
            pl.next();
            assert_eq!(pl.current().path, head[0]);
            assert_eq!(pl.position(), 0);
            assert_eq!(pl.passes, passes);
        }
    }

    #[test]
    fn upcoming_before_a_reshuffling_wrap_is_what_gets_shown() {
        for seed in 0..20 {
            let mut pl = controller(true, seed);
            pl.install_snapshot(
                snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg"]),
                true,
            );
            for _ in 0..4 {
                pl.tick();
            }
            let epoch = pl.epoch();
            let promised = pl.upcoming().map(|r| r.path.clone());
            assert!(pl.frame(Instant::now()).upcoming.is_some());

            pl.tick();
            assert_eq!(pl.epoch(), epoch + 1);
            assert_eq!(Some(pl.current().path.clone()), promised, "seed {seed}");
        }
    }

    #[test]
    fn upcoming_follows_the_shuffle_after_toggling_it_on() {
        let mut pl = controller(false, 4);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg"]), true);
        pl.next();
        pl.set_shuffle(true);
        assert_eq!(pl.current().path, PathBuf::from("/p/b.jpg"));
        let promised = pl.upcoming().map(|r| r.path.clone());
        pl.tick();
        assert_eq!(Some(pl.current().path.clone()), promised);
        assert_ne!(pl.current().path, PathBuf::from("/p/b.jpg"));
    }

    #[test]
    fn full_pass_draws_new_permutation_without_recent_at_head() {
        for seed in 0..20 {
            let mut pl = controller(true, seed);
            pl.install_snapshot(
                snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg"]),
                true,
            );
            let epoch = pl.epoch();
            let mut shown = vec![pl.current().path.clone()];
            for _ in 0..4 {
                pl.tick();
                shown.push(pl.current().path.clone());
            }
            let recent: Vec<PathBuf> = shown[3..].to_vec();

            pl.tick();
            assert_eq!(pl.epoch(), epoch + 1);
            let head: Vec<_> = pl.ordering().into_iter().take(2).collect();
            for held in &recent {
                assert!(!head.contains(&held.as_path()), "seed {seed}: {held:?} in {head:?}");
            }
        }
    }

    #[test]
    fn filter_change_resets_position_and_epoch() {
        let mut pl = controller(true, 3);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg"]), true);
        for _ in 0..7 {
            pl.tick();
        }
        assert!(pl.epoch() > 0);
        pl.install_snapshot(snapshot(&["/p/x.jpg", "/p/y.jpg"]), true);
        assert_eq!(pl.position(), 0);
        assert_eq!(pl.epoch(), 0);
    }

    #[test]
    fn vanished_current_advances_to_next_entry() {
        let mut pl = controller(false, 1);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg"]), true);
        pl.next();
        assert_eq!(pl.current().path, PathBuf::from("/p/b.jpg"));

        let change = pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/c.jpg"]), false);
        assert!(change.is_none());
        assert_eq!(pl.current().path, PathBuf::from("/p/c.jpg"));
    }

    #[test]
    fn surviving_current_stays_on_screen() {
        let mut pl = controller(true, 11);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg"]), true);
        let on_screen = pl.current().path.clone();
        pl.install_snapshot(
            snapshot(&["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg"]),
            false,
        );
        assert_eq!(pl.current().path, on_screen);
        assert_eq!(pl.len(), 4);
    }

    #[test]
    fn blend_ramps_inside_fade_window() {
        let mut pl = controller(false, 1);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg"]), true);
        let start = pl.shown_at;
        assert_eq!(pl.frame(start + Duration::from_secs(5)).blend, 0.0);
        let mid = pl.frame(start + Duration::from_secs(9)).blend;
        assert!((mid - 0.5).abs() < 1e-3);
        assert_eq!(pl.frame(start + Duration::from_secs(12)).blend, 1.0);

        pl.set_paused(true);
        assert_eq!(pl.frame(start + Duration::from_secs(9)).blend, 0.0);
    }

    #[test]
    fn tick_due_waits_for_dwell() {
        let mut pl = controller(false, 1);
        pl.install_snapshot(snapshot(&["/p/a.jpg", "/p/b.jpg"]), true);
        let deadline = pl.next_advance_at().unwrap();
        assert!(!pl.tick_due(deadline - Duration::from_millis(1)));
        assert!(pl.tick_due(deadline));
        assert_eq!(pl.current().path, PathBuf::from("/p/b.jpg"));
    }
}
