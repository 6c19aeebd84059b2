//! Display-tap playback source
//!
//! Wraps a queue-of-items playback engine, extracts pixel buffers from the
//! current item's video tap on every display refresh, converts them to
//! framebuffers, and feeds the graph. Alongside the tap it provides:
//!
//! - serialized seeks: at most one in flight, the newest stored request
//!   re-issued when the active one completes,
//! - time observers: the total set sorted by target descending, an active
//!   queue rebuilt at each `start` and after each completed seek, fired
//!   from the tail as play time crosses their targets, at most once per
//!   session,
//! - loop control: seek-on-end against a play range, or the engine's own
//!   item looper, selected by configuration,
//! - the pending-insert rule: inserting while the single queued item has
//!   played to end defers the insert until the did-play-to-end
//!   notification is handled, where deferred items drain.
//!
//! Engine notifications arrive over a channel and are drained at every
//! refresh tick. `cleanup()` must be called before the player is dropped.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};

use crate::backend::engine::{
    EndAction, EngineStatus, ItemId, ItemStatus, PlaybackEngine, PlayerEvent, PlayerItem,
};
use crate::config::{LoopDiscipline, PlayerOptions};
use crate::media::framebuffer::UserInfoValue;
use crate::media::orientation::Orientation;
use crate::media::pixel::PixelBuffer;
use crate::media::time::{MediaTime, MediaTimeRange};
use crate::movie::convert::FramebufferGenerator;
use crate::movie::FramebufferSink;
use crate::runtime::context::PipelineContext;
use crate::stats::{DropReason, PipelineStats};

/// One outstanding or queued seek request. Two requests are interchangeable
/// only when every field matches.
#[derive(Debug, Clone, PartialEq)]
pub struct SeekingInfo {
    pub target: MediaTime,
    pub tolerance_before: MediaTime,
    pub tolerance_after: MediaTime,
    pub should_play_after_seek: bool,
}

impl SeekingInfo {
    pub fn exact(target: MediaTime, should_play_after_seek: bool) -> Self {
        Self {
            target,
            tolerance_before: MediaTime::zero(),
            tolerance_after: MediaTime::zero(),
            should_play_after_seek,
        }
    }
}

/// Handle returned from `add_time_observer`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(u64);

type ObserverCallback = Arc<dyn Fn(MediaTime) + Send + Sync>;

#[derive(Clone)]
struct TimeObserver {
    id: u64,
    target: MediaTime,
    callback: ObserverCallback,
}

struct PlayerState {
    is_playing: bool,
    loop_enabled: bool,
    play_range: Option<MediaTimeRange>,
    current_seeking: Option<SeekingInfo>,
    next_seeking: Option<SeekingInfo>,
    pending_items: VecDeque<PlayerItem>,
    known_items: HashMap<ItemId, PlayerItem>,
    last_item: Option<PlayerItem>,
    end_observer_fired: bool,
    recovery_attempted: bool,
    is_processing: bool,
    observers_total: Vec<TimeObserver>,
    observers_active: VecDeque<TimeObserver>,
    fired_this_session: HashSet<u64>,
    next_observer_id: u64,
    cleaned_up: bool,
}

impl PlayerState {
    fn new() -> Self {
        Self {
            is_playing: false,
            loop_enabled: false,
            play_range: None,
            current_seeking: None,
            next_seeking: None,
            pending_items: VecDeque::new(),
            known_items: HashMap::new(),
            last_item: None,
            end_observer_fired: false,
            recovery_attempted: false,
            is_processing: false,
            observers_total: Vec::new(),
            observers_active: VecDeque::new(),
            fired_this_session: HashSet::new(),
            next_observer_id: 1,
            cleaned_up: false,
        }
    }

    /// Rebuild the active queue: observers inside the play range that have
    /// not fired this session, sorted descending so firing pops the tail.
    fn rebuild_active_observers(&mut self, default_end: MediaTime) {
        let (start, end) = match self.play_range {
            Some(range) => (range.start, range.end()),
            None => (MediaTime::zero(), default_end),
        };
        self.observers_active = self
            .observers_total
            .iter()
            .filter(|observer| {
                observer.target.compare(&start) != std::cmp::Ordering::Less
                    && observer.target.compare(&end) != std::cmp::Ordering::Greater
                    && !self.fired_this_session.contains(&observer.id)
            })
            .cloned()
            .collect();
    }

    /// Observers due at `now`, removed from the active queue tail.
    fn take_due_observers(&mut self, now: MediaTime) -> Vec<TimeObserver> {
        let mut due = Vec::new();
        while let Some(last) = self.observers_active.back() {
            if last.target.compare(&now) == std::cmp::Ordering::Greater {
                break;
            }
            let observer = self.observers_active.pop_back().unwrap();
            self.fired_this_session.insert(observer.id);
            due.push(observer);
        }
        due
    }
}

struct PlayerCore {
    engine: Mutex<Box<dyn PlaybackEngine>>,
    events: Mutex<Receiver<PlayerEvent>>,
    generator: FramebufferGenerator,
    targets: Mutex<Vec<Arc<dyn FramebufferSink>>>,
    options: PlayerOptions,
    state: Mutex<PlayerState>,
    stats: Arc<PipelineStats>,
}

/// Display-tap playback source. Cloning shares the same player.
#[derive(Clone)]
pub struct MoviePlayer {
    core: Arc<PlayerCore>,
}

impl MoviePlayer {
    pub fn new(
        mut engine: Box<dyn PlaybackEngine>,
        context: Arc<PipelineContext>,
        options: PlayerOptions,
    ) -> Self {
        let (sink, events) = channel();
        engine.set_event_sink(sink);
        engine.set_action_at_item_end(EndAction::Advance);
        Self {
            core: Arc::new(PlayerCore {
                engine: Mutex::new(engine),
                events: Mutex::new(events),
                generator: FramebufferGenerator::new(context),
                targets: Mutex::new(Vec::new()),
                options,
                state: Mutex::new(PlayerState::new()),
                stats: Arc::new(PipelineStats::new()),
            }),
        }
    }

    pub fn add_target(&self, target: Arc<dyn FramebufferSink>) {
        self.core.targets.lock().unwrap().push(target);
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.core.stats
    }

    // ── Item management ─────────────────────────────────────────

    pub fn items(&self) -> Vec<ItemId> {
        self.core.engine.lock().unwrap().items()
    }

    pub fn current_item(&self) -> Option<ItemId> {
        self.core.engine.lock().unwrap().current_item()
    }

    /// Insert an item after `after` (or at the back). Subject to the
    /// pending-insert rule when the only queued item has played to end.
    pub fn insert(&self, item: PlayerItem, after: Option<ItemId>) {
        {
            let mut state = self.core.state.lock().unwrap();
            state.known_items.insert(item.id, item.clone());
            state.last_item = Some(item.clone());
        }
        if self.core.should_defer_insert() {
            debug!("MoviePlayer: queue ended, insert of item {} deferred", item.id);
            self.core.state.lock().unwrap().pending_items.push_back(item);
            return;
        }
        self.core.engine.lock().unwrap().insert(item, after);
    }

    pub fn replace_current_item(&self, item: PlayerItem) {
        {
            let mut state = self.core.state.lock().unwrap();
            state.known_items.insert(item.id, item.clone());
            state.last_item = Some(item.clone());
        }
        if self.core.should_defer_insert() {
            debug!(
                "MoviePlayer: queue ended, replace with item {} deferred",
                item.id
            );
            self.core.state.lock().unwrap().pending_items.push_back(item);
            return;
        }
        self.core.engine.lock().unwrap().replace_current(Some(item));
    }

    pub fn remove(&self, id: ItemId) {
        self.core.state.lock().unwrap().known_items.remove(&id);
        self.core.engine.lock().unwrap().remove(id);
    }

    pub fn remove_all_items(&self) {
        let mut state = self.core.state.lock().unwrap();
        state.known_items.clear();
        state.pending_items.clear();
        drop(state);
        self.core.engine.lock().unwrap().remove_all();
    }

    pub fn advance_to_next_item(&self) {
        self.core.engine.lock().unwrap().advance_to_next();
    }

    /// Put the most recently inserted item back as current and replay it.
    pub fn replay_last_item(&self) {
        let last = self.core.state.lock().unwrap().last_item.clone();
        let Some(last) = last else {
            warn!("MoviePlayer: no last item to replay");
            return;
        };
        self.core
            .engine
            .lock()
            .unwrap()
            .replace_current(Some(last));
        self.request_seek(SeekingInfo::exact(MediaTime::zero(), true));
    }

    // ── Playback control ────────────────────────────────────────

    pub fn play(&self) {
        self.core.state.lock().unwrap().is_playing = true;
        self.core.engine.lock().unwrap().play();
    }

    pub fn pause(&self) {
        self.core.state.lock().unwrap().is_playing = false;
        self.core.engine.lock().unwrap().pause();
    }

    pub fn resume(&self) {
        self.play();
    }

    pub fn play_immediately(&self, at_rate: f32) {
        self.core.state.lock().unwrap().is_playing = at_rate != 0.0;
        let mut engine = self.core.engine.lock().unwrap();
        engine.set_rate(at_rate);
        if at_rate != 0.0 {
            engine.play();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.core.state.lock().unwrap().is_playing
    }

    /// Begin a play session: reset per-session bookkeeping, rebuild the
    /// active observer queue, and seek to the range start with playback
    /// resuming on completion.
    pub fn start(&self) {
        let seek_target = {
            let mut state = self.core.state.lock().unwrap();
            state.end_observer_fired = false;
            state.recovery_attempted = false;
            state.fired_this_session.clear();
            state.is_playing = true;
            state
                .play_range
                .map(|range| range.start)
                .unwrap_or_else(MediaTime::zero)
        };
        self.rebuild_active_observers();
        info!("MoviePlayer: session start at {}", seek_target);
        self.request_seek(SeekingInfo::exact(seek_target, true));
    }

    pub fn stop(&self) {
        self.core.state.lock().unwrap().is_playing = false;
        self.core.engine.lock().unwrap().pause();
        info!("MoviePlayer: stopped");
    }

    pub fn current_time(&self) -> MediaTime {
        self.core.engine.lock().unwrap().current_time()
    }

    // ── Looping ─────────────────────────────────────────────────

    /// Toggle looping over `range`. With the seek-on-end discipline the
    /// player seeks back to `range.start` when play time crosses
    /// `range.end`; with the looper discipline repetition is delegated to
    /// the engine.
    pub fn set_loop_enabled(&self, enabled: bool, range: Option<MediaTimeRange>) {
        {
            let mut state = self.core.state.lock().unwrap();
            state.loop_enabled = enabled;
            state.play_range = range;
        }
        if self.core.options.loop_discipline == LoopDiscipline::Looper {
            self.core.engine.lock().unwrap().set_item_repeat(enabled);
        }
    }

    // ── Seeking ─────────────────────────────────────────────────

    /// Request a seek with exact tolerances. Serialization is internal.
    pub fn seek_to_time(&self, target: MediaTime, should_play_after_seeking: bool) {
        self.request_seek(SeekingInfo::exact(target, should_play_after_seeking));
    }

    /// Request a seek. At most one is in flight; a newer request stored
    /// while one is active becomes the next request when it completes.
    pub fn request_seek(&self, info: SeekingInfo) {
        let begin = {
            let mut state = self.core.state.lock().unwrap();
            state.next_seeking = Some(info.clone());
            if state.current_seeking.is_some() {
                None
            } else {
                state.current_seeking = Some(info.clone());
                Some(info)
            }
        };
        if let Some(info) = begin {
            if self.core.engine.lock().unwrap().status() != EngineStatus::ReadyToPlay {
                debug!("MoviePlayer: engine not ready, seek stays queued");
                self.core.state.lock().unwrap().current_seeking = None;
                return;
            }
            self.core.issue_seek(self, info);
        }
    }

    /// Whether a seek is currently in flight.
    pub fn seeking_in_flight(&self) -> bool {
        self.core.state.lock().unwrap().current_seeking.is_some()
    }

    /// The stored request that will run after the active seek, if any.
    pub fn queued_seek(&self) -> Option<SeekingInfo> {
        self.core.state.lock().unwrap().next_seeking.clone()
    }

    // ── Time observers ──────────────────────────────────────────

    /// Register a callback fired once per session when play time crosses
    /// `target`. Observer list mutations belong on the control thread.
    pub fn add_time_observer(
        &self,
        target: MediaTime,
        callback: impl Fn(MediaTime) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let mut state = self.core.state.lock().unwrap();
        let id = state.next_observer_id;
        state.next_observer_id += 1;
        state.observers_total.push(TimeObserver {
            id,
            target,
            callback: Arc::new(callback),
        });
        // Total set stays sorted by target descending.
        state
            .observers_total
            .sort_by(|a, b| b.target.compare(&a.target));
        ObserverHandle(id)
    }

    pub fn remove_time_observer(&self, handle: ObserverHandle) {
        let mut state = self.core.state.lock().unwrap();
        state.observers_total.retain(|observer| observer.id != handle.0);
        state
            .observers_active
            .retain(|observer| observer.id != handle.0);
    }

    pub fn remove_all_time_observers(&self) {
        let mut state = self.core.state.lock().unwrap();
        state.observers_total.clear();
        state.observers_active.clear();
    }

    /// Number of observers eligible to fire in the current session.
    pub fn active_observer_count(&self) -> usize {
        self.core.state.lock().unwrap().observers_active.len()
    }

    // ── Display refresh ─────────────────────────────────────────

    /// The per-vsync tap. Wire this to a display link.
    pub fn on_display_refresh(&self) {
        self.core.tick(self);
    }

    /// Drop subscriptions and observers. Must be called before the player
    /// is dropped.
    pub fn cleanup(&self) {
        {
            let mut state = self.core.state.lock().unwrap();
            state.cleaned_up = true;
            state.observers_total.clear();
            state.observers_active.clear();
            state.pending_items.clear();
        }
        self.core.engine.lock().unwrap().clear_event_sink();
        info!("MoviePlayer: cleaned up");
    }

    fn rebuild_active_observers(&self) {
        let current = self.core.engine.lock().unwrap().current_item();
        let mut state = self.core.state.lock().unwrap();
        let default_end = current
            .and_then(|id| state.known_items.get(&id).map(|item| item.duration))
            .unwrap_or_else(MediaTime::positive_infinity);
        state.rebuild_active_observers(default_end);
    }
}

impl PlayerCore {
    /// The pending-insert rule: the engine holds exactly one item, that
    /// item has played to its end, and no engine-side looper is active.
    /// Engine and state are consulted one after the other, never nested.
    fn should_defer_insert(&self) -> bool {
        let (item_count, current, now) = {
            let engine = self.engine.lock().unwrap();
            (engine.items().len(), engine.current_item(), engine.current_time())
        };
        if item_count != 1 {
            return false;
        }
        let Some(current) = current else {
            return false;
        };
        let state = self.state.lock().unwrap();
        if self.options.loop_discipline == LoopDiscipline::Looper && state.loop_enabled {
            return false;
        }
        let Some(item) = state.known_items.get(&current) else {
            return false;
        };
        now.compare(&item.duration) != std::cmp::Ordering::Less
    }

    fn issue_seek(&self, player: &MoviePlayer, info: SeekingInfo) {
        let completion_player = player.clone();
        debug!("MoviePlayer: seeking to {}", info.target);
        self.engine.lock().unwrap().seek(
            info.target,
            info.tolerance_before,
            info.tolerance_after,
            Box::new(move |finished| {
                completion_player.core.on_seek_completed(&completion_player, finished);
            }),
        );
    }

    /// Seek completion: re-issue the stored request when it changed while
    /// this one was in flight, otherwise clear both slots.
    fn on_seek_completed(&self, player: &MoviePlayer, finished: bool) {
        let (reissue, play_after) = {
            let mut state = self.state.lock().unwrap();
            let just_completed = state.current_seeking.take();
            let play_after = just_completed
                .as_ref()
                .map(|info| info.should_play_after_seek)
                .unwrap_or(false);
            match (&state.next_seeking, &just_completed) {
                (Some(next), Some(done)) if next != done => {
                    let next = next.clone();
                    state.current_seeking = Some(next.clone());
                    (Some(next), play_after)
                }
                _ => {
                    state.next_seeking = None;
                    (None, play_after)
                }
            }
        };

        if let Some(next) = reissue {
            self.issue_seek(player, next);
            return;
        }
        if finished {
            player.rebuild_active_observers();
            if play_after {
                self.state.lock().unwrap().is_playing = true;
                self.engine.lock().unwrap().play();
            }
        }
    }

    /// One display-refresh turn.
    fn tick(&self, player: &MoviePlayer) {
        self.drain_events(player);

        // Zero items while marked playing: attempt one recovery by
        // re-inserting the last item.
        {
            let engine_empty = self.engine.lock().unwrap().items().is_empty();
            if engine_empty {
                let mut state = self.state.lock().unwrap();
                if state.is_playing && !state.recovery_attempted {
                    state.recovery_attempted = true;
                    if let Some(last) = state.last_item.clone() {
                        drop(state);
                        warn!("MoviePlayer: queue empty while playing, re-inserting last item");
                        self.engine.lock().unwrap().insert(last, None);
                    }
                }
                return;
            }
        }

        let now = {
            let engine = self.engine.lock().unwrap();
            let Some(current) = engine.current_item() else {
                return;
            };
            if engine.item_status(current) != ItemStatus::ReadyToPlay {
                return;
            }
            engine.current_time()
        };
        if now.compare(&MediaTime::zero()) != std::cmp::Ordering::Greater {
            return;
        }

        // Pull at most one new pixel buffer from the tap.
        let copied = {
            let mut engine = self.engine.lock().unwrap();
            match engine.tap() {
                Some(tap) if tap.has_new_pixel_buffer(now) => tap.copy_pixel_buffer(now),
                _ => None,
            }
        };

        match copied {
            Some((pixels, display_time)) => {
                // Re-entrancy guard around conversion and delivery.
                {
                    let mut state = self.state.lock().unwrap();
                    if state.is_processing {
                        debug!("MoviePlayer: refresh re-entered, tick skipped");
                        return;
                    }
                    state.is_processing = true;
                }
                self.process_tapped_frame(pixels, display_time);
                self.state.lock().unwrap().is_processing = false;
                self.fire_due_observers(now);
            }
            None => {
                if self.options.fire_observers_without_frames {
                    self.fire_due_observers(now);
                }
            }
        }

        self.handle_end_of_range(player, now);
    }

    fn process_tapped_frame(&self, pixels: PixelBuffer, display_time: MediaTime) {
        // While looping, frames outside the play range are not forwarded.
        let out_of_range = {
            let state = self.state.lock().unwrap();
            match (state.loop_enabled, state.play_range) {
                (true, Some(range)) => !range.contains(display_time),
                _ => false,
            }
        };
        if out_of_range {
            self.stats.record_drop(DropReason::OutOfLoopRange);
            debug!(
                "MoviePlayer: tapped frame at {} outside loop range, dropped",
                display_time
            );
            return;
        }

        let framebuffer = match self.generator.framebuffer_from_yuv(
            pixels,
            display_time,
            Orientation::Portrait,
        ) {
            Ok(framebuffer) => framebuffer,
            Err(error) => {
                warn!("MoviePlayer: conversion failed at {}: {}", display_time, error);
                return;
            }
        };
        framebuffer.set_user_info("player.time", UserInfoValue::Time(display_time));

        let targets = self.targets.lock().unwrap().clone();
        for (index, target) in targets.iter().enumerate() {
            framebuffer.lock();
            target.new_framebuffer_available(framebuffer.clone(), index);
        }
        framebuffer.unlock();
        self.stats.record_frame_appended(0);
    }

    fn fire_due_observers(&self, now: MediaTime) {
        let due = self.state.lock().unwrap().take_due_observers(now);
        for observer in due {
            (observer.callback)(now);
        }
    }

    /// Seek-on-end loop discipline: crossing the range end fires the
    /// internal end observer once per session and restarts when looping.
    fn handle_end_of_range(&self, player: &MoviePlayer, now: MediaTime) {
        if self.options.loop_discipline != LoopDiscipline::SeekOnEnd {
            return;
        }
        let restart = {
            let mut state = self.state.lock().unwrap();
            let Some(range) = state.play_range else {
                return;
            };
            if state.end_observer_fired {
                return;
            }
            if now.compare(&range.end()) != std::cmp::Ordering::Greater {
                return;
            }
            state.end_observer_fired = true;
            state.loop_enabled && state.is_playing
        };
        if restart {
            info!("MoviePlayer: play range ended, restarting");
            player.start();
        } else {
            debug!("MoviePlayer: play range ended");
        }
    }

    fn drain_events(&self, player: &MoviePlayer) {
        let drained: Vec<PlayerEvent> = {
            let events = self.events.lock().unwrap();
            events.try_iter().collect()
        };
        for event in drained {
            match event {
                PlayerEvent::DidPlayToEnd(id) => self.handle_did_play_to_end(player, id),
                PlayerEvent::Stalled(id) => {
                    warn!("MoviePlayer: item {} stalled", id);
                }
                PlayerEvent::StatusChanged(status) => {
                    debug!("MoviePlayer: engine status {:?}", status);
                    if status == EngineStatus::ReadyToPlay {
                        // A seek queued while the engine was not ready can
                        // go out now.
                        let queued = {
                            let mut state = self.state.lock().unwrap();
                            match (&state.current_seeking, state.next_seeking.clone()) {
                                (None, Some(next)) => {
                                    state.current_seeking = Some(next.clone());
                                    Some(next)
                                }
                                _ => None,
                            }
                        };
                        if let Some(info) = queued {
                            self.issue_seek(player, info);
                        }
                    }
                }
                PlayerEvent::ItemStatusChanged(id, status) => {
                    if status == ItemStatus::Failed {
                        warn!("MoviePlayer: item {} failed", id);
                    }
                }
                PlayerEvent::RateChanged(rate) => {
                    debug!("MoviePlayer: engine rate {}", rate);
                }
            }
        }
    }

    /// The did-play-to-end handler: drain deferred inserts, then restart
    /// when whole-item looping (no play range) is active.
    fn handle_did_play_to_end(&self, player: &MoviePlayer, id: ItemId) {
        debug!("MoviePlayer: item {} played to end", id);
        let pending: Vec<PlayerItem> = {
            let mut state = self.state.lock().unwrap();
            state.pending_items.drain(..).collect()
        };
        if !pending.is_empty() {
            let mut engine = self.engine.lock().unwrap();
            for item in pending {
                debug!("MoviePlayer: draining deferred item {}", item.id);
                engine.insert(item, None);
            }
        }
        let restart = {
            let state = self.state.lock().unwrap();
            state.loop_enabled
                && state.is_playing
                && state.play_range.is_none()
                && self.options.loop_discipline == LoopDiscipline::SeekOnEnd
        };
        if restart {
            player.start();
        }
    }
}

impl Drop for PlayerCore {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if !state.cleaned_up {
            warn!("MoviePlayer dropped without cleanup(); subscriptions may leak");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimPlaybackEngine;
    use crate::media::framebuffer::Framebuffer;
    use crate::media::pixel::{PixelBuffer, PixelFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CollectingSink {
        times: Mutex<Vec<MediaTime>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                times: Mutex::new(Vec::new()),
            })
        }

        fn times(&self) -> Vec<MediaTime> {
            self.times.lock().unwrap().clone()
        }
    }

    impl FramebufferSink for CollectingSink {
        fn new_framebuffer_available(&self, framebuffer: Framebuffer, _source_index: usize) {
            if let Some(pts) = framebuffer.timestamp() {
                self.times.lock().unwrap().push(pts);
            }
            framebuffer.unlock();
        }
    }

    fn yuv_frame() -> PixelBuffer {
        PixelBuffer::alloc(4, 4, PixelFormat::YCbCr420Bi)
    }

    fn seconds(value: f64) -> MediaTime {
        MediaTime::from_seconds(value, crate::media::time::DEFAULT_TIMESCALE)
    }

    fn make_player() -> (MoviePlayer, crate::backend::sim::SimEngineHandle, Arc<PipelineContext>)
    {
        let context = PipelineContext::new();
        let (engine, handle) = SimPlaybackEngine::new();
        let player = MoviePlayer::new(
            Box::new(engine),
            Arc::clone(&context),
            PlayerOptions::default(),
        );
        (player, handle, context)
    }

    #[test]
    fn test_seeks_are_coalesced() {
        // Three rapid requests: the middle one is skipped entirely.
        let (player, handle, _context) = make_player();
        player.insert(PlayerItem::new(seconds(10.0)), None);

        player.seek_to_time(seconds(1.0), false);
        player.seek_to_time(seconds(2.0), false);
        player.seek_to_time(seconds(3.0), false);

        assert!(player.seeking_in_flight());
        assert_eq!(handle.pending_seek_count(), 1);

        assert!(handle.complete_next_seek(true)); // finishes 1.0, issues 3.0
        assert_eq!(handle.pending_seek_count(), 1);
        assert!(handle.complete_next_seek(true)); // finishes 3.0

        assert_eq!(handle.seek_invocations(), 2);
        assert!((handle.current_time_seconds() - 3.0).abs() < 1e-6);
        assert!(!player.seeking_in_flight());
        assert!(player.queued_seek().is_none());
    }

    #[test]
    fn test_identical_repeat_seek_not_reissued() {
        let (player, handle, _context) = make_player();
        player.insert(PlayerItem::new(seconds(10.0)), None);

        player.seek_to_time(seconds(2.0), false);
        player.seek_to_time(seconds(2.0), false); // same request again
        assert!(handle.complete_next_seek(true));

        assert_eq!(handle.seek_invocations(), 1);
        assert!(player.queued_seek().is_none());
    }

    #[test]
    fn test_loop_range_drops_out_of_range_frames() {
        let (player, handle, _context) = make_player();
        let sink = CollectingSink::new();
        player.add_target(sink.clone());
        player.insert(PlayerItem::new(seconds(10.0)), None);
        player.set_loop_enabled(true, Some(MediaTimeRange::from_seconds(1.0, 2.0)));
        player.play();

        handle.set_time(1.5);
        handle.push_tap_frame(yuv_frame(), seconds(0.5)); // before range
        player.on_display_refresh();
        handle.push_tap_frame(yuv_frame(), seconds(1.5)); // inside
        player.on_display_refresh();
        handle.push_tap_frame(yuv_frame(), seconds(2.0)); // at end: excluded
        player.on_display_refresh();

        let delivered = sink.times();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], seconds(1.5));
        assert_eq!(player.stats().drops(DropReason::OutOfLoopRange), 2);
        player.cleanup();
    }

    #[test]
    fn test_tap_ignored_before_time_advances() {
        let (player, handle, _context) = make_player();
        let sink = CollectingSink::new();
        player.add_target(sink.clone());
        player.insert(PlayerItem::new(seconds(10.0)), None);
        player.play();

        // Time still at zero: the tap is not consulted.
        handle.push_tap_frame(yuv_frame(), seconds(0.1));
        player.on_display_refresh();
        assert!(sink.times().is_empty());
        assert_eq!(handle.pending_tap_frames(), 1);

        handle.set_time(0.2);
        player.on_display_refresh();
        assert_eq!(sink.times().len(), 1);
        player.cleanup();
    }

    #[test]
    fn test_time_observers_fire_once_per_session() {
        let (player, handle, _context) = make_player();
        player.insert(PlayerItem::new(seconds(10.0)), None);
        handle.set_auto_complete_seeks(true);

        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        player.add_time_observer(seconds(0.5), move |_now| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let late = Arc::new(AtomicUsize::new(0));
        let late_count = Arc::clone(&late);
        player.add_time_observer(seconds(5.0), move |_now| {
            late_count.fetch_add(1, Ordering::SeqCst);
        });

        player.start();
        handle.tick(0.0); // completes the session-start seek
        assert_eq!(player.active_observer_count(), 2);

        handle.set_time(1.0);
        player.on_display_refresh();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);

        // Crossing again in the same session does not refire.
        handle.set_time(0.2);
        player.on_display_refresh();
        handle.set_time(1.2);
        player.on_display_refresh();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A new session rearms it.
        player.start();
        handle.tick(0.0);
        handle.set_time(0.9);
        player.on_display_refresh();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        player.cleanup();
    }

    #[test]
    fn test_observers_outside_play_range_stay_inactive() {
        let (player, handle, _context) = make_player();
        player.insert(PlayerItem::new(seconds(10.0)), None);
        handle.set_auto_complete_seeks(true);
        player.set_loop_enabled(true, Some(MediaTimeRange::from_seconds(1.0, 2.0)));

        let inside = Arc::new(AtomicUsize::new(0));
        let inside_count = Arc::clone(&inside);
        player.add_time_observer(seconds(1.5), move |_| {
            inside_count.fetch_add(1, Ordering::SeqCst);
        });
        let outside = Arc::new(AtomicUsize::new(0));
        let outside_count = Arc::clone(&outside);
        player.add_time_observer(seconds(5.0), move |_| {
            outside_count.fetch_add(1, Ordering::SeqCst);
        });

        player.start();
        handle.tick(0.0);
        // Only the in-range observer is live.
        assert_eq!(player.active_observer_count(), 1);

        handle.set_time(1.8);
        player.on_display_refresh();
        assert_eq!(inside.load(Ordering::SeqCst), 1);
        assert_eq!(outside.load(Ordering::SeqCst), 0);
        player.cleanup();
    }

    #[test]
    fn test_pending_insert_defers_until_end_notification() {
        let (player, handle, _context) = make_player();
        let first = PlayerItem::new(seconds(1.0));
        player.insert(first, None);
        player.play();

        // Play the single item past its end; the engine keeps it current.
        handle.tick(1.2);
        assert_eq!(handle.items_len(), 1);

        // Inserting now must defer.
        let second = PlayerItem::new(seconds(1.0));
        let second_id = second.id;
        player.insert(second, None);
        assert_eq!(handle.items_len(), 1);

        // The next refresh drains the notification and the deferred item.
        player.on_display_refresh();
        assert_eq!(handle.items_len(), 2);
        assert!(player.items().contains(&second_id));
        player.cleanup();
    }

    #[test]
    fn test_recovery_reinserts_last_item_once() {
        let (player, handle, _context) = make_player();
        let item = PlayerItem::new(seconds(2.0));
        player.insert(item, None);
        player.play();
        player.remove_all_items();
        // known_items was cleared with the queue; remember a fresh one.
        let replacement = PlayerItem::new(seconds(2.0));
        player.insert(replacement.clone(), None);
        player.remove(replacement.id);
        assert_eq!(handle.items_len(), 0);

        player.on_display_refresh();
        assert_eq!(handle.items_len(), 1, "recovery should re-insert the last item");
        player.cleanup();
    }

    #[test]
    fn test_whole_item_loop_restarts_on_end() {
        let (player, handle, _context) = make_player();
        player.insert(PlayerItem::new(seconds(1.0)), None);
        handle.set_auto_complete_seeks(true);
        player.set_loop_enabled(true, None);
        player.start();
        handle.tick(0.0);

        handle.tick(1.1); // crosses the end, queues DidPlayToEnd
        player.on_display_refresh(); // handler restarts the session
        handle.tick(0.0); // completes the restart seek
        assert!(handle.current_time_seconds() < 0.5);
        assert!(player.is_playing());
        player.cleanup();
    }

    #[test]
    fn test_cleanup_clears_subscriptions() {
        let (player, handle, _context) = make_player();
        player.insert(PlayerItem::new(seconds(1.0)), None);
        player.add_time_observer(seconds(0.5), |_| {});
        player.cleanup();
        assert_eq!(player.active_observer_count(), 0);
        // Events after cleanup go nowhere and must not panic.
        handle.set_status(crate::backend::engine::EngineStatus::ReadyToPlay);
        player.on_display_refresh();
    }
}
