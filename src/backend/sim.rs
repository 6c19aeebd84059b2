//! Simulated playback engine
//!
//! A manually ticked [`PlaybackEngine`] with a scriptable video tap. Hosts
//! use it to dry-run player wiring without a media stack; the player's
//! tests use it to drive every code path deterministically.
//!
//! Seek completions are never invoked from inside `seek`: they queue until
//! the driver calls [`SimEngineHandle::complete_next_seek`] (or until the
//! next tick when auto-completion is enabled), matching the asynchronous
//! contract real engines have.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::media::pixel::PixelBuffer;
use crate::media::time::{MediaTime, DEFAULT_TIMESCALE};

use super::engine::{
    EndAction, EngineStatus, ItemId, ItemStatus, PlaybackEngine, PlayerEvent, PlayerItem,
    VideoTap,
};

type SeekCompletion = Box<dyn FnOnce(bool) + Send>;

struct PendingSeek {
    target: MediaTime,
    completion: SeekCompletion,
}

struct SimShared {
    items: VecDeque<PlayerItem>,
    current_time: MediaTime,
    rate: f32,
    status: EngineStatus,
    failed_items: Vec<ItemId>,
    action_at_end: EndAction,
    repeat_current: bool,
    sink: Option<Sender<PlayerEvent>>,
    pending_seeks: VecDeque<PendingSeek>,
    seek_invocations: u64,
    auto_complete_seeks: bool,
}

impl SimShared {
    fn emit(&self, event: PlayerEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }
}

type TapFrameQueue = Arc<Mutex<VecDeque<(PixelBuffer, MediaTime)>>>;

/// Tap fed by the driver through the handle.
struct SimTap {
    frames: TapFrameQueue,
}

impl VideoTap for SimTap {
    fn has_new_pixel_buffer(&self, _at: MediaTime) -> bool {
        !self.frames.lock().unwrap().is_empty()
    }

    fn copy_pixel_buffer(&mut self, _at: MediaTime) -> Option<(PixelBuffer, MediaTime)> {
        self.frames.lock().unwrap().pop_front()
    }
}

/// The engine half: moves into the player.
pub struct SimPlaybackEngine {
    shared: Arc<Mutex<SimShared>>,
    tap: SimTap,
    tap_frames: TapFrameQueue,
}

/// The driver half: stays with the host/test and scripts the engine.
#[derive(Clone)]
pub struct SimEngineHandle {
    shared: Arc<Mutex<SimShared>>,
    tap_frames: TapFrameQueue,
}

impl SimPlaybackEngine {
    pub fn new() -> (Self, SimEngineHandle) {
        let shared = Arc::new(Mutex::new(SimShared {
            items: VecDeque::new(),
            current_time: MediaTime::zero(),
            rate: 0.0,
            status: EngineStatus::ReadyToPlay,
            failed_items: Vec::new(),
            action_at_end: EndAction::Advance,
            repeat_current: false,
            sink: None,
            pending_seeks: VecDeque::new(),
            seek_invocations: 0,
            auto_complete_seeks: false,
        }));
        let tap_frames: TapFrameQueue = Arc::new(Mutex::new(VecDeque::new()));
        let engine = Self {
            shared: Arc::clone(&shared),
            tap: SimTap {
                frames: Arc::clone(&tap_frames),
            },
            tap_frames: Arc::clone(&tap_frames),
        };
        let handle = SimEngineHandle { shared, tap_frames };
        (engine, handle)
    }
}

impl PlaybackEngine for SimPlaybackEngine {
    fn items(&self) -> Vec<ItemId> {
        self.shared
            .lock()
            .unwrap()
            .items
            .iter()
            .map(|item| item.id)
            .collect()
    }

    fn current_item(&self) -> Option<ItemId> {
        self.shared.lock().unwrap().items.front().map(|item| item.id)
    }

    fn insert(&mut self, item: PlayerItem, after: Option<ItemId>) {
        let mut shared = self.shared.lock().unwrap();
        match after.and_then(|id| shared.items.iter().position(|i| i.id == id)) {
            Some(index) => shared.items.insert(index + 1, item),
            None => shared.items.push_back(item),
        }
    }

    fn remove(&mut self, id: ItemId) {
        self.shared.lock().unwrap().items.retain(|item| item.id != id);
    }

    fn remove_all(&mut self) {
        self.shared.lock().unwrap().items.clear();
    }

    fn advance_to_next(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.items.pop_front();
        shared.current_time = MediaTime::zero();
    }

    fn replace_current(&mut self, item: Option<PlayerItem>) {
        let mut shared = self.shared.lock().unwrap();
        shared.items.pop_front();
        if let Some(item) = item {
            shared.items.push_front(item);
        }
        shared.current_time = MediaTime::zero();
    }

    fn seek(
        &mut self,
        to: MediaTime,
        _tolerance_before: MediaTime,
        _tolerance_after: MediaTime,
        completion: SeekCompletion,
    ) {
        let mut shared = self.shared.lock().unwrap();
        shared.seek_invocations += 1;
        shared.pending_seeks.push_back(PendingSeek {
            target: to,
            completion,
        });
    }

    fn play(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.rate == 0.0 {
            shared.rate = 1.0;
            shared.emit(PlayerEvent::RateChanged(1.0));
        }
    }

    fn pause(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.rate != 0.0 {
            shared.rate = 0.0;
            shared.emit(PlayerEvent::RateChanged(0.0));
        }
    }

    fn set_rate(&mut self, rate: f32) {
        let mut shared = self.shared.lock().unwrap();
        if shared.rate != rate {
            shared.rate = rate;
            shared.emit(PlayerEvent::RateChanged(rate));
        }
    }

    fn rate(&self) -> f32 {
        self.shared.lock().unwrap().rate
    }

    fn status(&self) -> EngineStatus {
        self.shared.lock().unwrap().status
    }

    fn item_status(&self, id: ItemId) -> ItemStatus {
        let shared = self.shared.lock().unwrap();
        if shared.failed_items.contains(&id) {
            ItemStatus::Failed
        } else if shared.items.iter().any(|item| item.id == id) {
            ItemStatus::ReadyToPlay
        } else {
            ItemStatus::Unknown
        }
    }

    fn current_time(&self) -> MediaTime {
        self.shared.lock().unwrap().current_time
    }

    fn set_action_at_item_end(&mut self, action: EndAction) {
        self.shared.lock().unwrap().action_at_end = action;
    }

    fn set_item_repeat(&mut self, enabled: bool) {
        self.shared.lock().unwrap().repeat_current = enabled;
    }

    fn set_event_sink(&mut self, sink: Sender<PlayerEvent>) {
        self.shared.lock().unwrap().sink = Some(sink);
    }

    fn clear_event_sink(&mut self) {
        self.shared.lock().unwrap().sink = None;
    }

    fn tap(&mut self) -> Option<&mut dyn VideoTap> {
        let tap_enabled = self
            .shared
            .lock()
            .unwrap()
            .items
            .front()
            .map(|item| item.tap_enabled)
            .unwrap_or(false);
        if tap_enabled {
            Some(&mut self.tap)
        } else {
            None
        }
    }
}

impl SimEngineHandle {
    /// Advance the playhead by `seconds` of host time (scaled by rate) and
    /// deliver end-of-item behavior.
    pub fn tick(&self, seconds: f64) {
        let mut completions: Vec<(MediaTime, SeekCompletion)> = Vec::new();
        let mut ended: Option<ItemId> = None;
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.auto_complete_seeks {
                while let Some(seek) = shared.pending_seeks.pop_front() {
                    completions.push((seek.target, seek.completion));
                }
                if let Some((target, _)) = completions.last() {
                    shared.current_time = *target;
                }
            }
            if shared.rate != 0.0 {
                let step =
                    MediaTime::from_seconds(seconds * shared.rate as f64, DEFAULT_TIMESCALE);
                let new_time = shared.current_time + step;
                shared.current_time = new_time;
                if let Some(current) = shared.items.front().cloned() {
                    if new_time.compare(&current.duration) != std::cmp::Ordering::Less {
                        ended = Some(current.id);
                        if shared.repeat_current {
                            shared.current_time = MediaTime::zero();
                        } else {
                            match shared.action_at_end {
                                // A queue engine only advances when a next
                                // item exists; the last item stays current
                                // with the playhead parked past its end.
                                EndAction::Advance => {
                                    if shared.items.len() > 1 {
                                        shared.items.pop_front();
                                        shared.current_time = MediaTime::zero();
                                    }
                                }
                                EndAction::Pause => {
                                    shared.rate = 0.0;
                                }
                                EndAction::None => {}
                            }
                        }
                    }
                }
                if let Some(id) = ended {
                    shared.emit(PlayerEvent::DidPlayToEnd(id));
                }
            }
        }
        for (_, completion) in completions {
            completion(true);
        }
    }

    /// Move the playhead without simulating elapsed time.
    pub fn set_time(&self, seconds: f64) {
        self.shared.lock().unwrap().current_time =
            MediaTime::from_seconds(seconds, DEFAULT_TIMESCALE);
    }

    pub fn current_time_seconds(&self) -> f64 {
        self.shared.lock().unwrap().current_time.seconds()
    }

    /// Queue a frame for the video tap.
    pub fn push_tap_frame(&self, pixels: PixelBuffer, display_time: MediaTime) {
        self.tap_frames
            .lock()
            .unwrap()
            .push_back((pixels, display_time));
    }

    pub fn pending_tap_frames(&self) -> usize {
        self.tap_frames.lock().unwrap().len()
    }

    /// Finish the oldest outstanding seek. Returns `false` when none was
    /// pending.
    pub fn complete_next_seek(&self, finished: bool) -> bool {
        let seek = {
            let mut shared = self.shared.lock().unwrap();
            let seek = shared.pending_seeks.pop_front();
            if let Some(pending) = &seek {
                if finished {
                    shared.current_time = pending.target;
                }
            }
            seek
        };
        match seek {
            Some(pending) => {
                (pending.completion)(finished);
                true
            }
            None => false,
        }
    }

    pub fn set_auto_complete_seeks(&self, enabled: bool) {
        self.shared.lock().unwrap().auto_complete_seeks = enabled;
    }

    pub fn pending_seek_count(&self) -> usize {
        self.shared.lock().unwrap().pending_seeks.len()
    }

    /// Total number of `seek` calls the engine has received.
    pub fn seek_invocations(&self) -> u64 {
        self.shared.lock().unwrap().seek_invocations
    }

    pub fn items_len(&self) -> usize {
        self.shared.lock().unwrap().items.len()
    }

    pub fn set_status(&self, status: EngineStatus) {
        let mut shared = self.shared.lock().unwrap();
        shared.status = status;
        shared.emit(PlayerEvent::StatusChanged(status));
    }

    pub fn fail_item(&self, id: ItemId) {
        let mut shared = self.shared.lock().unwrap();
        shared.failed_items.push(id);
        shared.emit(PlayerEvent::ItemStatusChanged(id, ItemStatus::Failed));
    }

    pub fn emit_stalled(&self, id: ItemId) {
        self.shared.lock().unwrap().emit(PlayerEvent::Stalled(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::pixel::PixelFormat;

    #[test]
    fn test_tick_advances_and_ends_items() {
        let (mut engine, handle) = SimPlaybackEngine::new();
        let (sink, events) = std::sync::mpsc::channel();
        engine.set_event_sink(sink);

        let item = PlayerItem::new(MediaTime::new(600, 600)); // 1s
        let id = item.id;
        engine.insert(item, None);
        engine.play();

        handle.tick(0.5);
        assert!(engine.current_time().seconds() > 0.4);
        handle.tick(0.6);

        // The only item stays current with the playhead past its end.
        assert_eq!(engine.items().len(), 1);
        assert!(engine.current_time().seconds() >= 1.0);
        let seen: Vec<PlayerEvent> = events.try_iter().collect();
        assert!(seen.contains(&PlayerEvent::DidPlayToEnd(id)));

        // With a successor queued, the engine advances.
        engine.insert(PlayerItem::new(MediaTime::new(600, 600)), None);
        handle.tick(0.1);
        assert_eq!(engine.items().len(), 1);
    }

    #[test]
    fn test_seek_completion_is_deferred() {
        let (mut engine, handle) = SimPlaybackEngine::new();
        let completed = Arc::new(Mutex::new(false));
        let observed = Arc::clone(&completed);
        engine.seek(
            MediaTime::new(2, 1),
            MediaTime::zero(),
            MediaTime::zero(),
            Box::new(move |finished| *observed.lock().unwrap() = finished),
        );
        assert!(!*completed.lock().unwrap());
        assert_eq!(handle.pending_seek_count(), 1);

        assert!(handle.complete_next_seek(true));
        assert!(*completed.lock().unwrap());
        assert_eq!(engine.current_time(), MediaTime::new(2, 1));
    }

    #[test]
    fn test_tap_yields_pushed_frames() {
        let (mut engine, handle) = SimPlaybackEngine::new();
        engine.insert(PlayerItem::new(MediaTime::new(600, 600)), None);
        handle.push_tap_frame(
            PixelBuffer::alloc(2, 2, PixelFormat::YCbCr420Bi),
            MediaTime::new(1, 30),
        );

        let tap = engine.tap().unwrap();
        assert!(tap.has_new_pixel_buffer(MediaTime::zero()));
        let (_, display_time) = tap.copy_pixel_buffer(MediaTime::zero()).unwrap();
        assert_eq!(display_time, MediaTime::new(1, 30));
        assert!(!tap.has_new_pixel_buffer(MediaTime::zero()));
    }

    #[test]
    fn test_tap_disabled_items_expose_no_tap() {
        let (mut engine, _handle) = SimPlaybackEngine::new();
        engine.insert(
            PlayerItem::new(MediaTime::new(600, 600)).with_tap_enabled(false),
            None,
        );
        assert!(engine.tap().is_none());
    }
}
