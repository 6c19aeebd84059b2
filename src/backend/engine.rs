//! Playback engine abstraction
//!
//! The host's queue-of-items player, reduced to what the display-tap
//! player needs: item management, rate control, tolerance-based seeks with
//! completion callbacks, a per-item video tap, and an event channel that
//! replaces property observation with plain messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;

use crate::media::pixel::PixelBuffer;
use crate::media::time::MediaTime;

pub type ItemId = u64;

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// One entry in the engine's playback queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerItem {
    pub id: ItemId,
    pub duration: MediaTime,
    /// Whether the display tap extracts pixel buffers from this item.
    pub tap_enabled: bool,
}

impl PlayerItem {
    pub fn new(duration: MediaTime) -> Self {
        Self {
            id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
            duration,
            tap_enabled: true,
        }
    }

    pub fn with_tap_enabled(mut self, enabled: bool) -> Self {
        self.tap_enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Unknown,
    ReadyToPlay,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Unknown,
    ReadyToPlay,
    Failed,
}

/// What the engine does on its own when an item finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAction {
    Advance,
    Pause,
    None,
}

/// Notifications delivered over the event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StatusChanged(EngineStatus),
    RateChanged(f32),
    ItemStatusChanged(ItemId, ItemStatus),
    DidPlayToEnd(ItemId),
    Stalled(ItemId),
}

/// The current item's video output.
///
/// Mirrors a display-refresh tap: the caller asks whether a pixel buffer
/// newer than the last copy exists for a given host time, then copies it
/// together with its display timestamp.
pub trait VideoTap {
    fn has_new_pixel_buffer(&self, at: MediaTime) -> bool;

    fn copy_pixel_buffer(&mut self, at: MediaTime) -> Option<(PixelBuffer, MediaTime)>;
}

/// A queue-of-items playback engine.
///
/// Completion callbacks passed to `seek` must be invoked after `seek`
/// returns, never synchronously from inside it; the player re-enters the
/// engine from the completion path.
pub trait PlaybackEngine: Send {
    fn items(&self) -> Vec<ItemId>;

    fn current_item(&self) -> Option<ItemId>;

    /// Insert after the given item, or at the back of the queue.
    fn insert(&mut self, item: PlayerItem, after: Option<ItemId>);

    fn remove(&mut self, id: ItemId);

    fn remove_all(&mut self);

    fn advance_to_next(&mut self);

    fn replace_current(&mut self, item: Option<PlayerItem>);

    fn seek(
        &mut self,
        to: MediaTime,
        tolerance_before: MediaTime,
        tolerance_after: MediaTime,
        completion: Box<dyn FnOnce(bool) + Send>,
    );

    fn play(&mut self);

    fn pause(&mut self);

    fn set_rate(&mut self, rate: f32);

    fn rate(&self) -> f32;

    fn status(&self) -> EngineStatus;

    fn item_status(&self, id: ItemId) -> ItemStatus;

    fn current_time(&self) -> MediaTime;

    fn set_action_at_item_end(&mut self, action: EndAction);

    /// Repeat the current item engine-side (the looper discipline).
    fn set_item_repeat(&mut self, enabled: bool);

    fn set_event_sink(&mut self, sink: Sender<PlayerEvent>);

    fn clear_event_sink(&mut self);

    /// Video tap of the current item, when it has one enabled.
    fn tap(&mut self) -> Option<&mut dyn VideoTap>;
}
