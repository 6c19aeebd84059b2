//! Lock-counted framebuffers and the size-keyed texture pool
//!
//! A framebuffer is a shared handle to one rendered image plus its
//! metadata (logical size, orientation, timing, user info). Consumers that
//! want to read the image take a lock; when the lock count returns to
//! zero, the backing texture goes back to the pool for the next frame of
//! the same size.
//!
//! # Ownership protocol
//!
//! - The pool hands out framebuffers with a lock count of 1 (the
//!   producer's working lock).
//! - A producer takes one extra lock per consumer before delivery; each
//!   consumer is responsible for exactly one unlock, on every path
//!   including drops and errors.
//! - After the final unlock the handle is dead: the texture has been
//!   recycled and reads return `None`.
//!
//! Unbalanced unlocks are a bug in the caller and fail loudly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::orientation::Orientation;
use super::time::MediaTime;

/// Logical size of a framebuffer in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSize {
    pub width: u32,
    pub height: u32,
}

impl TextureSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// How the image relates to the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimingStyle {
    /// Timeless content (lookup tables, overlays).
    StillImage,
    /// One frame of a stream, shown at the given presentation time.
    VideoFrame(MediaTime),
}

/// Opaque per-frame annotations stamped by producers.
#[derive(Debug, Clone, PartialEq)]
pub enum UserInfoValue {
    Time(MediaTime),
    Int(i64),
    Float(f64),
    Text(String),
}

struct Texture {
    id: u64,
    data: Vec<u8>,
}

struct FramebufferShared {
    size: TextureSize,
    orientation: Mutex<Orientation>,
    timing: TimingStyle,
    user_info: Mutex<HashMap<&'static str, UserInfoValue>>,
    lock_count: AtomicUsize,
    texture: Mutex<Option<Texture>>,
    pool: Weak<PoolState>,
}

/// Reference-counted handle to one pooled image.
///
/// Cloning produces another handle to the same image; it does not take a
/// lock. See the module docs for the lock protocol.
#[derive(Clone)]
pub struct Framebuffer {
    shared: Arc<FramebufferShared>,
}

impl Framebuffer {
    pub fn size(&self) -> TextureSize {
        self.shared.size
    }

    pub fn timing(&self) -> TimingStyle {
        self.shared.timing
    }

    /// Presentation time, if this is a video frame.
    pub fn timestamp(&self) -> Option<MediaTime> {
        match self.shared.timing {
            TimingStyle::VideoFrame(time) => Some(time),
            TimingStyle::StillImage => None,
        }
    }

    pub fn orientation(&self) -> Orientation {
        *self.shared.orientation.lock().unwrap()
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        *self.shared.orientation.lock().unwrap() = orientation;
    }

    pub fn set_user_info(&self, key: &'static str, value: UserInfoValue) {
        self.shared.user_info.lock().unwrap().insert(key, value);
    }

    pub fn user_info(&self, key: &str) -> Option<UserInfoValue> {
        self.shared.user_info.lock().unwrap().get(key).cloned()
    }

    /// Current lock count; zero means the texture has been recycled.
    pub fn lock_count(&self) -> usize {
        self.shared.lock_count.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.lock_count() > 0
    }

    /// Take a read lock for another consumer.
    pub fn lock(&self) {
        let previous = self.shared.lock_count.fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0, "framebuffer locked after it was recycled");
    }

    /// Release one lock. The final unlock returns the texture to the pool.
    pub fn unlock(&self) {
        let previous = self.shared.lock_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "unbalanced framebuffer unlock");
        if previous == 1 {
            let texture = self.shared.texture.lock().unwrap().take();
            if let (Some(texture), Some(pool)) = (texture, self.shared.pool.upgrade()) {
                pool.recycle(self.shared.size, texture);
            }
        }
    }

    /// Read the RGBA texture contents. `None` once recycled.
    pub fn with_texture_data<R>(&self, read: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let guard = self.shared.texture.lock().unwrap();
        guard.as_ref().map(|texture| read(&texture.data))
    }

    /// Overwrite the RGBA texture contents. `false` once recycled.
    pub fn write_texture_data(&self, write: impl FnOnce(&mut [u8])) -> bool {
        let mut guard = self.shared.texture.lock().unwrap();
        match guard.as_mut() {
            Some(texture) => {
                write(&mut texture.data);
                true
            }
            None => false,
        }
    }

    /// Identifier of the backing texture, stable until recycled.
    pub fn texture_id(&self) -> Option<u64> {
        self.shared.texture.lock().unwrap().as_ref().map(|t| t.id)
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("size", &self.shared.size)
            .field("timing", &self.shared.timing)
            .field("locks", &self.lock_count())
            .finish()
    }
}

struct PoolState {
    free: Mutex<HashMap<TextureSize, Vec<Texture>>>,
    next_texture_id: AtomicU64,
    live: AtomicUsize,
}

impl PoolState {
    fn recycle(&self, size: TextureSize, texture: Texture) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.free
            .lock()
            .unwrap()
            .entry(size)
            .or_default()
            .push(texture);
    }
}

/// Size-keyed pool of textures backing framebuffers.
pub struct FramebufferPool {
    state: Arc<PoolState>,
}

impl FramebufferPool {
    pub fn new() -> Self {
        Self {
            state: Arc::new(PoolState {
                free: Mutex::new(HashMap::new()),
                next_texture_id: AtomicU64::new(1),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Fetch a framebuffer for `size`, reusing a recycled texture when one
    /// matches. The returned handle holds the producer's working lock.
    pub fn fetch(
        &self,
        size: TextureSize,
        orientation: Orientation,
        timing: TimingStyle,
    ) -> Framebuffer {
        let texture = {
            let mut free = self.state.free.lock().unwrap();
            free.get_mut(&size).and_then(Vec::pop)
        };
        let texture = texture.unwrap_or_else(|| Texture {
            id: self.state.next_texture_id.fetch_add(1, Ordering::Relaxed),
            data: vec![0; size.byte_len()],
        });
        self.state.live.fetch_add(1, Ordering::AcqRel);
        Framebuffer {
            shared: Arc::new(FramebufferShared {
                size,
                orientation: Mutex::new(orientation),
                timing,
                user_info: Mutex::new(HashMap::new()),
                lock_count: AtomicUsize::new(1),
                texture: Mutex::new(Some(texture)),
                pool: Arc::downgrade(&self.state),
            }),
        }
    }

    /// Framebuffers whose locks have not yet drained back to zero.
    pub fn live_count(&self) -> usize {
        self.state.live.load(Ordering::Acquire)
    }

    /// Recycled textures available for reuse, across all sizes.
    pub fn idle_count(&self) -> usize {
        self.state
            .free
            .lock()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl Default for FramebufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_one(pool: &FramebufferPool) -> Framebuffer {
        pool.fetch(
            TextureSize::new(4, 4),
            Orientation::Portrait,
            TimingStyle::VideoFrame(MediaTime::new(1, 30)),
        )
    }

    #[test]
    fn test_lock_balance_returns_texture() {
        let pool = FramebufferPool::new();
        let framebuffer = fetch_one(&pool);
        let id = framebuffer.texture_id().unwrap();
        assert_eq!(pool.live_count(), 1);

        framebuffer.lock(); // a consumer
        framebuffer.unlock(); // consumer done
        assert!(framebuffer.is_live());

        framebuffer.unlock(); // producer's working lock
        assert!(!framebuffer.is_live());
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 1);

        // Same size fetch reuses the recycled texture.
        let next = fetch_one(&pool);
        assert_eq!(next.texture_id(), Some(id));
        next.unlock();
    }

    #[test]
    #[should_panic(expected = "unbalanced framebuffer unlock")]
    fn test_unbalanced_unlock_panics() {
        let pool = FramebufferPool::new();
        let framebuffer = fetch_one(&pool);
        framebuffer.unlock();
        framebuffer.unlock();
    }

    #[test]
    fn test_texture_reads_fail_after_recycle() {
        let pool = FramebufferPool::new();
        let framebuffer = fetch_one(&pool);
        assert!(framebuffer.write_texture_data(|data| data.fill(7)));
        assert_eq!(
            framebuffer.with_texture_data(|data| data[0]),
            Some(7),
        );
        framebuffer.unlock();
        assert!(framebuffer.with_texture_data(|data| data[0]).is_none());
        assert!(!framebuffer.write_texture_data(|data| data.fill(1)));
    }

    #[test]
    fn test_sizes_are_pooled_separately() {
        let pool = FramebufferPool::new();
        let small = pool.fetch(
            TextureSize::new(2, 2),
            Orientation::Portrait,
            TimingStyle::StillImage,
        );
        small.unlock();
        assert_eq!(pool.idle_count(), 1);

        let large = pool.fetch(
            TextureSize::new(8, 8),
            Orientation::Portrait,
            TimingStyle::StillImage,
        );
        // The 2x2 texture must not be reused for an 8x8 request.
        assert_eq!(pool.idle_count(), 1);
        large.unlock();
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_user_info_round_trip() {
        let pool = FramebufferPool::new();
        let framebuffer = fetch_one(&pool);
        framebuffer.set_user_info("player.time", UserInfoValue::Float(1.25));
        assert_eq!(
            framebuffer.user_info("player.time"),
            Some(UserInfoValue::Float(1.25))
        );
        assert!(framebuffer.user_info("missing").is_none());
        framebuffer.unlock();
    }
}
