//! Host-visible pixel memory and its pool
//!
//! Pixel buffers are plain CPU-reachable image memory handed to the
//! container writer or filled by a decoder. Allocation goes through a pool
//! keyed on `{width, height, format}`:
//!
//! - a minimum number of buffers is pre-allocated up front,
//! - storage is recycled when a buffer drops,
//! - the pool refuses to hand out more than its configured maximum, which
//!   is how writer-side back-pressure surfaces to producers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Memory layout of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit interleaved blue/green/red/alpha, the writer's native order.
    Bgra32,
    /// 8-bit interleaved red/green/blue/alpha, the texture read-back order.
    Rgba32,
    /// 8-bit bi-planar 4:2:0: a full-resolution luma plane followed by an
    /// interleaved half-resolution CbCr plane.
    YCbCr420Bi,
}

impl PixelFormat {
    /// Total byte length of one image at this format.
    pub fn byte_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => w * h * 4,
            // Chroma dimensions round up so odd sizes stay addressable.
            PixelFormat::YCbCr420Bi => w * h + (w + 1) / 2 * ((h + 1) / 2) * 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorPrimaries {
    ItuR709_2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YcbcrMatrix {
    ItuR601_4,
    ItuR709_2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFunction {
    ItuR709_2,
}

/// Color metadata propagated on appended buffers.
///
/// Applied once, to the first buffer of a session, unless the recording
/// options suppress attachments entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachments {
    pub primaries: ColorPrimaries,
    pub ycbcr_matrix: YcbcrMatrix,
    pub transfer_function: TransferFunction,
    pub should_propagate: bool,
}

impl Default for ColorAttachments {
    fn default() -> Self {
        Self {
            primaries: ColorPrimaries::ItuR709_2,
            ycbcr_matrix: YcbcrMatrix::ItuR601_4,
            transfer_function: TransferFunction::ItuR709_2,
            should_propagate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    width: u32,
    height: u32,
    format: PixelFormat,
}

#[derive(Debug)]
struct PoolShared {
    key: PoolKey,
    free: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicUsize,
    max_buffers: usize,
}

impl PoolShared {
    fn recycle(&self, mut storage: Vec<u8>) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        storage.fill(0);
        self.free.lock().unwrap().push(storage);
    }
}

/// Planar or interleaved image memory.
///
/// Buffers either come from a [`PixelBufferPool`] (storage is recycled on
/// drop) or stand alone via [`PixelBuffer::alloc`].
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    attachments: Option<ColorAttachments>,
    pool: Option<Weak<PoolShared>>,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer that does not belong to any pool.
    pub fn alloc(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; format.byte_len(width, height)],
            attachments: None,
            pool: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn attachments(&self) -> Option<&ColorAttachments> {
        self.attachments.as_ref()
    }

    pub fn set_attachments(&mut self, attachments: ColorAttachments) {
        self.attachments = Some(attachments);
    }

    /// Release the payload now instead of waiting for drop. A pooled
    /// buffer still returns its storage to the pool.
    pub fn invalidate(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            pool.recycle(std::mem::take(&mut self.data));
        } else {
            self.data = Vec::new();
        }
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// Pool of recyclable pixel storage for one `{width, height, format}` key.
#[derive(Debug)]
pub struct PixelBufferPool {
    shared: Arc<PoolShared>,
}

/// Buffers pre-allocated when a pool is created.
pub const MINIMUM_POOL_BUFFERS: usize = 4;

impl PixelBufferPool {
    /// Create a pool with `MINIMUM_POOL_BUFFERS` pre-allocated buffers and
    /// the given ceiling on simultaneously outstanding buffers.
    pub fn new(width: u32, height: u32, format: PixelFormat, max_buffers: usize) -> Arc<Self> {
        let key = PoolKey {
            width,
            height,
            format,
        };
        let prealloc = MINIMUM_POOL_BUFFERS.min(max_buffers);
        let mut free = Vec::with_capacity(prealloc);
        for _ in 0..prealloc {
            free.push(vec![0; format.byte_len(width, height)]);
        }
        Arc::new(Self {
            shared: Arc::new(PoolShared {
                key,
                free: Mutex::new(free),
                in_flight: AtomicUsize::new(0),
                max_buffers,
            }),
        })
    }

    /// Take a buffer, reusing recycled storage when available.
    ///
    /// Returns `None` when `max_buffers` are already outstanding; the
    /// caller treats that as back-pressure and drops the frame.
    pub fn take(&self) -> Option<PixelBuffer> {
        let shared = &self.shared;
        // Reserve a slot first so concurrent takers cannot overshoot the
        // ceiling.
        loop {
            let outstanding = shared.in_flight.load(Ordering::Acquire);
            if outstanding >= shared.max_buffers {
                return None;
            }
            if shared
                .in_flight
                .compare_exchange(
                    outstanding,
                    outstanding + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        let storage = {
            let mut free = shared.free.lock().unwrap();
            free.pop()
        };
        let data = storage.unwrap_or_else(|| {
            vec![
                0;
                shared
                    .key
                    .format
                    .byte_len(shared.key.width, shared.key.height)
            ]
        });
        Some(PixelBuffer {
            width: shared.key.width,
            height: shared.key.height,
            format: shared.key.format,
            data,
            attachments: None,
            pool: Some(Arc::downgrade(&self.shared)),
        })
    }

    /// Number of buffers currently checked out.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Number of recycled buffers waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }

    pub fn width(&self) -> u32 {
        self.shared.key.width
    }

    pub fn height(&self) -> u32 {
        self.shared.key.height
    }

    pub fn format(&self) -> PixelFormat {
        self.shared.key.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_recycle_cycle() {
        let pool = PixelBufferPool::new(4, 4, PixelFormat::Bgra32, 8);
        assert_eq!(pool.idle_count(), MINIMUM_POOL_BUFFERS);

        let buffer = pool.take().unwrap();
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(buffer.data().len(), 64);
        drop(buffer);

        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.idle_count(), MINIMUM_POOL_BUFFERS);
    }

    #[test]
    fn test_exhaustion_backs_pressure() {
        let pool = PixelBufferPool::new(2, 2, PixelFormat::Rgba32, 2);
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert!(pool.take().is_none());
        drop(a);
        assert!(pool.take().is_some());
        drop(b);
    }

    #[test]
    fn test_recycled_storage_is_zeroed() {
        let pool = PixelBufferPool::new(2, 2, PixelFormat::Bgra32, 2);
        let mut buffer = pool.take().unwrap();
        buffer.data_mut().fill(0xFF);
        drop(buffer);
        let reused = pool.take().unwrap();
        assert!(reused.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalidate_returns_storage_early() {
        let pool = PixelBufferPool::new(2, 2, PixelFormat::Bgra32, 1);
        let mut buffer = pool.take().unwrap();
        assert!(pool.take().is_none());
        buffer.invalidate();
        assert_eq!(pool.in_flight(), 0);
        let reused = pool.take().unwrap();
        assert_eq!(pool.in_flight(), 1);
        // Dropping the invalidated husk must not recycle twice.
        drop(buffer);
        assert_eq!(pool.in_flight(), 1);
        drop(reused);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_planar_format_byte_len() {
        assert_eq!(PixelFormat::YCbCr420Bi.byte_len(4, 4), 16 + 8);
        assert_eq!(PixelFormat::YCbCr420Bi.byte_len(5, 5), 25 + 18);
        assert_eq!(PixelFormat::Bgra32.byte_len(3, 2), 24);
    }
}
