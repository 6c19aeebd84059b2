//! Framebuffer generation: YUV ingestion and RGB read-back
//!
//! Decoded pixel buffers arrive as bi-planar 4:2:0 YCbCr; the graph works
//! in RGBA framebuffers oriented portrait. The generator converts with a
//! full-range BT.601 matrix and rotates as the source orientation
//! requires. The inverse path reads a framebuffer back into a pooled
//! pixel buffer with the BGRA channel order container writers ingest.
//!
//! All conversions run on the shared image-processing queue; calls from
//! any other thread block until their turn.

use log::debug;

use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::media::framebuffer::{Framebuffer, TextureSize, TimingStyle};
use crate::media::orientation::{Orientation, Rotation};
use crate::media::pixel::{PixelBuffer, PixelBufferPool, PixelFormat};
use crate::media::time::MediaTime;
use crate::runtime::context::PipelineContext;

/// Converts decoded pixel buffers into framebuffers and back.
#[derive(Clone)]
pub struct FramebufferGenerator {
    context: Arc<PipelineContext>,
}

impl FramebufferGenerator {
    pub fn new(context: Arc<PipelineContext>) -> Self {
        Self { context }
    }

    /// Convert a 4:2:0 YCbCr pixel buffer into a portrait RGBA
    /// framebuffer stamped with `pts`.
    ///
    /// The returned framebuffer carries the producer's working lock.
    pub fn framebuffer_from_yuv(
        &self,
        pixels: PixelBuffer,
        pts: MediaTime,
        source_orientation: Orientation,
    ) -> PipelineResult<Framebuffer> {
        if pixels.format() != PixelFormat::YCbCr420Bi {
            return Err(PipelineError::Backend(anyhow::anyhow!(
                "expected 4:2:0 bi-planar input, got {:?}",
                pixels.format()
            )));
        }
        let context = Arc::clone(&self.context);
        Ok(self.context.run_image_work(move || {
            let width = pixels.width();
            let height = pixels.height();
            let rotation = source_orientation.rotation_needed(Orientation::Portrait);
            let (out_width, out_height) = if rotation.swaps_dimensions() {
                (height, width)
            } else {
                (width, height)
            };

            let framebuffer = context.framebuffer_pool().fetch(
                TextureSize::new(out_width, out_height),
                Orientation::Portrait,
                TimingStyle::VideoFrame(pts),
            );

            let mut rgba = vec![0u8; width as usize * height as usize * 4];
            yuv420_to_rgba(pixels.data(), width, height, &mut rgba);
            framebuffer.write_texture_data(|texture| {
                rotate_rgba(&rgba, width, height, rotation, texture);
            });
            framebuffer
        }))
    }

    /// Read a framebuffer back into a buffer from `pool`, swizzling to the
    /// pool's channel order. `None` under pool back-pressure or when the
    /// framebuffer was already recycled.
    ///
    /// The framebuffer's locks are untouched; the caller still owns its
    /// unlock.
    pub fn pixel_buffer_from_framebuffer(
        &self,
        framebuffer: &Framebuffer,
        pool: &Arc<PixelBufferPool>,
    ) -> Option<PixelBuffer> {
        let framebuffer = framebuffer.clone();
        let pool = Arc::clone(pool);
        self.context.run_image_work(move || {
            let mut pixels = pool.take()?;
            let size = framebuffer.size();
            if size.width != pixels.width() || size.height != pixels.height() {
                debug!(
                    "read-back size mismatch: framebuffer {}x{}, pool {}x{}",
                    size.width,
                    size.height,
                    pixels.width(),
                    pixels.height()
                );
            }
            let swizzle = pixels.format() == PixelFormat::Bgra32;
            let (out_width, out_height) = (pixels.width(), pixels.height());
            let copied = framebuffer.with_texture_data(|texture| {
                copy_rows(
                    texture,
                    size.width,
                    size.height,
                    pixels.data_mut(),
                    out_width,
                    out_height,
                    swizzle,
                );
            });
            match copied {
                Some(()) => Some(pixels),
                None => None,
            }
        })
    }
}

/// Full-range BT.601 conversion of packed bi-planar 4:2:0 into RGBA.
fn yuv420_to_rgba(source: &[u8], width: u32, height: u32, destination: &mut [u8]) {
    let (w, h) = (width as usize, height as usize);
    let luma_len = w * h;
    let chroma_width = (w + 1) / 2;
    let luma = &source[..luma_len];
    let chroma = &source[luma_len..];

    for row in 0..h {
        for column in 0..w {
            let y = luma[row * w + column] as f32;
            let chroma_index = (row / 2) * chroma_width * 2 + (column / 2) * 2;
            let cb = chroma[chroma_index] as f32 - 128.0;
            let cr = chroma[chroma_index + 1] as f32 - 128.0;

            let r = y + 1.402 * cr;
            let g = y - 0.343 * cb - 0.711 * cr;
            let b = y + 1.765 * cb;

            let out = (row * w + column) * 4;
            destination[out] = r.clamp(0.0, 255.0) as u8;
            destination[out + 1] = g.clamp(0.0, 255.0) as u8;
            destination[out + 2] = b.clamp(0.0, 255.0) as u8;
            destination[out + 3] = 255;
        }
    }
}

/// Write `source` (RGBA, `width` x `height`) into `destination` applying
/// `rotation`. Quarter turns swap the destination dimensions.
fn rotate_rgba(source: &[u8], width: u32, height: u32, rotation: Rotation, destination: &mut [u8]) {
    let (w, h) = (width as usize, height as usize);
    if rotation == Rotation::None {
        let len = source.len().min(destination.len());
        destination[..len].copy_from_slice(&source[..len]);
        return;
    }
    for row in 0..h {
        for column in 0..w {
            let (out_row, out_column, out_width) = match rotation {
                Rotation::None => unreachable!(),
                Rotation::Rotate180 => (h - 1 - row, w - 1 - column, w),
                Rotation::Clockwise => (column, h - 1 - row, h),
                Rotation::Counterclockwise => (w - 1 - column, row, h),
            };
            let src = (row * w + column) * 4;
            let dst = (out_row * out_width + out_column) * 4;
            destination[dst..dst + 4].copy_from_slice(&source[src..src + 4]);
        }
    }
}

/// Row copy with an optional RGBA -> BGRA swizzle. Fast path when the
/// geometries match exactly; otherwise the overlapping region is copied
/// row by row.
fn copy_rows(
    source: &[u8],
    source_width: u32,
    source_height: u32,
    destination: &mut [u8],
    dest_width: u32,
    dest_height: u32,
    swizzle: bool,
) {
    let copy_width = source_width.min(dest_width) as usize;
    let rows = source_height.min(dest_height) as usize;
    let source_stride = source_width as usize * 4;
    let dest_stride = dest_width as usize * 4;

    if !swizzle && source_stride == dest_stride {
        let len = (rows * source_stride).min(source.len()).min(destination.len());
        destination[..len].copy_from_slice(&source[..len]);
        return;
    }

    for row in 0..rows {
        let src_start = row * source_stride;
        let dst_start = row * dest_stride;
        for column in 0..copy_width {
            let src = src_start + column * 4;
            let dst = dst_start + column * 4;
            if swizzle {
                destination[dst] = source[src + 2];
                destination[dst + 1] = source[src + 1];
                destination[dst + 2] = source[src];
                destination[dst + 3] = source[src + 3];
            } else {
                destination[dst..dst + 4].copy_from_slice(&source[src..src + 4]);
            }
        }
    }
}
