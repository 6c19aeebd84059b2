//! Shared pipeline context
//!
//! One context per session, threaded explicitly through constructors. It
//! owns the resources the components would otherwise reach for globally:
//! the shared image-processing queue (which serializes all framebuffer
//! production and rendering) and the framebuffer pool.

use std::sync::Arc;

use crate::media::framebuffer::FramebufferPool;
use crate::runtime::queue::SerialQueue;

/// Session-scoped shared state.
pub struct PipelineContext {
    image_queue: SerialQueue,
    framebuffer_pool: Arc<FramebufferPool>,
}

impl PipelineContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            image_queue: SerialQueue::new("reelflow-image-processing"),
            framebuffer_pool: Arc::new(FramebufferPool::new()),
        })
    }

    /// The single queue that owns all image work. Submissions from other
    /// threads block; submissions from the queue itself run inline.
    pub fn image_queue(&self) -> &SerialQueue {
        &self.image_queue
    }

    pub fn framebuffer_pool(&self) -> &Arc<FramebufferPool> {
        &self.framebuffer_pool
    }

    /// Run `work` serialized on the image-processing queue.
    pub fn run_image_work<R: Send + 'static>(
        &self,
        work: impl FnOnce() -> R + Send + 'static,
    ) -> R {
        self.image_queue.run_sync(work)
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("image_queue", &self.image_queue)
            .field("live_framebuffers", &self.framebuffer_pool.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::framebuffer::{TextureSize, TimingStyle};
    use crate::media::orientation::Orientation;

    #[test]
    fn test_image_work_is_serialized() {
        let context = PipelineContext::new();
        let on_queue = {
            let context = Arc::clone(&context);
            context.clone().run_image_work(move || {
                // Nested submission must run inline, not deadlock.
                context.run_image_work(|| true)
            })
        };
        assert!(on_queue);
    }

    #[test]
    fn test_pool_is_shared() {
        let context = PipelineContext::new();
        let framebuffer = context.framebuffer_pool().fetch(
            TextureSize::new(2, 2),
            Orientation::Portrait,
            TimingStyle::StillImage,
        );
        assert_eq!(context.framebuffer_pool().live_count(), 1);
        framebuffer.unlock();
        assert_eq!(context.framebuffer_pool().live_count(), 0);
    }
}
