//! Shared run-time configuration (spec.md §4.F, §9).
//!
//! Analogous to the teacher's ad-hoc CLI flags threaded through `Body`
//! construction, but gathered into one struct: default chunk geometry,
//! default compression, the thread pool used for parallel bevy
//! compression, and a cooperative abort flag for [`crate::stream::ProgressContext`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use threadpool::ThreadPool;

use crate::image::CompressionMethod;

pub const DEFAULT_CHUNK_SIZE: u32 = 32 * 1024;
pub const DEFAULT_CHUNKS_PER_SEGMENT: u32 = 1024;

pub struct Context {
    pub pool: ThreadPool,
    pub chunk_size: u32,
    pub chunks_per_segment: u32,
    pub compression: CompressionMethod,
    abort: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            pool: ThreadPool::new(num_cpus()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_per_segment: DEFAULT_CHUNKS_PER_SEGMENT,
            compression: CompressionMethod::Zlib,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A [`crate::stream::ProgressContext`] that checks the shared abort flag
/// on every call, letting a user-requested cancellation unwind a bulk copy.
pub struct AbortableProgress {
    abort: Arc<AtomicBool>,
}

impl AbortableProgress {
    pub fn new(ctx: &Context) -> Self {
        Self {
            abort: ctx.abort_flag(),
        }
    }
}

impl crate::stream::ProgressContext for AbortableProgress {
    fn report(&mut self, _readptr: u64) -> bool {
        !self.abort.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abortable_progress_stops_copy_once_flagged() {
        let ctx = Context::new();
        let mut progress = AbortableProgress::new(&ctx);
        assert!(crate::stream::ProgressContext::report(&mut progress, 0));
        ctx.request_abort();
        assert!(!crate::stream::ProgressContext::report(&mut progress, 0));
    }
}
