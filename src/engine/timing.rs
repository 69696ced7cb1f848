//! 耗时统计

use std::time::Instant;

/// 在析构时记录所包裹操作的墙钟耗时
pub struct TimingGuard {
    name: &'static str,
    start: Instant,
}

impl TimingGuard {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        tracing::info!(
            operation = self.name,
            elapsed_secs = self.start.elapsed().as_secs_f64(),
            "[Timing] {} took {:.6} seconds",
            self.name,
            self.start.elapsed().as_secs_f64()
        );
    }
}
