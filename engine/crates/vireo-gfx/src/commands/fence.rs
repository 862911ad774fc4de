//! 队列计数 fence
//!
//! CPU 在复用每帧资源（backing memory、描述符堆块、staging ring）之前，
//! 用它保证 GPU 已经消费完上一帧的命令。

use crate::foundation::driver::GfxDriver;

/// 单调递增的计数 fence
///
/// `signal` 在队列上递增并 signal；`wait` 阻塞调用线程直到最近一次
/// signal 的值完成。没有 async 形式的挂起。
pub struct GfxQueueFence {
    last_signaled: u64,
}

impl Default for GfxQueueFence {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl GfxQueueFence {
    pub fn new() -> Self {
        Self { last_signaled: 0 }
    }
}

// tools
impl GfxQueueFence {
    /// 在队列上 signal 下一个值
    pub fn signal(&mut self, driver: &dyn GfxDriver) -> u64 {
        self.last_signaled += 1;
        driver.queue_signal(self.last_signaled);
        self.last_signaled
    }

    /// 阻塞等待最近一次 signal 的值
    ///
    /// 从未 signal 过时直接返回。
    pub fn wait(&self, driver: &dyn GfxDriver) {
        if self.last_signaled > 0 {
            driver.queue_wait(self.last_signaled);
        }
    }

    #[inline]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }
}
