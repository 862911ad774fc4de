//! 每帧编排
//!
//! 固定一帧内各子系统的执行顺序：
//! fence 等待 → 释放上一帧 transient → tracker/堆游标 reset →
//! staging 准备 → transient 准备 → 录制（binding flush）→
//! 帧尾 transition-to-common → fence signal。
//! 单线程录制；所有每帧池子 reset 而非销毁，稳态零分配。

use ash::vk;
use vireo_gfx::commands::fence::GfxQueueFence;
use vireo_gfx::commands::recorder::GfxRecorder;
use vireo_gfx::foundation::driver::GfxDriver;

use crate::binding::FgExecContext;
use crate::descriptors::FgDescriptorArena;
use crate::registry::FgResourceRegistry;
use crate::staging::FgUploadRing;
use crate::state_tracker::{FgBarrierKind, FgStateTracker};
use crate::transient::{FgTransientAllocator, FgTransientPlacement};

/// 构造参数：都是增长阈值，不暴露到协议层
#[derive(Clone, Copy, Debug)]
pub struct FgFrameConfig {
    pub cpu_view_chunk_capacity: u32,
    pub gpu_view_chunk_capacity: u32,
    pub sampler_chunk_capacity: u32,
    pub initial_staging_bytes: vk::DeviceSize,
}

impl Default for FgFrameConfig {
    fn default() -> Self {
        Self {
            cpu_view_chunk_capacity: 256,
            gpu_view_chunk_capacity: 1024,
            sampler_chunk_capacity: 64,
            initial_staging_bytes: 1 << 20,
        }
    }
}

/// 外部帧图编译器产出的一帧执行计划
#[derive(Default)]
pub struct FgFramePlan {
    /// transient 并存字节数的高水位
    pub transient_peak_bytes: vk::DeviceSize,
    /// (资源描述, 字节偏移) 列表，下标即 transient 句柄
    pub placements: Vec<FgTransientPlacement>,
    /// 每个上传槽位声明的字节数
    pub upload_sizes: Vec<vk::DeviceSize>,
}

/// 一个逻辑设备上的帧资源管理器
///
/// backing allocation 与描述符堆块由本实例独占；外部资源只跟踪
/// 同步状态，从不释放。
pub struct FgFrameContext {
    pub transients: FgTransientAllocator,
    pub registry: FgResourceRegistry,
    pub tracker: FgStateTracker,
    pub cpu_views: FgDescriptorArena,
    pub gpu_views: FgDescriptorArena,
    pub samplers: FgDescriptorArena,
    pub uploads: FgUploadRing,
    pub fence: GfxQueueFence,
    frame_index: u64,
}

// new & destroy
impl FgFrameContext {
    pub fn new(driver: &dyn GfxDriver, config: FgFrameConfig) -> Self {
        Self {
            transients: FgTransientAllocator::new(),
            registry: FgResourceRegistry::new(),
            tracker: FgStateTracker::new(),
            cpu_views: FgDescriptorArena::cpu(driver, config.cpu_view_chunk_capacity),
            gpu_views: FgDescriptorArena::gpu(driver, config.gpu_view_chunk_capacity),
            samplers: FgDescriptorArena::sampler(driver, config.sampler_chunk_capacity),
            uploads: FgUploadRing::with_initial_capacity(driver, config.initial_staging_bytes),
            fence: GfxQueueFence::new(),
            frame_index: 0,
        }
    }

    pub fn destroy(&mut self, driver: &dyn GfxDriver) {
        // 销毁前等 GPU 消费完最后一帧
        self.fence.wait(driver);
        self.transients.destroy(driver);
        self.cpu_views.destroy(driver);
        self.gpu_views.destroy(driver);
        self.samplers.destroy(driver);
        self.uploads.destroy(driver);
    }
}

// 帧循环
impl FgFrameContext {
    /// 帧开始：等待上一帧、清上一帧的状态、按计划准备本帧资源
    pub fn begin_frame(&mut self, driver: &dyn GfxDriver, plan: FgFramePlan) {
        let _span = tracy_client::span!("FgFrameContext::begin_frame");

        // GPU 还在消费上一帧时不能动 backing/堆块/staging
        self.fence.wait(driver);

        self.tracker.reset();
        self.cpu_views.reset_for_new_frame();
        self.gpu_views.reset_for_new_frame();
        self.samplers.reset_for_new_frame();

        self.uploads.prepare_for_execution(driver, &plan.upload_sizes);
        self.transients.prepare_for_execution(driver, plan.transient_peak_bytes, plan.placements);

        self.frame_index += 1;
    }

    /// 录制期间的子系统借用集合
    pub fn exec_ctx<'a>(&'a mut self, driver: &'a dyn GfxDriver, recorder: &'a dyn GfxRecorder) -> FgExecContext<'a> {
        FgExecContext {
            driver,
            recorder,
            transients: &mut self.transients,
            registry: &self.registry,
            tracker: &mut self.tracker,
            cpu_views: &mut self.cpu_views,
            gpu_views: &mut self.gpu_views,
            samplers: &mut self.samplers,
        }
    }

    /// 帧结束：资源交还默认状态策略，fence signal 供下一帧等待
    pub fn end_frame(&mut self, driver: &dyn GfxDriver, recorder: &dyn GfxRecorder) {
        let _span = tracy_client::span!("FgFrameContext::end_frame");

        self.tracker.transition_all_to_common();
        self.tracker.flush_barriers(FgBarrierKind::all(), recorder);

        self.fence.signal(driver);
    }

    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gfx::MockGfx;

    #[test]
    fn test_frame_pacing_signals_and_waits() {
        let gfx = MockGfx::new();
        let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());

        frame.begin_frame(&gfx, FgFramePlan::default());
        frame.end_frame(&gfx, &gfx);
        assert_eq!(gfx.last_signaled(), 1);

        // 下一帧开始前等待上一帧的 signal 值
        frame.begin_frame(&gfx, FgFramePlan::default());
        assert_eq!(gfx.last_waited(), 1);
        frame.end_frame(&gfx, &gfx);
        assert_eq!(gfx.last_signaled(), 2);

        frame.destroy(&gfx);
    }

    #[test]
    fn test_frame_reset_keeps_pools() {
        let gfx = MockGfx::new();
        let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());
        let chunks_at_init = gfx.descriptor_chunks_created();

        for _ in 0..3 {
            frame.begin_frame(&gfx, FgFramePlan::default());
            frame.end_frame(&gfx, &gfx);
        }
        // 堆块与 staging 跨帧复用，稳态没有新的 native 创建
        assert_eq!(gfx.descriptor_chunks_created(), chunks_at_init);
        assert_eq!(gfx.staging_buffers_created(), 1);

        frame.destroy(&gfx);
    }
}
