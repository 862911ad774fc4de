//! 描述符堆分配
//!
//! CPU 堆、GPU bindless 堆、sampler 堆共用同一套分配模式：
//! 可增长的定容堆块列表 + 游标 + 只对当前堆块有效的缓存。
//! 堆块用尽时轮换到下一块并清缓存（槽位下标是块内相对的，跨块不可
//! 移植），同时向调用方报告 "heap changed"，让录制中的命令重新绑定堆。
//!
//! `reset_for_new_frame` 只回卷游标，不释放堆块内存——堆块对象跨帧
//! 作为容量复用。

use std::collections::HashMap;

use ash::vk;
use vireo_gfx::foundation::driver::{GfxDescriptorChunk, GfxDescriptorKind, GfxDriver};
use vireo_gfx::resources::desc::{GfxSamplerDesc, GfxViewDesc};

/// 每帧消耗量 EMA 的平滑系数
const FRAME_USAGE_EMA_ALPHA: f32 = 0.2;

/// 描述符缓存的 key：资源身份 + 视图种类（或 sampler 描述）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FgDescriptorKey {
    SampledImage(u64),
    StorageImage(u64),
    UniformBuffer { buffer: u64, offset: u64, range: u64 },
    StorageBuffer { buffer: u64, offset: u64, range: u64 },
    RenderTarget(u64),
    DepthStencil(u64),
    Sampler(GfxSamplerDesc),
}

/// 一次描述符解析的结果
#[derive(Clone, Copy, Debug)]
pub struct FgDescriptorSlot {
    /// 当前堆块内的槽位下标
    pub index: u32,
    /// 本次解析是否触发了堆轮换；每次轮换恰好报告一次
    pub heap_changed: bool,
}

/// 单一种类的描述符堆分配器
pub struct FgDescriptorArena {
    kind: GfxDescriptorKind,
    chunk_capacity: u32,
    /// CPU 堆每个堆块的槽位 0 保留给 null 描述符
    reserved_slots: u32,
    chunks: Vec<GfxDescriptorChunk>,
    active: usize,
    cursor: u32,
    /// 只对当前堆块的当前代有效
    cache: HashMap<FgDescriptorKey, u32>,
    frame_used: u32,
    /// 每帧消耗量的指数滑动平均，保留给将来的容量预估
    avg_frame_used: f32,
    debug_name: String,
}

// new & init
impl FgDescriptorArena {
    pub fn new(driver: &dyn GfxDriver, kind: GfxDescriptorKind, chunk_capacity: u32, debug_name: &str) -> Self {
        let reserved_slots = if kind == GfxDescriptorKind::CpuView { 1 } else { 0 };
        assert!(chunk_capacity > reserved_slots, "chunk capacity too small");

        let mut arena = Self {
            kind,
            chunk_capacity,
            reserved_slots,
            chunks: Vec::new(),
            active: 0,
            cursor: reserved_slots,
            cache: HashMap::new(),
            frame_used: 0,
            avg_frame_used: 0.0,
            debug_name: debug_name.to_string(),
        };
        arena.create_chunk(driver);
        arena
    }

    pub fn cpu(driver: &dyn GfxDriver, chunk_capacity: u32) -> Self {
        Self::new(driver, GfxDescriptorKind::CpuView, chunk_capacity, "cpu-views")
    }

    pub fn gpu(driver: &dyn GfxDriver, chunk_capacity: u32) -> Self {
        Self::new(driver, GfxDescriptorKind::GpuView, chunk_capacity, "gpu-views")
    }

    pub fn sampler(driver: &dyn GfxDriver, chunk_capacity: u32) -> Self {
        Self::new(driver, GfxDescriptorKind::Sampler, chunk_capacity, "samplers")
    }

    fn create_chunk(&mut self, driver: &dyn GfxDriver) {
        let chunk = driver.create_descriptor_chunk(
            self.kind,
            self.chunk_capacity,
            &format!("{}-chunk-{}", self.debug_name, self.chunks.len()),
        );
        if self.reserved_slots > 0 {
            driver.write_descriptor(chunk, 0, &GfxViewDesc::Null);
        }
        self.chunks.push(chunk);
    }

    pub fn destroy(&mut self, driver: &dyn GfxDriver) {
        for chunk in self.chunks.drain(..) {
            driver.destroy_descriptor_chunk(chunk);
        }
        self.cache.clear();
    }
}

// 分配
impl FgDescriptorArena {
    /// 解析 key 对应的描述符下标
    ///
    /// 同一代堆块内，同一个 key 总是得到同一个下标；轮换之后之前的
    /// 所有下标失效，未 flush 的命令不得继续引用。
    pub fn descriptor_index(&mut self, driver: &dyn GfxDriver, key: FgDescriptorKey, view: &GfxViewDesc) -> FgDescriptorSlot {
        if let Some(&index) = self.cache.get(&key) {
            return FgDescriptorSlot {
                index,
                heap_changed: false,
            };
        }

        let mut heap_changed = false;
        if self.cursor == self.chunk_capacity {
            // 堆块用尽：轮换并清缓存
            self.active += 1;
            if self.active == self.chunks.len() {
                self.create_chunk(driver);
            }
            self.cursor = self.reserved_slots;
            self.cache.clear();
            heap_changed = true;
            log::debug!("{}: heap rotated to chunk {}", self.debug_name, self.active);
        }

        let index = self.cursor;
        self.cursor += 1;
        self.frame_used += 1;

        driver.write_descriptor(self.chunks[self.active], index, view);
        self.cache.insert(key, index);

        FgDescriptorSlot { index, heap_changed }
    }

    /// CPU 堆的 null 描述符下标（构造时写入保留槽位）
    #[inline]
    pub fn null_index(&self) -> u32 {
        debug_assert_eq!(self.kind, GfxDescriptorKind::CpuView);
        0
    }

    /// 读取 CPU 堆槽位里物化的 view
    #[inline]
    pub fn view(&self, driver: &dyn GfxDriver, index: u32) -> vk::ImageView {
        driver.descriptor_view(self.chunks[self.active], index)
    }

    /// 回卷游标并清缓存；堆块内存保留，跨帧复用
    pub fn reset_for_new_frame(&mut self) {
        self.active = 0;
        self.cursor = self.reserved_slots;
        self.cache.clear();
        self.avg_frame_used =
            self.avg_frame_used * (1.0 - FRAME_USAGE_EMA_ALPHA) + self.frame_used as f32 * FRAME_USAGE_EMA_ALPHA;
        self.frame_used = 0;
    }
}

// getter
impl FgDescriptorArena {
    #[inline]
    pub fn kind(&self) -> GfxDescriptorKind {
        self.kind
    }

    #[inline]
    pub fn active_chunk(&self) -> GfxDescriptorChunk {
        self.chunks[self.active]
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn avg_frame_used(&self) -> f32 {
        self.avg_frame_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gfx::MockGfx;
    use ash::vk::Handle;

    fn sampled_key(raw: u64) -> (FgDescriptorKey, GfxViewDesc) {
        (
            FgDescriptorKey::SampledImage(raw),
            GfxViewDesc::SampledImage {
                image: vk::Image::from_raw(raw),
                format: vk::Format::R8G8B8A8_UNORM,
                mip_levels: 1,
                array_layers: 1,
            },
        )
    }

    #[test]
    fn test_cache_returns_identical_index() {
        let gfx = MockGfx::new();
        let mut arena = FgDescriptorArena::gpu(&gfx, 16);

        let (key, view) = sampled_key(1);
        let first = arena.descriptor_index(&gfx, key, &view);
        let second = arena.descriptor_index(&gfx, key, &view);
        assert_eq!(first.index, second.index);
        assert!(!second.heap_changed);
        // 缓存命中不应有第二次 native 写入
        assert_eq!(gfx.descriptor_writes(), 1);
    }

    #[test]
    fn test_rotation_invalidates_cache_and_signals_once() {
        let gfx = MockGfx::new();
        let mut arena = FgDescriptorArena::gpu(&gfx, 2);

        let (key_a, view_a) = sampled_key(1);
        let (key_b, view_b) = sampled_key(2);
        let (key_c, view_c) = sampled_key(3);

        let a = arena.descriptor_index(&gfx, key_a, &view_a);
        let _b = arena.descriptor_index(&gfx, key_b, &view_b);
        assert!(!a.heap_changed);

        // 第三个分配触发轮换，heap_changed 恰好报告一次
        let c = arena.descriptor_index(&gfx, key_c, &view_c);
        assert!(c.heap_changed);

        // 轮换后同一个 key 得到新的下标（新块的槽位从头分配）
        let a2 = arena.descriptor_index(&gfx, key_a, &view_a);
        assert!(!a2.heap_changed);
        assert_ne!(a2.index, a.index);
        assert_ne!(arena.active_chunk(), arena.chunks[0]);
    }

    #[test]
    fn test_reset_reuses_chunks_as_capacity() {
        let gfx = MockGfx::new();
        let mut arena = FgDescriptorArena::gpu(&gfx, 2);

        for raw in 1..=4 {
            let (key, view) = sampled_key(raw);
            arena.descriptor_index(&gfx, key, &view);
        }
        assert_eq!(arena.chunk_count(), 2);
        let created_before = gfx.descriptor_chunks_created();

        arena.reset_for_new_frame();
        for raw in 10..=13 {
            let (key, view) = sampled_key(raw);
            arena.descriptor_index(&gfx, key, &view);
        }
        // 第二帧完全复用第一帧的堆块，没有新的 native 创建
        assert_eq!(gfx.descriptor_chunks_created(), created_before);
        assert!(arena.avg_frame_used() > 0.0);
    }

    #[test]
    fn test_cpu_arena_reserves_null_slot() {
        let gfx = MockGfx::new();
        let mut arena = FgDescriptorArena::cpu(&gfx, 4);
        assert_eq!(arena.null_index(), 0);

        // 第一个真实分配拿到的是槽位 1
        let slot = arena.descriptor_index(
            &gfx,
            FgDescriptorKey::RenderTarget(9),
            &GfxViewDesc::RenderTarget {
                image: vk::Image::from_raw(9),
                format: vk::Format::R8G8B8A8_UNORM,
            },
        );
        assert_eq!(slot.index, 1);
    }
}
