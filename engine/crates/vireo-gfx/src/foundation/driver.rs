//! Native 设备接口
//!
//! 帧图的资源管理核心只通过这个 trait 接触驱动：backing memory、
//! placed 资源、描述符堆块、staging 映射、队列 fence。
//! 生产实现是 `GfxDevice`（ash + vk-mem），测试用 mock 实现替换，
//! 因此核心逻辑不依赖任何全局设备单例。
//!
//! # 错误语义
//! 这里的创建失败都是驱动级失败（资源耗尽、配置错误），实现应当
//! 排空 validation 消息后 fatal，而不是返回 Result 让上层重试。

use ash::vk;

use crate::resources::desc::{GfxBufferDesc, GfxImageDesc, GfxViewDesc};

/// transient backing allocation 的不透明 id
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GfxBackingId(u64);

impl GfxBackingId {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// 描述符堆块的不透明 id
///
/// 一个堆块就是一段固定容量的描述符槽位；GPU 可见堆块在 ash 实现里
/// 对应一个 descriptor pool + bindless set。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GfxDescriptorChunk(u64);

impl GfxDescriptorChunk {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// 描述符堆的种类
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GfxDescriptorKind {
    /// CPU 侧 view 描述符（RTV/DSV），不会被 shader 索引
    CpuView,
    /// GPU 可见的 bindless 描述符（SRV/UAV/CBV），shader 按索引访问
    GpuView,
    /// Sampler 堆
    Sampler,
}

/// 持久映射的 staging buffer
///
/// `mapped_ptr` 在 buffer 销毁前一直有效；resize 必须先 destroy（其中
/// 完成 unmap）再重新创建。
#[derive(Clone, Copy, Debug)]
pub struct GfxStagingBuffer {
    pub buffer: vk::Buffer,
    pub mapped_ptr: *mut u8,
    pub size: vk::DeviceSize,
}

/// 设备侧 native 操作
pub trait GfxDriver {
    /// 创建 transient 资源共享的 backing allocation
    fn create_backing_allocation(&self, size: vk::DeviceSize, debug_name: &str) -> GfxBackingId;

    fn destroy_backing_allocation(&self, backing: GfxBackingId);

    /// 在 backing allocation 的指定偏移创建 placed buffer
    fn create_placed_buffer(
        &self,
        backing: GfxBackingId,
        offset: vk::DeviceSize,
        desc: &GfxBufferDesc,
        debug_name: &str,
    ) -> vk::Buffer;

    /// 在 backing allocation 的指定偏移创建 placed image
    fn create_placed_image(
        &self,
        backing: GfxBackingId,
        offset: vk::DeviceSize,
        desc: &GfxImageDesc,
        debug_name: &str,
    ) -> vk::Image;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn destroy_image(&self, image: vk::Image);

    /// 创建持久映射的 staging buffer
    fn create_staging_buffer(&self, size: vk::DeviceSize, debug_name: &str) -> GfxStagingBuffer;

    /// 销毁 staging buffer（内部先 unmap）
    fn destroy_staging_buffer(&self, staging: GfxStagingBuffer);

    /// 创建一个固定容量的描述符堆块
    fn create_descriptor_chunk(&self, kind: GfxDescriptorKind, capacity: u32, debug_name: &str) -> GfxDescriptorChunk;

    fn destroy_descriptor_chunk(&self, chunk: GfxDescriptorChunk);

    /// 把具体的 view 物化到堆块的指定槽位
    ///
    /// 槽位可以被覆写（堆块跨帧复用时旧 view 由实现负责回收）。
    /// view 种类与堆种类不匹配属于调用方 bug，实现应 assert。
    fn write_descriptor(&self, chunk: GfxDescriptorChunk, slot: u32, view: &GfxViewDesc);

    /// 读取 CPU 堆槽位里物化的 image view（用于 attachment 绑定）
    fn descriptor_view(&self, chunk: GfxDescriptorChunk, slot: u32) -> vk::ImageView;

    /// 在队列上 signal 计数 fence 到指定值
    fn queue_signal(&self, value: u64);

    /// 阻塞等待计数 fence 达到指定值
    fn queue_wait(&self, value: u64);
}
