//! 无 GPU 的 native 接口实现
//!
//! `MockGfx` 同时实现 `GfxDriver` 和 `GfxRecorder`：句柄全部伪造，
//! buffer 用 CPU 内存做 shadow（copy 可 readback），每个 native 调用
//! 记进调用日志。单元测试和 headless 示例用它替换真实驱动，
//! 不需要 Vulkan 环境。

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use ash::vk;
use ash::vk::Handle;
use vireo_gfx::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use vireo_gfx::commands::recorder::{GfxColorAttachment, GfxDepthAttachment, GfxRecorder};
use vireo_gfx::foundation::driver::{
    GfxBackingId, GfxDescriptorChunk, GfxDescriptorKind, GfxDriver, GfxStagingBuffer,
};
use vireo_gfx::resources::desc::{GfxBufferDesc, GfxImageDesc, GfxViewDesc};

/// 一条被记录的 recorder 调用
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MockCall {
    BufferBarriers { count: usize },
    ImageBarriers { count: usize },
    ClearColor,
    ClearDepth,
    CopyBuffer,
    SetRenderTargets { colors: usize, has_depth: bool },
    SetViewports { count: usize },
    SetScissors { count: usize },
    SetStencilRef(u32),
    BindVertexBuffer,
    BindIndexBuffer,
    BindPipeline,
    BindDescriptorChunk { kind: GfxDescriptorKind },
    PushConstants { len: usize },
    Draw,
    DrawIndexed,
    Dispatch,
}

#[derive(Default)]
struct MockTables {
    /// buffer shadow：staging 与 placed/test buffer 共用；Box 保证映射指针稳定
    memory: HashMap<u64, Box<[u8]>>,
    images: HashMap<u64, GfxImageDesc>,
    backings: HashMap<u64, vk::DeviceSize>,
    chunks: HashMap<u64, GfxDescriptorKind>,
    /// CPU 堆槽位里物化出的伪造 view
    chunk_views: HashMap<(u64, u32), u64>,
}

/// 无 GPU 的 driver + recorder
#[derive(Default)]
pub struct MockGfx {
    next_raw: Cell<u64>,
    tables: RefCell<MockTables>,
    calls: RefCell<Vec<MockCall>>,
    copy_regions: RefCell<Vec<vk::BufferCopy>>,

    backing_allocations_created: Cell<usize>,
    staging_buffers_created: Cell<usize>,
    descriptor_chunks_created: Cell<usize>,
    descriptor_writes: Cell<usize>,
    live_buffers: Cell<usize>,
    live_images: Cell<usize>,
    last_signaled: Cell<u64>,
    last_waited: Cell<u64>,
}

// new & init
impl MockGfx {
    pub fn new() -> Self {
        Self {
            next_raw: Cell::new(0x1000),
            ..Default::default()
        }
    }

    fn fresh_raw(&self) -> u64 {
        let raw = self.next_raw.get();
        self.next_raw.set(raw + 1);
        raw
    }
}

// 查询接口
impl MockGfx {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.borrow().clone()
    }

    /// recorder 调用总数
    pub fn recorder_call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn reset_calls(&self) {
        self.calls.borrow_mut().clear();
        self.copy_regions.borrow_mut().clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }

    pub fn image_barrier_batches(&self) -> usize {
        self.count_calls(|c| matches!(c, MockCall::ImageBarriers { .. }))
    }

    pub fn clear_count(&self) -> usize {
        self.count_calls(|c| matches!(c, MockCall::ClearColor | MockCall::ClearDepth))
    }

    pub fn copy_regions(&self) -> Vec<vk::BufferCopy> {
        self.copy_regions.borrow().clone()
    }

    pub fn backing_allocations_created(&self) -> usize {
        self.backing_allocations_created.get()
    }

    pub fn live_backing_allocations(&self) -> usize {
        self.tables.borrow().backings.len()
    }

    pub fn staging_buffers_created(&self) -> usize {
        self.staging_buffers_created.get()
    }

    pub fn descriptor_chunks_created(&self) -> usize {
        self.descriptor_chunks_created.get()
    }

    pub fn descriptor_writes(&self) -> usize {
        self.descriptor_writes.get()
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.get()
    }

    pub fn live_images(&self) -> usize {
        self.live_images.get()
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.get()
    }

    pub fn last_waited(&self) -> u64 {
        self.last_waited.get()
    }

    /// 造一个带 shadow memory 的"外部" buffer（readback 测试用）
    pub fn create_test_buffer(&self, size: usize) -> vk::Buffer {
        let raw = self.fresh_raw();
        self.tables.borrow_mut().memory.insert(raw, vec![0u8; size].into_boxed_slice());
        vk::Buffer::from_raw(raw)
    }

    /// 读取 buffer 的 shadow 内容
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.tables.borrow().memory.get(&buffer.as_raw()).expect("unknown buffer").to_vec()
    }
}

impl GfxDriver for MockGfx {
    fn create_backing_allocation(&self, size: vk::DeviceSize, _debug_name: &str) -> GfxBackingId {
        let raw = self.fresh_raw();
        self.tables.borrow_mut().backings.insert(raw, size);
        self.backing_allocations_created.set(self.backing_allocations_created.get() + 1);
        GfxBackingId::from_raw(raw)
    }

    fn destroy_backing_allocation(&self, backing: GfxBackingId) {
        self.tables.borrow_mut().backings.remove(&backing.as_raw()).expect("unknown backing allocation");
    }

    fn create_placed_buffer(
        &self,
        backing: GfxBackingId,
        offset: vk::DeviceSize,
        desc: &GfxBufferDesc,
        _debug_name: &str,
    ) -> vk::Buffer {
        {
            let tables = self.tables.borrow();
            let backing_size = *tables.backings.get(&backing.as_raw()).expect("unknown backing allocation");
            assert!(offset + desc.size <= backing_size, "placed buffer out of bounds");
        }
        let raw = self.fresh_raw();
        self.tables.borrow_mut().memory.insert(raw, vec![0u8; desc.size as usize].into_boxed_slice());
        self.live_buffers.set(self.live_buffers.get() + 1);
        vk::Buffer::from_raw(raw)
    }

    fn create_placed_image(
        &self,
        backing: GfxBackingId,
        offset: vk::DeviceSize,
        desc: &GfxImageDesc,
        _debug_name: &str,
    ) -> vk::Image {
        {
            let tables = self.tables.borrow();
            let backing_size = *tables.backings.get(&backing.as_raw()).expect("unknown backing allocation");
            assert!(offset + desc.estimated_byte_size() <= backing_size, "placed image out of bounds");
        }
        let raw = self.fresh_raw();
        self.tables.borrow_mut().images.insert(raw, *desc);
        self.live_images.set(self.live_images.get() + 1);
        vk::Image::from_raw(raw)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.tables.borrow_mut().memory.remove(&buffer.as_raw()).expect("unknown buffer");
        self.live_buffers.set(self.live_buffers.get() - 1);
    }

    fn destroy_image(&self, image: vk::Image) {
        self.tables.borrow_mut().images.remove(&image.as_raw()).expect("unknown image");
        self.live_images.set(self.live_images.get() - 1);
    }

    fn create_staging_buffer(&self, size: vk::DeviceSize, _debug_name: &str) -> GfxStagingBuffer {
        let raw = self.fresh_raw();
        let mut shadow = vec![0u8; size as usize].into_boxed_slice();
        let mapped_ptr = shadow.as_mut_ptr();
        self.tables.borrow_mut().memory.insert(raw, shadow);
        self.staging_buffers_created.set(self.staging_buffers_created.get() + 1);
        GfxStagingBuffer {
            buffer: vk::Buffer::from_raw(raw),
            mapped_ptr,
            size,
        }
    }

    fn destroy_staging_buffer(&self, staging: GfxStagingBuffer) {
        self.tables.borrow_mut().memory.remove(&staging.buffer.as_raw()).expect("unknown staging buffer");
    }

    fn create_descriptor_chunk(&self, kind: GfxDescriptorKind, capacity: u32, _debug_name: &str) -> GfxDescriptorChunk {
        assert!(capacity > 0);
        let raw = self.fresh_raw();
        self.tables.borrow_mut().chunks.insert(raw, kind);
        self.descriptor_chunks_created.set(self.descriptor_chunks_created.get() + 1);
        GfxDescriptorChunk::from_raw(raw)
    }

    fn destroy_descriptor_chunk(&self, chunk: GfxDescriptorChunk) {
        let mut tables = self.tables.borrow_mut();
        tables.chunks.remove(&chunk.as_raw()).expect("unknown descriptor chunk");
        tables.chunk_views.retain(|(c, _), _| *c != chunk.as_raw());
    }

    fn write_descriptor(&self, chunk: GfxDescriptorChunk, slot: u32, view: &GfxViewDesc) {
        let kind = *self.tables.borrow().chunks.get(&chunk.as_raw()).expect("unknown descriptor chunk");

        // 与生产实现一致的种类检查
        match (kind, view) {
            (GfxDescriptorKind::CpuView, GfxViewDesc::Null) => {}
            (GfxDescriptorKind::CpuView, GfxViewDesc::RenderTarget { .. } | GfxViewDesc::DepthStencil { .. }) => {}
            (
                GfxDescriptorKind::GpuView,
                GfxViewDesc::SampledImage { .. }
                | GfxViewDesc::StorageImage { .. }
                | GfxViewDesc::UniformBuffer { .. }
                | GfxViewDesc::StorageBuffer { .. },
            ) => {}
            (GfxDescriptorKind::Sampler, GfxViewDesc::Sampler(_)) => {}
            _ => panic!("view kind {:?} not allowed in {:?} chunk", view, kind),
        }

        if matches!(view, GfxViewDesc::RenderTarget { .. } | GfxViewDesc::DepthStencil { .. }) {
            let fabricated = self.fresh_raw();
            self.tables.borrow_mut().chunk_views.insert((chunk.as_raw(), slot), fabricated);
        }
        self.descriptor_writes.set(self.descriptor_writes.get() + 1);
    }

    fn descriptor_view(&self, chunk: GfxDescriptorChunk, slot: u32) -> vk::ImageView {
        self.tables
            .borrow()
            .chunk_views
            .get(&(chunk.as_raw(), slot))
            .map(|raw| vk::ImageView::from_raw(*raw))
            .unwrap_or(vk::ImageView::null())
    }

    fn queue_signal(&self, value: u64) {
        self.last_signaled.set(value);
    }

    fn queue_wait(&self, value: u64) {
        // mock 队列即时完成
        self.last_waited.set(value);
    }
}

impl GfxRecorder for MockGfx {
    fn cmd_buffer_barriers(&self, barriers: &[GfxBufferBarrier]) {
        self.calls.borrow_mut().push(MockCall::BufferBarriers { count: barriers.len() });
    }

    fn cmd_image_barriers(&self, barriers: &[GfxImageBarrier]) {
        self.calls.borrow_mut().push(MockCall::ImageBarriers { count: barriers.len() });
    }

    fn cmd_clear_color_target(&self, _target: &GfxColorAttachment) {
        self.calls.borrow_mut().push(MockCall::ClearColor);
    }

    fn cmd_clear_depth_target(&self, _target: &GfxDepthAttachment) {
        self.calls.borrow_mut().push(MockCall::ClearDepth);
    }

    fn cmd_copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        {
            let mut tables = self.tables.borrow_mut();
            let bytes: Vec<u8> = {
                let src_mem = tables.memory.get(&src.as_raw()).expect("copy from unknown buffer");
                src_mem[region.src_offset as usize..(region.src_offset + region.size) as usize].to_vec()
            };
            let dst_mem = tables.memory.get_mut(&dst.as_raw()).expect("copy to unknown buffer");
            dst_mem[region.dst_offset as usize..(region.dst_offset + region.size) as usize].copy_from_slice(&bytes);
        }
        self.copy_regions.borrow_mut().push(region);
        self.calls.borrow_mut().push(MockCall::CopyBuffer);
    }

    fn cmd_set_render_targets(&self, colors: &[GfxColorAttachment], depth: Option<&GfxDepthAttachment>) {
        self.calls.borrow_mut().push(MockCall::SetRenderTargets {
            colors: colors.len(),
            has_depth: depth.is_some(),
        });
    }

    fn cmd_set_viewports(&self, viewports: &[vk::Viewport]) {
        self.calls.borrow_mut().push(MockCall::SetViewports { count: viewports.len() });
    }

    fn cmd_set_scissors(&self, scissors: &[vk::Rect2D]) {
        self.calls.borrow_mut().push(MockCall::SetScissors { count: scissors.len() });
    }

    fn cmd_set_stencil_reference(&self, reference: u32) {
        self.calls.borrow_mut().push(MockCall::SetStencilRef(reference));
    }

    fn cmd_bind_vertex_buffer(&self, _buffer: vk::Buffer, _offset: vk::DeviceSize, _stride: u32) {
        self.calls.borrow_mut().push(MockCall::BindVertexBuffer);
    }

    fn cmd_bind_index_buffer(&self, _buffer: vk::Buffer, _offset: vk::DeviceSize, _index_type: vk::IndexType) {
        self.calls.borrow_mut().push(MockCall::BindIndexBuffer);
    }

    fn cmd_bind_pipeline(&self, _bind_point: vk::PipelineBindPoint, _pipeline: vk::Pipeline) {
        self.calls.borrow_mut().push(MockCall::BindPipeline);
    }

    fn cmd_bind_descriptor_chunk(
        &self,
        _layout: vk::PipelineLayout,
        _bind_point: vk::PipelineBindPoint,
        kind: GfxDescriptorKind,
        chunk: GfxDescriptorChunk,
    ) {
        assert!(self.tables.borrow().chunks.contains_key(&chunk.as_raw()), "binding unknown chunk");
        self.calls.borrow_mut().push(MockCall::BindDescriptorChunk { kind });
    }

    fn cmd_push_constants(&self, _layout: vk::PipelineLayout, _stages: vk::ShaderStageFlags, data: &[u8]) {
        self.calls.borrow_mut().push(MockCall::PushConstants { len: data.len() });
    }

    fn cmd_draw(&self, _vertex_count: u32, _instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.calls.borrow_mut().push(MockCall::Draw);
    }

    fn cmd_draw_indexed(
        &self,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.calls.borrow_mut().push(MockCall::DrawIndexed);
    }

    fn cmd_dispatch(&self, _group_x: u32, _group_y: u32, _group_z: u32) {
        self.calls.borrow_mut().push(MockCall::Dispatch);
    }
}
