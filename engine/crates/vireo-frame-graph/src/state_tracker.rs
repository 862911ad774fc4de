//! 资源状态跟踪与 barrier 计算
//!
//! 每个 native 资源记录"上一次使用后停留的状态"，新的使用请求与之
//! 对比，自动排队最小的 barrier 集合。
//!
//! # 不变式
//! - 每个 native 资源最多一条状态记录，首次引用时惰性创建，帧 reset 时整体清空；
//! - 已提交状态只在 `flush_barriers` 里更新，请求阶段从不投机修改——
//!   调用方必须先 flush 再假设新状态对驱动可见。

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use ash::vk;
use ash::vk::Handle;
use vireo_gfx::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use vireo_gfx::commands::recorder::GfxRecorder;
use vireo_gfx::commands::state::{GfxBufferState, GfxImageState};

bitflags::bitflags! {
    /// flush 的 barrier 种类掩码
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FgBarrierKind: u32 {
        const BUFFER = 1 << 0;
        const IMAGE = 1 << 1;
    }
}

struct BufferEntry {
    committed: GfxBufferState,
    /// 已排队但尚未 flush 的目标状态
    pending: Option<GfxBufferState>,
}

struct ImageEntry {
    committed: GfxImageState,
    pending: Option<GfxImageState>,
}

/// 状态跟踪器
#[derive(Default)]
pub struct FgStateTracker {
    buffers: HashMap<u64, BufferEntry>,
    images: HashMap<u64, ImageEntry>,
    /// buffer 与 image 的 barrier 分开累积，native 编码不同
    pending_buffer_barriers: Vec<GfxBufferBarrier>,
    pending_image_barriers: Vec<GfxImageBarrier>,
}

// new & init
impl FgStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 帧分配 reset：清空全部状态记录
    pub fn reset(&mut self) {
        debug_assert!(
            self.pending_buffer_barriers.is_empty() && self.pending_image_barriers.is_empty(),
            "reset with unflushed barriers"
        );
        self.buffers.clear();
        self.images.clear();
        self.pending_buffer_barriers.clear();
        self.pending_image_barriers.clear();
    }
}

// 状态请求
impl FgStateTracker {
    /// 登记缓冲区即将进入的状态
    ///
    /// 与当前有效状态完全一致时是 no-op，不产生多余 barrier。
    pub fn request_buffer_state(&mut self, buffer: vk::Buffer, state: GfxBufferState) {
        match self.buffers.entry(buffer.as_raw()) {
            Entry::Vacant(vacant) => {
                // 首次引用：从 undefined 状态补一条初始 barrier
                self.pending_buffer_barriers.push(GfxBufferBarrier::whole(buffer, GfxBufferState::UNDEFINED, state));
                vacant.insert(BufferEntry {
                    committed: GfxBufferState::UNDEFINED,
                    pending: Some(state),
                });
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let effective = entry.pending.unwrap_or(entry.committed);
                if effective == state {
                    return;
                }
                self.pending_buffer_barriers.push(GfxBufferBarrier::whole(buffer, effective, state));
                entry.pending = Some(state);
            }
        }
    }

    /// 登记图像即将进入的状态
    pub fn request_image_state(&mut self, image: vk::Image, state: GfxImageState, range: vk::ImageSubresourceRange) {
        match self.images.entry(image.as_raw()) {
            Entry::Vacant(vacant) => {
                self.pending_image_barriers.push(GfxImageBarrier {
                    image,
                    src: GfxImageState::UNDEFINED,
                    dst: state,
                    subresource: range,
                });
                vacant.insert(ImageEntry {
                    committed: GfxImageState::UNDEFINED,
                    pending: Some(state),
                });
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let effective = entry.pending.unwrap_or(entry.committed);
                if effective == state {
                    return;
                }
                self.pending_image_barriers.push(GfxImageBarrier {
                    image,
                    src: effective,
                    dst: state,
                    subresource: range,
                });
                entry.pending = Some(state);
            }
        }
    }

    /// 把所有被跟踪的资源排队回 COMMON 状态
    ///
    /// 帧边界把资源交还给默认状态策略时使用。
    pub fn transition_all_to_common(&mut self) {
        for (raw, entry) in &mut self.buffers {
            let effective = entry.pending.unwrap_or(entry.committed);
            if effective == GfxBufferState::COMMON {
                continue;
            }
            self.pending_buffer_barriers.push(GfxBufferBarrier::whole(
                vk::Buffer::from_raw(*raw),
                effective,
                GfxBufferState::COMMON,
            ));
            entry.pending = Some(GfxBufferState::COMMON);
        }

        for (raw, entry) in &mut self.images {
            let effective = entry.pending.unwrap_or(entry.committed);
            if effective == GfxImageState::COMMON {
                continue;
            }
            self.pending_image_barriers.push(GfxImageBarrier {
                image: vk::Image::from_raw(*raw),
                src: effective,
                dst: GfxImageState::COMMON,
                subresource: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                },
            });
            entry.pending = Some(GfxImageState::COMMON);
        }
    }
}

// flush
impl FgStateTracker {
    /// 把排队的 barrier 按种类一次性批量提交
    ///
    /// 提交后才把对应记录的已提交状态推进到请求值。
    pub fn flush_barriers(&mut self, kinds: FgBarrierKind, recorder: &dyn GfxRecorder) {
        let _span = tracy_client::span!("FgStateTracker::flush_barriers");

        if kinds.contains(FgBarrierKind::BUFFER) && !self.pending_buffer_barriers.is_empty() {
            recorder.cmd_buffer_barriers(&self.pending_buffer_barriers);
            self.pending_buffer_barriers.clear();
            for entry in self.buffers.values_mut() {
                if let Some(state) = entry.pending.take() {
                    entry.committed = state;
                }
            }
        }

        if kinds.contains(FgBarrierKind::IMAGE) && !self.pending_image_barriers.is_empty() {
            recorder.cmd_image_barriers(&self.pending_image_barriers);
            self.pending_image_barriers.clear();
            for entry in self.images.values_mut() {
                if let Some(state) = entry.pending.take() {
                    entry.committed = state;
                }
            }
        }
    }
}

// getter & debug 校验
impl FgStateTracker {
    #[inline]
    pub fn pending_buffer_barrier_count(&self) -> usize {
        self.pending_buffer_barriers.len()
    }

    #[inline]
    pub fn pending_image_barrier_count(&self) -> usize {
        self.pending_image_barriers.len()
    }

    #[inline]
    pub fn tracked_resource_count(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    /// 已提交（flush 过）的缓冲区状态
    pub fn committed_buffer_state(&self, buffer: vk::Buffer) -> Option<GfxBufferState> {
        self.buffers.get(&buffer.as_raw()).map(|e| e.committed)
    }

    /// 已提交（flush 过）的图像状态
    pub fn committed_image_state(&self, image: vk::Image) -> Option<GfxImageState> {
        self.images.get(&image.as_raw()).map(|e| e.committed)
    }

    /// debug 校验：跟踪记录与调用方认为的当前状态不一致时大声失败
    ///
    /// 状态错误在运行期是静默的（表现为渲染错误或 validation 报错），
    /// 这是开发期的主要安全网；release 构建编译掉。
    #[cfg(debug_assertions)]
    pub fn assert_image_state(&self, image: vk::Image, expected: GfxImageState) {
        let entry = self.images.get(&image.as_raw()).expect("assert_image_state: untracked image");
        let effective = entry.pending.unwrap_or(entry.committed);
        assert_eq!(
            effective, expected,
            "image state mismatch: tracker has {:?}, caller expects {:?}",
            effective, expected
        );
    }

    #[cfg(debug_assertions)]
    pub fn assert_buffer_state(&self, buffer: vk::Buffer, expected: GfxBufferState) {
        let entry = self.buffers.get(&buffer.as_raw()).expect("assert_buffer_state: untracked buffer");
        let effective = entry.pending.unwrap_or(entry.committed);
        assert_eq!(
            effective, expected,
            "buffer state mismatch: tracker has {:?}, caller expects {:?}",
            effective, expected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gfx::{MockCall, MockGfx};

    fn image(raw: u64) -> vk::Image {
        vk::Image::from_raw(raw)
    }

    fn color_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn test_repeated_request_is_noop() {
        let mut tracker = FgStateTracker::new();
        tracker.request_image_state(image(1), GfxImageState::COLOR_ATTACHMENT_WRITE, color_range());
        assert_eq!(tracker.pending_image_barrier_count(), 1);

        // 相同状态第二次请求不应产生新 barrier
        tracker.request_image_state(image(1), GfxImageState::COLOR_ATTACHMENT_WRITE, color_range());
        assert_eq!(tracker.pending_image_barrier_count(), 1);
    }

    #[test]
    fn test_barrier_completeness() {
        // N 个互不相同的连续请求：1 条初始 + N-1 条转换
        let mut tracker = FgStateTracker::new();
        let states = [
            GfxImageState::TRANSFER_DST,
            GfxImageState::SHADER_READ_FRAGMENT,
            GfxImageState::STORAGE_WRITE_COMPUTE,
            GfxImageState::SHADER_READ_COMPUTE,
        ];
        for state in states {
            tracker.request_image_state(image(7), state, color_range());
        }
        assert_eq!(tracker.pending_image_barrier_count(), states.len());
    }

    #[test]
    fn test_state_is_authoritative_only_after_flush() {
        let mut tracker = FgStateTracker::new();
        let gfx = MockGfx::new();
        tracker.request_image_state(image(1), GfxImageState::TRANSFER_DST, color_range());

        // flush 前已提交状态仍是 undefined
        assert_eq!(tracker.committed_image_state(image(1)), Some(GfxImageState::UNDEFINED));

        tracker.flush_barriers(FgBarrierKind::all(), &gfx);
        assert_eq!(tracker.committed_image_state(image(1)), Some(GfxImageState::TRANSFER_DST));
        assert_eq!(tracker.pending_image_barrier_count(), 0);
    }

    #[test]
    fn test_flush_is_single_batched_call() {
        let mut tracker = FgStateTracker::new();
        let gfx = MockGfx::new();
        tracker.request_image_state(image(1), GfxImageState::COLOR_ATTACHMENT_WRITE, color_range());
        tracker.request_image_state(image(2), GfxImageState::DEPTH_ATTACHMENT_WRITE, color_range());
        tracker.flush_barriers(FgBarrierKind::IMAGE, &gfx);

        let calls = gfx.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], MockCall::ImageBarriers { count: 2 }));
    }

    #[test]
    fn test_kind_mask_flushes_separately() {
        let mut tracker = FgStateTracker::new();
        let gfx = MockGfx::new();
        tracker.request_buffer_state(vk::Buffer::from_raw(3), GfxBufferState::TRANSFER_DST);
        tracker.request_image_state(image(4), GfxImageState::TRANSFER_DST, color_range());

        tracker.flush_barriers(FgBarrierKind::BUFFER, &gfx);
        assert_eq!(tracker.pending_buffer_barrier_count(), 0);
        assert_eq!(tracker.pending_image_barrier_count(), 1);

        tracker.flush_barriers(FgBarrierKind::IMAGE, &gfx);
        assert_eq!(tracker.pending_image_barrier_count(), 0);
    }

    #[test]
    fn test_transition_all_to_common() {
        let mut tracker = FgStateTracker::new();
        let gfx = MockGfx::new();
        tracker.request_image_state(image(1), GfxImageState::COLOR_ATTACHMENT_WRITE, color_range());
        tracker.request_buffer_state(vk::Buffer::from_raw(2), GfxBufferState::VERTEX_BUFFER);
        tracker.flush_barriers(FgBarrierKind::all(), &gfx);

        tracker.transition_all_to_common();
        assert_eq!(tracker.pending_image_barrier_count(), 1);
        assert_eq!(tracker.pending_buffer_barrier_count(), 1);

        tracker.flush_barriers(FgBarrierKind::all(), &gfx);
        assert_eq!(tracker.committed_image_state(image(1)), Some(GfxImageState::COMMON));

        // 已经在 COMMON 的资源不再排队
        tracker.transition_all_to_common();
        assert_eq!(tracker.pending_image_barrier_count(), 0);
        assert_eq!(tracker.pending_buffer_barrier_count(), 0);
    }

    #[test]
    fn test_reset_clears_all_entries() {
        let mut tracker = FgStateTracker::new();
        let gfx = MockGfx::new();
        tracker.request_image_state(image(1), GfxImageState::TRANSFER_DST, color_range());
        tracker.flush_barriers(FgBarrierKind::all(), &gfx);
        assert_eq!(tracker.tracked_resource_count(), 1);

        tracker.reset();
        assert_eq!(tracker.tracked_resource_count(), 0);

        // reset 后首次引用重新走初始 barrier
        tracker.request_image_state(image(1), GfxImageState::TRANSFER_DST, color_range());
        assert_eq!(tracker.pending_image_barrier_count(), 1);
    }

    #[test]
    #[should_panic]
    fn test_assert_state_mismatch_fails_loudly() {
        let mut tracker = FgStateTracker::new();
        tracker.request_image_state(image(1), GfxImageState::TRANSFER_DST, color_range());
        tracker.assert_image_state(image(1), GfxImageState::SHADER_READ_FRAGMENT);
    }
}
