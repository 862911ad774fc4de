//! Barrier 记录
//!
//! state tracker 排队的 barrier 以这里的纯数据形式累积，
//! flush 时由 recorder 一次性编码成 `vk::*MemoryBarrier2` 提交。

use ash::vk;

use crate::commands::state::{GfxBufferState, GfxImageState};

/// 图像 barrier
#[derive(Clone, Copy, Debug)]
pub struct GfxImageBarrier {
    pub image: vk::Image,
    pub src: GfxImageState,
    pub dst: GfxImageState,
    pub subresource: vk::ImageSubresourceRange,
}

impl GfxImageBarrier {
    /// 编码为 Vulkan barrier
    pub fn vk_barrier(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2 {
            src_stage_mask: self.src.stage,
            src_access_mask: self.src.src_access(),
            dst_stage_mask: self.dst.stage,
            dst_access_mask: self.dst.access,
            old_layout: self.src.layout,
            new_layout: self.dst.layout,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.image,
            subresource_range: self.subresource,
            ..Default::default()
        }
    }
}

/// 缓冲区 barrier
#[derive(Clone, Copy, Debug)]
pub struct GfxBufferBarrier {
    pub buffer: vk::Buffer,
    pub src: GfxBufferState,
    pub dst: GfxBufferState,
    pub offset: vk::DeviceSize,
    /// WHOLE_SIZE 表示整个缓冲区
    pub size: vk::DeviceSize,
}

impl GfxBufferBarrier {
    pub fn whole(buffer: vk::Buffer, src: GfxBufferState, dst: GfxBufferState) -> Self {
        Self {
            buffer,
            src,
            dst,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }

    /// 编码为 Vulkan barrier
    pub fn vk_barrier(&self) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2 {
            src_stage_mask: self.src.stage,
            src_access_mask: self.src.src_access(),
            dst_stage_mask: self.dst.stage,
            dst_access_mask: self.dst.access,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            buffer: self.buffer,
            offset: self.offset,
            size: self.size,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_image_barrier_encoding() {
        let barrier = GfxImageBarrier {
            image: vk::Image::from_raw(0x1),
            src: GfxImageState::UNDEFINED,
            dst: GfxImageState::COLOR_ATTACHMENT_WRITE,
            subresource: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
        };

        let vk_barrier = barrier.vk_barrier();
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(vk_barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(vk_barrier.dst_access_mask, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn test_buffer_barrier_src_access_is_write_only() {
        // src 端为传输读时，availability 不需要，src_access 应为空
        let barrier = GfxBufferBarrier::whole(
            vk::Buffer::from_raw(0x2),
            GfxBufferState::TRANSFER_SRC,
            GfxBufferState::TRANSFER_DST,
        );
        assert_eq!(barrier.vk_barrier().src_access_mask, vk::AccessFlags2::NONE);
    }
}
