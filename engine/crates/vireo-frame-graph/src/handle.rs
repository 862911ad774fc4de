//! 资源句柄
//!
//! 句柄区分两类资源：
//! - transient：帧图拥有，按当前帧资源表的下标寻址，每帧重建；
//! - external：应用拥有，按注册表的 slotmap key 寻址，跨帧稳定。
//!
//! 句柄相等性是"同一个资源"，不是"同样的描述"：两个描述完全相同的
//! placement 仍然是不同的句柄。

use vireo_gfx::resources::desc::{GfxBufferDesc, GfxImageDesc};

slotmap::new_key_type! {
    /// 外部缓冲区在注册表中的稳定 key
    pub struct FgExternalBufferHandle;
    /// 外部图像在注册表中的稳定 key
    pub struct FgExternalImageHandle;
}

/// 资源句柄
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FgResourceHandle {
    /// 当前帧资源表中的 transient buffer
    TransientBuffer(u32),
    /// 当前帧资源表中的 transient image
    TransientImage(u32),
    /// 注册表中的外部 buffer
    ExternalBuffer(FgExternalBufferHandle),
    /// 注册表中的外部 image
    ExternalImage(FgExternalImageHandle),
}

impl FgResourceHandle {
    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::TransientBuffer(_) | Self::ExternalBuffer(_))
    }

    #[inline]
    pub fn is_image(&self) -> bool {
        !self.is_buffer()
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBuffer(_) | Self::TransientImage(_))
    }
}

/// transient 资源的声明描述
#[derive(Clone, Copy, Debug)]
pub enum FgTransientDesc {
    Buffer(GfxBufferDesc),
    Image(GfxImageDesc),
}

impl FgTransientDesc {
    /// placement 越界检查用的字节大小下界
    pub fn estimated_byte_size(&self) -> ash::vk::DeviceSize {
        match self {
            Self::Buffer(desc) => desc.size,
            Self::Image(desc) => desc.estimated_byte_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn test_handle_identity_not_description() {
        // 两个描述相同的 transient 依然是不同的句柄
        let a = FgResourceHandle::TransientImage(0);
        let b = FgResourceHandle::TransientImage(1);
        assert_ne!(a, b);
        assert_eq!(a, FgResourceHandle::TransientImage(0));
    }

    #[test]
    fn test_kind_tags() {
        assert!(FgResourceHandle::TransientBuffer(3).is_buffer());
        assert!(FgResourceHandle::TransientImage(3).is_image());
        assert!(FgResourceHandle::TransientImage(3).is_transient());
        assert!(!FgResourceHandle::ExternalBuffer(FgExternalBufferHandle::default()).is_transient());
    }

    #[test]
    fn test_transient_desc_size() {
        let desc = FgTransientDesc::Buffer(GfxBufferDesc::new(1024, vk::BufferUsageFlags::VERTEX_BUFFER));
        assert_eq!(desc.estimated_byte_size(), 1024);
    }
}
