//! 资源描述
//!
//! 帧图编译器声明的 buffer/image 描述，以及描述符槽位里写入的 view 描述。
//! 这些都是纯数据，native 对象的创建由 `GfxDriver` 完成。

use ash::vk;

/// 缓冲区描述
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxBufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl GfxBufferDesc {
    #[inline]
    pub const fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self { size, usage }
    }
}

/// 图像描述
///
/// clear 值是资源声明的一部分：transient 的 RT/DS 在第一次使用前
/// 必须按这个值清屏（参见 transient allocator 的 pending init 机制）。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GfxImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub clear_color: glam::Vec4,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl GfxImageDesc {
    pub fn new_2d(format: vk::Format, extent: vk::Extent2D, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            usage,
            clear_color: glam::Vec4::ZERO,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }

    #[inline]
    pub fn with_clear_color(mut self, color: glam::Vec4) -> Self {
        self.clear_color = color;
        self
    }

    #[inline]
    pub fn with_clear_depth_stencil(mut self, depth: f32, stencil: u32) -> Self {
        self.clear_depth = depth;
        self.clear_stencil = stencil;
        self
    }

    /// 根据 format 推断 aspect
    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        image_aspect(self.format)
    }

    /// 是否是 depth/stencil 格式
    #[inline]
    pub fn is_depth_stencil(&self) -> bool {
        self.aspect().intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    }

    /// 覆盖所有 mip 和 layer 的 subresource range
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// 估算 mip 0 的字节大小，用于 placement 的越界检查
    ///
    /// 实际的 placed image 大小由驱动的 memory requirements 决定，
    /// 这里只是帧图编译器输出的下界。
    pub fn estimated_byte_size(&self) -> vk::DeviceSize {
        let texel = format_texel_bytes(self.format) as vk::DeviceSize;
        texel * self.extent.width as vk::DeviceSize * self.extent.height as vk::DeviceSize
            * self.array_layers as vk::DeviceSize
    }
}

/// format -> aspect 的映射
///
/// 与 barrier 和 image view 的 aspect 推断共用一张表。
pub fn image_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }

        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,

        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }

        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// format -> 每 texel 字节数
///
/// 只覆盖引擎实际使用的格式；不认识的格式说明上层配置有错，直接 fatal。
pub fn format_texel_bytes(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,

        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT | vk::Format::D16_UNORM => 2,

        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D24_UNORM_S8_UINT => 4,

        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => 8,

        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,

        _ => panic!("unsupported format: {:?}", format),
    }
}

/// Sampler 描述，同时也是 sampler 堆的缓存 key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GfxSamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub max_anisotropy: u32,
    pub compare_op: Option<vk::CompareOp>,
    pub mipmap_mode: vk::SamplerMipmapMode,
}

impl Default for GfxSamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: 0,
            compare_op: None,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        }
    }
}

impl GfxSamplerDesc {
    pub fn nearest_clamp() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ..Default::default()
        }
    }
}

/// 写入描述符槽位的 view 描述
///
/// CPU 堆只接受 `Null` / `RenderTarget` / `DepthStencil`，
/// GPU 堆接受 shader 可见的四种，sampler 堆只接受 `Sampler`。
/// 混用属于调用方 bug，由 driver 实现 assert。
#[derive(Clone, Copy, Debug)]
pub enum GfxViewDesc {
    /// 空描述符，CPU 堆在构造时写入保留槽位
    Null,
    /// SRV：采样视图
    SampledImage {
        image: vk::Image,
        format: vk::Format,
        mip_levels: u32,
        array_layers: u32,
    },
    /// UAV：存储视图
    StorageImage { image: vk::Image, format: vk::Format },
    /// CBV：uniform buffer 区间
    UniformBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    /// 结构化缓冲区区间
    StorageBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    /// RTV
    RenderTarget { image: vk::Image, format: vk::Format },
    /// DSV
    DepthStencil { image: vk::Image, format: vk::Format },
    /// Sampler
    Sampler(GfxSamplerDesc),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_inference() {
        assert_eq!(image_aspect(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(image_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            image_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_estimated_byte_size() {
        let desc = GfxImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 256, height: 256 },
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        );
        assert_eq!(desc.estimated_byte_size(), 256 * 256 * 4);
    }

    #[test]
    #[should_panic]
    fn test_unsupported_format_is_fatal() {
        format_texel_bytes(vk::Format::ASTC_4X4_UNORM_BLOCK);
    }
}
