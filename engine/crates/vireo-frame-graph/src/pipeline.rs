//! Pipeline 对象
//!
//! 一个逻辑 pipeline 持有若干按 render target 格式组合区分的 native
//! 变体。变体的创建（shader module、固定功能状态）属于外部的管线
//! 构建层；这里只做变体的登记与查找。
//! 绑定的目标格式找不到变体是内容迭代期的常见配置错误，按 flush
//! 失败上报而不是 panic。

use std::collections::HashMap;

use ash::vk;

use crate::binding::MAX_RENDER_TARGETS;

/// 变体 key：当前绑定的 render target / depth 格式组合
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FgTargetFormats {
    pub colors: [vk::Format; MAX_RENDER_TARGETS],
    pub color_count: u32,
    /// UNDEFINED 表示没有 depth 目标
    pub depth: vk::Format,
}

impl Default for FgTargetFormats {
    fn default() -> Self {
        Self {
            colors: [vk::Format::UNDEFINED; MAX_RENDER_TARGETS],
            color_count: 0,
            depth: vk::Format::UNDEFINED,
        }
    }
}

/// 按目标格式分变体的 pipeline
pub struct FgPipeline {
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
    push_constant_stages: vk::ShaderStageFlags,
    variants: HashMap<FgTargetFormats, vk::Pipeline>,
    debug_name: String,
}

// new & init
impl FgPipeline {
    pub fn new_raster(layout: vk::PipelineLayout, debug_name: impl Into<String>) -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout,
            push_constant_stages: vk::ShaderStageFlags::ALL_GRAPHICS,
            variants: HashMap::new(),
            debug_name: debug_name.into(),
        }
    }

    pub fn new_compute(layout: vk::PipelineLayout, pipeline: vk::Pipeline, debug_name: impl Into<String>) -> Self {
        let mut variants = HashMap::new();
        // compute 不关心目标格式，只有默认变体
        variants.insert(FgTargetFormats::default(), pipeline);
        Self {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout,
            push_constant_stages: vk::ShaderStageFlags::COMPUTE,
            variants,
            debug_name: debug_name.into(),
        }
    }

    /// 登记一个目标格式组合的变体
    pub fn add_variant(&mut self, formats: FgTargetFormats, pipeline: vk::Pipeline) {
        if self.variants.insert(formats, pipeline).is_some() {
            log::warn!("pipeline '{}': variant for {:?} replaced", self.debug_name, formats);
        }
    }
}

// getter
impl FgPipeline {
    /// 查找匹配目标格式的变体
    pub fn variant(&self, formats: &FgTargetFormats) -> Option<vk::Pipeline> {
        self.variants.get(formats).copied()
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    #[inline]
    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        self.push_constant_stages
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_variant_lookup_by_formats() {
        let mut pipeline = FgPipeline::new_raster(vk::PipelineLayout::from_raw(0x1), "lit-opaque");
        let mut formats = FgTargetFormats::default();
        formats.colors[0] = vk::Format::R8G8B8A8_UNORM;
        formats.color_count = 1;
        formats.depth = vk::Format::D32_SFLOAT;
        pipeline.add_variant(formats, vk::Pipeline::from_raw(0x2));

        assert_eq!(pipeline.variant(&formats), Some(vk::Pipeline::from_raw(0x2)));

        // 格式不匹配 -> 没有变体
        let mut other = formats;
        other.depth = vk::Format::UNDEFINED;
        assert_eq!(pipeline.variant(&other), None);
    }

    #[test]
    fn test_compute_pipeline_has_default_variant() {
        let pipeline =
            FgPipeline::new_compute(vk::PipelineLayout::from_raw(0x1), vk::Pipeline::from_raw(0x3), "tonemap");
        assert_eq!(pipeline.variant(&FgTargetFormats::default()), Some(vk::Pipeline::from_raw(0x3)));
    }
}
