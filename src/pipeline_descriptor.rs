//! Pipeline descriptors and key building
//!
//! [`GraphicsPipelineState`] is what the draw API hands over when it sets a
//! pipeline: the bound shader set plus all fixed-function state. Two pure
//! functions turn it into what the cache needs:
//!
//! - [`build_key`] folds it into a [`PipelineKey`]; this runs before any lock
//!   is taken, so unrelated draws never serialize on key building.
//! - [`build_descriptor`] produces the backend-native [`PipelineDescriptor`],
//!   only called on a cache miss.

use std::sync::Arc;

use smallvec::SmallVec;
use wgpu_types as wgt;

use crate::error::{Result, StateCacheError};
use crate::msaa::SampleCount;
use crate::shader::{ShaderFunction, ShaderHash, ShaderReflection, ShaderStage};
use crate::state_key::{
    color_format_key, depth_format_key, index_type_key, stencil_format_key, KeyField,
    PipelineKey, TopologyClass, MAX_COLOR_TARGETS,
};
use crate::state_objects::{BlendKeyTable, ColorTargetBlend};

/// One vertex buffer's layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u64,
    pub step_mode: wgt::VertexStepMode,
    pub attributes: SmallVec<[wgt::VertexAttribute; 8]>,
}

/// Vertex fetch layout across all vertex buffers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexLayout {
    pub buffers: SmallVec<[VertexBufferLayout; 4]>,
}

impl VertexLayout {
    /// Content hash of the layout
    pub fn hash(&self) -> ShaderHash {
        let mut bytes = Vec::with_capacity(16 + self.buffers.len() * 48);
        for (index, buffer) in self.buffers.iter().enumerate() {
            bytes.extend_from_slice(&(index as u32).to_le_bytes());
            bytes.extend_from_slice(&buffer.stride.to_le_bytes());
            bytes.push(match buffer.step_mode {
                wgt::VertexStepMode::Vertex => 0,
                wgt::VertexStepMode::Instance => 1,
            });
            for attribute in &buffer.attributes {
                bytes.extend_from_slice(&(attribute.format as u32).to_le_bytes());
                bytes.extend_from_slice(&attribute.offset.to_le_bytes());
                bytes.extend_from_slice(&attribute.shader_location.to_le_bytes());
            }
        }
        ShaderHash::of(&bytes)
    }
}

/// Hull and domain stages of a tessellated pipeline
#[derive(Debug, Clone)]
pub struct TessellationStages {
    pub hull: Arc<ShaderFunction>,
    pub domain: Arc<ShaderFunction>,
}

/// Shaders bound together for one graphics pipeline
#[derive(Debug, Clone)]
pub struct BoundShaderSet {
    pub vertex: Arc<ShaderFunction>,
    pub fragment: Option<Arc<ShaderFunction>>,
    pub tessellation: Option<TessellationStages>,
}

impl BoundShaderSet {
    pub fn new(vertex: Arc<ShaderFunction>, fragment: Option<Arc<ShaderFunction>>) -> Self {
        Self {
            vertex,
            fragment,
            tessellation: None,
        }
    }

    pub fn with_tessellation(mut self, hull: Arc<ShaderFunction>, domain: Arc<ShaderFunction>) -> Self {
        self.tessellation = Some(TessellationStages { hull, domain });
        self
    }

    /// Function bound to `stage`, if any
    pub fn function(&self, stage: ShaderStage) -> Option<&Arc<ShaderFunction>> {
        match stage {
            ShaderStage::Vertex => Some(&self.vertex),
            ShaderStage::Fragment => self.fragment.as_ref(),
            ShaderStage::Hull => self.tessellation.as_ref().map(|t| &t.hull),
            ShaderStage::Domain => self.tessellation.as_ref().map(|t| &t.domain),
            ShaderStage::Compute => None,
        }
    }
}

/// Format and blending of one color target as the pipeline sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColorTargetState {
    pub format: Option<wgt::TextureFormat>,
    pub blend: ColorTargetBlend,
}

/// Shader set plus fixed-function state, as handed over by `SetGraphicsPipeline`
#[derive(Debug, Clone)]
pub struct GraphicsPipelineState {
    /// Debug label, not part of the key
    pub label: String,
    pub shaders: BoundShaderSet,
    pub vertex_layout: VertexLayout,
    pub color_targets: SmallVec<[ColorTargetState; MAX_COLOR_TARGETS]>,
    pub depth_stencil_format: Option<wgt::TextureFormat>,
    pub sample_count: SampleCount,
    pub topology: wgt::PrimitiveTopology,
    pub index_format: Option<wgt::IndexFormat>,
    pub alpha_to_coverage: bool,
}

impl GraphicsPipelineState {
    /// Single-target triangle-list pipeline with default blending
    pub fn new(label: impl Into<String>, shaders: BoundShaderSet, color_format: wgt::TextureFormat) -> Self {
        let mut color_targets = SmallVec::new();
        color_targets.push(ColorTargetState {
            format: Some(color_format),
            blend: ColorTargetBlend::default(),
        });
        Self {
            label: label.into(),
            shaders,
            vertex_layout: VertexLayout::default(),
            color_targets,
            depth_stencil_format: None,
            sample_count: SampleCount::ONE,
            topology: wgt::PrimitiveTopology::TriangleList,
            index_format: None,
            alpha_to_coverage: false,
        }
    }

    pub fn is_tessellated(&self) -> bool {
        self.shaders.tessellation.is_some()
    }
}

/// Backend-native pipeline descriptor, the compiler's input
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub label: String,
    pub vertex_function: Arc<ShaderFunction>,
    pub fragment_function: Option<Arc<ShaderFunction>>,
    pub tessellation: Option<TessellationStages>,
    pub vertex_layout: VertexLayout,
    pub color_attachments: SmallVec<[ColorTargetState; MAX_COLOR_TARGETS]>,
    pub depth_attachment_format: Option<wgt::TextureFormat>,
    pub stencil_attachment_format: Option<wgt::TextureFormat>,
    pub raster_sample_count: u32,
    pub input_primitive_topology: TopologyClass,
    /// Control point index type; only meaningful for tessellated pipelines
    pub tessellation_index_type: Option<wgt::IndexFormat>,
    pub alpha_to_coverage: bool,
}

/// What the state cache needs to know about a compiled pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineReflection {
    pub stages: [ShaderReflection; ShaderStage::COUNT],
    pub tessellated: bool,
    /// Fragment stage writes depth, so a depth attachment must exist
    pub writes_depth: bool,
    /// Color target formats in slot order; `None` for holes
    pub color_formats: [Option<wgt::TextureFormat>; MAX_COLOR_TARGETS],
    pub depth_format: Option<wgt::TextureFormat>,
    pub stencil_format: Option<wgt::TextureFormat>,
    pub sample_count: u32,
}

impl PipelineReflection {
    pub fn from_state(state: &GraphicsPipelineState) -> Self {
        let mut stages = [ShaderReflection::default(); ShaderStage::COUNT];
        for stage in ShaderStage::ALL {
            if let Some(function) = state.shaders.function(stage) {
                stages[stage.index()] = *function.reflection();
            }
        }
        let writes_depth = state
            .shaders
            .fragment
            .as_ref()
            .map(|f| f.reflection().writes_depth)
            .unwrap_or(false);
        let mut color_formats = [None; MAX_COLOR_TARGETS];
        for (slot, target) in color_formats.iter_mut().zip(&state.color_targets) {
            *slot = target.format;
        }
        Self {
            stages,
            tessellated: state.is_tessellated(),
            writes_depth,
            color_formats,
            depth_format: state.depth_stencil_format.filter(|f| f.has_depth_aspect()),
            stencil_format: state.depth_stencil_format.filter(|f| f.has_stencil_aspect()),
            sample_count: state.sample_count.get(),
        }
    }

    /// A draw with this pipeline needs a depth attachment bound
    pub fn requires_depth_attachment(&self) -> bool {
        self.writes_depth || self.depth_format.is_some()
    }
}

/// Fold a pipeline state into its cache key.
///
/// Only state the backend bakes into the pipeline object is encoded; labels
/// and anything set per draw are not.
pub fn build_key(state: &GraphicsPipelineState, blend_keys: &BlendKeyTable) -> Result<PipelineKey> {
    if state.color_targets.len() > MAX_COLOR_TARGETS {
        return Err(StateCacheError::TooManyColorTargets {
            count: state.color_targets.len(),
            max: MAX_COLOR_TARGETS,
        });
    }

    let mut key = PipelineKey::default();
    for (index, target) in state.color_targets.iter().enumerate() {
        let format = color_format_key(target.format)?;
        key.set(KeyField::ColorFormat(index), format);
        // Blending on a hole is meaningless, keep holes canonical
        if format != 0 {
            key.set(KeyField::ColorBlend(index), blend_keys.key_for(&target.blend)?);
        }
    }

    key.set(KeyField::DepthFormat, depth_format_key(state.depth_stencil_format)?);
    key.set(KeyField::StencilFormat, stencil_format_key(state.depth_stencil_format)?);
    key.set(KeyField::SampleCount, state.sample_count.key());
    key.set(KeyField::Topology, TopologyClass::from(state.topology) as u8);
    key.set(KeyField::IndexType, index_type_key(state.index_format));
    key.set(KeyField::AlphaToCoverage, state.alpha_to_coverage as u8);

    let tessellation = state.shaders.tessellation.as_ref();
    key.set_shaders(
        state.shaders.vertex.hash(),
        tessellation.map(|t| t.hull.hash()),
        tessellation.map(|t| t.domain.hash()),
        state.shaders.fragment.as_ref().map(|f| f.hash()),
    );
    key.set_vertex_layout(state.vertex_layout.hash());
    Ok(key)
}

/// Build the backend descriptor for a pipeline state
pub fn build_descriptor(state: &GraphicsPipelineState) -> PipelineDescriptor {
    let format = state.depth_stencil_format;
    PipelineDescriptor {
        label: state.label.clone(),
        vertex_function: state.shaders.vertex.clone(),
        fragment_function: state.shaders.fragment.clone(),
        tessellation: state.shaders.tessellation.clone(),
        vertex_layout: state.vertex_layout.clone(),
        color_attachments: state.color_targets.clone(),
        depth_attachment_format: format.filter(|f| f.has_depth_aspect()),
        stencil_attachment_format: format.filter(|f| f.has_stencil_aspect()),
        raster_sample_count: state.sample_count.get(),
        input_primitive_topology: TopologyClass::from(state.topology),
        tessellation_index_type: if state.is_tessellated() {
            state.index_format
        } else {
            None
        },
        alpha_to_coverage: state.alpha_to_coverage,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn shader(stage: ShaderStage, code: &[u8]) -> Arc<ShaderFunction> {
        Arc::new(ShaderFunction::new(
            stage,
            format!("{} test", stage),
            "main",
            code.to_vec(),
            ShaderReflection::default(),
        ))
    }

    pub(crate) fn basic_state() -> GraphicsPipelineState {
        let shaders = BoundShaderSet::new(
            shader(ShaderStage::Vertex, b"vs"),
            Some(shader(ShaderStage::Fragment, b"fs")),
        );
        let mut state =
            GraphicsPipelineState::new("basic", shaders, wgt::TextureFormat::Bgra8Unorm);
        state.depth_stencil_format = Some(wgt::TextureFormat::Depth32Float);
        state
    }

    #[test]
    fn test_key_ignores_unencoded_dimensions() {
        let table = BlendKeyTable::new();
        let a = basic_state();
        let mut b = basic_state();
        b.label = "renamed".to_string();
        // Strip vs list is the same topology class
        b.topology = wgt::PrimitiveTopology::TriangleStrip;
        assert_eq!(build_key(&a, &table).unwrap(), build_key(&b, &table).unwrap());
    }

    #[test]
    fn test_key_changes_with_each_encoded_dimension() {
        let table = BlendKeyTable::new();
        let base = build_key(&basic_state(), &table).unwrap();

        let mut variants = Vec::new();

        let mut s = basic_state();
        s.color_targets[0].format = Some(wgt::TextureFormat::Rgba16Float);
        variants.push(s);

        let mut s = basic_state();
        s.color_targets[0].blend.blend = Some(wgt::BlendState::ALPHA_BLENDING);
        variants.push(s);

        let mut s = basic_state();
        s.depth_stencil_format = Some(wgt::TextureFormat::Depth24PlusStencil8);
        variants.push(s);

        let mut s = basic_state();
        s.sample_count = SampleCount::new(4).unwrap();
        variants.push(s);

        let mut s = basic_state();
        s.topology = wgt::PrimitiveTopology::LineList;
        variants.push(s);

        let mut s = basic_state();
        s.index_format = Some(wgt::IndexFormat::Uint32);
        variants.push(s);

        let mut s = basic_state();
        s.alpha_to_coverage = true;
        variants.push(s);

        let mut s = basic_state();
        s.shaders.fragment = Some(shader(ShaderStage::Fragment, b"fs2"));
        variants.push(s);

        let mut s = basic_state();
        s.vertex_layout.buffers.push(VertexBufferLayout {
            stride: 16,
            step_mode: wgt::VertexStepMode::Vertex,
            attributes: SmallVec::from_slice(&[wgt::VertexAttribute {
                format: wgt::VertexFormat::Float32x4,
                offset: 0,
                shader_location: 0,
            }]),
        });
        variants.push(s);

        let mut s = basic_state();
        s.shaders = s.shaders.clone().with_tessellation(
            shader(ShaderStage::Hull, b"hs"),
            shader(ShaderStage::Domain, b"ds"),
        );
        variants.push(s);

        let mut keys = vec![base];
        for variant in &variants {
            let key = build_key(variant, &table).unwrap();
            assert!(!keys.contains(&key), "{:?} collided", variant.label);
            keys.push(key);
        }
    }

    #[test]
    fn test_too_many_targets_rejected() {
        let table = BlendKeyTable::new();
        let mut s = basic_state();
        for _ in 0..MAX_COLOR_TARGETS {
            s.color_targets.push(ColorTargetState::default());
        }
        assert!(matches!(
            build_key(&s, &table),
            Err(StateCacheError::TooManyColorTargets { count: 9, .. })
        ));
    }

    #[test]
    fn test_descriptor_splits_depth_and_stencil() {
        let mut s = basic_state();
        s.depth_stencil_format = Some(wgt::TextureFormat::Depth32FloatStencil8);
        let desc = build_descriptor(&s);
        assert_eq!(
            desc.depth_attachment_format,
            Some(wgt::TextureFormat::Depth32FloatStencil8)
        );
        assert_eq!(
            desc.stencil_attachment_format,
            Some(wgt::TextureFormat::Depth32FloatStencil8)
        );
        assert_eq!(desc.input_primitive_topology, TopologyClass::Triangle);
        assert_eq!(desc.tessellation_index_type, None);

        s.depth_stencil_format = Some(wgt::TextureFormat::Depth32Float);
        let desc = build_descriptor(&s);
        assert_eq!(desc.stencil_attachment_format, None);
    }

    #[test]
    fn test_reflection_requires_depth() {
        let mut s = basic_state();
        assert!(PipelineReflection::from_state(&s).requires_depth_attachment());
        s.depth_stencil_format = None;
        assert!(!PipelineReflection::from_state(&s).requires_depth_attachment());

        let mut reflection = ShaderReflection::default();
        reflection.writes_depth = true;
        s.shaders.fragment = Some(Arc::new(ShaderFunction::new(
            ShaderStage::Fragment,
            "depth writer",
            "main",
            b"fs depth".to_vec(),
            reflection,
        )));
        assert!(PipelineReflection::from_state(&s).requires_depth_attachment());
    }

    #[test]
    fn test_reflection_records_attachment_formats() {
        let mut s = basic_state();
        let reflection = PipelineReflection::from_state(&s);
        assert_eq!(reflection.color_formats[0], Some(wgt::TextureFormat::Bgra8Unorm));
        assert_eq!(reflection.color_formats[1], None);
        assert_eq!(reflection.depth_format, Some(wgt::TextureFormat::Depth32Float));
        assert_eq!(reflection.stencil_format, None);

        s.depth_stencil_format = Some(wgt::TextureFormat::Depth24PlusStencil8);
        let reflection = PipelineReflection::from_state(&s);
        assert_eq!(reflection.stencil_format, Some(wgt::TextureFormat::Depth24PlusStencil8));
    }
}
