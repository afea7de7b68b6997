//! Pipeline state keys
//!
//! A [`PipelineKey`] identifies a compiled pipeline object. It has two parts:
//!
//! - a packed fixed-function word (`u128`) holding every render-state
//!   dimension the backend bakes into the pipeline, and
//! - 128-bit content hashes of each shader stage and of the vertex layout.
//!
//! # Fixed-function bit layout
//!
//! | Field | Bits | Width |
//! |---|---|---|
//! | color target *i* format (i = 0..8) | `10*i .. 10*i+5` | 5 |
//! | color target *i* blend key | `10*i+5 .. 10*i+10` | 5 |
//! | depth format | `80..83` | 3 |
//! | stencil format | `83..86` | 3 |
//! | sample count (log2) | `86..89` | 3 |
//! | primitive topology class | `89..91` | 2 |
//! | index type | `91..93` | 2 |
//! | alpha to coverage | `93` | 1 |
//!
//! Every field has its own [`KeyField`] entry, and [`PipelineKey::set`] masks
//! values to the field width, so adding a field cannot silently overlap an
//! existing one without the layout test failing.

use std::fmt;
use wgpu_types as wgt;

use crate::error::{Result, StateCacheError};
use crate::shader::ShaderHash;

/// Maximum simultaneous color targets
pub const MAX_COLOR_TARGETS: usize = 8;

/// A field of the packed fixed-function word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    ColorFormat(usize),
    ColorBlend(usize),
    DepthFormat,
    StencilFormat,
    SampleCount,
    Topology,
    IndexType,
    AlphaToCoverage,
}

impl KeyField {
    /// (bit offset, bit width)
    pub const fn layout(self) -> (u32, u32) {
        match self {
            KeyField::ColorFormat(i) => (10 * i as u32, 5),
            KeyField::ColorBlend(i) => (10 * i as u32 + 5, 5),
            KeyField::DepthFormat => (80, 3),
            KeyField::StencilFormat => (83, 3),
            KeyField::SampleCount => (86, 3),
            KeyField::Topology => (89, 2),
            KeyField::IndexType => (91, 2),
            KeyField::AlphaToCoverage => (93, 1),
        }
    }

    /// Every field, in layout order
    pub fn all() -> impl Iterator<Item = KeyField> {
        (0..MAX_COLOR_TARGETS)
            .flat_map(|i| [KeyField::ColorFormat(i), KeyField::ColorBlend(i)])
            .chain([
                KeyField::DepthFormat,
                KeyField::StencilFormat,
                KeyField::SampleCount,
                KeyField::Topology,
                KeyField::IndexType,
                KeyField::AlphaToCoverage,
            ])
    }
}

/// Primitive topology class, the only part of the topology a pipeline bakes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyClass {
    Unspecified = 0,
    Point = 1,
    Line = 2,
    Triangle = 3,
}

impl From<wgt::PrimitiveTopology> for TopologyClass {
    fn from(topology: wgt::PrimitiveTopology) -> Self {
        match topology {
            wgt::PrimitiveTopology::PointList => TopologyClass::Point,
            wgt::PrimitiveTopology::LineList | wgt::PrimitiveTopology::LineStrip => {
                TopologyClass::Line
            }
            wgt::PrimitiveTopology::TriangleList | wgt::PrimitiveTopology::TriangleStrip => {
                TopologyClass::Triangle
            }
        }
    }
}

/// 2-bit index type key
pub fn index_type_key(format: Option<wgt::IndexFormat>) -> u8 {
    match format {
        None => 0,
        Some(wgt::IndexFormat::Uint16) => 1,
        Some(wgt::IndexFormat::Uint32) => 2,
    }
}

/// Color formats that have a pipeline key, in key order (key = index + 1)
const COLOR_FORMATS: [wgt::TextureFormat; 30] = [
    wgt::TextureFormat::R8Unorm,
    wgt::TextureFormat::R8Snorm,
    wgt::TextureFormat::R8Uint,
    wgt::TextureFormat::R8Sint,
    wgt::TextureFormat::R16Unorm,
    wgt::TextureFormat::R16Uint,
    wgt::TextureFormat::R16Sint,
    wgt::TextureFormat::R16Float,
    wgt::TextureFormat::Rg8Unorm,
    wgt::TextureFormat::Rg8Uint,
    wgt::TextureFormat::R32Uint,
    wgt::TextureFormat::R32Sint,
    wgt::TextureFormat::R32Float,
    wgt::TextureFormat::Rg16Unorm,
    wgt::TextureFormat::Rg16Uint,
    wgt::TextureFormat::Rg16Float,
    wgt::TextureFormat::Rgba8Unorm,
    wgt::TextureFormat::Rgba8UnormSrgb,
    wgt::TextureFormat::Rgba8Uint,
    wgt::TextureFormat::Bgra8Unorm,
    wgt::TextureFormat::Bgra8UnormSrgb,
    wgt::TextureFormat::Rgb10a2Unorm,
    wgt::TextureFormat::Rg11b10Ufloat,
    wgt::TextureFormat::Rg32Float,
    wgt::TextureFormat::Rgba16Unorm,
    wgt::TextureFormat::Rgba16Uint,
    wgt::TextureFormat::Rgba16Sint,
    wgt::TextureFormat::Rgba16Float,
    wgt::TextureFormat::Rgba32Uint,
    wgt::TextureFormat::Rgba32Float,
];

/// 5-bit color format key (0 = no target)
pub fn color_format_key(format: Option<wgt::TextureFormat>) -> Result<u8> {
    let Some(format) = format else {
        return Ok(0);
    };
    COLOR_FORMATS
        .iter()
        .position(|f| *f == format)
        .map(|i| i as u8 + 1)
        .ok_or_else(|| StateCacheError::UnsupportedFormat {
            format: format!("{:?}", format),
        })
}

/// 3-bit depth format key (0 = no depth aspect)
pub fn depth_format_key(format: Option<wgt::TextureFormat>) -> Result<u8> {
    match format {
        None | Some(wgt::TextureFormat::Stencil8) => Ok(0),
        Some(wgt::TextureFormat::Depth16Unorm) => Ok(1),
        Some(wgt::TextureFormat::Depth24Plus) => Ok(2),
        Some(wgt::TextureFormat::Depth24PlusStencil8) => Ok(3),
        Some(wgt::TextureFormat::Depth32Float) => Ok(4),
        Some(wgt::TextureFormat::Depth32FloatStencil8) => Ok(5),
        Some(other) => Err(StateCacheError::UnsupportedFormat {
            format: format!("{:?} as depth", other),
        }),
    }
}

/// 3-bit stencil format key (0 = no stencil aspect)
pub fn stencil_format_key(format: Option<wgt::TextureFormat>) -> Result<u8> {
    match format {
        None
        | Some(wgt::TextureFormat::Depth16Unorm)
        | Some(wgt::TextureFormat::Depth24Plus)
        | Some(wgt::TextureFormat::Depth32Float) => Ok(0),
        Some(wgt::TextureFormat::Stencil8) => Ok(1),
        Some(wgt::TextureFormat::Depth24PlusStencil8) => Ok(2),
        Some(wgt::TextureFormat::Depth32FloatStencil8) => Ok(3),
        Some(other) => Err(StateCacheError::UnsupportedFormat {
            format: format!("{:?} as stencil", other),
        }),
    }
}

/// Cache key for a compiled pipeline object
///
/// Immutable once built; see the module docs for the layout.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PipelineKey {
    render_state: u128,
    vertex_layout: ShaderHash,
    vertex: ShaderHash,
    hull: Option<ShaderHash>,
    domain: Option<ShaderHash>,
    fragment: Option<ShaderHash>,
}

impl PipelineKey {
    /// Read one field of the fixed-function word
    pub fn get(&self, field: KeyField) -> u8 {
        let (offset, width) = field.layout();
        ((self.render_state >> offset) & ((1u128 << width) - 1)) as u8
    }

    /// Write one field of the fixed-function word, truncating to the field width
    pub fn set(&mut self, field: KeyField, value: u8) {
        let (offset, width) = field.layout();
        let mask = ((1u128 << width) - 1) << offset;
        debug_assert!(
            u128::from(value) < (1u128 << width),
            "{:?} value {} exceeds {} bits",
            field,
            value,
            width
        );
        self.render_state = (self.render_state & !mask) | ((u128::from(value) << offset) & mask);
    }

    pub fn set_shaders(
        &mut self,
        vertex: ShaderHash,
        hull: Option<ShaderHash>,
        domain: Option<ShaderHash>,
        fragment: Option<ShaderHash>,
    ) {
        self.vertex = vertex;
        self.hull = hull;
        self.domain = domain;
        self.fragment = fragment;
    }

    pub fn set_vertex_layout(&mut self, hash: ShaderHash) {
        self.vertex_layout = hash;
    }

    pub fn render_state(&self) -> u128 {
        self.render_state
    }

    pub fn vertex_hash(&self) -> ShaderHash {
        self.vertex
    }

    pub fn fragment_hash(&self) -> Option<ShaderHash> {
        self.fragment
    }

    pub fn is_tessellated(&self) -> bool {
        self.hull.is_some() || self.domain.is_some()
    }
}

impl fmt::Debug for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineKey")
            .field("render_state", &format_args!("{:#026x}", self.render_state))
            .field("vertex_layout", &self.vertex_layout)
            .field("vertex", &self.vertex)
            .field("hull", &self.hull)
            .field("domain", &self.domain)
            .field("fragment", &self.fragment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_fields_do_not_overlap() {
        let mut used: u128 = 0;
        for field in KeyField::all() {
            let (offset, width) = field.layout();
            let mask = ((1u128 << width) - 1) << offset;
            assert_eq!(used & mask, 0, "{:?} overlaps another field", field);
            used |= mask;
        }
        assert_eq!(used, (1u128 << 94) - 1);
    }

    #[test]
    fn test_set_and_get_round_trip_per_field() {
        let mut key = PipelineKey::default();
        key.set(KeyField::ColorFormat(7), 31);
        key.set(KeyField::ColorBlend(0), 5);
        key.set(KeyField::SampleCount, 2);
        key.set(KeyField::AlphaToCoverage, 1);
        assert_eq!(key.get(KeyField::ColorFormat(7)), 31);
        assert_eq!(key.get(KeyField::ColorBlend(0)), 5);
        assert_eq!(key.get(KeyField::ColorFormat(0)), 0);
        assert_eq!(key.get(KeyField::SampleCount), 2);
        assert_eq!(key.get(KeyField::AlphaToCoverage), 1);

        key.set(KeyField::SampleCount, 0);
        assert_eq!(key.get(KeyField::SampleCount), 0);
        assert_eq!(key.get(KeyField::AlphaToCoverage), 1);
    }

    #[test]
    fn test_format_keys() {
        assert_eq!(color_format_key(None).unwrap(), 0);
        assert_eq!(
            color_format_key(Some(wgt::TextureFormat::R8Unorm)).unwrap(),
            1
        );
        assert_eq!(
            color_format_key(Some(wgt::TextureFormat::Rgba32Float)).unwrap(),
            30
        );
        assert!(color_format_key(Some(wgt::TextureFormat::Depth32Float)).is_err());

        let combined = Some(wgt::TextureFormat::Depth32FloatStencil8);
        assert_eq!(depth_format_key(combined).unwrap(), 5);
        assert_eq!(stencil_format_key(combined).unwrap(), 3);
        assert_eq!(depth_format_key(Some(wgt::TextureFormat::Stencil8)).unwrap(), 0);
        assert_eq!(stencil_format_key(Some(wgt::TextureFormat::Depth32Float)).unwrap(), 0);
    }

    #[test]
    fn test_topology_class_ignores_strip_vs_list() {
        assert_eq!(
            TopologyClass::from(wgt::PrimitiveTopology::TriangleList),
            TopologyClass::from(wgt::PrimitiveTopology::TriangleStrip)
        );
        assert_ne!(
            TopologyClass::from(wgt::PrimitiveTopology::LineList),
            TopologyClass::from(wgt::PrimitiveTopology::TriangleList)
        );
    }
}
