//! Cached state objects
//!
//! Plain values the state cache compares against its cached copy before
//! dirtying anything. Construction of the backend objects behind them is the
//! device layer's business; here they are just data plus an id.

use hashbrown::HashMap;
use parking_lot::RwLock;
use wgpu_types as wgt;

use crate::error::{Result, StateCacheError};
use crate::resources::DepthStencilStateId;

/// Viewport in framebuffer pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-extent viewport with the [0, 1] depth range
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Scissor rectangle in framebuffer pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Clamp to a render target of `width` x `height`.
    ///
    /// Backends reject scissors that leave the attachment, and a zero-area
    /// scissor is replaced by a 1x1 one in the corner.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width.saturating_sub(1));
        let y = self.y.min(height.saturating_sub(1));
        let max_width = width.saturating_sub(x);
        let max_height = height.saturating_sub(y);
        Self {
            x,
            y,
            width: self.width.min(max_width).max(1),
            height: self.height.min(max_height).max(1),
        }
    }
}

/// Constant and slope-scaled depth bias
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthBias {
    pub constant: f32,
    pub slope_scale: f32,
    pub clamp: f32,
}

/// How fragments outside the near/far planes are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthClipMode {
    #[default]
    Clip,
    Clamp,
}

/// Rasterizer state object
///
/// Each field maps to its own encoder call, so the state cache dirties them
/// individually.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub cull_mode: Option<wgt::Face>,
    pub front_face: wgt::FrontFace,
    pub fill_mode: wgt::PolygonMode,
    pub depth_bias: DepthBias,
    pub depth_clip: DepthClipMode,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull_mode: None,
            front_face: wgt::FrontFace::Ccw,
            fill_mode: wgt::PolygonMode::Fill,
            depth_bias: DepthBias::default(),
            depth_clip: DepthClipMode::Clip,
        }
    }
}

/// Description of a depth/stencil state object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_compare: wgt::CompareFunction,
    pub depth_write_enabled: bool,
    pub stencil: wgt::StencilState,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_compare: wgt::CompareFunction::Always,
            depth_write_enabled: false,
            stencil: wgt::StencilState::default(),
        }
    }
}

/// Backend depth/stencil state object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepthStencilStateObject {
    pub id: DepthStencilStateId,
    pub desc: DepthStencilDesc,
}

/// Occlusion query mode for subsequent draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VisibilityResultMode {
    #[default]
    Disabled,
    Boolean,
    Counting,
}

/// Blend configuration of one color target, the unit a blend key encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorTargetBlend {
    pub blend: Option<wgt::BlendState>,
    pub write_mask: wgt::ColorWrites,
}

impl Default for ColorTargetBlend {
    fn default() -> Self {
        Self {
            blend: None,
            write_mask: wgt::ColorWrites::ALL,
        }
    }
}

/// Assigns the 5-bit blend keys used in pipeline keys
///
/// Key 0 is the default (no blending, all channels written). Every other
/// distinct configuration gets the next free key for the lifetime of the
/// device, so equal blend states always produce equal keys.
pub struct BlendKeyTable {
    keys: RwLock<HashMap<ColorTargetBlend, u8>>,
}

impl BlendKeyTable {
    /// Number of representable keys (5 bits)
    pub const CAPACITY: usize = 32;

    pub fn new() -> Self {
        let mut keys = HashMap::new();
        keys.insert(ColorTargetBlend::default(), 0);
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// Return the key for `blend`, assigning one on first sight.
    pub fn key_for(&self, blend: &ColorTargetBlend) -> Result<u8> {
        if let Some(key) = self.keys.read().get(blend) {
            return Ok(*key);
        }

        let mut keys = self.keys.write();
        // Another thread may have assigned it between the two locks
        if let Some(key) = keys.get(blend) {
            return Ok(*key);
        }
        if keys.len() >= Self::CAPACITY {
            return Err(StateCacheError::BlendKeyExhausted {
                capacity: Self::CAPACITY,
            });
        }
        let key = keys.len() as u8;
        keys.insert(*blend, key);
        log::debug!("Assigned blend key {} to {:?}", key, blend);
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        // The default entry is always present
        false
    }
}

impl Default for BlendKeyTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scissor_clamp() {
        let rect = ScissorRect {
            x: 100,
            y: 50,
            width: 4000,
            height: 4000,
        };
        assert_eq!(
            rect.clamped(640, 480),
            ScissorRect {
                x: 100,
                y: 50,
                width: 540,
                height: 430
            }
        );

        let outside = ScissorRect {
            x: 9000,
            y: 9000,
            width: 0,
            height: 0,
        };
        assert_eq!(
            outside.clamped(640, 480),
            ScissorRect {
                x: 639,
                y: 479,
                width: 1,
                height: 1
            }
        );
    }

    #[test]
    fn test_blend_keys_are_stable() {
        let table = BlendKeyTable::new();
        let alpha = ColorTargetBlend {
            blend: Some(wgt::BlendState::ALPHA_BLENDING),
            write_mask: wgt::ColorWrites::ALL,
        };
        let additive = ColorTargetBlend {
            blend: Some(wgt::BlendState {
                color: wgt::BlendComponent {
                    src_factor: wgt::BlendFactor::One,
                    dst_factor: wgt::BlendFactor::One,
                    operation: wgt::BlendOperation::Add,
                },
                alpha: wgt::BlendComponent::OVER,
            }),
            write_mask: wgt::ColorWrites::COLOR,
        };

        assert_eq!(table.key_for(&ColorTargetBlend::default()).unwrap(), 0);
        let a = table.key_for(&alpha).unwrap();
        let b = table.key_for(&additive).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.key_for(&alpha).unwrap(), a);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_blend_key_exhaustion() {
        let table = BlendKeyTable::new();
        // Vary the write mask and the constant factor to mint distinct states
        let factors = [
            wgt::BlendFactor::Zero,
            wgt::BlendFactor::One,
            wgt::BlendFactor::Src,
            wgt::BlendFactor::OneMinusSrc,
            wgt::BlendFactor::SrcAlpha,
            wgt::BlendFactor::OneMinusSrcAlpha,
            wgt::BlendFactor::Dst,
            wgt::BlendFactor::OneMinusDst,
        ];
        let masks = [
            wgt::ColorWrites::RED,
            wgt::ColorWrites::GREEN,
            wgt::ColorWrites::BLUE,
            wgt::ColorWrites::ALPHA,
        ];
        let mut results = Vec::new();
        for factor in factors {
            for mask in masks {
                let component = wgt::BlendComponent {
                    src_factor: factor,
                    dst_factor: wgt::BlendFactor::Zero,
                    operation: wgt::BlendOperation::Add,
                };
                results.push(table.key_for(&ColorTargetBlend {
                    blend: Some(wgt::BlendState {
                        color: component,
                        alpha: component,
                    }),
                    write_mask: mask,
                }));
            }
        }
        // 31 free keys after the default one, 32 requests
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 31);
        assert!(matches!(
            results.last(),
            Some(Err(StateCacheError::BlendKeyExhausted { .. }))
        ));
    }
}
