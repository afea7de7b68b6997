//! Resource handles
//!
//! The state cache never owns GPU resources. Buffers, textures and samplers are
//! owned by the resource-management layer above; what the cache stores is a
//! typed id plus the bits of metadata it needs to make decisions (formats,
//! sample counts, extents). Ids are plain `Copy` values so binding tables can
//! compare them by value.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use wgpu_types as wgt;

use crate::error::{fatal, StateCacheError};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Wrap a raw handle. Returns `None` for 0, which is reserved for "null".
            pub fn new(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map(Self)
            }

            pub fn raw(&self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Backend buffer
    BufferId
);
define_id!(
    /// Backend texture
    TextureId
);
define_id!(
    /// Backend sampler object
    SamplerId
);
define_id!(
    /// Backend depth/stencil state object
    DepthStencilStateId
);
define_id!(
    /// Backend-compiled pipeline object
    NativePipelineId
);

/// Thread-safe monotonically increasing handle source
///
/// Starts at 1 so 0 can mean null.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_raw(&self) -> NonZeroU64 {
        let raw = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| raw.checked_add(1))
            .ok()
            .and_then(NonZeroU64::new);
        match raw {
            Some(raw) => raw,
            // Reusing an id would alias two live resources
            None => fatal(StateCacheError::invalid_parameter("id", "handle space exhausted")),
        }
    }

    pub fn next_texture(&self) -> TextureId {
        TextureId(self.next_raw())
    }

    pub fn next_depth_stencil_state(&self) -> DepthStencilStateId {
        DepthStencilStateId(self.next_raw())
    }

    pub fn next_pipeline(&self) -> NativePipelineId {
        NativePipelineId(self.next_raw())
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Texture metadata carried alongside its id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    pub id: TextureId,
    pub format: wgt::TextureFormat,
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
}

impl TextureInfo {
    /// 2D single-sample texture with one mip and one layer
    pub fn new_2d(id: TextureId, format: wgt::TextureFormat, width: u32, height: u32) -> Self {
        Self {
            id,
            format,
            width,
            height,
            array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
        }
    }

    pub fn with_samples(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn is_multisampled(&self) -> bool {
        self.sample_count > 1
    }

    pub fn has_depth(&self) -> bool {
        self.format.has_depth_aspect()
    }

    pub fn has_stencil(&self) -> bool {
        self.format.has_stencil_aspect()
    }

    /// Extent of a mip level, never smaller than 1x1
    pub fn mip_extent(&self, mip_level: u32) -> (u32, u32) {
        let shift = mip_level.min(31);
        ((self.width >> shift).max(1), (self.height >> shift).max(1))
    }
}

/// Buffer metadata carried alongside its id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferInfo {
    pub id: BufferId,
    pub size: u64,
}
