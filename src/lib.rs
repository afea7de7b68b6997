//! Encoder state cache
//!
//! Pipeline-object cache and per-encoder dirty-state tracker for GPU backends
//! whose pipelines are immutable, precompiled objects and whose command
//! encoders forget all state when they end.
//!
//! - [`Device`] owns what is shared between threads: the [`PipelineCache`],
//!   the blend key table and depth/stencil state objects.
//! - [`CommandContext`] drives one [`CommandEncoder`], deciding when render
//!   passes begin, break and end.
//! - [`StateCache`] shadows everything the encoder has been told and sends
//!   only what changed when a draw is issued.

mod error;
pub mod logging;
pub mod config;
pub mod resources;
pub mod shader;
pub mod msaa;
pub mod state_objects;
pub mod state_key;
pub mod pipeline_descriptor;
pub mod pipeline_cache;
pub mod encoder;
pub mod binding_table;
pub mod render_pass;
pub mod state_cache;
mod context;
mod device;

pub use crate::config::{DeviceCapabilities, StateCacheConfig};
pub use crate::context::CommandContext;
pub use crate::device::{Device, SurfaceProvider};
pub use crate::encoder::{CommandEncoder, CommandRecorder, EncoderCommand};
pub use crate::error::{fatal, Result, StateCacheError};
pub use crate::pipeline_cache::{CacheStats, CompileError, PipelineCache, PipelineCompiler, PipelineObject};
pub use crate::pipeline_descriptor::{BoundShaderSet, GraphicsPipelineState, PipelineDescriptor};
pub use crate::render_pass::{
    ColorTarget, DepthStencilTarget, LoadAction, RenderPassDescriptor, RenderTargetsInfo, StoreAction,
};
pub use crate::resources::{BufferId, NativePipelineId, SamplerId, TextureId, TextureInfo};
pub use crate::shader::{ShaderFunction, ShaderStage};
pub use crate::state_cache::{EncoderPhase, RasterDirty, StateCache};
pub use crate::state_key::PipelineKey;
