//! Device - owner of everything shared between command contexts
//!
//! The pipeline cache, blend key table and depth/stencil state objects live
//! here and are handed to contexts by reference. Nothing in the crate is
//! global: dropping the last `Device` clone tears the caches down.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use wgpu_types as wgt;

use crate::config::{DeviceCapabilities, StateCacheConfig};
use crate::context::CommandContext;
use crate::encoder::CommandEncoder;
use crate::error::Result;
use crate::pipeline_cache::{PipelineCache, PipelineCompiler, PipelineObject};
use crate::pipeline_descriptor::GraphicsPipelineState;
use crate::resources::{IdAllocator, TextureInfo};
use crate::state_objects::{BlendKeyTable, DepthStencilDesc, DepthStencilStateObject};

/// Backend hook for the placeholder depth surface
pub trait SurfaceProvider: Send + Sync {
    fn create_depth_stencil_surface(
        &self,
        format: wgt::TextureFormat,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> TextureInfo;
}

pub(crate) struct DeviceShared {
    pub(crate) caps: DeviceCapabilities,
    pub(crate) config: StateCacheConfig,
    pub(crate) pipelines: PipelineCache,
    pub(crate) blend_keys: BlendKeyTable,
    pub(crate) compiler: Box<dyn PipelineCompiler>,
    pub(crate) surfaces: Box<dyn SurfaceProvider>,
    ids: IdAllocator,
    depth_stencil_states: RwLock<HashMap<DepthStencilDesc, Arc<DepthStencilStateObject>>>,
}

/// Graphics device
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Create a device with the default configuration
    pub fn new(
        caps: DeviceCapabilities,
        compiler: impl PipelineCompiler + 'static,
        surfaces: impl SurfaceProvider + 'static,
    ) -> Self {
        Self::with_config(caps, StateCacheConfig::default(), compiler, surfaces)
    }

    pub fn with_config(
        caps: DeviceCapabilities,
        config: StateCacheConfig,
        compiler: impl PipelineCompiler + 'static,
        surfaces: impl SurfaceProvider + 'static,
    ) -> Self {
        log::info!("Creating device");
        log::debug!("Capabilities: {:?}", caps);
        log::debug!("Config: {:?}", config);
        Self {
            shared: Arc::new(DeviceShared {
                caps,
                config,
                pipelines: PipelineCache::new(),
                blend_keys: BlendKeyTable::new(),
                compiler: Box::new(compiler),
                surfaces: Box::new(surfaces),
                ids: IdAllocator::new(),
                depth_stencil_states: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// New command context recording into `encoder`
    pub fn create_context<E: CommandEncoder>(&self, encoder: E) -> CommandContext<E> {
        CommandContext::new(self.shared.clone(), encoder)
    }

    /// Depth/stencil state object for `desc`, shared between equal descriptions
    pub fn create_depth_stencil_state(&self, desc: DepthStencilDesc) -> Arc<DepthStencilStateObject> {
        if let Some(state) = self.shared.depth_stencil_states.read().get(&desc) {
            return state.clone();
        }
        let mut states = self.shared.depth_stencil_states.write();
        states
            .entry(desc)
            .or_insert_with_key(|desc| {
                let state = DepthStencilStateObject {
                    id: self.shared.ids.next_depth_stencil_state(),
                    desc: desc.clone(),
                };
                log::debug!("Created depth/stencil state {:?}", state.id);
                Arc::new(state)
            })
            .clone()
    }

    /// Compile a pipeline ahead of its first draw
    pub fn precompile(&self, state: &GraphicsPipelineState) -> Result<Arc<PipelineObject>> {
        self.shared.pipelines.get_or_create_graphics(
            state,
            &self.shared.blend_keys,
            self.shared.compiler.as_ref(),
        )
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.shared.pipelines
    }

    pub fn blend_keys(&self) -> &BlendKeyTable {
        &self.shared.blend_keys
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.shared.caps
    }

    pub fn config(&self) -> &StateCacheConfig {
        &self.shared.config
    }
}
