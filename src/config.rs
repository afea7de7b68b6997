//! Device capabilities and state cache configuration
//!
//! Capabilities are probed once when the device is created and copied into
//! every state cache, so the hot paths only ever test plain booleans.

use wgpu_types as wgt;

/// Backend features that change how render passes and bindings are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Store actions may be changed after the encoder has started
    pub deferred_store_actions: bool,
    /// A multisampled attachment can both keep its samples and resolve
    pub store_and_resolve: bool,
    /// Depth and stencil can be read from one physical attachment
    pub combined_depth_stencil: bool,
    /// Multisampled depth can be resolved at the end of a pass
    pub msaa_depth_resolve: bool,
    /// Render target array length > 1
    pub layered_rendering: bool,
    /// More than one viewport / scissor per draw
    pub multiple_viewports: bool,
    /// Tessellated pipelines
    pub tessellation: bool,
    /// Upper bound on simultaneous viewports
    pub max_viewports: usize,
}

impl DeviceCapabilities {
    /// Hard cap on viewports the state cache will track
    pub const MAX_VIEWPORTS: usize = 16;

    /// Tile-based GPU (Apple family): everything the state cache can exploit
    pub fn tile_gpu() -> Self {
        Self {
            deferred_store_actions: true,
            store_and_resolve: true,
            combined_depth_stencil: true,
            msaa_depth_resolve: true,
            layered_rendering: true,
            multiple_viewports: true,
            tessellation: true,
            max_viewports: Self::MAX_VIEWPORTS,
        }
    }

    /// Immediate-mode desktop GPU on an older driver: store actions are fixed at pass open
    pub fn immediate_gpu() -> Self {
        Self {
            deferred_store_actions: false,
            store_and_resolve: false,
            combined_depth_stencil: true,
            msaa_depth_resolve: false,
            layered_rendering: true,
            multiple_viewports: false,
            tessellation: true,
            max_viewports: 1,
        }
    }

    /// Number of viewports actually honoured
    pub fn viewport_limit(&self) -> usize {
        if self.multiple_viewports {
            self.max_viewports.clamp(1, Self::MAX_VIEWPORTS)
        } else {
            1
        }
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            deferred_store_actions: false,
            store_and_resolve: false,
            combined_depth_stencil: false,
            msaa_depth_resolve: false,
            layered_rendering: false,
            multiple_viewports: false,
            tessellation: false,
            max_viewports: 1,
        }
    }
}

/// Per-context tuning knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateCacheConfig {
    /// Check draw preconditions (pipeline bound, targets compatible) before every draw
    pub validate_draws: bool,
    /// Format of the placeholder depth surface
    pub fallback_depth_format: wgt::TextureFormat,
    /// Reset viewport and scissor to the full target extent when a new encoder opens
    pub reset_viewport_on_new_pass: bool,
}

impl Default for StateCacheConfig {
    fn default() -> Self {
        Self {
            validate_draws: cfg!(debug_assertions),
            fallback_depth_format: wgt::TextureFormat::Depth32FloatStencil8,
            reset_viewport_on_new_pass: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_limit() {
        assert_eq!(DeviceCapabilities::default().viewport_limit(), 1);
        assert_eq!(DeviceCapabilities::tile_gpu().viewport_limit(), 16);

        let mut caps = DeviceCapabilities::tile_gpu();
        caps.max_viewports = 64;
        assert_eq!(caps.viewport_limit(), DeviceCapabilities::MAX_VIEWPORTS);
        caps.multiple_viewports = false;
        assert_eq!(caps.viewport_limit(), 1);
    }
}
