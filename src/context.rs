//! Command context - drives one encoder's lifetime
//!
//! The context is what the draw API talks to. It owns a [`StateCache`] and a
//! backend encoder and decides when render passes begin, continue, break and
//! end:
//!
//! - `set_render_targets` keeps the open encoder when the new configuration
//!   allows it, otherwise ends it and begins the next pass.
//! - Draws commit dirty state, reopening a broken pass and binding the
//!   placeholder depth surface first if the pipeline needs one.
//! - `break_render_pass` ends the encoder for work that can't run inside a
//!   render pass, keeping contents so the pass can continue afterwards.

use std::sync::Arc;

use wgpu_types as wgt;

use crate::device::DeviceShared;
use crate::encoder::CommandEncoder;
use crate::error::{fatal, StateCacheError};
use crate::pipeline_cache::PipelineObject;
use crate::pipeline_descriptor::GraphicsPipelineState;
use crate::render_pass::{ComponentAccess, DepthStencilAccess, RenderTargetsInfo, StoreActions};
use crate::resources::{BufferId, SamplerId, TextureId, TextureInfo};
use crate::shader::ShaderStage;
use crate::state_cache::StateCache;
use crate::state_objects::{
    DepthStencilStateObject, RasterizerState, ScissorRect, Viewport, VisibilityResultMode,
};

/// Recording context over one backend encoder
pub struct CommandContext<E: CommandEncoder> {
    device: Arc<DeviceShared>,
    state: StateCache,
    encoder: E,
    encoder_open: bool,
}

impl<E: CommandEncoder> CommandContext<E> {
    pub(crate) fn new(device: Arc<DeviceShared>, encoder: E) -> Self {
        let state = StateCache::new(device.caps, device.config);
        Self {
            device,
            state,
            encoder,
            encoder_open: false,
        }
    }

    pub fn state(&self) -> &StateCache {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateCache {
        &mut self.state
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    pub fn is_encoder_open(&self) -> bool {
        self.encoder_open
    }

    // === Render targets ===

    /// Bind a render-target configuration, starting a new pass if needed.
    ///
    /// Configurations the device rejects are fatal. Empty ones are ignored.
    pub fn set_render_targets(&mut self, info: RenderTargetsInfo) {
        if info.is_empty() {
            log::debug!("Ignoring empty render target configuration");
            return;
        }
        // What the open encoder ends with if this configuration replaces it
        let outgoing = self.state.render_pass().final_store_actions(false);

        let needs_new = self
            .state
            .set_render_targets(info)
            .unwrap_or_else(|e| fatal(e));
        if !needs_new && self.encoder_open {
            return;
        }
        if self.encoder_open {
            self.end_encoder(&outgoing);
        }
        let requires_depth = self
            .state
            .pipeline()
            .map(|p| p.reflection().requires_depth_attachment())
            .unwrap_or(false);
        if self.state.render_pass().needs_fallback_depth(requires_depth) {
            self.bind_fallback_depth(false);
        }
        // Same targets after a break continue the broken pass
        self.begin_encoder(needs_new);
    }

    // === Pipeline ===

    /// Look up or compile the pipeline for `state` and make it current
    pub fn set_graphics_pipeline(&mut self, state: &GraphicsPipelineState) -> Arc<PipelineObject> {
        if state.is_tessellated() && !self.device.caps.tessellation {
            fatal(StateCacheError::unsupported("tessellation"));
        }
        let pipeline = self
            .device
            .pipelines
            .get_or_create_graphics(state, &self.device.blend_keys, self.device.compiler.as_ref())
            .unwrap_or_else(|e| fatal(e));
        self.state.set_pipeline(pipeline.clone());
        pipeline
    }

    // === Raster state ===

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.state.set_viewport(viewport);
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.state.set_viewports(viewports);
    }

    pub fn set_scissor(&mut self, rect: Option<ScissorRect>) {
        self.state.set_scissor(rect);
    }

    pub fn set_rasterizer_state(&mut self, state: &RasterizerState) {
        self.state.set_rasterizer_state(state);
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        self.state.set_blend_color(color);
    }

    pub fn set_depth_stencil_state(&mut self, state: Arc<DepthStencilStateObject>) {
        self.state.set_depth_stencil_state(state);
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.state.set_stencil_reference(reference);
    }

    /// Occlusion queries need a visibility buffer in the render targets
    pub fn set_visibility_result_mode(&mut self, mode: VisibilityResultMode, offset: u64) {
        let has_buffer = self
            .state
            .render_pass()
            .current()
            .map(|info| info.visibility_buffer.is_some())
            .unwrap_or(false);
        if mode != VisibilityResultMode::Disabled && !has_buffer {
            fatal(StateCacheError::invalid_parameter(
                "visibility_result_mode",
                "no visibility buffer bound with the render targets",
            ));
        }
        self.state.set_visibility_result_mode(mode, offset);
    }

    // === Resources ===

    pub fn set_shader_buffer(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        buffer: Option<BufferId>,
        offset: u64,
        length: u64,
    ) {
        self.state.set_buffer(stage, slot, buffer, offset, length, None);
    }

    pub fn set_shader_bytes(&mut self, stage: ShaderStage, slot: usize, bytes: &[u8]) {
        self.state.set_bytes(stage, slot, bytes);
    }

    pub fn set_shader_texture(&mut self, stage: ShaderStage, slot: usize, texture: Option<TextureId>) {
        self.state.set_texture(stage, slot, texture);
    }

    pub fn set_shader_sampler(&mut self, stage: ShaderStage, slot: usize, sampler: Option<SamplerId>) {
        self.state.set_sampler(stage, slot, sampler);
    }

    // === Draws ===

    pub fn draw(
        &mut self,
        topology: wgt::PrimitiveTopology,
        first_vertex: u32,
        vertex_count: u32,
        instance_count: u32,
        first_instance: u32,
    ) {
        self.prepare_draw();
        self.encoder
            .draw(topology, first_vertex, vertex_count, instance_count, first_instance);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed(
        &mut self,
        topology: wgt::PrimitiveTopology,
        index_buffer: BufferId,
        index_format: wgt::IndexFormat,
        index_offset: u64,
        index_count: u32,
        instance_count: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.prepare_draw();
        self.encoder.draw_indexed(
            topology,
            index_buffer,
            index_format,
            index_offset,
            index_count,
            instance_count,
            base_vertex,
            first_instance,
        );
    }

    fn prepare_draw(&mut self) {
        let Some(pipeline) = self.state.pipeline().cloned() else {
            fatal(StateCacheError::MissingPipeline);
        };
        if self.state.render_pass().current().is_none() {
            fatal(StateCacheError::invalid_parameter(
                "render_targets",
                "draw without render targets",
            ));
        }

        let requires_depth = pipeline.reflection().requires_depth_attachment();
        if self.state.render_pass().needs_fallback_depth(requires_depth) {
            if self.encoder_open {
                // Depth attachments are fixed at pass open, so continue in a new encoder
                log::debug!(
                    "Pipeline '{}' needs depth, restarting pass with fallback surface",
                    pipeline.label()
                );
                let outgoing = self.state.render_pass().final_store_actions(true);
                self.end_encoder(&outgoing);
                self.bind_fallback_depth(true);
            } else {
                self.bind_fallback_depth(false);
            }
        }

        if !self.encoder_open {
            self.begin_encoder(false);
        }
        self.state.commit_for_draw(&mut self.encoder);
    }

    /// Bind a placeholder depth/stencil attachment shaped for the bound pipeline.
    ///
    /// Pipelines built for a depth/stencil format get surfaces of exactly that
    /// format and the components they use. Depth writers without a declared
    /// format get the configured default, depth only.
    fn bind_fallback_depth(&mut self, preserve_contents: bool) {
        let reflection = self
            .state
            .pipeline()
            .map(|p| *p.reflection())
            .unwrap_or_default();
        let depth_format = reflection
            .depth_format
            .unwrap_or(self.device.config.fallback_depth_format);
        let access = DepthStencilAccess {
            depth: ComponentAccess::Write,
            stencil: match reflection.stencil_format {
                Some(_) => ComponentAccess::Write,
                None => ComponentAccess::Unused,
            },
        };
        let separate_stencil = reflection
            .stencil_format
            .filter(|&format| format != depth_format || !self.device.caps.combined_depth_stencil);

        let depth = self
            .state
            .render_pass()
            .reusable_fallback_depth(depth_format)
            .unwrap_or_else(|| self.create_fallback_surface(depth_format));
        let stencil = separate_stencil.map(|format| {
            self.state
                .render_pass()
                .reusable_fallback_stencil(format)
                .unwrap_or_else(|| self.create_fallback_surface(format))
        });
        self.state
            .render_pass_mut()
            .bind_fallback_depth(depth, stencil, access, preserve_contents)
            .unwrap_or_else(|e| fatal(e));
    }

    fn create_fallback_surface(&self, format: wgt::TextureFormat) -> TextureInfo {
        let render_pass = self.state.render_pass();
        let (width, height) = render_pass.extent();
        log::debug!("Creating fallback {:?} surface {}x{}", format, width, height);
        self.device
            .surfaces
            .create_depth_stencil_surface(format, width, height, render_pass.sample_count())
    }

    // === Encoder lifetime ===

    /// Open an encoder over the current targets; `new_pass` is false when it
    /// continues a pass an earlier encoder broke off
    fn begin_encoder(&mut self, new_pass: bool) {
        let Some(descriptor) = self.state.render_pass().descriptor().cloned() else {
            fatal(StateCacheError::invalid_parameter(
                "render_targets",
                "no render targets to begin a pass with",
            ));
        };
        log::trace!(
            "Beginning render pass {}x{} with {} color attachments",
            descriptor.width,
            descriptor.height,
            descriptor.color_attachments.len()
        );
        self.encoder.begin_render_pass(&descriptor);
        self.encoder_open = true;
        self.state.on_encoder_begin(new_pass);
    }

    fn end_encoder(&mut self, store_actions: &StoreActions) {
        if self.device.caps.deferred_store_actions {
            for (index, action) in store_actions.color.iter().enumerate() {
                if let Some(action) = action {
                    self.encoder.set_color_store_action(index, *action);
                }
            }
            if let Some(action) = store_actions.depth {
                self.encoder.set_depth_store_action(action);
            }
            if let Some(action) = store_actions.stencil {
                self.encoder.set_stencil_store_action(action);
            }
        }
        self.encoder.end_encoding();
        self.encoder_open = false;
        self.state.on_encoder_end();
    }

    /// End the encoder mid-pass, e.g. for a barrier or a copy.
    ///
    /// The next draw continues the pass in a new encoder. Multisampled passes
    /// can't be continued; their render targets must be set again.
    pub fn break_render_pass(&mut self) {
        if !self.encoder_open {
            return;
        }
        let outgoing = self.state.render_pass().final_store_actions(true);
        self.end_encoder(&outgoing);
        if self.state.render_pass_mut().prepare_to_restart() {
            log::debug!("Render pass broken, continuing on next draw");
        } else {
            log::warn!("Render pass broken and cannot be restarted; render targets must be set again");
            self.state.render_pass_mut().reset();
        }
    }

    /// End the current pass for good
    pub fn end_render_pass(&mut self) {
        if self.encoder_open {
            let outgoing = self.state.render_pass().final_store_actions(false);
            self.end_encoder(&outgoing);
        }
        self.state.render_pass_mut().reset();
    }

    /// Return the context to a clean slate, e.g. when recycled from a pool
    pub fn reset(&mut self) {
        self.end_render_pass();
        self.state.reset();
    }

    /// End any open pass and hand back the encoder
    pub fn finish(mut self) -> E {
        self.end_render_pass();
        self.encoder
    }
}
