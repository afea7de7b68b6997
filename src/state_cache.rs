//! Per-context state cache
//!
//! Owns everything one command context has set since the encoder opened:
//! render targets, scalar raster state, the current pipeline object and one
//! binding table per shader stage. Setters compare against the cached value
//! and only flag real changes; the commit functions are the single place
//! cached state turns into encoder calls.
//!
//! ```text
//! Invalid ──begin──▶ Building ──commit_for_draw──▶ Committed
//!                      ▲                              │
//!                      └───────── any change ─────────┘
//!            Building / Committed ──end──▶ Ended ──begin──▶ Building
//! ```

use std::sync::Arc;

use bitflags::bitflags;
use smallvec::SmallVec;
use wgpu_types as wgt;

use crate::binding_table::ResourceBindingTable;
use crate::config::{DeviceCapabilities, StateCacheConfig};
use crate::encoder::CommandEncoder;
use crate::error::{fatal, Result, StateCacheError};
use crate::pipeline_cache::PipelineObject;
use crate::render_pass::{RenderPassState, RenderTargetsInfo};
use crate::resources::{BufferId, SamplerId, TextureId};
use crate::shader::ShaderStage;
use crate::state_objects::{
    DepthStencilStateObject, RasterizerState, ScissorRect, Viewport, VisibilityResultMode,
};

bitflags! {
    /// Raster state that differs from what the encoder last saw
    ///
    /// Declaration order is commit order. The pipeline goes after the
    /// depth/stencil state, which some drivers require.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RasterDirty: u32 {
        const VIEWPORT = 1 << 0;
        const FRONT_FACING = 1 << 1;
        const CULL_MODE = 1 << 2;
        const DEPTH_BIAS = 1 << 3;
        const SCISSOR = 1 << 4;
        const FILL_MODE = 1 << 5;
        const DEPTH_CLIP = 1 << 6;
        const BLEND_COLOR = 1 << 7;
        const DEPTH_STENCIL_STATE = 1 << 8;
        const STENCIL_REF = 1 << 9;
        const VISIBILITY = 1 << 10;
        const PIPELINE_STATE = 1 << 11;
    }
}

/// Where the current encoder is in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncoderPhase {
    /// No encoder yet, or the cache was reset
    #[default]
    Invalid,
    /// State being set since the last draw
    Building,
    /// State flushed and a draw issued
    Committed,
    Ended,
}

/// State cache of one command context
#[derive(Debug)]
pub struct StateCache {
    caps: DeviceCapabilities,
    config: StateCacheConfig,
    phase: EncoderPhase,
    render_pass: RenderPassState,
    tables: [ResourceBindingTable; ShaderStage::COUNT],

    viewports: SmallVec<[Viewport; 1]>,
    /// Empty means scissor test disabled
    scissors: SmallVec<[ScissorRect; 1]>,
    rasterizer: RasterizerState,
    blend_color: [f32; 4],
    depth_stencil_state: Option<Arc<DepthStencilStateObject>>,
    stencil_reference: u32,
    visibility: (VisibilityResultMode, u64),
    pipeline: Option<Arc<PipelineObject>>,

    raster_dirty: RasterDirty,
}

impl StateCache {
    pub fn new(caps: DeviceCapabilities, config: StateCacheConfig) -> Self {
        Self {
            caps,
            config,
            phase: EncoderPhase::Invalid,
            render_pass: RenderPassState::new(caps),
            tables: ShaderStage::ALL.map(ResourceBindingTable::new),
            viewports: SmallVec::new(),
            scissors: SmallVec::new(),
            rasterizer: RasterizerState::default(),
            blend_color: [0.0; 4],
            depth_stencil_state: None,
            stencil_reference: 0,
            visibility: (VisibilityResultMode::Disabled, 0),
            pipeline: None,
            raster_dirty: RasterDirty::all(),
        }
    }

    /// Drop every binding and cached value and mark all state dirty
    pub fn reset(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
        self.render_pass.reset();
        self.viewports.clear();
        self.scissors.clear();
        self.rasterizer = RasterizerState::default();
        self.blend_color = [0.0; 4];
        self.depth_stencil_state = None;
        self.stencil_reference = 0;
        self.visibility = (VisibilityResultMode::Disabled, 0);
        self.pipeline = None;
        self.raster_dirty = RasterDirty::all();
        self.phase = EncoderPhase::Invalid;
        log::trace!("State cache reset");
    }

    fn mark(&mut self, flags: RasterDirty) {
        self.raster_dirty |= flags;
        if self.phase == EncoderPhase::Committed {
            self.phase = EncoderPhase::Building;
        }
    }

    // === Render targets ===

    /// See [`RenderPassState::set_render_targets`]
    pub fn set_render_targets(&mut self, info: RenderTargetsInfo) -> Result<bool> {
        self.render_pass.set_render_targets(info)
    }

    pub fn render_pass(&self) -> &RenderPassState {
        &self.render_pass
    }

    pub fn render_pass_mut(&mut self) -> &mut RenderPassState {
        &mut self.render_pass
    }

    // === Raster state ===

    pub fn set_viewport(&mut self, viewport: Viewport) -> bool {
        self.set_viewports(&[viewport])
    }

    /// Set one viewport per output. Devices without multiple viewports keep the first.
    pub fn set_viewports(&mut self, viewports: &[Viewport]) -> bool {
        if viewports.is_empty() {
            return false;
        }
        let limit = self.caps.viewport_limit();
        if viewports.len() > limit {
            log::debug!(
                "{} viewports requested, device honours {}",
                viewports.len(),
                limit
            );
        }
        let viewports = &viewports[..viewports.len().min(limit)];
        if self.viewports.as_slice() == viewports {
            return false;
        }
        self.viewports = SmallVec::from_slice(viewports);
        self.mark(RasterDirty::VIEWPORT);
        true
    }

    /// `None` disables the scissor test
    pub fn set_scissor(&mut self, rect: Option<ScissorRect>) -> bool {
        match rect {
            Some(rect) => self.set_scissor_rects(&[rect]),
            None => self.set_scissor_rects(&[]),
        }
    }

    /// Empty disables the scissor test
    pub fn set_scissor_rects(&mut self, rects: &[ScissorRect]) -> bool {
        let rects = &rects[..rects.len().min(self.caps.viewport_limit())];
        if self.scissors.as_slice() == rects {
            return false;
        }
        self.scissors = SmallVec::from_slice(rects);
        self.mark(RasterDirty::SCISSOR);
        true
    }

    /// Set the rasterizer state object, dirtying only the parts that changed
    pub fn set_rasterizer_state(&mut self, state: &RasterizerState) -> bool {
        let current = self.rasterizer;
        let mut changed = RasterDirty::empty();
        if state.front_face != current.front_face {
            changed |= RasterDirty::FRONT_FACING;
        }
        if state.cull_mode != current.cull_mode {
            changed |= RasterDirty::CULL_MODE;
        }
        if state.depth_bias != current.depth_bias {
            changed |= RasterDirty::DEPTH_BIAS;
        }
        if state.fill_mode != current.fill_mode {
            changed |= RasterDirty::FILL_MODE;
        }
        if state.depth_clip != current.depth_clip {
            changed |= RasterDirty::DEPTH_CLIP;
        }
        if changed.is_empty() {
            return false;
        }
        self.rasterizer = *state;
        self.mark(changed);
        true
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) -> bool {
        if self.blend_color == color {
            return false;
        }
        self.blend_color = color;
        self.mark(RasterDirty::BLEND_COLOR);
        true
    }

    pub fn set_depth_stencil_state(&mut self, state: Arc<DepthStencilStateObject>) -> bool {
        if self.depth_stencil_state.as_ref().map(|s| s.id) == Some(state.id) {
            return false;
        }
        self.depth_stencil_state = Some(state);
        self.mark(RasterDirty::DEPTH_STENCIL_STATE);
        true
    }

    pub fn set_stencil_reference(&mut self, reference: u32) -> bool {
        if self.stencil_reference == reference {
            return false;
        }
        self.stencil_reference = reference;
        self.mark(RasterDirty::STENCIL_REF);
        true
    }

    pub fn set_visibility_result_mode(&mut self, mode: VisibilityResultMode, offset: u64) -> bool {
        if self.visibility == (mode, offset) {
            return false;
        }
        self.visibility = (mode, offset);
        self.mark(RasterDirty::VISIBILITY);
        true
    }

    /// Switch the pipeline object.
    ///
    /// Toggling tessellation changes what the vertex, hull and domain slots
    /// mean, so those tables are re-signalled in full.
    pub fn set_pipeline(&mut self, pipeline: Arc<PipelineObject>) -> bool {
        let was_tessellated = match &self.pipeline {
            Some(current) if Arc::ptr_eq(current, &pipeline) => return false,
            Some(current) => current.is_tessellated(),
            None => false,
        };
        if was_tessellated != pipeline.is_tessellated() {
            log::debug!(
                "Tessellation {} with '{}', invalidating vertex stage bindings",
                if pipeline.is_tessellated() { "enabled" } else { "disabled" },
                pipeline.label()
            );
            for stage in ShaderStage::TESSELLATION_SENSITIVE {
                self.tables[stage.index()].mark_all_dirty();
            }
        }
        self.pipeline = Some(pipeline);
        self.mark(RasterDirty::PIPELINE_STATE);
        true
    }

    pub fn pipeline(&self) -> Option<&Arc<PipelineObject>> {
        self.pipeline.as_ref()
    }

    // === Resource bindings ===

    pub fn set_buffer(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        buffer: Option<BufferId>,
        offset: u64,
        length: u64,
        format_hint: Option<wgt::TextureFormat>,
    ) -> bool {
        let changed = self.tables[stage.index()].set_buffer(slot, buffer, offset, length, format_hint);
        self.touch(changed)
    }

    pub fn set_bytes(&mut self, stage: ShaderStage, slot: usize, bytes: &[u8]) -> bool {
        let changed = self.tables[stage.index()].set_bytes(slot, bytes);
        self.touch(changed)
    }

    pub fn set_texture(&mut self, stage: ShaderStage, slot: usize, texture: Option<TextureId>) -> bool {
        let changed = self.tables[stage.index()].set_texture(slot, texture);
        self.touch(changed)
    }

    pub fn set_sampler(&mut self, stage: ShaderStage, slot: usize, sampler: Option<SamplerId>) -> bool {
        let changed = self.tables[stage.index()].set_sampler(slot, sampler);
        self.touch(changed)
    }

    fn touch(&mut self, changed: bool) -> bool {
        if changed && self.phase == EncoderPhase::Committed {
            self.phase = EncoderPhase::Building;
        }
        changed
    }

    pub fn table(&self, stage: ShaderStage) -> &ResourceBindingTable {
        &self.tables[stage.index()]
    }

    // === Encoder lifetime ===

    /// A fresh encoder has no state: everything cached must be sent again.
    ///
    /// `new_pass` is false when the encoder continues a pass that was broken
    /// off; the caller's viewport and scissor then carry over unchanged.
    pub fn on_encoder_begin(&mut self, new_pass: bool) {
        if new_pass && self.config.reset_viewport_on_new_pass {
            let (width, height) = self.render_pass.extent();
            self.viewports = SmallVec::from_slice(&[Viewport::full(width, height)]);
            self.scissors.clear();
        }
        self.raster_dirty = RasterDirty::all();
        for table in &mut self.tables {
            table.mark_all_dirty();
        }
        self.phase = EncoderPhase::Building;
    }

    pub fn on_encoder_end(&mut self) {
        self.phase = EncoderPhase::Ended;
    }

    pub fn phase(&self) -> EncoderPhase {
        self.phase
    }

    pub fn raster_dirty(&self) -> RasterDirty {
        self.raster_dirty
    }

    // === Commit ===

    /// Emit every dirty piece of raster state in commit order, then clear the
    /// dirty set. Returns the number of encoder calls made.
    pub fn commit_render_state(&mut self, encoder: &mut dyn CommandEncoder) -> usize {
        let dirty = self.raster_dirty;
        let mut emitted = 0;
        let rasterizer = self.rasterizer;

        if dirty.contains(RasterDirty::VIEWPORT) {
            encoder.set_viewports(&self.effective_viewports());
            emitted += 1;
        }
        if dirty.contains(RasterDirty::FRONT_FACING) {
            encoder.set_front_facing(rasterizer.front_face);
            emitted += 1;
        }
        if dirty.contains(RasterDirty::CULL_MODE) {
            encoder.set_cull_mode(rasterizer.cull_mode);
            emitted += 1;
        }
        if dirty.contains(RasterDirty::DEPTH_BIAS) {
            encoder.set_depth_bias(rasterizer.depth_bias);
            emitted += 1;
        }
        if dirty.contains(RasterDirty::SCISSOR) {
            encoder.set_scissor_rects(&self.effective_scissors());
            emitted += 1;
        }
        if dirty.contains(RasterDirty::FILL_MODE) {
            encoder.set_triangle_fill_mode(rasterizer.fill_mode);
            emitted += 1;
        }
        if dirty.contains(RasterDirty::DEPTH_CLIP) {
            encoder.set_depth_clip_mode(rasterizer.depth_clip);
            emitted += 1;
        }
        if dirty.contains(RasterDirty::BLEND_COLOR) {
            encoder.set_blend_color(self.blend_color);
            emitted += 1;
        }
        if let (true, Some(state)) = (
            dirty.contains(RasterDirty::DEPTH_STENCIL_STATE),
            &self.depth_stencil_state,
        ) {
            encoder.set_depth_stencil_state(state.id);
            emitted += 1;
        }
        if dirty.contains(RasterDirty::STENCIL_REF) {
            encoder.set_stencil_reference(self.stencil_reference);
            emitted += 1;
        }
        if dirty.contains(RasterDirty::VISIBILITY) {
            encoder.set_visibility_result_mode(self.visibility.0, self.visibility.1);
            emitted += 1;
        }
        if let (true, Some(pipeline)) = (dirty.contains(RasterDirty::PIPELINE_STATE), &self.pipeline) {
            encoder.set_render_pipeline_state(pipeline.native());
            emitted += 1;
        }

        self.raster_dirty = RasterDirty::empty();
        emitted
    }

    /// Emit the dirty bindings of one stage
    pub fn commit_resource_table(&mut self, stage: ShaderStage, encoder: &mut dyn CommandEncoder) -> usize {
        self.tables[stage.index()].commit_dirty(encoder)
    }

    /// Flush everything a draw needs: raster state first, then the binding
    /// tables of the stages the pipeline runs.
    ///
    /// Drawing without a pipeline, or with one that doesn't match the render
    /// targets, is fatal.
    pub fn commit_for_draw(&mut self, encoder: &mut dyn CommandEncoder) -> usize {
        debug_assert!(
            matches!(self.phase, EncoderPhase::Building | EncoderPhase::Committed),
            "draw outside an open encoder ({:?})",
            self.phase
        );
        let Some(pipeline) = self.pipeline.clone() else {
            fatal(StateCacheError::MissingPipeline);
        };
        if self.config.validate_draws {
            self.validate_draw(&pipeline);
        }

        let mut emitted = self.commit_render_state(encoder);
        emitted += self.commit_resource_table(ShaderStage::Vertex, encoder);
        if pipeline.is_tessellated() {
            emitted += self.commit_resource_table(ShaderStage::Hull, encoder);
            emitted += self.commit_resource_table(ShaderStage::Domain, encoder);
        }
        emitted += self.commit_resource_table(ShaderStage::Fragment, encoder);
        self.phase = EncoderPhase::Committed;
        emitted
    }

    fn validate_draw(&self, pipeline: &PipelineObject) {
        let reflection = pipeline.reflection();
        let samples = self.render_pass.sample_count();
        if reflection.sample_count != samples {
            fatal(StateCacheError::SampleCountMismatch {
                expected: samples,
                found: reflection.sample_count,
                attachment: format!("pipeline '{}'", pipeline.label()),
            });
        }
        if reflection.requires_depth_attachment() && !self.render_pass.has_depth() {
            fatal(StateCacheError::invalid_parameter(
                "depth_attachment",
                format!("pipeline '{}' needs a depth attachment but none is bound", pipeline.label()),
            ));
        }
        let Some(targets) = self.render_pass.current() else {
            return;
        };

        // Slots the pipeline leaves empty may still have a target bound
        for (index, expected) in reflection.color_formats.iter().enumerate() {
            let Some(expected) = *expected else {
                continue;
            };
            let bound = targets
                .color_targets
                .get(index)
                .and_then(|t| t.as_ref())
                .map(|t| t.texture.format);
            check_format(pipeline, || format!("color[{}]", index), expected, bound);
        }
        if let Some(expected) = reflection.depth_format {
            let bound = targets
                .depth_stencil
                .filter(|d| d.uses_depth())
                .map(|d| d.texture.format);
            check_format(pipeline, || "depth".to_string(), expected, bound);
        }
        if let Some(expected) = reflection.stencil_format {
            let bound = targets
                .depth_stencil
                .filter(|d| d.uses_stencil())
                .map(|d| d.stencil_surface().format);
            check_format(pipeline, || "stencil".to_string(), expected, bound);
        }
    }

    fn effective_viewports(&self) -> SmallVec<[Viewport; 1]> {
        if self.viewports.is_empty() {
            let (width, height) = self.render_pass.extent();
            return SmallVec::from_slice(&[Viewport::full(width, height)]);
        }
        self.viewports.clone()
    }

    /// One rect per viewport, clamped to the render-target extent
    fn effective_scissors(&self) -> SmallVec<[ScissorRect; 1]> {
        let (width, height) = self.render_pass.extent();
        let count = self.viewports.len().max(1);
        (0..count)
            .map(|i| match self.scissors.get(i).or(self.scissors.first()) {
                Some(rect) => rect.clamped(width, height),
                None => ScissorRect::full(width, height),
            })
            .collect()
    }
}

fn check_format(
    pipeline: &PipelineObject,
    attachment: impl FnOnce() -> String,
    expected: wgt::TextureFormat,
    bound: Option<wgt::TextureFormat>,
) {
    if bound != Some(expected) {
        fatal(StateCacheError::AttachmentFormatMismatch {
            pipeline: pipeline.label().to_string(),
            attachment: attachment(),
            expected: format!("{:?}", expected),
            found: bound.map_or_else(|| "nothing".to_string(), |f| format!("{:?}", f)),
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::encoder::{CommandRecorder, EncoderCommand};
    use crate::pipeline_descriptor::PipelineReflection;
    use crate::render_pass::tests::{color_texture, depth_texture};
    use crate::render_pass::{ColorTarget, DepthStencilAccess, DepthStencilTarget};
    use crate::resources::{DepthStencilStateId, NativePipelineId};
    use crate::state_key::{PipelineKey, MAX_COLOR_TARGETS};
    use crate::state_objects::DepthStencilDesc;

    pub(crate) fn pipeline(raw: u64, tessellated: bool) -> Arc<PipelineObject> {
        let reflection = PipelineReflection {
            tessellated,
            sample_count: 1,
            ..PipelineReflection::default()
        };
        Arc::new(PipelineObject::new(
            PipelineKey::default(),
            NativePipelineId::new(raw).unwrap(),
            reflection,
            format!("pipeline {}", raw),
        ))
    }

    fn open_cache(caps: DeviceCapabilities) -> StateCache {
        let mut cache = StateCache::new(caps, StateCacheConfig::default());
        cache
            .set_render_targets(RenderTargetsInfo::new().with_color(ColorTarget::new(color_texture(1))))
            .unwrap();
        cache.on_encoder_begin(true);
        cache
    }

    fn flushed(caps: DeviceCapabilities) -> StateCache {
        let mut cache = open_cache(caps);
        cache.set_pipeline(pipeline(1, false));
        cache.commit_for_draw(&mut CommandRecorder::new());
        cache
    }

    #[test]
    fn test_setters_only_dirty_on_change() {
        let mut cache = flushed(DeviceCapabilities::tile_gpu());
        assert!(cache.raster_dirty().is_empty());

        assert!(cache.set_stencil_reference(7));
        assert!(!cache.set_stencil_reference(7));
        assert_eq!(cache.raster_dirty(), RasterDirty::STENCIL_REF);

        let mut encoder = CommandRecorder::new();
        assert_eq!(cache.commit_render_state(&mut encoder), 1);
        assert!(!cache.set_stencil_reference(7));
        assert!(cache.raster_dirty().is_empty());
        assert!(!cache.set_blend_color([0.0; 4]));
    }

    #[test]
    fn test_resource_setters_reopen_committed_phase() {
        let stage = ShaderStage::Fragment;
        let mut cache = flushed(DeviceCapabilities::tile_gpu());
        assert_eq!(cache.phase(), EncoderPhase::Committed);
        assert!(!cache.set_texture(stage, 0, None));
        assert_eq!(cache.phase(), EncoderPhase::Committed);

        assert!(cache.set_buffer(stage, 0, BufferId::new(1), 0, 64, None));
        assert!(cache.set_bytes(stage, 1, &[1, 2, 3, 4]));
        assert!(cache.set_texture(stage, 0, TextureId::new(2)));
        assert!(cache.set_sampler(stage, 0, SamplerId::new(3)));
        assert!(!cache.set_sampler(stage, 0, SamplerId::new(3)));
        assert_eq!(cache.phase(), EncoderPhase::Building);
        assert_eq!(cache.table(stage).bound_textures(), 1);
    }

    #[test]
    fn test_rasterizer_dirties_only_changed_parts() {
        let mut cache = flushed(DeviceCapabilities::tile_gpu());
        let mut state = RasterizerState::default();
        assert!(!cache.set_rasterizer_state(&state));

        state.cull_mode = Some(wgt::Face::Back);
        assert!(cache.set_rasterizer_state(&state));
        assert_eq!(cache.raster_dirty(), RasterDirty::CULL_MODE);

        let mut encoder = CommandRecorder::new();
        cache.commit_render_state(&mut encoder);
        assert_eq!(encoder.commands(), &[EncoderCommand::SetCullMode(Some(wgt::Face::Back))]);
    }

    #[test]
    fn test_commit_order_puts_pipeline_after_depth_stencil() {
        let mut cache = flushed(DeviceCapabilities::tile_gpu());
        cache.set_pipeline(pipeline(2, false));
        cache.set_depth_stencil_state(Arc::new(DepthStencilStateObject {
            id: DepthStencilStateId::new(5).unwrap(),
            desc: DepthStencilDesc::default(),
        }));
        cache.set_blend_color([1.0; 4]);
        cache.set_viewport(Viewport::full(64, 64));

        let mut encoder = CommandRecorder::new();
        assert_eq!(cache.commit_render_state(&mut encoder), 4);
        let commands = encoder.commands();
        assert!(matches!(commands[0], EncoderCommand::SetViewports(_)));
        assert!(matches!(commands[1], EncoderCommand::SetBlendColor(_)));
        assert!(matches!(commands[2], EncoderCommand::SetDepthStencilState(_)));
        assert!(matches!(commands[3], EncoderCommand::SetRenderPipelineState(_)));
        assert!(cache.raster_dirty().is_empty());
    }

    #[test]
    fn test_tessellation_toggle_invalidates_vertex_stages() {
        let mut cache = flushed(DeviceCapabilities::tile_gpu());
        cache.set_buffer(ShaderStage::Vertex, 0, BufferId::new(1), 0, 64, None);
        cache.set_texture(ShaderStage::Fragment, 0, TextureId::new(2));
        cache.commit_for_draw(&mut CommandRecorder::new());
        assert!(!cache.table(ShaderStage::Vertex).is_dirty());

        cache.set_pipeline(pipeline(3, true));
        assert_eq!(cache.table(ShaderStage::Vertex).dirty_buffers(), 1);
        assert!(!cache.table(ShaderStage::Fragment).is_dirty());

        // Same tessellation mode: nothing re-signalled
        cache.commit_for_draw(&mut CommandRecorder::new());
        cache.set_pipeline(pipeline(4, true));
        assert!(!cache.table(ShaderStage::Vertex).is_dirty());
    }

    #[test]
    fn test_viewports_fall_back_to_first() {
        let mut cache = open_cache(DeviceCapabilities::immediate_gpu());
        let viewports = [Viewport::full(10, 10), Viewport::full(20, 20)];
        cache.set_viewports(&viewports);
        cache.set_pipeline(pipeline(1, false));
        let mut encoder = CommandRecorder::new();
        cache.commit_for_draw(&mut encoder);
        let sent = encoder.commands().iter().find_map(|c| match c {
            EncoderCommand::SetViewports(v) => Some(v.clone()),
            _ => None,
        });
        assert_eq!(sent.unwrap().as_slice(), &[Viewport::full(10, 10)]);
    }

    #[test]
    fn test_scissor_clamped_to_targets() {
        let mut cache = open_cache(DeviceCapabilities::tile_gpu());
        cache.set_scissor(Some(ScissorRect {
            x: 700,
            y: 0,
            width: 500,
            height: 100,
        }));
        cache.set_pipeline(pipeline(1, false));
        let mut encoder = CommandRecorder::new();
        cache.commit_for_draw(&mut encoder);
        let sent = encoder.commands().iter().find_map(|c| match c {
            EncoderCommand::SetScissorRects(r) => Some(r[0]),
            _ => None,
        });
        assert_eq!(
            sent,
            Some(ScissorRect {
                x: 700,
                y: 0,
                width: 100,
                height: 100
            })
        );
    }

    #[test]
    fn test_encoder_begin_resends_everything() {
        let mut cache = flushed(DeviceCapabilities::tile_gpu());
        cache.set_sampler(ShaderStage::Fragment, 1, SamplerId::new(4));
        cache.commit_for_draw(&mut CommandRecorder::new());
        cache.on_encoder_end();
        assert_eq!(cache.phase(), EncoderPhase::Ended);

        cache.on_encoder_begin(true);
        assert_eq!(cache.phase(), EncoderPhase::Building);
        assert_eq!(cache.raster_dirty(), RasterDirty::all());
        assert_eq!(cache.table(ShaderStage::Fragment).dirty_samplers(), 1 << 1);
    }

    #[test]
    fn test_continued_encoder_keeps_viewport_and_scissor() {
        let mut cache = flushed(DeviceCapabilities::immediate_gpu());
        let custom = Viewport {
            x: 10.0,
            y: 10.0,
            width: 100.0,
            height: 100.0,
            ..Viewport::full(800, 600)
        };
        let rect = ScissorRect {
            x: 5,
            y: 5,
            width: 50,
            height: 50,
        };
        cache.set_viewport(custom);
        cache.set_scissor(Some(rect));
        cache.on_encoder_end();

        cache.on_encoder_begin(false);
        let mut encoder = CommandRecorder::new();
        cache.commit_render_state(&mut encoder);
        assert!(encoder
            .commands()
            .contains(&EncoderCommand::SetViewports(SmallVec::from_slice(&[custom]))));
        assert!(encoder
            .commands()
            .contains(&EncoderCommand::SetScissorRects(SmallVec::from_slice(&[rect]))));

        // A new pass starts from the full extent again
        cache.on_encoder_end();
        cache.on_encoder_begin(true);
        let mut encoder = CommandRecorder::new();
        cache.commit_render_state(&mut encoder);
        assert!(encoder.commands().contains(&EncoderCommand::SetViewports(SmallVec::from_slice(&[
            Viewport::full(800, 600)
        ]))));
    }

    #[test]
    fn test_phase_transitions() {
        let mut cache = StateCache::new(DeviceCapabilities::tile_gpu(), StateCacheConfig::default());
        assert_eq!(cache.phase(), EncoderPhase::Invalid);
        let mut cache2 = flushed(DeviceCapabilities::tile_gpu());
        assert_eq!(cache2.phase(), EncoderPhase::Committed);
        cache2.set_texture(ShaderStage::Fragment, 0, TextureId::new(9));
        assert_eq!(cache2.phase(), EncoderPhase::Building);
        cache.set_stencil_reference(1);
        assert_eq!(cache.phase(), EncoderPhase::Invalid);
    }

    #[test]
    fn test_reset_clears_bindings() {
        let mut cache = flushed(DeviceCapabilities::tile_gpu());
        cache.set_texture(ShaderStage::Fragment, 5, TextureId::new(1));
        cache.reset();
        assert_eq!(cache.table(ShaderStage::Fragment).bound_textures(), 0);
        assert!(cache.pipeline().is_none());
        assert!(cache.render_pass().current().is_none());
        assert_eq!(cache.raster_dirty(), RasterDirty::all());
        assert_eq!(cache.phase(), EncoderPhase::Invalid);
    }

    #[test]
    #[should_panic(expected = "No pipeline object set before draw")]
    fn test_draw_without_pipeline_is_fatal() {
        let mut cache = open_cache(DeviceCapabilities::tile_gpu());
        cache.commit_for_draw(&mut CommandRecorder::new());
    }

    fn pipeline_with(reflection: PipelineReflection) -> Arc<PipelineObject> {
        Arc::new(PipelineObject::new(
            PipelineKey::default(),
            NativePipelineId::new(2).unwrap(),
            PipelineReflection {
                sample_count: 1,
                ..reflection
            },
            "formats",
        ))
    }

    fn validating_cache(targets: RenderTargetsInfo) -> StateCache {
        let config = StateCacheConfig {
            validate_draws: true,
            ..StateCacheConfig::default()
        };
        let mut cache = StateCache::new(DeviceCapabilities::tile_gpu(), config);
        cache.set_render_targets(targets).unwrap();
        cache.on_encoder_begin(true);
        cache
    }

    #[test]
    fn test_matching_formats_draw() {
        let mut color_formats = [None; MAX_COLOR_TARGETS];
        color_formats[0] = Some(wgt::TextureFormat::Bgra8Unorm);
        let mut cache = validating_cache(
            RenderTargetsInfo::new()
                .with_color(ColorTarget::new(color_texture(1)))
                .with_color(ColorTarget::new(color_texture(2)))
                .with_depth_stencil(DepthStencilTarget::new(depth_texture(
                    3,
                    wgt::TextureFormat::Depth32Float,
                ))),
        );
        // Slot 1 is bound but unused by the pipeline
        cache.set_pipeline(pipeline_with(PipelineReflection {
            color_formats,
            depth_format: Some(wgt::TextureFormat::Depth32Float),
            ..PipelineReflection::default()
        }));
        cache.commit_for_draw(&mut CommandRecorder::new());
        assert_eq!(cache.phase(), EncoderPhase::Committed);
    }

    #[test]
    #[should_panic(expected = "Attachment format mismatch")]
    fn test_color_format_mismatch_is_fatal() {
        let mut color_formats = [None; MAX_COLOR_TARGETS];
        color_formats[0] = Some(wgt::TextureFormat::Rgba16Float);
        let mut cache =
            validating_cache(RenderTargetsInfo::new().with_color(ColorTarget::new(color_texture(1))));
        cache.set_pipeline(pipeline_with(PipelineReflection {
            color_formats,
            ..PipelineReflection::default()
        }));
        cache.commit_for_draw(&mut CommandRecorder::new());
    }

    #[test]
    #[should_panic(expected = "Attachment format mismatch")]
    fn test_missing_color_target_is_fatal() {
        let mut color_formats = [None; MAX_COLOR_TARGETS];
        color_formats[1] = Some(wgt::TextureFormat::Bgra8Unorm);
        let mut cache =
            validating_cache(RenderTargetsInfo::new().with_color(ColorTarget::new(color_texture(1))));
        cache.set_pipeline(pipeline_with(PipelineReflection {
            color_formats,
            ..PipelineReflection::default()
        }));
        cache.commit_for_draw(&mut CommandRecorder::new());
    }

    #[test]
    #[should_panic(expected = "Attachment format mismatch")]
    fn test_depth_format_mismatch_is_fatal() {
        let mut cache = validating_cache(
            RenderTargetsInfo::new()
                .with_color(ColorTarget::new(color_texture(1)))
                .with_depth_stencil(
                    DepthStencilTarget::new(depth_texture(3, wgt::TextureFormat::Depth32FloatStencil8))
                        .with_access(DepthStencilAccess::DEPTH_WRITE),
                ),
        );
        cache.set_pipeline(pipeline_with(PipelineReflection {
            depth_format: Some(wgt::TextureFormat::Depth32Float),
            ..PipelineReflection::default()
        }));
        cache.commit_for_draw(&mut CommandRecorder::new());
    }

    #[test]
    #[should_panic(expected = "Attachment format mismatch")]
    fn test_missing_stencil_is_fatal() {
        let mut cache = validating_cache(
            RenderTargetsInfo::new()
                .with_color(ColorTarget::new(color_texture(1)))
                .with_depth_stencil(
                    DepthStencilTarget::new(depth_texture(3, wgt::TextureFormat::Depth24PlusStencil8))
                        .with_access(DepthStencilAccess::DEPTH_WRITE),
                ),
        );
        cache.set_pipeline(pipeline_with(PipelineReflection {
            depth_format: Some(wgt::TextureFormat::Depth24PlusStencil8),
            stencil_format: Some(wgt::TextureFormat::Depth24PlusStencil8),
            ..PipelineReflection::default()
        }));
        cache.commit_for_draw(&mut CommandRecorder::new());
    }

    #[test]
    #[should_panic(expected = "Sample count mismatch")]
    fn test_pipeline_sample_mismatch_is_fatal() {
        let mut config = StateCacheConfig::default();
        config.validate_draws = true;
        let mut cache = StateCache::new(DeviceCapabilities::tile_gpu(), config);
        cache
            .set_render_targets(
                RenderTargetsInfo::new()
                    .with_color(ColorTarget::new(color_texture(1).with_samples(4))),
            )
            .unwrap();
        cache.on_encoder_begin(true);
        cache.set_pipeline(pipeline(1, false));
        cache.commit_for_draw(&mut CommandRecorder::new());
    }
}
