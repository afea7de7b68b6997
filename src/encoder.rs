//! Backend command encoder interface
//!
//! [`CommandEncoder`] is the outbound boundary: every call the state cache
//! makes against the GPU goes through it. [`CommandRecorder`] implements it by
//! recording [`EncoderCommand`]s, which serves both deferred recording (the
//! commands are replayed later onto the real encoder on another thread) and
//! tests that need to count emitted calls.

use smallvec::SmallVec;
use wgpu_types as wgt;

use crate::render_pass::{RenderPassDescriptor, StoreAction};
use crate::resources::{BufferId, DepthStencilStateId, NativePipelineId, SamplerId, TextureId};
use crate::shader::ShaderStage;
use crate::state_objects::{DepthBias, DepthClipMode, ScissorRect, Viewport, VisibilityResultMode};

/// Calls the state cache issues against a backend render command encoder
pub trait CommandEncoder {
    fn begin_render_pass(&mut self, descriptor: &RenderPassDescriptor);
    fn end_encoding(&mut self);

    /// Only called on devices with deferred store actions
    fn set_color_store_action(&mut self, index: usize, action: StoreAction);
    fn set_depth_store_action(&mut self, action: StoreAction);
    fn set_stencil_store_action(&mut self, action: StoreAction);

    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_scissor_rects(&mut self, rects: &[ScissorRect]);
    fn set_front_facing(&mut self, front_face: wgt::FrontFace);
    fn set_cull_mode(&mut self, cull_mode: Option<wgt::Face>);
    fn set_depth_bias(&mut self, bias: DepthBias);
    fn set_triangle_fill_mode(&mut self, fill_mode: wgt::PolygonMode);
    fn set_depth_clip_mode(&mut self, mode: DepthClipMode);
    fn set_blend_color(&mut self, color: [f32; 4]);
    fn set_depth_stencil_state(&mut self, state: DepthStencilStateId);
    fn set_stencil_reference(&mut self, reference: u32);
    fn set_visibility_result_mode(&mut self, mode: VisibilityResultMode, offset: u64);
    fn set_render_pipeline_state(&mut self, pipeline: NativePipelineId);

    fn set_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: BufferId, offset: u64);
    fn set_bytes(&mut self, stage: ShaderStage, slot: u32, bytes: &[u8]);
    fn set_texture(&mut self, stage: ShaderStage, slot: u32, texture: TextureId);
    fn set_sampler(&mut self, stage: ShaderStage, slot: u32, sampler: SamplerId);

    fn draw(
        &mut self,
        topology: wgt::PrimitiveTopology,
        first_vertex: u32,
        vertex_count: u32,
        instance_count: u32,
        first_instance: u32,
    );

    #[allow(clippy::too_many_arguments)]
    fn draw_indexed(
        &mut self,
        topology: wgt::PrimitiveTopology,
        index_buffer: BufferId,
        index_format: wgt::IndexFormat,
        index_offset: u64,
        index_count: u32,
        instance_count: u32,
        base_vertex: i32,
        first_instance: u32,
    );
}

/// One recorded encoder call
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderCommand {
    BeginRenderPass(RenderPassDescriptor),
    EndEncoding,
    SetColorStoreAction {
        index: usize,
        action: StoreAction,
    },
    SetDepthStoreAction(StoreAction),
    SetStencilStoreAction(StoreAction),
    SetViewports(SmallVec<[Viewport; 1]>),
    SetScissorRects(SmallVec<[ScissorRect; 1]>),
    SetFrontFacing(wgt::FrontFace),
    SetCullMode(Option<wgt::Face>),
    SetDepthBias(DepthBias),
    SetTriangleFillMode(wgt::PolygonMode),
    SetDepthClipMode(DepthClipMode),
    SetBlendColor([f32; 4]),
    SetDepthStencilState(DepthStencilStateId),
    SetStencilReference(u32),
    SetVisibilityResultMode {
        mode: VisibilityResultMode,
        offset: u64,
    },
    SetRenderPipelineState(NativePipelineId),
    SetBuffer {
        stage: ShaderStage,
        slot: u32,
        buffer: BufferId,
        offset: u64,
    },
    SetBytes {
        stage: ShaderStage,
        slot: u32,
        bytes: Vec<u8>,
    },
    SetTexture {
        stage: ShaderStage,
        slot: u32,
        texture: TextureId,
    },
    SetSampler {
        stage: ShaderStage,
        slot: u32,
        sampler: SamplerId,
    },
    Draw {
        topology: wgt::PrimitiveTopology,
        first_vertex: u32,
        vertex_count: u32,
        instance_count: u32,
        first_instance: u32,
    },
    DrawIndexed {
        topology: wgt::PrimitiveTopology,
        index_buffer: BufferId,
        index_format: wgt::IndexFormat,
        index_offset: u64,
        index_count: u32,
        instance_count: u32,
        base_vertex: i32,
        first_instance: u32,
    },
}

impl EncoderCommand {
    /// Resource bind calls (buffer, bytes, texture, sampler)
    pub fn is_binding(&self) -> bool {
        matches!(
            self,
            EncoderCommand::SetBuffer { .. }
                | EncoderCommand::SetBytes { .. }
                | EncoderCommand::SetTexture { .. }
                | EncoderCommand::SetSampler { .. }
        )
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, EncoderCommand::Draw { .. } | EncoderCommand::DrawIndexed { .. })
    }

    /// Issue this command against `encoder`
    pub fn apply(&self, encoder: &mut dyn CommandEncoder) {
        match self {
            EncoderCommand::BeginRenderPass(desc) => encoder.begin_render_pass(desc),
            EncoderCommand::EndEncoding => encoder.end_encoding(),
            EncoderCommand::SetColorStoreAction { index, action } => {
                encoder.set_color_store_action(*index, *action)
            }
            EncoderCommand::SetDepthStoreAction(action) => encoder.set_depth_store_action(*action),
            EncoderCommand::SetStencilStoreAction(action) => {
                encoder.set_stencil_store_action(*action)
            }
            EncoderCommand::SetViewports(viewports) => encoder.set_viewports(viewports),
            EncoderCommand::SetScissorRects(rects) => encoder.set_scissor_rects(rects),
            EncoderCommand::SetFrontFacing(face) => encoder.set_front_facing(*face),
            EncoderCommand::SetCullMode(mode) => encoder.set_cull_mode(*mode),
            EncoderCommand::SetDepthBias(bias) => encoder.set_depth_bias(*bias),
            EncoderCommand::SetTriangleFillMode(mode) => encoder.set_triangle_fill_mode(*mode),
            EncoderCommand::SetDepthClipMode(mode) => encoder.set_depth_clip_mode(*mode),
            EncoderCommand::SetBlendColor(color) => encoder.set_blend_color(*color),
            EncoderCommand::SetDepthStencilState(state) => encoder.set_depth_stencil_state(*state),
            EncoderCommand::SetStencilReference(reference) => {
                encoder.set_stencil_reference(*reference)
            }
            EncoderCommand::SetVisibilityResultMode { mode, offset } => {
                encoder.set_visibility_result_mode(*mode, *offset)
            }
            EncoderCommand::SetRenderPipelineState(pipeline) => {
                encoder.set_render_pipeline_state(*pipeline)
            }
            EncoderCommand::SetBuffer {
                stage,
                slot,
                buffer,
                offset,
            } => encoder.set_buffer(*stage, *slot, *buffer, *offset),
            EncoderCommand::SetBytes { stage, slot, bytes } => {
                encoder.set_bytes(*stage, *slot, bytes)
            }
            EncoderCommand::SetTexture {
                stage,
                slot,
                texture,
            } => encoder.set_texture(*stage, *slot, *texture),
            EncoderCommand::SetSampler {
                stage,
                slot,
                sampler,
            } => encoder.set_sampler(*stage, *slot, *sampler),
            EncoderCommand::Draw {
                topology,
                first_vertex,
                vertex_count,
                instance_count,
                first_instance,
            } => encoder.draw(
                *topology,
                *first_vertex,
                *vertex_count,
                *instance_count,
                *first_instance,
            ),
            EncoderCommand::DrawIndexed {
                topology,
                index_buffer,
                index_format,
                index_offset,
                index_count,
                instance_count,
                base_vertex,
                first_instance,
            } => encoder.draw_indexed(
                *topology,
                *index_buffer,
                *index_format,
                *index_offset,
                *index_count,
                *instance_count,
                *base_vertex,
                *first_instance,
            ),
        }
    }
}

/// Encoder that records commands for later replay
///
/// Recording is how a context works when command recording is deferred to a
/// replay thread; the recorded list is replayed in order onto the real encoder.
#[derive(Debug, Default, Clone)]
pub struct CommandRecorder {
    commands: Vec<EncoderCommand>,
}

impl CommandRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[EncoderCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drain the recorded commands
    pub fn take(&mut self) -> Vec<EncoderCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Number of resource bind calls recorded
    pub fn binding_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_binding()).count()
    }

    pub fn draw_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    /// Replay every recorded command onto `target` in recording order
    pub fn replay(&self, target: &mut dyn CommandEncoder) {
        log::trace!("Replaying {} recorded encoder commands", self.commands.len());
        for command in &self.commands {
            command.apply(target);
        }
    }

    fn record(&mut self, command: EncoderCommand) {
        self.commands.push(command);
    }
}

impl CommandEncoder for CommandRecorder {
    fn begin_render_pass(&mut self, descriptor: &RenderPassDescriptor) {
        self.record(EncoderCommand::BeginRenderPass(descriptor.clone()));
    }

    fn end_encoding(&mut self) {
        self.record(EncoderCommand::EndEncoding);
    }

    fn set_color_store_action(&mut self, index: usize, action: StoreAction) {
        self.record(EncoderCommand::SetColorStoreAction { index, action });
    }

    fn set_depth_store_action(&mut self, action: StoreAction) {
        self.record(EncoderCommand::SetDepthStoreAction(action));
    }

    fn set_stencil_store_action(&mut self, action: StoreAction) {
        self.record(EncoderCommand::SetStencilStoreAction(action));
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record(EncoderCommand::SetViewports(SmallVec::from_slice(viewports)));
    }

    fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        self.record(EncoderCommand::SetScissorRects(SmallVec::from_slice(rects)));
    }

    fn set_front_facing(&mut self, front_face: wgt::FrontFace) {
        self.record(EncoderCommand::SetFrontFacing(front_face));
    }

    fn set_cull_mode(&mut self, cull_mode: Option<wgt::Face>) {
        self.record(EncoderCommand::SetCullMode(cull_mode));
    }

    fn set_depth_bias(&mut self, bias: DepthBias) {
        self.record(EncoderCommand::SetDepthBias(bias));
    }

    fn set_triangle_fill_mode(&mut self, fill_mode: wgt::PolygonMode) {
        self.record(EncoderCommand::SetTriangleFillMode(fill_mode));
    }

    fn set_depth_clip_mode(&mut self, mode: DepthClipMode) {
        self.record(EncoderCommand::SetDepthClipMode(mode));
    }

    fn set_blend_color(&mut self, color: [f32; 4]) {
        self.record(EncoderCommand::SetBlendColor(color));
    }

    fn set_depth_stencil_state(&mut self, state: DepthStencilStateId) {
        self.record(EncoderCommand::SetDepthStencilState(state));
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.record(EncoderCommand::SetStencilReference(reference));
    }

    fn set_visibility_result_mode(&mut self, mode: VisibilityResultMode, offset: u64) {
        self.record(EncoderCommand::SetVisibilityResultMode { mode, offset });
    }

    fn set_render_pipeline_state(&mut self, pipeline: NativePipelineId) {
        self.record(EncoderCommand::SetRenderPipelineState(pipeline));
    }

    fn set_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: BufferId, offset: u64) {
        self.record(EncoderCommand::SetBuffer {
            stage,
            slot,
            buffer,
            offset,
        });
    }

    fn set_bytes(&mut self, stage: ShaderStage, slot: u32, bytes: &[u8]) {
        self.record(EncoderCommand::SetBytes {
            stage,
            slot,
            bytes: bytes.to_vec(),
        });
    }

    fn set_texture(&mut self, stage: ShaderStage, slot: u32, texture: TextureId) {
        self.record(EncoderCommand::SetTexture {
            stage,
            slot,
            texture,
        });
    }

    fn set_sampler(&mut self, stage: ShaderStage, slot: u32, sampler: SamplerId) {
        self.record(EncoderCommand::SetSampler {
            stage,
            slot,
            sampler,
        });
    }

    fn draw(
        &mut self,
        topology: wgt::PrimitiveTopology,
        first_vertex: u32,
        vertex_count: u32,
        instance_count: u32,
        first_instance: u32,
    ) {
        self.record(EncoderCommand::Draw {
            topology,
            first_vertex,
            vertex_count,
            instance_count,
            first_instance,
        });
    }

    fn draw_indexed(
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
        self.record(EncoderCommand::DrawIndexed {
            topology,
            index_buffer,
            index_format,
            index_offset,
            index_count,
            instance_count,
            base_vertex,
            first_instance,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_preserves_order() {
        let texture = TextureId::new(7).unwrap();
        let mut deferred = CommandRecorder::new();
        deferred.set_stencil_reference(3);
        deferred.set_texture(ShaderStage::Fragment, 2, texture);
        deferred.set_bytes(ShaderStage::Vertex, 0, &[1, 2, 3, 4]);
        deferred.draw(wgt::PrimitiveTopology::TriangleList, 0, 3, 1, 0);

        let mut immediate = CommandRecorder::new();
        deferred.replay(&mut immediate);
        assert_eq!(immediate.commands(), deferred.commands());
        assert_eq!(immediate.binding_count(), 2);
        assert_eq!(immediate.draw_count(), 1);
    }

    #[test]
    fn test_take_drains() {
        let mut recorder = CommandRecorder::new();
        recorder.set_blend_color([0.0, 0.5, 1.0, 1.0]);
        assert_eq!(recorder.take().len(), 1);
        assert!(recorder.is_empty());
    }
}
