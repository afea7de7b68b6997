//! Per-stage resource binding tables
//!
//! One table per shader stage, with fixed slot counts matching the backend's
//! argument table limits. Each kind of slot keeps two masks:
//!
//! - `occupied`: bit *i* is set iff slot *i* holds a non-null resource
//! - `dirty`: the subset of occupied slots that must be re-emitted
//!
//! Setters only touch the dirty bit when the stored value actually changes.
//! A commit walks the dirty mask lowest bit first, so it costs one backend
//! call per dirty slot and leaves the mask empty.

use smallvec::SmallVec;
use wgpu_types as wgt;

use crate::encoder::CommandEncoder;
use crate::resources::{BufferId, SamplerId, TextureId};
use crate::shader::ShaderStage;

/// Buffer slots per stage
pub const MAX_BUFFERS: usize = 31;
/// Texture slots per stage (two mask words)
pub const MAX_TEXTURES: usize = 128;
/// Sampler slots per stage
pub const MAX_SAMPLERS: usize = 16;
/// Largest inline constant block a buffer slot may hold
pub const MAX_INLINE_BYTES: usize = 4096;

/// Contents of one buffer slot
///
/// Holds ids, never owning references; the resource layer keeps the
/// resources alive for as long as the backend needs them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BufferBinding {
    #[default]
    Null,
    Buffer {
        buffer: BufferId,
        offset: u64,
        length: u64,
        /// Element format for typed buffer access
        format_hint: Option<wgt::TextureFormat>,
    },
    /// Small constant data copied into the command stream
    Bytes(SmallVec<[u8; 64]>),
}

impl BufferBinding {
    pub fn is_null(&self) -> bool {
        matches!(self, BufferBinding::Null)
    }
}

/// Walk the set bits of a mask, lowest first
macro_rules! for_each_bit {
    ($mask:expr, |$slot:ident| $body:block) => {{
        let mut remaining = $mask;
        while remaining != 0 {
            let $slot = remaining.trailing_zeros() as usize;
            remaining &= remaining - 1;
            $body
        }
    }};
}

/// Cached bindings of one shader stage
#[derive(Debug, Clone)]
pub struct ResourceBindingTable {
    stage: ShaderStage,
    buffers: [BufferBinding; MAX_BUFFERS],
    textures: [Option<TextureId>; MAX_TEXTURES],
    samplers: [Option<SamplerId>; MAX_SAMPLERS],
    buffers_occupied: u32,
    buffers_dirty: u32,
    textures_occupied: u128,
    textures_dirty: u128,
    samplers_occupied: u16,
    samplers_dirty: u16,
}

impl ResourceBindingTable {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            buffers: std::array::from_fn(|_| BufferBinding::Null),
            textures: [None; MAX_TEXTURES],
            samplers: [None; MAX_SAMPLERS],
            buffers_occupied: 0,
            buffers_dirty: 0,
            textures_occupied: 0,
            textures_dirty: 0,
            samplers_occupied: 0,
            samplers_dirty: 0,
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Bind a buffer range. `None` unbinds the slot.
    ///
    /// Returns whether the cached value changed.
    pub fn set_buffer(
        &mut self,
        slot: usize,
        buffer: Option<BufferId>,
        offset: u64,
        length: u64,
        format_hint: Option<wgt::TextureFormat>,
    ) -> bool {
        let binding = match buffer {
            Some(buffer) => BufferBinding::Buffer {
                buffer,
                offset,
                length,
                format_hint,
            },
            None => BufferBinding::Null,
        };
        self.store_buffer(slot, binding)
    }

    /// Bind inline constant bytes to a buffer slot
    pub fn set_bytes(&mut self, slot: usize, bytes: &[u8]) -> bool {
        debug_assert!(
            bytes.len() <= MAX_INLINE_BYTES,
            "{} inline bytes exceed the {} byte limit",
            bytes.len(),
            MAX_INLINE_BYTES
        );
        if let BufferBinding::Bytes(current) = &self.buffers[slot] {
            if current.as_slice() == bytes {
                return false;
            }
        }
        self.store_buffer(slot, BufferBinding::Bytes(SmallVec::from_slice(bytes)))
    }

    fn store_buffer(&mut self, slot: usize, binding: BufferBinding) -> bool {
        debug_assert!(slot < MAX_BUFFERS, "{} buffer slot {} out of range", self.stage, slot);
        if self.buffers[slot] == binding {
            return false;
        }
        let bit = 1u32 << slot;
        if binding.is_null() {
            self.buffers_occupied &= !bit;
            self.buffers_dirty &= !bit;
        } else {
            self.buffers_occupied |= bit;
            self.buffers_dirty |= bit;
        }
        self.buffers[slot] = binding;
        true
    }

    /// Bind a texture. `None` unbinds the slot.
    pub fn set_texture(&mut self, slot: usize, texture: Option<TextureId>) -> bool {
        debug_assert!(slot < MAX_TEXTURES, "{} texture slot {} out of range", self.stage, slot);
        if self.textures[slot] == texture {
            return false;
        }
        let bit = 1u128 << slot;
        if texture.is_some() {
            self.textures_occupied |= bit;
            self.textures_dirty |= bit;
        } else {
            self.textures_occupied &= !bit;
            self.textures_dirty &= !bit;
        }
        self.textures[slot] = texture;
        true
    }

    /// Bind a sampler. `None` unbinds the slot.
    pub fn set_sampler(&mut self, slot: usize, sampler: Option<SamplerId>) -> bool {
        debug_assert!(slot < MAX_SAMPLERS, "{} sampler slot {} out of range", self.stage, slot);
        if self.samplers[slot] == sampler {
            return false;
        }
        let bit = 1u16 << slot;
        if sampler.is_some() {
            self.samplers_occupied |= bit;
            self.samplers_dirty |= bit;
        } else {
            self.samplers_occupied &= !bit;
            self.samplers_dirty &= !bit;
        }
        self.samplers[slot] = sampler;
        true
    }

    /// Emit one bind call per dirty slot and clear the dirty masks.
    ///
    /// Returns the number of calls emitted.
    pub fn commit_dirty(&mut self, encoder: &mut dyn CommandEncoder) -> usize {
        let mut emitted = 0;
        let stage = self.stage;

        for_each_bit!(self.buffers_dirty, |slot| {
            match &self.buffers[slot] {
                BufferBinding::Buffer { buffer, offset, .. } => {
                    encoder.set_buffer(stage, slot as u32, *buffer, *offset)
                }
                BufferBinding::Bytes(bytes) => encoder.set_bytes(stage, slot as u32, bytes),
                BufferBinding::Null => continue,
            }
            emitted += 1;
        });
        for_each_bit!(self.textures_dirty, |slot| {
            if let Some(texture) = self.textures[slot] {
                encoder.set_texture(stage, slot as u32, texture);
                emitted += 1;
            }
        });
        for_each_bit!(self.samplers_dirty, |slot| {
            if let Some(sampler) = self.samplers[slot] {
                encoder.set_sampler(stage, slot as u32, sampler);
                emitted += 1;
            }
        });

        self.buffers_dirty = 0;
        self.textures_dirty = 0;
        self.samplers_dirty = 0;
        if emitted > 0 {
            log::trace!("Committed {} {} stage bindings", emitted, stage);
        }
        emitted
    }

    /// Re-signal every occupied slot, e.g. after the slot layout changed
    /// meaning or a fresh encoder was opened.
    pub fn mark_all_dirty(&mut self) {
        self.buffers_dirty = self.buffers_occupied;
        self.textures_dirty = self.textures_occupied;
        self.samplers_dirty = self.samplers_occupied;
    }

    /// Drop every binding
    pub fn clear(&mut self) {
        self.buffers.iter_mut().for_each(|b| *b = BufferBinding::Null);
        self.textures = [None; MAX_TEXTURES];
        self.samplers = [None; MAX_SAMPLERS];
        self.buffers_occupied = 0;
        self.buffers_dirty = 0;
        self.textures_occupied = 0;
        self.textures_dirty = 0;
        self.samplers_occupied = 0;
        self.samplers_dirty = 0;
    }

    pub fn buffer(&self, slot: usize) -> &BufferBinding {
        &self.buffers[slot]
    }

    pub fn texture(&self, slot: usize) -> Option<TextureId> {
        self.textures[slot]
    }

    pub fn sampler(&self, slot: usize) -> Option<SamplerId> {
        self.samplers[slot]
    }

    pub fn dirty_buffers(&self) -> u32 {
        self.buffers_dirty
    }

    pub fn dirty_textures(&self) -> u128 {
        self.textures_dirty
    }

    pub fn dirty_samplers(&self) -> u16 {
        self.samplers_dirty
    }

    pub fn bound_buffers(&self) -> u32 {
        self.buffers_occupied
    }

    pub fn bound_textures(&self) -> u128 {
        self.textures_occupied
    }

    pub fn bound_samplers(&self) -> u16 {
        self.samplers_occupied
    }

    /// Number of bind calls the next commit would emit
    pub fn dirty_count(&self) -> usize {
        (self.buffers_dirty.count_ones()
            + self.textures_dirty.count_ones()
            + self.samplers_dirty.count_ones()) as usize
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_count() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{CommandRecorder, EncoderCommand};

    fn texture(raw: u64) -> Option<TextureId> {
        TextureId::new(raw)
    }

    #[test]
    fn test_fragment_texture_rebind_scenario() {
        let mut table = ResourceBindingTable::new(ShaderStage::Fragment);
        let mut encoder = CommandRecorder::new();
        let t = texture(10);
        let t2 = texture(11);

        table.set_texture(3, t);
        assert_eq!(table.commit_dirty(&mut encoder), 1);
        assert_eq!(
            encoder.take(),
            vec![EncoderCommand::SetTexture {
                stage: ShaderStage::Fragment,
                slot: 3,
                texture: t.unwrap(),
            }]
        );

        table.set_texture(3, t);
        assert_eq!(table.commit_dirty(&mut encoder), 0);
        assert!(encoder.is_empty());

        table.set_texture(3, t2);
        assert_eq!(table.commit_dirty(&mut encoder), 1);
        assert_eq!(
            encoder.take(),
            vec![EncoderCommand::SetTexture {
                stage: ShaderStage::Fragment,
                slot: 3,
                texture: t2.unwrap(),
            }]
        );
    }

    #[test]
    fn test_set_buffer_idempotent() {
        let mut table = ResourceBindingTable::new(ShaderStage::Vertex);
        let buffer = BufferId::new(5);
        assert!(table.set_buffer(2, buffer, 256, 64, None));
        let mut encoder = CommandRecorder::new();
        table.commit_dirty(&mut encoder);
        assert_eq!(table.dirty_buffers(), 0);

        assert!(!table.set_buffer(2, buffer, 256, 64, None));
        assert_eq!(table.dirty_buffers(), 0);

        // A different offset is a different binding
        assert!(table.set_buffer(2, buffer, 512, 64, None));
        assert_eq!(table.dirty_buffers(), 1 << 2);
    }

    #[test]
    fn test_commit_completeness() {
        let mut table = ResourceBindingTable::new(ShaderStage::Fragment);
        for slot in [0, 5, 30] {
            table.set_buffer(slot, BufferId::new(slot as u64 + 1), 0, 16, None);
        }
        for slot in [1, 63, 64, 127] {
            table.set_texture(slot, texture(100 + slot as u64));
        }
        table.set_sampler(15, SamplerId::new(9));
        table.set_bytes(7, &[1, 2, 3, 4]);

        let expected = table.dirty_count();
        assert_eq!(expected, 9);
        let mut encoder = CommandRecorder::new();
        assert_eq!(table.commit_dirty(&mut encoder), expected);
        assert_eq!(encoder.binding_count(), expected);
        assert!(!table.is_dirty());

        // Lowest slot first within each kind
        let slots: Vec<u32> = encoder
            .commands()
            .iter()
            .filter_map(|c| match c {
                EncoderCommand::SetTexture { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(slots, vec![1, 63, 64, 127]);
    }

    #[test]
    fn test_null_clears_both_masks() {
        let mut table = ResourceBindingTable::new(ShaderStage::Compute);
        table.set_sampler(4, SamplerId::new(1));
        assert_eq!(table.bound_samplers(), 1 << 4);
        assert!(table.set_sampler(4, None));
        assert_eq!(table.bound_samplers(), 0);
        assert_eq!(table.dirty_samplers(), 0);
        assert!(!table.set_sampler(4, None));
    }

    #[test]
    fn test_mark_all_dirty_resignals_occupied_slots() {
        let mut table = ResourceBindingTable::new(ShaderStage::Vertex);
        let mut encoder = CommandRecorder::new();
        table.set_buffer(0, BufferId::new(1), 0, 16, None);
        table.set_texture(2, texture(3));
        table.set_texture(4, texture(4));
        table.set_texture(4, None);
        table.commit_dirty(&mut encoder);

        table.mark_all_dirty();
        assert_eq!(table.dirty_buffers(), 1);
        assert_eq!(table.dirty_textures(), 1 << 2);
        assert_eq!(table.commit_dirty(&mut encoder), 2);
    }

    #[test]
    fn test_inline_bytes_compare_by_value() {
        let mut table = ResourceBindingTable::new(ShaderStage::Fragment);
        assert!(table.set_bytes(1, &[0u8; 128]));
        let mut encoder = CommandRecorder::new();
        table.commit_dirty(&mut encoder);
        assert!(!table.set_bytes(1, &[0u8; 128]));
        assert!(table.set_bytes(1, &[1u8; 128]));

        // Replacing bytes with a buffer dirties the slot again
        table.commit_dirty(&mut encoder);
        assert!(table.set_buffer(1, BufferId::new(2), 0, 128, None));
        assert_eq!(table.dirty_buffers(), 1 << 1);
    }

    #[test]
    fn test_clear() {
        let mut table = ResourceBindingTable::new(ShaderStage::Hull);
        table.set_texture(100, texture(1));
        table.set_bytes(0, &[1]);
        table.clear();
        assert_eq!(table.bound_textures(), 0);
        assert!(table.buffer(0).is_null());
        assert!(!table.is_dirty());
    }

    #[test]
    #[should_panic]
    fn test_slot_out_of_range() {
        let mut table = ResourceBindingTable::new(ShaderStage::Vertex);
        table.set_buffer(MAX_BUFFERS, BufferId::new(1), 0, 0, None);
    }
}
