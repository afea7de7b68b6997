//! Render pass state
//!
//! Tracks the render-target configuration the current encoder was opened
//! with and decides, for each new configuration, whether the open encoder can
//! keep going or a new one must be started.
//!
//! A new configuration can reuse the open encoder when it names the same
//! surfaces (textures, mips, slices, resolve targets, depth/stencil usage),
//! none of its attachments asks for a clear, and no store action grew (kept
//! samples or resolved where it previously didn't). Store-only growth is fine
//! on devices with deferred store actions: the final actions are set on the
//! encoder just before it ends.

use smallvec::SmallVec;
use wgpu_types as wgt;

use crate::config::DeviceCapabilities;
use crate::error::{Result, StateCacheError};
use crate::msaa;
use crate::resources::{BufferId, TextureId, TextureInfo};
use crate::state_key::MAX_COLOR_TARGETS;

/// What an attachment holds when the pass starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadAction {
    #[default]
    Load,
    Clear,
    DontCare,
}

/// What happens to an attachment when the pass ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreAction {
    DontCare,
    #[default]
    Store,
    MultisampleResolve,
    StoreAndResolve,
    /// Decided later through the encoder's deferred store action calls
    Unknown,
}

impl StoreAction {
    /// Attachment contents survive the pass
    pub fn stores_samples(self) -> bool {
        matches!(self, StoreAction::Store | StoreAction::StoreAndResolve)
    }

    pub fn resolves(self) -> bool {
        matches!(self, StoreAction::MultisampleResolve | StoreAction::StoreAndResolve)
    }

    /// `self` keeps or resolves something `previous` didn't
    pub fn increases_over(self, previous: StoreAction) -> bool {
        (self.stores_samples() && !previous.stores_samples())
            || (self.resolves() && !previous.resolves())
    }
}

/// Single-sample texture a multisampled attachment resolves into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveTarget {
    pub texture: TextureInfo,
    pub level: u32,
    pub slice: u32,
}

impl ResolveTarget {
    fn same_surface(&self, other: &ResolveTarget) -> bool {
        self.texture.id == other.texture.id && self.level == other.level && self.slice == other.slice
    }
}

/// One bound color target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    pub texture: TextureInfo,
    pub level: u32,
    pub slice: u32,
    pub resolve: Option<ResolveTarget>,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
    pub clear_color: wgt::Color,
}

impl ColorTarget {
    /// Load and store mip 0 / slice 0
    pub fn new(texture: TextureInfo) -> Self {
        Self {
            texture,
            level: 0,
            slice: 0,
            resolve: None,
            load_action: LoadAction::Load,
            store_action: StoreAction::Store,
            clear_color: wgt::Color::TRANSPARENT,
        }
    }

    pub fn clear(mut self, color: wgt::Color) -> Self {
        self.load_action = LoadAction::Clear;
        self.clear_color = color;
        self
    }

    pub fn actions(mut self, load: LoadAction, store: StoreAction) -> Self {
        self.load_action = load;
        self.store_action = store;
        self
    }

    pub fn subresource(mut self, level: u32, slice: u32) -> Self {
        self.level = level;
        self.slice = slice;
        self
    }

    pub fn resolve_to(mut self, texture: TextureInfo) -> Self {
        self.resolve = Some(ResolveTarget {
            texture,
            level: 0,
            slice: 0,
        });
        self
    }

    fn same_surface(&self, other: &ColorTarget) -> bool {
        self.texture.id == other.texture.id
            && self.level == other.level
            && self.slice == other.slice
            && match (&self.resolve, &other.resolve) {
                (Some(a), Some(b)) => a.same_surface(b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// How a pass uses one component of the depth/stencil attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComponentAccess {
    #[default]
    Unused,
    Read,
    Write,
}

impl ComponentAccess {
    pub fn is_used(self) -> bool {
        self != ComponentAccess::Unused
    }
}

/// Requested depth and stencil usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthStencilAccess {
    pub depth: ComponentAccess,
    pub stencil: ComponentAccess,
}

impl DepthStencilAccess {
    pub const NONE: Self = Self {
        depth: ComponentAccess::Unused,
        stencil: ComponentAccess::Unused,
    };
    pub const DEPTH_WRITE: Self = Self {
        depth: ComponentAccess::Write,
        stencil: ComponentAccess::Unused,
    };
    pub const DEPTH_STENCIL_WRITE: Self = Self {
        depth: ComponentAccess::Write,
        stencil: ComponentAccess::Write,
    };

    /// Write access to every aspect `format` has
    pub fn for_format(format: wgt::TextureFormat) -> Self {
        let access = |present: bool| {
            if present {
                ComponentAccess::Write
            } else {
                ComponentAccess::Unused
            }
        };
        Self {
            depth: access(format.has_depth_aspect()),
            stencil: access(format.has_stencil_aspect()),
        }
    }
}

/// Bound depth/stencil attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilTarget {
    pub texture: TextureInfo,
    /// Separate stencil surface for devices that can't share one attachment
    pub stencil_texture: Option<TextureInfo>,
    pub level: u32,
    pub slice: u32,
    pub resolve: Option<ResolveTarget>,
    pub access: DepthStencilAccess,
    pub depth_load: LoadAction,
    pub depth_store: StoreAction,
    pub stencil_load: LoadAction,
    pub stencil_store: StoreAction,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl DepthStencilTarget {
    pub fn new(texture: TextureInfo) -> Self {
        Self {
            texture,
            stencil_texture: None,
            level: 0,
            slice: 0,
            resolve: None,
            access: DepthStencilAccess::for_format(texture.format),
            depth_load: LoadAction::Load,
            depth_store: StoreAction::Store,
            stencil_load: LoadAction::Load,
            stencil_store: StoreAction::Store,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }

    pub fn with_access(mut self, access: DepthStencilAccess) -> Self {
        self.access = access;
        self
    }

    pub fn with_stencil_texture(mut self, texture: TextureInfo) -> Self {
        self.stencil_texture = Some(texture);
        self
    }

    pub fn depth_actions(mut self, load: LoadAction, store: StoreAction) -> Self {
        self.depth_load = load;
        self.depth_store = store;
        self
    }

    pub fn stencil_actions(mut self, load: LoadAction, store: StoreAction) -> Self {
        self.stencil_load = load;
        self.stencil_store = store;
        self
    }

    pub fn clear(mut self, depth: f32, stencil: u32) -> Self {
        self.depth_load = LoadAction::Clear;
        self.stencil_load = LoadAction::Clear;
        self.clear_depth = depth;
        self.clear_stencil = stencil;
        self
    }

    pub fn resolve_to(mut self, texture: TextureInfo) -> Self {
        self.resolve = Some(ResolveTarget {
            texture,
            level: 0,
            slice: 0,
        });
        self
    }

    pub fn uses_depth(&self) -> bool {
        self.access.depth.is_used()
    }

    pub fn uses_stencil(&self) -> bool {
        self.access.stencil.is_used()
    }

    /// Surface the stencil attachment is bound from
    pub fn stencil_surface(&self) -> &TextureInfo {
        self.stencil_texture.as_ref().unwrap_or(&self.texture)
    }

    fn same_surface(&self, other: &DepthStencilTarget) -> bool {
        self.texture.id == other.texture.id
            && self.stencil_texture.map(|t| t.id) == other.stencil_texture.map(|t| t.id)
            && self.level == other.level
            && self.slice == other.slice
            && self.access == other.access
            && match (&self.resolve, &other.resolve) {
                (Some(a), Some(b)) => a.same_surface(b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// Render-target configuration handed over by `SetRenderTargets`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderTargetsInfo {
    /// Color slots; `None` leaves a hole
    pub color_targets: SmallVec<[Option<ColorTarget>; MAX_COLOR_TARGETS]>,
    pub depth_stencil: Option<DepthStencilTarget>,
    /// Unordered access views bound alongside the targets
    pub uav_count: u32,
    /// Layers rendered at once; 0 or 1 means not layered
    pub array_length: u32,
    pub visibility_buffer: Option<BufferId>,
    /// Draws need a depth attachment even if none is bound
    pub requires_depth: bool,
}

impl RenderTargetsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(mut self, target: ColorTarget) -> Self {
        self.color_targets.push(Some(target));
        self
    }

    pub fn with_depth_stencil(mut self, target: DepthStencilTarget) -> Self {
        self.depth_stencil = Some(target);
        self
    }

    pub fn layered(mut self, array_length: u32) -> Self {
        self.array_length = array_length;
        self
    }

    pub fn with_visibility_buffer(mut self, buffer: BufferId) -> Self {
        self.visibility_buffer = Some(buffer);
        self
    }

    pub fn colors(&self) -> impl Iterator<Item = (usize, &ColorTarget)> {
        self.color_targets
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
    }

    pub fn is_empty(&self) -> bool {
        self.colors().next().is_none() && self.depth_stencil.is_none()
    }

    /// Sample count of the first bound attachment
    pub fn sample_count(&self) -> u32 {
        self.colors()
            .map(|(_, t)| t.texture.sample_count)
            .next()
            .or(self.depth_stencil.map(|d| d.texture.sample_count))
            .unwrap_or(1)
    }

    /// Pixel extent of the first bound attachment
    pub fn extent(&self) -> (u32, u32) {
        self.colors()
            .map(|(_, t)| t.texture.mip_extent(t.level))
            .next()
            .or(self.depth_stencil.map(|d| d.texture.mip_extent(d.level)))
            .unwrap_or((0, 0))
    }

    fn uses_depth(&self) -> bool {
        self.depth_stencil.map(|d| d.uses_depth()).unwrap_or(false)
    }

    fn uses_stencil(&self) -> bool {
        self.depth_stencil.map(|d| d.uses_stencil()).unwrap_or(false)
    }

    fn same_surfaces(&self, other: &RenderTargetsInfo) -> bool {
        self.color_targets.len() == other.color_targets.len()
            && self.uav_count == other.uav_count
            && self.array_length.max(1) == other.array_length.max(1)
            && self.visibility_buffer == other.visibility_buffer
            && self
                .color_targets
                .iter()
                .zip(&other.color_targets)
                .all(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => a.same_surface(b),
                    (None, None) => true,
                    _ => false,
                })
            && match (&self.depth_stencil, &other.depth_stencil) {
                (Some(a), Some(b)) => a.same_surface(b),
                (None, None) => true,
                _ => false,
            }
    }

    fn any_clear(&self) -> bool {
        self.colors().any(|(_, t)| t.load_action == LoadAction::Clear)
            || self
                .depth_stencil
                .map(|d| {
                    (d.uses_depth() && d.depth_load == LoadAction::Clear)
                        || (d.uses_stencil() && d.stencil_load == LoadAction::Clear)
                })
                .unwrap_or(false)
    }

    /// Some store action in `self` grew compared to `previous`; surfaces must match
    fn stores_increased_over(&self, previous: &RenderTargetsInfo) -> bool {
        let colors = self
            .color_targets
            .iter()
            .zip(&previous.color_targets)
            .any(|(new, old)| match (new, old) {
                (Some(new), Some(old)) => new.store_action.increases_over(old.store_action),
                _ => false,
            });
        let depth_stencil = match (&self.depth_stencil, &previous.depth_stencil) {
            (Some(new), Some(old)) => {
                new.depth_store.increases_over(old.depth_store)
                    || new.stencil_store.increases_over(old.stencil_store)
            }
            _ => false,
        };
        colors || depth_stencil
    }

    fn is_restartable(&self) -> bool {
        let resumable = |load: LoadAction, store: StoreAction| {
            load == LoadAction::Load && store == StoreAction::Store
        };
        self.sample_count() <= 1
            && self
                .colors()
                .all(|(_, t)| resumable(t.load_action, t.store_action))
            && self
                .depth_stencil
                .map(|d| {
                    (!d.uses_depth() || resumable(d.depth_load, d.depth_store))
                        && (!d.uses_stencil() || resumable(d.stencil_load, d.stencil_store))
                })
                .unwrap_or(true)
    }

    fn copy_store_intents_to(&self, other: &mut RenderTargetsInfo) {
        for (new, old) in self.color_targets.iter().zip(other.color_targets.iter_mut()) {
            if let (Some(new), Some(old)) = (new, old) {
                old.store_action = new.store_action;
            }
        }
        if let (Some(new), Some(old)) = (&self.depth_stencil, other.depth_stencil.as_mut()) {
            old.depth_store = new.depth_store;
            old.stencil_store = new.stencil_store;
        }
    }

    /// Rewrite every action so reopening the pass loses nothing
    fn make_resumable(&mut self) {
        for target in self.color_targets.iter_mut().flatten() {
            target.load_action = LoadAction::Load;
            target.store_action = StoreAction::Store;
        }
        if let Some(ds) = self.depth_stencil.as_mut() {
            ds.depth_load = LoadAction::Load;
            ds.depth_store = StoreAction::Store;
            ds.stencil_load = LoadAction::Load;
            ds.stencil_store = StoreAction::Store;
        }
    }
}

/// Color attachment as the backend sees it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachmentDescriptor {
    pub texture: TextureId,
    pub level: u32,
    pub slice: u32,
    pub resolve_texture: Option<TextureId>,
    pub resolve_level: u32,
    pub resolve_slice: u32,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
    pub clear_color: wgt::Color,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachmentDescriptor {
    pub texture: TextureId,
    pub level: u32,
    pub slice: u32,
    pub resolve_texture: Option<TextureId>,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
    pub clear_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StencilAttachmentDescriptor {
    pub texture: TextureId,
    pub level: u32,
    pub slice: u32,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
    pub clear_stencil: u32,
}

/// Everything `begin_render_pass` needs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassDescriptor {
    pub color_attachments: SmallVec<[Option<ColorAttachmentDescriptor>; MAX_COLOR_TARGETS]>,
    pub depth_attachment: Option<DepthAttachmentDescriptor>,
    pub stencil_attachment: Option<StencilAttachmentDescriptor>,
    pub render_target_array_length: u32,
    pub visibility_result_buffer: Option<BufferId>,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
}

/// Store actions to set on an encoder right before it ends
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreActions {
    pub color: SmallVec<[Option<StoreAction>; MAX_COLOR_TARGETS]>,
    pub depth: Option<StoreAction>,
    pub stencil: Option<StoreAction>,
}

/// Render-target configuration of the current encoder
#[derive(Debug)]
pub struct RenderPassState {
    caps: DeviceCapabilities,
    /// Configuration as the caller last set it
    requested: Option<RenderTargetsInfo>,
    /// What the encoder opens with: the request plus restart rewrites and
    /// any placeholder depth surface
    current: Option<RenderTargetsInfo>,
    descriptor: Option<RenderPassDescriptor>,
    restartable: bool,
    /// Placeholder surfaces, kept for reuse across passes
    fallback_depth: Option<TextureInfo>,
    fallback_stencil: Option<TextureInfo>,
    using_fallback_depth: bool,
}

impl RenderPassState {
    pub fn new(caps: DeviceCapabilities) -> Self {
        Self {
            caps,
            requested: None,
            current: None,
            descriptor: None,
            restartable: false,
            fallback_depth: None,
            fallback_stencil: None,
            using_fallback_depth: false,
        }
    }

    /// Adopt a render-target configuration.
    ///
    /// Returns whether the open encoder has to end and a new one begin. An
    /// empty configuration is ignored.
    pub fn set_render_targets(&mut self, info: RenderTargetsInfo) -> Result<bool> {
        self.validate(&info)?;

        if info.is_empty() {
            log::debug!("Ignoring empty render target configuration");
            return Ok(false);
        }

        // Compared against the caller's own configuration, not the
        // placeholder depth or restart rewrites layered on top of it
        let (Some(requested), Some(current)) = (self.requested.as_mut(), self.current.as_mut()) else {
            self.adopt_requested(info);
            return Ok(true);
        };

        if !info.same_surfaces(requested) || info.any_clear() {
            self.adopt_requested(info);
            return Ok(true);
        }

        if info.stores_increased_over(requested) {
            if !self.caps.deferred_store_actions {
                log::debug!("Store action increased, restarting render pass");
                self.adopt_requested(info);
                return Ok(true);
            }
            log::trace!("Store action increased, deferring to encoder end");
        }

        if self.caps.deferred_store_actions {
            // Only store intents can differ here; they are applied at encoder end
            info.copy_store_intents_to(requested);
            info.copy_store_intents_to(current);
            self.restartable = current.is_restartable();
        }
        Ok(false)
    }

    fn adopt_requested(&mut self, info: RenderTargetsInfo) {
        self.requested = Some(info.clone());
        self.adopt(info);
    }

    fn validate(&self, info: &RenderTargetsInfo) -> Result<()> {
        if info.color_targets.len() > MAX_COLOR_TARGETS {
            return Err(StateCacheError::TooManyColorTargets {
                count: info.color_targets.len(),
                max: MAX_COLOR_TARGETS,
            });
        }
        if info.array_length > 1 && !self.caps.layered_rendering {
            return Err(StateCacheError::unsupported(format!(
                "layered rendering ({} layers)",
                info.array_length
            )));
        }

        let expected = info.sample_count();
        for (index, target) in info.colors() {
            check_samples(expected, &target.texture, || format!("color[{}]", index))?;
            check_resolve(&target.resolve, || format!("color[{}]", index))?;
        }

        if let Some(ds) = &info.depth_stencil {
            check_samples(expected, &ds.texture, || "depth".to_string())?;
            check_resolve(&ds.resolve, || "depth".to_string())?;
            if ds.uses_depth() && !ds.texture.has_depth() {
                return Err(StateCacheError::invalid_parameter(
                    "depth_stencil",
                    format!("{:?} has no depth aspect", ds.texture.format),
                ));
            }
            if ds.uses_stencil() {
                if !ds.stencil_surface().has_stencil() {
                    return Err(StateCacheError::invalid_parameter(
                        "depth_stencil",
                        format!("{:?} has no stencil aspect", ds.stencil_surface().format),
                    ));
                }
                if ds.uses_depth() && !self.caps.combined_depth_stencil && ds.stencil_texture.is_none() {
                    return Err(StateCacheError::MissingStencilSurface {
                        texture: format!("{:?}", ds.texture.id),
                    });
                }
            }
            if let Some(stencil) = &ds.stencil_texture {
                check_samples(expected, stencil, || "stencil".to_string())?;
            }
        }
        Ok(())
    }

    fn adopt(&mut self, info: RenderTargetsInfo) {
        self.restartable = info.is_restartable();
        self.using_fallback_depth = match (&info.depth_stencil, &self.fallback_depth) {
            (Some(ds), Some(fallback)) => ds.texture.id == fallback.id,
            _ => false,
        };
        self.descriptor = Some(self.build_descriptor(&info));
        self.current = Some(info);
    }

    fn build_descriptor(&self, info: &RenderTargetsInfo) -> RenderPassDescriptor {
        let multisampled = info.sample_count() > 1;
        let (width, height) = info.extent();

        let color_attachments = info
            .color_targets
            .iter()
            .map(|target| {
                target.as_ref().map(|t| ColorAttachmentDescriptor {
                    texture: t.texture.id,
                    level: t.level,
                    slice: t.slice,
                    resolve_texture: t.resolve.map(|r| r.texture.id),
                    resolve_level: t.resolve.map(|r| r.level).unwrap_or(0),
                    resolve_slice: t.resolve.map(|r| r.slice).unwrap_or(0),
                    load_action: t.load_action,
                    store_action: self.open_store_action(
                        t.store_action,
                        multisampled,
                        t.resolve.is_some(),
                        true,
                    ),
                    clear_color: t.clear_color,
                })
            })
            .collect();

        let depth_attachment = info.depth_stencil.filter(|d| d.uses_depth()).map(|d| {
            let resolve = d.resolve.filter(|_| self.caps.msaa_depth_resolve);
            if d.resolve.is_some() && resolve.is_none() {
                log::debug!("MSAA depth resolve unsupported, keeping depth samples instead");
            }
            DepthAttachmentDescriptor {
                texture: d.texture.id,
                level: d.level,
                slice: d.slice,
                resolve_texture: resolve.map(|r| r.texture.id),
                load_action: d.depth_load,
                store_action: self.open_store_action(
                    d.depth_store,
                    multisampled,
                    d.resolve.is_some(),
                    self.caps.msaa_depth_resolve,
                ),
                clear_depth: d.clear_depth,
            }
        });

        let stencil_attachment = info.depth_stencil.filter(|d| d.uses_stencil()).map(|d| {
            StencilAttachmentDescriptor {
                texture: d.stencil_surface().id,
                level: d.level,
                slice: d.slice,
                load_action: d.stencil_load,
                store_action: self.open_store_action(d.stencil_store, multisampled, false, false),
                clear_stencil: d.clear_stencil,
            }
        });

        RenderPassDescriptor {
            color_attachments,
            depth_attachment,
            stencil_attachment,
            render_target_array_length: info.array_length.max(1),
            visibility_result_buffer: info.visibility_buffer,
            width,
            height,
            sample_count: info.sample_count(),
        }
    }

    /// Store action an attachment is opened with
    fn open_store_action(
        &self,
        intent: StoreAction,
        multisampled: bool,
        has_resolve_target: bool,
        resolve_supported: bool,
    ) -> StoreAction {
        if self.caps.deferred_store_actions {
            return StoreAction::Unknown;
        }
        let action =
            msaa::resolve_store_action(intent, multisampled, has_resolve_target, resolve_supported, &self.caps);
        // Fixed at open, so keep contents in case the pass is broken and continued
        match action {
            StoreAction::MultisampleResolve if self.caps.store_and_resolve => StoreAction::StoreAndResolve,
            StoreAction::DontCare if !multisampled => StoreAction::Store,
            other => other,
        }
    }

    /// Make the current configuration reopenable without losing contents.
    ///
    /// Returns false when that's impossible, which is always the case for
    /// multisampled targets: their resolve has consumed the samples.
    pub fn prepare_to_restart(&mut self) -> bool {
        if self.restartable {
            return true;
        }
        let Some(mut info) = self.current.clone() else {
            return false;
        };
        if info.sample_count() > 1 {
            return false;
        }
        info.make_resumable();
        self.adopt(info);
        self.restartable
    }

    /// Store action for an encoder ended early, when the pass continues afterwards
    pub fn conditional_store_action(&self, is_multisampled: bool) -> StoreAction {
        msaa::conditional_store_action(is_multisampled, is_multisampled, &self.caps)
    }

    /// Final store actions for the attachments of the current encoder.
    ///
    /// `forced_break` means the encoder ends for reasons unrelated to the
    /// targets and the pass continues in a new encoder, so contents must
    /// survive whatever the caller's intent was.
    pub fn final_store_actions(&self, forced_break: bool) -> StoreActions {
        let Some(info) = &self.current else {
            return StoreActions::default();
        };
        let multisampled = info.sample_count() > 1;
        let caps = &self.caps;

        let color = info
            .color_targets
            .iter()
            .map(|target| {
                target.as_ref().map(|t| {
                    let has_resolve = t.resolve.is_some();
                    if forced_break {
                        msaa::conditional_store_action(multisampled, has_resolve, caps)
                    } else {
                        msaa::resolve_store_action(t.store_action, multisampled, has_resolve, true, caps)
                    }
                })
            })
            .collect();

        let depth = info.depth_stencil.filter(|d| d.uses_depth()).map(|d| {
            let has_resolve = d.resolve.is_some() && caps.msaa_depth_resolve;
            if forced_break {
                msaa::conditional_store_action(multisampled, has_resolve, caps)
            } else {
                msaa::resolve_store_action(
                    d.depth_store,
                    multisampled,
                    d.resolve.is_some(),
                    caps.msaa_depth_resolve,
                    caps,
                )
            }
        });

        let stencil = info.depth_stencil.filter(|d| d.uses_stencil()).map(|d| {
            if forced_break {
                StoreAction::Store
            } else {
                msaa::resolve_store_action(d.stencil_store, multisampled, false, false, caps)
            }
        });

        StoreActions {
            color,
            depth,
            stencil,
        }
    }

    /// Draws with `pipeline_requires_depth` need a placeholder depth surface
    pub fn needs_fallback_depth(&self, pipeline_requires_depth: bool) -> bool {
        match &self.current {
            Some(info) => (pipeline_requires_depth || info.requires_depth) && !info.uses_depth(),
            None => false,
        }
    }

    /// Cached placeholder depth surface of `format` if it covers the current targets
    pub fn reusable_fallback_depth(&self, format: wgt::TextureFormat) -> Option<TextureInfo> {
        self.reusable(self.fallback_depth, format)
    }

    /// Cached separate placeholder stencil surface, see [`Self::reusable_fallback_depth`]
    pub fn reusable_fallback_stencil(&self, format: wgt::TextureFormat) -> Option<TextureInfo> {
        self.reusable(self.fallback_stencil, format)
    }

    fn reusable(&self, cached: Option<TextureInfo>, format: wgt::TextureFormat) -> Option<TextureInfo> {
        let info = self.current.as_ref()?;
        let (width, height) = info.extent();
        let samples = info.sample_count();
        cached.filter(|f| {
            f.format == format && f.width >= width && f.height >= height && f.sample_count == samples
        })
    }

    /// Bind `surface` as the depth/stencil attachment of the current configuration.
    ///
    /// `access` should mirror the depth and stencil components the pipeline
    /// was built for. Devices without combined depth/stencil need the stencil
    /// in `stencil_surface`. With `preserve_contents` the color targets are
    /// switched to load, since the pass is being continued in a new encoder.
    /// Always requires a new encoder.
    pub fn bind_fallback_depth(
        &mut self,
        surface: TextureInfo,
        stencil_surface: Option<TextureInfo>,
        access: DepthStencilAccess,
        preserve_contents: bool,
    ) -> Result<bool> {
        let Some(mut info) = self.current.clone() else {
            return Ok(false);
        };
        if preserve_contents {
            for target in info.color_targets.iter_mut().flatten() {
                target.load_action = LoadAction::Load;
            }
        }
        let mut target = DepthStencilTarget::new(surface)
            .with_access(access)
            .clear(1.0, 0)
            .depth_actions(LoadAction::Clear, StoreAction::DontCare)
            .stencil_actions(LoadAction::Clear, StoreAction::DontCare);
        if let Some(stencil) = stencil_surface {
            target = target.with_stencil_texture(stencil);
        }
        info.depth_stencil = Some(target);
        self.validate(&info)?;

        log::debug!(
            "Binding fallback depth surface {:?} ({:?}, {}x{}, {} samples)",
            surface.id,
            surface.format,
            surface.width,
            surface.height,
            surface.sample_count
        );
        self.fallback_depth = Some(surface);
        if stencil_surface.is_some() {
            self.fallback_stencil = stencil_surface;
        }
        self.adopt(info);
        Ok(true)
    }

    /// Forget the active configuration; the next `set_render_targets` opens a new encoder
    pub fn reset(&mut self) {
        self.requested = None;
        self.current = None;
        self.descriptor = None;
        self.restartable = false;
        self.using_fallback_depth = false;
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn current(&self) -> Option<&RenderTargetsInfo> {
        self.current.as_ref()
    }

    pub fn descriptor(&self) -> Option<&RenderPassDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn sample_count(&self) -> u32 {
        self.current.as_ref().map(|i| i.sample_count()).unwrap_or(1)
    }

    pub fn extent(&self) -> (u32, u32) {
        self.current.as_ref().map(|i| i.extent()).unwrap_or((0, 0))
    }

    pub fn has_depth(&self) -> bool {
        self.current.as_ref().map(|i| i.uses_depth()).unwrap_or(false)
    }

    pub fn has_stencil(&self) -> bool {
        self.current.as_ref().map(|i| i.uses_stencil()).unwrap_or(false)
    }

    pub fn is_using_fallback_depth(&self) -> bool {
        self.using_fallback_depth
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }
}

fn check_samples(expected: u32, texture: &TextureInfo, attachment: impl FnOnce() -> String) -> Result<()> {
    if texture.sample_count != expected {
        return Err(StateCacheError::SampleCountMismatch {
            expected,
            found: texture.sample_count,
            attachment: attachment(),
        });
    }
    Ok(())
}

fn check_resolve(resolve: &Option<ResolveTarget>, attachment: impl FnOnce() -> String) -> Result<()> {
    match resolve {
        Some(r) if r.texture.is_multisampled() => Err(StateCacheError::invalid_resolve(
            attachment(),
            format!("resolve texture has {} samples", r.texture.sample_count),
        )),
        _ => Ok(()),
    }
}
