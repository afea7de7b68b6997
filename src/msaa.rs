//! MSAA (Multisample Anti-Aliasing) support
//!
//! Sample count validation plus the policy that turns a caller's high-level
//! store intent into the store action an attachment is actually opened or
//! closed with.
//!
//! # Resolve rules
//!
//! - A single-sample attachment never resolves: resolve intents become `Store`.
//! - A multisampled attachment with a resolve target always resolves. If the
//!   caller also wants the samples kept and the device can't do both, the
//!   resolve wins (`MultisampleResolve`).
//! - A multisampled attachment without a resolve target must not request a
//!   resolve; such intents keep the samples instead (`Store`).
//! - When an encoder is broken early, multisampled contents are kept *and*
//!   resolved so the pass that continues afterwards still has its samples.

use crate::config::DeviceCapabilities;
use crate::error::{Result, StateCacheError};
use crate::render_pass::StoreAction;

/// Validated sample count (1, 2, 4, 8 or 16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleCount(u32);

impl SampleCount {
    pub const ONE: SampleCount = SampleCount(1);

    pub fn new(count: u32) -> Result<Self> {
        match count {
            1 | 2 | 4 | 8 | 16 => Ok(Self(count)),
            _ => Err(StateCacheError::invalid_parameter(
                "sample_count",
                format!("{} is not a power of two in 1..=16", count),
            )),
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_multisampled(&self) -> bool {
        self.0 > 1
    }

    /// log2 of the count, the 3-bit value stored in pipeline keys
    pub fn key(&self) -> u8 {
        self.0.trailing_zeros() as u8
    }
}

impl Default for SampleCount {
    fn default() -> Self {
        Self::ONE
    }
}

/// Store action an attachment is opened with, given the caller's intent
pub fn resolve_store_action(
    intent: StoreAction,
    multisampled: bool,
    has_resolve_target: bool,
    resolve_supported: bool,
    caps: &DeviceCapabilities,
) -> StoreAction {
    if !multisampled {
        return match intent {
            StoreAction::MultisampleResolve | StoreAction::StoreAndResolve => StoreAction::Store,
            other => other,
        };
    }

    if !has_resolve_target || !resolve_supported {
        let action = match intent {
            StoreAction::MultisampleResolve | StoreAction::StoreAndResolve => StoreAction::Store,
            other => other,
        };
        if action != intent {
            log::debug!(
                "No usable resolve target, storing samples instead of {:?}",
                intent
            );
        }
        return action;
    }

    match intent {
        StoreAction::DontCare | StoreAction::MultisampleResolve => StoreAction::MultisampleResolve,
        StoreAction::Store | StoreAction::StoreAndResolve => {
            if caps.store_and_resolve {
                StoreAction::StoreAndResolve
            } else {
                log::debug!("Store-and-resolve unsupported, falling back to resolve only");
                StoreAction::MultisampleResolve
            }
        }
        StoreAction::Unknown => StoreAction::Unknown,
    }
}

/// Store action used when an encoder ends for reasons unrelated to the attachment.
///
/// The pass is expected to continue in a new encoder, so the contents have to
/// survive. Multisampled attachments keep their samples and resolve when the
/// device can do both.
pub fn conditional_store_action(
    multisampled: bool,
    has_resolve_target: bool,
    caps: &DeviceCapabilities,
) -> StoreAction {
    if multisampled && has_resolve_target && caps.store_and_resolve {
        StoreAction::StoreAndResolve
    } else {
        StoreAction::Store
    }
}
