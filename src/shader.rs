//! Shader stages and compiled shader functions

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Logical shader stage
///
/// Each stage owns one resource binding table in the state cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Hull,
    Domain,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const COUNT: usize = 5;

    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::Hull,
        ShaderStage::Domain,
        ShaderStage::Fragment,
        ShaderStage::Compute,
    ];

    /// Stages whose binding-slot meaning changes when tessellation toggles
    pub const TESSELLATION_SENSITIVE: [ShaderStage; 3] =
        [ShaderStage::Vertex, ShaderStage::Hull, ShaderStage::Domain];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Hull => "hull",
            ShaderStage::Domain => "domain",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 128-bit content hash of compiled shader code
///
/// SHA-256 truncated to its first 16 bytes. Pipeline keys rely on this never
/// colliding for different code, which rules out a fast checksum.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShaderHash(pub [u8; 16]);

impl ShaderHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

impl fmt::Debug for ShaderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaderHash({:032x})", self.as_u128())
    }
}

impl fmt::Display for ShaderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.as_u128())
    }
}

/// Which binding slots a shader reads, as reported by the shader compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderReflection {
    pub buffers: u32,
    pub textures: u128,
    pub samplers: u16,
    /// Fragment stage writes depth
    pub writes_depth: bool,
}

/// Compiled shader code for one stage
#[derive(Debug)]
pub struct ShaderFunction {
    stage: ShaderStage,
    label: String,
    entry_point: String,
    bytecode: Arc<[u8]>,
    hash: ShaderHash,
    reflection: ShaderReflection,
}

impl ShaderFunction {
    pub fn new(
        stage: ShaderStage,
        label: impl Into<String>,
        entry_point: impl Into<String>,
        bytecode: impl Into<Arc<[u8]>>,
        reflection: ShaderReflection,
    ) -> Self {
        let bytecode = bytecode.into();
        let hash = ShaderHash::of(&bytecode);
        let label = label.into();
        log::trace!("Shader '{}' ({}) hashed to {}", label, stage, hash);
        Self {
            stage,
            label,
            entry_point: entry_point.into(),
            bytecode,
            hash,
            reflection,
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn bytecode(&self) -> &Arc<[u8]> {
        &self.bytecode
    }

    pub fn hash(&self) -> ShaderHash {
        self.hash
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}
