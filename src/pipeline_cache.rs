//! Pipeline object cache
//!
//! One cache per device, shared by every command context. Maps a
//! [`PipelineKey`] to the compiled pipeline object, compiling each distinct
//! key at most once for the lifetime of the device.
//!
//! # Locking
//! - Lookups take the map's read lock only.
//! - On a miss the caller re-checks under an upgradable read lock, since
//!   another thread may have inserted the key in between, then upgrades and
//!   inserts an empty slot for the key.
//! - Compilation runs after the map lock is released, inside the slot's
//!   `OnceCell`. Callers racing on the same key block on that cell; callers
//!   with other keys are never held up by it.
//!
//! A failed compilation is fatal: there is nothing sensible to draw with.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use thiserror::Error;

use crate::error::{fatal, Result, StateCacheError};
use crate::pipeline_descriptor::{
    build_descriptor, build_key, GraphicsPipelineState, PipelineDescriptor, PipelineReflection,
};
use crate::resources::NativePipelineId;
use crate::state_key::PipelineKey;
use crate::state_objects::BlendKeyTable;

/// Error reported by the backend pipeline compiler
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Backend pipeline compiler
pub trait PipelineCompiler: Send + Sync {
    /// Build a pipeline object. May block for as long as compilation takes.
    fn compile(&self, descriptor: &PipelineDescriptor) -> std::result::Result<NativePipelineId, CompileError>;
}

/// Compiled, immutable pipeline object
#[derive(Debug)]
pub struct PipelineObject {
    key: PipelineKey,
    native: NativePipelineId,
    reflection: PipelineReflection,
    label: String,
}

impl PipelineObject {
    pub fn new(
        key: PipelineKey,
        native: NativePipelineId,
        reflection: PipelineReflection,
        label: impl Into<String>,
    ) -> Self {
        Self {
            key,
            native,
            reflection,
            label: label.into(),
        }
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn native(&self) -> NativePipelineId {
        self.native
    }

    pub fn reflection(&self) -> &PipelineReflection {
        &self.reflection
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_tessellated(&self) -> bool {
        self.reflection.tessellated
    }
}

/// Cache statistics for monitoring effectiveness
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered by an already compiled pipeline
    pub hits: usize,
    /// Lookups that found no compiled pipeline
    pub misses: usize,
    /// Compilations performed
    pub compiles: usize,
    /// Pipelines cached
    pub entries: usize,
}

type Slot = Arc<OnceCell<Arc<PipelineObject>>>;

/// Device-wide pipeline cache
pub struct PipelineCache {
    pipelines: RwLock<HashMap<PipelineKey, Slot>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    compiles: AtomicUsize,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
        }
    }

    /// Return the pipeline for `key`, building it with `build` if it was never
    /// seen before.
    ///
    /// `build` runs at most once per key across all threads. An error from it
    /// is fatal.
    pub fn get_or_create<F>(&self, key: &PipelineKey, build: F) -> Arc<PipelineObject>
    where
        F: FnOnce() -> Result<PipelineObject>,
    {
        let slot = {
            let pipelines = self.pipelines.read();
            pipelines.get(key).cloned()
        };

        let slot = match slot {
            Some(slot) => {
                if let Some(pipeline) = slot.get() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Pipeline cache HIT: '{}'", pipeline.label());
                    return pipeline.clone();
                }
                // Another thread is compiling it; wait on the cell below
                slot
            }
            None => self.insert_slot(key),
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        slot.get_or_init(|| {
            self.compiles.fetch_add(1, Ordering::Relaxed);
            log::debug!("Pipeline cache MISS: compiling {:?}", key);
            match build() {
                Ok(pipeline) => {
                    log::info!(
                        "Created and cached pipeline '{}' ({:?})",
                        pipeline.label(),
                        pipeline.native()
                    );
                    Arc::new(pipeline)
                }
                Err(error) => fatal(error),
            }
        })
        .clone()
    }

    fn insert_slot(&self, key: &PipelineKey) -> Slot {
        let pipelines = self.pipelines.upgradable_read();
        if let Some(slot) = pipelines.get(key) {
            return slot.clone();
        }
        let mut pipelines = RwLockUpgradableReadGuard::upgrade(pipelines);
        pipelines
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Key, look up and if needed compile the pipeline for a graphics state.
    ///
    /// Key building errors (unencodable formats, too many targets) are
    /// returned; compilation errors are fatal.
    pub fn get_or_create_graphics(
        &self,
        state: &GraphicsPipelineState,
        blend_keys: &BlendKeyTable,
        compiler: &dyn PipelineCompiler,
    ) -> Result<Arc<PipelineObject>> {
        let key = build_key(state, blend_keys)?;
        Ok(self.get_or_create(&key, || {
            let descriptor = build_descriptor(state);
            let native = compiler
                .compile(&descriptor)
                .map_err(|e| StateCacheError::PipelineCompilation {
                    label: state.label.clone(),
                    error: e.to_string(),
                    descriptor: format!("{:#?}", descriptor),
                })?;
            Ok(PipelineObject::new(
                key.clone(),
                native,
                PipelineReflection::from_state(state),
                state.label.clone(),
            ))
        }))
    }

    /// Compiled pipeline for `key`, without compiling
    pub fn get(&self, key: &PipelineKey) -> Option<Arc<PipelineObject>> {
        self.pipelines.read().get(key).and_then(|slot| slot.get().cloned())
    }

    /// Number of cached pipelines
    pub fn len(&self) -> usize {
        self.pipelines.read().values().filter(|slot| slot.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline_descriptor::tests::basic_state;
    use crate::resources::IdAllocator;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    /// Compiler that counts invocations and takes a while
    pub(crate) struct CountingCompiler {
        pub(crate) calls: AtomicUsize,
        ids: IdAllocator,
        delay: Duration,
    }

    impl CountingCompiler {
        pub(crate) fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                ids: IdAllocator::new(),
                delay,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PipelineCompiler for CountingCompiler {
        fn compile(
            &self,
            _descriptor: &PipelineDescriptor,
        ) -> std::result::Result<NativePipelineId, CompileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(self.ids.next_pipeline())
        }
    }

    struct FailingCompiler;

    impl PipelineCompiler for FailingCompiler {
        fn compile(
            &self,
            _descriptor: &PipelineDescriptor,
        ) -> std::result::Result<NativePipelineId, CompileError> {
            Err(CompileError::new("fragment function 'main' not found"))
        }
    }

    #[test]
    fn test_concurrent_requests_compile_once() {
        let cache = PipelineCache::new();
        let blend_keys = BlendKeyTable::new();
        let compiler = CountingCompiler::new(Duration::from_millis(20));
        let state = basic_state();
        let barrier = Barrier::new(2);

        let results: Vec<Arc<PipelineObject>> = thread::scope(|s| {
            let mut handles = Vec::new();
            for _ in 0..2 {
                let (cache, blend_keys, compiler, state, barrier) =
                    (&cache, &blend_keys, &compiler, &state, &barrier);
                handles.push(s.spawn(move || {
                    barrier.wait();
                    cache.get_or_create_graphics(state, blend_keys, compiler).unwrap()
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(compiler.calls(), 1);
        assert!(Arc::ptr_eq(&results[0], &results[1]));
        assert_eq!(results[0].native(), results[1].native());
    }

    #[test]
    fn test_many_threads_many_keys() {
        let cache = PipelineCache::new();
        let blend_keys = BlendKeyTable::new();
        let compiler = CountingCompiler::new(Duration::from_millis(1));
        let mut states = vec![basic_state(), basic_state()];
        states[1].alpha_to_coverage = true;
        let barrier = Barrier::new(8);

        thread::scope(|s| {
            for i in 0..8 {
                let state = &states[i % 2];
                let (cache, blend_keys, compiler, barrier) = (&cache, &blend_keys, &compiler, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    cache.get_or_create_graphics(state, blend_keys, compiler).unwrap();
                });
            }
        });

        assert_eq!(compiler.calls(), 2);
        let stats = cache.stats();
        assert_eq!(stats.compiles, 2);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.hits + stats.misses, 8);
    }

    #[test]
    fn test_hit_after_compile() {
        let cache = PipelineCache::new();
        let blend_keys = BlendKeyTable::new();
        let compiler = CountingCompiler::new(Duration::ZERO);
        let state = basic_state();

        let first = cache.get_or_create_graphics(&state, &blend_keys, &compiler).unwrap();
        let second = cache.get_or_create_graphics(&state, &blend_keys, &compiler).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.get(first.key()).map(|p| p.native()), Some(first.native()));
        assert_eq!(first.label(), "basic");
    }

    #[test]
    #[should_panic(expected = "Pipeline compilation failed")]
    fn test_compile_failure_is_fatal() {
        let cache = PipelineCache::new();
        let blend_keys = BlendKeyTable::new();
        let _ = cache.get_or_create_graphics(&basic_state(), &blend_keys, &FailingCompiler);
    }
}
