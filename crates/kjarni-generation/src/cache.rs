//! Key/value cache state carried between decoder steps.
//!
//! The cache is opaque to the engine: a pair of tensors produced by the
//! executor on one step and handed back to it on the next. The manager only
//! decides which feeding shape a step uses and makes sure superseded tensors
//! are released as soon as they are replaced.

use log::{debug, warn};
use ndarray::ArrayD;

use crate::model::SequenceModel;

/// Accumulated key/value state, owned by the decoding loop between steps.
#[derive(Debug, Clone)]
pub struct CachePair {
    pub key: ArrayD<f32>,
    pub value: ArrayD<f32>,
}

impl CachePair {
    pub fn new(key: ArrayD<f32>, value: ArrayD<f32>) -> Self {
        Self { key, value }
    }

    /// Number of f32 elements held across both tensors.
    pub fn num_elements(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// How the next decoder step feeds the executor.
#[derive(Debug, Clone, Copy)]
pub enum StepMode<'a> {
    /// Feed the whole prefix, no past state.
    Init,
    /// Feed only the most recent token alongside the existing cache.
    Cached(&'a CachePair),
}

impl StepMode<'_> {
    pub fn is_init(&self) -> bool {
        matches!(self, StepMode::Init)
    }
}

/// Tracks the live cache pair for one generation call.
#[derive(Debug)]
pub struct KvCacheManager {
    enabled: bool,
    current: Option<CachePair>,
    /// Number of cache pairs released so far.
    released: usize,
}

impl KvCacheManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            current: None,
            released: 0,
        }
    }

    pub fn released(&self) -> usize {
        self.released
    }

    pub fn current(&self) -> Option<&CachePair> {
        self.current.as_ref()
    }

    /// Feeding shape for the next step.
    pub fn mode(&self) -> StepMode<'_> {
        match (&self.current, self.enabled) {
            (Some(cache), true) => StepMode::Cached(cache),
            _ => StepMode::Init,
        }
    }

    /// Installs the cache returned by the latest step and releases the old one.
    ///
    /// With caching disabled the new pair is released straight away.
    pub fn replace(&mut self, new_cache: Option<CachePair>, model: &dyn SequenceModel) {
        if let Some(old) = self.current.take() {
            self.release_pair(old, model);
        }
        match new_cache {
            Some(cache) if self.enabled => {
                debug!("cache updated: {} elements", cache.num_elements());
                self.current = Some(cache);
            }
            Some(cache) => self.release_pair(cache, model),
            None => {
                if self.enabled {
                    warn!("executor returned no cache; next step will re-feed the full prefix");
                }
            }
        }
    }

    /// Releases whatever cache is still held. Safe to call more than once.
    pub fn release(&mut self, model: &dyn SequenceModel) {
        if let Some(cache) = self.current.take() {
            self.release_pair(cache, model);
        }
    }

    fn release_pair(&mut self, cache: CachePair, model: &dyn SequenceModel) {
        match model.release_cache(cache) {
            Ok(()) => self.released += 1,
            Err(e) => warn!("failed to release cache tensors: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelArchitecture, StepInput, StepOutput};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use ndarray::IxDyn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ReleaseCounter {
        released: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SequenceModel for ReleaseCounter {
        fn architecture(&self) -> ModelArchitecture {
            ModelArchitecture::DecoderOnly
        }
        fn vocab_size(&self) -> usize {
            4
        }
        fn max_position_embeddings(&self) -> usize {
            16
        }
        fn eos_token_id(&self) -> Option<u32> {
            None
        }
        fn pad_token_id(&self) -> u32 {
            0
        }
        async fn forward_step(&self, _input: StepInput<'_>) -> Result<StepOutput> {
            Err(anyhow!("not used"))
        }
        fn release_cache(&self, _cache: CachePair) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("device lost"))
            } else {
                Ok(())
            }
        }
    }

    fn pair(v: f32) -> CachePair {
        CachePair::new(
            ArrayD::from_elem(IxDyn(&[1, 2]), v),
            ArrayD::from_elem(IxDyn(&[1, 2]), v),
        )
    }

    #[test]
    fn test_starts_in_init_mode() {
        let manager = KvCacheManager::new(true);
        assert!(manager.mode().is_init());
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_replace_switches_to_cached_and_releases_old() {
        let model = ReleaseCounter {
            released: AtomicUsize::new(0),
            fail: false,
        };
        let mut manager = KvCacheManager::new(true);

        manager.replace(Some(pair(1.0)), &model);
        assert!(!manager.mode().is_init());
        assert_eq!(model.released.load(Ordering::SeqCst), 0);

        manager.replace(Some(pair(2.0)), &model);
        assert_eq!(model.released.load(Ordering::SeqCst), 1);
        match manager.mode() {
            StepMode::Cached(c) => assert_eq!(c.key[[0, 0]], 2.0),
            StepMode::Init => panic!("expected cached mode"),
        }

        manager.release(&model);
        assert_eq!(model.released.load(Ordering::SeqCst), 2);
        assert!(manager.mode().is_init());
        assert_eq!(manager.released(), 2);
    }

    #[test]
    fn test_disabled_cache_releases_immediately() {
        let model = ReleaseCounter {
            released: AtomicUsize::new(0),
            fail: false,
        };
        let mut manager = KvCacheManager::new(false);
        manager.replace(Some(pair(1.0)), &model);

        assert!(manager.mode().is_init());
        assert!(manager.current().is_none());
        assert_eq!(model.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_cache_falls_back_to_init() {
        let model = ReleaseCounter {
            released: AtomicUsize::new(0),
            fail: false,
        };
        let mut manager = KvCacheManager::new(true);
        manager.replace(Some(pair(1.0)), &model);
        manager.replace(None, &model);
        assert!(manager.mode().is_init());
    }

    #[test]
    fn test_release_failure_is_not_fatal() {
        let model = ReleaseCounter {
            released: AtomicUsize::new(0),
            fail: true,
        };
        let mut manager = KvCacheManager::new(true);
        manager.replace(Some(pair(1.0)), &model);
        manager.replace(Some(pair(2.0)), &model);
        manager.release(&model);

        assert_eq!(model.released.load(Ordering::SeqCst), 2);
        assert_eq!(manager.released(), 0);
        assert!(manager.current().is_none());
    }
}
