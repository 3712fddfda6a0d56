//! Processor registry and init-block cache.
//!
//! One registry instance is owned by the job manager. Registration happens
//! at startup; lookups dominate afterwards, so both maps sit behind
//! reader-writer locks. Init blocks are constructed lazily with
//! double-checked locking and drained at every iteration boundary.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::error::{ConfigurationError, RegistryError};
use crate::processor::{BatchProcessor, InitBlock, Initializer, SlowQueryProcessor};

/// Registered capability for one `(app, op)` pair. Batch and slow-query
/// processors share the namespace; a duplicate of either kind fails.
#[derive(Clone)]
pub enum RegisteredProcessor {
    Batch(Arc<dyn BatchProcessor>),
    SlowQuery(Arc<dyn SlowQueryProcessor>),
}

#[derive(Default)]
struct Registrations {
    initializers: HashMap<String, Arc<dyn Initializer>>,
    processors: HashMap<(String, String), RegisteredProcessor>,
}

#[derive(Default)]
pub struct ProcessorRegistry {
    registrations: RwLock<Registrations>,
    init_blocks: RwLock<HashMap<String, Arc<dyn InitBlock>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_initializer(
        &self,
        app: &str,
        initializer: Arc<dyn Initializer>,
    ) -> Result<(), RegistryError> {
        let mut regs = self.registrations.write();
        if regs.initializers.contains_key(app) {
            return Err(RegistryError::InitializerRegistered(app.to_string()));
        }
        regs.initializers.insert(app.to_string(), initializer);
        Ok(())
    }

    pub fn register_batch_processor(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<(), RegistryError> {
        self.register(app, op, RegisteredProcessor::Batch(processor))
    }

    pub fn register_slow_query_processor(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn SlowQueryProcessor>,
    ) -> Result<(), RegistryError> {
        self.register(app, op, RegisteredProcessor::SlowQuery(processor))
    }

    fn register(
        &self,
        app: &str,
        op: &str,
        processor: RegisteredProcessor,
    ) -> Result<(), RegistryError> {
        let key = (app.to_string(), op.to_lowercase());
        let mut regs = self.registrations.write();
        if regs.processors.contains_key(&key) {
            return Err(RegistryError::ProcessorRegistered {
                app: key.0,
                op: key.1,
            });
        }
        regs.processors.insert(key, processor);
        Ok(())
    }

    pub fn get_processor(&self, app: &str, op: &str) -> Option<RegisteredProcessor> {
        let key = (app.to_string(), op.to_lowercase());
        self.registrations.read().processors.get(&key).cloned()
    }

    pub fn initializer(&self, app: &str) -> Option<Arc<dyn Initializer>> {
        self.registrations.read().initializers.get(app).cloned()
    }

    /// Double-checked lazy construction of the per-app init block.
    ///
    /// The initializer runs without any lock held; if two tasks race, the
    /// first insert wins and the loser's block is closed best-effort.
    pub async fn get_or_create_init_block(&self, app: &str) -> Result<Arc<dyn InitBlock>> {
        if let Some(block) = self.init_blocks.read().get(app) {
            return Ok(block.clone());
        }

        let initializer = self.initializer(app).ok_or_else(|| {
            ConfigurationError::InitializerNotFound {
                app: app.to_string(),
            }
        })?;

        let block = initializer
            .init(app)
            .await
            .map_err(|e| ConfigurationError::InitFailed {
                app: app.to_string(),
                reason: format!("{e:#}"),
            })?;

        let (winner, loser) = {
            let mut blocks = self.init_blocks.write();
            match blocks.get(app) {
                Some(existing) => (existing.clone(), Some(block)),
                None => {
                    blocks.insert(app.to_string(), block.clone());
                    (block, None)
                }
            }
        };
        if let Some(extra) = loser {
            let _ = extra.close().await;
        }
        Ok(winner)
    }

    /// Drain every cached init block. The caller closes them (and logs
    /// close failures); draining under the lock keeps the await outside it.
    pub fn release_init_blocks(&self) -> Vec<(String, Arc<dyn InitBlock>)> {
        self.init_blocks.write().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::types::{BatchDetails, BatchOutput};

    #[derive(Debug)]
    struct NoopBlock;

    #[async_trait::async_trait]
    impl InitBlock for NoopBlock {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct CountingInitializer {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Initializer for CountingInitializer {
        async fn init(&self, _app: &str) -> Result<Arc<dyn InitBlock>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopBlock))
        }
    }

    struct NoopProcessor;

    #[async_trait::async_trait]
    impl BatchProcessor for NoopProcessor {
        async fn do_batch_job(
            &self,
            _init: &dyn InitBlock,
            _context: &Value,
            _line: i32,
            _input: &Value,
        ) -> Result<BatchOutput> {
            Ok(BatchOutput::success(Value::Null))
        }

        async fn mark_done(
            &self,
            _init: &dyn InitBlock,
            _context: &Value,
            _details: &BatchDetails,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_registrations_fail() {
        let registry = ProcessorRegistry::new();
        let init = Arc::new(CountingInitializer {
            calls: AtomicUsize::new(0),
        });
        registry.register_initializer("app", init.clone()).unwrap();
        assert_eq!(
            registry.register_initializer("app", init),
            Err(RegistryError::InitializerRegistered("app".into()))
        );

        registry
            .register_batch_processor("app", "op", Arc::new(NoopProcessor))
            .unwrap();
        assert!(matches!(
            registry.register_batch_processor("app", "op", Arc::new(NoopProcessor)),
            Err(RegistryError::ProcessorRegistered { .. })
        ));
    }

    #[test]
    fn op_is_lowercased_on_registration() {
        let registry = ProcessorRegistry::new();
        registry
            .register_batch_processor("app", "MixedCase", Arc::new(NoopProcessor))
            .unwrap();
        assert!(registry.get_processor("app", "mixedcase").is_some());
        assert!(registry.get_processor("app", "MIXEDCASE").is_some());
        assert!(matches!(
            registry.register_batch_processor("app", "MIXEDCASE", Arc::new(NoopProcessor)),
            Err(RegistryError::ProcessorRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn init_block_is_constructed_once_until_released() {
        let registry = ProcessorRegistry::new();
        let init = Arc::new(CountingInitializer {
            calls: AtomicUsize::new(0),
        });
        registry.register_initializer("app", init.clone()).unwrap();

        registry.get_or_create_init_block("app").await.unwrap();
        registry.get_or_create_init_block("app").await.unwrap();
        assert_eq!(init.calls.load(Ordering::SeqCst), 1);

        let released = registry.release_init_blocks();
        assert_eq!(released.len(), 1);

        registry.get_or_create_init_block("app").await.unwrap();
        assert_eq!(init.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_initializer_is_a_configuration_error() {
        let registry = ProcessorRegistry::new();
        let err = registry.get_or_create_init_block("ghost").await.unwrap_err();
        assert!(err.is::<ConfigurationError>());
    }
}
