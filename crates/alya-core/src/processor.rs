//! Processor capability traits.
//!
//! User code plugs into the engine through these traits. A batch processor
//! handles ordinary rows (`line >= 1`); a slow-query processor handles the
//! single `line == 0` row of a slow-query batch. Both receive the init block
//! their app's initializer produced.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::types::{BatchDetails, BatchOutput, SlowQueryOutput};

/// Per-app holder of user-initialized resources (connections, clients).
/// Created lazily by the registered [`Initializer`] and closed at iteration
/// boundaries and at shutdown.
#[async_trait]
pub trait InitBlock: Send + Sync + std::fmt::Debug + 'static {
    /// Downcast hook so processors can reach their concrete block.
    fn as_any(&self) -> &dyn Any;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Initializer: Send + Sync + 'static {
    async fn init(&self, app: &str) -> Result<Arc<dyn InitBlock>>;
}

#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    async fn do_batch_job(
        &self,
        init: &dyn InitBlock,
        context: &Value,
        line: i32,
        input: &Value,
    ) -> Result<BatchOutput>;

    /// Invoked once after the batch reaches a terminal status. Errors are
    /// logged by the engine and never affect the already-terminal batch.
    async fn mark_done(
        &self,
        init: &dyn InitBlock,
        context: &Value,
        details: &BatchDetails,
    ) -> Result<()>;
}

#[async_trait]
pub trait SlowQueryProcessor: Send + Sync + 'static {
    async fn do_slow_query(
        &self,
        init: &dyn InitBlock,
        context: &Value,
        input: &Value,
    ) -> Result<SlowQueryOutput>;

    async fn mark_done(
        &self,
        init: &dyn InitBlock,
        context: &Value,
        details: &BatchDetails,
    ) -> Result<()>;
}
