//! Change-data-capture pipeline: durable event store and broadcast fan-out.

pub mod changestream;
pub mod store;

use async_trait::async_trait;
use etre_core::CdcEvent;

pub use changestream::{
    ChangeStreamServer, CloseReason, ServerConfig, StreamItem, Streamer, StreamerFactory,
};
pub use store::{CdcStore, RetryPolicy};

/// The seam the entity store emits events through. `CdcStore` is the real
/// implementation; a no-op writer stands in when CDC is disabled.
#[async_trait]
pub trait CdcWriter: Send + Sync {
    async fn write(&self, event: CdcEvent) -> etre_core::Result<()>;
}

/// Discards every event. Used when `cdc.disabled` is set.
pub struct NoopCdcWriter;

#[async_trait]
impl CdcWriter for NoopCdcWriter {
    async fn write(&self, _event: CdcEvent) -> etre_core::Result<()> {
        Ok(())
    }
}
