//! Same-process transport: publish calls subscribers directly.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kdash_core::{KdashError, KdashResult};
use tracing::debug;

use crate::{Delivery, Handler, HandlerTable, Message, Transport};

#[derive(Default)]
pub struct InProcTransport {
    table: HandlerTable,
    closed: AtomicBool,
}

impl InProcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.table.topics()
    }
}

#[async_trait]
impl Transport for InProcTransport {
    async fn connect(&self) -> KdashResult<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn listen(&self) -> KdashResult<()> {
        self.connect().await
    }

    async fn publish(&self, msg: &Message) -> KdashResult<Delivery> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KdashError::TransportUnavailable("in-process transport closed".into()));
        }
        let delivery = self.table.dispatch(msg)?;
        debug!(topic = %msg.topic, cluster = %msg.cluster_id, ?delivery, "published");
        Ok(delivery)
    }

    fn subscribe(&self, topic: &str, handler: Handler) {
        self.table.subscribe(topic, handler);
    }

    async fn close(&self) -> KdashResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
