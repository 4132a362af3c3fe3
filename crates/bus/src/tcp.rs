//! Cross-process transport: newline-delimited JSON over TCP.
//!
//! Each request line is a [`Message`]; the subscriber side answers every request with one
//! [`Ack`] line. A publisher keeps a single connection and reconnects lazily after failures.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use kdash_core::{KdashError, KdashResult};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Delivery, Handler, HandlerTable, Message, Transport};

const MAX_LINE: usize = 16 * 1024 * 1024;

/// Reply to one published message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub delivered: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<KdashError>,
}

impl Ack {
    fn from_dispatch(result: KdashResult<Delivery>, topic: &str) -> Self {
        match result {
            Ok(Delivery::Delivered(n)) => Ack { success: true, message: String::new(), delivered: n, error: None },
            Ok(Delivery::NoSubscribers) => {
                Ack { success: false, message: format!("no subscribers for {}", topic), delivered: 0, error: None }
            }
            Err(e) => Ack { success: false, message: e.to_string(), delivered: 0, error: Some(e) },
        }
    }

    fn into_delivery(self) -> KdashResult<Delivery> {
        match (self.success, self.error) {
            (true, _) => Ok(Delivery::Delivered(self.delivered)),
            (false, Some(e)) => Err(e),
            (false, None) => Ok(Delivery::NoSubscribers),
        }
    }
}

type Conn = Framed<TcpStream, LinesCodec>;

fn unavailable(what: &str, e: impl std::fmt::Display) -> KdashError {
    KdashError::TransportUnavailable(format!("{}: {}", what, e))
}

fn codec_err(e: LinesCodecError) -> KdashError {
    unavailable("line codec", e)
}

pub struct TcpTransport {
    publish_addr: String,
    listen_addr: String,
    table: Arc<HandlerTable>,
    conn: Mutex<Option<Conn>>,
    bound: std::sync::Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new(publish_addr: impl Into<String>, listen_addr: impl Into<String>) -> Self {
        Self {
            publish_addr: publish_addr.into(),
            listen_addr: listen_addr.into(),
            table: Arc::new(HandlerTable::default()),
            conn: Mutex::new(None),
            bound: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            io_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Address actually bound by [`Transport::listen`] (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dial(&self) -> KdashResult<Conn> {
        let stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(&self.publish_addr))
            .await
            .map_err(|_| unavailable(&self.publish_addr, "connect timed out"))?
            .map_err(|e| unavailable(&self.publish_addr, e))?;
        stream.set_nodelay(true).map_err(|e| unavailable(&self.publish_addr, e))?;
        debug!(addr = %self.publish_addr, "publisher connected");
        Ok(Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE)))
    }
}

async fn roundtrip(conn: &mut Conn, msg: &Message) -> KdashResult<Ack> {
    conn.send(serde_json::to_string(msg)?).await.map_err(codec_err)?;
    match conn.next().await {
        Some(Ok(line)) => serde_json::from_str(&line).map_err(|e| unavailable("malformed ack", e)),
        Some(Err(e)) => Err(codec_err(e)),
        None => Err(KdashError::TransportUnavailable("connection closed by subscriber".into())),
    }
}

fn handle_line(table: &HandlerTable, line: &str) -> Ack {
    match serde_json::from_str::<Message>(line) {
        Ok(msg) => Ack::from_dispatch(table.dispatch(&msg), &msg.topic),
        Err(e) => {
            let err = KdashError::Validation(format!("malformed publish request: {}", e));
            Ack { success: false, message: err.to_string(), delivered: 0, error: Some(err) }
        }
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, table: Arc<HandlerTable>, shutdown: CancellationToken) {
    let mut conn = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    debug!(%peer, "publisher attached");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = conn.next() => next,
        };
        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(%peer, error = %e, "dropping publisher connection");
                break;
            }
        };
        // handlers may do blocking store I/O
        let dispatch_table = Arc::clone(&table);
        let ack = match tokio::task::spawn_blocking(move || handle_line(&dispatch_table, &line)).await {
            Ok(ack) => ack,
            Err(e) => {
                let err = KdashError::Internal(format!("handler task failed: {}", e));
                Ack { success: false, message: err.to_string(), delivered: 0, error: Some(err) }
            }
        };
        let reply = match serde_json::to_string(&ack) {
            Ok(r) => r,
            Err(e) => {
                warn!(%peer, error = %e, "encoding ack");
                break;
            }
        };
        if let Err(e) = conn.send(reply).await {
            warn!(%peer, error = %e, "writing ack");
            break;
        }
    }
    debug!(%peer, "publisher detached");
}

async fn accept_loop(listener: TcpListener, table: Arc<HandlerTable>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(serve(stream, peer, Arc::clone(&table), shutdown.clone()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    info!("transport listener stopped");
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> KdashResult<()> {
        let conn = self.dial().await?;
        *self.conn.lock().await = Some(conn);
        Ok(())
    }

    async fn listen(&self) -> KdashResult<()> {
        let listener = TcpListener::bind(&self.listen_addr).await.map_err(|e| unavailable(&self.listen_addr, e))?;
        let addr = listener.local_addr().map_err(|e| unavailable(&self.listen_addr, e))?;
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        info!(%addr, "transport listening");
        tokio::spawn(accept_loop(listener, Arc::clone(&self.table), self.shutdown.clone()));
        Ok(())
    }

    async fn publish(&self, msg: &Message) -> KdashResult<Delivery> {
        let started = Instant::now();
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        let outcome = match guard.as_mut() {
            Some(conn) => tokio::time::timeout(self.io_timeout, roundtrip(conn, msg)).await,
            None => return Err(KdashError::Internal("publisher connection missing".into())),
        };
        let ack = match outcome {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                *guard = None;
                counter!("kdash_bus_publish_errors_total", 1, "topic" => msg.topic.clone());
                return Err(e);
            }
            Err(_) => {
                *guard = None;
                counter!("kdash_bus_publish_errors_total", 1, "topic" => msg.topic.clone());
                return Err(unavailable(&self.publish_addr, "publish timed out"));
            }
        };
        histogram!("kdash_bus_publish_ms", started.elapsed().as_secs_f64() * 1000.0);
        ack.into_delivery()
    }

    fn subscribe(&self, topic: &str, handler: Handler) {
        self.table.subscribe(topic, handler);
    }

    async fn close(&self) -> KdashResult<()> {
        self.shutdown.cancel();
        *self.conn.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_maps_back_to_delivery() {
        assert_eq!(Ack::from_dispatch(Ok(Delivery::Delivered(2)), "t").into_delivery(), Ok(Delivery::Delivered(2)));
        assert_eq!(Ack::from_dispatch(Ok(Delivery::NoSubscribers), "t").into_delivery(), Ok(Delivery::NoSubscribers));
        let err = KdashError::StoreConflict("dup".into());
        assert_eq!(Ack::from_dispatch(Err(err.clone()), "t").into_delivery(), Err(err));
    }

    #[test]
    fn malformed_request_is_a_validation_error() {
        let ack = handle_line(&HandlerTable::default(), "not json");
        assert!(!ack.success);
        assert!(matches!(ack.error, Some(KdashError::Validation(_))));
    }
}
