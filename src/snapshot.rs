use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async, tungstenite::Message,
};
use tokio_util::sync::CancellationToken;

use crate::encoder;
use crate::master::table::SharedTable;
use crate::metrics::{self, METRICS};
use crate::schema::Snapshot;

/// ============================================================
/// SnapshotServer
/// ============================================================
///
/// Request/reply endpoint over the master table.
///
/// CONTRACT:
/// - Every data frame from a consumer is one request
/// - Every request gets exactly one reply: the whole table
/// - Nothing is ever pushed unprompted
///
/// NOTES:
/// - The table is copied under the read lock and the lock is
///   released before the reply is written, so a slow consumer
///   never stalls the merger
/// - A broken consumer only loses its own connection
pub struct SnapshotServer {
    listener: TcpListener,
    table: SharedTable,
    compress: bool,
}

impl SnapshotServer {
    pub async fn bind(addr: &str, table: SharedTable, compress: bool) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding snapshot endpoint {}", addr))?;

        Ok(Self {
            listener,
            table,
            compress,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; one task per consumer connection.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_consumer(
                        stream,
                        peer,
                        self.table.clone(),
                        self.compress,
                        cancel.clone(),
                    ));
                }
                Err(e) => log::warn!("snapshot accept failed: {}", e),
            }
        }

        log::info!("snapshot server stopped");
    }
}

async fn handle_consumer(
    stream: TcpStream,
    peer: SocketAddr,
    table: SharedTable,
    compress: bool,
    cancel: CancellationToken,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            metrics::incr(&METRICS.request_errors);
            log::warn!("snapshot handshake with {} failed: {}", peer, e);
            return;
        }
    };

    METRICS
        .snapshot_connections_active
        .fetch_add(1, Ordering::Relaxed);
    log::debug!("consumer connected from {}", peer);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws.next() => msg,
        };

        let request = match msg {
            Some(Ok(msg)) if msg.is_close() => break,
            Some(Ok(msg)) if encoder::is_data_frame(&msg) => msg,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                metrics::incr(&METRICS.request_errors);
                log::warn!("consumer {} lost: {}", peer, e);
                break;
            }
            None => break,
        };

        if let Message::Text(label) = &request {
            log::debug!("snapshot request from {}: {}", peer, label);
        }

        let snapshot = table.snapshot().await;

        let reply = match encoder::encode_frame(&snapshot, compress) {
            Ok(reply) => reply,
            Err(e) => {
                metrics::incr(&METRICS.request_errors);
                log::error!("encoding snapshot for {} failed: {}", peer, e);
                break;
            }
        };

        if let Err(e) = ws.send(reply).await {
            metrics::incr(&METRICS.request_errors);
            log::warn!("reply to {} failed: {}", peer, e);
            break;
        }

        metrics::incr(&METRICS.snapshots_served);
    }

    METRICS
        .snapshot_connections_active
        .fetch_sub(1, Ordering::Relaxed);
    log::debug!("consumer {} disconnected", peer);
}

/// Consumer side of the snapshot endpoint.
pub struct SnapshotClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SnapshotClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("connecting to snapshot server {}", url))?;

        Ok(Self { ws })
    }

    /// Sends one request and waits for its reply.
    pub async fn request(&mut self, target: &str) -> Result<Snapshot> {
        self.ws
            .send(Message::Text(target.to_string().into()))
            .await
            .context("sending snapshot request")?;

        while let Some(msg) = self.ws.next().await {
            let msg = msg.context("reading snapshot reply")?;
            if msg.is_close() {
                break;
            }
            if encoder::is_data_frame(&msg) {
                return Ok(encoder::decode_frame(&msg)?);
            }
        }

        anyhow::bail!("snapshot server closed the connection")
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Batch, EventTime, NO_RUN, Value};

    async fn start(table: SharedTable, compress: bool) -> (String, CancellationToken) {
        let server = SnapshotServer::bind("127.0.0.1:0", table, compress)
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (url, cancel)
    }

    #[tokio::test]
    async fn empty_table_gives_empty_snapshot() {
        let (url, cancel) = start(SharedTable::new(), false).await;

        let mut client = SnapshotClient::connect(&url).await.unwrap();
        let snap = client.request("Request_probe").await.unwrap();

        assert_eq!(snap.run_id, NO_RUN);
        assert!(snap.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn each_request_sees_current_table() {
        let table = SharedTable::new();
        let (url, cancel) = start(table.clone(), true).await;
        let mut client = SnapshotClient::connect(&url).await.unwrap();

        assert!(client.request("a").await.unwrap().is_empty());

        table.write().await.append(Batch {
            run_id: 12,
            sender_id: 1,
            event_count_seen: 2,
            event_count_sent: 2,
            send_timestamp: EventTime::new(5, 0),
            fields: [("ipm2_sum".to_string(), vec![Value::Float(1.0), Value::Float(2.0)])]
                .into_iter()
                .collect(),
            end_of_run: false,
        });

        let snap = client.request("b").await.unwrap();
        assert_eq!(snap.run_id, 12);
        assert_eq!(snap.len_of("ipm2_sum"), 2);
        assert_eq!(snap.events_merged, 2);

        client.close().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn broken_consumer_does_not_stop_the_server() {
        let (url, cancel) = start(SharedTable::new(), false).await;

        // raw TCP garbage fails the handshake
        {
            use tokio::io::AsyncWriteExt;
            let addr = url.trim_start_matches("ws://");
            let mut raw = TcpStream::connect(addr).await.unwrap();
            raw.write_all(b"hello\r\n\r\n").await.unwrap();
        }

        let mut client = SnapshotClient::connect(&url).await.unwrap();
        assert!(client.request("after").await.is_ok());
        cancel.cancel();
    }
}
