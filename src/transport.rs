use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async, tungstenite::Message,
};
use tokio_util::sync::CancellationToken;

use anyhow::{Context, Result};

use crate::encoder;
use crate::metrics::{self, METRICS};
use crate::schema::Batch;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// ============================================================
/// ScatterSender
/// ============================================================
///
/// Represents a worker's **single persistent WebSocket connection**
/// to the master's scatter endpoint.
///
/// Responsibilities:
/// - Connect once at startup (failure is fatal for the worker)
/// - Send one frame per batch, in flush order
/// - Detect connection loss through a reader task
///
/// Design constraints:
/// - One connection per sender keeps batches FIFO end to end
/// - `send` awaits the socket: a slow master blocks the worker
///   instead of silently dropping batches
/// - No reconnect: after a transport failure this sender stops
///   contributing and the master keeps what it already merged
pub struct ScatterSender {
    write: WsWriter,

    /// Set by the reader task once the master side is gone.
    closed: Arc<AtomicBool>,

    compress: bool,
}

impl ScatterSender {
    /// Establishes the connection to the master.
    pub async fn connect(master_url: &str, compress: bool) -> Result<Self> {
        let (ws, _) = connect_async(master_url)
            .await
            .with_context(|| format!("connecting to master at {}", master_url))?;
        let (write, mut read) = ws.split();

        let closed = Arc::new(AtomicBool::new(false));

        // ------------------------------------------------------------
        // READER TASK
        // ------------------------------------------------------------
        // Purpose:
        // - Consume incoming frames (the master sends none besides
        //   control frames)
        // - Detect EOF / connection close
        tokio::spawn({
            let closed = closed.clone();
            let url = master_url.to_string();

            async move {
                while let Some(Ok(msg)) = read.next().await {
                    if let Message::Text(text) = msg {
                        log::debug!("[master recv] {}", text);
                    }
                }

                log::warn!("master connection {} ended", url);
                closed.store(true, Ordering::SeqCst);
            }
        });

        log::info!("connected to master at {}", master_url);

        Ok(Self {
            write,
            closed,
            compress,
        })
    }

    /// Sends one batch; an error means this sender is done.
    pub async fn send(&mut self, batch: &Batch) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("master closed connection");
        }

        let frame = encoder::encode_frame(batch, self.compress)?;
        self.write
            .send(frame)
            .await
            .context("sending batch to master")?;

        metrics::incr(&METRICS.batches_sent);
        Ok(())
    }

    /// Sends a close frame; errors are irrelevant at this point.
    pub async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}

/// ============================================================
/// BatchSink
/// ============================================================
///
/// Where a worker's batches go.
///
/// DEMO MODE:
/// - No network connection
/// - Batches are summarized in the log
pub enum BatchSink {
    Remote(ScatterSender),
    Demo,
}

impl BatchSink {
    pub async fn send(&mut self, batch: &Batch) -> Result<()> {
        match self {
            BatchSink::Remote(sender) => sender.send(batch).await,
            BatchSink::Demo => {
                log::info!(
                    "DEMO -> sender={} run={} events={} keys={:?} end_of_run={}",
                    batch.sender_id,
                    batch.run_id,
                    batch.event_count_sent,
                    batch.fields.keys().collect::<Vec<_>>(),
                    batch.end_of_run
                );
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) {
        if let BatchSink::Remote(sender) = self {
            sender.close().await;
        }
    }
}

/// Binds the master's scatter endpoint.
///
/// A bind failure is an unrecoverable startup error.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding scatter endpoint {}", addr))
}

/// Accepts worker connections until cancelled.
///
/// Every connection gets its own reader task, so batches from one
/// sender stay in order while senders interleave freely in `tx`.
pub async fn serve_scatter(
    listener: TcpListener,
    tx: mpsc::Sender<Batch>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(handle_sender(stream, peer, tx.clone(), cancel.clone()));
            }
            Err(e) => {
                log::warn!("scatter accept failed: {}", e);
            }
        }
    }

    log::info!("scatter listener stopped");
}

/// Reads batches from one worker connection into the merge queue.
///
/// BACKPRESSURE:
/// - `tx` is bounded; when the merger falls behind, this task waits
///   on the queue and stops reading the socket, so TCP flow control
///   eventually blocks the worker's send
async fn handle_sender(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Batch>,
    cancel: CancellationToken,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("scatter handshake with {} failed: {}", peer, e);
            return;
        }
    };

    METRICS
        .scatter_connections_active
        .fetch_add(1, Ordering::Relaxed);
    log::info!("sender connected from {}", peer);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws.next() => msg,
        };

        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                log::warn!("sender {} lost: {}", peer, e);
                break;
            }
            None => break,
        };

        if msg.is_close() {
            break;
        }
        if !encoder::is_data_frame(&msg) {
            continue;
        }

        let batch: Batch = match encoder::decode_frame(&msg) {
            Ok(batch) => batch,
            Err(e) => {
                metrics::incr(&METRICS.decode_errors);
                log::warn!("undecodable batch from {}: {}", peer, e);
                continue;
            }
        };

        metrics::incr(&METRICS.batches_received);

        let delivered = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(batch) => sent.is_ok(),
        };
        if !delivered {
            log::warn!("merge queue closed, dropping connection {}", peer);
            break;
        }
    }

    METRICS
        .scatter_connections_active
        .fetch_sub(1, Ordering::Relaxed);
    log::info!("sender {} disconnected", peer);
}
