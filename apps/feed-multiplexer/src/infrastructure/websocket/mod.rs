//! WebSocket Transport
//!
//! `Transport` implementation over `tokio-tungstenite`.
//!
//! # Design
//!
//! The socket is split once at connect time. The read half sits behind an
//! async mutex and is only touched by `recv`. The write half is owned by a
//! writer task that drains an unbounded queue, so `send` never waits on the
//! network and can be called while holding the multiplexer lock.
//!
//! `close` cancels a token observed by both halves: a pending `recv` returns
//! end-of-stream and the writer sends a close frame before exiting.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connection to the upstream venue.
pub struct WebSocketTransport {
    url: String,
    reader: Mutex<SplitStream<WsStream>>,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl WebSocketTransport {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        tracing::info!(url, "Connecting to upstream feed");

        let (ws_stream, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

        let (write, read) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_writer(write, outbound_rx, cancel.clone()));

        tracing::info!(url, "Connected to upstream feed");

        Ok(Self {
            url: url.to_string(),
            reader: Mutex::new(read),
            outbound,
            cancel,
        })
    }

    /// Endpoint this transport is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&self) -> Result<String, TransportError> {
        let mut reader = self.reader.lock().await;

        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => return Err(TransportError::EndOfStream),
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Ping(data))) => {
                    // Writer gone means the connection is closing; the next read reports it.
                    let _ = self.outbound.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(url = %self.url, ?frame, "Server sent close frame");
                    return Err(TransportError::EndOfStream);
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Err(TransportError::EndOfStream);
                }
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::EndOfStream);
        }

        self.outbound
            .send(Message::Text(message.into()))
            .map_err(|_| TransportError::Io("writer task stopped".to_string()))
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(url = %self.url, "Closing upstream connection");
            self.cancel.cancel();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn run_writer(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    tracing::debug!(error = %e, "Failed to send close frame");
                }
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = write.send(message).await {
                    tracing::warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
        }
    }

    tracing::debug!("WebSocket writer stopped");
}
