use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, warn};

use crate::core::{LiveError, WebSocketBufferConfig, WsCloseFrame, WsFrame, WsTlsConfig};
use crate::tls::{install_rustls_crypto_provider, unverified_client_config};
use crate::transport::{WsTransport, WsTransportConnectFuture};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl From<Message> for WsFrame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => WsFrame::Text(Bytes::from(text)),
            Message::Binary(bytes) => WsFrame::Binary(bytes),
            Message::Ping(bytes) => WsFrame::Ping(bytes),
            Message::Pong(bytes) => WsFrame::Pong(bytes),
            Message::Close(frame) => WsFrame::Close(frame.map(|f| WsCloseFrame {
                code: u16::from(f.code),
                reason: Bytes::from(f.reason),
            })),
            // raw frames only surface when reading with `read_frame`
            Message::Frame(_) => WsFrame::Binary(Bytes::new()),
        }
    }
}

impl From<WsFrame> for Message {
    fn from(frame: WsFrame) -> Self {
        match frame {
            WsFrame::Text(bytes) => match Utf8Bytes::try_from(bytes.clone()) {
                Ok(text) => Message::Text(text),
                Err(_) => Message::Binary(bytes),
            },
            WsFrame::Binary(bytes) => Message::Binary(bytes),
            WsFrame::Ping(bytes) => Message::Ping(bytes),
            WsFrame::Pong(bytes) => Message::Pong(bytes),
            WsFrame::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
                code: f.code.into(),
                reason: Utf8Bytes::try_from(f.reason).unwrap_or_else(|_| Utf8Bytes::from_static("")),
            })),
        }
    }
}

fn io_error(context: &'static str) -> impl FnOnce(tokio_tungstenite::tungstenite::Error) -> LiveError {
    move |err| LiveError::TransportError {
        context,
        error: err.to_string(),
    }
}

fn socket_config(buffers: &WebSocketBufferConfig) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(buffers.max_message_bytes);
    config.max_frame_size = Some(buffers.max_frame_bytes);
    config.write_buffer_size = buffers.write_buffer_bytes;
    config.max_write_buffer_size = buffers.max_write_buffer_bytes;
    config
}

/// Agent backend socket over plain TCP or rustls.
///
/// Without an explicit connector, `wss://` uses webpki roots, or a verifier that accepts any
/// certificate when [`WsTlsConfig::validate_certs`] is off.
#[derive(Clone, Default)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
}

impl TungsteniteTransport {
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }

    /// Caller-built rustls config, e.g. with private roots for a staging backend.
    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }

    fn connector_for(&self, url: &str, tls: WsTlsConfig) -> Option<Connector> {
        match &self.connector {
            Some(connector) => {
                if !tls.validate_certs {
                    warn!(url, "custom connector in use; validate_certs=false has no effect");
                }
                Some(connector.clone())
            }
            None if !tls.validate_certs && url.starts_with("wss://") => {
                warn!(url, "server certificate validation disabled");
                Some(Connector::Rustls(unverified_client_config()))
            }
            None => None,
        }
    }
}

/// Inbound half of the backend socket.
pub struct TungsteniteReader {
    inner: SplitStream<Socket>,
}

impl Stream for TungsteniteReader {
    type Item = Result<WsFrame, LiveError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner
            .poll_next_unpin(cx)
            .map(|next| next.map(|read| read.map(WsFrame::from).map_err(io_error("read"))))
    }
}

/// Outbound half of the backend socket.
pub struct TungsteniteWriter {
    inner: SplitSink<Socket, Message>,
}

impl TungsteniteWriter {
    fn sink(self: Pin<&mut Self>) -> Pin<&mut SplitSink<Socket, Message>> {
        Pin::new(&mut self.get_mut().inner)
    }
}

impl Sink<WsFrame> for TungsteniteWriter {
    type Error = LiveError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sink().poll_ready(cx).map_err(io_error("write"))
    }

    fn start_send(self: Pin<&mut Self>, frame: WsFrame) -> Result<(), Self::Error> {
        self.sink()
            .start_send(Message::from(frame))
            .map_err(io_error("write"))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sink().poll_flush(cx).map_err(io_error("flush"))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sink().poll_close(cx).map_err(io_error("close"))
    }
}

impl WsTransport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
        tls: WsTlsConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector_for(&url, tls);
        Box::pin(async move {
            install_rustls_crypto_provider();
            let config = socket_config(&buffers);

            let (socket, response) =
                connect_async_tls_with_config(url.as_str(), Some(config), true, connector)
                    .await
                    .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;
            debug!(url = %url, status = %response.status(), "websocket handshake complete");

            let (write, read) = socket.split();
            Ok((
                TungsteniteReader { inner: read },
                TungsteniteWriter { inner: write },
            ))
        })
    }
}
