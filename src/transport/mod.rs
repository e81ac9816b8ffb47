use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{LiveError, WebSocketBufferConfig, WsFrame, WsTlsConfig};

pub mod tungstenite;

/// Boxed connect future returned by [`WsTransport::connect`].
pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), LiveError>> + Send>>;

/// Transport boundary for websocket IO.
///
/// The IO loop lives outside kameo; the transport actor owns state and policies. Tests swap in
/// an in-memory implementation (see `testing::MockTransport`).
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, LiveError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = LiveError> + Send + Sync + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
        tls: WsTlsConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
