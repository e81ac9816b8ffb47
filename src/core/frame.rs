use bytes::Bytes;

/// Close code for a deliberate, clean shutdown. The backend never triggers a reconnect with it.
pub const CLOSE_NORMAL: u16 = 1000;

/// Websocket frame as seen by the transport actor, independent of the socket library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl WsCloseFrame {
    pub fn is_clean(&self) -> bool {
        self.code == CLOSE_NORMAL
    }

    pub fn reason_text(&self) -> &str {
        std::str::from_utf8(&self.reason).unwrap_or("")
    }
}

impl WsFrame {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    pub fn close(code: u16, reason: impl Into<Bytes>) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: reason.into(),
        }))
    }

    /// Sent by `disconnect()`: 1000 "Client disconnect".
    pub fn client_disconnect() -> Self {
        Self::close(CLOSE_NORMAL, Bytes::from_static(b"Client disconnect"))
    }

    /// JSON payload of a text or binary frame. Control frames carry none.
    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        self.payload().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}
