use bytes::Bytes;

/// Transport-neutral websocket frame type.
///
/// Transports convert their native frame representation into/from `WsFrame`; everything above
/// the transport boundary only sees this type.
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
    pub fn reason_lossy(&self) -> String {
        String::from_utf8_lossy(self.reason.as_ref()).into_owned()
    }
}

impl WsFrame {
    #[inline]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Bytes::from(text.into()))
    }

    #[inline]
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self::Binary(bytes.into())
    }

    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        }))
    }

    /// Borrow the payload bytes of data and control frames.
    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            WsFrame::Text(bytes)
            | WsFrame::Binary(bytes)
            | WsFrame::Ping(bytes)
            | WsFrame::Pong(bytes) => Some(bytes.as_ref()),
            WsFrame::Close(_) => None,
        }
    }

    /// Text payload, if this is a text frame holding valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsFrame::Text(bytes) => std::str::from_utf8(bytes.as_ref()).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_carries_code_and_reason() {
        let frame = WsFrame::close(4000, "resuming");
        match frame {
            WsFrame::Close(Some(close)) => {
                assert_eq!(close.code, 4000);
                assert_eq!(close.reason_lossy(), "resuming");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn payload_is_none_for_close() {
        assert!(WsFrame::Close(None).payload().is_none());
        assert_eq!(WsFrame::text("hi").payload(), Some(&b"hi"[..]));
        assert_eq!(WsFrame::text("hi").as_text(), Some("hi"));
        assert_eq!(WsFrame::binary(vec![0xff]).as_text(), None);
    }
}
