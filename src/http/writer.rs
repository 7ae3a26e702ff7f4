use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::headers::Headers;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Serializes a response into one contiguous buffer:
/// status line, headers in insertion order, blank line, body.
pub fn serialize_response(
    status: u16,
    reason: &str,
    headers: &Headers,
    body: &[Bytes],
    body_len: usize,
) -> Bytes {
    let head_len: usize = headers.iter().map(|(k, v)| k.len() + v.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(HTTP_VERSION.len() + reason.len() + 8 + head_len + 2 + body_len);

    // Status line
    buf.put_slice(HTTP_VERSION.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");

    // Headers
    for (k, v) in headers.iter() {
        buf.put_slice(k.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(v.as_bytes());
        buf.put_slice(b"\r\n");
    }

    // Header/body separator
    buf.put_slice(b"\r\n");

    // Body
    for chunk in body {
        buf.put_slice(chunk);
    }

    buf.freeze()
}

/// Writes a serialized response in full.
pub async fn write_response<S>(stream: &mut S, bytes: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// True for the errors a peer produces by simply going away: reset, broken
/// pipe, aborted, or an already invalid handle.
///
/// These are expected on idle keep-alive connections and are only worth a
/// debug line.
pub fn is_benign_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_in_wire_order() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        headers.set("Content-Length", "5");

        let bytes = serialize_response(
            200,
            "OK",
            &headers,
            &[Bytes::from_static(b"he"), Bytes::from_static(b"llo")],
            5,
        );

        assert_eq!(
            &bytes[..],
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn classifies_disconnects() {
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_benign_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
