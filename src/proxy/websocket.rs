//! WebSocket frame relay
//!
//! After a successful 101 upgrade inside a MITM'd tunnel, both directions are
//! pumped frame by frame: each frame is forwarded byte-identical (masking
//! included) while an unmasked copy of the payload is captured for the
//! session record.

use crate::models::{MessageDirection, WebSocketMessage, WebSocketOpcode};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Maximum payload bytes captured per frame.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// Frames larger than this are treated as a protocol error rather than
/// buffered.
const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

/// One frame read off the wire, kept in its original encoding for
/// forwarding.
struct RelayedFrame {
    raw: Vec<u8>,
    fin: bool,
    opcode: u8,
    mask_key: Option<[u8; 4]>,
    payload_offset: usize,
    payload_length: u64,
}

impl RelayedFrame {
    fn is_close(&self) -> bool {
        self.opcode == 0x8
    }

    /// Unmasked, capture-capped copy of the payload. Frames with opcodes we
    /// do not recognize are forwarded but not recorded.
    fn capture(&self, direction: MessageDirection) -> Option<WebSocketMessage> {
        let opcode = WebSocketOpcode::from_u8(self.opcode)?;
        let end = self
            .payload_offset
            .saturating_add((self.payload_length as usize).min(MAX_CAPTURE_BYTES));
        let mut payload = self.raw[self.payload_offset..end.min(self.raw.len())].to_vec();
        if let Some(key) = self.mask_key {
            unmask_payload(&mut payload, key);
        }
        Some(WebSocketMessage::new(
            direction,
            opcode,
            payload,
            self.payload_length,
            self.fin,
        ))
    }
}

fn unmask_payload(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Read one complete frame. `Ok(None)` means the peer closed the connection
/// cleanly between frames.
async fn read_frame<R>(reader: &mut R) -> io::Result<Option<RelayedFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    match reader.read(&mut first).await? {
        0 => return Ok(None),
        _ => {}
    }
    let mut second = [0u8; 1];
    reader.read_exact(&mut second).await?;

    let fin = first[0] & 0x80 != 0;
    let opcode = first[0] & 0x0F;
    let masked = second[0] & 0x80 != 0;
    let short_len = (second[0] & 0x7F) as u64;

    let mut raw = vec![first[0], second[0]];

    let payload_length = match short_len {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            raw.extend_from_slice(&ext);
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            raw.extend_from_slice(&ext);
            u64::from_be_bytes(ext)
        }
        n => n,
    };

    if payload_length > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {payload_length} bytes exceeds limit"),
        ));
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        raw.extend_from_slice(&key);
        Some(key)
    } else {
        None
    };

    let payload_offset = raw.len();
    let mut payload = vec![0u8; payload_length as usize];
    reader.read_exact(&mut payload).await?;
    raw.extend_from_slice(&payload);

    Ok(Some(RelayedFrame {
        raw,
        fin,
        opcode,
        mask_key,
        payload_offset,
        payload_length,
    }))
}

/// Pump one direction until a Close frame, EOF or an I/O error. Frames are
/// forwarded verbatim; errors end the direction rather than the whole relay.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: MessageDirection,
) -> Vec<WebSocketMessage>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut captured = Vec::new();
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("WebSocket relay {:?} ended: {err}", direction);
                break;
            }
        };
        if writer.write_all(&frame.raw).await.is_err() {
            break;
        }
        if let Some(message) = frame.capture(direction) {
            captured.push(message);
        }
        if frame.is_close() {
            break;
        }
    }
    // Propagate the close/EOF so the peer's read loop unblocks.
    let _ = writer.shutdown().await;
    captured
}

/// Relay frames between the client and upstream until both directions have
/// ended, returning all captured messages in timestamp order.
pub async fn relay<C, U>(client: C, upstream: U) -> Vec<WebSocketMessage>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let outbound = tokio::spawn(pump(
        client_read,
        upstream_write,
        MessageDirection::ClientToServer,
    ));
    let inbound = tokio::spawn(pump(
        upstream_read,
        client_write,
        MessageDirection::ServerToClient,
    ));

    let mut messages = Vec::new();
    if let Ok(captured) = outbound.await {
        messages.extend(captured);
    }
    if let Ok(captured) = inbound.await {
        messages.extend(captured);
    }
    messages.sort_by_key(|m| m.timestamp);
    messages
}

/// Stream adapter that yields buffered bytes before reading from the inner
/// stream. Used for response bytes read past the upgrade head.
pub(crate) struct Prefixed<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame(fin: bool, opcode: u8, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(if fin { 0x80 | opcode } else { opcode });
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if payload.len() < 126 {
            out.push(mask_bit | payload.len() as u8);
        } else if payload.len() <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        if let Some(key) = mask {
            out.extend_from_slice(&key);
            let mut masked = payload.to_vec();
            unmask_payload(&mut masked, key);
            out.extend_from_slice(&masked);
        } else {
            out.extend_from_slice(payload);
        }
        out
    }

    #[tokio::test]
    async fn frames_are_forwarded_verbatim_and_captured_unmasked() {
        let (mut client, relay_client) = duplex(64 * 1024);
        let (mut upstream, relay_upstream) = duplex(64 * 1024);

        let relay_task = tokio::spawn(relay(relay_client, relay_upstream));

        let key = [0x11, 0x22, 0x33, 0x44];
        let text = frame(true, 0x1, Some(key), b"hello");
        let close = frame(true, 0x8, Some(key), &[]);
        client.write_all(&text).await.unwrap();
        client.write_all(&close).await.unwrap();

        // Upstream answers with an unmasked reply and its own close.
        upstream.write_all(&frame(true, 0x1, None, b"world")).await.unwrap();
        upstream.write_all(&frame(true, 0x8, None, &[])).await.unwrap();

        // What upstream receives must be the client's exact masked bytes.
        let mut forwarded = vec![0u8; text.len()];
        upstream.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, text);

        let mut reply = vec![0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[2..], b"world");

        let messages = relay_task.await.unwrap();
        let texts: Vec<_> = messages
            .iter()
            .filter(|m| m.opcode == WebSocketOpcode::Text)
            .collect();
        assert_eq!(texts.len(), 2);
        assert!(texts.iter().any(|m| {
            m.direction == MessageDirection::ClientToServer && m.payload == b"hello"
        }));
        assert!(texts.iter().any(|m| {
            m.direction == MessageDirection::ServerToClient && m.payload == b"world"
        }));
        assert_eq!(
            messages
                .iter()
                .filter(|m| m.opcode == WebSocketOpcode::Close)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn eof_without_close_ends_the_relay() {
        let (mut client, relay_client) = duplex(16 * 1024);
        let (mut upstream, relay_upstream) = duplex(16 * 1024);

        let relay_task = tokio::spawn(relay(relay_client, relay_upstream));

        client
            .write_all(&frame(true, 0x2, Some([1, 2, 3, 4]), &[0xAA, 0xBB]))
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        upstream.shutdown().await.unwrap();

        let messages = relay_task.await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].opcode, WebSocketOpcode::Binary);
        assert_eq!(messages[0].payload, vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn extended_length_frames_round_trip() {
        let (mut client, relay_client) = duplex(256 * 1024);
        let (mut upstream, relay_upstream) = duplex(256 * 1024);

        let relay_task = tokio::spawn(relay(relay_client, relay_upstream));

        let payload = vec![b'x'; 2000];
        client
            .write_all(&frame(true, 0x1, Some([9, 9, 9, 9]), &payload))
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        upstream.shutdown().await.unwrap();

        let messages = relay_task.await.unwrap();
        assert_eq!(messages[0].payload_length, 2000);
        assert_eq!(messages[0].payload, payload);
    }
}
