use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Raw preamble a client writes on a fresh TCP connection, before the multiplexer starts.
/// A shared public/control port classifies connections by it.
pub const MAGIC_CHANNEL: &[u8; 4] = b"MCAT";
const MAGIC_HELLO: &[u8; 4] = b"MCHI";
const MAGIC_HELLO_REPLY: &[u8; 4] = b"MCHR";
const MAGIC_STREAM_TCP: &[u8; 4] = b"MCTS";
const MAGIC_STREAM_UDP: &[u8; 4] = b"MCUS";
pub const PROTOCOL_V1: u8 = 1;

pub const PREAMBLE_LEN: usize = MAGIC_CHANNEL.len() + 1;
pub const MAX_HELLO_JSON_BYTES: u32 = 64 * 1024;
pub const MAX_DATAGRAM_BYTES: u32 = 64 * 1024;
const MAX_REASON_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("unknown control frame type {0:#04x}")]
    UnknownFrame(u8),
    #[error("empty destination")]
    EmptyDestination,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether `buf` (a peek at the first bytes of a connection) can still be a channel preamble.
///
/// Returns `Some(true)` once the full magic is present, `Some(false)` as soon as a byte
/// mismatches, and `None` while more bytes are needed to decide.
pub fn classify_preamble(buf: &[u8]) -> Option<bool> {
    let n = buf.len().min(MAGIC_CHANNEL.len());
    if buf[..n] != MAGIC_CHANNEL[..n] {
        return Some(false);
    }
    if n == MAGIC_CHANNEL.len() {
        Some(true)
    } else {
        None
    }
}

pub async fn write_preamble<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    w.write_all(MAGIC_CHANNEL).await?;
    w.write_u8(PROTOCOL_V1).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_preamble<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC_CHANNEL {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }
    Ok(())
}

/// First message on the control stream, client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// `dstAddr:dstPort` the client forwards to.
    pub destination: String,
    #[serde(default)]
    pub client_version: String,
}

/// Server answer to [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub accepted: bool,
    #[serde(default)]
    pub channel_id: u64,
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub reason: String,
}

impl HelloReply {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            channel_id: 0,
            heartbeat_interval_ms: 0,
            heartbeat_timeout_ms: 0,
            reason: reason.into(),
        }
    }
}

async fn write_json_envelope<W, T>(w: &mut W, magic: &[u8; 4], v: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let b = serde_json::to_vec(v)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_HELLO_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_all(magic).await?;
    w.write_u8(PROTOCOL_V1).await?;
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

async fn read_json_envelope<R, T>(r: &mut R, magic: &[u8; 4]) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut got = [0u8; 4];
    r.read_exact(&mut got).await?;
    if &got != magic {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }
    let n = r.read_u32().await?;
    if n > MAX_HELLO_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

pub async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W, hello: &Hello) -> Result<(), ProtocolError> {
    if hello.destination.trim().is_empty() {
        return Err(ProtocolError::EmptyDestination);
    }
    write_json_envelope(w, MAGIC_HELLO, hello).await
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<Hello, ProtocolError> {
    let mut hello: Hello = read_json_envelope(r, MAGIC_HELLO).await?;
    hello.destination = hello.destination.trim().to_string();
    if hello.destination.is_empty() {
        return Err(ProtocolError::EmptyDestination);
    }
    Ok(hello)
}

pub async fn write_hello_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: &HelloReply,
) -> Result<(), ProtocolError> {
    write_json_envelope(w, MAGIC_HELLO_REPLY, reply).await
}

pub async fn read_hello_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<HelloReply, ProtocolError> {
    read_json_envelope(r, MAGIC_HELLO_REPLY).await
}

/// Frames exchanged on the control stream after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Ping(u64),
    Pong(u64),
    GoAway(String),
    /// The server gave this client's slot to another client. Not followed by a reconnect.
    Replaced(String),
}

const FRAME_PING: u8 = 0x01;
const FRAME_PONG: u8 = 0x02;
const FRAME_GOAWAY: u8 = 0x03;
const FRAME_REPLACED: u8 = 0x04;

/// The last frame one side sends before closing the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Farewell {
    GoAway(String),
    Replaced(String),
}

impl Farewell {
    pub fn reason(&self) -> &str {
        match self {
            Farewell::GoAway(r) | Farewell::Replaced(r) => r,
        }
    }

    pub fn frame(&self) -> ControlFrame {
        match self {
            Farewell::GoAway(r) => ControlFrame::GoAway(r.clone()),
            Farewell::Replaced(r) => ControlFrame::Replaced(r.clone()),
        }
    }
}

pub async fn write_control_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &ControlFrame,
) -> Result<(), ProtocolError> {
    match frame {
        ControlFrame::Ping(seq) => {
            w.write_u8(FRAME_PING).await?;
            w.write_u64(*seq).await?;
        }
        ControlFrame::Pong(seq) => {
            w.write_u8(FRAME_PONG).await?;
            w.write_u64(*seq).await?;
        }
        ControlFrame::GoAway(reason) => {
            w.write_u8(FRAME_GOAWAY).await?;
            write_short_string(w, reason).await?;
        }
        ControlFrame::Replaced(reason) => {
            w.write_u8(FRAME_REPLACED).await?;
            write_short_string(w, reason).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

pub async fn read_control_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<ControlFrame, ProtocolError> {
    match r.read_u8().await? {
        FRAME_PING => Ok(ControlFrame::Ping(r.read_u64().await?)),
        FRAME_PONG => Ok(ControlFrame::Pong(r.read_u64().await?)),
        FRAME_GOAWAY => Ok(ControlFrame::GoAway(read_short_string(r).await?)),
        FRAME_REPLACED => Ok(ControlFrame::Replaced(read_short_string(r).await?)),
        other => Err(ProtocolError::UnknownFrame(other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Tcp,
    Udp,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Tcp => "tcp",
            StreamKind::Udp => "udp",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header at the start of every relay stream the server opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub kind: StreamKind,
    pub stream_id: u64,
    /// Public-side peer address, informational.
    pub peer: String,
}

pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    h: &StreamHeader,
) -> Result<(), ProtocolError> {
    match h.kind {
        StreamKind::Tcp => w.write_all(MAGIC_STREAM_TCP).await?,
        StreamKind::Udp => w.write_all(MAGIC_STREAM_UDP).await?,
    }
    w.write_u8(PROTOCOL_V1).await?;
    w.write_u64(h.stream_id).await?;
    write_short_string(w, &h.peer).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_stream_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<StreamHeader, ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    let kind = if &magic == MAGIC_STREAM_TCP {
        StreamKind::Tcp
    } else if &magic == MAGIC_STREAM_UDP {
        StreamKind::Udp
    } else {
        return Err(ProtocolError::BadMagic);
    };

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }
    let stream_id = r.read_u64().await?;
    let peer = read_short_string(r).await?;
    Ok(StreamHeader {
        kind,
        stream_id,
        peer,
    })
}

/// Client answer to a stream header: whether the destination was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialReply {
    Ok,
    Failed(String),
}

const DIAL_OK: u8 = 0x00;
const DIAL_FAILED: u8 = 0x01;

pub async fn write_dial_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: &DialReply,
) -> Result<(), ProtocolError> {
    match reply {
        DialReply::Ok => w.write_u8(DIAL_OK).await?,
        DialReply::Failed(reason) => {
            w.write_u8(DIAL_FAILED).await?;
            write_short_string(w, reason).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

pub async fn read_dial_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<DialReply, ProtocolError> {
    match r.read_u8().await? {
        DIAL_OK => Ok(DialReply::Ok),
        DIAL_FAILED => Ok(DialReply::Failed(read_short_string(r).await?)),
        other => Err(ProtocolError::UnknownFrame(other)),
    }
}

/// `u16be len | utf8`, truncated on a char boundary to a sane maximum.
async fn write_short_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<(), ProtocolError> {
    let mut end = s.len().min(MAX_REASON_BYTES);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let b = &s.as_bytes()[..end];
    w.write_u16(b.len() as u16).await?;
    w.write_all(b).await?;
    Ok(())
}

async fn read_short_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let n = r.read_u16().await? as usize;
    if n > MAX_REASON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n as u32));
    }
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_preamble_decides_early() {
        assert_eq!(classify_preamble(b""), None);
        assert_eq!(classify_preamble(b"MC"), None);
        assert_eq!(classify_preamble(b"MCAT\x01"), Some(true));
        assert_eq!(classify_preamble(b"G"), Some(false));
        assert_eq!(classify_preamble(b"GET /\n"), Some(false));
        assert_eq!(classify_preamble(b"MCX"), Some(false));
    }

    #[tokio::test]
    async fn preamble_rejects_other_version() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"MCAT\x09").await.unwrap();
        match read_preamble(&mut b).await.unwrap_err() {
            ProtocolError::BadVersion(9) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_trims_destination() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = Hello {
            destination: " 127.0.0.1:8080 ".into(),
            client_version: "test".into(),
        };
        tokio::spawn(async move { write_hello(&mut a, &hello).await });

        let got = read_hello(&mut b).await.unwrap();
        assert_eq!(got.destination, "127.0.0.1:8080");
        assert_eq!(got.client_version, "test");
    }

    #[tokio::test]
    async fn hello_rejects_too_large_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(128);

        tokio::spawn(async move {
            a.write_all(MAGIC_HELLO).await.unwrap();
            a.write_u8(PROTOCOL_V1).await.unwrap();
            a.write_u32(MAX_HELLO_JSON_BYTES + 1).await.unwrap();
        });

        match read_hello(&mut b).await.unwrap_err() {
            ProtocolError::PayloadTooLarge(n) => assert!(n > MAX_HELLO_JSON_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_magic_is_not_a_hello() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            write_hello_reply(&mut a, &HelloReply::rejected("busy")).await
        });
        assert!(matches!(
            read_hello(&mut b).await.unwrap_err(),
            ProtocolError::BadMagic
        ));
    }

    #[tokio::test]
    async fn control_frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            write_control_frame(&mut a, &ControlFrame::Ping(7)).await?;
            write_control_frame(&mut a, &ControlFrame::Pong(7)).await?;
            write_control_frame(&mut a, &ControlFrame::GoAway("stopping".into())).await?;
            write_control_frame(&mut a, &Farewell::Replaced("newer client".into()).frame()).await
        });

        assert_eq!(read_control_frame(&mut b).await.unwrap(), ControlFrame::Ping(7));
        assert_eq!(read_control_frame(&mut b).await.unwrap(), ControlFrame::Pong(7));
        assert_eq!(
            read_control_frame(&mut b).await.unwrap(),
            ControlFrame::GoAway("stopping".into())
        );
        assert_eq!(
            read_control_frame(&mut b).await.unwrap(),
            ControlFrame::Replaced("newer client".into())
        );
    }

    #[tokio::test]
    async fn stream_header_then_payload_stays_aligned() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            write_stream_header(
                &mut a,
                &StreamHeader {
                    kind: StreamKind::Udp,
                    stream_id: 42,
                    peer: "203.0.113.5:5353".into(),
                },
            )
            .await?;
            a.write_all(b"rest").await?;
            Ok::<_, ProtocolError>(())
        });

        let h = read_stream_header(&mut b).await.unwrap();
        assert_eq!(h.kind, StreamKind::Udp);
        assert_eq!(h.stream_id, 42);
        assert_eq!(h.peer, "203.0.113.5:5353");

        let mut rest = [0u8; 4];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn dial_reply_reason_is_truncated_on_char_boundary() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let long = "é".repeat(MAX_REASON_BYTES);
        tokio::spawn(async move { write_dial_reply(&mut a, &DialReply::Failed(long)).await });

        match read_dial_reply(&mut b).await.unwrap() {
            DialReply::Failed(reason) => {
                assert!(reason.len() <= MAX_REASON_BYTES);
                assert!(reason.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
