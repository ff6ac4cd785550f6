//! Reading and writing wire format messages.
//!
//! The transport itself never parses DNS. Everything it needs from the
//! wire format is hidden behind two small traits: [`MsgCodec`] frames
//! complete messages onto a byte stream, and [`MsgId`] exposes the 16 bit
//! message id that the codec preserves on every message it produces.
//!
//! [`TcpCodec`] is the bundled codec for DNS over TCP and TLS: each
//! message is preceded by a two octet, big-endian length field as
//! described in RFC 1035 section 4.2.2.

use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The future returned by the codec operations.
pub type CodecFut<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, io::Error>> + Send + 'a>>;

//------------ MsgId ---------------------------------------------------------

/// Access to the 16 bit id field of a wire format DNS message.
///
/// In pipelined mode the transport rewrites the id before a query goes out
/// and restores the caller's original id on the matching reply. This trait
/// is the only way the transport ever looks at message content.
pub trait MsgId {
    /// Returns the message id.
    fn id(&self) -> u16;

    /// Overwrites the message id.
    fn set_id(&mut self, id: u16);
}

impl MsgId for BytesMut {
    /// Returns the message id.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is shorter than two octets.
    fn id(&self) -> u16 {
        u16::from_be_bytes([self[0], self[1]])
    }

    /// Overwrites the message id.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is shorter than two octets.
    fn set_id(&mut self, id: u16) {
        self[..2].copy_from_slice(&id.to_be_bytes());
    }
}

impl MsgId for Vec<u8> {
    fn id(&self) -> u16 {
        u16::from_be_bytes([self[0], self[1]])
    }

    fn set_id(&mut self, id: u16) {
        self[..2].copy_from_slice(&id.to_be_bytes());
    }
}

//------------ MsgCodec ------------------------------------------------------

/// Reads and writes complete messages on an established stream.
///
/// Implementations decide both the message type and the framing. The
/// transport calls [`write`][Self::write] for exactly one message at a
/// time per stream and reads replies through [`read`][Self::read], either
/// from a dedicated read loop (pipelined mode) or directly after the
/// write (serialized modes).
pub trait MsgCodec: Send + Sync + 'static {
    /// The message type carried by this codec.
    type Msg: MsgId + Clone + Send + Sync + 'static;

    /// Writes one framed message to the stream.
    ///
    /// Resolves to the number of octets written, including any framing.
    fn write<'a, W>(
        &'a self,
        stream: &'a mut W,
        msg: &'a Self::Msg,
    ) -> CodecFut<'a, usize>
    where
        W: AsyncWrite + Unpin + Send;

    /// Reads the next complete message from the stream.
    ///
    /// Resolves to the message and the number of octets consumed. Blocks
    /// until a full message is available or the stream fails.
    fn read<'a, R>(&'a self, stream: &'a mut R) -> CodecFut<'a, (Self::Msg, usize)>
    where
        R: AsyncRead + Unpin + Send;
}

//------------ TcpCodec ------------------------------------------------------

/// The two octet length-prefix codec of DNS over TCP.
///
/// Messages are raw wire format DNS messages in a [`BytesMut`]. On the
/// wire each message is preceded by its length as a big-endian `u16`.
/// The prefix and the message are handed to the stream in a single write,
/// as RFC 7766 section 8 recommends.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpCodec;

impl TcpCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Default::default()
    }
}

impl MsgCodec for TcpCodec {
    type Msg = BytesMut;

    fn write<'a, W>(
        &'a self,
        stream: &'a mut W,
        msg: &'a Self::Msg,
    ) -> CodecFut<'a, usize>
    where
        W: AsyncWrite + Unpin + Send,
    {
        Box::pin(async move {
            let len = u16::try_from(msg.len()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "message longer than 65535 octets",
                )
            })?;

            let mut buf = Vec::with_capacity(2 + msg.len());
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(msg);
            stream.write_all(&buf).await?;
            Ok(buf.len())
        })
    }

    fn read<'a, R>(&'a self, stream: &'a mut R) -> CodecFut<'a, (Self::Msg, usize)>
    where
        R: AsyncRead + Unpin + Send,
    {
        Box::pin(async move {
            let len = stream.read_u16().await? as usize;
            if len < 2 {
                // Too short to even carry a message id.
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message too short",
                ));
            }

            let mut buf = BytesMut::with_capacity(len);
            while buf.len() < len {
                if stream.read_buf(&mut buf).await? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended mid message",
                    ));
                }
            }

            Ok((buf, 2 + len))
        })
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u16, body: &[u8]) -> BytesMut {
        let mut m = BytesMut::from(&id.to_be_bytes()[..]);
        m.extend_from_slice(body);
        m
    }

    #[test]
    fn msg_id_roundtrip() {
        let mut m = msg(0x1234, b"payload");
        assert_eq!(m.id(), 0x1234);
        m.set_id(0xbeef);
        assert_eq!(m.id(), 0xbeef);
        assert_eq!(&m[2..], b"payload");
    }

    #[tokio::test]
    async fn writes_a_single_length_prefixed_buffer() {
        let (mut client, mut server) = tokio::io::duplex(512);
        let m = msg(7, b"abc");

        let n = TcpCodec.write(&mut client, &m).await.unwrap();
        assert_eq!(n, 2 + 5);

        let mut wire = vec![0u8; n];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..2], &[0, 5]);
        assert_eq!(&wire[2..], &m[..]);
    }

    #[tokio::test]
    async fn reads_exactly_one_message() {
        let (mut client, mut server) = tokio::io::duplex(512);
        let first = msg(1, b"one");
        let second = msg(2, b"two!");
        TcpCodec.write(&mut client, &first).await.unwrap();
        TcpCodec.write(&mut client, &second).await.unwrap();

        let (m, n) = TcpCodec.read(&mut server).await.unwrap();
        assert_eq!(m, first);
        assert_eq!(n, 2 + 5);
        let (m, _) = TcpCodec.read(&mut server).await.unwrap();
        assert_eq!(m, second);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(512);
        client.write_all(&[0, 10, b'x', b'y']).await.unwrap();
        drop(client);

        let err = TcpCodec.read(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let (mut client, _server) = tokio::io::duplex(512);
        let big = BytesMut::from(&vec![0u8; 70_000][..]);

        let err = TcpCodec.write(&mut client, &big).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
