//! Framed TCP transport to the LBN node.
//!
//! One frame = envelope header + CBOR body. The stream is split once:
//! exactly one task reads (the session's receive path), and writes
//! serialize through a mutex so frames never interleave. Closing either
//! side surfaces as `Eof` to the reader and an I/O error to writers;
//! both are ordinary session exits, never process failures.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use zerocopy::AsBytes;

use vicinity_core::wire::{EnvelopeHeader, ProtocolError, HEADER_LEN};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Violation(#[from] ProtocolError),
    #[error("connection closed mid-frame")]
    TruncatedFrame,
}

/// Outcome of one read: a complete frame body, or end of stream at a
/// frame boundary.
#[derive(Debug)]
pub enum FrameEvent {
    Frame(Bytes),
    Eof,
}

/// Connect to the LBN endpoint and split the stream for framed use.
pub async fn connect(endpoint: &str) -> std::io::Result<(FrameReader, FrameWriter)> {
    let stream = TcpStream::connect(endpoint).await?;
    stream.set_nodelay(true)?;
    Ok(split(stream))
}

/// Split an established stream into the single reader and the shared
/// writer. Also used by tests to frame the server side of a socket.
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (FrameReader::new(read), FrameWriter::new(write))
}

/// The read half. Owned by exactly one task.
pub struct FrameReader {
    half: OwnedReadHalf,
}

impl FrameReader {
    pub fn new(half: OwnedReadHalf) -> Self {
        Self { half }
    }

    /// Read one frame. EOF exactly on a frame boundary is `Eof`; EOF
    /// inside a frame is `TruncatedFrame`; a bad envelope is a
    /// protocol violation.
    pub async fn read_frame(&mut self) -> Result<FrameEvent, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.half.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(FrameEvent::Eof);
                }
                return Err(TransportError::TruncatedFrame);
            }
            filled += n;
        }

        let body_len = EnvelopeHeader::parse(&header)?;
        let mut body = vec![0u8; body_len];
        self.half.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::TruncatedFrame
            } else {
                TransportError::Io(e)
            }
        })?;
        Ok(FrameEvent::Frame(Bytes::from(body)))
    }
}

/// The write half. Cloneable; writers serialize through the mutex so a
/// frame is always written whole.
#[derive(Clone)]
pub struct FrameWriter {
    half: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self {
            half: Arc::new(Mutex::new(half)),
        }
    }

    /// Frame and send one message body.
    pub async fn write_frame(&self, body: &[u8]) -> Result<(), TransportError> {
        let header = EnvelopeHeader::for_body_len(body.len())?;
        let mut half = self.half.lock().await;
        half.write_all(header.as_bytes()).await?;
        half.write_all(body).await?;
        half.flush().await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> ((FrameReader, FrameWriter), (FrameReader, FrameWriter)) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (split(client), split(server))
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let ((_, client_writer), (mut server_reader, _)) = pair().await;

        client_writer.write_frame(b"hello neighborhood").await.unwrap();
        match server_reader.read_frame().await.unwrap() {
            FrameEvent::Frame(body) => assert_eq!(&body[..], b"hello neighborhood"),
            FrameEvent::Eof => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn frames_do_not_interleave() {
        let ((_, client_writer), (mut server_reader, _)) = pair().await;

        let a = client_writer.clone();
        let b = client_writer.clone();
        let send_a = tokio::spawn(async move { a.write_frame(&[0xaa; 4096]).await });
        let send_b = tokio::spawn(async move { b.write_frame(&[0xbb; 4096]).await });
        send_a.await.unwrap().unwrap();
        send_b.await.unwrap().unwrap();

        for _ in 0..2 {
            match server_reader.read_frame().await.unwrap() {
                FrameEvent::Frame(body) => {
                    assert_eq!(body.len(), 4096);
                    assert!(body.iter().all(|b| *b == body[0]));
                }
                FrameEvent::Eof => panic!("expected two frames"),
            }
        }
    }

    #[tokio::test]
    async fn clean_close_is_eof() {
        let ((client_reader, client_writer), (mut server_reader, _)) = pair().await;

        drop(client_reader);
        drop(client_writer);
        assert!(matches!(
            server_reader.read_frame().await.unwrap(),
            FrameEvent::Eof
        ));
    }

    #[tokio::test]
    async fn close_inside_header_is_truncation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (mut server_reader, _) = split(server);

        client.write_all(b"LBN").await.unwrap();
        drop(client);
        assert!(matches!(
            server_reader.read_frame().await,
            Err(TransportError::TruncatedFrame)
        ));
    }

    #[tokio::test]
    async fn bad_magic_is_a_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (mut server_reader, _) = split(server);

        client.write_all(b"XXXX\x01\x00\x00\x00\x00\x00").await.unwrap();
        assert!(matches!(
            server_reader.read_frame().await,
            Err(TransportError::Violation(ProtocolError::BadMagic(_)))
        ));
    }
}
