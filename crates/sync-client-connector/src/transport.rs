//! Frame-at-a-time reads/writes over a TCP socket, plus the raw ping byte
//! that lives outside normal message framing. Mirrors the server's own
//! `Transport` (same wire discipline in both directions) but owns its
//! connect step.

use bytes::{Buf, BytesMut};
use sync_codec::{encode_frame, try_decode_frame, DEFAULT_MAX_FRAME_LEN, PING_BYTE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 8 * 1024;

pub enum Incoming {
    Frame(Vec<u8>),
    Ping,
}

pub struct Transport {
    stream: TcpStream,
    buf: BytesMut,
}

impl Transport {
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream, buf: BytesMut::with_capacity(READ_CHUNK) })
    }

    /// Read the next frame or ping byte, reading more off the socket as
    /// needed. Returns `Ok(None)` once the peer has closed the connection
    /// cleanly with nothing left buffered.
    pub async fn next_message(&mut self) -> std::io::Result<Option<Incoming>> {
        loop {
            if self.buf.first() == Some(&PING_BYTE) {
                self.buf.advance(1);
                return Ok(Some(Incoming::Ping));
            }
            match try_decode_frame(&mut self.buf, DEFAULT_MAX_FRAME_LEN) {
                Ok(Some(payload)) => return Ok(Some(Incoming::Frame(payload.to_vec()))),
                Ok(None) => {
                    let mut chunk = [0u8; READ_CHUNK];
                    let n = self.stream.read(&mut chunk).await?;
                    if n == 0 {
                        return if self.buf.is_empty() {
                            Ok(None)
                        } else {
                            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed mid-frame"))
                        };
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                Err(err) => return Err(frame_err_to_io(err)),
            }
        }
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let framed = encode_frame(payload);
        self.stream.write_all(&framed).await?;
        self.stream.flush().await
    }

    pub async fn send_ping(&mut self) -> std::io::Result<()> {
        self.stream.write_all(&[PING_BYTE]).await?;
        self.stream.flush().await
    }
}

fn frame_err_to_io(err: sync_codec::CodecError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}
