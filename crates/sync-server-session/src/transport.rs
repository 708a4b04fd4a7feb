//! Frame-at-a-time reads/writes over a TCP socket, plus the raw ping byte
//! that lives outside normal message framing.

use crate::error::{SessionError, SessionResult};
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
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self { stream, buf: BytesMut::with_capacity(READ_CHUNK) }
    }

    /// Read the next frame or ping byte, reading more off the socket as
    /// needed. Returns `Ok(None)` once the peer has closed the connection
    /// cleanly with nothing left buffered.
    pub async fn next_message(&mut self) -> SessionResult<Option<Incoming>> {
        loop {
            if self.buf.first() == Some(&PING_BYTE) {
                self.buf.advance(1);
                return Ok(Some(Incoming::Ping));
            }
            match try_decode_frame(&mut self.buf, DEFAULT_MAX_FRAME_LEN)? {
                Some(payload) => return Ok(Some(Incoming::Frame(payload.to_vec()))),
                None => {
                    let mut chunk = [0u8; READ_CHUNK];
                    let n = self.stream.read(&mut chunk).await?;
                    if n == 0 {
                        return if self.buf.is_empty() { Ok(None) } else { Err(SessionError::Closed) };
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> SessionResult<()> {
        let framed = encode_frame(payload);
        self.stream.write_all(&framed).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_ping(&mut self) -> SessionResult<()> {
        self.stream.write_all(&[PING_BYTE]).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
