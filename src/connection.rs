// ABOUTME: Length-prefixed frame transport over any tokio byte stream
// ABOUTME: Read half accumulates and re-frames arbitrary chunks, write half buffers and flushes

use crate::codec::{CodecError, Decodable, Encodable, MAX_FRAME_SIZE, check_frame};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Reads frames off a byte stream, tolerating arbitrary chunk boundaries.
///
/// Frames that decode to an unknown tag or a malformed payload are dropped
/// without failing the stream; only framing-level faults (an oversize frame,
/// a connection cut mid-frame) terminate it.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,

    // The buffer for reading frames. Partial frames stay here between reads.
    buffer: BytesMut,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader::with_max_frame(reader, MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(reader: R, max_frame: usize) -> FrameReader<R> {
        FrameReader {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            max_frame,
        }
    }

    /// Read the next decodable message from the stream.
    ///
    /// Returns `None` when the peer closes the stream cleanly between
    /// frames. Closing mid-frame is an error.
    pub async fn read_message<M: Decodable>(&mut self) -> crate::Result<Option<M>> {
        loop {
            while let Some(body) = self.take_frame()? {
                match decode_body::<M>(&body) {
                    Ok(Some(message)) => return Ok(Some(message)),
                    Ok(None) => {
                        tracing::debug!(tag = body.first().copied(), "dropping frame with unknown tag");
                    }
                    Err(error) => {
                        tracing::debug!(%error, "dropping malformed frame");
                    }
                }
            }

            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                // A clean shutdown leaves no partial frame behind.
                return self
                    .buffer
                    .is_empty()
                    .then(|| None)
                    .ok_or_else(|| "connection reset by peer".into());
            }
        }
    }

    /// Split one complete frame body (tag + payload) off the buffer, or
    /// `None` when more data is needed.
    fn take_frame(&mut self) -> crate::Result<Option<Bytes>> {
        let mut src = Cursor::new(&self.buffer[..]);
        match check_frame(&mut src, self.max_frame) {
            Ok(bounds) => {
                self.buffer.advance(bounds.header_len);
                Ok(Some(self.buffer.split_to(bounds.body_len).freeze()))
            }
            Err(CodecError::Incomplete) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

fn decode_body<M: Decodable>(body: &[u8]) -> Result<Option<M>, CodecError> {
    let Some((&tag, payload)) = body.split_first() else {
        return Err(CodecError::Truncated("tag"));
    };
    let mut src = Cursor::new(payload);
    M::decode(tag, &mut src)
}

/// Writes frames to a byte stream through a write buffer, flushing after
/// each message so small frames do not sit in the buffer indefinitely.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> FrameWriter<W> {
        FrameWriter {
            writer: BufWriter::new(writer),
        }
    }

    pub async fn write_message<M: Encodable>(&mut self, message: &M) -> io::Result<()> {
        self.writer.write_all(&message.to_frame()).await?;
        self.writer.flush().await
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
