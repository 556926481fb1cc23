//! Raw byte-stream adapter: frames back to back, split by the codec's
//! length prefix.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tidewire_core::PacketCodec;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use super::{FrameReader, FrameWriter, Transport};
use crate::errors::TransportError;

/// Wrap the halves of a byte stream (typically a split `TcpStream`) as a
/// [`Transport`].
pub fn stream_transport<R, W>(
    reader: R,
    writer: W,
    codec: &PacketCodec,
    remote_addr: SocketAddr,
) -> Transport
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Transport::new(
        StreamReader {
            frames: FramedRead::new(reader, codec.stream_framer()),
        },
        StreamWriter { io: writer },
        remote_addr,
    )
}

struct StreamReader<R> {
    frames: FramedRead<R, LengthDelimitedCodec>,
}

#[async_trait]
impl<R> FrameReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

struct StreamWriter<W> {
    io: W,
}

#[async_trait]
impl<W> FrameWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}
