//! WebSocket adapter: one binary message carries one frame.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::trace;

use super::{FrameReader, FrameWriter, Transport};
use crate::errors::TransportError;

/// Wrap an upgraded WebSocket as a [`Transport`].
pub fn websocket_transport(ws: WebSocket, remote_addr: SocketAddr) -> Transport {
    let (sink, stream) = ws.split();
    Transport::new(WsReader { stream }, WsWriter { sink }, remote_addr)
}

struct WsReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(msg) = self.stream.next().await {
            match msg.map_err(|e| TransportError::WebSocket(e.to_string()))? {
                Message::Binary(data) => return Ok(Some(data)),
                // Some clients can only send text frames; the bytes are framed the same way.
                Message::Text(text) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())));
                }
                Message::Close(frame) => {
                    trace!(?frame, "websocket close frame");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }
}

struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
