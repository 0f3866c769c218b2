//! Network layer - WebSocket connector underneath the STOMP transport

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Outbound half of an open socket, one text message per item.
pub type WireSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of an open socket. Ends when the peer closes.
pub type WireStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens text-message sockets to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<(WireSink, WireStream)>;
}

// ============================================================================
// WebSocket Connector
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<(WireSink, WireStream)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(Error::from)
            .with(|text: String| future::ready(Ok::<_, Error>(WsMessage::Text(text))));

        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(WsMessage::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(text)),
                    Ok(WsMessage::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                    // Ping/pong is answered by tungstenite itself
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::from(e))),
                })
            });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
