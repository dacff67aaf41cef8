//! Text-frame transport underneath each relay connection.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use nostr::RelayUrl;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{ClientError, Result};

/// Outbound half of a relay transport.
pub type BoxSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;

/// Inbound half of a relay transport. The stream ends when the peer goes away.
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens an ordered, message-oriented channel to a relay.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &RelayUrl) -> Result<(BoxSink, BoxStream)>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &RelayUrl) -> Result<(BoxSink, BoxStream)> {
        let (stream, _response) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;

        let (writer, reader) = stream.split();
        let sink = writer
            .sink_map_err(|error| ClientError::WebSocket(error.to_string()))
            .with(|text: String| future::ready(Ok::<_, ClientError>(Message::Text(text.into()))));
        let frames = reader.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(_)) => {
                    Some(Err(ClientError::Connection("closed by relay".to_string())))
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol.
                Ok(_) => None,
                Err(error) => Some(Err(ClientError::WebSocket(error.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(frames)))
    }
}
