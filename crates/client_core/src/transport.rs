use async_trait::async_trait;
use futures::{stream, stream::BoxStream, SinkExt, StreamExt};
use shared::error::SyncError;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

/// An open duplex text channel. Dropping `outbound` closes the write half;
/// `inbound` ends when the peer closes.
pub struct TransportConnection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: BoxStream<'static, Result<String, SyncError>>,
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<TransportConnection, SyncError>;
}

/// Websocket transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportConnection, SyncError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SyncError::Network(format!("failed to connect websocket: {err}")))?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(WsMessage::Text(text)).await {
                    warn!(%err, "websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let inbound = stream::unfold(ws_reader, |mut reader| async move {
            loop {
                match reader.next().await? {
                    Ok(WsMessage::Text(text)) => return Some((Ok(text), reader)),
                    Ok(WsMessage::Close(frame)) => {
                        debug!(?frame, "websocket closed by peer");
                        return None;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let err = SyncError::Network(format!("websocket receive failed: {err}"));
                        return Some((Err(err), reader));
                    }
                }
            }
        })
        .boxed();

        Ok(TransportConnection { outbound, inbound })
    }
}
