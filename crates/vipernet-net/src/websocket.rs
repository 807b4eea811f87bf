//! Streaming relays over a hosted chain's WebSocket endpoint
//!
//! The relay payload is sent once as a text frame; every text frame the
//! chain pushes back becomes one stream item. The stream ends when the
//! upstream closes.

use crate::chains::HostedChain;
use crate::upstream::UpstreamError;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use vipernet_core::RelayPayload;

/// Open a subscription on the chain's websocket endpoint.
pub async fn subscribe(
    chain: &HostedChain,
    payload: &RelayPayload,
) -> Result<BoxStream<'static, Result<String, UpstreamError>>, UpstreamError> {
    let url = chain
        .websocket_url
        .as_deref()
        .ok_or_else(|| UpstreamError::NoWebsocket(chain.id.to_string()))?;
    let (mut ws, _) = connect_async(url).await?;
    debug!(chain = %chain.id, "websocket upstream connected");
    ws.send(Message::Text(payload.data.clone())).await?;

    let events = ws
        .take_while(|msg| futures::future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(UpstreamError::from(e))),
            }
        });
    Ok(events.boxed())
}
