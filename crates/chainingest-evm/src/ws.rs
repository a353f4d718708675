//! `eth_subscribe("newHeads")` over WebSocket.
//!
//! A background task owns the connection and forwards parsed heads into a
//! channel; the returned stream reads from it. Dropping the stream closes the
//! channel, which makes the task close the socket. Reconnecting is left to the
//! caller: the stream yields an error and ends when the socket goes away.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use chainingest_core::chain::HeadStream;
use chainingest_core::error::ClientError;
use chainingest_core::types::BlockRef;

use crate::wire::{parse_head_notification, JsonRpcRequest, JsonRpcResponse, RpcId};

const SUBSCRIBE_ID: u64 = 1;
const HEAD_BUFFER: usize = 64;

type HeadItem = Result<BlockRef, ClientError>;

/// Connect to `url` and subscribe to new heads.
pub async fn subscribe_new_heads(url: &str, timeout: Duration) -> Result<HeadStream, ClientError> {
    tracing::info!(url = %url, "subscribing to newHeads via WebSocket");

    let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| ClientError::Timeout {
            ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| ClientError::NodeUnavailable(format!("WebSocket connect failed: {e}")))?;
    let (mut sink, mut stream) = ws_stream.split();

    let req = JsonRpcRequest::new(SUBSCRIBE_ID, "eth_subscribe", vec![json!("newHeads")]);
    let payload =
        serde_json::to_string(&req).map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
    sink.send(Message::Text(payload.into()))
        .await
        .map_err(|e| ClientError::NodeUnavailable(format!("WebSocket send failed: {e}")))?;

    let subscription = tokio::time::timeout(timeout, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(id) = subscription_id(&text)? {
                        return Ok(id);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ClientError::NodeUnavailable(
                        "WebSocket closed before subscription was confirmed".into(),
                    ))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ClientError::NodeUnavailable(e.to_string())),
            }
        }
    })
    .await
    .map_err(|_| ClientError::Timeout {
        ms: timeout.as_millis() as u64,
    })??;
    tracing::debug!(subscription = %subscription, "newHeads subscription active");

    let (tx, rx) = mpsc::channel::<HeadItem>(HEAD_BUFFER);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            tracing::debug!("ignoring non-JSON WebSocket message");
                            continue;
                        };
                        if let Some(head) = parse_head_notification(&value, &subscription) {
                            if tx.send(head).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = tx
                            .send(Err(ClientError::NodeUnavailable("WebSocket closed".into())))
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ClientError::NodeUnavailable(e.to_string()))).await;
                        break;
                    }
                }
            }
        }
        tracing::debug!(subscription = %subscription, "newHeads subscription closed");
    });

    Ok(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed())
}

/// The subscription ID if `text` is the response to our `eth_subscribe`.
fn subscription_id(text: &str) -> Result<Option<String>, ClientError> {
    let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(text) else {
        return Ok(None);
    };
    if resp.id != RpcId::Number(SUBSCRIBE_ID) {
        return Ok(None);
    }
    let value = resp
        .into_result()
        .map_err(|e| ClientError::NodeUnavailable(format!("eth_subscribe rejected: {e}")))?;
    value
        .as_str()
        .map(|id| Some(id.to_string()))
        .ok_or_else(|| ClientError::MalformedResponse(format!("eth_subscribe returned {value}")))
}
