//! Adapts axum's split websocket halves to [`bastion_core::ws::WsSender`]/`WsReceiver` so C5/C6
//! never see an axum type directly (spec §10.1: core has no HTTP framework dependency).

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bastion_core::error::{GatewayError, Result};
use bastion_core::ws::{WsMessage, WsReceiver, WsSender};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

pub struct AxumWsSender(pub SplitSink<WebSocket, Message>);

#[async_trait]
impl WsSender for AxumWsSender {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.0.send(Message::Binary(data.into())).await.map_err(GatewayError::transport)
    }

    async fn send_text(&mut self, data: String) -> Result<()> {
        self.0.send(Message::Text(data.into())).await.map_err(GatewayError::transport)
    }

    async fn close(&mut self) -> Result<()> {
        // Best-effort: the peer may already be gone, per the trait's own contract.
        let _ = self.0.send(Message::Close(None)).await;
        Ok(())
    }
}

pub struct AxumWsReceiver(pub SplitStream<WebSocket>);

#[async_trait]
impl WsReceiver for AxumWsReceiver {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            return match self.0.next().await {
                None => None,
                Some(Ok(Message::Binary(data))) => Some(Ok(WsMessage::Binary(data.to_vec()))),
                Some(Ok(Message::Text(text))) => Some(Ok(WsMessage::Text(text.to_string()))),
                Some(Ok(Message::Close(_))) => Some(Ok(WsMessage::Close)),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Err(e)) => Some(Err(GatewayError::transport(e))),
            };
        }
    }
}
