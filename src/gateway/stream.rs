//! Vamsh 流式通道（WebSocket 客户端）
//!
//! 建连后首帧发送 {type: "socket_connect"}；入站文本帧 JSON 解析后按 type 原样转发，
//! 不做进一步解读。Ping 自动回 Pong，解析失败的帧记录日志后丢弃。

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::core::recovery::classify_ws;
use crate::core::ServiceError;

use super::message::StreamFrame;
use super::AgentStream;

const FRAME_BUFFER: usize = 64;

/// 连接 ws_url 并启动读循环；返回的 AgentStream 关闭时读循环发送 Close 后退出
pub async fn connect(
    ws_url: &str,
    project_name: &str,
    timeout: Duration,
) -> Result<AgentStream, ServiceError> {
    let (socket, _) = tokio::time::timeout(timeout, connect_async(ws_url))
        .await
        .map_err(|_| ServiceError::Timeout(format!("websocket connect to {ws_url}")))?
        .map_err(|e| classify_ws(&e))?;

    let (mut sink, mut source) = socket.split();

    let hello = serde_json::json!({
        "type": "socket_connect",
        "project_name": project_name,
    });
    sink.send(WsMessage::Text(hello.to_string()))
        .await
        .map_err(|e| classify_ws(&e))?;

    let (tx, stream) = AgentStream::channel(FRAME_BUFFER);
    let closer = stream.closer();
    let project = project_name.to_string();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closer.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => match StreamFrame::parse(&text) {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(project = %project, "dropping malformed stream frame: {}", e);
                        }
                    },
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!(project = %project, "agent stream closed by remote");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(project = %project, "agent stream error: {}", e);
                        break;
                    }
                }
            }
        }
    });

    tracing::info!(project = %project_name, url = %ws_url, "agent stream connected");
    Ok(stream)
}
