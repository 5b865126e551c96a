use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use flowrun_core::Subscription;

use crate::protocol::{self, LogFrame};

/// Forward a job's live events to one WebSocket client.
///
/// The stream ends when the client closes, the bus shuts down, or the job
/// reports a terminal status.
pub async fn stream_logs(ws: WebSocket, mut subscription: Subscription) {
    let job_id = subscription.job_id().clone();
    let (mut ws_tx, mut ws_rx) = ws.split();
    debug!(job_id = %job_id, "Log stream opened");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&LogFrame::live(&event)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to encode log frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
                if protocol::is_terminal(&event) {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(job_id = %job_id, error = %e, "WebSocket read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    debug!(job_id = %job_id, "Log stream closed");
}
