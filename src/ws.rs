//! Per-connection websocket handling: one reader and one writer task
//! sharing a bounded outbound queue.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use governor::{clock, state, Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::event;
use crate::msg::{ClientMsg, ServerMsg};
use crate::relay::RelayError;
use crate::server::App;

/// Depth of the outbound queue shared by REQ replay and live fan-out.
/// Replay waits for free slots; the router drops instead of waiting.
pub const SEND_QUEUE_DEPTH: usize = 3;

type FrameLimiter =
    RateLimiter<state::direct::NotKeyed, state::InMemoryState, clock::DefaultClock>;

/// Inbound frame budget per connection: 20 frames/s, bursting to 10.
fn frame_quota() -> Quota {
    Quota::per_second(nonzero!(20u32)).allow_burst(nonzero!(10u32))
}

/// Drive one websocket connection until the client disconnects, the frame
/// stream errors, or the server shuts down. Subscriptions registered by
/// the connection are released before returning.
pub async fn serve_socket(socket: WebSocket, app: Arc<App>, conn_id: String) {
    info!(conn = %conn_id, "websocket connected");
    let (tx, rx) = mpsc::channel::<ServerMsg>(SEND_QUEUE_DEPTH);
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_frames(sink, rx));

    let mut shutdown = app.shutdown.clone();
    read_frames(stream, &app, &conn_id, &tx, &mut shutdown).await;

    app.relay.drop_connection(&conn_id).await;
    drop(tx);
    let _ = writer.await;
    info!(conn = %conn_id, "websocket disconnected");
}

/// Drain the outbound queue into the socket, then send a best-effort
/// close frame. Exits when the queue closes or the peer goes away.
async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<ServerMsg>) {
    while let Some(msg) = rx.recv().await {
        if sink.send(Message::Text(msg.to_json())).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    app: &App,
    conn_id: &str,
    tx: &mpsc::Sender<ServerMsg>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let limiter: FrameLimiter = RateLimiter::direct(frame_quota());
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = throttled_next(&mut stream, &limiter) => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            // oversized frames surface here as a read error
            Some(Err(err)) => {
                debug!(conn = %conn_id, error = %err, "websocket read error");
                break;
            }
            None => break,
        };
        let txt = match msg {
            Message::Text(txt) => txt,
            Message::Close(_) => break,
            _ => continue,
        };
        match ClientMsg::from_json(&txt) {
            Ok(msg) => {
                if let Err(err) = dispatch(app, conn_id, tx, msg).await {
                    if matches!(err, RelayError::SinkClosed) {
                        break;
                    }
                    debug!(conn = %conn_id, error = %err, "client frame rejected");
                    let _ = tx.try_send(ServerMsg::notice(err.to_string()));
                }
            }
            Err(err) => {
                debug!(conn = %conn_id, error = %err, "invalid client frame");
                let _ = tx.try_send(ServerMsg::notice(err.to_string()));
            }
        }
    }
}

/// Wait for the frame budget, then read the next frame.
async fn throttled_next(
    stream: &mut SplitStream<WebSocket>,
    limiter: &FrameLimiter,
) -> Option<Result<Message, axum::Error>> {
    limiter.until_ready().await;
    stream.next().await
}

async fn dispatch(
    app: &App,
    conn_id: &str,
    tx: &mpsc::Sender<ServerMsg>,
    msg: ClientMsg,
) -> Result<(), RelayError> {
    match msg {
        ClientMsg::Event(ev) => {
            event::verify_event(&ev)
                .map_err(|e| RelayError::InvalidSignature(e.to_string()))?;
            app.relay.handle_event(ev).await?;
        }
        ClientMsg::Req { sub_id, filters } => {
            app.relay
                .handle_req(conn_id, &sub_id, filters, tx.clone())
                .await?;
        }
        ClientMsg::Close { sub_id } => {
            app.relay.handle_close(conn_id, &sub_id).await?;
        }
    }
    Ok(())
}
