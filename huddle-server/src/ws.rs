//! WebSocket sessions: complete the upgrade, then drive the frame codec
//! over the raw socket. Each session owns a writer task fed by an
//! unbounded queue; sends are fire-and-forget and a slow client only
//! grows its own queue.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use huddle_core::http::Request;
use huddle_core::room::ClientCommand;
use huddle_core::ws::{self, FrameKind};

use crate::http::{send_response, HttpContext};
use crate::registry::next_conn_id;
use crate::store::persist;

/// Take over an upgraded connection. Deregistration happens exactly once,
/// on the single exit path, before anything else can observe the closed
/// socket.
pub async fn run_session(
    mut stream: TcpStream,
    request: Request,
    ctx: HttpContext,
) -> std::io::Result<()> {
    let Some(key) = request.header("Sec-WebSocket-Key") else {
        return send_response(
            &mut stream,
            "400 Bad Request",
            "text/plain",
            b"missing Sec-WebSocket-Key",
            &[],
        )
        .await;
    };
    let accept = ws::accept_key(key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    let conn = next_conn_id();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    ctx.state.lock().await.register_client(conn, tx);
    info!(%conn, "websocket client connected");

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if writer.write_all(&ws::encode_text(&text)).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
    });

    // Bytes the client sent right behind the upgrade request are already
    // frame data.
    let mut buf: Vec<u8> = request.body;
    let mut chunk = [0u8; 8192];
    'session: loop {
        loop {
            match ws::decode(&buf, ctx.config.max_frame_bytes) {
                Ok(Some((frame, consumed))) => {
                    buf.drain(..consumed);
                    match frame.kind {
                        FrameKind::Text => {
                            if let Ok(text) = frame.text() {
                                dispatch_text(conn, text, &ctx).await;
                            }
                        }
                        FrameKind::Close => break 'session,
                        // Binary, Ping, Pong, Continuation: decoded as
                        // distinct kinds; the application keepalive is the
                        // JSON-level ping, so these are not acted on.
                        _ => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%conn, "dropping connection on frame error: {e}");
                    break 'session;
                }
            }
        }
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    // Deregister from registry and room before anyone else is notified.
    let storage = {
        let mut state = ctx.state.lock().await;
        state.remove_client(conn);
        let effects = state.core.disconnect(conn);
        state.apply(effects)
    };
    persist(&ctx.store, storage).await;
    writer_task.abort();
    info!(%conn, "websocket client disconnected");
    Ok(())
}

async fn dispatch_text(conn: huddle_core::ConnId, text: &str, ctx: &HttpContext) {
    // Unknown types and malformed JSON are ignored, like any other
    // client-side noise.
    let Ok(cmd) = serde_json::from_str::<ClientCommand>(text) else {
        debug!(%conn, "ignoring unrecognized client message");
        return;
    };
    let storage = {
        let mut state = ctx.state.lock().await;
        let effects = state.core.handle_command(conn, cmd);
        state.apply(effects)
    };
    persist(&ctx.store, storage).await;
}
