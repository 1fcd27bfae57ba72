//! Peer transport: TCP listener for incoming links, outbound connects for
//! discovered peers, and the envelope read loop. Reads are length-exact:
//! 4 prefix bytes, then exactly the claimed payload, with a cap and an
//! idle timeout so a stalled or lying peer cannot pin the task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use huddle_core::wire;

use crate::config::Config;
use crate::registry::{next_conn_id, SharedState};
use crate::store::{persist, Store};

#[derive(Clone)]
pub struct PeerContext {
    pub state: SharedState,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
}

/// Run the peer transport: accept incoming links and connect out to
/// addresses pushed by discovery.
pub async fn run_transport(
    ctx: PeerContext,
    mut connect_rx: mpsc::UnboundedReceiver<SocketAddr>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", ctx.config.peer_port)).await?;
    info!("peer transport listening on port {}", ctx.config.peer_port);

    let accept_ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let ctx = accept_ctx.clone();
                    tokio::spawn(async move {
                        run_peer_link(stream, addr, ctx).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    while let Some(addr) = connect_rx.recv().await {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => run_peer_link(stream, addr, ctx).await,
                Err(e) => debug!("peer connect to {addr} failed: {e}"),
            }
        });
    }
    Ok(())
}

/// Drive one peer link until the socket closes, errors, stalls past the
/// idle window, or violates the envelope cap. The link is deregistered and
/// the closure logged exactly once, on the single exit path.
async fn run_peer_link(stream: TcpStream, addr: SocketAddr, ctx: PeerContext) {
    let conn = next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut state = ctx.state.lock().await;
        state.register_peer(conn, tx);
        let effects = state.core.peer_link_established(conn);
        state.apply(effects);
    }
    info!(%conn, peer = %addr, "peer link established");

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
    });

    let idle = Duration::from_secs(ctx.config.peer_idle_timeout_secs);
    let max_envelope = ctx.config.max_envelope_bytes;
    loop {
        let mut len_buf = [0u8; 4];
        match timeout(idle, reader.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                debug!(%conn, "peer read idle past {}s", idle.as_secs());
                break;
            }
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_envelope {
            warn!(%conn, len, "peer claimed an oversized envelope, disconnecting");
            break;
        }
        let mut framed = vec![0u8; 4 + len];
        framed[..4].copy_from_slice(&len_buf);
        match timeout(idle, reader.read_exact(&mut framed[4..])).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                debug!(%conn, "peer stalled mid-envelope");
                break;
            }
        }

        let msg = match wire::decode_envelope(&framed, max_envelope) {
            Ok((msg, _)) => msg,
            Err(e) => {
                warn!(%conn, "undecodable peer envelope: {e}");
                break;
            }
        };
        let storage = {
            let mut state = ctx.state.lock().await;
            let effects = state.core.apply_peer(conn, msg);
            state.apply(effects)
        };
        persist(&ctx.store, storage).await;
    }

    ctx.state.lock().await.remove_peer(conn);
    writer_task.abort();
    info!(%conn, peer = %addr, "peer link closed");
}
