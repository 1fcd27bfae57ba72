//! Web surface: raw TCP accept loop, request assembly over incremental
//! reads, route dispatch, and hand-written HTTP/1.1 responses. A parse or
//! handler failure only ends its own connection; the accept loop never
//! dies from one.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use huddle_core::http::{Request, RequestAssembler};
use huddle_core::room::AttachmentPayload;
use huddle_core::{multipart, Error};

use crate::admin::AdminGate;
use crate::config::Config;
use crate::files::FileStore;
use crate::pages::StaticContent;
use crate::registry::SharedState;
use crate::store::Store;
use crate::ws;

#[derive(Clone)]
pub struct HttpContext {
    pub state: SharedState,
    pub store: Arc<Store>,
    pub files: Arc<FileStore>,
    pub admin: Arc<AdminGate>,
    pub pages: Arc<dyn StaticContent>,
    pub config: Arc<Config>,
}

pub async fn run_http(ctx: HttpContext, bind: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("web surface listening on {bind}");
    loop {
        let (stream, addr) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                debug!("connection from {addr} ended: {e}");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: HttpContext) -> std::io::Result<()> {
    let mut assembler = RequestAssembler::new();
    let mut chunk = [0u8; 8192];
    let request = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        assembler.push(&chunk[..n]);
        match assembler.try_parse() {
            Ok(Some(request)) => break request,
            Ok(None) => continue,
            Err(e) => {
                warn!("bad request: {e}");
                return send_error(&mut stream, "400 Bad Request", &e.to_string()).await;
            }
        }
    };

    if request.is_upgrade() {
        return ws::run_session(stream, request, ctx).await;
    }

    debug!("{} {}", request.method, request.path);
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => send_cors_preflight(&mut stream).await,
        ("POST", "/upload") => match handle_upload(&request, &ctx).await {
            Ok(body) => send_json(&mut stream, &body).await,
            Err(e) => send_error(&mut stream, e.status_line(), &e.to_string()).await,
        },
        ("POST", "/auth/register") => handle_register(&mut stream, &request, &ctx).await,
        ("POST", "/admin/api/login") => handle_admin_login(&mut stream, &request, &ctx).await,
        ("GET", "/admin/api/session") => match ctx.admin.validate(&request).await {
            Some(username) => {
                send_json(&mut stream, &json!({ "success": true, "username": username })).await
            }
            None => send_error(&mut stream, "401 Unauthorized", "Invalid or expired session").await,
        },
        ("GET", path) if path.starts_with("/files/") => {
            handle_file_serving(&mut stream, path, &ctx).await
        }
        ("GET", path) if path.starts_with("/join/") => {
            handle_invite(&mut stream, path, &ctx).await
        }
        ("GET", path) => match ctx.pages.page(path) {
            Some((body, content_type)) => {
                send_response(&mut stream, "200 OK", content_type, body.as_bytes(), &[]).await
            }
            None => send_error(&mut stream, "404 Not Found", "No such resource").await,
        },
        _ => send_error(&mut stream, "404 Not Found", "No such resource").await,
    }
}

/// Extract the single file part, write it to the file store, persist the
/// metadata, and hand the attachment to the chat core.
async fn handle_upload(request: &Request, ctx: &HttpContext) -> Result<serde_json::Value, Error> {
    if request.body.len() > ctx.config.max_upload_bytes {
        return Err(Error::Resource(format!(
            "upload of {} bytes exceeds the {} byte limit",
            request.body.len(),
            ctx.config.max_upload_bytes
        )));
    }
    let boundary = request
        .multipart_boundary()
        .ok_or(huddle_core::ProtocolError::BoundaryNotFound)?;
    let part = multipart::extract(&request.body, &boundary)?;

    let attachment = ctx
        .files
        .save(&part.filename, &part.mime_type, &part.data)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    ctx.store
        .save_attachment(&attachment)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    ctx.state
        .lock()
        .await
        .core
        .register_attachment(attachment.clone());

    info!(
        "stored upload {} ({} bytes, {})",
        attachment.original_file_name, attachment.file_size, attachment.mime_type
    );
    Ok(json!({
        "success": true,
        "attachment": AttachmentPayload::from(&attachment),
    }))
}

async fn handle_file_serving(
    stream: &mut TcpStream,
    path: &str,
    ctx: &HttpContext,
) -> std::io::Result<()> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    // /files/{stored-name} or /files/{id}/{original-name}
    let key = match components.as_slice() {
        ["files", name] => *name,
        ["files", id, _] => *id,
        _ => return send_error(stream, "404 Not Found", "File not found").await,
    };
    let Some(attachment) = ctx.store.find_attachment(key).await else {
        return send_error(stream, "404 Not Found", "File not found").await;
    };
    match ctx.files.read(&attachment).await {
        Ok(data) => {
            send_file(
                stream,
                &data,
                &attachment.mime_type,
                &attachment.original_file_name,
            )
            .await
        }
        Err(e) => {
            warn!("failed to read stored file {}: {e}", attachment.file_name);
            send_error(stream, "500 Internal Server Error", "Failed to read file").await
        }
    }
}

async fn handle_invite(
    stream: &mut TcpStream,
    path: &str,
    ctx: &HttpContext,
) -> std::io::Result<()> {
    let code = path.trim_start_matches("/join/");
    let resolved = {
        let mut state = ctx.state.lock().await;
        state.core.resolve_invite(code)
    };
    match resolved {
        Some(_) => match ctx.pages.page("/") {
            Some((body, content_type)) => {
                send_response(stream, "200 OK", content_type, body.as_bytes(), &[]).await
            }
            None => send_error(stream, "404 Not Found", "No such resource").await,
        },
        None => send_error(stream, "404 Not Found", "Invite link is invalid or expired").await,
    }
}

/// Delegate credential registration to the engine; the verification scheme
/// itself is the engine's business.
async fn handle_register(
    stream: &mut TcpStream,
    request: &Request,
    ctx: &HttpContext,
) -> std::io::Result<()> {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&request.body) else {
        return send_error(stream, "400 Bad Request", "Invalid request body").await;
    };
    let Some(username) = payload["username"].as_str() else {
        return send_error(stream, "400 Bad Request", "Missing username").await;
    };
    match ctx.admin.register(username, &payload) {
        Ok(identity) => {
            info!("registered credential for {identity}");
            send_json(stream, &json!({ "success": true, "username": identity })).await
        }
        Err(e) => send_error(stream, e.status_line(), &e.to_string()).await,
    }
}

async fn handle_admin_login(
    stream: &mut TcpStream,
    request: &Request,
    ctx: &HttpContext,
) -> std::io::Result<()> {
    let Ok(body) = std::str::from_utf8(&request.body) else {
        return send_error(stream, "400 Bad Request", "Invalid request body").await;
    };
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(body) else {
        return send_error(stream, "400 Bad Request", "Invalid request body").await;
    };
    let Some(username) = payload["username"].as_str() else {
        return send_error(stream, "400 Bad Request", "Missing username").await;
    };

    match ctx.admin.login(username, &payload).await {
        Ok(session_id) => {
            info!("admin login for {username}");
            let body = json!({
                "success": true,
                "sessionId": session_id,
                "username": username,
            });
            let cookie = format!(
                "{}={session_id}; HttpOnly; SameSite=Strict; Path=/admin",
                crate::admin::SESSION_COOKIE
            );
            send_response(
                stream,
                "200 OK",
                "application/json",
                body.to_string().as_bytes(),
                &[("Set-Cookie", cookie.as_str())],
            )
            .await
        }
        Err(e) => {
            warn!("admin login failed for {username}: {e}");
            send_error(stream, e.status_line(), &e.to_string()).await
        }
    }
}

pub async fn send_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
    extra_headers: &[(&str, &str)],
) -> std::io::Result<()> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Access-Control-Allow-Origin: *\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");

    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    stream.write_all(&bytes).await?;
    stream.flush().await
}

async fn send_json(stream: &mut TcpStream, body: &serde_json::Value) -> std::io::Result<()> {
    send_response(
        stream,
        "200 OK",
        "application/json",
        body.to_string().as_bytes(),
        &[],
    )
    .await
}

async fn send_error(stream: &mut TcpStream, status: &str, message: &str) -> std::io::Result<()> {
    let body = json!({ "success": false, "error": message });
    send_response(
        stream,
        status,
        "application/json",
        body.to_string().as_bytes(),
        &[],
    )
    .await
}

async fn send_file(
    stream: &mut TcpStream,
    data: &[u8],
    mime_type: &str,
    file_name: &str,
) -> std::io::Result<()> {
    let disposition = format!("inline; filename=\"{file_name}\"");
    send_response(
        stream,
        "200 OK",
        mime_type,
        data,
        &[("Content-Disposition", disposition.as_str())],
    )
    .await
}

async fn send_cors_preflight(stream: &mut TcpStream) -> std::io::Result<()> {
    let response = "HTTP/1.1 200 OK\r\n\
        Access-Control-Allow-Origin: *\r\n\
        Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
        Access-Control-Allow-Headers: Content-Type, Content-Length\r\n\
        Access-Control-Max-Age: 86400\r\n\
        Content-Length: 0\r\n\
        Connection: close\r\n\r\n";
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
