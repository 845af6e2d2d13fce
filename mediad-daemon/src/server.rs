//! Request server hosted on the worker thread.
//!
//! The orchestrator only depends on the [`RequestServer`] / [`BoundServer`]
//! pair: bind first (so readiness can be reported), then block in
//! [`BoundServer::serve`] until the [`ShutdownHandle`] fires.
//!
//! [`JsonLineServer`] is the built-in implementation: newline-delimited JSON
//! over TCP, answering introspection requests only.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::context::{DaemonContext, VERSION};
use crate::error::{io_err, DaemonError};
use crate::protocol::{Request, Response};

/// Non-blocking stop request for a running server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask the server to stop. Returns `true` only for the first call.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called, including
    /// calls made before this future was created.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub trait RequestServer: Send + 'static {
    type Bound: BoundServer;

    /// Bind the listening endpoint. Must not block beyond the bind itself.
    fn bind(
        &self,
        context: &Arc<DaemonContext>,
        addr: SocketAddr,
    ) -> Result<Self::Bound, DaemonError>;
}

pub trait BoundServer: Send + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// Serve until `shutdown` fires. Returning early is treated as a failure.
    fn serve(self, shutdown: ShutdownHandle) -> Result<(), DaemonError>;
}

// ---------------------------------------------------------------------------
// JSON line server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineServer;

pub struct BoundJsonLineServer {
    listener: StdTcpListener,
    local_addr: SocketAddr,
    context: Arc<DaemonContext>,
}

impl RequestServer for JsonLineServer {
    type Bound = BoundJsonLineServer;

    fn bind(
        &self,
        context: &Arc<DaemonContext>,
        addr: SocketAddr,
    ) -> Result<Self::Bound, DaemonError> {
        let listener =
            StdTcpListener::bind(addr).map_err(|source| DaemonError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| io_err(addr.to_string(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| io_err(addr.to_string(), e))?;

        Ok(BoundJsonLineServer {
            listener,
            local_addr,
            context: context.clone(),
        })
    }
}

impl BoundServer for BoundJsonLineServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn serve(self, shutdown: ShutdownHandle) -> Result<(), DaemonError> {
        let threads = self.context.config.server().threads;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("request-io")
            .enable_all()
            .build()
            .map_err(|e| io_err("request-server runtime", e))?;

        tracing::info!(address = %self.local_addr, threads, "starting request server");
        let result = runtime.block_on(accept_loop(self.listener, self.context, shutdown));
        // In-flight requests are not drained.
        runtime.shutdown_background();
        tracing::info!("request server stopped");
        result
    }
}

async fn accept_loop(
    listener: StdTcpListener,
    context: Arc<DaemonContext>,
    shutdown: ShutdownHandle,
) -> Result<(), DaemonError> {
    let local = listener
        .local_addr()
        .map_err(|e| io_err("request-server listener", e))?;
    let listener =
        TcpListener::from_std(listener).map_err(|e| io_err(local.to_string(), e))?;

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_transient_accept_error(&err) => {
                        tracing::warn!(error = %err, "accept failed, retrying");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    Err(err) => return Err(io_err(local.to_string(), err)),
                };
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, context).await {
                        if is_disconnect(&err) {
                            tracing::debug!(%peer, error = %err, "peer went away");
                        } else {
                            tracing::error!(%peer, error = %err, "request client error");
                        }
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_client(stream: TcpStream, context: Arc<DaemonContext>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("request socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&request, &context),
            Err(err) => Response::error(format!("invalid request JSON: {err}")),
        };
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

fn dispatch(request: &Request, context: &DaemonContext) -> Response {
    match request.method.as_str() {
        "ping" => Response::ok(json!({ "pong": true })),
        "status" => Response::ok(status_payload(context)),
        other => Response::error(format!("unknown method '{other}'")),
    }
}

fn status_payload(context: &DaemonContext) -> serde_json::Value {
    let server = context.config.server();
    let descriptor = match &context.descriptor {
        Some(descriptor) => json!({
            "loaded": true,
            "media": descriptor.media_kinds(),
        }),
        None => json!({ "loaded": false }),
    };

    json!({
        "version": VERSION,
        "started_at": context.started_at,
        "uptime_secs": context.uptime().as_secs(),
        "address": server.bind_addr().to_string(),
        "codecs_enabled": context.config.codecs_enabled(),
        "descriptor": descriptor,
    })
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("request socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("request socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("request socket flush", e))?;
    Ok(())
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    ) || matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

fn is_disconnect(err: &DaemonError) -> bool {
    use std::io::ErrorKind;
    match err {
        DaemonError::Io { source, .. } => matches!(
            source.kind(),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
