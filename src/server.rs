use crate::handler::{Ack, NotificationHandler};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use failure::Fail;
use futures::{pin_mut, Stream, StreamExt};
use log::{error, info, warn};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use warp::http::StatusCode;
use warp::Filter;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Graceful,
    /// The grace period ran out; requests not yet handled were answered with
    /// 503 and dropped.
    Forced,
}

#[derive(Debug, Fail)]
pub enum ServerError {
    #[fail(display = "server is already {}", _0)]
    AlreadyRunning(&'static str),
    #[fail(display = "server is not running")]
    NotRunning,
    #[fail(display = "failed to listen on {}: {}", addr, cause)]
    Bind {
        addr: SocketAddr,
        #[cause]
        cause: warp::Error,
    },
}

#[derive(Debug, Fail)]
enum BodyError {
    #[fail(display = "body exceeds {} bytes", _0)]
    TooLarge(u64),
    #[fail(display = "failed to read body: {}", _0)]
    Read(#[cause] warp::Error),
}

struct Running {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Server {
    handler: NotificationHandler,
    grace: Duration,
    max_body_bytes: u64,
    state: watch::Sender<ServerState>,
    running: Option<Running>,
}

impl Server {
    pub fn new(handler: NotificationHandler) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            handler,
            grace: DEFAULT_SHUTDOWN_GRACE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            state,
            running: None,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// The bound address, with the real port when 0 was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    pub fn handler(&self) -> &NotificationHandler {
        &self.handler
    }

    pub async fn start(&mut self, host: IpAddr, port: u16) -> Result<SocketAddr, ServerError> {
        let current = self.state();
        if current != ServerState::Stopped {
            return Err(ServerError::AlreadyRunning(current.as_str()));
        }
        self.state.send_replace(ServerState::Starting);

        let requested = SocketAddr::new(host, port);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let routes = routes(
            self.handler.clone(),
            self.state.subscribe(),
            cancel_rx,
            self.max_body_bytes,
        );
        let bound = warp::serve(routes).try_bind_with_graceful_shutdown(requested, async move {
            let _ = shutdown_rx.await;
        });
        let (addr, server) = match bound {
            Ok(bound) => bound,
            Err(cause) => {
                self.state.send_replace(ServerState::Stopped);
                return Err(ServerError::Bind {
                    addr: requested,
                    cause,
                });
            }
        };

        let task = tokio::spawn(server);
        self.running = Some(Running {
            addr,
            shutdown_tx,
            cancel_tx,
            task,
        });
        self.state.send_replace(ServerState::Running);
        info!("Server listening on http://{}", addr);
        Ok(addr)
    }

    /// Stops accepting connections and waits up to the grace period for
    /// accepted requests to be acknowledged. Requests still unhandled after
    /// that are cancelled; `Stopped` is reported once no handling or image
    /// write remains.
    pub async fn stop(&mut self) -> Result<Shutdown, ServerError> {
        let running = self.running.take().ok_or(ServerError::NotRunning)?;
        self.state.send_replace(ServerState::Stopping);
        info!("Stopping server on {}", running.addr);

        let _ = running.shutdown_tx.send(());
        let mut task = running.task;
        let shutdown = match timeout(self.grace, &mut task).await {
            Ok(Ok(())) => Shutdown::Graceful,
            Ok(Err(e)) => {
                error!("Server task ended abnormally: {}", e);
                running.cancel_tx.send_replace(true);
                Shutdown::Forced
            }
            Err(_) => {
                warn!(
                    "Requests still in flight after {:?}; cancelling them",
                    self.grace
                );
                running.cancel_tx.send_replace(true);
                task.abort();
                let _ = task.await;
                Shutdown::Forced
            }
        };

        let in_flight = self.handler.in_flight();
        if timeout(self.grace, in_flight.drained()).await.is_err() {
            error!(
                "{} notifications still being written after shutdown",
                in_flight.len()
            );
        }

        self.state.send_replace(ServerState::Stopped);
        info!("Server stopped");
        Ok(shutdown)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(());
        }
    }
}

fn routes(
    handler: NotificationHandler,
    state: watch::Receiver<ServerState>,
    cancel: watch::Receiver<bool>,
    max_body_bytes: u64,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let notification = warp::post()
        .and(warp::path!("NotificationInfo" / String))
        .and(warp::addr::remote())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::stream())
        .and(warp::any().map(move || handler.clone()))
        .and(warp::any().map(move || cancel.clone()))
        .and_then(
            move |action: String,
                  remote: Option<SocketAddr>,
                  content_type: Option<String>,
                  body,
                  handler: NotificationHandler,
                  cancel: watch::Receiver<bool>| async move {
                let remote = remote
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let work = async {
                    match read_body(body, max_body_bytes).await {
                        Ok(body) => {
                            handler
                                .handle(&action, &remote, content_type.as_deref(), body)
                                .await
                        }
                        Err(e) => handler.handle_unreadable(&action, &remote, &e),
                    }
                };
                let reply = tokio::select! {
                    biased;
                    _ = cancelled(cancel) => {
                        warn!(
                            "Server shut down before the notification was handled; dropped. action={} ip={}",
                            action, remote
                        );
                        warp::reply::with_status(
                            warp::reply::json(&Ack { result: false }),
                            StatusCode::SERVICE_UNAVAILABLE,
                        )
                    }
                    ack = work => warp::reply::with_status(warp::reply::json(&ack), StatusCode::OK),
                };
                Ok::<_, warp::Rejection>(reply)
            },
        );

    let health = warp::get()
        .and(warp::path!("health"))
        .and(warp::any().map(move || state.clone()))
        .map(|state: watch::Receiver<ServerState>| {
            let current = *state.borrow();
            let (status, code) = match current {
                ServerState::Running => ("ok", StatusCode::OK),
                other => (other.as_str(), StatusCode::SERVICE_UNAVAILABLE),
            };
            warp::reply::with_status(warp::reply::json(&json!({ "status": status })), code)
        });

    notification.or(health)
}

async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        let set = *cancel.borrow_and_update();
        if set {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without cancelling: never fires
            futures::future::pending::<()>().await;
        }
    }
}

/// Collects the request body, giving up once it grows past `limit`.
async fn read_body<S, B>(body: S, limit: u64) -> Result<Bytes, BodyError>
where
    S: Stream<Item = Result<B, warp::Error>>,
    B: Buf,
{
    pin_mut!(body);
    let mut data = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if (data.len() + chunk.remaining()) as u64 > limit {
            return Err(BodyError::TooLarge(limit));
        }
        data.put(chunk);
    }
    Ok(data.freeze())
}

/// The address other hosts would reach us on, for the startup log. Falls back
/// to loopback on any error.
pub fn detect_local_ip() -> IpAddr {
    let detect = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    detect().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
