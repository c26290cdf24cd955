//! # Worker HTTP service.
//!
//! Every worker of the pool binds the same address with `SO_REUSEPORT`, so the kernel spreads
//! connections across the generation(s) currently listening.
//!
//! | Route | Behavior |
//! |---|---|
//! | `GET /` | worker id, generation and pid |
//! | `GET /packages/{package}` | recorded version, or 404 |
//! | `POST /packages/{package}` `{"version"}` | sends an `update` action and waits for its reply |
//!
//! The record is read once at startup: a worker keeps serving the versions it started with,
//! and only the generation spawned by the restart that follows an update sees the new ones.
//!
//! On `disconnect` the server stops accepting, finishes in-flight requests and returns.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProcessError, ServiceError};
use crate::message::{ControlMessage, Frame, REF_FIELD, Reply};
use crate::process::{
    ENV_GENERATION, ENV_LISTEN, ENV_RECORD, ENV_WORKER_ID,
    link::{self, ParentSender},
};
use crate::record::{Record, RecordFile};

/// Startup settings of a worker process.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub listen: SocketAddr,
    pub record: PathBuf,
    pub worker_id: u64,
    pub generation: u64,
}

impl WorkerOptions {
    /// Reads the settings the supervisor passes through the environment.
    pub fn from_env() -> Result<Self, ServiceError> {
        Ok(Self {
            listen: env_parse(ENV_LISTEN, "127.0.0.1:8080")?,
            record: std::env::var_os(ENV_RECORD)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data.json")),
            worker_id: env_parse(ENV_WORKER_ID, "0")?,
            generation: env_parse(ENV_GENERATION, "0")?,
        })
    }
}

fn env_parse<T>(name: &str, default: &str) -> Result<T, ServiceError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|err: T::Err| ServiceError::Param {
        name: name.to_string(),
        reason: err.to_string(),
    })
}

/// Runs the worker until the supervisor asks it to disconnect.
pub async fn run(opts: WorkerOptions) -> Result<(), ServiceError> {
    let record = RecordFile::new(&opts.record).read().await?;
    let (parent, inbox) = link::connect();

    let listener = bind_shared(opts.listen)?;
    let addr = listener.local_addr().ok();
    let shutdown = CancellationToken::new();
    let pending = Pending::default();
    let state = AppState::new(record, &opts, parent.clone(), pending.clone());

    tokio::spawn(inbox_loop(inbox, pending, shutdown.clone()));
    parent.listening(addr.map(|a| a.to_string())).await?;
    info!(
        worker = opts.worker_id,
        generation = opts.generation,
        addr = ?addr,
        "worker listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServiceError::Serve)?;

    info!(worker = opts.worker_id, "worker disconnected");
    Ok(())
}

/// Binds a listener that other workers can bind as well.
fn bind_shared(addr: SocketAddr) -> Result<TcpListener, ServiceError> {
    let bind = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        TcpListener::from_std(socket.into())
    };
    bind().map_err(|source| ServiceError::Bind { addr, source })
}

/// Frames coming down from the supervisor.
///
/// Replies keep flowing after `disconnect` so in-flight updates can finish. Once the pipe
/// closes, waiting requests are released with an error.
async fn inbox_loop(
    mut inbox: mpsc::UnboundedReceiver<Frame>,
    pending: Pending,
    shutdown: CancellationToken,
) {
    while let Some(frame) = inbox.recv().await {
        match frame {
            Frame::Disconnect => shutdown.cancel(),
            Frame::Message { message } => pending.resolve(&message),
            Frame::Listening { .. } => debug!("ignoring listening frame from supervisor"),
        }
    }
    shutdown.cancel();
    pending.clear();
}

/// Update requests waiting for their reply, keyed by correlation id.
#[derive(Clone, Default)]
struct Pending {
    waiting: Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>,
    next_ref: Arc<AtomicU64>,
}

impl Pending {
    fn register(&self) -> (u64, oneshot::Receiver<Reply>) {
        let reference = self.next_ref.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(reference, tx);
        (reference, rx)
    }

    fn forget(&self, reference: u64) {
        self.lock().remove(&reference);
    }

    /// Hands a reply to the request waiting for it.
    fn resolve(&self, message: &ControlMessage) {
        let Some(reply) = Reply::from_message(message) else {
            debug!(kind = %message.kind, "ignoring non-reply message");
            return;
        };
        let Some(reference) = message.reference().and_then(Value::as_u64) else {
            warn!(kind = %message.kind, "reply without a correlation id dropped");
            return;
        };
        match self.lock().remove(&reference) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(reference, "reply for an unknown request dropped"),
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    record: Record,
    worker_id: u64,
    generation: u64,
    parent: ParentSender,
    pending: Pending,
}

impl AppState {
    fn new(record: Record, opts: &WorkerOptions, parent: ParentSender, pending: Pending) -> Self {
        Self {
            inner: Arc::new(AppInner {
                record,
                worker_id: opts.worker_id,
                generation: opts.generation,
                parent,
                pending,
            }),
        }
    }

    /// Sends an action request and waits for its correlated reply.
    async fn request(&self, message: ControlMessage) -> Result<Reply, ServiceError> {
        let pending = &self.inner.pending;
        let (reference, rx) = pending.register();

        let sent = self
            .inner
            .parent
            .message(message.with_field(REF_FIELD, reference))
            .await;
        if let Err(err) = sent {
            pending.forget(reference);
            return Err(err.into());
        }
        rx.await.map_err(|_| ServiceError::Link(ProcessError::Gone))
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/packages/{package}", get(get_package).post(update_package))
        .with_state(state)
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "worker": state.inner.worker_id,
        "generation": state.inner.generation,
        "pid": std::process::id(),
    }))
}

async fn get_package(State(state): State<AppState>, Path(package): Path<String>) -> ApiResult {
    match state.inner.record.version(&package) {
        Some(version) => Ok(Json(json!({ "package": package, "version": version }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown package", "package": package })),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    version: String,
}

async fn update_package(
    State(state): State<AppState>,
    Path(package): Path<String>,
    Json(body): Json<UpdateBody>,
) -> ApiResult {
    let message = ControlMessage::new("update")
        .with_field("package", package.as_str())
        .with_field("version", body.version.as_str());

    match state.request(message).await {
        Ok(Reply::Complete) => Ok(Json(json!({
            "package": package,
            "version": body.version,
            "status": "complete",
        }))),
        Ok(Reply::Error { code }) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "update failed", "code": code })),
        )),
        Err(err) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.to_string() })),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn opts() -> WorkerOptions {
        WorkerOptions {
            listen: "127.0.0.1:0".parse().unwrap(),
            record: PathBuf::from("unused.json"),
            worker_id: 7,
            generation: 3,
        }
    }

    fn state_with(packages: &[(&str, &str)], parent: ParentSender, pending: Pending) -> AppState {
        let record = Record {
            packages: packages
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Record::default()
        };
        AppState::new(record, &opts(), parent, pending)
    }

    /// Answers every update request with `reply`, the way the supervisor would.
    fn fake_supervisor(pending: Pending, reply: Reply) -> ParentSender {
        let (writer, reader) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(Frame::Message { message }) = serde_json::from_str::<Frame>(&line) else {
                    continue;
                };
                if message.kind == "update"
                    && message.params().get("package").map(String::as_str) == Some("foo")
                {
                    pending.resolve(&reply.to_message(message.reference()));
                }
            }
        });
        ParentSender::new(writer)
    }

    async fn post_update(reply: Reply) -> ApiResult {
        let pending = Pending::default();
        let parent = fake_supervisor(pending.clone(), reply);
        let state = state_with(&[], parent, pending);
        update_package(
            State(state),
            Path("foo".into()),
            Json(UpdateBody {
                version: "2".into(),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn test_status_returns_recorded_version_or_404() {
        let state = state_with(
            &[("foo", "2")],
            ParentSender::new(tokio::io::sink()),
            Pending::default(),
        );

        let Json(body) = get_package(State(state.clone()), Path("foo".into()))
            .await
            .unwrap();
        assert_eq!(body, json!({"package": "foo", "version": "2"}));

        let (status, _) = get_package(State(state), Path("bar".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_complete_is_200() {
        let Json(body) = post_update(Reply::Complete).await.unwrap();
        assert_eq!(body["status"], json!("complete"));
        assert_eq!(body["version"], json!("2"));
    }

    #[tokio::test]
    async fn test_update_error_is_500_with_code() {
        let (status, Json(body)) = post_update(Reply::Error { code: 1 }).await.unwrap_err();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], json!(1));
    }

    #[tokio::test]
    async fn test_root_reports_identity() {
        let state = state_with(&[], ParentSender::new(tokio::io::sink()), Pending::default());
        let Json(body) = root(State(state)).await;
        assert_eq!(body["worker"], json!(7));
        assert_eq!(body["generation"], json!(3));
    }

    #[test]
    fn test_uncorrelated_replies_are_dropped() {
        let pending = Pending::default();
        let (reference, mut rx) = pending.register();

        pending.resolve(&Reply::Complete.to_message(None));
        pending.resolve(&Reply::Complete.to_message(Some(&json!(reference + 1))));
        assert_eq!(pending.len(), 1);
        assert!(rx.try_recv().is_err());

        pending.resolve(&Reply::Complete.to_message(Some(&json!(reference))));
        assert_eq!(pending.len(), 0);
        assert_eq!(rx.try_recv().unwrap(), Reply::Complete);
    }

    async fn send_down(supervisor: &mut DuplexStream, frame: Frame) {
        let mut line = serde_json::to_vec(&frame).unwrap();
        line.push(b'\n');
        supervisor.write_all(&line).await.unwrap();
    }

    async fn within<F: std::future::Future>(fut: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn test_disconnect_stops_serving_but_replies_still_resolve() {
        let (mut supervisor, child_in) = tokio::io::duplex(4096);
        let (parent, inbox) = link::connect_with(child_in, tokio::io::sink());
        let pending = Pending::default();
        let shutdown = CancellationToken::new();
        let inbox_done = tokio::spawn(inbox_loop(inbox, pending.clone(), shutdown.clone()));

        let state = state_with(&[], parent, pending.clone());
        let in_flight = tokio::spawn(update_package(
            State(state),
            Path("foo".into()),
            Json(UpdateBody {
                version: "2".into(),
            }),
        ));
        within(async {
            while pending.len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        let (reference, reply_rx) = pending.register();

        send_down(&mut supervisor, Frame::Disconnect).await;
        within(shutdown.cancelled()).await;
        assert_eq!(pending.len(), 2);

        let reply = Reply::Complete.to_message(Some(&json!(reference)));
        send_down(&mut supervisor, Frame::from(reply)).await;
        assert_eq!(within(reply_rx).await.unwrap(), Reply::Complete);

        drop(supervisor);
        within(inbox_done).await.unwrap();
        let (status, Json(body)) = within(in_flight).await.unwrap().unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
        assert_eq!(pending.len(), 0);
    }
}
