use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use scheduler_common::{
    api,
    storage::load_json,
    Engine, FileStorage, HttpRequest, Method, Reply, RuntimeConfig, SimBoard, SoftRtc,
};

const CONFIG_KEY: &str = "config.json";
const REQUEST_QUEUE: usize = 16;

struct Envelope {
    request: HttpRequest,
    reply: oneshot::Sender<Reply>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("SCHEDULER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.scheduler"));
    let storage = FileStorage::new(data_dir);

    let mut runtime = load_runtime_config(&storage);
    if let Some(port) = std::env::var("SCHEDULER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.http_port = port;
    }
    runtime.sanitize();

    let tick = Duration::from_millis(runtime.scheduler.tick_interval_ms);
    let mut engine = Engine::boot(
        runtime.scheduler.clone(),
        SoftRtc::power_on(),
        SimBoard::new(),
        storage.clone(),
    );
    info!(
        "scheduler ready: {} device(s), {} task(s), data in {}",
        engine.devices().list().len(),
        engine.tasks().len(),
        storage.root().display()
    );

    let (tx, mut rx) = mpsc::channel::<Envelope>(REQUEST_QUEUE);
    let app = Router::new()
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(tx);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind scheduler server at {addr}"))?;
    info!("scheduler listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("http server stopped: {err}");
        }
    });

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.tick();
                debug!(
                    "tick {}: {} output(s) driven, {} task(s) retired",
                    report.now,
                    report.driven.len(),
                    report.retired.len()
                );
            }
            Some(envelope) = rx.recv() => {
                let reply = api::handle(&mut engine, &envelope.request);
                if envelope.reply.send(reply).is_err() {
                    debug!("client went away before the reply was ready");
                }
            }
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!("failed to listen for shutdown signal: {err}");
                }
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn load_runtime_config(storage: &FileStorage) -> RuntimeConfig {
    match load_json::<RuntimeConfig, _>(storage, CONFIG_KEY) {
        Ok(Some(runtime)) => runtime,
        Ok(None) => RuntimeConfig::default(),
        Err(err) => {
            warn!("failed to load runtime config, using defaults: {err}");
            RuntimeConfig::default()
        }
    }
}

async fn forward(
    State(tx): State<mpsc::Sender<Envelope>>,
    method: HttpMethod,
    uri: Uri,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|target| target.as_str())
        .unwrap_or_else(|| uri.path());
    let request = HttpRequest::from_target(
        Method::parse(method.as_str()),
        target,
        String::from_utf8_lossy(&body).into_owned(),
    );

    let (reply_tx, reply_rx) = oneshot::channel();
    let envelope = Envelope {
        request,
        reply: reply_tx,
    };
    if tx.send(envelope).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(reply) => into_response(&reply),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

fn into_response(reply: &Reply) -> Response {
    let status =
        StatusCode::from_u16(reply.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        [(header::CONTENT_TYPE, reply.content_type())],
        reply.body().to_string(),
    )
        .into_response();
    if let Some(location) = reply.location() {
        response
            .headers_mut()
            .insert(header::LOCATION, HeaderValue::from_static(location));
    }
    response
}
