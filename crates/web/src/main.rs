mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    Router,
    extract::FromRef,
    http::{HeaderName, Request, StatusCode, header},
};
use taskhook_core::config::Config;
use taskhook_db::Database;
use taskhook_github::GitHubApp;
use taskhook_intree::{BuiltinValidator, CompileSettings, Compiler};
use taskhook_jobs::{JobContext, JobStorage, create_monitor};
use taskhook_taskcluster::QueueClient;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::{RELAY_SIGNATURE_HEADER, build_router};

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    jobs: Arc<JobStorage>,
    started: Instant,
}

fn load_config() -> anyhow::Result<Arc<Config>> {
    let path = std::env::var("TASKHOOK_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
    let file = BufReader::new(
        File::open(&path).with_context(|| format!("Failed to open config file {path}"))?,
    );
    let config = serde_yaml::from_reader(file).context("Failed to parse config file")?;
    Ok(Arc::new(config))
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = load_config().expect("Failed to load config");
    let db = Database::new(&config.db).await.expect("Failed to open database");
    let github = GitHubApp::new(&config.github.app).expect("Failed to create GitHub client");
    let queue = QueueClient::new(&config.taskcluster).expect("Failed to create queue client");
    let jobs = JobStorage::setup(&config.db).await.expect("Failed to set up job storage");
    let compiler =
        Compiler::new(CompileSettings::from_config(&config), Arc::new(BuiltinValidator));

    let job_context = JobContext {
        config: config.clone(),
        store: Arc::new(db.clone()),
        github,
        queue,
        compiler,
        publisher: jobs.clone(),
    };
    let monitor = create_monitor(jobs.clone(), job_context, &config.worker);

    let port = config.server.port;
    let state = AppState { config, jobs, started: Instant::now() };
    let router = app(state);

    // Prefer a socket passed in by systemd
    #[allow(unused_mut)]
    let mut listener = None;
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::{FromRawFd, IntoRawFd};
        let fds = libsystemd::activation::receive_descriptors_with_names(false)
            .expect("Failed to receive fds");
        if let Some((fd, name)) = fds.into_iter().next() {
            tracing::info!("Web server: Listening on {}", name);
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd.into_raw_fd()) };
            std_listener.set_nonblocking(true).expect("Failed to set non-blocking");
            listener =
                Some(TcpListener::from_std(std_listener).expect("Failed to create listener"));
        }
    }
    let listener = match listener {
        Some(listener) => listener,
        None => {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            tracing::info!("Web server: Listening on {}", addr);
            TcpListener::bind(addr).await.expect("bind error")
        }
    };

    #[cfg(target_os = "linux")]
    {
        libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Ready])
            .expect("Failed to notify");
    }

    // Run both the web server and job monitor concurrently, with graceful shutdown
    let web_server = async {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Web server error");
        tracing::info!("Web server stopped");
        result
    };
    let job_monitor = async {
        let result =
            monitor.run_with_signal(shutdown_signal_io()).await.context("Job monitor error");
        tracing::info!("Job monitor stopped");
        result
    };

    if let Err(e) = tokio::try_join!(web_server, job_monitor) {
        tracing::error!("{e:#}");
    }

    #[cfg(target_os = "linux")]
    {
        libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Stopping])
            .expect("Failed to notify");
    }

    db.close().await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![
        header::AUTHORIZATION,
        HeaderName::from_static("x-hub-signature-256"),
        HeaderName::from_static(RELAY_SIGNATURE_HEADER),
    ]
    .into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DeliverySpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .compression();
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() { shutdown_signal_io().await.unwrap() }

async fn shutdown_signal_io() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

/// Request span tagged with the webhook delivery id, when present.
#[derive(Debug, Clone)]
pub struct DeliverySpan {
    level: Level,
}

impl<B> MakeSpan<B> for DeliverySpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let delivery = request
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    delivery = %delivery,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
