use std::{future::IntoFuture, net::SocketAddr, process, sync::Arc};

use bucketcast::{
    application::{
        error::AppError,
        registry::ConnectionRegistry,
        session::{StreamConfig, StreamContext},
        sink::Sink,
    },
    cache::{CacheConfig, CacheMetrics, CacheStore},
    config,
    domain::clock::{Clock, SystemClock},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        sink::TracingSink,
        telemetry,
        upstream::HttpDataSource,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let source = Arc::new(HttpDataSource::from_settings(&settings.upstream)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sink: Arc<dyn Sink> = Arc::new(TracingSink);

    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(CacheStore::new(&cache_config));
    let metrics = Arc::new(CacheMetrics::new(
        Arc::clone(&store),
        Arc::clone(&sink),
        Arc::clone(&clock),
        &cache_config,
    ));

    let shutdown = CancellationToken::new();
    let reporter = metrics.spawn_reporter(cache_config.metrics_interval, shutdown.child_token());

    let stream_config = StreamConfig::from(&settings.stream);
    let retry_after_secs = stream_config.retry_hint_ms.div_ceil(1000).max(1);
    let state = HttpState {
        stream: StreamContext {
            store,
            metrics: Arc::clone(&metrics),
            source,
            sink,
            clock,
            config: stream_config,
        },
        registry: ConnectionRegistry::new(settings.admission.max_sessions_per_identity.get()),
        shutdown: shutdown.clone(),
        retry_after_secs,
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        addr = %settings.server.addr,
        max_entries = cache_config.max_entries,
        "bucketcast listening"
    );

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let drain = shutdown.clone();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { drain.cancelled().await })
    .into_future();
    tokio::pin!(server);

    let served = tokio::select! {
        result = &mut server => result,
        _ = shutdown.cancelled() => {
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        timeout_secs = settings.server.graceful_shutdown.as_secs(),
                        "graceful shutdown timed out; dropping open connections"
                    );
                    Ok(())
                }
            }
        }
    };

    shutdown.cancel();
    if reporter.await.is_err() {
        warn!("cache metrics reporter ended abnormally");
    }
    metrics.emit();
    info!("bucketcast stopped");

    served.map_err(|err| AppError::from(InfraError::from(err)))
}

async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    token.cancel();
}
