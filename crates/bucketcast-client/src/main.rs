//! bucketcast-tail: follow one subject's bucket stream from the terminal.

use std::process::ExitCode;

use bucketcast_client::{
    ClientConfig, ClientError, ClientEvent, CloseReason, DEFAULT_INITIAL_BACKOFF_MS,
    DEFAULT_JITTER_FRACTION, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_MS, HttpTransport,
    ReconnectingClient,
};
use bucketcast_wire::Resolution;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "bucketcast-tail", version, about = "Follow a bucketcast stream", long_about = None)]
struct Args {
    /// Server base URL, e.g. <http://127.0.0.1:3000>
    #[arg(long, env = "BUCKETCAST_URL", default_value = "http://127.0.0.1:3000")]
    url: String,

    /// Subject to follow, e.g. a ticker symbol
    #[arg(long, env = "BUCKETCAST_SUBJECT")]
    subject: String,

    /// Bucket width: 1m, 5m, 10m, 1h, 3h, 6h, 12h or 24h
    #[arg(long, env = "BUCKETCAST_RESOLUTION", default_value = "1m")]
    resolution: Resolution,

    #[arg(long, env = "BUCKETCAST_INITIAL_BACKOFF_MS", default_value_t = DEFAULT_INITIAL_BACKOFF_MS)]
    initial_backoff_ms: u64,

    #[arg(long, env = "BUCKETCAST_MAX_BACKOFF_MS", default_value_t = DEFAULT_MAX_BACKOFF_MS)]
    max_backoff_ms: u64,

    #[arg(long, env = "BUCKETCAST_JITTER_FRACTION", default_value_t = DEFAULT_JITTER_FRACTION)]
    jitter_fraction: f64,

    #[arg(long, env = "BUCKETCAST_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
}

impl Args {
    fn stream_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.url)?;
        url.path_segments_mut()
            .map_err(|_| ClientError::NotABase(self.url.clone()))?
            .pop_if_empty()
            .push("stream")
            .push(&self.subject);
        url.query_pairs_mut()
            .clear()
            .append_pair("resolution", self.resolution.as_str());
        Ok(url)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_backoff(self.initial_backoff_ms, self.max_backoff_ms)
            .with_jitter_fraction(self.jitter_fraction)
            .with_max_attempts(self.max_attempts)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "bucketcast-tail failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), ClientError> {
    let transport = HttpTransport::new(args.stream_url()?)?;
    info!(url = %transport.url(), "following stream");

    let client = ReconnectingClient::new(transport, args.client_config());
    let handle = client.spawn(|event| match event {
        ClientEvent::Frame(frame) => {
            println!("{}\t{}\t{}", frame.id, frame.event, frame.data);
        }
        ClientEvent::Open { sequence, trace_id } => {
            info!(sequence, trace_id = ?trace_id, "connected");
        }
        ClientEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        }
        ClientEvent::Closed(reason) => {
            info!(reason = ?reason, "closed");
        }
    });

    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    match handle.wait().await {
        CloseReason::Cancelled => Ok(()),
        CloseReason::Exhausted { attempts } => Err(ClientError::Exhausted { attempts }),
    }
}
