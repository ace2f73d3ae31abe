use anyhow::{Context, Result};
use brainwave_recorder::config::Config;
use brainwave_recorder::device::DeviceSession;
use brainwave_recorder::ingest::run_ingest;
use brainwave_recorder::{FlushEngine, Normalizer, SqliteSink};
use bytes::Bytes;
use std::io::{self, BufRead, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ANONYMOUS_OWNER: &str = "Anonymous";

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,brainwave_recorder=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "brainwave-recorder"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn prompt_owner_name() -> Result<String> {
    print!("Please enter your name: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let name = line.trim();
    Ok(if name.is_empty() {
        ANONYMOUS_OWNER.to_string()
    } else {
        name.to_string()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let owner = match config.owner_name.clone() {
        Some(name) => name,
        None => prompt_owner_name().context("failed to read user name")?,
    };

    let sink = SqliteSink::open(&config.db_path, config.db_pool_size)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    match sink.recent(1).await {
        Ok(rows) => {
            let stored = sink.count().await.unwrap_or_default();
            let latest = rows.first().map(|row| row.timestamp.as_str()).unwrap_or("none");
            tracing::info!(stored, latest, "existing recordings");
        }
        Err(err) => tracing::warn!(error=%err, "failed to summarize existing recordings"),
    }

    let engine = FlushEngine::start(sink, config.flush_policy());
    let normalizer = Normalizer::new(owner);
    let policy = engine.policy();
    tracing::info!(
        owner = normalizer.owner(),
        max_buffer_size = policy.max_buffer_size,
        flush_interval_ms = policy.flush_interval.as_millis() as u64,
        "starting brainwave recorder"
    );

    let (tx, rx) = mpsc::channel::<Bytes>(config.stream_queue);
    let device = DeviceSession::connect(config.device_config(), tx);

    let ingest_cancel = CancellationToken::new();
    let mut ingest_handle = tokio::spawn(run_ingest(
        rx,
        normalizer,
        engine.clone(),
        ingest_cancel.clone(),
    ));

    let ingest_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            false
        }
        res = &mut ingest_handle => {
            if let Err(err) = res { tracing::error!(error=%err, "ingest task failed"); }
            true
        }
    };

    device.release().await;
    if !ingest_finished {
        // The device sender is gone, so the loop drains what is queued and exits.
        // A second Ctrl-C skips the rest of the queue.
        let drained = tokio::select! {
            res = &mut ingest_handle => Some(res),
            _ = tokio::signal::ctrl_c() => None,
        };
        let drained = match drained {
            Some(res) => res,
            None => {
                tracing::warn!("second shutdown signal; dropping queued device payloads");
                ingest_cancel.cancel();
                ingest_handle.await
            }
        };
        if let Err(err) = drained {
            tracing::error!(error=%err, "ingest task failed");
        }
    }

    match engine.shutdown().await {
        Ok(_) => {
            tracing::info!("recorder stopped");
            Ok(())
        }
        Err(err) => Err(err).context("final flush did not complete"),
    }
}
