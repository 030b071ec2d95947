use analytics_pipeline::relay::{self, RelayCommand};
use analytics_pipeline::{Analytics, PipelineConfig, PipelineMetrics};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = PipelineConfig::from_env().context("Failed to load configuration")?;
    let registry = prometheus::Registry::new();
    let metrics = PipelineMetrics::new(&registry)?;

    let analytics = Analytics::builder(config)
        .metrics(metrics)
        .build()
        .context("Failed to build analytics pipeline")?;
    analytics.init();
    if analytics.export().is_some() {
        analytics.register_export_destination()?;
    }

    info!("analytics-relay reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let command: RelayCommand = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed command");
                continue;
            }
        };

        let reply = relay::apply(&analytics, command).await;
        println!("{}", serde_json::to_string(&reply)?);
    }

    let outcome = analytics.flush().await;
    analytics.join_pending().await;
    info!(?outcome, "Final flush complete");

    println!("{}", serde_json::to_string(&analytics.usage_metrics())?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,analytics_pipeline=debug"));
    let json = std::env::var("ANALYTICS_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // stdout carries command replies
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}
