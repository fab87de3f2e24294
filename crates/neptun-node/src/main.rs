//! Neptun Node - bridge daemon for Neptun AquaControl controllers
//!
//! Reads bus messages from stdin and writes bus messages to stdout, one
//! `topic<TAB>payload` line each, so a broker client can be piped in front
//! of it. Logs go to stderr.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use neptun_bridge::{NeptunBridge, NeptunConfig, NeptunConfigBuilder, StdioInterface};

#[derive(Parser, Debug)]
#[command(name = "neptun-node")]
#[command(about = "Bridge Neptun AquaControl frames to a local message bus")]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(long, short, env = "NB_CONFIG")]
    config: Option<PathBuf>,

    /// Prefix for state and command topics
    #[arg(long, env = "NB_TOPIC_PREFIX")]
    topic_prefix: Option<String>,

    /// Only accept frames from, and send commands to, this channel
    #[arg(long, env = "NB_CLOUD_PREFIX")]
    cloud_prefix: Option<String>,

    /// Retain settings topics
    #[arg(long, env = "NB_RETAIN", value_parser = clap::builder::BoolishValueParser::new())]
    retain: Option<bool>,

    /// Publish raw frame diagnostics
    #[arg(long, env = "NB_PUBLISH_RAW")]
    publish_raw: bool,

    /// Static outbound channel, as MAC=channel (repeatable)
    #[arg(long = "destination", value_parser = parse_destination)]
    destinations: Vec<(String, String)>,

    /// Liveness check period, e.g. "30s"
    #[arg(long)]
    check_interval: Option<humantime::Duration>,

    /// Silence before a device counts as lost, e.g. "5m"
    #[arg(long)]
    lost_timeout: Option<humantime::Duration>,

    /// Enable verbose logging
    #[arg(long, short, env = "NB_DEBUG")]
    verbose: bool,
}

fn parse_destination(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((mac, channel)) if !mac.is_empty() && !channel.is_empty() => {
            Ok((mac.to_string(), channel.to_string()))
        }
        _ => Err(format!("expected MAC=channel, got '{}'", value)),
    }
}

fn build_config(args: &Args) -> anyhow::Result<NeptunConfig> {
    let base = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            NeptunConfig::from_json(&json).with_context(|| format!("parsing {}", path.display()))?
        }
        None => NeptunConfig::default(),
    };

    let mut builder = NeptunConfigBuilder::from_config(base);
    if let Some(prefix) = &args.topic_prefix {
        builder = builder.topic_prefix(prefix.as_str());
    }
    if let Some(cloud) = args.cloud_prefix.as_deref().filter(|c| !c.is_empty()) {
        builder = builder.cloud_prefix(cloud);
    }
    if let Some(retain) = args.retain {
        builder = builder.retain(retain);
    }
    if args.publish_raw {
        builder = builder.publish_raw(true);
    }
    for (mac, channel) in &args.destinations {
        builder = builder.destination(mac.as_str(), channel.as_str());
    }
    if let Some(interval) = args.check_interval {
        builder = builder.check_interval(interval.into());
    }
    if let Some(timeout) = args.lost_timeout {
        builder = builder.lost_timeout(timeout.into());
    }

    let config = builder.build();
    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = build_config(&args)?;
    info!(
        topic_prefix = %config.topics.topic_prefix,
        cloud_prefix = config.topics.cloud_prefix.as_deref().unwrap_or("-"),
        retain = config.topics.retain,
        publish_raw = config.topics.publish_raw,
        "Starting Neptun node v{}",
        neptun_bridge::VERSION
    );

    let (bridge, handle) = NeptunBridge::new(StdioInterface::stdio(), &config)?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = handle.shutdown().await;
        }
    });

    bridge.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["neptun-node"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(
            parse_destination("AABB=cloud").unwrap(),
            ("AABB".to_string(), "cloud".to_string())
        );
        assert!(parse_destination("AABB").is_err());
        assert!(parse_destination("=cloud").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = build_config(&args(&[
            "--topic-prefix",
            "water",
            "--cloud-prefix",
            "cloud",
            "--retain",
            "false",
            "--publish-raw",
            "--destination",
            "AABB=vendor",
            "--check-interval",
            "10s",
        ]))
        .unwrap();

        assert_eq!(config.topics.topic_prefix, "water");
        assert_eq!(config.topics.cloud_prefix.as_deref(), Some("cloud"));
        assert!(!config.topics.retain);
        assert!(config.topics.publish_raw);
        assert_eq!(config.destinations.get("AABB").map(String::as_str), Some("vendor"));
        assert_eq!(config.liveness.check_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_cloud_prefix_means_any() {
        let config = build_config(&args(&["--cloud-prefix", ""])).unwrap();
        assert!(config.topics.cloud_prefix.is_none());
    }

    #[test]
    fn test_bad_prefix_rejected() {
        assert!(build_config(&args(&["--topic-prefix", "a/b"])).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(build_config(&args(&["--config", "/nonexistent/neptun.json"])).is_err());
    }
}
