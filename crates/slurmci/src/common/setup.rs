use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;
use std::io::Write;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line, suitable for Kubernetes log collectors
    Json,
}

/// Sets the behavior of the logger, based on passed environment variables
/// such as `RUST_LOG`.
pub fn setup_logging(verbose: bool, format: LogFormat) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let has_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug"))
        .unwrap_or(false);

    match format {
        LogFormat::Json => {
            let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| "unknown-pod".to_string());
            let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
            builder.format(move |buf, record| {
                let line = json_log_line(
                    &buf.timestamp_millis().to_string(),
                    record,
                    &pod_name,
                    &namespace,
                );
                writeln!(buf, "{line}")
            });
        }
        LogFormat::Text if verbose || has_debug => {
            builder.format_timestamp_millis();
        }
        LogFormat::Text => {
            // Shortened format
            // <time> <level> <message>
            builder.format(|buf, record| {
                let level_style = buf.default_level_style(record.level()).bold();
                writeln!(
                    buf,
                    "{} {level_style}{}{level_style:#} {}",
                    buf.timestamp_seconds(),
                    record.level(),
                    record.args()
                )
            });
        }
    }

    // Overwrite the defaults from env
    builder.parse_default_env();
    builder.init();
}

fn json_log_line(
    timestamp: &str,
    record: &log::Record,
    pod_name: &str,
    namespace: &str,
) -> serde_json::Value {
    serde_json::json!({
        "timestamp": timestamp,
        "level": record.level().as_str(),
        "target": record.target(),
        "message": record.args().to_string(),
        "pod_name": pod_name,
        "namespace": namespace,
    })
}
