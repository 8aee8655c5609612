use anyhow::Context;

#[derive(Copy, Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use LogFormat::*;
        match s {
            "plain" => Ok(Plain),
            "json" => Ok(Json),
            _ => anyhow::bail!("Unknown log format: '{s}'. Expected one of: plain, json"),
        }
    }
}

/// Initialize the process-wide tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise `default_level`.
/// Output goes to stderr so that command output on stdout (get-wal streams,
/// json listings) stays clean.
pub fn init(log_format: LogFormat, default_level: &str) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let base = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Json => base.json().try_init(),
        LogFormat::Plain => base.try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))
    .context("failed to initialize tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::from_config("plain").unwrap(), LogFormat::Plain);
        assert_eq!(LogFormat::from_config("json").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_config("verbose").is_err());
    }
}
