use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Quiet sqlx and the HTTP stack; job targets (`seed`, `assets`, `owners`,
/// `prices`, `generator`, `scheduler`) log at info.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Install the subscriber for the `codex` CLI and the `codex-sync` service.
///
/// `RUST_LOG` wins over `default_filter`. Targets stay visible so per-job
/// lines (`target = "prices"`) can be filtered, e.g. `RUST_LOG=prices=debug`.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing already initialised: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        assert!(EnvFilter::try_new("prices=debug,owners=trace").is_ok());
    }
}
