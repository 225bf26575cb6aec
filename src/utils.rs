use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::Result;
use crate::Config;

/// Environment prefix for overrides, e.g. `HWCODEC__PIPELINE__DTS_MODE=true`.
pub const ENV_PREFIX: &str = "HWCODEC";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hwcodec=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

/// Defaults, then `path` if it exists, then `HWCODEC__*` variables.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path.as_ref()).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = load_config("/nonexistent/hwcodec.toml").unwrap();
        assert_eq!(config.pipeline.ledger_size, 40);
        assert_eq!(config.buffers.extra_dpb_buffers, 3);
        assert!(!config.pipeline.dts_mode);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("hwcodec-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hwcodec.toml");
        std::fs::write(&path, "[pipeline]\nledger_size = 64\ndts_mode = true\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.pipeline.ledger_size, 64);
        assert!(config.pipeline.dts_mode);
        assert_eq!(config.pipeline.queue_wait_ms, 20);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
