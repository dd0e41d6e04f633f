use crate::RenderConfig;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes priority. Without it, validation builds log at `debug` and
/// everything else at `info`. A subscriber that is already installed is kept.
#[cfg(feature = "subscriber")]
pub fn init_tracing(config: &RenderConfig) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if config.validation { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("Tracing initialized with default level {default_directive}");
    }
}

#[cfg(not(feature = "subscriber"))]
pub fn init_tracing(_config: &RenderConfig) {}

#[cfg(all(test, feature = "subscriber"))]
mod tests {
    use super::*;

    #[test]
    fn second_init_keeps_the_installed_subscriber() {
        let config = RenderConfig::builder().validation(true).build();
        init_tracing(&config);
        init_tracing(&config);
        tracing::debug!("still logging");
    }
}
