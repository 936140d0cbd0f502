use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Installs the global subscriber. `COURIER_LOG` wins over the configured filter.
pub fn init_tracing(filter: &str) {
    let filter = std::env::var("COURIER_LOG").unwrap_or_else(|_| filter.to_string());
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let _ = Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
