use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if let Err(e) = result {
        tracing::debug!("Tracing already initialized: {}", e);
    }
}

/// Debug logs for this crate, info for everything else.
pub fn default_filter() -> String {
    format!("info,{}=debug", env!("CARGO_CRATE_NAME"))
}
