//! Tracing setup for embedding binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize console tracing, honoring `RUST_LOG` when set.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "archivist=debug,librqbit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
