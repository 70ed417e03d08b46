use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "toolhost=debug,info" } else { "info" }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`. Output goes
/// to stderr so answers on stdout stay clean.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Already set in tests
}
