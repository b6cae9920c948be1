use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initialize logging and the panic logger.
/// Returns guards that must be kept alive for the duration of the program.
pub fn init_logging(level: tracing::Level) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    let mut guards = Vec::new();

    // stdout carries command output
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    guards.push(guard);

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(layer).init();

    register_panic_logger();
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        profile = build_profile(),
        "transfer cli starting"
    );

    guards
}

/// Registers a panic hook that logs panics using the `tracing` crate
fn register_panic_logger() {
    std::panic::set_hook(Box::new(|panic| match panic.location() {
        Some(loc) => {
            tracing::error!(
                message = %panic,
                panic.file = loc.file(),
                panic.line = loc.line(),
                panic.column = loc.column(),
            );
        }
        None => tracing::error!(message = %panic),
    }));
}

pub fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}
