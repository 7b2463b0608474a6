use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level`. Lance and DataFusion are chatty at info, so
/// they are held at warn unless asked for explicitly. Output goes to stderr so
/// CLI results on stdout stay machine-readable.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},lance=warn,lance_datafusion=warn,datafusion=warn",
            level
        ))
    });

    // A second init (tests, embedding the library) is not an error.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
