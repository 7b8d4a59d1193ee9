//! Tracing setup and line forwarding for child process output.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Default filter when `RUST_LOG` is unset.
pub fn default_directives(debug: bool) -> &'static str {
    if debug {
        "debug,kube=info,hyper=info,tower=info"
    } else {
        "info"
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `debug`.
pub fn init_logging(format: LogFormat, debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .init(),
    }

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "logging initialized");
}

/// Feed every line of `reader` to `sink`, without the line terminator.
///
/// Lines split across reads are joined before `sink` sees them; a final line without a
/// newline is delivered at EOF. Returns the number of lines delivered.
pub async fn forward_lines<R, F>(reader: R, mut sink: F) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        sink(line.trim_end_matches('\r'));
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn joins_lines_split_across_reads() {
        let reader = tokio_test::io::Builder::new()
            .read(b"dumping ta")
            .read(b"ble orders\r\nVACUUM")
            .read(b" done\npartial tail")
            .build();

        let mut seen = Vec::new();
        let count = forward_lines(reader, |line| seen.push(line.to_string()))
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            seen,
            vec!["dumping table orders", "VACUUM done", "partial tail"]
        );
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let reader = tokio_test::io::Builder::new().build();
        let count = forward_lines(reader, |_| panic!("no lines expected"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn debug_raises_default_level() {
        assert_eq!(default_directives(false), "info");
        assert!(default_directives(true).starts_with("debug"));
    }
}
