use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Guard that must be held alive in `main` so buffered JSONL lines flush
/// on shutdown.
pub(crate) struct TracingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Initialize the layered tracing subscriber.
///
/// Layers:
/// 1. Console — compact human output, filtered by `RUST_LOG` with the
///    configured level as fallback.
/// 2. JSONL file — activated by `NUDGE_TRACE_FILE`, daily-rotated,
///    filtered at `debug`.
pub(crate) fn init(default_level: &str) -> TracingGuard {
    let mut guards = Vec::new();

    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{default_level},hyper_util=warn,reqwest=warn,sled=warn,tower_http=info"
        ))
    });
    let console_layer = fmt::layer()
        .compact()
        .without_time()
        .with_target(false)
        .with_filter(console_filter);

    let jsonl_layer = std::env::var("NUDGE_TRACE_FILE").ok().map(|trace_file| {
        let path = Path::new(&trace_file);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("traces.jsonl");

        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        let jsonl_filter = EnvFilter::new("debug,hyper_util=warn,reqwest=warn,sled=warn");
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_filter(jsonl_filter)
    });

    Registry::default()
        .with(console_layer)
        .with(jsonl_layer)
        .init();

    TracingGuard { _guards: guards }
}
