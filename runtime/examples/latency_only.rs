//! Minimal KAIKU middleware: records replay latency, rewrites nothing.
//!
//! ```bash
//! gor --input-file requests.gor --middleware "cargo run -p kaiku-runtime --example latency_only" ...
//! ```

use kaiku_runtime::prelude::*;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    kaiku_runtime::run(|pipeline, ctx| async move {
        Ok(pipeline.handler(LatencyRecorder::new(ctx.latency)))
    })
    .await
}
