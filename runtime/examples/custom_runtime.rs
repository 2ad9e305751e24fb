//! Power-user example: fixed metrics address, more workers.
//!
//! ```bash
//! cargo run -p kaiku-runtime --example custom_runtime
//! ```

use kaiku_runtime::prelude::*;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let result = RuntimeBuilder::new()
        .metrics_addr(([127, 0, 0, 1], 9091).into())
        .configure(|pipeline, ctx| async move {
            Ok(pipeline
                .concurrency(8)
                .handler(LatencyRecorder::new(ctx.latency)))
        })
        .await;
    ExitCode::from(kaiku_runtime::exit_status(&result))
}
