//! kaiku-correlate: session-correlating replay middleware
//!
//! Rewrites the configured session cookie (`KAIKU_TOKEN_NAME`, default
//! `JSESSIONID`) to its live value and records replay latency.
//!
//! ```bash
//! gor --input-file requests.gor --output-http http://staging --middleware kaiku-correlate
//! ```

use kaiku_gateway::{LatencyRecorder, TokenStore};
use kaiku_session::TokenCorrelator;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    kaiku_runtime::run(|pipeline, ctx| async move {
        let tokens = Arc::new(TokenStore::new());
        Ok(pipeline
            .handler(TokenCorrelator::new(tokens).token_name(&ctx.config.token_name))
            .handler(LatencyRecorder::new(ctx.latency)))
    })
    .await
}
