//! kaiku-session: session token correlation for replay
//!
//! A recorded session cookie is useless against the replay target: the
//! target hands out its own session ids. [`TokenCorrelator`] learns the
//! mapping while replaying and rewrites later requests to carry the live
//! value.
//!
//! ```text
//! request  ──► Cookie: SID=abc ──► lookup(SID, abc) ──► rewrite to SID=zzz (or leave alone)
//! response ──► keep the recorded response
//! replay   ──► observe(SID, replayed Set-Cookie, recorded Set-Cookie)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use kaiku_session::TokenCorrelator;
//!
//! kaiku_runtime::run(|pipeline, _ctx| async move {
//!     Ok(pipeline.handler(TokenCorrelator::new(Arc::new(TokenStore::new()))))
//! }).await
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use async_trait::async_trait;
use kaiku_gateway::http::{self, COOKIE, SET_COOKIE};
use kaiku_gateway::{Continuation, HandlerError, Message, Outcome, RequestHandler, Stage, TokenStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Cookie correlated when no other name is configured
pub const DEFAULT_TOKEN_NAME: &str = "JSESSIONID";

const NAME: &str = "token-correlator";

/// Request handler correlating one session cookie
///
/// The [`TokenStore`] is shared: hand the same store to every correlator
/// that should see the same sessions.
pub struct TokenCorrelator {
    token: Arc<str>,
    tokens: Arc<TokenStore>,
}

impl TokenCorrelator {
    /// Correlate [`DEFAULT_TOKEN_NAME`] in `tokens`
    pub fn new(tokens: Arc<TokenStore>) -> Self {
        Self {
            token: Arc::from(DEFAULT_TOKEN_NAME),
            tokens,
        }
    }

    /// Correlate the cookie `name` instead
    pub fn token_name(mut self, name: &str) -> Self {
        self.token = Arc::from(name);
        self
    }

    /// Request with the session cookie swapped for its live value
    ///
    /// `None` when the request carries no cookie or the value was never
    /// observed.
    fn rewrite(&self, msg: &Message) -> Option<Message> {
        let recorded = http::cookie(msg.payload(), &self.token, COOKIE)?;
        match self.tokens.lookup(&self.token, Some(recorded.as_str())) {
            Some(live) if !live.is_empty() => {
                info!(id = %msg.id(), token = %self.token, from = %recorded, to = %live, "Modifying cookie");
                let payload = http::set_cookie(msg.payload(), &self.token, &live);
                Some(msg.with_payload(payload))
            }
            _ => {
                info!(id = %msg.id(), token = %self.token, value = %recorded, "No live value yet, not updating");
                None
            }
        }
    }
}

#[async_trait]
impl RequestHandler for TokenCorrelator {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn on_request(&self, msg: &Message) -> Result<Outcome, HandlerError> {
        debug!(id = %msg.id(), "Processing request");

        let (outcome, request) = match self.rewrite(msg) {
            Some(rewritten) => (Outcome::rewrite(rewritten.clone()), rewritten),
            None => (Outcome::pass(), msg.clone()),
        };

        Ok(outcome.then(
            Stage::Response,
            AwaitResponse {
                token: Arc::clone(&self.token),
                tokens: Arc::clone(&self.tokens),
                request,
            },
        ))
    }
}

struct AwaitResponse {
    token: Arc<str>,
    tokens: Arc<TokenStore>,
    request: Message,
}

#[async_trait]
impl Continuation for AwaitResponse {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn resume(self: Box<Self>, msg: &Message) -> Result<Outcome, HandlerError> {
        let AwaitResponse {
            token,
            tokens,
            request,
        } = *self;

        Ok(Outcome::pass().then(
            Stage::Replay,
            AwaitReplay {
                token,
                tokens,
                request,
                response: msg.clone(),
            },
        ))
    }
}

struct AwaitReplay {
    token: Arc<str>,
    tokens: Arc<TokenStore>,
    request: Message,
    response: Message,
}

#[async_trait]
impl Continuation for AwaitReplay {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn resume(self: Box<Self>, msg: &Message) -> Result<Outcome, HandlerError> {
        let request_cookie = http::cookie(self.request.payload(), &self.token, COOKIE);
        let recorded = http::cookie(self.response.payload(), &self.token, SET_COOKIE);
        let replayed = http::cookie(msg.payload(), &self.token, SET_COOKIE);
        self.tokens
            .observe(&self.token, replayed.as_deref(), recorded.as_deref());

        debug!(
            id = %msg.id(),
            request_cookie = ?request_cookie,
            recorded_set_cookie = ?recorded,
            replayed_set_cookie = ?replayed,
            "Replayed response"
        );

        let replay_status = http::status(msg.payload());
        let response_status = http::status(self.response.payload());
        if replay_status == response_status {
            debug!(id = %msg.id(), status = ?replay_status, "Replay status is same as response status");
        } else {
            info!(
                id = %msg.id(),
                replay = ?replay_status,
                response = ?response_status,
                "Replay status differs from response status"
            );
        }
        Ok(Outcome::pass())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kaiku_gateway::EventBus;

    fn msg(stage: Stage, id: &str, payload: &str) -> Message {
        Message::new(stage, id.to_string(), [], Bytes::from(payload.to_string())).unwrap()
    }

    fn request(id: &str, cookie: &str) -> Message {
        msg(
            Stage::Request,
            id,
            &format!("GET / HTTP/1.1\r\nHost: a\r\nCookie: theme=dark; JSESSIONID={cookie}\r\n\r\n"),
        )
    }

    fn response(stage: Stage, id: &str, status: u16, set_cookie: &str) -> Message {
        msg(
            stage,
            id,
            &format!("HTTP/1.1 {status} X\r\nSet-Cookie: JSESSIONID={set_cookie}; Path=/\r\n\r\n"),
        )
    }

    fn bus(tokens: &Arc<TokenStore>) -> EventBus {
        EventBus::new(vec![Arc::new(TokenCorrelator::new(Arc::clone(tokens)))])
    }

    /// Formatted log output, shared with the subscriber
    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            let sink = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || sink.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::INFO)
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_unknown_cookie_is_left_alone() {
        let logs = Captured::default();
        let _guard = logs.install();
        let tokens = Arc::new(TokenStore::new());
        let bus = bus(&tokens);

        let out = bus.emit(request("1", "abc")).await.unwrap().unwrap();
        assert_eq!(out, request("1", "abc"));
        assert_eq!(bus.pending_count(), 1);
        assert!(logs.text().contains("No live value yet, not updating"));
        assert!(!logs.text().contains("Modifying cookie"));
    }

    #[tokio::test]
    async fn test_replay_observes_set_cookie() {
        let tokens = Arc::new(TokenStore::new());
        let bus = bus(&tokens);

        bus.emit(request("1", "abc")).await.unwrap();
        bus.emit(response(Stage::Response, "1", 200, "xyz")).await.unwrap();
        bus.emit(response(Stage::Replay, "1", 200, "xyz")).await.unwrap();

        assert_eq!(tokens.lookup("JSESSIONID", Some("xyz")).as_deref(), Some("xyz"));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_known_cookie_is_rewritten() {
        let tokens = Arc::new(TokenStore::new());
        tokens.observe("JSESSIONID", Some("zzz"), Some("abc"));
        let bus = bus(&tokens);

        let logs = Captured::default();
        let _guard = logs.install();
        let out = bus.emit(request("2", "abc")).await.unwrap().unwrap();
        assert_eq!(
            http::cookie(out.payload(), "JSESSIONID", COOKIE).as_deref(),
            Some("zzz")
        );
        assert!(logs.text().contains("Modifying cookie"));
        assert!(!logs.text().contains("not updating"));
        assert_eq!(http::cookie(out.payload(), "theme", COOKIE).as_deref(), Some("dark"));
    }

    #[tokio::test]
    async fn test_empty_live_value_is_not_applied() {
        let tokens = Arc::new(TokenStore::new());
        // Replay dropped the cookie the recording had
        tokens.observe("JSESSIONID", None, Some("abc"));
        let bus = bus(&tokens);

        let out = bus.emit(request("1", "abc")).await.unwrap().unwrap();
        assert_eq!(out, request("1", "abc"));
    }

    #[tokio::test]
    async fn test_request_without_cookie_still_followed() {
        let tokens = Arc::new(TokenStore::new());
        let bus = bus(&tokens);

        bus.emit(msg(Stage::Request, "1", "GET / HTTP/1.1\r\n\r\n")).await.unwrap();
        bus.emit(msg(Stage::Response, "1", "HTTP/1.1 200 OK\r\n\r\n")).await.unwrap();
        bus.emit(response(Stage::Replay, "1", 200, "fresh")).await.unwrap();

        // Recording had no cookie: the live value becomes the wildcard
        assert_eq!(tokens.lookup("JSESSIONID", Some("anything")).as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_custom_token_name() {
        let tokens = Arc::new(TokenStore::new());
        tokens.observe("SID", Some("live"), Some("old"));
        let bus = EventBus::new(vec![Arc::new(
            TokenCorrelator::new(Arc::clone(&tokens)).token_name("SID"),
        )]);

        let out = bus
            .emit(msg(Stage::Request, "1", "GET / HTTP/1.1\r\nCookie: SID=old\r\n\r\n"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(http::cookie(out.payload(), "SID", COOKIE).as_deref(), Some("live"));
    }
}
