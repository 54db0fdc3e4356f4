//! Progress feed shown while a formulation is being generated.
//!
//! The feed is a server-sent event stream of `{stage, message}` payloads. It
//! runs next to the generate request and never blocks it: a feed that fails,
//! stalls or never connects only leaves the status surface on its fallback
//! captions.

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;

/// Stage label that ends the feed.
pub const DONE_STAGE: &str = "done";

/// Captions cycled while the server has not sent a message yet.
pub const FALLBACK_CAPTIONS: [&str; 4] = [
    "Enhancing your formulation request for clarity and precision...",
    "Consulting the AI for the most effective natural ingredients...",
    "Analyzing ingredient safety, compatibility, and efficacy...",
    "Finalizing your personalized formulation...",
];

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("malformed status event {data:?}: {source}")]
    Malformed {
        data: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("status stream transport error: {0}")]
    Transport(String),
}

/// Incremental `text/event-stream` framing. Feed it raw body chunks; it
/// yields the `data` payload of every completed event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(data) = self.process_line(&line) {
                events.push(data);
            }
        }

        events
    }

    /// Flushes a trailing event when the body ends without a blank line.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(data) = self.process_line(&line) {
                events.push(data);
            }
        }
        if let Some(data) = self.dispatch() {
            events.push(data);
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data_lines.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub stage: String,
    #[serde(default)]
    pub message: String,
}

impl StatusEvent {
    pub fn parse(data: &str) -> Result<Self, StatusError> {
        serde_json::from_str(data).map_err(|source| StatusError::Malformed {
            data: data.to_string(),
            source,
        })
    }

    pub fn is_done(&self) -> bool {
        self.stage == DONE_STAGE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Event(StatusEvent),
    Malformed(String),
    TransportError(String),
}

/// Why a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Done,
    Cancelled,
    /// Server closed the body without a `done` event.
    Closed,
    Failed,
}

/// One progress connection for one generation attempt.
pub struct StatusListener {
    client: ApiClient,
    query: String,
    cancel: CancellationToken,
}

impl StatusListener {
    pub fn new(client: ApiClient, query: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            client,
            query: query.into(),
            cancel,
        }
    }

    /// Drives the connection, awaiting `sink` for every update so none is
    /// dropped under backpressure. A sink that stops accepting ends the
    /// listener as [`StreamEnd::Cancelled`].
    pub async fn run<S>(self, mut sink: S) -> StreamEnd
    where
        S: Sink<StatusUpdate> + Unpin + Send,
    {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
            response = self.client.formulation_status(&self.query) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let err = StatusError::Transport(e.to_string());
                tracing::warn!("{}", err);
                let _ = sink.send(StatusUpdate::TransportError(err.to_string())).await;
                return StreamEnd::Failed;
            }
        };

        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("status stream cancelled");
                    return StreamEnd::Cancelled;
                }
                item = stream.next() => item,
            };

            let chunk = match item {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    let err = StatusError::Transport(e.to_string());
                    tracing::warn!("{}", err);
                    let _ = sink.send(StatusUpdate::TransportError(err.to_string())).await;
                    return StreamEnd::Failed;
                }
                None => break,
            };

            for data in decoder.push(&chunk) {
                if let Some(end) = deliver(&data, &mut sink).await {
                    return end;
                }
            }
        }

        for data in decoder.finish() {
            if let Some(end) = deliver(&data, &mut sink).await {
                return end;
            }
        }

        tracing::debug!("status stream closed without a {} event", DONE_STAGE);
        StreamEnd::Closed
    }
}

/// Sends one decoded payload. Returns the end reason when the feed is over.
async fn deliver<S>(data: &str, sink: &mut S) -> Option<StreamEnd>
where
    S: Sink<StatusUpdate> + Unpin,
{
    let (update, done) = match StatusEvent::parse(data) {
        Ok(event) => {
            tracing::debug!("status {}: {}", event.stage, event.message);
            let done = event.is_done();
            (StatusUpdate::Event(event), done)
        }
        Err(e) => {
            tracing::warn!("{}", e);
            (StatusUpdate::Malformed(data.to_string()), false)
        }
    };

    if sink.send(update).await.is_err() {
        tracing::debug!("status receiver gone");
        return Some(StreamEnd::Cancelled);
    }
    done.then_some(StreamEnd::Done)
}

/// When to hide the status surface, and for which attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HideRequest {
    pub attempt: u64,
    pub delay: Duration,
}

impl HideRequest {
    /// Sleeps out the delay and yields the attempt to pass to [`StatusBoard::hide`].
    pub async fn wait(self) -> u64 {
        tokio::time::sleep(self.delay).await;
        self.attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Updated,
    Done(HideRequest),
}

/// The status surface. Owned by the shell and written from its update loop
/// only, so the feed and the generate request never write it concurrently.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    visible: bool,
    stage: String,
    message: String,
    rotation: usize,
    attempt: u64,
    hide_delay: Duration,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl StatusBoard {
    pub fn new(hide_delay: Duration) -> Self {
        Self {
            visible: false,
            stage: String::new(),
            message: String::new(),
            rotation: 0,
            attempt: 0,
            hide_delay,
        }
    }

    /// Shows the surface for a new generation and returns its attempt id.
    pub fn begin(&mut self) -> u64 {
        self.attempt += 1;
        self.visible = true;
        self.stage.clear();
        self.message.clear();
        self.rotation = 0;
        self.attempt
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Last write wins. A `done` event asks for the surface to be hidden.
    pub fn apply(&mut self, event: StatusEvent) -> StatusOutcome {
        let done = event.is_done();
        self.stage = event.stage;
        self.message = event.message;
        if done {
            StatusOutcome::Done(self.hide_request())
        } else {
            StatusOutcome::Updated
        }
    }

    /// Hide request for the current attempt, used once generation settles.
    pub fn hide_request(&self) -> HideRequest {
        HideRequest {
            attempt: self.attempt,
            delay: self.hide_delay,
        }
    }

    pub fn rotate(&mut self) {
        self.rotation = (self.rotation + 1) % FALLBACK_CAPTIONS.len();
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Server message if one arrived, otherwise the current fallback caption.
    pub fn text(&self) -> &str {
        if self.message.is_empty() {
            FALLBACK_CAPTIONS[self.rotation]
        } else {
            &self.message
        }
    }

    /// Hides the surface unless a newer attempt has started since `attempt`.
    pub fn hide(&mut self, attempt: u64) {
        if attempt == self.attempt {
            self.visible = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"stage\":\"anal").is_empty());
        let events = decoder.push(b"yzing\",\"message\":\"Checking\"}\n\ndata: x\n");
        assert_eq!(events, vec!["{\"stage\":\"analyzing\",\"message\":\"Checking\"}".to_string()]);
        assert_eq!(decoder.push(b"\n"), vec!["x".to_string()]);
    }

    #[test]
    fn decoder_joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keep-alive\r\nevent: status\r\ndata: one\r\ndata:two\r\n\r\n\n");
        assert_eq!(events, vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), vec!["tail".to_string()]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn decoder_keeps_leading_space_of_token() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push(b"data:  world\n\n"), vec![" world".to_string()]);
    }

    #[test]
    fn status_event_parses_and_rejects() {
        let event = StatusEvent::parse(r#"{"stage":"analyzing","message":"Checking compatibility"}"#).unwrap();
        assert_eq!(event.stage, "analyzing");
        assert!(!event.is_done());
        assert!(StatusEvent::parse(r#"{"stage":"done"}"#).unwrap().is_done());
        assert!(matches!(StatusEvent::parse("not json"), Err(StatusError::Malformed { .. })));
    }

    #[test]
    fn board_prefers_server_message_over_rotation() {
        let mut board = StatusBoard::default();
        board.begin();
        assert_eq!(board.text(), FALLBACK_CAPTIONS[0]);
        board.rotate();
        assert_eq!(board.text(), FALLBACK_CAPTIONS[1]);

        let outcome = board.apply(StatusEvent {
            stage: "analyzing".into(),
            message: "Checking compatibility".into(),
        });
        assert_eq!(outcome, StatusOutcome::Updated);
        assert_eq!(board.text(), "Checking compatibility");
        assert_eq!(board.stage(), "analyzing");
    }

    #[test]
    fn board_accepts_unknown_stages() {
        let mut board = StatusBoard::default();
        board.begin();
        let outcome = board.apply(StatusEvent {
            stage: "some-new-phase".into(),
            message: "Working".into(),
        });
        assert_eq!(outcome, StatusOutcome::Updated);
    }

    #[test]
    fn stale_hide_does_not_close_newer_attempt() {
        let mut board = StatusBoard::default();
        let first = board.begin();
        let outcome = board.apply(StatusEvent {
            stage: "done".into(),
            message: "Formulation complete!".into(),
        });
        assert!(matches!(outcome, StatusOutcome::Done(ref hide) if hide.attempt == first));
        let second = board.begin();
        board.hide(first);
        assert!(board.is_visible());
        board.hide(second);
        assert!(!board.is_visible());
    }

    #[tokio::test]
    async fn done_hides_surface_after_delay() {
        let mut board = StatusBoard::new(Duration::from_millis(50));
        board.begin();
        let outcome = board.apply(StatusEvent {
            stage: "done".into(),
            message: "Formulation complete!".into(),
        });
        let StatusOutcome::Done(hide) = outcome else {
            panic!("expected done, got {:?}", outcome);
        };
        assert_eq!(hide.delay, Duration::from_millis(50));
        assert!(board.is_visible());

        let started = std::time::Instant::now();
        let attempt = hide.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(50));

        board.hide(attempt);
        assert!(!board.is_visible());
    }

    #[test]
    fn non_done_event_keeps_surface_open() {
        let mut board = StatusBoard::new(Duration::from_millis(50));
        board.begin();
        let outcome = board.apply(StatusEvent {
            stage: "selecting_ingredients".into(),
            message: "Choosing ingredients".into(),
        });
        assert_eq!(outcome, StatusOutcome::Updated);
        assert!(board.is_visible());
        assert_eq!(board.text(), "Choosing ingredients");
    }

    #[test]
    fn rotation_wraps() {
        let mut board = StatusBoard::default();
        board.begin();
        for _ in 0..FALLBACK_CAPTIONS.len() {
            board.rotate();
        }
        assert_eq!(board.text(), FALLBACK_CAPTIONS[0]);
    }
}
