use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use eventsource_stream::Event as MessageEvent;
use ferrex_sync_model::{RealtimeEvent, StreamFrame};
use futures::StreamExt;
use futures::stream;
use reqwest::{Client, StatusCode};
use reqwest_eventsource::{Event, EventSource};

use super::{EventStreamSource, FrameStream, StreamError};
use crate::api::routes::v1;
use crate::credentials::AccessToken;

/// Server-sent events source for the session event stream.
///
/// Retries are disabled on the underlying event source; reconnecting is
/// the bridge's job.
#[derive(Debug, Clone)]
pub struct SseEventSource {
    client: Client,
    url: String,
}

impl SseEventSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        // No overall timeout: the response body is open-ended
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create event stream HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), v1::events::SESSION),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn map_error(err: reqwest_eventsource::Error) -> StreamError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _)
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
        {
            StreamError::Auth(format!("event stream rejected with status {status}"))
        }
        other => StreamError::Transport(other.to_string()),
    }
}

/// Decode one SSE message; keepalives and undecodable payloads yield `None`.
fn decode(msg: MessageEvent) -> Option<Result<StreamFrame, StreamError>> {
    // Skip keepalive messages silently
    if msg.data == "keepalive" || msg.data.is_empty() {
        log::debug!("[RealtimeBridge] Received keepalive");
        return None;
    }

    match serde_json::from_str::<RealtimeEvent>(&msg.data) {
        Ok(event) => {
            let id = (!msg.id.is_empty()).then_some(msg.id);
            Some(Ok(StreamFrame::new(id, event)))
        }
        Err(e) => {
            log::error!(
                "[RealtimeBridge] Failed to parse event '{}': {} - Data: {}",
                msg.event,
                e,
                msg.data
            );
            None
        }
    }
}

fn translate(
    event: Result<Event, reqwest_eventsource::Error>,
) -> Option<Result<StreamFrame, StreamError>> {
    match event {
        Ok(Event::Open) => None,
        Ok(Event::Message(msg)) => decode(msg),
        Err(e) => Some(Err(map_error(e))),
    }
}

#[async_trait]
impl EventStreamSource for SseEventSource {
    async fn connect(
        &self,
        token: Option<AccessToken>,
        last_event_id: Option<String>,
    ) -> Result<FrameStream, StreamError> {
        log::info!("[RealtimeBridge] Creating SSE connection to: {}", self.url);

        let mut request = self.client.get(&self.url);
        if let Some(token) = &token {
            request = request.header(reqwest::header::AUTHORIZATION, token.bearer());
        }
        if let Some(id) = &last_event_id {
            request = request.header("Last-Event-ID", id.as_str());
        }

        let mut source =
            EventSource::new(request).map_err(|e| StreamError::Transport(e.to_string()))?;
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        // The first event tells whether the server accepted the stream
        let first = match source.next().await {
            Some(Ok(Event::Open)) => None,
            Some(Ok(Event::Message(msg))) => decode(msg),
            Some(Err(e)) => {
                source.close();
                return Err(map_error(e));
            }
            None => {
                return Err(StreamError::Transport(
                    "event stream closed before opening".to_string(),
                ));
            }
        };

        let rest = source.filter_map(|event| async move { translate(event) });
        Ok(stream::iter(first).chain(rest).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrex_sync_model::EntityId;

    fn message(id: &str, data: &str) -> MessageEvent {
        MessageEvent {
            event: "message".to_string(),
            data: data.to_string(),
            id: id.to_string(),
            retry: None,
        }
    }

    #[test]
    fn keepalives_and_garbage_are_skipped() {
        assert!(decode(message("", "keepalive")).is_none());
        assert!(decode(message("1", "")).is_none());
        assert!(decode(message("2", "{not json")).is_none());
    }

    #[test]
    fn frames_keep_their_event_id() {
        let frame = decode(message(
            "41",
            r#"{"type":"stop","entityId":"m-42","positionTicks":90}"#,
        ))
        .unwrap()
        .unwrap();
        assert_eq!(frame.id.as_deref(), Some("41"));
        assert_eq!(
            frame.event,
            RealtimeEvent::Stop {
                entity_id: EntityId::new("m42").unwrap(),
                position_ticks: 90
            }
        );

        let anonymous = decode(message("", r#"{"type":"libraryChanged"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(anonymous.id, None);
    }

    #[test]
    fn url_targets_the_session_stream() {
        let source = SseEventSource::new("http://media.local:8096/").unwrap();
        assert_eq!(source.url(), "http://media.local:8096/api/v1/events/session");
    }
}
