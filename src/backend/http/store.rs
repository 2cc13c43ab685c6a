use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt, future::BoxFuture, pin_mut};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    QuizBackend,
    error::{BackendError, BackendResult},
    models::{
        AnswerEntity, ChangeEvent, ChannelEvent, EngagementEntity, FeedChannel, FeedTopic,
        JoinTarget, QuestionEntity, QuizEntity, QuizOrSlot, SlotEntity,
    },
};

use super::{
    config::HttpBackendConfig,
    error::{ErrorBody, HttpDaoError, HttpResult},
};

const FEED_BUFFER: usize = 32;

/// [`QuizBackend`] speaking JSON over HTTP, with change feeds delivered as
/// server-sent events.
#[derive(Clone)]
pub struct HttpQuizBackend {
    client: Client,
    base_url: Arc<str>,
    token: Option<Arc<str>>,
}

#[derive(Serialize)]
struct CompletionRequest {
    user_id: Uuid,
    quiz_id: Uuid,
}

impl HttpQuizBackend {
    /// Build the HTTP client for the configured backend.
    pub fn connect(config: HttpBackendConfig) -> HttpResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| HttpDaoError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::<str>::from(config.base_url.trim_end_matches('/')),
            token: config.token.map(Arc::<str>::from),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match self.token {
            Some(ref token) => builder.bearer_auth(token.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, path: &str, builder: reqwest::RequestBuilder) -> HttpResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|source| HttpDaoError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.json::<ErrorBody>().await.unwrap_or_default();
        Err(HttpDaoError::Refused {
            path: path.to_string(),
            status,
            reason: body.reason(),
        })
    }

    async fn get_json<T>(&self, path: &str) -> HttpResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send(path, self.request(Method::GET, path)).await?;
        response
            .json::<T>()
            .await
            .map_err(|source| HttpDaoError::DecodeResponse {
                path: path.to_string(),
                source,
            })
    }

    async fn write_json<B>(&self, method: Method, path: &str, body: &B) -> HttpResult<()>
    where
        B: ?Sized + Serialize,
    {
        self.send(path, self.request(method, path).json(body))
            .await
            .map(|_| ())
    }

    async fn resolve(&self, id: Uuid) -> BackendResult<QuizOrSlot> {
        match self.get_json::<SlotEntity>(&format!("slots/{id}")).await {
            Ok(slot) => return Ok(QuizOrSlot::Slot(slot)),
            Err(HttpDaoError::Refused { status, .. }) if status == StatusCode::NOT_FOUND => {
                debug!(%id, "no slot row; falling back to legacy quiz");
            }
            Err(err) => return Err(err.into()),
        }

        self.get_json::<QuizEntity>(&format!("quizzes/{id}"))
            .await
            .map(QuizOrSlot::Legacy)
            .map_err(Into::into)
    }
}

impl QuizBackend for HttpQuizBackend {
    fn fetch_quiz_or_slot(&self, id: Uuid) -> BoxFuture<'static, BackendResult<QuizOrSlot>> {
        let backend = self.clone();
        Box::pin(async move { backend.resolve(id).await })
    }

    fn fetch_questions(&self, quiz_id: Uuid) -> BoxFuture<'static, BackendResult<Vec<QuestionEntity>>> {
        let backend = self.clone();
        Box::pin(async move {
            backend
                .get_json(&format!("quizzes/{quiz_id}/questions"))
                .await
                .map_err(Into::into)
        })
    }

    fn join(&self, target: JoinTarget) -> BoxFuture<'static, BackendResult<()>> {
        let backend = self.clone();
        Box::pin(async move {
            backend
                .write_json(Method::POST, "participations/join", &target)
                .await
                .map_err(Into::into)
        })
    }

    fn pre_join(&self, target: JoinTarget) -> BoxFuture<'static, BackendResult<()>> {
        let backend = self.clone();
        Box::pin(async move {
            backend
                .write_json(Method::POST, "participations/pre-join", &target)
                .await
                .map_err(Into::into)
        })
    }

    fn upsert_answer(&self, answer: AnswerEntity) -> BoxFuture<'static, BackendResult<()>> {
        let backend = self.clone();
        Box::pin(async move {
            backend
                .write_json(Method::PUT, "answers", &answer)
                .await
                .map_err(Into::into)
        })
    }

    fn submit_participation(&self, user_id: Uuid, quiz_id: Uuid) -> BoxFuture<'static, BackendResult<()>> {
        let backend = self.clone();
        Box::pin(async move {
            backend
                .write_json(
                    Method::POST,
                    "participations/complete",
                    &CompletionRequest { user_id, quiz_id },
                )
                .await
                .map_err(Into::into)
        })
    }

    fn fetch_engagement(&self, key: Uuid) -> BoxFuture<'static, BackendResult<EngagementEntity>> {
        let backend = self.clone();
        Box::pin(async move {
            backend
                .get_json(&format!("engagement/{key}"))
                .await
                .map_err(Into::into)
        })
    }

    fn subscribe_changes(&self, topic: FeedTopic) -> BoxFuture<'static, BackendResult<FeedChannel>> {
        let backend = self.clone();
        Box::pin(async move {
            const PATH: &str = "changes";
            let builder = backend
                .request(Method::GET, PATH)
                .query(&[("table", topic.table.as_str()), ("filter", topic.filter.as_str())]);
            let response = backend.send(PATH, builder).await?;

            let (tx, rx) = mpsc::channel(FEED_BUFFER);
            let forwarder = tokio::spawn(async move {
                let events = channel_events(response);
                pin_mut!(events);
                while let Some(event) = events.next().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });

            Ok(FeedChannel::new(rx, async move {
                forwarder.abort();
            }))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, BackendResult<()>> {
        let backend = self.clone();
        Box::pin(async move {
            backend
                .send("health", backend.request(Method::GET, "health"))
                .await
                .map(|_| ())
                .map_err(Into::into)
        })
    }
}

/// Decode a `text/event-stream` body into channel events.
///
/// An accepted stream counts as joined; `change` frames carry a JSON
/// [`ChangeEvent`], `error` frames end the channel.
fn channel_events(response: Response) -> impl Stream<Item = ChannelEvent> {
    stream! {
        yield ChannelEvent::Joined;

        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        let mut name: Option<String> = None;
        let mut data = String::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield ChannelEvent::Error(err.to_string());
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(end) = buffer.find('\n') {
                let line: String = buffer.drain(..=end).collect();
                let line = line.trim_end_matches(['\r', '\n']);

                if line.is_empty() {
                    if let Some(event) = decode_frame(name.take(), std::mem::take(&mut data)) {
                        let fatal = matches!(event, ChannelEvent::Error(_));
                        yield event;
                        if fatal {
                            return;
                        }
                    }
                } else if let Some(rest) = line.strip_prefix("event:") {
                    name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(rest.trim_start());
                }
            }
        }

        yield ChannelEvent::Closed;
    }
}

fn decode_frame(name: Option<String>, data: String) -> Option<ChannelEvent> {
    match name.as_deref() {
        Some("error") => Some(ChannelEvent::Error(data)),
        Some("change") | None if !data.is_empty() => match serde_json::from_str::<ChangeEvent>(&data) {
            Ok(change) => Some(ChannelEvent::Change(change)),
            Err(err) => {
                debug!(error = %err, "ignoring undecodable change frame");
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_change_and_error_frames() {
        let change = decode_frame(
            Some("change".into()),
            r#"{"table":"quiz_participants","kind":"INSERT"}"#.into(),
        );
        match change {
            Some(ChannelEvent::Change(event)) => {
                assert_eq!(event.table, "quiz_participants");
                assert_eq!(event.kind, "INSERT");
            }
            other => panic!("expected change event, got {other:?}"),
        }

        assert_eq!(
            decode_frame(Some("error".into()), "channel closed".into()),
            Some(ChannelEvent::Error("channel closed".into()))
        );
        assert_eq!(decode_frame(Some("ping".into()), String::new()), None);
        assert_eq!(decode_frame(None, "not json".into()), None);
    }

    #[test]
    fn refused_requests_map_to_backend_categories() {
        let not_found = HttpDaoError::Refused {
            path: "slots/x".into(),
            status: StatusCode::NOT_FOUND,
            reason: "slot missing".into(),
        };
        assert!(matches!(
            BackendError::from(not_found),
            BackendError::NotFound(_)
        ));

        let not_active = HttpDaoError::Refused {
            path: "participations/join".into(),
            status: StatusCode::CONFLICT,
            reason: "NOT_ACTIVE".into(),
        };
        assert!(matches!(
            BackendError::from(not_active),
            BackendError::NotActive(_)
        ));

        let outage = HttpDaoError::Refused {
            path: "answers".into(),
            status: StatusCode::BAD_GATEWAY,
            reason: String::new(),
        };
        assert!(BackendError::from(outage).is_transient());
    }
}
