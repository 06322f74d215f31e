/// Message history source: the fetch side of the stream
use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::message_types::{Message, WireMessage};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

/// Why a page is being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadPurpose {
    /// Phase 1: the most recent page, shown as fast as possible
    Initial,
    /// Phase 2: a larger page behind the first one, loaded in the background
    Backfill,
    /// User-triggered pagination towards older history
    Older,
}

/// One cancellable unit of fetch work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub conversation_id: i64,
    /// 0 = newest messages; otherwise fetch strictly older than this id
    pub cursor_message_id: i64,
    pub limit: usize,
    pub purpose: LoadPurpose,
}

impl LoadRequest {
    pub fn initial(conversation_id: i64, limit: usize) -> Self {
        Self {
            conversation_id,
            cursor_message_id: 0,
            limit,
            purpose: LoadPurpose::Initial,
        }
    }

    pub fn older_than(conversation_id: i64, cursor: i64, limit: usize, purpose: LoadPurpose) -> Self {
        Self {
            conversation_id,
            cursor_message_id: cursor,
            limit,
            purpose,
        }
    }

    /// The first page skips media downloads so it renders quickly
    pub fn include_media(&self) -> bool {
        self.purpose != LoadPurpose::Initial
    }
}

/// Anything that can return a page of a conversation's history.
///
/// Returned order is not relied upon; callers re-sort.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_messages(&self, request: &LoadRequest) -> Result<Vec<Message>>;
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// REST source backed by `GET /api/chats/{chat_id}/messages`
#[derive(Clone)]
pub struct HttpMessageSource {
    client: reqwest::Client,
    base_url: String,
    session_id: Option<i64>,
}

impl HttpMessageSource {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            session_id: config.session_id,
        })
    }

    fn messages_url(&self, conversation_id: i64) -> String {
        format!("{}/api/chats/{}/messages", self.base_url, conversation_id)
    }

    fn query(&self, request: &LoadRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("limit", request.limit.to_string()),
            ("offset_id", request.cursor_message_id.to_string()),
            ("download_media", request.include_media().to_string()),
        ];
        if let Some(session_id) = self.session_id {
            query.push(("session_id", session_id.to_string()));
        }
        query
    }
}

#[async_trait]
impl MessageSource for HttpMessageSource {
    async fn fetch_messages(&self, request: &LoadRequest) -> Result<Vec<Message>> {
        debug!(
            "Fetching {:?} page for {} (cursor {}, limit {})",
            request.purpose, request.conversation_id, request.cursor_message_id, request.limit
        );

        let response = self
            .client
            .get(self.messages_url(request.conversation_id))
            .query(&self.query(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StreamError::Timeout(format!("history fetch for {}", request.conversation_id))
                } else {
                    StreamError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| match b.detail {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or(body);
            return Err(StreamError::Status(status.as_u16(), detail));
        }

        let wire: Vec<WireMessage> = response.json().await?;
        let mut messages = Vec::with_capacity(wire.len());
        for item in wire {
            let id = item.id;
            match Message::try_from(item) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Dropping message {} from history page: {}", id, e),
            }
        }
        Ok(messages)
    }
}
