use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Serialize;
use shared::{
    domain::{ConversationId, ListingId},
    protocol::{ConversationSummary, MessagePayload},
};
use thiserror::Error;

/// Declared sort for a history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    fn as_query(self) -> &'static str {
        match self {
            SortOrder::NewestFirst => "desc",
            SortOrder::OldestFirst => "asc",
        }
    }
}

/// A history or directory page failed as a whole. Carries enough context to
/// retry the same page; no partial pages are ever surfaced.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("failed to fetch messages for conversation {conversation_id:?} page {page}: {reason}")]
    Messages {
        conversation_id: ConversationId,
        page: u32,
        reason: String,
    },
    #[error("failed to fetch conversation directory page {page}: {reason}")]
    Directory { page: u32, reason: String },
}

/// Paginated access to a conversation's past messages, used by the
/// synchronizer. Split out as a trait so reconciliation paths can be driven
/// by a scripted history in tests.
#[async_trait]
pub trait MessageHistory: Send + Sync {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        sort: SortOrder,
        search: Option<&str>,
    ) -> Result<Vec<MessagePayload>, FetchError>;
}

#[derive(Debug, Serialize)]
struct MessagesQuery<'a> {
    limit: u32,
    page: u32,
    sort: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    search: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DirectoryQuery {
    limit: u32,
    page: u32,
}

#[derive(Debug, Serialize)]
struct OpenConversationRequest {
    #[serde(rename = "listingId")]
    listing_id: ListingId,
}

/// Stateless request/response retrieval over the REST surface. All calls
/// carry the bearer credential and locale headers; each call is idempotent
/// and side-effect-free except `open_conversation`.
pub struct HistoryFetcher {
    http: Client,
    base_url: String,
    page_size: u32,
}

/// Builds a client carrying the bearer credential and locale headers on
/// every request.
pub(crate) fn authenticated_client(settings: &crate::config::Settings) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    let bearer = format!("Bearer {}", settings.bearer_token);
    headers.insert(
        header::AUTHORIZATION,
        header::HeaderValue::from_str(&bearer).context("bearer token is not a valid header")?,
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        header::HeaderValue::from_str(&settings.locale).context("locale is not a valid header")?,
    );
    Client::builder()
        .default_headers(headers)
        .build()
        .context("failed to build http client")
}

impl HistoryFetcher {
    pub fn new(settings: &crate::config::Settings) -> Result<Self> {
        Ok(Self {
            http: authenticated_client(settings)?,
            base_url: settings.server_url.trim_end_matches('/').to_string(),
            page_size: settings.page_size,
        })
    }

    pub async fn fetch_conversations(
        &self,
        page: u32,
    ) -> Result<Vec<ConversationSummary>, FetchError> {
        let fail = |err: reqwest::Error| FetchError::Directory {
            page,
            reason: err.to_string(),
        };
        self.http
            .get(format!("{}/chats", self.base_url))
            .query(&DirectoryQuery {
                limit: self.page_size,
                page,
            })
            .send()
            .await
            .map_err(fail)?
            .error_for_status()
            .map_err(fail)?
            .json()
            .await
            .map_err(fail)
    }

    /// Opens (or returns) the conversation for a listing counterpart. The one
    /// non-idempotent call on this surface.
    pub async fn open_conversation(&self, listing_id: ListingId) -> Result<ConversationSummary> {
        let summary = self
            .http
            .post(format!("{}/chats/open", self.base_url))
            .json(&OpenConversationRequest { listing_id })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid open-conversation response for {listing_id:?}"))?;
        Ok(summary)
    }

    pub async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), reqwest::Error> {
        self.http
            .delete(format!("{}/chats/{}", self.base_url, conversation_id.0))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl MessageHistory for HistoryFetcher {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        sort: SortOrder,
        search: Option<&str>,
    ) -> Result<Vec<MessagePayload>, FetchError> {
        let fail = |err: reqwest::Error| FetchError::Messages {
            conversation_id,
            page,
            reason: err.to_string(),
        };
        self.http
            .get(format!("{}/messages/{}", self.base_url, conversation_id.0))
            .query(&MessagesQuery {
                limit: self.page_size,
                page,
                sort: sort.as_query(),
                search,
            })
            .send()
            .await
            .map_err(fail)?
            .error_for_status()
            .map_err(fail)?
            .json()
            .await
            .map_err(fail)
    }
}
