use std::collections::HashSet;

use anyhow::{Context, Result};
use reqwest::{multipart, Client};
use serde::Deserialize;
use shared::domain::{AttachmentRef, ConversationId, TicketId};
use thiserror::Error;
use tracing::info;

use crate::{config::Settings, history::authenticated_client};

/// Where an upload is attached. The transfer endpoint is shared between
/// conversations and support tickets; only the path context differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadScope {
    Chat(ConversationId),
    Ticket(TicketId),
}

impl UploadScope {
    fn context(self) -> &'static str {
        match self {
            UploadScope::Chat(_) => "chats",
            UploadScope::Ticket(_) => "tickets",
        }
    }

    fn id(self) -> i64 {
        match self {
            UploadScope::Chat(id) => id.0,
            UploadScope::Ticket(id) => id.0,
        }
    }
}

/// Rejected at the boundary, before any network call. Fatal for this
/// attachment only, never for the whole send.
#[derive(Debug, Clone, Error)]
pub enum InvalidAttachment {
    #[error("{filename} is {actual} bytes, over the {limit}-byte limit")]
    TooLarge {
        filename: String,
        actual: u64,
        limit: u64,
    },
    #[error("{filename} has disallowed type {mime}")]
    UnsupportedType { filename: String, mime: String },
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error(transparent)]
    InvalidAttachment(#[from] InvalidAttachment),
    /// Network or server failure during the transfer. Retryable; the caller
    /// decides whether the message send waits on it.
    #[error("upload of {filename} failed: {reason}")]
    UploadFailed { filename: String, reason: String },
}

/// A binary payload to transfer out of band. Messages reference the returned
/// path; they never embed bytes.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    path: String,
}

/// Uploads attachment payloads over HTTP, independent of the live channel
/// and of message send order.
pub struct AttachmentUploader {
    http: Client,
    base_url: String,
    max_bytes: u64,
    allowed_mime: HashSet<String>,
}

impl AttachmentUploader {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            http: authenticated_client(settings)?,
            base_url: settings.server_url.trim_end_matches('/').to_string(),
            max_bytes: settings.max_attachment_bytes,
            allowed_mime: settings.allowed_mime_set(),
        })
    }

    fn validate(&self, upload: &AttachmentUpload) -> Result<(), InvalidAttachment> {
        let actual = upload.bytes.len() as u64;
        if actual > self.max_bytes {
            return Err(InvalidAttachment::TooLarge {
                filename: upload.filename.clone(),
                actual,
                limit: self.max_bytes,
            });
        }
        if !self.allowed_mime.contains(&upload.mime_type) {
            return Err(InvalidAttachment::UnsupportedType {
                filename: upload.filename.clone(),
                mime: upload.mime_type.clone(),
            });
        }
        Ok(())
    }

    /// Validates then transfers one payload, returning its stable path
    /// reference. Callers upload first and only then construct the message
    /// referencing the path.
    pub async fn upload(
        &self,
        scope: UploadScope,
        upload: AttachmentUpload,
    ) -> Result<AttachmentRef, AttachmentError> {
        self.validate(&upload)?;

        let filename = upload.filename.clone();
        let part = multipart::Part::bytes(upload.bytes)
            .file_name(upload.filename.clone())
            .mime_str(&upload.mime_type)
            .map_err(|_| InvalidAttachment::UnsupportedType {
                filename: filename.clone(),
                mime: upload.mime_type.clone(),
            })?;
        let form = multipart::Form::new()
            .text("id", scope.id().to_string())
            .part("file", part);

        let fail = |err: reqwest::Error| AttachmentError::UploadFailed {
            filename: filename.clone(),
            reason: err.to_string(),
        };
        let response: UploadResponse = self
            .http
            .post(format!(
                "{}/{}/attachments",
                self.base_url,
                scope.context()
            ))
            .multipart(form)
            .send()
            .await
            .map_err(fail)?
            .error_for_status()
            .map_err(fail)?
            .json()
            .await
            .map_err(fail)?;

        let reference = AttachmentRef::from_path(response.path);
        info!(path = %reference.path, "attachment uploaded");
        Ok(reference)
    }

    /// Fetches the bytes behind a previously uploaded path reference.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(format!("{}/{}", self.base_url, path.trim_start_matches('/')))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await
            .with_context(|| format!("failed to read attachment body for {path}"))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::AttachmentKind;

    fn uploader(max_bytes: u64) -> AttachmentUploader {
        let settings = Settings {
            // Unroutable on purpose: validation must reject before any
            // network call.
            server_url: "http://192.0.2.1:9".into(),
            max_attachment_bytes: max_bytes,
            ..Settings::default()
        };
        AttachmentUploader::new(&settings).expect("uploader")
    }

    fn upload_of(len: usize, mime: &str) -> AttachmentUpload {
        AttachmentUpload {
            filename: "photo.png".into(),
            mime_type: mime.into(),
            bytes: vec![0u8; len],
        }
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_before_any_network_call() {
        let uploader = uploader(10 * 1024 * 1024);
        let result = uploader
            .upload(
                UploadScope::Chat(ConversationId(1)),
                upload_of(12 * 1024 * 1024, "image/png"),
            )
            .await;
        match result {
            Err(AttachmentError::InvalidAttachment(InvalidAttachment::TooLarge {
                actual,
                limit,
                ..
            })) => {
                assert_eq!(actual, 12 * 1024 * 1024);
                assert_eq!(limit, 10 * 1024 * 1024);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disallowed_mime_type_is_rejected() {
        let uploader = uploader(1024);
        let result = uploader
            .upload(
                UploadScope::Chat(ConversationId(1)),
                upload_of(16, "application/x-msdownload"),
            )
            .await;
        assert!(matches!(
            result,
            Err(AttachmentError::InvalidAttachment(
                InvalidAttachment::UnsupportedType { .. }
            ))
        ));
    }

    #[test]
    fn scope_maps_to_path_context() {
        assert_eq!(UploadScope::Chat(ConversationId(4)).context(), "chats");
        assert_eq!(UploadScope::Ticket(TicketId(9)).context(), "tickets");
        assert_eq!(UploadScope::Ticket(TicketId(9)).id(), 9);
    }

    #[test]
    fn uploaded_path_infers_kind() {
        let reference = AttachmentRef::from_path("uploads/3/voice.ogg");
        assert_eq!(reference.kind, AttachmentKind::Audio);
    }
}
