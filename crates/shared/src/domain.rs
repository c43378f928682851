use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ListingId);
id_newtype!(TicketId);

/// Attachment kind, derived from the path extension. Attachments are opaque
/// bytes transferred out of band; messages only carry path references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    File,
}

impl AttachmentKind {
    pub fn from_path(path: &str) -> Self {
        let extension = path
            .rsplit('.')
            .next()
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" => AttachmentKind::Image,
            "mp3" | "ogg" | "wav" | "m4a" | "webm" => AttachmentKind::Audio,
            _ => AttachmentKind::File,
        }
    }
}

/// A path reference to an uploaded attachment, owned by exactly one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub path: String,
    pub kind: AttachmentKind,
}

impl AttachmentRef {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let kind = AttachmentKind::from_path(&path);
        Self { path, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_kind_from_extension() {
        assert_eq!(AttachmentKind::from_path("u/1/photo.JPG"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_path("u/1/note.ogg"), AttachmentKind::Audio);
        assert_eq!(AttachmentKind::from_path("u/1/contract.pdf"), AttachmentKind::File);
        assert_eq!(AttachmentKind::from_path("no-extension"), AttachmentKind::File);
    }
}
