use std::{collections::HashSet, fs, time::Duration};

use chrono::Duration as ChronoDuration;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub bearer_token: String,
    /// Identifier of the authenticated user, used to tell own messages from
    /// counterpart messages.
    pub user_id: i64,
    pub locale: String,
    pub page_size: u32,
    pub reconnect_backoff_floor_ms: u64,
    pub reconnect_backoff_ceiling_ms: u64,
    pub send_queue_capacity: usize,
    pub send_queue_ttl_ms: u64,
    pub merge_tolerance_ms: i64,
    pub max_attachment_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            bearer_token: String::new(),
            user_id: 0,
            locale: "en".into(),
            page_size: 30,
            reconnect_backoff_floor_ms: 500,
            reconnect_backoff_ceiling_ms: 30_000,
            send_queue_capacity: 32,
            send_queue_ttl_ms: 10_000,
            merge_tolerance_ms: 5_000,
            max_attachment_bytes: 10 * 1024 * 1024,
            allowed_mime_types: vec![
                "image/png".into(),
                "image/jpeg".into(),
                "image/gif".into(),
                "image/webp".into(),
                "audio/ogg".into(),
                "audio/mpeg".into(),
                "audio/webm".into(),
                "application/pdf".into(),
            ],
        }
    }
}

impl Settings {
    pub fn reconnect_backoff_floor(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_floor_ms)
    }

    pub fn reconnect_backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ceiling_ms)
    }

    pub fn send_queue_ttl(&self) -> Duration {
        Duration::from_millis(self.send_queue_ttl_ms)
    }

    pub fn merge_tolerance(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.merge_tolerance_ms)
    }

    pub fn allowed_mime_set(&self) -> HashSet<String> {
        self.allowed_mime_types.iter().cloned().collect()
    }
}

/// Optional overrides read from `client.toml`. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    server_url: Option<String>,
    bearer_token: Option<String>,
    user_id: Option<i64>,
    locale: Option<String>,
    page_size: Option<u32>,
    reconnect_backoff_floor_ms: Option<u64>,
    reconnect_backoff_ceiling_ms: Option<u64>,
    send_queue_capacity: Option<usize>,
    send_queue_ttl_ms: Option<u64>,
    merge_tolerance_ms: Option<i64>,
    max_attachment_bytes: Option<u64>,
    allowed_mime_types: Option<Vec<String>>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileOverrides>(&raw) {
            apply_file_overrides(&mut settings, file_cfg);
        }
    }

    if let Ok(v) = std::env::var("CHAT__SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT__BEARER_TOKEN") {
        settings.bearer_token = v;
    }
    if let Ok(v) = std::env::var("CHAT__USER_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.user_id = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT__LOCALE") {
        settings.locale = v;
    }
    if let Ok(v) = std::env::var("CHAT__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT__MAX_ATTACHMENT_BYTES") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.max_attachment_bytes = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT__MERGE_TOLERANCE_MS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.merge_tolerance_ms = parsed;
        }
    }

    settings
}

fn apply_file_overrides(settings: &mut Settings, file_cfg: FileOverrides) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.bearer_token {
        settings.bearer_token = v;
    }
    if let Some(v) = file_cfg.user_id {
        settings.user_id = v;
    }
    if let Some(v) = file_cfg.locale {
        settings.locale = v;
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.reconnect_backoff_floor_ms {
        settings.reconnect_backoff_floor_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_backoff_ceiling_ms {
        settings.reconnect_backoff_ceiling_ms = v;
    }
    if let Some(v) = file_cfg.send_queue_capacity {
        settings.send_queue_capacity = v;
    }
    if let Some(v) = file_cfg.send_queue_ttl_ms {
        settings.send_queue_ttl_ms = v;
    }
    if let Some(v) = file_cfg.merge_tolerance_ms {
        settings.merge_tolerance_ms = v;
    }
    if let Some(v) = file_cfg.max_attachment_bytes {
        settings.max_attachment_bytes = v;
    }
    if let Some(v) = file_cfg.allowed_mime_types {
        settings.allowed_mime_types = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.max_attachment_bytes, 10 * 1024 * 1024);
        assert!(settings.reconnect_backoff_floor() < settings.reconnect_backoff_ceiling());
        assert!(settings.allowed_mime_set().contains("image/png"));
    }

    #[test]
    fn file_overrides_only_replace_present_fields() {
        let mut settings = Settings::default();
        let overrides: FileOverrides =
            toml::from_str("server_url = \"https://chat.example\"\npage_size = 50\n")
                .expect("parse");
        apply_file_overrides(&mut settings, overrides);
        assert_eq!(settings.server_url, "https://chat.example");
        assert_eq!(settings.page_size, 50);
        assert_eq!(settings.locale, "en");
    }
}
