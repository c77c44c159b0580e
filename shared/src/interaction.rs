use serde::{Deserialize, Deserializer, Serialize};

use crate::types::PendingKey;

// pool api

/// `GET <api_url>` success body
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BlockResponse {
    #[serde(default)]
    pub checkwork_addresses: Vec<String>,
    #[serde(default)]
    pub range: RangeData,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RangeData {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

/// error body, e.g. on `409 Conflict`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error: String,
}

/// `POST <api_url>/submit`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitBatch {
    #[serde(rename = "privateKeys")]
    pub private_keys: Vec<PendingKey>,
}

// telegram bot api

#[derive(Serialize, Debug, Clone)]
pub struct SendMessage<'a> {
    pub chat_id: &'a str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<&'a str>,
    pub disable_web_page_preview: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct EditMessage<'a> {
    pub chat_id: &'a str,
    pub message_id: i64,
    pub text: &'a str,
    pub parse_mode: &'a str,
    pub disable_web_page_preview: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TelegramResponse<T> {
    #[serde(default)]
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MessageResult {
    pub message_id: i64,
}

/// Accepts a JSON string or number, Telegram chat ids show up as both.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>, {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(text)) => text,
        Some(Raw::Int(n)) => n.to_string(),
        None => String::new(),
    })
}
