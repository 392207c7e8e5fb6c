use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value, json};

use super::{
    MessageDraft, Normalizer, NormalizerConfig, ThreadingStrategy, direction_from_business,
    invalid_payload, parse_timestamp_str,
};
use crate::domain::{
    error::IngestionError,
    models::{
        Attachment, AttachmentKind, Channel, ContactType, Direction, NormalizedContact,
        NormalizedMessage, RawProviderMessage,
    },
};

const PROVIDER_TYPE: &str = "twilio";
const MAX_MEDIA_ITEMS: usize = 10;

/// Twilio messaging webhook, form fields decoded into a JSON object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TwilioPayload {
    pub message_sid: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub date_sent: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sms_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub num_media: Option<usize>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub num_segments: Option<usize>,
    /// `MediaUrl{N}`, `MediaContentType{N}` and any field Twilio adds later.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TwilioPayload {
    fn media_field(&self, name: &str, index: usize) -> Option<&str> {
        self.extra
            .get(&format!("{name}{index}"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn attachments(&self) -> Vec<Attachment> {
        let count = self.num_media.unwrap_or(MAX_MEDIA_ITEMS).min(MAX_MEDIA_ITEMS);
        (0..count)
            .filter_map(|index| {
                let url = self.media_field("MediaUrl", index)?;
                let mime_type = self.media_field("MediaContentType", index);
                Some(Attachment {
                    kind: mime_type.map_or(AttachmentKind::File, AttachmentKind::from_mime),
                    filename: None,
                    size: None,
                    mime_type: mime_type.map(str::to_owned),
                    url: url.to_owned(),
                    metadata: json!({ "index": index }),
                })
            })
            .collect()
    }

    fn direction_hint(&self) -> Option<Direction> {
        let direction = self.direction.as_deref()?.trim().to_ascii_lowercase();
        if direction.starts_with("outbound") {
            Some(Direction::Outbound)
        } else if direction == "inbound" {
            Some(Direction::Inbound)
        } else {
            None
        }
    }
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_u64().and_then(|n| usize::try_from(n).ok()),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

pub struct TwilioNormalizer {
    config: NormalizerConfig,
}

impl TwilioNormalizer {
    #[must_use]
    pub fn new(business_identifier: Option<String>) -> Self {
        Self {
            config: NormalizerConfig {
                channel: Channel::Sms,
                provider_type: PROVIDER_TYPE.to_owned(),
                identity_mode: ContactType::Phone,
                threading: ThreadingStrategy::PhonePair,
                duplicate_window_minutes: 5,
                supported_content_types: [
                    "text/plain",
                    "image/*",
                    "audio/*",
                    "video/*",
                    "application/pdf",
                    "text/vcard",
                    "text/x-vcard",
                ]
                .into_iter()
                .map(str::to_owned)
                .collect(),
                business_identifier,
            },
        }
    }

    fn detect_direction(
        &self,
        payload: &TwilioPayload,
        from: &NormalizedContact,
        to: &NormalizedContact,
    ) -> Direction {
        if let Some(business) = self.config.business_identifier.as_deref()
            && let Some(direction) = direction_from_business(business, from, to)
        {
            return direction;
        }
        if let Some(direction) = payload.direction_hint() {
            return direction;
        }
        // Last resort: a shorter number is assumed to be the business short code.
        if from.normalized_value.len() < to.normalized_value.len() {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

impl Normalizer for TwilioNormalizer {
    fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    fn normalize(&self, raw: &RawProviderMessage) -> Result<NormalizedMessage, IngestionError> {
        let payload: TwilioPayload = serde_json::from_value(raw.payload.clone())
            .map_err(|error| invalid_payload(raw, format!("invalid twilio payload: {error}")))?;

        let from = self.config.contact(&payload.from, false);
        let to = self.config.contact(&payload.to, false);
        if from.normalized_value.is_empty() || to.normalized_value.is_empty() {
            return Err(invalid_payload(raw, "From and To must contain phone digits"));
        }

        let direction = self.detect_direction(&payload, &from, &to);
        let timestamp = payload
            .date_sent
            .as_deref()
            .and_then(parse_timestamp_str)
            .unwrap_or(raw.timestamp);
        let attachments = payload.attachments();
        let body = payload
            .body
            .as_deref()
            .filter(|body| !body.is_empty())
            .map(str::to_owned);
        let content_type = match (&body, attachments.first()) {
            (None, Some(first)) => first
                .mime_type
                .clone()
                .unwrap_or_else(|| "text/plain".to_owned()),
            _ => "text/plain".to_owned(),
        };

        let mut provider_meta = Map::new();
        for (key, value) in [
            ("accountSid", payload.account_sid.clone()),
            ("status", payload.status.clone().or(payload.sms_status.clone())),
            ("direction", payload.direction.clone()),
        ] {
            if let Some(value) = value {
                provider_meta.insert(key.to_owned(), Value::String(value));
            }
        }
        if let Some(segments) = payload.num_segments {
            provider_meta.insert("numSegments".to_owned(), json!(segments));
        }
        provider_meta.insert("numMedia".to_owned(), json!(attachments.len()));

        let (business, customer) = match direction {
            Direction::Inbound => (&to, &from),
            Direction::Outbound => (&from, &to),
        };
        let thread_key =
            self.config
                .thread_key(&business.normalized_value, &customer.normalized_value, None);

        MessageDraft {
            direction,
            from,
            to,
            timestamp,
            body,
            content_type,
            thread_key: Some(thread_key),
            provider_meta: Value::Object(provider_meta),
            attachments,
        }
        .seal(&self.config, raw)
    }
}
