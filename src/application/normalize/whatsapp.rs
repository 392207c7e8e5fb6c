use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{
    MessageDraft, Normalizer, NormalizerConfig, ThreadingStrategy, direction_from_business,
    invalid_payload, parse_timestamp, timestamp_value,
};
use crate::domain::{
    error::{IngestionError, IngestionErrorCode},
    models::{
        Attachment, AttachmentKind, Channel, ContactType, Direction, NormalizedContact,
        NormalizedMessage, RawProviderMessage,
    },
};

const PROVIDER_TYPE: &str = "whatsapp";

/// WhatsApp Cloud API webhook notification.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppPayload {
    #[serde(default)]
    pub object: Option<String>,
    pub entry: Vec<WhatsAppEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppChange {
    pub value: WhatsAppValue,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppValue {
    pub messaging_product: String,
    pub metadata: WhatsAppMetadata,
    #[serde(default)]
    pub contacts: Vec<WhatsAppProfile>,
    #[serde(default)]
    pub messages: Vec<WhatsAppMessage>,
    #[serde(default)]
    pub statuses: Vec<WhatsAppStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppMetadata {
    pub display_phone_number: String,
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppProfile {
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<WhatsAppProfileName>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppProfileName {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppMessage {
    pub id: String,
    pub from: String,
    /// Present on echoes of messages the business sent.
    #[serde(default)]
    pub to: Option<String>,
    pub timestamp: Value,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<WhatsAppText>,
    #[serde(default)]
    pub image: Option<WhatsAppMedia>,
    #[serde(default)]
    pub audio: Option<WhatsAppMedia>,
    #[serde(default)]
    pub video: Option<WhatsAppMedia>,
    #[serde(default)]
    pub document: Option<WhatsAppMedia>,
    #[serde(default)]
    pub location: Option<WhatsAppLocation>,
    #[serde(default)]
    pub button: Option<WhatsAppButton>,
    #[serde(default)]
    pub interactive: Option<Value>,
    #[serde(default)]
    pub context: Option<WhatsAppContext>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppText {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppMedia {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppButton {
    pub text: String,
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppContext {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppStatus {
    pub id: String,
    pub recipient_id: String,
    pub status: String,
    pub timestamp: Value,
}

impl WhatsAppPayload {
    fn values(&self) -> impl Iterator<Item = &WhatsAppValue> {
        self.entry
            .iter()
            .flat_map(|entry| entry.changes.iter().map(|change| &change.value))
    }

    /// Id of the first message, or of the first status update when the
    /// notification carries no messages.
    #[must_use]
    pub fn first_event_id(&self) -> Option<String> {
        self.values()
            .find_map(|value| value.messages.first().map(|message| message.id.clone()))
            .or_else(|| {
                self.values()
                    .find_map(|value| value.statuses.first().map(|status| status.id.clone()))
            })
    }

    /// Timestamp of the event [`Self::first_event_id`] names.
    #[must_use]
    pub fn first_event_time(&self) -> Option<DateTime<Utc>> {
        self.values()
            .find_map(|value| value.messages.first().map(|message| &message.timestamp))
            .or_else(|| {
                self.values()
                    .find_map(|value| value.statuses.first().map(|status| &status.timestamp))
            })
            .and_then(timestamp_value)
    }

    fn find_event(&self, provider_message_id: &str) -> Option<WhatsAppEvent<'_>> {
        let by_id = self.values().find_map(|value| {
            value
                .messages
                .iter()
                .find(|message| message.id == provider_message_id)
                .map(|message| WhatsAppEvent::Message(value, message))
                .or_else(|| {
                    value
                        .statuses
                        .iter()
                        .find(|status| status.id == provider_message_id)
                        .map(|status| WhatsAppEvent::Status(value, status))
                })
        });

        by_id
            .or_else(|| {
                self.values().find_map(|value| {
                    value
                        .messages
                        .first()
                        .map(|message| WhatsAppEvent::Message(value, message))
                })
            })
            .or_else(|| {
                self.values().find_map(|value| {
                    value
                        .statuses
                        .first()
                        .map(|status| WhatsAppEvent::Status(value, status))
                })
            })
    }
}

enum WhatsAppEvent<'a> {
    /// Customer message, or an echo of one the business sent.
    Message(&'a WhatsAppValue, &'a WhatsAppMessage),
    /// Delivery status of a business-originated message.
    Status(&'a WhatsAppValue, &'a WhatsAppStatus),
}

struct MessageContent {
    body: Option<String>,
    content_type: String,
    attachments: Vec<Attachment>,
}

pub struct WhatsAppNormalizer {
    config: NormalizerConfig,
}

impl WhatsAppNormalizer {
    #[must_use]
    pub fn new(business_identifier: Option<String>) -> Self {
        Self {
            config: NormalizerConfig {
                channel: Channel::Whatsapp,
                provider_type: PROVIDER_TYPE.to_owned(),
                identity_mode: ContactType::Phone,
                threading: ThreadingStrategy::ContextThread,
                duplicate_window_minutes: 3,
                supported_content_types: [
                    "text/plain",
                    "image/*",
                    "audio/*",
                    "video/*",
                    "application/*",
                    "text/*",
                ]
                .into_iter()
                .map(str::to_owned)
                .collect(),
                business_identifier,
            },
        }
    }

    /// Recipient of a business echo: the explicit `to`, then the replied-to
    /// sender, then the first listed contact that is not the business.
    fn echo_recipient(
        &self,
        value: &WhatsAppValue,
        message: &WhatsAppMessage,
        business: &NormalizedContact,
    ) -> Option<NormalizedContact> {
        let context_from = message.context.as_ref().and_then(|context| context.from.as_deref());
        message
            .to
            .as_deref()
            .into_iter()
            .chain(context_from)
            .chain(value.contacts.iter().map(|profile| profile.wa_id.as_str()))
            .map(|candidate| self.config.contact(candidate, true))
            .find(|contact| {
                !contact.normalized_value.is_empty()
                    && contact.normalized_value != business.normalized_value
            })
    }

    fn extract_content(
        &self,
        raw: &RawProviderMessage,
        message: &WhatsAppMessage,
    ) -> Result<MessageContent, IngestionError> {
        let missing = |kind: &str| invalid_payload(raw, format!("{kind} message has no {kind} object"));

        let content = match message.kind.as_str() {
            "text" => {
                let text = message.text.as_ref().ok_or_else(|| missing("text"))?;
                MessageContent {
                    body: Some(text.body.clone()),
                    content_type: "text/plain".to_owned(),
                    attachments: Vec::new(),
                }
            }
            "image" | "video" | "document" | "audio" => {
                let (media, kind, default_mime) = match message.kind.as_str() {
                    "image" => (&message.image, AttachmentKind::Image, "image/jpeg"),
                    "video" => (&message.video, AttachmentKind::Video, "video/mp4"),
                    "audio" => (&message.audio, AttachmentKind::Audio, "audio/ogg"),
                    _ => (&message.document, AttachmentKind::Document, "application/pdf"),
                };
                let media = media.as_ref().ok_or_else(|| missing(message.kind.as_str()))?;
                let url = media
                    .link
                    .clone()
                    .or_else(|| media.id.as_ref().map(|id| format!("whatsapp://media/{id}")))
                    .ok_or_else(|| invalid_payload(raw, "media object has neither id nor link"))?;
                let mime_type = media
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| default_mime.to_owned());
                // audio notes never carry a caption
                let body = if kind == AttachmentKind::Audio {
                    None
                } else {
                    media.caption.clone().filter(|caption| !caption.is_empty())
                };

                MessageContent {
                    body,
                    content_type: mime_type.clone(),
                    attachments: vec![Attachment {
                        kind,
                        filename: media.filename.clone(),
                        size: None,
                        mime_type: Some(mime_type),
                        url,
                        metadata: json!({ "mediaId": media.id, "sha256": media.sha256 }),
                    }],
                }
            }
            "location" => {
                let location = message.location.as_ref().ok_or_else(|| missing("location"))?;
                let label = location
                    .name
                    .as_deref()
                    .or(location.address.as_deref())
                    .unwrap_or("Shared location");
                MessageContent {
                    body: Some(format!(
                        "Location: {label} ({}, {})",
                        location.latitude, location.longitude
                    )),
                    content_type: "application/geo+json".to_owned(),
                    attachments: Vec::new(),
                }
            }
            "button" => {
                let button = message.button.as_ref().ok_or_else(|| missing("button"))?;
                MessageContent {
                    body: Some(button.text.clone()),
                    content_type: "text/plain".to_owned(),
                    attachments: Vec::new(),
                }
            }
            "interactive" => {
                let interactive = message
                    .interactive
                    .as_ref()
                    .ok_or_else(|| missing("interactive"))?;
                let title = ["button_reply", "list_reply"]
                    .iter()
                    .find_map(|reply| interactive.get(reply)?.get("title")?.as_str())
                    .ok_or_else(|| invalid_payload(raw, "interactive reply has no title"))?;
                MessageContent {
                    body: Some(title.to_owned()),
                    content_type: "text/plain".to_owned(),
                    attachments: Vec::new(),
                }
            }
            other => {
                return Err(invalid_payload(
                    raw,
                    format!("unsupported whatsapp message type: {other}"),
                ));
            }
        };
        Ok(content)
    }
}

impl Normalizer for WhatsAppNormalizer {
    fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    fn normalize(&self, raw: &RawProviderMessage) -> Result<NormalizedMessage, IngestionError> {
        let payload: WhatsAppPayload = serde_json::from_value(raw.payload.clone())
            .map_err(|error| invalid_payload(raw, format!("invalid whatsapp payload: {error}")))?;
        let event = payload
            .find_event(&raw.provider_message_id)
            .ok_or_else(|| invalid_payload(raw, "notification carries no messages or statuses"))?;

        match event {
            WhatsAppEvent::Message(value, message) => {
                let business = self.config.contact(&value.metadata.display_phone_number, true);
                let sender = self.config.contact(&message.from, true);
                let content = self.extract_content(raw, message)?;

                // Echoes of business-sent messages arrive with the business as sender.
                let echoed = sender.normalized_value == business.normalized_value
                    || self
                        .config
                        .business_identifier
                        .as_deref()
                        .and_then(|business_id| direction_from_business(business_id, &sender, &business))
                        == Some(Direction::Outbound);
                let (direction, from, to) = if echoed {
                    let recipient = self.echo_recipient(value, message, &sender).ok_or_else(|| {
                        IngestionError::new(
                            IngestionErrorCode::ValidationFailed,
                            "business echo names no recipient",
                            &raw.provider_id,
                        )
                        .with_message_id(&raw.provider_message_id)
                        .with_details(json!({ "field": "to", "reason": "no recipient other than the business" }))
                    })?;
                    (Direction::Outbound, sender, recipient)
                } else {
                    (Direction::Inbound, sender, business)
                };
                let (business_side, customer_side) = match direction {
                    Direction::Inbound => (&to, &from),
                    Direction::Outbound => (&from, &to),
                };

                let context_id = message.context.as_ref().and_then(|context| context.id.clone());
                let thread_key = self.config.thread_key(
                    &business_side.normalized_value,
                    &customer_side.normalized_value,
                    context_id.as_deref(),
                );
                let profile_name = value
                    .contacts
                    .iter()
                    .find(|profile| {
                        self.config.contact(&profile.wa_id, true).normalized_value
                            == customer_side.normalized_value
                    })
                    .and_then(|profile| profile.profile.as_ref()?.name.clone());

                let mut provider_meta = Map::new();
                provider_meta.insert("event".to_owned(), json!("message"));
                provider_meta.insert("messageType".to_owned(), json!(message.kind));
                provider_meta.insert(
                    "phoneNumberId".to_owned(),
                    json!(value.metadata.phone_number_id),
                );
                if let Some(name) = profile_name {
                    provider_meta.insert("profileName".to_owned(), json!(name));
                }
                if let Some(context_id) = context_id {
                    provider_meta.insert("contextId".to_owned(), json!(context_id));
                }

                MessageDraft {
                    direction,
                    from,
                    to,
                    timestamp: parse_timestamp(&message.timestamp),
                    body: content.body,
                    content_type: content.content_type,
                    thread_key: Some(thread_key),
                    provider_meta: Value::Object(provider_meta),
                    attachments: content.attachments,
                }
                .seal(&self.config, raw)
            }
            WhatsAppEvent::Status(value, status) => {
                let business = self.config.contact(&value.metadata.display_phone_number, true);
                let recipient = self.config.contact(&status.recipient_id, true);
                let thread_key = self.config.thread_key(
                    &business.normalized_value,
                    &recipient.normalized_value,
                    None,
                );

                MessageDraft {
                    direction: Direction::Outbound,
                    from: business,
                    to: recipient,
                    timestamp: parse_timestamp(&status.timestamp),
                    body: None,
                    content_type: "text/plain".to_owned(),
                    thread_key: Some(thread_key),
                    provider_meta: json!({
                        "event": "status",
                        "status": status.status,
                        "phoneNumberId": value.metadata.phone_number_id,
                    }),
                    attachments: Vec::new(),
                }
                .seal(&self.config, raw)
            }
        }
    }
}
