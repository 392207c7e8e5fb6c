//! Provider payload normalization.
//!
//! Every provider family converts its webhook body into a [`NormalizedMessage`]
//! through the [`Normalizer`] trait. Helpers shared by all families (contact
//! sanitizing, timestamp parsing, thread keys, the content fingerprint and the
//! final shape check) live here.

mod email;
mod registry;
mod sms;
mod whatsapp;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::domain::{
    error::{IngestionError, IngestionErrorCode},
    models::{
        Attachment, Channel, ContactType, Direction, NormalizedContact, NormalizedMessage,
        RawProviderMessage,
    },
};

pub use email::{GmailNormalizer, GmailPayload};
pub use registry::NormalizerRegistry;
pub use sms::{TwilioNormalizer, TwilioPayload};
pub use whatsapp::{WhatsAppNormalizer, WhatsAppPayload};

/// Unix values at or below this are seconds, above it milliseconds.
const MAX_UNIX_SECONDS: i64 = 9_999_999_999;

pub trait Normalizer: Send + Sync {
    fn config(&self) -> &NormalizerConfig;

    fn normalize(&self, raw: &RawProviderMessage) -> Result<NormalizedMessage, IngestionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingStrategy {
    /// Sorted pair of participant phone numbers.
    PhonePair,
    /// Business number, customer number and an optional reply context id.
    ContextThread,
    /// Provider-native thread id, falling back to the sorted address pair.
    ProviderThread,
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub channel: Channel,
    pub provider_type: String,
    pub identity_mode: ContactType,
    pub threading: ThreadingStrategy,
    pub duplicate_window_minutes: u32,
    pub supported_content_types: Vec<String>,
    pub business_identifier: Option<String>,
}

impl NormalizerConfig {
    /// Participant contact in this provider's identity space.
    #[must_use]
    pub fn contact(&self, raw: &str, verified: bool) -> NormalizedContact {
        make_contact(self.identity_mode, raw, verified, &self.provider_type)
    }

    /// Thread key under the configured [`ThreadingStrategy`]. `native_id` is a
    /// provider thread id or reply context id; blank ids are ignored.
    #[must_use]
    pub fn thread_key(&self, business: &str, customer: &str, native_id: Option<&str>) -> String {
        let native_id = native_id.map(str::trim).filter(|id| !id.is_empty());
        let channel = self.channel.as_str();
        match self.threading {
            ThreadingStrategy::PhonePair => sorted_pair_thread_key(self.channel, business, customer),
            ThreadingStrategy::ContextThread => match native_id {
                Some(id) => format!("{channel}:{business}:{customer}:{id}"),
                None => format!("{channel}:{business}:{customer}"),
            },
            ThreadingStrategy::ProviderThread => native_id.map_or_else(
                || sorted_pair_thread_key(self.channel, business, customer),
                |id| format!("{channel}:{id}"),
            ),
        }
    }

    #[must_use]
    pub fn supports_content_type(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        self.supported_content_types.iter().any(|supported| {
            let supported = supported.to_ascii_lowercase();
            match supported.strip_suffix("/*") {
                Some(family) => essence
                    .split_once('/')
                    .is_some_and(|(prefix, _)| prefix == family),
                None => supported == essence,
            }
        })
    }
}

/// Provider payloads, one variant per registered family.
#[derive(Debug, Clone)]
pub enum ProviderPayload {
    Twilio(TwilioPayload),
    WhatsApp(WhatsAppPayload),
    Gmail(GmailPayload),
}

impl ProviderPayload {
    /// Decodes `payload` into the variant owned by `provider_type`.
    pub fn parse(provider_type: &str, payload: &Value) -> Result<Self, String> {
        match provider_type.trim().to_ascii_lowercase().as_str() {
            "twilio" => serde_json::from_value(payload.clone())
                .map(Self::Twilio)
                .map_err(|error| format!("invalid twilio payload: {error}")),
            "whatsapp" => serde_json::from_value(payload.clone())
                .map(Self::WhatsApp)
                .map_err(|error| format!("invalid whatsapp payload: {error}")),
            "gmail" => serde_json::from_value(payload.clone())
                .map(Self::Gmail)
                .map_err(|error| format!("invalid gmail payload: {error}")),
            other => Err(format!("unsupported provider type: {other}")),
        }
    }

    /// Provider-assigned id of the delivered message.
    #[must_use]
    pub fn provider_message_id(&self) -> Option<String> {
        match self {
            Self::Twilio(payload) => Some(payload.message_sid.clone()),
            Self::WhatsApp(payload) => payload.first_event_id(),
            Self::Gmail(payload) => Some(payload.id.clone()),
        }
    }

    /// Time the provider says the event happened, when the payload carries one.
    #[must_use]
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Twilio(payload) => payload.date_sent.as_deref().and_then(parse_timestamp_str),
            Self::WhatsApp(payload) => payload.first_event_time(),
            Self::Gmail(payload) => payload.internal_date.as_ref().and_then(timestamp_value),
        }
    }
}

/// Message fields gathered by a normalizer before the fingerprint is computed.
#[derive(Debug, Clone)]
pub(crate) struct MessageDraft {
    pub direction: Direction,
    pub from: NormalizedContact,
    pub to: NormalizedContact,
    pub timestamp: DateTime<Utc>,
    pub body: Option<String>,
    pub content_type: String,
    pub thread_key: Option<String>,
    pub provider_meta: Value,
    pub attachments: Vec<Attachment>,
}

impl MessageDraft {
    /// Computes the content fingerprint and checks the assembled message.
    pub fn seal(
        self,
        config: &NormalizerConfig,
        raw: &RawProviderMessage,
    ) -> Result<NormalizedMessage, IngestionError> {
        let message_hash = message_hash(
            &raw.provider_message_id,
            self.body.as_deref(),
            &self.from.normalized_value,
            &self.to.normalized_value,
            self.timestamp,
        );
        let message = NormalizedMessage {
            provider_message_id: raw.provider_message_id.clone(),
            provider_id: raw.provider_id.clone(),
            channel: config.channel,
            direction: self.direction,
            from: self.from,
            to: self.to,
            timestamp: self.timestamp,
            body: self.body,
            content_type: self.content_type,
            thread_key: self.thread_key,
            provider_meta: self.provider_meta,
            attachments: self.attachments,
            message_hash,
        };

        validate_normalized(&message, config).map_err(|(field, reason)| {
            IngestionError::new(
                IngestionErrorCode::ValidationFailed,
                format!("normalized message failed validation: {field} {reason}"),
                &raw.provider_id,
            )
            .with_message_id(&raw.provider_message_id)
            .with_details(json!({ "field": field, "reason": reason }))
        })?;
        Ok(message)
    }
}

fn validate_normalized(
    message: &NormalizedMessage,
    config: &NormalizerConfig,
) -> Result<(), (&'static str, String)> {
    if message.provider_message_id.trim().is_empty() {
        return Err(("providerMessageId", "must not be empty".to_owned()));
    }
    if message.provider_id.trim().is_empty() {
        return Err(("providerId", "must not be empty".to_owned()));
    }
    if message.from.normalized_value.is_empty() {
        return Err(("from", "has no normalized value".to_owned()));
    }
    if message.to.normalized_value.is_empty() {
        return Err(("to", "has no normalized value".to_owned()));
    }
    if message.message_hash.len() != 64 {
        return Err(("messageHash", "must be a sha256 hex digest".to_owned()));
    }
    if !config.supports_content_type(&message.content_type) {
        return Err((
            "contentType",
            format!("{} is not supported", message.content_type),
        ));
    }
    if let Some(key) = &message.thread_key
        && key.trim().is_empty()
    {
        return Err(("threadKey", "must not be blank".to_owned()));
    }
    if message.attachments.iter().any(|item| item.url.trim().is_empty()) {
        return Err(("attachments", "every attachment needs a url".to_owned()));
    }
    Ok(())
}

pub(crate) fn invalid_payload(raw: &RawProviderMessage, message: impl Into<String>) -> IngestionError {
    IngestionError::new(IngestionErrorCode::InvalidPayload, message, &raw.provider_id)
        .with_message_id(&raw.provider_message_id)
}

/// Best-effort E.164 form of a phone number.
#[must_use]
pub fn sanitize_phone_number(raw: &str) -> String {
    let trimmed = raw.trim();
    // `whatsapp:+1555...` style addresses
    let trimmed = trimmed.rsplit_once(':').map_or(trimmed, |(_, number)| number).trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }

    if trimmed.starts_with('+') {
        format!("+{digits}")
    } else if digits.len() == 10 {
        format!("+1{digits}")
    } else {
        format!("+{digits}")
    }
}

#[must_use]
pub fn sanitize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[must_use]
pub fn sanitize_social_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

#[must_use]
pub fn sanitize_identifier(contact_type: ContactType, raw: &str) -> String {
    match contact_type {
        ContactType::Phone => sanitize_phone_number(raw),
        ContactType::Email => sanitize_email(raw),
        ContactType::Social => sanitize_social_handle(raw),
    }
}

#[must_use]
pub fn make_contact(
    contact_type: ContactType,
    raw: &str,
    verified: bool,
    provider: &str,
) -> NormalizedContact {
    let normalized_value = sanitize_identifier(contact_type, raw);
    NormalizedContact {
        identifier: normalized_value.clone(),
        normalized_value,
        raw_value: raw.trim().to_owned(),
        contact_type,
        verified,
        provider: Some(provider.to_owned()),
    }
}

/// Parses any timestamp a provider sends. Unparseable input yields the current time.
#[must_use]
pub fn parse_timestamp(value: &Value) -> DateTime<Utc> {
    timestamp_value(value).unwrap_or_else(Utc::now)
}

#[must_use]
pub fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(number) = text.parse::<i64>() {
        return from_unix(number);
    }
    if let Ok(float) = text.parse::<f64>() {
        return from_unix(float as i64);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

/// Like [`parse_timestamp`] without the current-time fallback.
pub(crate) fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .and_then(from_unix),
        Value::String(text) => parse_timestamp_str(text),
        _ => None,
    }
}

fn from_unix(value: i64) -> Option<DateTime<Utc>> {
    if value <= MAX_UNIX_SECONDS {
        Utc.timestamp_opt(value, 0).single()
    } else {
        Utc.timestamp_millis_opt(value).single()
    }
}

/// SHA-256 over `providerMessageId|body|from|to|timestampISO`, hex encoded.
#[must_use]
pub fn message_hash(
    provider_message_id: &str,
    body: Option<&str>,
    from: &str,
    to: &str,
    timestamp: DateTime<Utc>,
) -> String {
    let material = format!(
        "{provider_message_id}|{}|{from}|{to}|{}",
        body.unwrap_or_default(),
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// `{channel}:{low}:{high}` over the lexicographically sorted identifiers.
#[must_use]
pub fn sorted_pair_thread_key(channel: Channel, first: &str, second: &str) -> String {
    let (low, high) = if first <= second {
        (first, second)
    } else {
        (second, first)
    };
    format!("{}:{low}:{high}", channel.as_str())
}

/// Direction implied by a configured business identifier, if either side matches it.
#[must_use]
pub fn direction_from_business(
    business_identifier: &str,
    from: &NormalizedContact,
    to: &NormalizedContact,
) -> Option<Direction> {
    if identifier_matches(business_identifier, from) {
        Some(Direction::Outbound)
    } else if identifier_matches(business_identifier, to) {
        Some(Direction::Inbound)
    } else {
        None
    }
}

fn identifier_matches(business_identifier: &str, contact: &NormalizedContact) -> bool {
    let value = &contact.normalized_value;
    match contact.contact_type {
        ContactType::Phone => {
            let business = sanitize_phone_number(business_identifier);
            if business.is_empty() {
                return false;
            }
            let business_digits = business.trim_start_matches('+');
            let contact_digits = value.trim_start_matches('+');
            business_digits == contact_digits
                || (business_digits.len() >= 7 && contact_digits.ends_with(business_digits))
                || (contact_digits.len() >= 7 && business_digits.ends_with(contact_digits))
        }
        ContactType::Email => {
            let business = sanitize_email(business_identifier);
            match business.strip_prefix('@') {
                Some(domain) => value.ends_with(&format!("@{domain}")),
                None => *value == business,
            }
        }
        ContactType::Social => sanitize_social_handle(business_identifier) == *value,
    }
}
