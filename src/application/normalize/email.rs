use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    MessageDraft, Normalizer, NormalizerConfig, ThreadingStrategy, direction_from_business,
    invalid_payload, parse_timestamp, parse_timestamp_str,
};
use crate::domain::{
    error::IngestionError,
    models::{
        Attachment, AttachmentKind, Channel, ContactType, Direction, NormalizedMessage,
        RawProviderMessage,
    },
};

const PROVIDER_TYPE: &str = "gmail";
const SENT_LABEL: &str = "SENT";

/// Gmail API `users.messages.get` resource in `full` format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailPayload {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub internal_date: Option<Value>,
    pub payload: GmailPart,
    #[serde(default)]
    pub size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailPart {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<GmailHeader>,
    #[serde(default)]
    pub body: Option<GmailBody>,
    #[serde(default)]
    pub parts: Vec<GmailPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailBody {
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
}

impl GmailPart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    fn is_attachment(&self) -> bool {
        self.filename.as_deref().is_some_and(|name| !name.is_empty())
    }

    fn mime_essence(&self) -> String {
        self.mime_type
            .as_deref()
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    fn decoded_data(&self) -> Option<String> {
        let data = self.body.as_ref()?.data.as_deref()?;
        decode_base64url(data)
    }

    /// Depth-first walk collecting the first plain and html bodies and every attachment.
    fn collect(&self, message_id: &str, bodies: &mut BodyParts, attachments: &mut Vec<Attachment>) {
        if self.is_attachment() {
            if let Some(body) = &self.body
                && let Some(attachment_id) = &body.attachment_id
            {
                let mime_type = self.mime_type.clone();
                attachments.push(Attachment {
                    kind: mime_type
                        .as_deref()
                        .map_or(AttachmentKind::File, AttachmentKind::from_mime),
                    filename: self.filename.clone(),
                    size: body.size,
                    mime_type,
                    url: format!("gmail://messages/{message_id}/attachments/{attachment_id}"),
                    metadata: json!({ "partId": self.part_id, "attachmentId": attachment_id }),
                });
            }
            return;
        }

        match self.mime_essence().as_str() {
            "text/plain" if bodies.plain.is_none() => bodies.plain = self.decoded_data(),
            "text/html" if bodies.html.is_none() => bodies.html = self.decoded_data(),
            _ => {}
        }
        for part in &self.parts {
            part.collect(message_id, bodies, attachments);
        }
    }
}

#[derive(Default)]
struct BodyParts {
    plain: Option<String>,
    html: Option<String>,
}

fn decode_base64url(data: &str) -> Option<String> {
    let trimmed = data.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Drops tags, `<script>`/`<style>` content and common entities, collapsing whitespace.
#[must_use]
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let tag_and_after = &rest[start..];
        let Some(end) = tag_and_after.find('>') else {
            rest = "";
            break;
        };
        let tag = tag_and_after[1..end].trim().to_ascii_lowercase();
        rest = &tag_and_after[end + 1..];

        for skipped in ["script", "style"] {
            if tag.starts_with(skipped) {
                let closing = format!("</{skipped}");
                rest = match rest.to_ascii_lowercase().find(&closing) {
                    Some(close) => rest[close..]
                        .find('>')
                        .map_or("", |offset| &rest[close + offset + 1..]),
                    None => "",
                };
            }
        }
        if tag.starts_with("br") || tag.starts_with("/p") || tag.starts_with("/div") {
            text.push(' ');
        }
    }
    text.push_str(rest);

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Address inside `Display Name <addr@host>`, or the trimmed input.
fn parse_address(raw: &str) -> &str {
    let first = raw.split(',').next().unwrap_or_default().trim();
    match (first.rfind('<'), first.rfind('>')) {
        (Some(open), Some(close)) if open < close => first[open + 1..close].trim(),
        _ => first.trim_matches('"').trim(),
    }
}

pub struct GmailNormalizer {
    config: NormalizerConfig,
}

impl GmailNormalizer {
    #[must_use]
    pub fn new(business_identifier: Option<String>) -> Self {
        Self {
            config: NormalizerConfig {
                channel: Channel::Email,
                provider_type: PROVIDER_TYPE.to_owned(),
                identity_mode: ContactType::Email,
                threading: ThreadingStrategy::ProviderThread,
                duplicate_window_minutes: 10,
                supported_content_types: vec!["text/plain".to_owned(), "text/html".to_owned()],
                business_identifier,
            },
        }
    }
}

impl Normalizer for GmailNormalizer {
    fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    fn normalize(&self, raw: &RawProviderMessage) -> Result<NormalizedMessage, IngestionError> {
        let payload: GmailPayload = serde_json::from_value(raw.payload.clone())
            .map_err(|error| invalid_payload(raw, format!("invalid gmail payload: {error}")))?;
        let root = &payload.payload;

        let from_header = root
            .header("From")
            .ok_or_else(|| invalid_payload(raw, "message has no From header"))?;
        let to_header = root
            .header("To")
            .or_else(|| root.header("Delivered-To"))
            .ok_or_else(|| invalid_payload(raw, "message has no To header"))?;
        let from = self.config.contact(parse_address(from_header), false);
        let to = self.config.contact(parse_address(to_header), false);
        if !from.normalized_value.contains('@') || !to.normalized_value.contains('@') {
            return Err(invalid_payload(raw, "From and To must be email addresses"));
        }

        let direction = self
            .config
            .business_identifier
            .as_deref()
            .and_then(|business| direction_from_business(business, &from, &to))
            .unwrap_or_else(|| {
                if payload.label_ids.iter().any(|label| label == SENT_LABEL) {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                }
            });

        let timestamp = match &payload.internal_date {
            Some(value) => parse_timestamp(value),
            None => root
                .header("Date")
                .and_then(parse_timestamp_str)
                .unwrap_or(raw.timestamp),
        };

        let mut bodies = BodyParts::default();
        let mut attachments = Vec::new();
        root.collect(&payload.id, &mut bodies, &mut attachments);
        let (body, content_type) = match (bodies.plain, bodies.html) {
            (Some(plain), _) => (Some(plain), "text/plain"),
            (None, Some(html)) => (Some(strip_html(&html)), "text/html"),
            (None, None) => (None, "text/plain"),
        };
        let body = body.filter(|text| !text.trim().is_empty());

        let (business, customer) = match direction {
            Direction::Inbound => (&to, &from),
            Direction::Outbound => (&from, &to),
        };
        let thread_key = self.config.thread_key(
            &business.normalized_value,
            &customer.normalized_value,
            payload.thread_id.as_deref(),
        );

        MessageDraft {
            direction,
            from,
            to,
            timestamp,
            body,
            content_type: content_type.to_owned(),
            thread_key: Some(thread_key),
            provider_meta: json!({
                "threadId": payload.thread_id,
                "labelIds": payload.label_ids,
                "snippet": payload.snippet,
                "historyId": payload.history_id,
                "subject": root.header("Subject"),
                "sizeEstimate": payload.size_estimate,
            }),
            attachments,
        }
        .seal(&self.config, raw)
    }
}
