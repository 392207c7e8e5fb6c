use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ErrorShape;

/// Original HTTP headers, keyed by lower-cased header name.
pub type RawHeaders = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Whatsapp,
    Email,
    Social,
}

impl Channel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Email => "email",
            Self::Social => "social",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sms" => Some(Self::Sms),
            "whatsapp" => Some(Self::Whatsapp),
            "email" => Some(Self::Email),
            "social" => Some(Self::Social),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    Phone,
    Email,
    Social,
}

impl ContactType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Email => "email",
            Self::Social => "social",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "phone" => Some(Self::Phone),
            "email" => Some(Self::Email),
            "social" => Some(Self::Social),
            _ => None,
        }
    }
}

/// One inbound webhook delivery, exactly as the receiver handed it over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProviderMessage {
    pub provider_id: String,
    pub provider_message_id: String,
    pub provider_type: String,
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub webhook_signature: Option<String>,
    #[serde(default)]
    pub raw_headers: Option<RawHeaders>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedContact {
    pub identifier: String,
    pub normalized_value: String,
    pub raw_value: String,
    #[serde(rename = "type")]
    pub contact_type: ContactType,
    pub verified: bool,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
    File,
}

impl AttachmentKind {
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Self {
        let lower = mime_type.to_ascii_lowercase();
        if lower.starts_with("image/") {
            Self::Image
        } else if lower.starts_with("audio/") {
            Self::Audio
        } else if lower.starts_with("video/") {
            Self::Video
        } else if lower.starts_with("application/pdf")
            || lower.starts_with("application/msword")
            || lower.starts_with("application/vnd.")
            || lower.starts_with("text/")
        {
            Self::Document
        } else {
            Self::File
        }
    }
}

/// Reference to provider-hosted media; the bytes are never fetched during ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub url: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub provider_message_id: String,
    pub provider_id: String,
    pub channel: Channel,
    pub direction: Direction,
    pub from: NormalizedContact,
    pub to: NormalizedContact,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub body: Option<String>,
    pub content_type: String,
    #[serde(default)]
    pub thread_key: Option<String>,
    pub provider_meta: Value,
    pub attachments: Vec<Attachment>,
    pub message_hash: String,
}

impl NormalizedMessage {
    /// The participant on the customer side of the exchange.
    #[must_use]
    pub fn customer_contact(&self) -> &NormalizedContact {
        match self.direction {
            Direction::Inbound => &self.from,
            Direction::Outbound => &self.to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityResolution {
    #[serde(default)]
    pub customer_id: Option<String>,
    pub is_new_customer: bool,
    pub confidence: f64,
    pub matched_identities: Vec<String>,
    #[serde(default)]
    pub suggested_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadingContext {
    pub thread_key: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub is_new_conversation: bool,
    pub related_messages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Duplicate,
}

impl IngestionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Duplicate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Validation,
    IdempotencyCheck,
    Normalization,
    DuplicateCheck,
    IdentityResolution,
    Threading,
    Persistence,
    ConversationUpdate,
}

impl PipelineStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::IdempotencyCheck => "idempotency_check",
            Self::Normalization => "normalization",
            Self::DuplicateCheck => "duplicate_check",
            Self::IdentityResolution => "identity_resolution",
            Self::Threading => "threading",
            Self::Persistence => "persistence",
            Self::ConversationUpdate => "conversation_update",
        }
    }
}

/// Ordered audit trail of one pipeline run. Frozen once `end_time` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub stages_completed: Vec<PipelineStage>,
    pub stages_failed: Vec<PipelineStage>,
}

impl ProcessingMetrics {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            stages_completed: Vec::new(),
            stages_failed: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn enter(&mut self, stage: PipelineStage) {
        if !self.is_finished() {
            self.stages_completed.push(stage);
        }
    }

    /// Marks the most recently entered stage as failed.
    pub fn fail_current(&mut self) {
        if self.is_finished() {
            return;
        }
        if let Some(stage) = self.stages_completed.last().copied() {
            self.stages_failed.push(stage);
        }
    }

    #[must_use]
    pub fn last_stage(&self) -> Option<PipelineStage> {
        self.stages_completed.last().copied()
    }

    pub fn finish(&mut self) {
        if self.is_finished() {
            return;
        }
        let end = Utc::now();
        let elapsed = (end - self.start_time).num_milliseconds();
        self.duration_ms = Some(u64::try_from(elapsed).unwrap_or(0));
        self.end_time = Some(end);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResult {
    pub status: IngestionStatus,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub normalized_message: Option<NormalizedMessage>,
    #[serde(default)]
    pub identity_resolution: Option<IdentityResolution>,
    #[serde(default)]
    pub threading_context: Option<ThreadingContext>,
    #[serde(default)]
    pub error: Option<ErrorShape>,
    pub processing_metrics: ProcessingMetrics,
}

impl IngestionResult {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: IngestionStatus::Pending,
            message_id: None,
            normalized_message: None,
            identity_resolution: None,
            threading_context: None,
            error: None,
            processing_metrics: ProcessingMetrics::start(),
        }
    }

    #[must_use]
    pub fn failed(error: ErrorShape) -> Self {
        let mut result = Self::pending();
        result.status = IngestionStatus::Failed;
        result.error = Some(error);
        result.processing_metrics.finish();
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub metadata: Value,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub id: String,
    pub customer_id: String,
    pub identity_type: ContactType,
    pub normalized_value: String,
    pub raw_value: String,
    pub provider: Option<String>,
    pub verified: bool,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    Closed,
}

impl ConversationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub customer_id: String,
    pub thread_key: String,
    pub channel: Channel,
    pub status: ConversationStatus,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub message_count: u64,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Processed,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "received" => Some(Self::Received),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Persisted message row. `metadata` carries the original provider payload,
/// `messageHash` and `contentType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub provider_message_id: String,
    pub provider_id: String,
    pub customer_id: Option<String>,
    pub conversation_id: Option<String>,
    pub channel: Channel,
    pub direction: Direction,
    pub from_identifier: String,
    pub to_identifier: String,
    pub thread_key: Option<String>,
    pub timestamp_ms: u64,
    pub body: Option<String>,
    pub status: MessageStatus,
    pub message_hash: String,
    pub metadata: Value,
    pub created_at_ms: u64,
}
