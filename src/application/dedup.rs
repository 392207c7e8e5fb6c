use chrono::Duration;
use serde::Serialize;
use tracing::debug;

use crate::{
    domain::{
        error::DomainError,
        models::{Channel, NormalizedMessage, RawProviderMessage},
    },
    storage::SqliteStore,
};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;
const DEFAULT_CANDIDATE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateType {
    ProviderId,
    ContentHash,
    SimilarContent,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub duplicate_type: DuplicateType,
    pub existing_message_id: Option<String>,
    pub confidence: f64,
    pub reason: Option<String>,
}

impl DuplicateCheck {
    fn unique() -> Self {
        Self {
            is_duplicate: false,
            duplicate_type: DuplicateType::None,
            existing_message_id: None,
            confidence: 0.0,
            reason: None,
        }
    }

    fn found(
        duplicate_type: DuplicateType,
        existing_message_id: String,
        confidence: f64,
        reason: String,
    ) -> Self {
        Self {
            is_duplicate: true,
            duplicate_type,
            existing_message_id: Some(existing_message_id),
            confidence,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupOptions {
    /// Half-width of the time window searched around the message timestamp.
    /// `None` uses the channel default.
    pub window: Option<Duration>,
    pub similarity_threshold: f64,
    pub check_content_hash: bool,
    pub check_similar_content: bool,
    pub candidate_limit: usize,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            window: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            check_content_hash: true,
            check_similar_content: true,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
        }
    }
}

impl DedupOptions {
    #[must_use]
    pub fn with_window_minutes(mut self, minutes: u32) -> Self {
        self.window = Some(Duration::minutes(i64::from(minutes)));
        self
    }
}

#[must_use]
pub fn default_window(channel: Channel) -> Duration {
    match channel {
        Channel::Whatsapp => Duration::minutes(3),
        Channel::Email => Duration::minutes(10),
        Channel::Sms | Channel::Social => Duration::minutes(5),
    }
}

/// Escalating duplicate checks against persisted messages.
#[derive(Clone)]
pub struct DeduplicationEngine {
    store: SqliteStore,
}

impl DeduplicationEngine {
    #[must_use]
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Provider id, then content hash, then fuzzy body similarity; stops at
    /// the first match.
    pub async fn check_for_duplicate(
        &self,
        normalized: &NormalizedMessage,
        raw: &RawProviderMessage,
        options: &DedupOptions,
    ) -> Result<DuplicateCheck, DomainError> {
        if let Some(existing) = self
            .store
            .find_message_by_provider_id(&raw.provider_id, &raw.provider_message_id)
            .await?
        {
            return Ok(DuplicateCheck::found(
                DuplicateType::ProviderId,
                existing.id,
                1.0,
                format!(
                    "message {} from {} was already stored",
                    raw.provider_message_id, raw.provider_id
                ),
            ));
        }

        let window = options
            .window
            .unwrap_or_else(|| default_window(normalized.channel));
        let (start_ms, end_ms) = window_bounds(normalized, window);

        if options.check_content_hash
            && let Some(existing) = self
                .store
                .find_message_by_hash(&normalized.message_hash, start_ms, end_ms)
                .await?
        {
            return Ok(DuplicateCheck::found(
                DuplicateType::ContentHash,
                existing.id,
                1.0,
                "identical content fingerprint within the duplicate window".to_owned(),
            ));
        }

        if options.check_similar_content
            && let Some(body) = normalized.body.as_deref().filter(|body| !body.trim().is_empty())
        {
            let candidates = self
                .store
                .list_messages_between(
                    &normalized.from.normalized_value,
                    &normalized.to.normalized_value,
                    start_ms,
                    end_ms,
                    options.candidate_limit,
                )
                .await?;
            let needle = body.trim().to_lowercase();

            let best = candidates
                .into_iter()
                .filter_map(|candidate| {
                    let other = candidate.body.as_deref()?.trim().to_lowercase();
                    if length_ratio(&needle, &other) < options.similarity_threshold {
                        return None;
                    }
                    let score = similarity(&needle, &other);
                    (score >= options.similarity_threshold).then_some((candidate.id, score))
                })
                .max_by(|left, right| left.1.total_cmp(&right.1));

            if let Some((existing_id, score)) = best {
                debug!(
                    provider_message_id = %raw.provider_message_id,
                    existing_id = %existing_id,
                    score,
                    "similar message found"
                );
                return Ok(DuplicateCheck::found(
                    DuplicateType::SimilarContent,
                    existing_id,
                    score,
                    format!("body is {:.0}% similar to a recent message", score * 100.0),
                ));
            }
        }

        Ok(DuplicateCheck::unique())
    }
}

fn window_bounds(message: &NormalizedMessage, window: Duration) -> (u64, u64) {
    let center = message.timestamp.timestamp_millis();
    let half = window.num_milliseconds().abs();
    let start = u64::try_from(center.saturating_sub(half)).unwrap_or(0);
    let end = u64::try_from(center.saturating_add(half)).unwrap_or(0);
    (start, end)
}

/// Upper bound on [`similarity`]; edit distance is at least the length difference.
fn length_ratio(left: &str, right: &str) -> f64 {
    let (left, right) = (left.chars().count(), right.chars().count());
    let longest = left.max(right);
    if longest == 0 {
        return 1.0;
    }
    left.min(right) as f64 / longest as f64
}

/// `1 - distance / max(len)`, in `[0, 1]`.
#[must_use]
pub fn similarity(left: &str, right: &str) -> f64 {
    let longest = left.chars().count().max(right.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(left, right) as f64 / longest as f64
}

#[must_use]
pub fn levenshtein(left: &str, right: &str) -> usize {
    let right: Vec<char> = right.chars().collect();
    let mut previous: Vec<usize> = (0..=right.len()).collect();
    let mut current = vec![0; right.len() + 1];

    for (i, left_char) in left.chars().enumerate() {
        current[0] = i + 1;
        for (j, right_char) in right.iter().enumerate() {
            let substitution = previous[j] + usize::from(left_char != *right_char);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[right.len()]
}
