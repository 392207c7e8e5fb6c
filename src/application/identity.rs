use serde_json::json;
use tracing::{debug, info};

use crate::{
    domain::{
        error::DomainError,
        models::{
            ContactType, CustomerRecord, Direction, IdentityRecord, IdentityResolution,
            NormalizedContact,
        },
    },
    storage::{IdentityProbe, SqliteStore, now_unix_ms},
};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const PHONE_SUFFIX_DIGITS: usize = 7;
/// Fuzzy scores stay below the exact-match confidence.
const MAX_FUZZY_SCORE: f64 = 0.99;

#[derive(Debug, Clone)]
pub struct IdentityOptions {
    pub fuzzy_matching: bool,
    pub confidence_threshold: f64,
    pub create_new_customer: bool,
    pub suggest_name_from_contact: bool,
    pub candidate_limit: usize,
}

impl Default for IdentityOptions {
    fn default() -> Self {
        Self {
            fuzzy_matching: true,
            confidence_threshold: 0.7,
            create_new_customer: true,
            suggest_name_from_contact: true,
            candidate_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedIdentity {
    pub customer_id: String,
    pub identity_id: String,
    pub is_new_customer: bool,
}

/// Resolution of both sides of a message. Only the customer side may create records.
#[derive(Debug, Clone)]
pub struct ContactResolutions {
    pub customer: IdentityResolution,
    pub business: IdentityResolution,
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: SqliteStore,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub async fn resolve_identity(
        &self,
        contact: &NormalizedContact,
        options: &IdentityOptions,
    ) -> Result<IdentityResolution, DomainError> {
        if let Some(identity) = self
            .store
            .find_identity(contact.contact_type, &contact.normalized_value)
            .await?
        {
            return Ok(IdentityResolution {
                customer_id: Some(identity.customer_id),
                is_new_customer: false,
                confidence: 1.0,
                matched_identities: vec![identity.id],
                suggested_name: None,
            });
        }

        if options.fuzzy_matching
            && let Some(probe) = probe_for(contact)
        {
            let candidates = self
                .store
                .find_potential_identity_matches(
                    contact.contact_type,
                    &probe,
                    &contact.normalized_value,
                    options.candidate_limit,
                )
                .await?;
            let now_ms = now_unix_ms();
            let best = candidates
                .into_iter()
                .map(|candidate| {
                    let score = score_candidate(&candidate, now_ms);
                    (candidate, score)
                })
                .max_by(|left, right| left.1.total_cmp(&right.1));

            if let Some((candidate, score)) = best {
                debug!(
                    identity_id = %candidate.id,
                    score,
                    threshold = options.confidence_threshold,
                    "scored fuzzy identity candidate"
                );
                if score >= options.confidence_threshold {
                    return Ok(IdentityResolution {
                        customer_id: Some(candidate.customer_id),
                        is_new_customer: false,
                        confidence: score,
                        matched_identities: vec![candidate.id],
                        suggested_name: None,
                    });
                }
            }
        }

        let suggested_name = if options.suggest_name_from_contact {
            suggest_name(contact)
        } else {
            None
        };
        Ok(IdentityResolution {
            customer_id: None,
            is_new_customer: options.create_new_customer,
            confidence: 0.0,
            matched_identities: Vec::new(),
            suggested_name,
        })
    }

    /// Persists the outcome of [`Self::resolve_identity`]. A concurrent writer
    /// that created the same identity first wins; its record is returned.
    pub async fn create_or_link_identity(
        &self,
        contact: &NormalizedContact,
        resolution: &IdentityResolution,
    ) -> Result<LinkedIdentity, DomainError> {
        let now_ms = now_unix_ms();
        if let Some(existing) = self.existing_link(contact, now_ms).await? {
            return Ok(existing);
        }

        let identity = IdentityRecord {
            id: uuid::Uuid::new_v4().to_string(),
            customer_id: String::new(),
            identity_type: contact.contact_type,
            normalized_value: contact.normalized_value.clone(),
            raw_value: contact.raw_value.clone(),
            provider: contact.provider.clone(),
            verified: contact.verified,
            created_at_ms: now_ms,
            last_seen_ms: now_ms,
        };

        let outcome = match &resolution.customer_id {
            Some(customer_id) => {
                let identity = IdentityRecord {
                    customer_id: customer_id.clone(),
                    ..identity
                };
                let inserted = self.store.insert_identity(&identity).await;
                inserted.map(|()| LinkedIdentity {
                    customer_id: identity.customer_id,
                    identity_id: identity.id,
                    is_new_customer: false,
                })
            }
            None if resolution.is_new_customer => {
                let customer = CustomerRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    display_name: resolution.suggested_name.clone(),
                    metadata: json!({ "source": contact.provider }),
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                };
                let identity = IdentityRecord {
                    customer_id: customer.id.clone(),
                    ..identity
                };
                let inserted = self
                    .store
                    .insert_customer_with_identity(&customer, &identity)
                    .await;
                inserted.map(|()| LinkedIdentity {
                    customer_id: customer.id,
                    identity_id: identity.id,
                    is_new_customer: true,
                })
            }
            None => {
                return Err(DomainError::InvalidRequest(format!(
                    "no customer to link {} to and creation is disabled",
                    contact.normalized_value
                )));
            }
        };

        match outcome {
            Ok(linked) => {
                if linked.is_new_customer {
                    info!(customer_id = %linked.customer_id, "created customer");
                }
                Ok(linked)
            }
            Err(DomainError::Conflict(reason)) => {
                debug!(%reason, "identity created concurrently, re-fetching");
                self.existing_link(contact, now_ms).await?.ok_or_else(|| {
                    DomainError::Storage(format!(
                        "identity conflict for {} but no identity found",
                        contact.normalized_value
                    ))
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Resolves the customer side fully and the business side by lookup only.
    pub async fn resolve_both_contacts(
        &self,
        from: &NormalizedContact,
        to: &NormalizedContact,
        direction: Direction,
        options: &IdentityOptions,
    ) -> Result<ContactResolutions, DomainError> {
        let (customer_side, business_side) = match direction {
            Direction::Inbound => (from, to),
            Direction::Outbound => (to, from),
        };
        let lookup_only = IdentityOptions {
            fuzzy_matching: false,
            create_new_customer: false,
            suggest_name_from_contact: false,
            ..options.clone()
        };

        let (customer, business) = tokio::try_join!(
            self.resolve_identity(customer_side, options),
            self.resolve_identity(business_side, &lookup_only),
        )?;
        Ok(ContactResolutions { customer, business })
    }

    async fn existing_link(
        &self,
        contact: &NormalizedContact,
        now_ms: u64,
    ) -> Result<Option<LinkedIdentity>, DomainError> {
        let Some(identity) = self
            .store
            .find_identity(contact.contact_type, &contact.normalized_value)
            .await?
        else {
            return Ok(None);
        };
        self.store.touch_identity(&identity.id, now_ms).await?;
        Ok(Some(LinkedIdentity {
            customer_id: identity.customer_id,
            identity_id: identity.id,
            is_new_customer: false,
        }))
    }
}

/// `0.5`, `+0.3` when verified, `+0.2` when linked within 30 days or `+0.1`
/// within 90 days.
#[must_use]
pub fn score_candidate(identity: &IdentityRecord, now_ms: u64) -> f64 {
    let mut score = 0.5;
    if identity.verified {
        score += 0.3;
    }
    let age_ms = now_ms.saturating_sub(identity.created_at_ms);
    if age_ms < 30 * DAY_MS {
        score += 0.2;
    } else if age_ms < 90 * DAY_MS {
        score += 0.1;
    }
    f64::min(score, MAX_FUZZY_SCORE)
}

fn probe_for(contact: &NormalizedContact) -> Option<IdentityProbe> {
    let value = &contact.normalized_value;
    match contact.contact_type {
        ContactType::Phone => {
            let digits: String = value.chars().filter(char::is_ascii_digit).collect();
            (digits.len() >= PHONE_SUFFIX_DIGITS)
                .then(|| IdentityProbe::PhoneSuffix(digits[digits.len() - PHONE_SUFFIX_DIGITS..].to_owned()))
        }
        ContactType::Email => value
            .split_once('@')
            .map(|(local, _)| local)
            .filter(|local| !local.is_empty())
            .map(|local| IdentityProbe::EmailLocalPart(local.to_owned())),
        ContactType::Social => {
            let handle: String = value
                .chars()
                .filter(|character| !matches!(character, '.' | '_' | '-'))
                .collect();
            (!handle.is_empty()).then_some(IdentityProbe::SocialHandle(handle))
        }
    }
}

#[must_use]
pub fn suggest_name(contact: &NormalizedContact) -> Option<String> {
    let value = &contact.normalized_value;
    let name = match contact.contact_type {
        ContactType::Phone => return None,
        ContactType::Email => {
            let local = value.split_once('@').map_or(value.as_str(), |(local, _)| local);
            let local = local.split_once('+').map_or(local, |(base, _)| base);
            local
                .split('.')
                .filter(|word| !word.is_empty())
                .map(title_case)
                .collect::<Vec<_>>()
                .join(" ")
        }
        ContactType::Social => value
            .split(['.', '_', '-'])
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
    };
    (!name.is_empty()).then_some(name)
}

fn title_case(word: &str) -> String {
    let mut characters = word.chars();
    match characters.next() {
        Some(first) => first.to_uppercase().chain(characters).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{DAY_MS, IdentityProbe, probe_for, score_candidate, suggest_name};
    use crate::{
        application::normalize::make_contact,
        domain::models::{ContactType, IdentityRecord},
    };

    fn identity(verified: bool, created_at_ms: u64) -> IdentityRecord {
        IdentityRecord {
            id: "id-1".to_owned(),
            customer_id: "cust-1".to_owned(),
            identity_type: ContactType::Phone,
            normalized_value: "+15551234567".to_owned(),
            raw_value: "+15551234567".to_owned(),
            provider: None,
            verified,
            created_at_ms,
            last_seen_ms: created_at_ms,
        }
    }

    #[test]
    fn candidate_scores_follow_verification_and_recency() {
        let now = 200 * DAY_MS;
        assert!((score_candidate(&identity(false, 0), now) - 0.5).abs() < 1e-9);
        assert!((score_candidate(&identity(false, now - 60 * DAY_MS), now) - 0.6).abs() < 1e-9);
        assert!((score_candidate(&identity(true, now - 100 * DAY_MS), now) - 0.8).abs() < 1e-9);
        assert!((score_candidate(&identity(true, now - DAY_MS), now) - 0.99).abs() < 1e-9);
    }

    #[test]
    fn names_are_suggested_from_email_and_handles() {
        let email = make_contact(ContactType::Email, "jane.doe+orders@example.com", false, "gmail");
        assert_eq!(suggest_name(&email).as_deref(), Some("Jane Doe"));

        let social = make_contact(ContactType::Social, "@jane_doe-99", false, "instagram");
        assert_eq!(suggest_name(&social).as_deref(), Some("jane doe 99"));

        let phone = make_contact(ContactType::Phone, "+15551234567", false, "twilio");
        assert!(suggest_name(&phone).is_none());
    }

    #[test]
    fn probes_use_suffix_local_part_and_bare_handle() {
        let phone = make_contact(ContactType::Phone, "+15551234567", false, "twilio");
        assert_eq!(
            probe_for(&phone),
            Some(IdentityProbe::PhoneSuffix("1234567".to_owned()))
        );
        let email = make_contact(ContactType::Email, "Jane@Example.com", false, "gmail");
        assert_eq!(
            probe_for(&email),
            Some(IdentityProbe::EmailLocalPart("jane".to_owned()))
        );
        let social = make_contact(ContactType::Social, "@j.doe_", false, "instagram");
        assert_eq!(
            probe_for(&social),
            Some(IdentityProbe::SocialHandle("jdoe".to_owned()))
        );
    }
}
