use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::models::RawHeaders;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub const TWILIO_SIGNATURE_HEADER: &str = "x-twilio-signature";
pub const HUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const CHANNEL_TOKEN_HEADER: &str = "x-goog-channel-token";
pub const GENERIC_SIGNATURE_HEADER: &str = "x-signature";

const GENERIC_HEADER_CANDIDATES: &[&str] = &[
    "x-signature",
    "signature",
    "x-hub-signature-256",
    "x-hub-signature",
    "authorization",
];
const GENERIC_PREFIXES: &[&str] = &["sha256=", "sha1=", "Bearer ", "bearer ", "HMAC ", "hmac "];
const DEFAULT_REPLAY_TOLERANCE: Duration = Duration::from_secs(300);

/// Signing scheme a provider uses for its webhook deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// base64(HMAC-SHA1(url + body)).
    TwilioSha1,
    /// `sha256=<hex>` HMAC-SHA256 over the body (WhatsApp, Facebook, Instagram).
    HubSha256,
    /// `v0=<hex>` HMAC-SHA256 over `v0:{ts}:{body}` with a replay window.
    SlackV0,
    /// Shared channel token compared verbatim.
    ChannelToken,
    Generic,
}

impl SignatureScheme {
    #[must_use]
    pub fn for_provider(provider_type: &str) -> Self {
        match provider_type.trim().to_ascii_lowercase().as_str() {
            "twilio" => Self::TwilioSha1,
            "whatsapp" | "facebook" | "messenger" | "instagram" => Self::HubSha256,
            "slack" => Self::SlackV0,
            "gmail" | "google" => Self::ChannelToken,
            _ => Self::Generic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl VerificationResult {
    fn accepted(timestamp: Option<i64>) -> Self {
        Self {
            valid: true,
            error: None,
            timestamp,
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            timestamp: None,
        }
    }
}

/// Checks that a webhook body was signed by the provider that claims to have sent it.
///
/// Verification failure is an expected outcome and is reported through
/// [`VerificationResult`], never as an error. Every comparison of secret
/// material goes through `hmac`'s `verify_slice` or `subtle`.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    replay_tolerance: Duration,
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_TOLERANCE)
    }
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(replay_tolerance: Duration) -> Self {
        Self { replay_tolerance }
    }

    #[must_use]
    pub fn verify(
        &self,
        provider_type: &str,
        body: &[u8],
        headers: &RawHeaders,
        secret: &str,
        webhook_url: Option<&str>,
    ) -> VerificationResult {
        self.verify_at(
            provider_type,
            body,
            headers,
            secret,
            webhook_url,
            Utc::now().timestamp(),
        )
    }

    #[must_use]
    pub fn verify_at(
        &self,
        provider_type: &str,
        body: &[u8],
        headers: &RawHeaders,
        secret: &str,
        webhook_url: Option<&str>,
        now_secs: i64,
    ) -> VerificationResult {
        if secret.is_empty() {
            return VerificationResult::rejected("webhook secret is not configured");
        }

        match SignatureScheme::for_provider(provider_type) {
            SignatureScheme::TwilioSha1 => verify_twilio(body, headers, secret, webhook_url),
            SignatureScheme::HubSha256 => verify_hub(body, headers, secret),
            SignatureScheme::SlackV0 => {
                verify_slack(body, headers, secret, now_secs, self.replay_tolerance)
            }
            SignatureScheme::ChannelToken => verify_channel_token(headers, secret),
            SignatureScheme::Generic => verify_generic(body, headers, secret),
        }
    }

    /// Produces the headers a provider would attach to `body`. Used to build fixtures.
    pub fn generate_signature(
        &self,
        provider_type: &str,
        body: &[u8],
        secret: &str,
        webhook_url: Option<&str>,
        timestamp: i64,
    ) -> Result<RawHeaders, String> {
        let mut headers = RawHeaders::new();
        match SignatureScheme::for_provider(provider_type) {
            SignatureScheme::TwilioSha1 => {
                let Some(url) = webhook_url else {
                    return Err("twilio signatures require the webhook URL".to_owned());
                };
                let mut mac = sha1_mac(secret)?;
                mac.update(url.as_bytes());
                mac.update(body);
                headers.insert(
                    TWILIO_SIGNATURE_HEADER.to_owned(),
                    STANDARD.encode(mac.finalize().into_bytes()),
                );
            }
            SignatureScheme::HubSha256 => {
                let mut mac = sha256_mac(secret)?;
                mac.update(body);
                headers.insert(
                    HUB_SIGNATURE_HEADER.to_owned(),
                    format!("sha256={}", hex::encode(mac.finalize().into_bytes())),
                );
            }
            SignatureScheme::SlackV0 => {
                let mut mac = sha256_mac(secret)?;
                mac.update(format!("v0:{timestamp}:").as_bytes());
                mac.update(body);
                headers.insert(
                    SLACK_SIGNATURE_HEADER.to_owned(),
                    format!("v0={}", hex::encode(mac.finalize().into_bytes())),
                );
                headers.insert(SLACK_TIMESTAMP_HEADER.to_owned(), timestamp.to_string());
            }
            SignatureScheme::ChannelToken => {
                headers.insert(CHANNEL_TOKEN_HEADER.to_owned(), secret.to_owned());
            }
            SignatureScheme::Generic => {
                let mut mac = sha256_mac(secret)?;
                mac.update(body);
                headers.insert(
                    GENERIC_SIGNATURE_HEADER.to_owned(),
                    format!("sha256={}", hex::encode(mac.finalize().into_bytes())),
                );
            }
        }
        Ok(headers)
    }
}

fn verify_twilio(
    body: &[u8],
    headers: &RawHeaders,
    secret: &str,
    webhook_url: Option<&str>,
) -> VerificationResult {
    let Some(signature) = header(headers, TWILIO_SIGNATURE_HEADER) else {
        return VerificationResult::rejected("missing x-twilio-signature header");
    };
    let Some(url) = webhook_url.filter(|url| !url.is_empty()) else {
        return VerificationResult::rejected("twilio verification requires the webhook URL");
    };
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return VerificationResult::rejected("x-twilio-signature is not valid base64");
    };
    let Ok(mut mac) = sha1_mac(secret) else {
        return VerificationResult::rejected("failed to initialize HMAC-SHA1");
    };
    mac.update(url.as_bytes());
    mac.update(body);

    match mac.verify_slice(&expected) {
        Ok(()) => VerificationResult::accepted(None),
        Err(_) => VerificationResult::rejected("twilio signature mismatch"),
    }
}

fn verify_hub(body: &[u8], headers: &RawHeaders, secret: &str) -> VerificationResult {
    let Some(signature) = header(headers, HUB_SIGNATURE_HEADER) else {
        return VerificationResult::rejected("missing x-hub-signature-256 header");
    };
    let hex_signature = signature.trim();
    let hex_signature = hex_signature
        .strip_prefix("sha256=")
        .unwrap_or(hex_signature);
    let Ok(expected) = hex::decode(hex_signature) else {
        return VerificationResult::rejected("x-hub-signature-256 is not valid hex");
    };
    let Ok(mut mac) = sha256_mac(secret) else {
        return VerificationResult::rejected("failed to initialize HMAC-SHA256");
    };
    mac.update(body);

    match mac.verify_slice(&expected) {
        Ok(()) => VerificationResult::accepted(None),
        Err(_) => VerificationResult::rejected("sha256 signature mismatch"),
    }
}

fn verify_slack(
    body: &[u8],
    headers: &RawHeaders,
    secret: &str,
    now_secs: i64,
    tolerance: Duration,
) -> VerificationResult {
    let Some(signature) = header(headers, SLACK_SIGNATURE_HEADER) else {
        return VerificationResult::rejected("missing x-slack-signature header");
    };
    let Some(raw_timestamp) = header(headers, SLACK_TIMESTAMP_HEADER) else {
        return VerificationResult::rejected("missing x-slack-request-timestamp header");
    };
    let Ok(timestamp) = raw_timestamp.trim().parse::<i64>() else {
        return VerificationResult::rejected("x-slack-request-timestamp is not a unix timestamp");
    };

    let tolerance_secs = i64::try_from(tolerance.as_secs()).unwrap_or(i64::MAX);
    if now_secs.saturating_sub(timestamp).abs() > tolerance_secs {
        return VerificationResult::rejected("request timestamp is outside the replay window");
    }

    let Some(hex_signature) = signature.trim().strip_prefix("v0=") else {
        return VerificationResult::rejected("x-slack-signature must start with v0=");
    };
    let Ok(expected) = hex::decode(hex_signature) else {
        return VerificationResult::rejected("x-slack-signature is not valid hex");
    };
    let Ok(mut mac) = sha256_mac(secret) else {
        return VerificationResult::rejected("failed to initialize HMAC-SHA256");
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);

    match mac.verify_slice(&expected) {
        Ok(()) => VerificationResult::accepted(Some(timestamp)),
        Err(_) => VerificationResult::rejected("slack signature mismatch"),
    }
}

fn verify_channel_token(headers: &RawHeaders, secret: &str) -> VerificationResult {
    let Some(token) = header(headers, CHANNEL_TOKEN_HEADER) else {
        return VerificationResult::rejected("missing x-goog-channel-token header");
    };

    if token.trim().as_bytes().ct_eq(secret.as_bytes()).into() {
        VerificationResult::accepted(None)
    } else {
        VerificationResult::rejected("channel token mismatch")
    }
}

fn verify_generic(body: &[u8], headers: &RawHeaders, secret: &str) -> VerificationResult {
    let mut saw_header = false;

    for name in GENERIC_HEADER_CANDIDATES {
        let Some(value) = header(headers, name) else {
            continue;
        };
        saw_header = true;

        let mut candidate = value.trim();
        for prefix in GENERIC_PREFIXES {
            if let Some(stripped) = candidate.strip_prefix(prefix) {
                candidate = stripped.trim();
                break;
            }
        }

        let decoded = [hex::decode(candidate).ok(), STANDARD.decode(candidate).ok()];
        for expected in decoded.iter().flatten() {
            if let Ok(mut mac) = sha256_mac(secret) {
                mac.update(body);
                if mac.verify_slice(expected).is_ok() {
                    return VerificationResult::accepted(None);
                }
            }
            if let Ok(mut mac) = sha1_mac(secret) {
                mac.update(body);
                if mac.verify_slice(expected).is_ok() {
                    return VerificationResult::accepted(None);
                }
            }
        }
    }

    if saw_header {
        VerificationResult::rejected("signature mismatch")
    } else {
        VerificationResult::rejected("missing signature header")
    }
}

fn header<'a>(headers: &'a RawHeaders, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .or_else(|| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .map(String::as_str)
}

fn sha1_mac(secret: &str) -> Result<HmacSha1, String> {
    HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|error| format!("failed to initialize HMAC-SHA1: {error}"))
}

fn sha256_mac(secret: &str) -> Result<HmacSha256, String> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|error| format!("failed to initialize HMAC-SHA256: {error}"))
}
