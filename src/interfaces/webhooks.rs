use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    application::{normalize::ProviderPayload, state::SharedState},
    domain::{
        error::IngestionErrorCode,
        models::{Channel, RawHeaders, RawProviderMessage},
    },
    protocol::{ERROR_UNAUTHORIZED, ERROR_UNAVAILABLE, ErrorShape},
    security::signature::{
        CHANNEL_TOKEN_HEADER, GENERIC_SIGNATURE_HEADER, HUB_SIGNATURE_HEADER,
        SLACK_SIGNATURE_HEADER, SignatureScheme, TWILIO_SIGNATURE_HEADER,
    },
};

type WebhookResponse = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> WebhookResponse {
    (
        status,
        Json(json!({
            "ok": false,
            "error": ErrorShape::new(code, message),
        })),
    )
}

/// `POST /webhooks/{providerType}`: verify, decode, enqueue, answer 202.
pub async fn provider_webhook_handler(
    Path(provider_type): Path<String>,
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provider_type = provider_type.trim().to_ascii_lowercase();
    let registry = state.pipeline().registry();
    let Some(channel) = registry.channel_for_provider(&provider_type) else {
        return error_response(
            StatusCode::NOT_FOUND,
            IngestionErrorCode::ProviderNotSupported.as_str(),
            format!("provider {provider_type} is not supported"),
        );
    };
    let settings = state.provider(&provider_type);
    if settings.is_some_and(|settings| !settings.enabled) {
        return error_response(
            StatusCode::NOT_FOUND,
            IngestionErrorCode::ProviderNotSupported.as_str(),
            format!("provider {provider_type} is disabled"),
        );
    }

    let raw_headers = lowercase_headers(&headers);
    if let Some(settings) = settings
        && let Some(secret) = settings.secret()
    {
        let verification = state.verifier().verify(
            &provider_type,
            &body,
            &raw_headers,
            secret,
            settings.webhook_url.as_deref(),
        );
        if !verification.valid {
            let message = verification
                .error
                .unwrap_or_else(|| "signature verification failed".to_owned());
            warn!(%provider_type, "rejected webhook: {message}");
            return error_response(StatusCode::UNAUTHORIZED, ERROR_UNAUTHORIZED, message);
        }
    }

    let raw = match raw_provider_message(&provider_type, channel, &body, raw_headers) {
        Ok(raw) => raw,
        Err(message) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                IngestionErrorCode::InvalidPayload.as_str(),
                message,
            );
        }
    };
    let provider_message_id = raw.provider_message_id.clone();

    match state.jobs().enqueue_webhook(raw) {
        Ok(job_id) => {
            debug!(%job_id, %provider_message_id, "webhook accepted");
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "ok": true,
                    "accepted": true,
                    "jobId": job_id,
                })),
            )
        }
        Err(error) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ERROR_UNAVAILABLE,
            error.to_string(),
        ),
    }
}

/// Decodes a verified webhook body into the message the pipeline consumes.
/// The timestamp is the provider's event time, or the receipt time when the
/// payload reports none.
pub fn raw_provider_message(
    provider_type: &str,
    channel: Channel,
    body: &[u8],
    raw_headers: RawHeaders,
) -> Result<RawProviderMessage, String> {
    let payload = decode_body(provider_type, body)?;
    let typed = ProviderPayload::parse(provider_type, &payload)?;
    let provider_message_id = typed
        .provider_message_id()
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "payload carries no provider message id".to_owned())?;

    Ok(RawProviderMessage {
        provider_id: provider_type.to_owned(),
        provider_message_id,
        provider_type: provider_type.to_owned(),
        channel,
        timestamp: typed.event_time().unwrap_or_else(Utc::now),
        payload,
        webhook_signature: signature_header(provider_type, &raw_headers),
        raw_headers: Some(raw_headers),
    })
}

fn lowercase_headers(headers: &HeaderMap) -> RawHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_owned()))
        })
        .collect()
}

fn signature_header(provider_type: &str, headers: &RawHeaders) -> Option<String> {
    let name = match SignatureScheme::for_provider(provider_type) {
        SignatureScheme::TwilioSha1 => TWILIO_SIGNATURE_HEADER,
        SignatureScheme::HubSha256 => HUB_SIGNATURE_HEADER,
        SignatureScheme::SlackV0 => SLACK_SIGNATURE_HEADER,
        SignatureScheme::ChannelToken => CHANNEL_TOKEN_HEADER,
        SignatureScheme::Generic => GENERIC_SIGNATURE_HEADER,
    };
    headers.get(name).cloned()
}

/// Twilio posts form fields; everyone else posts JSON.
fn decode_body(provider_type: &str, body: &[u8]) -> Result<Value, String> {
    if provider_type == "twilio" {
        let fields: Map<String, Value> = url::form_urlencoded::parse(body)
            .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
            .collect();
        if fields.is_empty() {
            return Err("form body is empty".to_owned());
        }
        return Ok(Value::Object(fields));
    }

    let payload: Value =
        serde_json::from_slice(body).map_err(|error| format!("body is not valid JSON: {error}"))?;
    if payload.is_object() {
        Ok(payload)
    } else {
        Err("body must be a JSON object".to_owned())
    }
}
