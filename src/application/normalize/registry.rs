use std::{collections::HashMap, sync::Arc};

use serde_json::json;

use super::{GmailNormalizer, Normalizer, TwilioNormalizer, WhatsAppNormalizer};
use crate::domain::{
    error::{IngestionError, IngestionErrorCode},
    models::Channel,
};

/// Provider type → normalizer lookup, built once at startup.
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    normalizers: HashMap<String, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    /// Registry with the bundled providers. `business_identifiers` is keyed
    /// by provider type.
    #[must_use]
    pub fn builtin(business_identifiers: &HashMap<String, String>) -> Self {
        let business = |provider: &str| business_identifiers.get(provider).cloned();

        let mut registry = Self::default();
        registry.register("twilio", Arc::new(TwilioNormalizer::new(business("twilio"))));
        registry.register(
            "whatsapp",
            Arc::new(WhatsAppNormalizer::new(business("whatsapp"))),
        );
        registry.register("gmail", Arc::new(GmailNormalizer::new(business("gmail"))));
        registry
    }

    pub fn register(&mut self, provider_type: &str, normalizer: Arc<dyn Normalizer>) {
        self.normalizers
            .insert(provider_type.trim().to_ascii_lowercase(), normalizer);
    }

    pub fn get_normalizer(&self, provider_type: &str) -> Result<Arc<dyn Normalizer>, IngestionError> {
        self.normalizers
            .get(&provider_type.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                IngestionError::new(
                    IngestionErrorCode::ProviderNotSupported,
                    format!("provider type is not supported: {provider_type}"),
                    provider_type,
                )
                .with_details(json!({ "supportedProviders": self.supported_providers() }))
            })
    }

    #[must_use]
    pub fn is_provider_supported(&self, provider_type: &str) -> bool {
        self.normalizers
            .contains_key(&provider_type.trim().to_ascii_lowercase())
    }

    /// Registered provider types, sorted.
    #[must_use]
    pub fn supported_providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.normalizers.keys().cloned().collect();
        providers.sort();
        providers
    }

    #[must_use]
    pub fn channel_for_provider(&self, provider_type: &str) -> Option<Channel> {
        self.normalizers
            .get(&provider_type.trim().to_ascii_lowercase())
            .map(|normalizer| normalizer.config().channel)
    }
}
