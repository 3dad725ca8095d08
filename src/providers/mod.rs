//! Proctoring vendor adapters.
//!
//! The set of adapters is closed: configuration names a [`ProviderKind`] and
//! the registry builds the matching implementation from a lookup table built
//! at startup.

pub mod null;
pub mod software_secure;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::ProctoringSettings;
use crate::error::{Error, Result};
use crate::models::review::{NewReviewComment, ReviewVerdict};

pub use null::NullProvider;
pub use software_secure::SoftwareSecureProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    SoftwareSecure,
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub options: JsonValue,
    #[serde(default)]
    pub settings: HashMap<String, JsonValue>,
}

impl ProviderConfig {
    pub fn null() -> Self {
        Self {
            kind: ProviderKind::Null,
            options: JsonValue::Null,
            settings: HashMap::new(),
        }
    }
}

/// A vendor verdict normalised into the engine's vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpretedReview {
    pub verdict: ReviewVerdict,
    pub reviewed_by: Option<String>,
    pub comments: Vec<NewReviewComment>,
}

pub trait BackendProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Turns a raw vendor payload into a verdict. Malformed payloads fail with
    /// `ProviderError`.
    fn interpret_review(&self, raw_payload: &JsonValue) -> Result<InterpretedReview>;

    /// Vendor-specific acceptance checks run before a review is recorded.
    fn on_review_callback(
        &self,
        attempt_external_id: Option<&str>,
        raw_payload: &JsonValue,
    ) -> Result<()>;
}

/// Pulls the attempt code out of any supported payload shape.
pub fn attempt_code_in(raw_payload: &JsonValue) -> Option<String> {
    raw_payload
        .pointer("/examMetaData/examCode")
        .or_else(|| raw_payload.get("attempt_code"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub struct ProviderRegistry {
    configs: HashMap<String, ProviderConfig>,
    default_provider: String,
    cache: RwLock<HashMap<String, Arc<dyn BackendProvider>>>,
}

impl ProviderRegistry {
    pub fn new(settings: &ProctoringSettings) -> Self {
        Self {
            configs: settings.providers.clone(),
            default_provider: settings.default_provider.clone(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Resolves `name` (or the default provider) to an adapter. Instances are
    /// cached per name unless `ephemeral` is set, which always builds a fresh one.
    pub fn get(&self, name: Option<&str>, ephemeral: bool) -> Result<Arc<dyn BackendProvider>> {
        let name = name.unwrap_or(&self.default_provider);

        if !ephemeral {
            let cache = self
                .cache
                .read()
                .map_err(|_| Error::Internal("provider cache poisoned".into()))?;
            if let Some(provider) = cache.get(name) {
                return Ok(provider.clone());
            }
        }

        let provider = self.build(name)?;
        if !ephemeral {
            let mut cache = self
                .cache
                .write()
                .map_err(|_| Error::Internal("provider cache poisoned".into()))?;
            let cached = cache.entry(name.to_string()).or_insert(provider);
            return Ok(cached.clone());
        }
        Ok(provider)
    }

    fn build(&self, name: &str) -> Result<Arc<dyn BackendProvider>> {
        let config = self.configs.get(name).ok_or_else(|| {
            Error::ProviderError(format!("provider '{}' is not configured", name))
        })?;
        tracing::info!(provider = name, kind = ?config.kind, "instantiating proctoring provider");

        let provider: Arc<dyn BackendProvider> = match config.kind {
            ProviderKind::SoftwareSecure => Arc::new(SoftwareSecureProvider::from_options(
                name,
                &config.options,
            )?),
            ProviderKind::Null => Arc::new(NullProvider::new(name)),
        };
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ProviderRegistry {
        let mut settings = ProctoringSettings::default();
        settings.providers.insert(
            "software_secure".into(),
            ProviderConfig {
                kind: ProviderKind::SoftwareSecure,
                options: json!({}),
                settings: HashMap::new(),
            },
        );
        ProviderRegistry::new(&settings)
    }

    #[test]
    fn cached_instances_are_shared_and_ephemeral_ones_are_not() {
        let registry = registry();
        let first = registry.get(Some("software_secure"), false).unwrap();
        let second = registry.get(Some("software_secure"), false).unwrap();
        let fresh = registry.get(Some("software_secure"), true).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(fresh.name(), "software_secure");
    }

    #[test]
    fn missing_name_uses_default_provider() {
        let registry = registry();
        assert_eq!(registry.get(None, false).unwrap().name(), "null");
    }

    #[test]
    fn unknown_provider_is_a_provider_error() {
        let err = registry().get(Some("proctortrack"), false).err().unwrap();
        assert!(matches!(err, Error::ProviderError(_)));
    }

    #[test]
    fn attempt_code_found_in_both_payload_shapes() {
        assert_eq!(
            attempt_code_in(&json!({"examMetaData": {"examCode": "ABC"}})),
            Some("ABC".to_string())
        );
        assert_eq!(
            attempt_code_in(&json!({"attempt_code": "XYZ"})),
            Some("XYZ".to_string())
        );
        assert_eq!(attempt_code_in(&json!({"examMetaData": {}})), None);
    }
}
