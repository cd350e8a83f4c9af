use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

const CONSENT_KEY: &str = "vogue-ai-consent";

/// Where the cookie-banner decision lives. Kept outside the pipeline.
pub trait ConsentStore: Send + Sync {
    fn get(&self) -> bool;
    fn set(&self, consent_given: bool);
}

/// Process-wide key-value store; lost on restart.
#[derive(Default)]
pub struct MemoryConsentStore {
    entries: RwLock<HashMap<String, String>>,
}

impl ConsentStore for MemoryConsentStore {
    fn get(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(CONSENT_KEY)
            .is_some_and(|value| value == "true")
    }

    // A panicked writer cannot leave the map half-updated.
    fn set(&self, consent_given: bool) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if consent_given {
            entries.insert(CONSENT_KEY.to_string(), "true".to_string());
        } else {
            entries.remove(CONSENT_KEY);
        }
    }
}
