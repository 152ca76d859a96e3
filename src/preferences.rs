#![forbid(unsafe_code)]

// Preference store - simple key-value settings shared with the UI layer

use std::collections::HashMap;
use std::sync::RwLock;

const KEY_STAGE_ID: &str = "stage_id";
const KEY_AVATAR: &str = "avatar";
const KEY_BITRATE: &str = "bitrate";
const KEY_CUSTOMER_CODE: &str = "customer_code";
const KEY_API_KEY: &str = "api_key";

/// Local settings. Implementations only need get/set of strings; the typed
/// accessors are provided.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: Option<String>);

    /// Local user identity, which is also the id of any stage the user creates
    fn stage_id(&self) -> Option<String> {
        self.get(KEY_STAGE_ID)
    }

    fn set_stage_id(&self, stage_id: Option<String>) {
        self.set(KEY_STAGE_ID, stage_id);
    }

    fn avatar(&self) -> Option<String> {
        self.get(KEY_AVATAR)
    }

    fn set_avatar(&self, avatar: Option<String>) {
        self.set(KEY_AVATAR, avatar);
    }

    fn bitrate(&self) -> Option<u32> {
        self.get(KEY_BITRATE).and_then(|v| v.parse().ok())
    }

    fn set_bitrate(&self, bitrate: Option<u32>) {
        self.set(KEY_BITRATE, bitrate.map(|b| b.to_string()));
    }

    fn customer_code(&self) -> Option<String> {
        self.get(KEY_CUSTOMER_CODE)
    }

    fn set_customer_code(&self, code: Option<String>) {
        self.set(KEY_CUSTOMER_CODE, code);
    }

    fn api_key(&self) -> Option<String> {
        self.get(KEY_API_KEY)
    }

    fn set_api_key(&self, key: Option<String>) {
        self.set(KEY_API_KEY, key);
    }
}

/// In-memory preference store
#[derive(Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn with_stage_id(stage_id: impl Into<String>) -> Self {
        let prefs = Self::default();
        prefs.set_stage_id(Some(stage_id.into()));
        prefs
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<String>) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        match value {
            Some(v) => {
                values.insert(key.to_string(), v);
            }
            None => {
                values.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let prefs = MemoryPreferences::with_stage_id("alice");
        assert_eq!(prefs.stage_id().as_deref(), Some("alice"));

        prefs.set_bitrate(Some(900_000));
        assert_eq!(prefs.bitrate(), Some(900_000));

        prefs.set("bitrate", Some("fast".to_string()));
        assert_eq!(prefs.bitrate(), None);

        prefs.set_api_key(Some("k".to_string()));
        prefs.set_api_key(None);
        assert!(prefs.api_key().is_none());
    }
}
