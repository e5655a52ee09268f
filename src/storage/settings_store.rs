use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use super::backend::{load_json, save_json, StateStorage};
use crate::client::WorkflowClient;
use crate::core::config::AppConfig;
use crate::core::workflow::TenantInfo;

/// Storage key of the persisted settings document.
pub const SETTINGS_KEY: &str = "agent-settings-storage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSettings {
    pub api_base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSettings {
    pub api_settings: ApiSettings,
    #[serde(default)]
    pub tenant_info: Option<TenantInfo>,
}

impl PersistedSettings {
    /// Used until a settings document has been saved.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            api_settings: ApiSettings {
                api_base: config.api_base.clone(),
            },
            tenant_info: config.tenant.clone(),
        }
    }
}

/// API base URL and tenant identifiers, persisted independently of chat state.
pub struct SettingsStore {
    state: Mutex<PersistedSettings>,
    storage: Arc<dyn StateStorage>,
}

impl SettingsStore {
    /// Restore the saved document, falling back to `defaults`.
    pub fn open(storage: Arc<dyn StateStorage>, defaults: PersistedSettings) -> Self {
        let state = match load_json(&*storage, SETTINGS_KEY) {
            Ok(Some(state)) => state,
            Ok(None) => defaults,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable settings");
                defaults
            }
        };

        Self {
            state: Mutex::new(state),
            storage,
        }
    }

    pub fn snapshot(&self) -> PersistedSettings {
        self.lock().clone()
    }

    pub fn api_settings(&self) -> ApiSettings {
        self.lock().api_settings.clone()
    }

    pub fn set_api_settings(&self, settings: ApiSettings) {
        let mut state = self.lock();
        state.api_settings = settings;
        self.persist(&state);
    }

    pub fn tenant_info(&self) -> Option<TenantInfo> {
        self.lock().tenant_info.clone()
    }

    pub fn set_tenant_info(&self, tenant: Option<TenantInfo>) {
        let mut state = self.lock();
        state.tenant_info = tenant;
        self.persist(&state);
    }

    /// Point `client` at the stored base URL and tenant.
    pub fn apply_to(&self, client: &WorkflowClient) {
        let state = self.snapshot();
        client.set_base_url(state.api_settings.api_base);
        client.set_tenant(state.tenant_info);
    }

    fn persist(&self, state: &PersistedSettings) {
        if let Err(e) = save_json(&*self.storage, SETTINGS_KEY, state) {
            tracing::warn!(error = %e, "failed to persist settings");
        }
    }

    fn lock(&self) -> MutexGuard<'_, PersistedSettings> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
