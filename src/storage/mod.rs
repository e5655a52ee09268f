mod backend;
mod session_store;
mod settings_store;


pub use backend::{FileStorage, MemoryStorage, StateStorage};
pub use session_store::{ChatState, PersistedChat, SessionStore, CHAT_STORE_KEY};
pub use settings_store::{ApiSettings, PersistedSettings, SettingsStore, SETTINGS_KEY};
