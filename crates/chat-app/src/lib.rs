//! Multimodal streaming chat: the exchange aggregator, the submit-gated
//! session, and provider settings.

pub mod exchange;
pub mod session;
pub mod settings;

pub use exchange::{ERROR_FRAGMENT_TEXT, INPUT_IMAGE_MEDIA_TYPE};
pub use session::{ChatSession, ExchangeHandle, SubmitError};
pub use settings::{ProviderSettings, SettingsError, SettingsStore};
