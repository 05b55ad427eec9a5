//! Connection configuration.
//!
//! Everything here is fixed for the lifetime of a connection. All types are
//! serde-friendly with `camelCase` keys and durations in milliseconds, so a
//! configuration can be loaded from JSON:
//!
//! ```
//! use sdl_proxy::config::ConnectionConfig;
//!
//! let config = ConnectionConfig::from_json(r#"{
//!     "app": { "appName": "Radio", "appId": "8675309", "appType": "MEDIA" },
//!     "requestTimeout": 2000,
//!     "reconnect": { "maxAttempts": 5 }
//! }"#).unwrap();
//!
//! assert!(config.app.is_media());
//! assert_eq!(config.request_timeout.as_millis(), 2000);
//! assert_eq!(config.reconnect.max_attempts, 5);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, MAX_PROTOCOL_VERSION};
use crate::rpc::{function_id, RpcEnvelope, DEFAULT_MAX_CORRELATION_ID, DEFAULT_REQUEST_TIMEOUT};
use crate::writer::WriterConfig;

/// Default deadline sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// RPC message version announced at registration.
const SYNC_MSG_MAJOR_VERSION: u32 = 5;
const SYNC_MSG_MINOR_VERSION: u32 = 0;

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Category the app presents itself as on the head unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppHmiType {
    #[default]
    Default,
    Communication,
    Media,
    Messaging,
    Navigation,
    Information,
    Social,
    BackgroundProcess,
    Testing,
    System,
}

impl AppHmiType {
    /// Media and navigation apps are treated as media apps.
    pub fn is_media(self) -> bool {
        matches!(self, AppHmiType::Media | AppHmiType::Navigation)
    }

    fn wire_name(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// How the app identifies itself when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppIdentity {
    pub app_name: String,
    pub app_id: String,
    /// Abbreviated name for constrained displays.
    pub short_app_name: Option<String>,
    pub tts_name: Vec<String>,
    pub voice_recognition_synonyms: Vec<String>,
    pub app_type: AppHmiType,
    /// Desired language, e.g. `EN-US`.
    pub language: String,
}

impl Default for AppIdentity {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            app_id: String::new(),
            short_app_name: None,
            tts_name: Vec::new(),
            voice_recognition_synonyms: Vec::new(),
            app_type: AppHmiType::Default,
            language: "EN-US".to_string(),
        }
    }
}

impl AppIdentity {
    pub fn new(app_name: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    pub fn with_app_type(mut self, app_type: AppHmiType) -> Self {
        self.app_type = app_type;
        self
    }

    pub fn with_short_name(mut self, name: impl Into<String>) -> Self {
        self.short_app_name = Some(name.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_tts_name(mut self, chunks: &[&str]) -> Self {
        self.tts_name = chunks.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_voice_recognition_synonyms(mut self, synonyms: &[&str]) -> Self {
        self.voice_recognition_synonyms = synonyms.iter().map(|s| s.to_string()).collect();
        self
    }

    #[inline]
    pub fn is_media(&self) -> bool {
        self.app_type.is_media()
    }

    /// Build the `RegisterAppInterface` request for this identity.
    pub fn registration_request(&self) -> RpcEnvelope {
        let mut envelope = RpcEnvelope::request(function_id::REGISTER_APP_INTERFACE)
            .with_param(
                "syncMsgVersion",
                json!({
                    "majorVersion": SYNC_MSG_MAJOR_VERSION,
                    "minorVersion": SYNC_MSG_MINOR_VERSION,
                }),
            )
            .with_param("appName", self.app_name.clone())
            .with_param("isMediaApplication", self.is_media())
            .with_param("languageDesired", self.language.clone())
            .with_param("hmiDisplayLanguageDesired", self.language.clone())
            .with_param("appHMIType", json!([self.app_type.wire_name()]))
            .with_param("appID", self.app_id.clone());

        if let Some(short) = &self.short_app_name {
            envelope = envelope.with_param("ngnMediaScreenAppName", short.clone());
        }
        if !self.tts_name.is_empty() {
            let chunks: Vec<Value> = self
                .tts_name
                .iter()
                .map(|text| json!({ "text": text, "type": "TEXT" }))
                .collect();
            envelope = envelope.with_param("ttsName", chunks);
        }
        if !self.voice_recognition_synonyms.is_empty() {
            envelope = envelope.with_param("vrSynonyms", self.voice_recognition_synonyms.clone());
        }
        envelope
    }
}

/// Reconnect behavior after an unexpected transport loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub app: AppIdentity,
    /// Default deadline for requests sent without an explicit timeout.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Largest frame the transport accepts, header included.
    pub max_frame_size: usize,
    /// Highest protocol version offered during negotiation.
    pub max_protocol_version: u8,
    pub max_correlation_id: u32,
    pub reconnect: ReconnectPolicy,
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            app: AppIdentity::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_protocol_version: MAX_PROTOCOL_VERSION,
            max_correlation_id: DEFAULT_MAX_CORRELATION_ID,
            reconnect: ReconnectPolicy::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
