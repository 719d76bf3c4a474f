//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and TOML/env/JSON
//! - **derive macros**: Automatically generate Debug, Clone, Serialize, Deserialize
//! - **Result<T, E>**: Every loading step can fail and is propagated with `?`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GEMINI_API_KEY`, `API_KEY` (deployment platform conventions)
//! 2. Environment variables (APP_SERVER__PORT, APP_CALL__VOICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::pcm::MediaType;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default Gemini Live endpoint (bidirectional streaming over WebSocket).
pub const DEFAULT_ENDPOINT_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (HTTP server, voice calls, chat rooms,
/// capacity limits) and to one `[section]` table in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub call: CallConfig,
    pub rooms: RoomsConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Voice call settings.
///
/// ## Fields:
/// - `endpoint_url`: WebSocket URL of the conversational audio endpoint
/// - `api_key`: credential for the endpoint (never serialized back out)
/// - `model` / `voice`: remote model identifier and prebuilt voice name
/// - `input_sample_rate`: capture rate A (microphone → remote)
/// - `output_sample_rate`: playback rate B (remote → speaker)
/// - `frame_size`: samples per capture frame
/// - `outbound_queue_capacity`: packets buffered toward the network before
///   new ones are dropped
/// - `connect_timeout_ms`: upper bound on remote session setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub endpoint_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub outbound_queue_capacity: usize,
    pub connect_timeout_ms: u64,
}

impl CallConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Media type tag for outbound packets, e.g. `audio/pcm;rate=16000`.
    pub fn input_media_type(&self) -> MediaType {
        MediaType::pcm(self.input_sample_rate)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().map_or(false, |key| !key.trim().is_empty())
    }
}

/// Chat room settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Oldest messages are evicted beyond this many per room
    pub max_messages_per_room: usize,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            call: CallConfig {
                endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
                api_key: None,
                model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                voice: "Kore".to_string(),
                input_sample_rate: 16000,
                output_sample_rate: 24000,
                frame_size: 4096,          // ~256ms per frame at 16kHz
                outbound_queue_capacity: 32,
                connect_timeout_ms: 10_000,
            },
            rooms: RoomsConfig {
                max_messages_per_room: 500,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_CALL__VOICE=Puck`: Override the remote voice
    /// - `APP_PERFORMANCE__MAX_CONCURRENT_CALLS=50`: Raise the call limit
    /// - `GEMINI_API_KEY=...`: Endpoint credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = env::var("GEMINI_API_KEY").ok().or_else(|| env::var("API_KEY").ok()) {
            settings = settings.set_override("call.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing API key is not an error here: the server still serves rooms,
    /// and calls fail at connect time with a clear message.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.call.endpoint_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Call endpoint URL cannot be empty"));
        }

        if self.call.input_sample_rate == 0 || self.call.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Call sample rates must be greater than 0"));
        }

        if self.call.frame_size == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.call.outbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Outbound queue capacity must be greater than 0"));
        }

        if self.call.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.rooms.max_messages_per_room == 0 {
            return Err(anyhow::anyhow!("Room history size must be greater than 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example `{"call": {"voice": "Puck"}}`
    /// changes only the voice used by calls started afterwards.
    /// The endpoint URL and API key are fixed at startup and not updatable here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(call) = partial_config.get("call") {
            if let Some(model) = call.get("model").and_then(|v| v.as_str()) {
                updated.call.model = model.to_string();
            }
            if let Some(voice) = call.get("voice").and_then(|v| v.as_str()) {
                updated.call.voice = voice.to_string();
            }
            if let Some(capacity) = call.get("outbound_queue_capacity").and_then(|v| v.as_u64()) {
                updated.call.outbound_queue_capacity = capacity as usize;
            }
            if let Some(timeout) = call.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                updated.call.connect_timeout_ms = timeout;
            }
        }

        if let Some(rooms) = partial_config.get("rooms") {
            if let Some(max) = rooms.get("max_messages_per_room").and_then(|v| v.as_u64()) {
                updated.rooms.max_messages_per_room = max as usize;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(calls) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_calls = calls as usize;
            }
        }

        // Only commit when the result is still valid
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
