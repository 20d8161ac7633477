//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_AUDIO_FRAME_SIZE, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The audio defaults encode the wire contract of the telephony platform:
//! 640-byte frames every 20 ms of 16-bit linear PCM, behind a 44-byte WAV
//! header on each synthesized buffer. Changing them changes what the caller
//! hears, so they are configuration rather than hard-coded constants, but the
//! defaults are the values the platform actually negotiates.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub backend: BackendConfig,
    pub webhook: WebhookConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
/// - `port = 6000`: the port the telephony platform is configured to dial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Playback framing configuration.
///
/// ## Fields:
/// - `frame_size`: bytes per outbound audio frame (640 = 20 ms of 16 kHz
///   16-bit mono PCM)
/// - `frame_interval_ms`: real-time pacing between frames (20 ms)
/// - `header_len`: bytes to strip from the front of each synthesized buffer
///   (44 = standard uncompressed WAV header)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub frame_size: usize,
    pub frame_interval_ms: u64,
    pub header_len: usize,
}

impl AudioConfig {
    /// Frame pacing as a `Duration` for the playback scheduler.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Conversational-AI backend connection settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the AI backend that sessions are opened
///   against (e.g. "ws://127.0.0.1:7070")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
}

/// Turn-result webhook delivery settings.
///
/// ## Fields:
/// - `timeout_secs`: per-request timeout for outbound webhook POSTs. Delivery
///   is fire-and-forget, so this only bounds how long a spawned dispatch task
///   lives, never the audio path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_calls`: Maximum number of simultaneous bridged calls.
///   New socket connects beyond this limit are rejected with 503.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 6000, // the port the telephony platform dials
            },
            audio: AudioConfig {
                frame_size: 640,      // 20 ms of 16 kHz 16-bit mono PCM
                frame_interval_ms: 20,
                header_len: 44,       // standard WAV header
            },
            backend: BackendConfig {
                url: "ws://127.0.0.1:7070".to_string(),
            },
            webhook: WebhookConfig { timeout_secs: 10 },
            performance: PerformanceConfig {
                max_concurrent_calls: 50,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///    (deployment platforms set these without the APP_ prefix)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Frame size and interval are non-zero (a zero interval would spin the
    ///   scheduler, a zero frame size would never drain a buffer)
    /// - Backend URL is a ws:// or wss:// endpoint
    /// - At least one concurrent call is allowed
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size cannot be 0"));
        }

        if self.audio.frame_interval_ms == 0 {
            return Err(anyhow::anyhow!("Audio frame interval cannot be 0"));
        }

        if !self.backend.url.starts_with("ws://") && !self.backend.url.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Backend URL must be a ws:// or wss:// endpoint, got '{}'",
                self.backend.url
            ));
        }

        if self.webhook.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Webhook timeout must be greater than 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent calls must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example,
    /// `{"performance": {"max_concurrent_calls": 100}}` raises the call limit
    /// without touching anything else. The result is validated before it is
    /// accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                self.audio.frame_size = size as usize;
            }
            if let Some(interval) = audio.get("frame_interval_ms").and_then(|v| v.as_u64()) {
                self.audio.frame_interval_ms = interval;
            }
            if let Some(header) = audio.get("header_len").and_then(|v| v.as_u64()) {
                self.audio.header_len = header as usize;
            }
        }

        if let Some(backend) = partial_config.get("backend") {
            if let Some(url) = backend.get("url").and_then(|v| v.as_str()) {
                self.backend.url = url.to_string();
            }
        }

        if let Some(webhook) = partial_config.get("webhook") {
            if let Some(timeout) = webhook.get("timeout_secs").and_then(|v| v.as_u64()) {
                self.webhook.timeout_secs = timeout;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(calls) = performance
                .get("max_concurrent_calls")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_calls = calls as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
