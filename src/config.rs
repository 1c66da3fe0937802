//! Engine configuration and the per-session app descriptor.
//!
//! [`EngineConfig`] carries buffer geometry and timeouts and is normally loaded
//! once from YAML. [`AppDescriptor`] describes the cloud app to launch and is
//! supplied on every `start`/`resume`.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::logging::LogConfig;
use crate::{Result, VcsError};

/// Engine-wide settings. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub screen_width: u32,
    pub screen_height: u32,
    pub buffers: BufferConfig,
    pub timeouts: TimeoutConfig,
    /// Skip certificate validation for the routing service.
    pub accept_invalid_certs: bool,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            screen_width: 1920,
            screen_height: 1080,
            buffers: BufferConfig::default(),
            timeouts: TimeoutConfig::default(),
            accept_invalid_certs: false,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| VcsError::parse_error("engine config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| VcsError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(VcsError::config_error("screen size must be non-zero"));
        }
        self.buffers.validate()?;
        if self.accept_invalid_certs {
            warn!("Certificate validation disabled for the routing service");
        }
        Ok(())
    }

    /// Bytes in one decompressed alpha plane.
    pub fn alpha_plane_size(&self) -> usize {
        self.screen_width as usize * self.screen_height as usize
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.screen_width, self.screen_height)
    }
}

/// Media buffer and alpha pool geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub audio_capacity: usize,
    pub audio_slot_size: usize,
    pub video_capacity: usize,
    pub video_slot_size: usize,
    pub alpha_capacity: usize,
    pub alpha_slot_size: usize,
    pub alpha_pool_capacity: usize,
    pub alpha_pool_preallocated: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            audio_capacity: 10,
            audio_slot_size: 8 * 1024,
            video_capacity: 10,
            video_slot_size: 700 * 1024,
            alpha_capacity: 10,
            alpha_slot_size: 200 * 1024,
            alpha_pool_capacity: 15,
            alpha_pool_preallocated: 5,
        }
    }
}

impl BufferConfig {
    fn validate(&self) -> Result<()> {
        for (name, capacity) in
            [("audio", self.audio_capacity), ("video", self.video_capacity), ("alpha", self.alpha_capacity)]
        {
            // One slot always stays empty to tell full from empty.
            if capacity < 2 {
                return Err(VcsError::config_error(format!("{} buffer capacity must be at least 2", name)));
            }
        }
        if self.audio_slot_size == 0 || self.video_slot_size == 0 || self.alpha_slot_size == 0 {
            return Err(VcsError::config_error("buffer slot sizes must be non-zero"));
        }
        if self.alpha_pool_preallocated > self.alpha_pool_capacity {
            return Err(VcsError::config_error("alpha pool pre-allocation exceeds its capacity"));
        }
        Ok(())
    }
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub socket_read_ms: u64,
    pub keep_alive_ms: u64,
    pub http_ms: u64,
    pub disconnect_grace_ms: u64,
    pub decoder_stop_ms: u64,
    pub quality_report_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2000,
            socket_read_ms: 2000,
            keep_alive_ms: 2000,
            http_ms: 4000,
            disconnect_grace_ms: 500,
            decoder_stop_ms: 2000,
            quality_report_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn socket_read(&self) -> Duration {
        Duration::from_millis(self.socket_read_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn http(&self) -> Duration {
        Duration::from_millis(self.http_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn decoder_stop(&self) -> Duration {
        Duration::from_millis(self.decoder_stop_ms)
    }

    pub fn quality_report(&self) -> Duration {
        Duration::from_millis(self.quality_report_ms)
    }
}

/// Message format used between the host web app and the cloud app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceFormat {
    #[default]
    Xml,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/avc",
            VideoCodec::H265 => "video/hevc",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H264"),
            VideoCodec::H265 => write!(f, "H265"),
        }
    }
}

/// Alpha compression requested from the server in the start-app envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlphaCompressionType {
    Lz4,
    #[default]
    Lz4hc,
    Zip,
}

impl fmt::Display for AlphaCompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlphaCompressionType::Lz4 => write!(f, "lz4"),
            AlphaCompressionType::Lz4hc => write!(f, "lz4hc"),
            AlphaCompressionType::Zip => write!(f, "zip"),
        }
    }
}

/// Highest debug session index the web app accepts.
pub const MAX_DEBUG_SESSION_INDEX: u8 = 8;

/// Describes the cloud app to launch and how to reach its server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppDescriptor {
    pub stb_model: String,
    /// Device id sent on every control and streaming connection.
    pub mac_address: String,
    pub svc_id: String,
    pub web_app_version: String,
    pub web_app_url: String,
    /// Resolved through the routing service when unset.
    pub public_ip: Option<String>,
    /// Label for the time-to-first-frame log. Reported once.
    pub initiate_type: Option<String>,
    pub auth_val: String,
    pub api_key: String,
    pub app_id: String,
    pub so_code: Option<String>,

    pub csr_url: String,
    pub use_csr: bool,
    /// Ask the routing service to bypass its route cache on the next request.
    pub clear_csr_cache: bool,

    /// Direct server address, used when routing is disabled.
    pub vcs_ip: Option<String>,
    pub vcs_port: u16,

    pub use_referrer: bool,
    pub referrer_ip: String,
    pub referrer_port: u16,

    pub enable_info_log: bool,
    pub interface_format: InterfaceFormat,
    /// Web app debug session index, `0..=8`.
    pub debug_session_index: Option<u8>,

    pub video_codec: VideoCodec,
    pub video_fps: u32,
    pub video_bitrate_kb: u32,
    pub compression_type: AlphaCompressionType,
}

impl Default for AppDescriptor {
    fn default() -> Self {
        Self {
            stb_model: String::new(),
            mac_address: String::new(),
            svc_id: String::new(),
            web_app_version: String::new(),
            web_app_url: String::new(),
            public_ip: None,
            initiate_type: None,
            auth_val: String::new(),
            api_key: String::new(),
            app_id: String::new(),
            so_code: None,
            csr_url: String::new(),
            use_csr: false,
            clear_csr_cache: false,
            vcs_ip: None,
            vcs_port: 0,
            use_referrer: false,
            referrer_ip: String::new(),
            referrer_port: 0,
            enable_info_log: false,
            interface_format: InterfaceFormat::Xml,
            debug_session_index: None,
            video_codec: VideoCodec::H264,
            video_fps: 30,
            video_bitrate_kb: 5000,
            compression_type: AlphaCompressionType::Lz4hc,
        }
    }
}

impl AppDescriptor {
    /// Descriptor for a directly addressed server.
    pub fn direct(mac_address: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self { mac_address: mac_address.into(), vcs_ip: Some(ip.into()), vcs_port: port, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mac_address.trim().is_empty() {
            return Err(VcsError::config_error("mac_address is required"));
        }
        if self.use_csr {
            if self.csr_url.trim().is_empty() {
                return Err(VcsError::config_error("csr_url is required when routing is enabled"));
            }
        } else if self.vcs_ip.as_deref().is_none_or(|ip| ip.trim().is_empty()) || self.vcs_port == 0 {
            return Err(VcsError::config_error("vcs_ip and vcs_port are required when routing is disabled"));
        }
        if self.use_referrer && self.referrer_ip.trim().is_empty() {
            return Err(VcsError::config_error("referrer_ip is required when the referrer is enabled"));
        }
        if self.debug_session_index.is_some_and(|index| index > MAX_DEBUG_SESSION_INDEX) {
            return Err(VcsError::config_error(format!(
                "debug_session_index must be at most {}",
                MAX_DEBUG_SESSION_INDEX
            )));
        }
        if self.video_fps == 0 {
            return Err(VcsError::config_error("video_fps must be non-zero"));
        }
        Ok(())
    }

    pub fn referrer_address(&self) -> String {
        format!("{}:{}", self.referrer_ip, self.referrer_port)
    }

    /// Logs the descriptor, at info level when the descriptor asks for it.
    pub fn log_summary(&self) {
        let server = match &self.vcs_ip {
            Some(ip) => format!("{}:{}", ip, self.vcs_port),
            None => "none".to_string(),
        };
        if self.enable_info_log {
            info!(
                stb_model = %self.stb_model,
                mac = %self.mac_address,
                svc_id = %self.svc_id,
                app_id = %self.app_id,
                format = ?self.interface_format,
                server = %server,
                use_csr = self.use_csr,
                use_referrer = self.use_referrer,
                "App descriptor"
            );
        } else {
            debug!(mac = %self.mac_address, app_id = %self.app_id, server = %server, use_csr = self.use_csr, "App descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result, ensure};

    #[test]
    fn defaults_match_engine_geometry() {
        let config = EngineConfig::default();
        assert_eq!(config.buffers.video_slot_size, 700 * 1024);
        assert_eq!(config.buffers.audio_slot_size, 8 * 1024);
        assert_eq!(config.alpha_plane_size(), 1920 * 1080);
        assert_eq!(config.timeouts.connect(), Duration::from_millis(2000));
        assert!(!config.accept_invalid_certs);
        assert_eq!(config.resolution(), "1920x1080");
    }

    #[test]
    fn partial_yaml_keeps_defaults() -> Result<()> {
        let config = EngineConfig::from_yaml_str(
            "screen_width: 1280\nscreen_height: 720\ntimeouts:\n  http_ms: 3000\nlog:\n  level: debug\n",
        )
        .context("config should parse")?;
        ensure!(config.screen_width == 1280);
        ensure!(config.timeouts.http() == Duration::from_millis(3000));
        ensure!(config.timeouts.connect_ms == 2000);
        ensure!(config.buffers == BufferConfig::default());
        ensure!(config.log.level == "debug");
        Ok(())
    }

    #[test]
    fn invalid_yaml_and_geometry_rejected() {
        assert!(matches!(EngineConfig::from_yaml_str("screen_width: [1"), Err(VcsError::Parse { .. })));
        assert!(matches!(
            EngineConfig::from_yaml_str("buffers:\n  video_capacity: 1\n"),
            Err(VcsError::Config { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::from_path("/nonexistent/vcs.yaml").unwrap_err();
        assert!(matches!(err, VcsError::File { .. }));
    }

    #[test]
    fn descriptor_yaml_uses_lowercase_enums() -> Result<()> {
        let descriptor: AppDescriptor = serde_yaml_ng::from_str(
            "mac_address: \"00:11:22:33:44:55\"\nvcs_ip: \"10.0.0.1\"\nvcs_port: 8000\ninterface_format: json\nvideo_codec: H265\ncompression_type: zip\n",
        )?;
        ensure!(descriptor.interface_format == InterfaceFormat::Json);
        ensure!(descriptor.video_codec == VideoCodec::H265);
        ensure!(descriptor.compression_type.to_string() == "zip");
        descriptor.validate()?;
        Ok(())
    }

    #[test]
    fn descriptor_validation() {
        assert!(AppDescriptor::direct("aa:bb", "10.0.0.1", 9000).validate().is_ok());
        assert!(AppDescriptor::direct("", "10.0.0.1", 9000).validate().is_err());
        assert!(AppDescriptor::direct("aa:bb", "10.0.0.1", 0).validate().is_err());

        let routed = AppDescriptor { mac_address: "aa:bb".into(), use_csr: true, ..AppDescriptor::default() };
        assert!(routed.validate().is_err());
        let routed = AppDescriptor { csr_url: "https://csr.example".into(), ..routed };
        assert!(routed.validate().is_ok());

        let debug = AppDescriptor { debug_session_index: Some(9), ..AppDescriptor::direct("aa", "h", 1) };
        assert!(debug.validate().is_err());
    }
}
