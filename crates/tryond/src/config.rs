use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tryon_core::{GeometryParams, ProviderOptions, RetryPolicy, SessionConfig, Storefront};

/// Daemon configuration: an optional TOML file (`TRYON_CONFIG`) overlaid by
/// `TRYON_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path; `None` picks the first capture device.
    pub camera_device: Option<String>,
    /// Directory containing the face mesh ONNX models.
    pub model_dir: PathBuf,
    /// Use the attention face mesh model (refined eye and lip landmarks).
    pub refine_landmarks: bool,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Landmark provider load attempts before giving up.
    pub provider_attempts: u32,
    pub provider_retry_delay_ms: u64,
    /// Timeout for camera acquisition and for the first frame.
    pub camera_timeout_secs: u64,
    /// How long teardown waits for an in-flight frame.
    pub teardown_grace_ms: u64,
    /// Storefront backend that serves product images under `/api/uploads/`.
    pub backend_url: String,
    /// Storefront public assets; the no-image placeholder lives here.
    pub asset_root: String,
    pub geometry: GeometryParams,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("tryon");

        Self {
            camera_device: None,
            model_dir: data_dir.join("models"),
            refine_landmarks: true,
            canvas_width: 640,
            canvas_height: 480,
            provider_attempts: 5,
            provider_retry_delay_ms: 200,
            camera_timeout_secs: 10,
            teardown_grace_ms: 500,
            backend_url: "http://localhost:8080".to_string(),
            asset_root: "http://localhost:3000".to_string(),
            geometry: GeometryParams::default(),
        }
    }
}

impl Config {
    /// Load the TOML file named by `TRYON_CONFIG` (if any), then apply
    /// `TRYON_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("TRYON_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                Self::from_toml(&text).with_context(|| format!("invalid config file {path}"))?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.parse().ok());

        if let Some(device) = lookup("TRYON_CAMERA_DEVICE").filter(|v| !v.is_empty()) {
            self.camera_device = Some(device);
        }
        if let Some(dir) = lookup("TRYON_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(refine) = lookup("TRYON_REFINE_LANDMARKS") {
            self.refine_landmarks = refine != "0";
        }
        if let Some(url) = lookup("TRYON_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(root) = lookup("TRYON_ASSET_ROOT") {
            self.asset_root = root;
        }
        self.canvas_width = parsed("TRYON_CANVAS_WIDTH").unwrap_or(self.canvas_width);
        self.canvas_height = parsed("TRYON_CANVAS_HEIGHT").unwrap_or(self.canvas_height);
        self.provider_attempts = parsed("TRYON_PROVIDER_ATTEMPTS").unwrap_or(self.provider_attempts);
        self.provider_retry_delay_ms =
            parsed("TRYON_PROVIDER_RETRY_DELAY_MS").unwrap_or(self.provider_retry_delay_ms);
        self.camera_timeout_secs = parsed("TRYON_CAMERA_TIMEOUT_SECS").unwrap_or(self.camera_timeout_secs);
        self.teardown_grace_ms = parsed("TRYON_TEARDOWN_GRACE_MS").unwrap_or(self.teardown_grace_ms);
    }

    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            refine_landmarks: self.refine_landmarks,
            ..ProviderOptions::with_model_dir(&self.model_dir)
        }
    }

    pub fn storefront(&self) -> Storefront {
        Storefront {
            backend_url: self.backend_url.clone(),
            asset_root: self.asset_root.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            canvas_width: self.canvas_width,
            canvas_height: self.canvas_height,
            retry: RetryPolicy {
                attempts: self.provider_attempts,
                delay: Duration::from_millis(self.provider_retry_delay_ms),
            },
            geometry: self.geometry,
            camera_timeout: Duration::from_secs(self.camera_timeout_secs),
            teardown_grace: Duration::from_millis(self.teardown_grace_ms),
        }
    }
}
