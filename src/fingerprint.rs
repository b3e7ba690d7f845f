//! Device and environment fingerprint collection.
//!
//! Runs once per session before the first evaluation. Every probe is
//! isolated: an error, an unsupported capability or a timeout turns into the
//! field's anomalous sentinel rather than failing the snapshot, because an
//! unavailable signal is itself evidence.

use crate::config::FingerprintConfig;
use crate::error::ProbeError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Identity-string markers left by automation and headless tooling.
static AUTOMATION_UA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)headless|phantomjs|puppeteer|playwright|selenium|webdriver|electron|slimerjs|htmlunit|nightmare|cypress",
    )
    .expect("automation pattern is valid")
});

/// Renderer strings of software rasterizers and virtual GPUs.
static SOFTWARE_RENDERER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)swiftshader|llvmpipe|softpipe|mesa offscreen|software rasterizer|microsoft basic render|vmware|virtualbox|parallels|google inc\. \(google\)",
    )
    .expect("renderer pattern is valid")
});

/// Screen and viewport geometry in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayGeometry {
    pub screen_width: u32,
    pub screen_height: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub pixel_ratio: f64,
}

impl DisplayGeometry {
    /// True when the viewport cannot fit on the reported screen, or the
    /// screen reports no size at all.
    pub fn is_mismatched(&self, tolerance: f64) -> bool {
        if self.screen_width == 0 || self.screen_height == 0 || self.pixel_ratio <= 0.0 {
            return true;
        }
        let max_w = self.screen_width as f64 * (1.0 + tolerance);
        let max_h = self.screen_height as f64 * (1.0 + tolerance);
        self.viewport_width as f64 > max_w || self.viewport_height as f64 > max_h
    }
}

/// Immutable per-session environment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintSnapshot {
    /// Explicit automation flag exposed by the host
    pub webdriver: bool,
    /// Identity string matched an automation pattern
    pub automation_user_agent: bool,
    pub user_agent: Option<String>,
    pub display: Option<DisplayGeometry>,
    pub screen_mismatch: bool,
    pub timezone: Option<String>,
    pub gpu_renderer: Option<String>,
    /// Software renderer detected, or renderer unavailable
    pub gpu_anomaly: bool,
    pub audio_context: bool,
    pub font_count: u32,
    pub touch_support: bool,
    pub hardware_concurrency: Option<u32>,
    pub platform: Option<String>,
}

impl Default for FingerprintSnapshot {
    /// A coherent desktop environment with no anomalies.
    fn default() -> Self {
        Self {
            webdriver: false,
            automation_user_agent: false,
            user_agent: None,
            display: None,
            screen_mismatch: false,
            timezone: None,
            gpu_renderer: None,
            gpu_anomaly: false,
            audio_context: true,
            font_count: 40,
            touch_support: false,
            hardware_concurrency: None,
            platform: None,
        }
    }
}

/// A graphics context opened only to read the renderer string.
///
/// Dropping the context releases it.
pub trait GraphicsContext: Send {
    fn renderer(&self) -> Result<String, ProbeError>;
}

/// An audio context opened only to confirm audio processing works.
///
/// Dropping the context releases it.
pub trait AudioContext: Send {
    fn sample_rate(&self) -> Result<f64, ProbeError>;
}

/// Host capability probes.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn webdriver(&self) -> Result<bool, ProbeError>;
    async fn user_agent(&self) -> Result<String, ProbeError>;
    async fn display(&self) -> Result<DisplayGeometry, ProbeError>;
    async fn timezone(&self) -> Result<String, ProbeError>;
    async fn open_graphics_context(&self) -> Result<Box<dyn GraphicsContext>, ProbeError>;
    async fn open_audio_context(&self) -> Result<Box<dyn AudioContext>, ProbeError>;
    async fn font_count(&self) -> Result<u32, ProbeError>;
    async fn touch_support(&self) -> Result<bool, ProbeError>;
    async fn hardware_concurrency(&self) -> Result<u32, ProbeError>;
    async fn platform(&self) -> Result<String, ProbeError>;
}

/// Returns true if the identity string carries an automation marker.
pub fn matches_automation(user_agent: &str) -> bool {
    AUTOMATION_UA.is_match(user_agent)
}

/// Returns true if the renderer string names a software or virtual GPU.
pub fn is_software_renderer(renderer: &str) -> bool {
    SOFTWARE_RENDERER.is_match(renderer)
}

/// One-shot fingerprint collector.
pub struct FingerprintCollector {
    probe_timeout: Duration,
    screen_tolerance: f64,
}

impl FingerprintCollector {
    pub fn new(config: &FingerprintConfig) -> Self {
        Self {
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            screen_tolerance: config.screen_tolerance,
        }
    }

    /// Run every probe and assemble the snapshot. Never fails.
    pub async fn collect(&self, probe: &dyn EnvironmentProbe) -> FingerprintSnapshot {
        // Real browsers always expose both; failing to read either is flagged.
        let webdriver = self
            .guarded("webdriver", probe.webdriver())
            .await
            .unwrap_or(true);

        let user_agent = self.guarded("user_agent", probe.user_agent()).await.ok();
        let automation_user_agent = user_agent
            .as_deref()
            .map(matches_automation)
            .unwrap_or(true);

        let display = self.guarded("display", probe.display()).await.ok();
        let screen_mismatch = display
            .map(|d| d.is_mismatched(self.screen_tolerance))
            .unwrap_or(true);

        let timezone = self.guarded("timezone", probe.timezone()).await.ok();

        let gpu_renderer = self.read_renderer(probe).await;
        let gpu_anomaly = gpu_renderer
            .as_deref()
            .map(is_software_renderer)
            .unwrap_or(true);

        let audio_context = self.audio_available(probe).await;

        let font_count = self
            .guarded("fonts", probe.font_count())
            .await
            .unwrap_or(0);
        let touch_support = self
            .guarded("touch", probe.touch_support())
            .await
            .unwrap_or(false);
        let hardware_concurrency = self
            .guarded("hardware_concurrency", probe.hardware_concurrency())
            .await
            .ok();
        let platform = self.guarded("platform", probe.platform()).await.ok();

        let snapshot = FingerprintSnapshot {
            webdriver,
            automation_user_agent,
            user_agent,
            display,
            screen_mismatch,
            timezone,
            gpu_renderer,
            gpu_anomaly,
            audio_context,
            font_count,
            touch_support,
            hardware_concurrency,
            platform,
        };

        debug!(
            webdriver = snapshot.webdriver,
            automation_ua = snapshot.automation_user_agent,
            gpu_anomaly = snapshot.gpu_anomaly,
            audio = snapshot.audio_context,
            fonts = snapshot.font_count,
            "Fingerprint collected"
        );

        snapshot
    }

    async fn read_renderer(&self, probe: &dyn EnvironmentProbe) -> Option<String> {
        let context = self
            .guarded("graphics", probe.open_graphics_context())
            .await
            .ok()?;
        let renderer = context.renderer();
        drop(context);
        match renderer {
            Ok(r) if !r.trim().is_empty() => Some(r),
            Ok(_) => None,
            Err(e) => {
                debug!(probe = "graphics", error = %e, "Renderer unavailable");
                None
            }
        }
    }

    async fn audio_available(&self, probe: &dyn EnvironmentProbe) -> bool {
        let context = match self.guarded("audio", probe.open_audio_context()).await {
            Ok(c) => c,
            Err(_) => return false,
        };
        let rate = context.sample_rate();
        drop(context);
        matches!(rate, Ok(r) if r > 0.0)
    }

    async fn guarded<T>(
        &self,
        name: &'static str,
        fut: impl Future<Output = Result<T, ProbeError>>,
    ) -> Result<T, ProbeError> {
        let result = match tokio::time::timeout(self.probe_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ProbeError::Timeout),
        };
        if let Err(ref e) = result {
            debug!(probe = name, error = %e, "Probe degraded to sentinel");
        }
        result
    }
}

impl Default for FingerprintCollector {
    fn default() -> Self {
        Self::new(&FingerprintConfig::default())
    }
}

/// Probe answers recorded ahead of time, for replay and embedding hosts
/// that gather signals before constructing the engine.
///
/// Absent fields behave as unsupported capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticProbe {
    pub webdriver: Option<bool>,
    pub user_agent: Option<String>,
    pub display: Option<DisplayGeometry>,
    pub timezone: Option<String>,
    pub gpu_renderer: Option<String>,
    pub audio_sample_rate: Option<f64>,
    pub font_count: Option<u32>,
    pub touch_support: Option<bool>,
    pub hardware_concurrency: Option<u32>,
    pub platform: Option<String>,
}

impl StaticProbe {
    /// Answers of an ordinary desktop browser.
    pub fn desktop() -> Self {
        Self {
            webdriver: Some(false),
            user_agent: Some(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/126.0 Safari/537.36"
                    .to_string(),
            ),
            display: Some(DisplayGeometry {
                screen_width: 1920,
                screen_height: 1080,
                viewport_width: 1600,
                viewport_height: 900,
                pixel_ratio: 1.0,
            }),
            timezone: Some("Europe/Berlin".to_string()),
            gpu_renderer: Some("ANGLE (NVIDIA GeForce RTX 3060)".to_string()),
            audio_sample_rate: Some(48_000.0),
            font_count: Some(52),
            touch_support: Some(false),
            hardware_concurrency: Some(8),
            platform: Some("Linux x86_64".to_string()),
        }
    }
}

struct StaticGraphics(String);

impl GraphicsContext for StaticGraphics {
    fn renderer(&self) -> Result<String, ProbeError> {
        Ok(self.0.clone())
    }
}

struct StaticAudio(f64);

impl AudioContext for StaticAudio {
    fn sample_rate(&self) -> Result<f64, ProbeError> {
        Ok(self.0)
    }
}

fn present<T: Clone>(value: &Option<T>) -> Result<T, ProbeError> {
    value.clone().ok_or(ProbeError::Unsupported)
}

#[async_trait]
impl EnvironmentProbe for StaticProbe {
    async fn webdriver(&self) -> Result<bool, ProbeError> {
        present(&self.webdriver)
    }

    async fn user_agent(&self) -> Result<String, ProbeError> {
        present(&self.user_agent)
    }

    async fn display(&self) -> Result<DisplayGeometry, ProbeError> {
        present(&self.display)
    }

    async fn timezone(&self) -> Result<String, ProbeError> {
        present(&self.timezone)
    }

    async fn open_graphics_context(&self) -> Result<Box<dyn GraphicsContext>, ProbeError> {
        let renderer = present(&self.gpu_renderer)?;
        Ok(Box::new(StaticGraphics(renderer)))
    }

    async fn open_audio_context(&self) -> Result<Box<dyn AudioContext>, ProbeError> {
        let rate = present(&self.audio_sample_rate)?;
        Ok(Box::new(StaticAudio(rate)))
    }

    async fn font_count(&self) -> Result<u32, ProbeError> {
        present(&self.font_count)
    }

    async fn touch_support(&self) -> Result<bool, ProbeError> {
        present(&self.touch_support)
    }

    async fn hardware_concurrency(&self) -> Result<u32, ProbeError> {
        present(&self.hardware_concurrency)
    }

    async fn platform(&self) -> Result<String, ProbeError> {
        present(&self.platform)
    }
}
