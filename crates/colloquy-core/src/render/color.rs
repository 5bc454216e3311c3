use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::GlobalSettings;
use crate::constants::{AGENT_COLOR_KIND, USER_COLOR_ID, USER_COLOR_KIND};
use crate::error::Result;

const SAMPLE_SIZE: u32 = 30;
const AGENT_CONFIG_FILE: &str = "config.json";

/// Extracts a representative accent color from an avatar image.
#[async_trait]
pub trait ColorSampler: Send + Sync {
    async fn sample(&self, image_url: &str) -> Option<String>;
}

/// Whose accent color is being saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorTarget {
    User,
    Agent(String),
}

impl ColorTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            ColorTarget::User => USER_COLOR_KIND,
            ColorTarget::Agent(_) => AGENT_COLOR_KIND,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ColorTarget::User => USER_COLOR_ID,
            ColorTarget::Agent(id) => id,
        }
    }
}

#[async_trait]
pub trait ColorPersister: Send + Sync {
    async fn persist_color(&self, target: &ColorTarget, color: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopColorPersister;

#[async_trait]
impl ColorPersister for NoopColorPersister {
    async fn persist_color(&self, _target: &ColorTarget, _color: &str) -> Result<()> {
        Ok(())
    }
}

/// Writes user colors into the settings file and agent colors into
/// `<data_dir>/<agent_id>/config.json`.
#[derive(Debug, Clone)]
pub struct FileColorPersister {
    data_dir: PathBuf,
    settings_path: PathBuf,
}

impl FileColorPersister {
    pub fn new(data_dir: impl Into<PathBuf>, settings_path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            settings_path: settings_path.into(),
        }
    }

    fn agent_config_path(&self, agent_id: &str) -> PathBuf {
        self.data_dir.join(agent_id).join(AGENT_CONFIG_FILE)
    }
}

#[async_trait]
impl ColorPersister for FileColorPersister {
    async fn persist_color(&self, target: &ColorTarget, color: &str) -> Result<()> {
        match target {
            ColorTarget::User => {
                let path = self.settings_path.clone();
                let color = color.to_string();
                tokio::task::spawn_blocking(move || -> Result<()> {
                    let mut settings = GlobalSettings::load_from_file(&path)?;
                    settings.user_avatar_calculated_color = Some(color);
                    settings.save_to_file(&path)
                })
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))??;
            }
            ColorTarget::Agent(agent_id) => {
                let path = self.agent_config_path(agent_id);
                let mut config = match tokio::fs::read_to_string(&path).await {
                    Ok(content) => match serde_json::from_str::<Value>(&content) {
                        Ok(Value::Object(map)) => map,
                        _ => {
                            warn!("Agent config {} unreadable, rewriting", path.display());
                            Map::new()
                        }
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
                    Err(e) => return Err(e.into()),
                };
                config
                    .entry("id")
                    .or_insert_with(|| Value::String(agent_id.clone()));
                config.insert(
                    "avatarCalculatedColor".to_string(),
                    Value::String(color.to_string()),
                );
                write_json_atomic(&path, &Value::Object(config)).await?;
            }
        }
        debug!("Saved {} avatar color for {}", target.kind(), target.id());
        Ok(())
    }
}

async fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, serde_json::to_string_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Samples local avatar files with the `image` crate. Remote URLs are not
/// fetched and yield no color.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageColorSampler;

impl ImageColorSampler {
    fn local_path(image_url: &str) -> Option<PathBuf> {
        if let Some(path) = image_url.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        if image_url.contains("://") || image_url.starts_with("data:") {
            return None;
        }
        Some(PathBuf::from(image_url))
    }
}

#[async_trait]
impl ColorSampler for ImageColorSampler {
    async fn sample(&self, image_url: &str) -> Option<String> {
        let path = Self::local_path(image_url)?;
        let result = tokio::task::spawn_blocking(move || {
            image::open(&path).map(|img| {
                let small = img.resize_exact(SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle);
                let pixels: Vec<[u8; 4]> = small.to_rgba8().pixels().map(|p| p.0).collect();
                dominant_color(&pixels)
            })
        })
        .await;
        match result {
            Ok(Ok(color)) => color,
            Ok(Err(e)) => {
                warn!("Failed to load avatar {} for color extraction: {}", image_url, e);
                None
            }
            Err(e) => {
                warn!("Color extraction task for {} failed: {}", image_url, e);
                None
            }
        }
    }
}

/// Picks the hue of the most saturated mid-lightness pixel, rendered at a
/// fixed saturation and lightness. Falls back to the average opaque pixel
/// with lightness clamped to 40..=70.
pub fn dominant_color(pixels: &[[u8; 4]]) -> Option<String> {
    let mut best: Option<(f64, f64)> = None;
    let (mut r_sum, mut g_sum, mut b_sum, mut count) = (0.0, 0.0, 0.0, 0usize);

    for &[r, g, b, alpha] in pixels {
        if alpha < 128 {
            continue;
        }
        let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
        r_sum += r;
        g_sum += g;
        b_sum += b;
        count += 1;

        let (h, s, l) = rgb_to_hsl(r, g, b);
        if s > 20.0 && (30.0..=80.0).contains(&l) && best.map_or(true, |(_, max)| s > max) {
            best = Some((h, s));
        }
    }

    if let Some((hue, _)) = best {
        return Some(format_rgb(hsl_to_rgb(hue, 75.0, 55.0)));
    }
    if count == 0 {
        return None;
    }
    let n = count as f64;
    let (h, s, l) = rgb_to_hsl(r_sum / n, g_sum / n, b_sum / n);
    Some(format_rgb(hsl_to_rgb(h, s, l.clamp(40.0, 70.0))))
}

/// Channels in 0..=255; returns hue in degrees, saturation and lightness in percent.
pub fn rgb_to_hsl(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let (r, g, b) = (r / 255.0, g / 255.0, b / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    if max == min {
        return (0.0, 0.0, l * 100.0);
    }
    let d = max - min;
    let s = if l > 0.5 {
        d / (2.0 - max - min)
    } else {
        d / (max + min)
    };
    let h = if max == r {
        (g - b) / d + if g < b { 6.0 } else { 0.0 }
    } else if max == g {
        (b - r) / d + 2.0
    } else {
        (r - g) / d + 4.0
    };
    (h / 6.0 * 360.0, s * 100.0, l * 100.0)
}

pub fn hsl_to_rgb(h: f64, s: f64, l: f64) -> (u8, u8, u8) {
    let (s, l) = (s / 100.0, l / 100.0);
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = l - c / 2.0;
    let (r, g, b) = match h {
        h if (0.0..60.0).contains(&h) => (c, x, 0.0),
        h if (60.0..120.0).contains(&h) => (x, c, 0.0),
        h if (120.0..180.0).contains(&h) => (0.0, c, x),
        h if (180.0..240.0).contains(&h) => (0.0, x, c),
        h if (240.0..300.0).contains(&h) => (x, 0.0, c),
        h if (300.0..360.0).contains(&h) => (c, 0.0, x),
        _ => (0.0, 0.0, 0.0),
    };
    let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    (channel(r), channel(g), channel(b))
}

fn format_rgb((r, g, b): (u8, u8, u8)) -> String {
    format!("rgb({},{},{})", r, g, b)
}

/// Per-session cache of sampled avatar colors keyed by URL without its
/// query string. Failed samples are cached too.
pub struct AvatarColors {
    sampler: Arc<dyn ColorSampler>,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl AvatarColors {
    pub fn new(sampler: Arc<dyn ColorSampler>) -> Self {
        Self {
            sampler,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dominant_color(&self, image_url: &str) -> Option<String> {
        if image_url.is_empty() {
            return None;
        }
        let key = cache_key(image_url).to_string();
        let cached = self.cache.lock().get(&key).cloned();
        if let Some(cached) = cached {
            return cached;
        }
        let color = self.sampler.sample(image_url).await;
        self.cache.lock().insert(key, color.clone());
        color
    }

    pub fn cached(&self, image_url: &str) -> Option<Option<String>> {
        self.cache.lock().get(cache_key(image_url)).cloned()
    }
}

fn cache_key(image_url: &str) -> &str {
    image_url.split('?').next().unwrap_or(image_url)
}
