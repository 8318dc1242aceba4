use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{BannerError, BannerResult};
use crate::{map_object, truncate_text};

const POLLINATIONS_BASE: &str = "https://image.pollinations.ai/prompt/";
const DRYRUN_SCHEME: &str = "dryrun://";

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub url: String,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct DownloadedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Text-to-image resource addressed by URL: `generate` resolves a prompt to
/// an image URL, `download` fetches it.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, prompt: &str, width: u32, height: u32) -> BannerResult<GeneratedImage>;
    fn download(&self, url: &str) -> BannerResult<DownloadedImage>;
}

#[derive(Default)]
pub struct ImageGeneratorRegistry {
    generators: BTreeMap<String, Box<dyn ImageGenerator>>,
}

impl ImageGeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.generators
            .insert(generator.name().to_string(), Box::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageGenerator> {
        self.generators.get(name).map(|generator| generator.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }
}

pub fn default_generator_registry(timeout_secs: u64) -> ImageGeneratorRegistry {
    let mut generators = ImageGeneratorRegistry::new();
    generators.register(DryrunImageGenerator);
    generators.register(PollinationsGenerator::new(timeout_secs));
    generators
}

/// Pollinations: the prompt is a path segment, the image is produced on GET.
pub struct PollinationsGenerator {
    base: String,
    http: HttpClient,
}

impl PollinationsGenerator {
    pub fn new(timeout_secs: u64) -> Self {
        Self::with_base(POLLINATIONS_BASE, timeout_secs)
    }

    pub fn with_base(base: &str, timeout_secs: u64) -> Self {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            base: base.to_string(),
            http,
        }
    }

    pub fn image_url(&self, prompt: &str, width: u32, height: u32) -> BannerResult<Url> {
        let mut url = Url::parse(&self.base)
            .map_err(|err| BannerError::Generation(format!("invalid base url {}: {err}", self.base)))?;
        url.path_segments_mut()
            .map_err(|_| BannerError::Generation(format!("base url {} cannot hold a path", self.base)))?
            .pop_if_empty()
            .push(prompt);
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("seed", "-1")
            .append_pair("model", "flux");
        Ok(url)
    }
}

impl ImageGenerator for PollinationsGenerator {
    fn name(&self) -> &str {
        "pollinations"
    }

    fn generate(&self, prompt: &str, width: u32, height: u32) -> BannerResult<GeneratedImage> {
        if prompt.trim().is_empty() {
            return Err(BannerError::Generation("empty image prompt".to_string()));
        }
        let url = self.image_url(prompt, width, height)?;
        Ok(GeneratedImage {
            url: url.to_string(),
            provider_request: map_object(json!({
                "endpoint": self.base,
                "prompt": prompt,
                "width": width,
                "height": height,
                "seed": -1,
                "model": "flux",
            })),
            provider_response: map_object(json!({ "url": url.as_str() })),
        })
    }

    fn download(&self, url: &str) -> BannerResult<DownloadedImage> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| BannerError::Download(format!("request to {url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(BannerError::Download(format!(
                "image download failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            )));
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| BannerError::Download(format!("failed reading image bytes: {err}")))?
            .to_vec();
        if bytes.is_empty() {
            return Err(BannerError::Download("image download returned no bytes".to_string()));
        }
        Ok(DownloadedImage { bytes, mime_type })
    }
}

/// Offline generator: a solid PNG whose color comes from the prompt hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunImageGenerator;

impl ImageGenerator for DryrunImageGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, prompt: &str, width: u32, height: u32) -> BannerResult<GeneratedImage> {
        let mut url = Url::parse("dryrun://image/")
            .map_err(|err| BannerError::Generation(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("prompt", prompt)
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string());
        Ok(GeneratedImage {
            url: url.to_string(),
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "prompt": prompt,
                "width": width,
                "height": height,
            })),
            provider_response: map_object(json!({ "status": "ok" })),
        })
    }

    fn download(&self, url: &str) -> BannerResult<DownloadedImage> {
        if !url.starts_with(DRYRUN_SCHEME) {
            return Err(BannerError::Download(format!("not a dryrun url: {url}")));
        }
        let parsed = Url::parse(url).map_err(|err| BannerError::Download(err.to_string()))?;
        let mut prompt = String::new();
        let (mut width, mut height) = (64, 64);
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "prompt" => prompt = value.to_string(),
                "width" => width = value.parse().unwrap_or(64),
                "height" => height = value.parse().unwrap_or(64),
                _ => {}
            }
        }
        let bytes = solid_png(&prompt, width, height)?;
        Ok(DownloadedImage {
            bytes,
            mime_type: Some("image/png".to_string()),
        })
    }
}

pub(crate) fn solid_png(seed_text: &str, width: u32, height: u32) -> BannerResult<Vec<u8>> {
    let (r, g, b) = color_from_text(seed_text);
    let image = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([r, g, b]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| BannerError::Generation(format!("png encode failed: {err}")))?;
    Ok(bytes)
}

fn color_from_text(text: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(text.as_bytes());
    (digest[0], digest[1], digest[2])
}
