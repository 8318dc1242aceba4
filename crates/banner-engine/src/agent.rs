use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use banner_contracts::layers::{default_layer_specs, LayerKind};
use banner_contracts::models::ModelSelector;
pub use banner_contracts::models::Capability;
use banner_contracts::stages::Stage;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use regex::Regex;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{BannerError, BannerResult};
use crate::truncate_text;

const PROMPT_TRUNCATION_MARKER: &str = "\n\n[... input truncated ...]";
const VISION_MAX_DIM: u32 = 1280;

/// What a call is for. Used for logging and by offline agents to pick a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentTask {
    Stage(Stage),
    KeyInfo,
    Extract(&'static str),
    SvgGeneration(LayerKind),
    VisionScoring,
    HtmlOptimization,
}

impl fmt::Display for AgentTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "stage:{}", stage.key()),
            Self::KeyInfo => f.write_str("key_info"),
            Self::Extract(grammar) => write!(f, "extract:{grammar}"),
            Self::SvgGeneration(kind) => write!(f, "svg:{}", kind.key()),
            Self::VisionScoring => f.write_str("vision_scoring"),
            Self::HtmlOptimization => f.write_str("html_optimization"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub capability: Capability,
    pub task: AgentTask,
    pub system_prompt: String,
    pub user_prompt: String,
    pub image: Option<PathBuf>,
}

impl AgentRequest {
    pub fn new(
        capability: Capability,
        task: AgentTask,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            capability,
            task,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(path.into());
        self
    }
}

/// Synchronous text-in/text-out model call. No retries; a failure is
/// returned as `BannerError::Model`.
pub trait AgentModel: Send + Sync {
    fn name(&self) -> &str;
    fn invoke(&self, request: &AgentRequest) -> BannerResult<String>;
}

/// Chat-completions client for any OpenAI-compatible endpoint
/// (DashScope compatible mode, OpenAI, local gateways).
pub struct OpenAiCompatibleAgent {
    api_base: String,
    api_key: String,
    http: HttpClient,
    text_model: String,
    code_model: String,
    vision_model: String,
    max_prompt_chars: usize,
}

impl OpenAiCompatibleAgent {
    pub fn new(config: &EngineConfig, selector: &ModelSelector) -> BannerResult<Self> {
        let Some(api_key) = config.api_key.clone() else {
            return Err(BannerError::Model("no API key configured".to_string()));
        };
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.model_timeout_secs.max(1)))
            .build()
            .map_err(|err| BannerError::Model(format!("http client build failed: {err}")))?;

        let resolve = |requested: Option<&str>, capability: Capability| -> BannerResult<String> {
            let selection = selector
                .select(requested, capability)
                .map_err(BannerError::Model)?;
            if let (Some(reason), Some(_)) = (&selection.fallback_reason, &selection.requested) {
                warn!(event = "model_fallback", %capability, model = %selection.model.name, reason = %reason);
            }
            Ok(selection.model.name)
        };

        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            http,
            text_model: resolve(config.text_model.as_deref(), Capability::TextGeneration)?,
            code_model: resolve(config.code_model.as_deref(), Capability::CodeGeneration)?,
            vision_model: resolve(config.vision_model.as_deref(), Capability::VisionScoring)?,
            max_prompt_chars: config.max_prompt_chars,
        })
    }

    fn model_for(&self, capability: Capability) -> &str {
        match capability {
            Capability::CodeGeneration => &self.code_model,
            Capability::VisionScoring => &self.vision_model,
            Capability::TextGeneration | Capability::ImageGeneration => &self.text_model,
        }
    }

    fn build_payload(&self, request: &AgentRequest) -> BannerResult<Value> {
        let user_prompt = truncate_prompt(&request.user_prompt, self.max_prompt_chars);
        let user_content = match &request.image {
            Some(path) => {
                let data_url = prepare_vision_image_data_url(path, VISION_MAX_DIM)?;
                json!([
                    {"type": "text", "text": user_prompt},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ])
            }
            None => Value::String(user_prompt),
        };

        let mut messages = Vec::new();
        if !request.system_prompt.trim().is_empty() {
            messages.push(json!({"role": "system", "content": request.system_prompt}));
        }
        messages.push(json!({"role": "user", "content": user_content}));

        Ok(json!({
            "model": self.model_for(request.capability),
            "messages": messages,
        }))
    }
}

impl AgentModel for OpenAiCompatibleAgent {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn invoke(&self, request: &AgentRequest) -> BannerResult<String> {
        let model = self.model_for(request.capability).to_string();
        let payload = self.build_payload(request)?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let started = Instant::now();

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .map_err(|err| BannerError::Model(format!("{model} request failed: {err}")))?;
        let parsed = response_json_or_error(&model, response)?;
        let text = extract_chat_text(&parsed);
        debug!(
            event = "agent_call",
            task = %request.task,
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            reply_chars = text.chars().count() as u64,
        );
        if text.trim().is_empty() {
            return Err(BannerError::Model(format!("{model} returned an empty reply")));
        }
        Ok(text)
    }
}

/// Offline agent with fixed, well-formed replies per task. Extraction
/// requests get an empty reply so the syntactic paths are exercised.
#[derive(Debug, Clone)]
pub struct DryrunAgent {
    score: f64,
}

impl Default for DryrunAgent {
    fn default() -> Self {
        Self { score: 8.0 }
    }
}

impl DryrunAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(score: f64) -> Self {
        Self { score }
    }
}

impl AgentModel for DryrunAgent {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn invoke(&self, request: &AgentRequest) -> BannerResult<String> {
        let reply = match request.task {
            AgentTask::Stage(Stage::LayerDesign) => dryrun_layer_design(),
            AgentTask::Stage(Stage::LayerRouting) => dryrun_layer_routing(),
            AgentTask::Stage(Stage::HtmlComposition) => dryrun_composition(&request.user_prompt),
            AgentTask::Stage(stage) => format!(
                "# {}\n\n{}",
                stage.title(),
                truncate_text(request.user_prompt.lines().next().unwrap_or(""), 160)
            ),
            AgentTask::KeyInfo => {
                let content = request
                    .user_prompt
                    .split_once("CONTENT:")
                    .map(|(_, rest)| rest.trim())
                    .unwrap_or(request.user_prompt.as_str());
                content.chars().take(200).collect()
            }
            AgentTask::Extract(_) | AgentTask::HtmlOptimization => String::new(),
            AgentTask::SvgGeneration(kind) => format!(
                "```svg\n<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"1200\" height=\"600\" viewBox=\"0 0 1200 600\"><text x=\"40\" y=\"80\" font-size=\"48\">{}</text></svg>\n```",
                kind.key()
            ),
            AgentTask::VisionScoring => json!({
                "score": self.score,
                "dimensions": {
                    "visual_appeal": self.score,
                    "layout": self.score,
                    "color": self.score,
                    "text_readability": self.score,
                    "brand_consistency": self.score,
                },
                "feedback": "Balanced composition with readable text.",
                "suggestions": ["Increase headline contrast slightly"],
            })
            .to_string(),
        };
        Ok(reply)
    }
}

fn dryrun_layer_design() -> String {
    let mut layers = Map::new();
    for spec in default_layer_specs() {
        layers.insert(
            spec.kind.key().to_string(),
            json!({
                "agent": format!("{}_agent", spec.modality().as_str()),
                "input": spec.intent,
                "output": spec.expected_outputs,
                "specifications": {},
            }),
        );
    }
    let design = json!({
        "project_name": "dryrun",
        "overall_size": "1200x600px",
        "layers": layers,
    });
    format!(
        "```json\n{}\n```",
        serde_json::to_string_pretty(&design).unwrap_or_default()
    )
}

fn dryrun_layer_routing() -> String {
    let entries: Vec<Value> = default_layer_specs()
        .iter()
        .map(|spec| {
            json!({
                "layer_name": spec.kind.label(),
                "agent": format!("{}_agent", spec.modality().as_str()),
                "layer_goal": spec.intent,
                "key_elements": [],
                "input_parameters": {},
                "output_requirements": spec.expected_outputs,
            })
        })
        .collect();
    format!(
        "```json\n{}\n```",
        serde_json::to_string_pretty(&entries).unwrap_or_default()
    )
}

fn dryrun_composition(prompt: &str) -> String {
    let mut layers = String::new();
    if let Ok(pattern) = Regex::new(r"assets/(?:svg|images)/[A-Za-z0-9_.\-]+") {
        for (index, found) in pattern.find_iter(prompt).enumerate() {
            layers.push_str(&format!(
                "<img class=\"layer\" style=\"z-index:{index}\" src=\"{}\">\n",
                found.as_str()
            ));
        }
    }
    format!(
        "```html\n<!DOCTYPE html>\n<html>\n<head><style>.banner{{position:relative;width:1200px;height:600px}}.layer{{position:absolute;inset:0;width:100%;height:100%}}</style></head>\n<body>\n<div class=\"banner\">\n{layers}</div>\n</body>\n</html>\n```"
    )
}

pub(crate) fn truncate_prompt(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(PROMPT_TRUNCATION_MARKER);
    out
}

fn response_json_or_error(model: &str, response: HttpResponse) -> BannerResult<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| BannerError::Model(format!("{model} response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(BannerError::Model(format!(
            "{model} request failed ({code}): {}",
            truncate_text(&body, 512)
        )));
    }
    serde_json::from_str(&body)
        .map_err(|err| BannerError::Model(format!("{model} returned invalid JSON payload: {err}")))
}

fn extract_chat_text(response: &Value) -> String {
    let Some(content) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
    else {
        return String::new();
    };
    match content {
        Value::String(text) => text.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>()
            .join("")
            .trim()
            .to_string(),
        _ => String::new(),
    }
}

fn prepare_vision_image_data_url(path: &Path, max_dim: u32) -> BannerResult<String> {
    let (bytes, mime) = prepare_vision_image(path, max_dim)?;
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

/// Flattens alpha onto white and downsizes to a JPEG. Files the `image`
/// crate cannot decode are sent as-is.
fn prepare_vision_image(path: &Path, max_dim: u32) -> BannerResult<(Vec<u8>, String)> {
    let dim = max_dim.max(128);
    if let Ok(image) = image::open(path) {
        let rgba = image.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let resized = DynamicImage::ImageRgba8(flattened)
            .resize(dim, dim, FilterType::Triangle)
            .to_rgb8();
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        if encoder
            .encode_image(&DynamicImage::ImageRgb8(resized))
            .is_ok()
        {
            return Ok((bytes, "image/jpeg".to_string()));
        }
    }

    let bytes = fs::read(path).map_err(|err| {
        BannerError::Model(format!("failed reading image {}: {err}", path.display()))
    })?;
    Ok((bytes, guess_image_mime(path).to_string()))
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use serde_json::json;

    use super::*;

    #[test]
    fn truncate_prompt_appends_marker_only_when_needed() {
        assert_eq!(truncate_prompt("short", 10), "short");
        let long = "字".repeat(30);
        let truncated = truncate_prompt(&long, 25);
        assert!(truncated.starts_with(&"字".repeat(25)));
        assert!(truncated.ends_with(PROMPT_TRUNCATION_MARKER));
    }

    #[test]
    fn chat_text_reads_string_and_part_arrays() {
        let plain = json!({"choices": [{"message": {"content": "  hello  "}}]});
        assert_eq!(extract_chat_text(&plain), "hello");
        let parts = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]}}]});
        assert_eq!(extract_chat_text(&parts), "ab");
        assert_eq!(extract_chat_text(&json!({"choices": []})), "");
    }

    #[test]
    fn payload_carries_image_as_data_url() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image_path = temp.path().join("shot.png");
        RgbImage::from_pixel(32, 16, Rgb([10, 20, 30])).save(&image_path)?;

        let config = EngineConfig {
            api_key: Some("sk-test".to_string()),
            vision_model: Some("qwen-vl-max".to_string()),
            ..EngineConfig::default()
        };
        let agent = OpenAiCompatibleAgent::new(&config, &ModelSelector::new(None))?;
        let request = AgentRequest::new(
            Capability::VisionScoring,
            AgentTask::VisionScoring,
            "judge",
            "score this",
        )
        .with_image(&image_path);
        let payload = agent.build_payload(&request)?;

        assert_eq!(payload["model"], json!("qwen-vl-max"));
        assert_eq!(payload["messages"][0]["role"], json!("system"));
        let url = payload["messages"][1]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap_or("");
        assert!(url.starts_with("data:image/jpeg;base64,"));
        Ok(())
    }

    #[test]
    fn unsupported_model_falls_back_to_capable_one() -> anyhow::Result<()> {
        let config = EngineConfig {
            api_key: Some("sk-test".to_string()),
            vision_model: Some("qwen-max".to_string()),
            ..EngineConfig::default()
        };
        let agent = OpenAiCompatibleAgent::new(&config, &ModelSelector::new(None))?;
        assert_eq!(agent.model_for(Capability::VisionScoring), "qwen-vl-max");
        assert_eq!(agent.model_for(Capability::CodeGeneration), "qwen-max");
        Ok(())
    }

    #[test]
    fn dryrun_design_reply_is_fenced_json_with_all_layers() -> anyhow::Result<()> {
        let agent = DryrunAgent::new();
        let request = AgentRequest::new(
            Capability::TextGeneration,
            AgentTask::Stage(Stage::LayerDesign),
            "",
            "design",
        );
        let reply = agent.invoke(&request)?;
        assert!(reply.starts_with("```json"));
        let body = reply.trim_start_matches("```json").trim_end_matches("```");
        let parsed: Value = serde_json::from_str(body.trim())?;
        assert_eq!(parsed["layers"].as_object().map(|layers| layers.len()), Some(6));
        Ok(())
    }
}
