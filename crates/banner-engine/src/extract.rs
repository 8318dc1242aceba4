//! Best-effort extraction of structured values out of free-form model text.
//!
//! Every extraction runs through [`extract`]: a grammar knows how to parse a
//! model reply and how to parse the original text without a model; the route
//! decides which goes first; the caller supplies the default used when both
//! fail. Extraction never errors.

use banner_contracts::layers::LayerKind;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::{AgentModel, AgentRequest, AgentTask, Capability};
use crate::strip_code_fence;

pub const LAYER_NOT_FOUND: &str = "未找到对应图层";

const EXTRACTION_SYSTEM_PROMPT: &str =
    "You extract exactly what is asked from the provided content. Output only the requested value, without explanations.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    Llm,
    Syntactic,
    Default,
}

impl ExtractionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Syntactic => "syntactic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted<T> {
    pub value: T,
    pub source: ExtractionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SyntacticOnly,
    SyntacticFirst,
    LlmFirst,
}

pub trait Grammar {
    type Output;

    fn name(&self) -> &'static str;

    /// Instruction sent to the model ahead of the content.
    fn instruction(&self) -> String;

    /// Parses a model reply.
    fn parse(&self, text: &str) -> Option<Self::Output>;

    /// Parses the original content without a model.
    fn parse_source(&self, source: &str) -> Option<Self::Output> {
        self.parse(source)
    }
}

pub fn extract<G: Grammar>(
    agent: Option<&dyn AgentModel>,
    grammar: &G,
    source: &str,
    route: Route,
    default: impl FnOnce() -> G::Output,
) -> Extracted<G::Output> {
    let order: &[ExtractionSource] = match route {
        Route::SyntacticOnly => &[ExtractionSource::Syntactic],
        Route::SyntacticFirst => &[ExtractionSource::Syntactic, ExtractionSource::Llm],
        Route::LlmFirst => &[ExtractionSource::Llm, ExtractionSource::Syntactic],
    };

    for step in order {
        let found = match step {
            ExtractionSource::Llm => agent.and_then(|agent| parse_with_model(agent, grammar, source)),
            ExtractionSource::Syntactic => grammar.parse_source(source),
            ExtractionSource::Default => None,
        };
        if let Some(value) = found {
            debug!(event = "extracted", grammar = grammar.name(), source = step.as_str());
            return Extracted {
                value,
                source: *step,
            };
        }
    }

    warn!(event = "extraction_default", grammar = grammar.name());
    Extracted {
        value: default(),
        source: ExtractionSource::Default,
    }
}

fn parse_with_model<G: Grammar>(
    agent: &dyn AgentModel,
    grammar: &G,
    source: &str,
) -> Option<G::Output> {
    if source.trim().is_empty() {
        return None;
    }
    let request = AgentRequest::new(
        Capability::TextGeneration,
        AgentTask::Extract(grammar.name()),
        EXTRACTION_SYSTEM_PROMPT,
        format!("{}\n\nCONTENT:\n{}", grammar.instruction(), source),
    );
    match agent.invoke(&request) {
        Ok(reply) => grammar.parse(&reply),
        Err(err) => {
            warn!(event = "extraction_model_failed", grammar = grammar.name(), error = %err);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    Object,
    /// An object or an array.
    Any,
}

#[derive(Debug, Clone, Copy)]
pub struct JsonGrammar {
    pub shape: JsonShape,
}

impl JsonGrammar {
    pub fn object() -> Self {
        Self {
            shape: JsonShape::Object,
        }
    }

    pub fn any() -> Self {
        Self {
            shape: JsonShape::Any,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self.shape {
            JsonShape::Object => value.is_object(),
            JsonShape::Any => value.is_object() || value.is_array(),
        }
    }
}

impl Grammar for JsonGrammar {
    type Output = Value;

    fn name(&self) -> &'static str {
        "json"
    }

    fn instruction(&self) -> String {
        let shape = match self.shape {
            JsonShape::Object => "object",
            JsonShape::Any => "object or array",
        };
        format!("Repair the content below into one valid JSON {shape}. Output only the JSON.")
    }

    fn parse(&self, text: &str) -> Option<Value> {
        let raw = text.trim();
        if raw.is_empty() {
            return None;
        }
        let mut candidates: Vec<String> = Vec::new();
        if let Ok(fence) = Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n(.*?)```") {
            for caps in fence.captures_iter(raw) {
                if let Some(body) = caps.get(1) {
                    candidates.push(body.as_str().to_string());
                }
            }
        }
        let unfenced = strip_code_fence(raw);
        candidates.push(unfenced.clone());
        for (open, close) in [('{', '}'), ('[', ']')] {
            if let (Some(start), Some(end)) = (unfenced.find(open), unfenced.rfind(close)) {
                if end > start {
                    candidates.push(unfenced[start..=end].to_string());
                }
            }
        }

        candidates
            .iter()
            .filter_map(|candidate| serde_json::from_str::<Value>(candidate.trim()).ok())
            .find(|value| self.accepts(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Markup {
    Svg,
    Html,
}

/// Extracts complete `<svg>` elements (possibly several) or one HTML document.
#[derive(Debug, Clone, Copy)]
pub struct MarkupGrammar {
    pub markup: Markup,
}

impl MarkupGrammar {
    pub fn svg() -> Self {
        Self {
            markup: Markup::Svg,
        }
    }

    pub fn html() -> Self {
        Self {
            markup: Markup::Html,
        }
    }

    fn svg_blocks(text: &str) -> Option<Vec<String>> {
        let fences = [
            r"(?s)```svg[ \t]*\n(.*?)```",
            r"(?s)```xml[ \t]*\n(.*?)```",
            r"(?s)```[a-zA-Z]*[ \t]*\n(.*?<svg.*?</svg>.*?)```",
        ];
        let block = Regex::new(r"(?is)<svg\b[^>]*>.*?</svg>").ok()?;

        let mut regions: Vec<String> = Vec::new();
        for pattern in fences {
            let Ok(fence) = Regex::new(pattern) else {
                continue;
            };
            let found: Vec<String> = fence
                .captures_iter(text)
                .filter_map(|caps| caps.get(1).map(|body| body.as_str().to_string()))
                .collect();
            if !found.is_empty() {
                regions.push(found.join("\n"));
                break;
            }
        }
        regions.push(text.to_string());

        for region in regions {
            let blocks: Vec<String> = block
                .find_iter(&region)
                .map(|found| found.as_str().trim().to_string())
                .collect();
            if !blocks.is_empty() {
                return Some(blocks);
            }
        }
        None
    }

    fn html_document(text: &str) -> Option<Vec<String>> {
        let patterns = [
            r"(?s)```html[ \t]*\n(.*?)```",
            r"(?is)```[ \t]*\n(<!DOCTYPE html.*?)```",
            r"(?is)(<!DOCTYPE html.*?</html>)",
            r"(?is)(<html\b.*?</html>)",
        ];
        let complete = Regex::new(r"(?is)^(?:<!DOCTYPE html|<html\b).*</html>$").ok()?;
        for pattern in patterns {
            let Ok(regex) = Regex::new(pattern) else {
                continue;
            };
            let Some(body) = regex.captures(text).and_then(|caps| caps.get(1)) else {
                continue;
            };
            let candidate = body.as_str().trim();
            if complete.is_match(candidate) {
                return Some(vec![candidate.to_string()]);
            }
        }
        None
    }
}

impl Grammar for MarkupGrammar {
    type Output = Vec<String>;

    fn name(&self) -> &'static str {
        match self.markup {
            Markup::Svg => "svg",
            Markup::Html => "html",
        }
    }

    fn instruction(&self) -> String {
        match self.markup {
            Markup::Svg => "Extract every complete <svg>...</svg> element from the content. Output only the SVG markup.".to_string(),
            Markup::Html => "Extract the complete HTML document (from <!DOCTYPE html> to </html>) from the content. Output only the HTML.".to_string(),
        }
    }

    fn parse(&self, text: &str) -> Option<Vec<String>> {
        if text.trim().is_empty() {
            return None;
        }
        match self.markup {
            Markup::Svg => Self::svg_blocks(text),
            Markup::Html => Self::html_document(text),
        }
    }
}

/// Output filename for one material, normalized to a safe name with an
/// extension the modality can hold.
#[derive(Debug, Clone, Copy)]
pub struct FilenameGrammar {
    pub default_extension: &'static str,
    pub allowed: &'static [&'static str],
}

impl FilenameGrammar {
    pub fn vector() -> Self {
        Self {
            default_extension: "svg",
            allowed: &["svg"],
        }
    }

    pub fn raster() -> Self {
        Self {
            default_extension: "png",
            allowed: &["png", "jpg", "jpeg", "gif", "webp"],
        }
    }

    pub fn normalize(&self, raw: &str) -> Option<String> {
        let base = raw.trim().rsplit(['/', '\\']).next().unwrap_or("");
        let cleaned: String = base
            .chars()
            .filter(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.'))
            .collect();
        let cleaned = cleaned.trim_matches('.');
        let (stem, ext) = match cleaned.rsplit_once('.') {
            Some((stem, ext)) => (stem.trim_matches('.'), ext.to_ascii_lowercase()),
            None => (cleaned, String::new()),
        };
        if stem.is_empty() {
            return None;
        }
        if self.allowed.contains(&ext.as_str()) {
            return Some(format!("{stem}.{ext}"));
        }
        Some(format!("{stem}.{}", self.default_extension))
    }

    fn from_output_field(&self, text: &str) -> Option<String> {
        let field = Regex::new(
            r#"(?s)"(?:output|output_requirements|expected_outputs)"\s*:\s*(\[[^\]]*\]|"[^"]*")"#,
        )
        .ok()?;
        let quoted = Regex::new(r#"(?i)"([^"]+\.(?:png|jpe?g|gif|svg|webp))""#).ok()?;
        for caps in field.captures_iter(text) {
            let Some(body) = caps.get(1) else {
                continue;
            };
            if let Some(name) = quoted
                .captures(body.as_str())
                .and_then(|inner| inner.get(1))
                .and_then(|name| self.normalize(name.as_str()))
            {
                return Some(name);
            }
        }
        None
    }
}

impl Grammar for FilenameGrammar {
    type Output = String;

    fn name(&self) -> &'static str {
        "filename"
    }

    fn instruction(&self) -> String {
        format!(
            "Give the output filename for this layer (extension .{}). Output only the filename.",
            self.default_extension
        )
    }

    fn parse(&self, text: &str) -> Option<String> {
        if let Some(name) = self.from_output_field(text) {
            return Some(name);
        }
        let trimmed = strip_code_fence(text);
        if trimmed.is_empty() || trimmed.lines().count() > 1 || trimmed.chars().count() > 120 {
            return None;
        }
        let bare: String = trimmed
            .chars()
            .filter(|ch| !matches!(ch, '"' | '\'' | '[' | ']' | '`') && !ch.is_whitespace())
            .collect();
        if !bare.contains('.') {
            return None;
        }
        self.normalize(&bare)
    }

    fn parse_source(&self, source: &str) -> Option<String> {
        self.from_output_field(source)
    }
}

pub const MIN_DIMENSION: u32 = 64;
pub const MAX_DIMENSION: u32 = 4096;

/// `W x H` in any of the usual spellings (`1024x768`, `1024*768`, `1024×768`, `1024,768`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeGrammar;

impl Grammar for SizeGrammar {
    type Output = (u32, u32);

    fn name(&self) -> &'static str {
        "size"
    }

    fn instruction(&self) -> String {
        "State the image size in pixels as WIDTHxHEIGHT, for example 1024x768. Output only the size."
            .to_string()
    }

    fn parse(&self, text: &str) -> Option<(u32, u32)> {
        let pattern = Regex::new(r"(\d{2,5})\s*(?:[,xX*×]|by)\s*(\d{2,5})").ok()?;
        let caps = pattern.captures(text)?;
        let width: u32 = caps.get(1)?.as_str().parse().ok()?;
        let height: u32 = caps.get(2)?.as_str().parse().ok()?;
        Some((
            width.clamp(MIN_DIMENSION, MAX_DIMENSION),
            height.clamp(MIN_DIMENSION, MAX_DIMENSION),
        ))
    }
}

/// One generation prompt, as plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptGrammar;

impl Grammar for PromptGrammar {
    type Output = String;

    fn name(&self) -> &'static str {
        "prompt"
    }

    fn instruction(&self) -> String {
        "Write one concise generation prompt (English, comma-separated visual descriptors) for the layer described below. Output only the prompt."
            .to_string()
    }

    fn parse(&self, text: &str) -> Option<String> {
        let unfenced = strip_code_fence(text);
        let mut prompt = unfenced.trim();
        for prefix in ["prompt:", "Prompt:", "PROMPT:", "提示词:", "提示词："] {
            if let Some(rest) = prompt.strip_prefix(prefix) {
                prompt = rest.trim();
            }
        }
        let prompt = prompt.trim_matches(['"', '\'', '`']).trim();
        let length = prompt.chars().count();
        if length == 0 || length > 2000 {
            return None;
        }
        Some(prompt.to_string())
    }

    fn parse_source(&self, source: &str) -> Option<String> {
        let field = Regex::new(
            r#""(?:prompt|generation_prompt|input|layer_goal|intent)"\s*:\s*"([^"]{8,})""#,
        )
        .ok()?;
        field
            .captures(source)
            .and_then(|caps| caps.get(1))
            .map(|found| found.as_str().trim().to_string())
    }
}

/// The slice of a layer design that describes one layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerFilterGrammar {
    pub kind: LayerKind,
}

impl LayerFilterGrammar {
    fn find_entry(value: &Value, kind: LayerKind) -> Option<Value> {
        let matches = |name: &str| LayerKind::parse(name) == Some(kind);
        match value {
            Value::Object(map) => {
                if let Some(layers) = map.get("layers").or_else(|| map.get("routing")) {
                    if let Some(found) = Self::find_entry(layers, kind) {
                        return Some(found);
                    }
                }
                map.iter()
                    .find(|(key, _)| matches(key.as_str()))
                    .map(|(_, entry)| entry.clone())
            }
            Value::Array(rows) => rows
                .iter()
                .find(|row| {
                    ["layer_name", "layer", "name", "kind"]
                        .iter()
                        .filter_map(|key| row.get(*key).and_then(Value::as_str))
                        .any(matches)
                })
                .cloned(),
            _ => None,
        }
    }
}

impl Grammar for LayerFilterGrammar {
    type Output = String;

    fn name(&self) -> &'static str {
        "layer_filter"
    }

    fn instruction(&self) -> String {
        format!(
            "From the layer design below, output only the content describing the {} ({}) layer, unchanged. If that layer is absent, output exactly: {}",
            self.kind.label(),
            self.kind.key(),
            LAYER_NOT_FOUND
        )
    }

    fn parse(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty()
            || trimmed.contains(LAYER_NOT_FOUND)
            || trimmed.to_ascii_lowercase().contains("layer not found")
        {
            return None;
        }
        Some(strip_code_fence(trimmed))
    }

    fn parse_source(&self, source: &str) -> Option<String> {
        let design = JsonGrammar::any().parse(source)?;
        let entry = Self::find_entry(&design, self.kind)?;
        let mut wrapped = serde_json::Map::new();
        wrapped.insert(self.kind.key().to_string(), entry);
        serde_json::to_string_pretty(&Value::Object(wrapped)).ok()
    }
}
