use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Vector,
    Raster,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Raster => "raster",
        }
    }

    /// Per-project subdirectory the generator for this modality writes into.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Vector => "svg",
            Self::Raster => "images",
        }
    }
}

/// The closed set of banner layers. Declaration order is the stacking
/// order (bottom first) and the generation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Layout,
    Background,
    MainElement,
    Logo,
    Text,
    Effects,
}

impl LayerKind {
    pub const ALL: [LayerKind; 6] = [
        LayerKind::Layout,
        LayerKind::Background,
        LayerKind::MainElement,
        LayerKind::Logo,
        LayerKind::Text,
        LayerKind::Effects,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Layout => "layout",
            Self::Background => "background",
            Self::MainElement => "main_element",
            Self::Logo => "logo",
            Self::Text => "text",
            Self::Effects => "effects",
        }
    }

    /// Name used in prompts and routing tables.
    pub fn label(self) -> &'static str {
        match self {
            Self::Layout => "布局层",
            Self::Background => "背景层",
            Self::MainElement => "主要素层",
            Self::Logo => "表意标识层",
            Self::Text => "文字层",
            Self::Effects => "效果层",
        }
    }

    pub fn modality(self) -> Modality {
        match self {
            Self::Background | Self::MainElement => Modality::Raster,
            Self::Layout | Self::Logo | Self::Text | Self::Effects => Modality::Vector,
        }
    }

    pub fn default_output(self) -> &'static str {
        match self {
            Self::Layout => "layout_structure.svg",
            Self::Background => "background.png",
            Self::MainElement => "main_element.png",
            Self::Logo => "logo.svg",
            Self::Text => "text_content.svg",
            Self::Effects => "effects.svg",
        }
    }

    pub fn default_intent(self) -> &'static str {
        match self {
            Self::Layout => "Overall composition grid and safe areas for the banner",
            Self::Background => "Full-bleed background image that sets the mood of the event",
            Self::MainElement => "Hero visual that carries the main message",
            Self::Logo => "Event mark or symbolic identifier",
            Self::Text => "Headline, sub-headline and call to action",
            Self::Effects => "Decorative light, particle and accent effects",
        }
    }

    pub fn stack_index(self) -> usize {
        Self::ALL
            .iter()
            .position(|kind| *kind == self)
            .unwrap_or(Self::ALL.len())
    }

    /// Accepts the snake_case key, the English display name, or the Chinese
    /// layer names LLM output tends to use. Anything else is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase().replace([' ', '-'], "_");
        let kind = match lowered.as_str() {
            "layout" | "layout_layer" | "layout_structure" => Self::Layout,
            "background" | "background_layer" => Self::Background,
            "main_element" | "mainelement" | "main_element_layer" | "main" | "hero" => {
                Self::MainElement
            }
            "logo" | "logo_layer" | "symbol" => Self::Logo,
            "text" | "text_layer" | "text_content" => Self::Text,
            "effects" | "effect" | "effects_layer" => Self::Effects,
            _ => match trimmed {
                "布局层" | "布局图层" | "布局" => Self::Layout,
                "背景层" | "背景图层" | "背景" => Self::Background,
                "主要素层" | "主元素图层" | "主元素层" | "主要元素层" | "主要素" => {
                    Self::MainElement
                }
                "表意标识层" | "表意标识图层" | "标识层" | "标志层" => Self::Logo,
                "文字层" | "文字图层" | "文字" => Self::Text,
                "效果层" | "效果图层" | "特效层" => Self::Effects,
                _ => return None,
            },
        };
        Some(kind)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Design instructions for one layer. Modality is never stored; it always
/// follows from `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub intent: String,
    #[serde(default)]
    pub input_parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

impl LayerSpec {
    pub fn default_for(kind: LayerKind) -> Self {
        Self {
            kind,
            intent: kind.default_intent().to_string(),
            input_parameters: BTreeMap::new(),
            expected_outputs: vec![kind.default_output().to_string()],
        }
    }

    pub fn modality(&self) -> Modality {
        self.kind.modality()
    }

    /// Builds a spec from one entry of a layer-design `layers` object, e.g.
    /// `{"agent": "...", "input": "...", "output": ["bg.png"], "specifications": {...}}`.
    pub fn from_design_entry(kind: LayerKind, entry: &Value) -> Self {
        let mut spec = Self::default_for(kind);
        let Some(obj) = entry.as_object() else {
            if let Some(text) = entry.as_str().filter(|text| !text.trim().is_empty()) {
                spec.intent = text.trim().to_string();
            }
            return spec;
        };

        if let Some(intent) = first_text(obj, &["input", "intent", "layer_goal", "description"]) {
            spec.intent = intent;
        }
        let outputs = output_list(obj.get("output").or_else(|| obj.get("output_requirements")));
        if !outputs.is_empty() {
            spec.expected_outputs = outputs;
        }
        for (key, value) in obj {
            if matches!(key.as_str(), "input" | "intent" | "output") {
                continue;
            }
            spec.input_parameters.insert(key.clone(), value.clone());
        }
        spec
    }

    /// Enriches this spec with one routing-table entry
    /// (`{layer_name, agent, layer_goal, key_elements, input_parameters, output_requirements}`).
    pub fn merge_routing_entry(&mut self, entry: &Map<String, Value>) {
        if let Some(goal) = first_text(entry, &["layer_goal", "intent"]) {
            self.intent = goal;
        }
        if let Some(params) = entry.get("input_parameters").and_then(Value::as_object) {
            for (key, value) in params {
                self.input_parameters.insert(key.clone(), value.clone());
            }
        }
        for key in ["agent", "key_elements"] {
            if let Some(value) = entry.get(key).filter(|value| !value.is_null()) {
                self.input_parameters.insert(key.to_string(), value.clone());
            }
        }
        let outputs = output_list(entry.get("output_requirements").or_else(|| entry.get("output")));
        if !outputs.is_empty() {
            self.expected_outputs = outputs;
        }
    }

    pub fn to_plan_entry(&self) -> Value {
        json!({
            "layer": self.kind.key(),
            "layer_name": self.kind.label(),
            "modality": self.modality().as_str(),
            "intent": self.intent,
            "input_parameters": self.input_parameters,
            "expected_outputs": self.expected_outputs,
        })
    }
}

pub fn default_layer_specs() -> Vec<LayerSpec> {
    LayerKind::ALL
        .iter()
        .copied()
        .map(LayerSpec::default_for)
        .collect()
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find_map(|value| match value {
            Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            _ => None,
        })
}

fn output_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.trim().to_string()],
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn modality_follows_kind() {
        let raster: Vec<LayerKind> = LayerKind::ALL
            .iter()
            .copied()
            .filter(|kind| kind.modality() == Modality::Raster)
            .collect();
        assert_eq!(raster, vec![LayerKind::Background, LayerKind::MainElement]);
        for spec in default_layer_specs() {
            assert_eq!(spec.modality(), spec.kind.modality());
        }
    }

    #[test]
    fn parse_accepts_keys_and_chinese_names() {
        assert_eq!(LayerKind::parse("main_element"), Some(LayerKind::MainElement));
        assert_eq!(LayerKind::parse("Main Element"), Some(LayerKind::MainElement));
        assert_eq!(LayerKind::parse("主元素图层"), Some(LayerKind::MainElement));
        assert_eq!(LayerKind::parse(" 表意标识层 "), Some(LayerKind::Logo));
        assert_eq!(LayerKind::parse("效果层"), Some(LayerKind::Effects));
        assert_eq!(LayerKind::parse("watermark"), None);
    }

    #[test]
    fn design_entry_overrides_defaults() {
        let entry = json!({
            "agent": "image_agent",
            "tool": "pollinations",
            "input": "warm sunset gradient",
            "output": ["sunset.png"],
            "specifications": {"size": "1200x600"}
        });
        let spec = LayerSpec::from_design_entry(LayerKind::Background, &entry);
        assert_eq!(spec.intent, "warm sunset gradient");
        assert_eq!(spec.expected_outputs, vec!["sunset.png"]);
        assert_eq!(spec.input_parameters["tool"], json!("pollinations"));
        assert_eq!(spec.input_parameters["specifications"]["size"], json!("1200x600"));
        assert!(!spec.input_parameters.contains_key("input"));
    }

    #[test]
    fn routing_entry_merges_into_spec() {
        let mut spec = LayerSpec::default_for(LayerKind::Text);
        let entry = json!({
            "layer_name": "文字层",
            "agent": "svg_agent",
            "layer_goal": "Bold headline",
            "key_elements": ["SUMMER SALE"],
            "input_parameters": {"font": "sans-serif"},
            "output_requirements": "headline.svg"
        });
        let Some(obj) = entry.as_object() else {
            panic!("entry is an object");
        };
        spec.merge_routing_entry(obj);
        assert_eq!(spec.intent, "Bold headline");
        assert_eq!(spec.expected_outputs, vec!["headline.svg"]);
        assert_eq!(spec.input_parameters["font"], json!("sans-serif"));
        assert_eq!(spec.input_parameters["key_elements"], json!(["SUMMER SALE"]));
        assert_eq!(spec.to_plan_entry()["modality"], json!("vector"));
    }
}
