//! Typed prompt templates. Each prompt is a struct whose fields fill the
//! `${name}` placeholders of its template; rendering fails on a placeholder
//! without a field or on an empty required field.

use crate::error::{BannerError, BannerResult};

pub trait StagePrompt {
    const SYSTEM: &'static str;
    const TEMPLATE: &'static str;
    const REQUIRED: &'static [&'static str] = &[];

    fn fields(&self) -> Vec<(&'static str, String)>;

    fn render(&self) -> BannerResult<String> {
        render_template(Self::TEMPLATE, &self.fields(), Self::REQUIRED)
    }
}

pub fn render_template(
    template: &str,
    fields: &[(&'static str, String)],
    required: &[&str],
) -> BannerResult<String> {
    let lookup = |name: &str| {
        fields
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    };

    for name in required {
        match lookup(name) {
            None => {
                return Err(BannerError::Template(format!(
                    "required field `{name}` is missing"
                )))
            }
            Some(value) if value.trim().is_empty() => {
                return Err(BannerError::Template(format!(
                    "required field `{name}` is empty"
                )))
            }
            Some(_) => {}
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(BannerError::Template(
                "unterminated placeholder in template".to_string(),
            ));
        };
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| {
            BannerError::Template(format!("no value for placeholder `{name}`"))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn or_none(text: &str) -> String {
    if text.trim().is_empty() {
        "(none)".to_string()
    } else {
        text.trim().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisPrompt {
    pub event_name: String,
    pub requirements: String,
    pub context: String,
}

impl StagePrompt for AnalysisPrompt {
    const SYSTEM: &'static str =
        "You are a senior event strategist who analyzes events for advertising campaigns.";
    const TEMPLATE: &'static str = "Analyze the event \"${event_name}\" as the basis for an advertising banner.\n\
Requirements: ${requirements}\n\n\
Known context:\n${context}\n\n\
Cover the target audience, tone, key messages and the visual themes the banner should carry.";
    const REQUIRED: &'static [&'static str] = &["event_name"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event_name", self.event_name.clone()),
            ("requirements", or_none(&self.requirements)),
            ("context", or_none(&self.context)),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct MarketingPrompt {
    pub event_name: String,
    pub requirements: String,
    pub context: String,
}

impl StagePrompt for MarketingPrompt {
    const SYSTEM: &'static str =
        "You are a marketing planner who turns event analysis into a concrete banner message plan.";
    const TEMPLATE: &'static str = "Write the marketing plan for the \"${event_name}\" banner.\n\
Requirements: ${requirements}\n\n\
Earlier results:\n${context}\n\n\
Give the headline, sub-headline, call to action, selling points and the emotional direction.";
    const REQUIRED: &'static [&'static str] = &["event_name"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event_name", self.event_name.clone()),
            ("requirements", or_none(&self.requirements)),
            ("context", or_none(&self.context)),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct LayerDesignPrompt {
    pub event_name: String,
    pub width: u32,
    pub height: u32,
    pub context: String,
}

impl StagePrompt for LayerDesignPrompt {
    const SYSTEM: &'static str =
        "You are a banner art director. You split a banner into layers and answer with JSON only.";
    const TEMPLATE: &'static str = "Design the layers of a ${width}x${height} banner for \"${event_name}\".\n\n\
Earlier results:\n${context}\n\n\
Answer with one JSON object in a ```json block using exactly these layer keys:\n\
{\"project_name\": \"...\", \"overall_size\": \"${width}x${height}px\", \"layers\": {\n\
  \"layout\": {\"agent\": \"svg\", \"input\": \"...\", \"output\": [\"layout_structure.svg\"], \"specifications\": {}},\n\
  \"background\": {\"agent\": \"image\", \"input\": \"...\", \"output\": [\"background.png\"], \"specifications\": {\"size\": \"1024x768\"}},\n\
  \"main_element\": {\"agent\": \"image\", \"input\": \"...\", \"output\": [\"main_element.png\"], \"specifications\": {}},\n\
  \"logo\": {\"agent\": \"svg\", \"input\": \"...\", \"output\": [\"logo.svg\"], \"specifications\": {}},\n\
  \"text\": {\"agent\": \"svg\", \"input\": \"...\", \"output\": [\"text_content.svg\"], \"specifications\": {}},\n\
  \"effects\": {\"agent\": \"svg\", \"input\": \"...\", \"output\": [\"effects.svg\"], \"specifications\": {}}\n\
}}";
    const REQUIRED: &'static [&'static str] = &["event_name", "width", "height"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event_name", self.event_name.clone()),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
            ("context", or_none(&self.context)),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct LayerRoutingPrompt {
    pub event_name: String,
    pub layer_design: String,
    pub context: String,
}

impl StagePrompt for LayerRoutingPrompt {
    const SYSTEM: &'static str =
        "You route banner layers to generators. You answer with a JSON array only.";
    const TEMPLATE: &'static str = "Route every layer of the \"${event_name}\" banner to a generator.\n\n\
Layer design:\n${layer_design}\n\n\
Earlier results:\n${context}\n\n\
Answer with a ```json array, one entry per layer:\n\
[{\"layer_name\": \"background\", \"agent\": \"image\", \"layer_goal\": \"...\", \"key_elements\": [\"...\"], \"input_parameters\": {}, \"output_requirements\": [\"background.png\"]}]";
    const REQUIRED: &'static [&'static str] = &["event_name", "layer_design"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event_name", self.event_name.clone()),
            ("layer_design", self.layer_design.clone()),
            ("context", or_none(&self.context)),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct KeyInfoPrompt {
    pub budget: usize,
    pub content: String,
}

impl StagePrompt for KeyInfoPrompt {
    const SYSTEM: &'static str = "You condense documents into their key facts.";
    const TEMPLATE: &'static str = "Summarize the key information of the content below in at most ${budget} characters. Keep names, numbers, colors and concrete decisions. Output only the summary.\n\nCONTENT:\n${content}";
    const REQUIRED: &'static [&'static str] = &["content"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("budget", self.budget.to_string()),
            ("content", self.content.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct SvgPrompt {
    pub layer_label: String,
    pub layer_key: String,
    pub prompt: String,
    pub layer_info: String,
    pub width: u32,
    pub height: u32,
}

impl StagePrompt for SvgPrompt {
    const SYSTEM: &'static str =
        "You are an SVG illustrator. You answer with complete, standalone SVG markup in a ```svg block.";
    const TEMPLATE: &'static str = "Create the ${layer_label} (${layer_key}) layer of a ${width}x${height} banner as SVG.\n\
Direction: ${prompt}\n\n\
Layer details:\n${layer_info}\n\n\
Use viewBox=\"0 0 ${width} ${height}\", a transparent background unless the layer is the layout, and no external references.";
    const REQUIRED: &'static [&'static str] = &["layer_key", "prompt"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("layer_label", self.layer_label.clone()),
            ("layer_key", self.layer_key.clone()),
            ("prompt", self.prompt.clone()),
            ("layer_info", or_none(&self.layer_info)),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct CompositionPrompt {
    pub event_name: String,
    pub width: u32,
    pub height: u32,
    pub materials: String,
    pub context: String,
}

impl StagePrompt for CompositionPrompt {
    const SYSTEM: &'static str =
        "You are a front-end developer who assembles banner layers into one self-contained HTML page.";
    const TEMPLATE: &'static str = "Compose the \"${event_name}\" banner (${width}x${height}) as one HTML document.\n\n\
Available materials, bottom layer first (use exactly these relative paths in <img> tags):\n${materials}\n\n\
Earlier results:\n${context}\n\n\
Stack the layers with absolute positioning inside a ${width}x${height} container, inline all CSS, \
and answer with the complete document in a ```html block.";
    const REQUIRED: &'static [&'static str] = &["event_name"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event_name", self.event_name.clone()),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
            ("materials", or_none(&self.materials)),
            ("context", or_none(&self.context)),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ScoringPrompt {
    pub event_name: String,
    pub requirements: String,
    pub width: u32,
    pub height: u32,
}

impl StagePrompt for ScoringPrompt {
    const SYSTEM: &'static str =
        "You are a strict advertising design reviewer who scores rendered banners.";
    const TEMPLATE: &'static str = "The attached screenshot is the rendered ${width}x${height} banner for \"${event_name}\".\n\
Requirements: ${requirements}\n\n\
Score it from 1 to 10 on visual_appeal, layout, color, text_readability and brand_consistency, \
then give an overall score from 0 to 10. Answer with JSON only:\n\
{\"score\": 0.0, \"dimensions\": {\"visual_appeal\": 0, \"layout\": 0, \"color\": 0, \"text_readability\": 0, \"brand_consistency\": 0}, \
\"feedback\": \"...\", \"suggestions\": [\"...\"]}";
    const REQUIRED: &'static [&'static str] = &["event_name"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event_name", self.event_name.clone()),
            ("requirements", or_none(&self.requirements)),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationPrompt {
    pub html: String,
    pub score: f64,
    pub feedback: String,
    pub suggestions: String,
    pub manifest: String,
    pub requirements: String,
    pub width: u32,
    pub height: u32,
}

impl StagePrompt for OptimizationPrompt {
    const SYSTEM: &'static str =
        "You are a front-end developer who improves banner HTML from review feedback.";
    const TEMPLATE: &'static str = "Improve the ${width}x${height} banner below.\n\
Review score: ${score}/10\n\
Feedback: ${feedback}\n\
Suggestions:\n${suggestions}\n\n\
Design requirements: ${requirements}\n\n\
Files already generated (reference assets by their existing relative paths, do not invent new files):\n${manifest}\n\n\
Current HTML:\n```html\n${html}\n```\n\n\
Answer with the complete improved document in a ```html block.";
    const REQUIRED: &'static [&'static str] = &["html"];

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("html", self.html.clone()),
            ("score", format!("{:.1}", self.score)),
            ("feedback", or_none(&self.feedback)),
            ("suggestions", or_none(&self.suggestions)),
            ("manifest", or_none(&self.manifest)),
            ("requirements", or_none(&self.requirements)),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_every_placeholder() -> anyhow::Result<()> {
        let prompt = AnalysisPrompt {
            event_name: "SummerSale".to_string(),
            requirements: String::new(),
            context: String::new(),
        };
        let rendered = prompt.render()?;
        assert!(rendered.contains("\"SummerSale\""));
        assert!(rendered.contains("Requirements: (none)"));
        assert!(!rendered.contains("${"));
        Ok(())
    }

    #[test]
    fn missing_placeholder_field_fails_loudly() {
        let err = render_template("Hello ${name} from ${place}", &[("name", "a".to_string())], &[]);
        assert!(matches!(err, Err(BannerError::Template(message)) if message.contains("place")));
    }

    #[test]
    fn empty_required_field_fails() {
        let prompt = AnalysisPrompt {
            event_name: "  ".to_string(),
            requirements: "x".to_string(),
            context: String::new(),
        };
        assert!(matches!(prompt.render(), Err(BannerError::Template(_))));
    }

    #[test]
    fn inserted_values_are_not_rescanned() -> anyhow::Result<()> {
        let prompt = OptimizationPrompt {
            html: "<script>const t = `${width}`;</script>".to_string(),
            score: 6.25,
            feedback: "low contrast".to_string(),
            suggestions: "- brighten text".to_string(),
            manifest: String::new(),
            requirements: String::new(),
            width: 1200,
            height: 600,
        };
        let rendered = prompt.render()?;
        assert!(rendered.contains("const t = `${width}`;"));
        assert!(rendered.contains("Review score: 6.2/10") || rendered.contains("Review score: 6.3/10"));
        Ok(())
    }

    #[test]
    fn every_template_renders_with_its_fields() -> anyhow::Result<()> {
        LayerDesignPrompt {
            event_name: "e".to_string(),
            width: 1200,
            height: 600,
            context: String::new(),
        }
        .render()?;
        LayerRoutingPrompt {
            event_name: "e".to_string(),
            layer_design: "{}".to_string(),
            context: String::new(),
        }
        .render()?;
        KeyInfoPrompt {
            budget: 500,
            content: "c".to_string(),
        }
        .render()?;
        SvgPrompt {
            layer_label: "logo".to_string(),
            layer_key: "logo".to_string(),
            prompt: "p".to_string(),
            layer_info: String::new(),
            width: 1200,
            height: 600,
        }
        .render()?;
        CompositionPrompt {
            event_name: "e".to_string(),
            width: 1200,
            height: 600,
            materials: String::new(),
            context: String::new(),
        }
        .render()?;
        ScoringPrompt {
            event_name: "e".to_string(),
            requirements: String::new(),
            width: 1200,
            height: 600,
        }
        .render()?;
        MarketingPrompt {
            event_name: "e".to_string(),
            requirements: String::new(),
            context: String::new(),
        }
        .render()?;
        Ok(())
    }
}
