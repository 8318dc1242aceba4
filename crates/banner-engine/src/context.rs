use std::collections::BTreeMap;

use banner_contracts::stages::{PhaseLedger, PhaseResult, Stage};
use tracing::{debug, warn};

use crate::agent::{AgentModel, AgentRequest, AgentTask, Capability};
use crate::prompts::{KeyInfoPrompt, StagePrompt};

/// Summarize, then summarize the summary once more, then cut.
pub const MAX_SUMMARY_DEPTH: usize = 2;

/// Bounds one prior result to `budget` characters, asking the model for a
/// summary first when the text is too long.
#[derive(Clone, Copy)]
pub struct KeyInfo<'a> {
    agent: Option<&'a dyn AgentModel>,
    budget: usize,
}

impl<'a> KeyInfo<'a> {
    pub fn new(agent: Option<&'a dyn AgentModel>, budget: usize) -> Self {
        Self {
            agent,
            budget: budget.max(1),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// The result never exceeds the budget, whatever the model returns.
    pub fn summarize(&self, text: &str) -> String {
        let mut current = text.trim().to_string();
        for depth in 0..MAX_SUMMARY_DEPTH {
            if current.chars().count() <= self.budget {
                return current;
            }
            let Some(agent) = self.agent else {
                break;
            };
            match self.summarize_once(agent, &current) {
                Some(summary) => {
                    debug!(
                        event = "key_info_summarized",
                        depth,
                        before = current.chars().count() as u64,
                        after = summary.chars().count() as u64,
                    );
                    current = summary;
                }
                None => break,
            }
        }
        hard_truncate(&current, self.budget)
    }

    fn summarize_once(&self, agent: &dyn AgentModel, text: &str) -> Option<String> {
        let prompt = KeyInfoPrompt {
            budget: self.budget,
            content: text.to_string(),
        };
        let user_prompt = match prompt.render() {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(event = "key_info_prompt_failed", error = %err);
                return None;
            }
        };
        let request = AgentRequest::new(
            Capability::TextGeneration,
            AgentTask::KeyInfo,
            KeyInfoPrompt::SYSTEM,
            user_prompt,
        );
        match agent.invoke(&request) {
            Ok(reply) if !reply.trim().is_empty() => Some(reply.trim().to_string()),
            Ok(_) => None,
            Err(err) => {
                warn!(event = "key_info_model_failed", error = %err);
                None
            }
        }
    }
}

pub fn hard_truncate(text: &str, budget: usize) -> String {
    text.chars().take(budget).collect()
}

/// Assembles the prior-stage context for a stage prompt. Only results the
/// ledger returns from `prior_to(stage)` are reachable, and each stage's
/// summary is computed once per run.
pub struct StageContext<'a> {
    key_info: KeyInfo<'a>,
    summaries: BTreeMap<Stage, String>,
}

impl<'a> StageContext<'a> {
    pub fn new(key_info: KeyInfo<'a>) -> Self {
        Self {
            key_info,
            summaries: BTreeMap::new(),
        }
    }

    pub fn for_stage(&mut self, ledger: &PhaseLedger, stage: Stage) -> String {
        let mut sections = Vec::new();
        for result in ledger.prior_to(stage) {
            let summary = self.summary_of(result);
            sections.push(format!("## {}\n{}", result.stage.title(), summary));
        }
        sections.join("\n\n")
    }

    /// Bounded contribution of one earlier stage.
    pub fn summary_of(&mut self, result: &PhaseResult) -> String {
        if let Some(cached) = self.summaries.get(&result.stage) {
            return cached.clone();
        }
        let summary = if result.is_completed() {
            self.key_info.summarize(&result.raw_output)
        } else {
            hard_truncate(
                &format!("(stage failed: {})", result.raw_output.trim()),
                self.key_info.budget(),
            )
        };
        self.summaries.insert(result.stage, summary.clone());
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::{BannerError, BannerResult};

    struct EchoAgent {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl EchoAgent {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AgentModel for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        fn invoke(&self, request: &AgentRequest) -> BannerResult<String> {
            assert_eq!(request.task, AgentTask::KeyInfo);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .ok_or_else(|| BannerError::Model("offline".to_string()))
        }
    }

    #[test]
    fn short_text_passes_through_without_a_call() {
        let agent = EchoAgent::replying("unused");
        let key_info = KeyInfo::new(Some(&agent), 50);
        assert_eq!(key_info.summarize("  brief  "), "brief");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn verbose_summaries_are_retried_then_cut_to_budget() {
        let agent = EchoAgent::replying(&"摘要".repeat(40));
        let key_info = KeyInfo::new(Some(&agent), 20);
        let summary = key_info.summarize(&"x".repeat(500));
        assert_eq!(summary.chars().count(), 20);
        assert_eq!(agent.calls.load(Ordering::SeqCst), MAX_SUMMARY_DEPTH);
    }

    #[test]
    fn summarizer_failure_falls_back_to_truncation() {
        let agent = EchoAgent::failing();
        let key_info = KeyInfo::new(Some(&agent), 10);
        assert_eq!(key_info.summarize(&"y".repeat(30)), "y".repeat(10));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_context_only_sees_earlier_stages_and_caches() -> anyhow::Result<()> {
        let agent = EchoAgent::replying("short summary");
        let mut ledger = PhaseLedger::new();
        ledger.record_completed(Stage::Analysis, "A".repeat(600), None)?;
        ledger.record_failed(Stage::Marketing, "model timed out")?;
        ledger.record_completed(Stage::LayerDesign, "design body", None)?;

        let mut context = StageContext::new(KeyInfo::new(Some(&agent), 500));
        let for_marketing = context.for_stage(&ledger, Stage::Marketing);
        assert!(for_marketing.contains("Event analysis"));
        assert!(!for_marketing.contains("Marketing plan"));
        assert!(!for_marketing.contains("design body"));

        let for_routing = context.for_stage(&ledger, Stage::LayerRouting);
        assert!(for_routing.contains("short summary"));
        assert!(for_routing.contains("(stage failed: model timed out)"));
        assert!(for_routing.contains("design body"));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
