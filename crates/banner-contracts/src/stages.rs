use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Marketing,
    LayerDesign,
    LayerRouting,
    LayerGeneration,
    HtmlComposition,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Analysis,
        Stage::Marketing,
        Stage::LayerDesign,
        Stage::LayerRouting,
        Stage::LayerGeneration,
        Stage::HtmlComposition,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Analysis => 0,
            Self::Marketing => 1,
            Self::LayerDesign => 2,
            Self::LayerRouting => 3,
            Self::LayerGeneration => 4,
            Self::HtmlComposition => 5,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Analysis => "event_analysis",
            Self::Marketing => "marketing_plan",
            Self::LayerDesign => "layer_design",
            Self::LayerRouting => "layer_routing",
            Self::LayerGeneration => "layer_generation",
            Self::HtmlComposition => "html_composition",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Analysis => "Event analysis",
            Self::Marketing => "Marketing plan",
            Self::LayerDesign => "Layer design",
            Self::LayerRouting => "Layer routing",
            Self::LayerGeneration => "Layer generation",
            Self::HtmlComposition => "HTML composition",
        }
    }

    /// File name under `documents/` holding the stage's raw output.
    pub fn document_name(self) -> String {
        match self {
            Self::LayerGeneration => format!("{}.json", self.key()),
            _ => format!("{}.md", self.key()),
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            Self::HtmlComposition => Capability::CodeGeneration,
            _ => Capability::TextGeneration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub stage: Stage,
    pub status: StageStatus,
    /// Agent text on success, error text on failure.
    pub raw_output: String,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl PhaseResult {
    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }
}

/// Append-only record of stage results for one run.
///
/// Results are accepted only in stage order, each stage at most once, and
/// every result gets a timestamp strictly greater than the previous one.
#[derive(Debug, Clone, Default)]
pub struct PhaseLedger {
    results: Vec<PhaseResult>,
}

impl PhaseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(
        &mut self,
        stage: Stage,
        raw_output: impl Into<String>,
        payload: Option<Value>,
    ) -> anyhow::Result<&PhaseResult> {
        self.push(stage, StageStatus::Completed, raw_output.into(), payload)
    }

    pub fn record_failed(
        &mut self,
        stage: Stage,
        error: impl Into<String>,
    ) -> anyhow::Result<&PhaseResult> {
        self.push(stage, StageStatus::Failed, error.into(), None)
    }

    fn push(
        &mut self,
        stage: Stage,
        status: StageStatus,
        raw_output: String,
        payload: Option<Value>,
    ) -> anyhow::Result<&PhaseResult> {
        let expected = self.results.len();
        if stage.index() != expected {
            anyhow::bail!(
                "stage {} recorded out of order (expected index {expected})",
                stage.key()
            );
        }
        let created_at = self.next_timestamp();
        self.results.push(PhaseResult {
            stage,
            status,
            raw_output,
            payload,
            created_at,
        });
        self.results
            .last()
            .ok_or_else(|| anyhow::anyhow!("ledger empty after push"))
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.results.last() {
            Some(last) if now <= last.created_at => last.created_at + Duration::microseconds(1),
            _ => now,
        }
    }

    pub fn get(&self, stage: Stage) -> Option<&PhaseResult> {
        self.results.get(stage.index()).filter(|row| row.stage == stage)
    }

    /// Results of every stage strictly before `stage`.
    pub fn prior_to(&self, stage: Stage) -> &[PhaseResult] {
        let end = stage.index().min(self.results.len());
        &self.results[..end]
    }

    pub fn results(&self) -> &[PhaseResult] {
        &self.results
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() == Stage::ALL.len()
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.results
            .iter()
            .filter(|row| !row.is_completed())
            .map(|row| row.stage)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ledger_accepts_stages_in_order_only() -> anyhow::Result<()> {
        let mut ledger = PhaseLedger::new();
        ledger.record_completed(Stage::Analysis, "analysis", None)?;
        assert!(ledger.record_completed(Stage::LayerDesign, "skip", None).is_err());
        assert!(ledger.record_completed(Stage::Analysis, "again", None).is_err());
        ledger.record_failed(Stage::Marketing, "model timeout")?;
        assert_eq!(ledger.results().len(), 2);
        assert_eq!(ledger.failed_stages(), vec![Stage::Marketing]);
        Ok(())
    }

    #[test]
    fn timestamps_strictly_increase() -> anyhow::Result<()> {
        let mut ledger = PhaseLedger::new();
        for stage in Stage::ALL {
            ledger.record_completed(stage, stage.key(), Some(json!({"ok": true})))?;
        }
        assert!(ledger.is_complete());
        assert!(ledger
            .results()
            .windows(2)
            .all(|pair| pair[0].created_at < pair[1].created_at));
        Ok(())
    }

    #[test]
    fn prior_to_exposes_only_earlier_stages() -> anyhow::Result<()> {
        let mut ledger = PhaseLedger::new();
        for stage in &Stage::ALL[..4] {
            ledger.record_completed(*stage, stage.key(), None)?;
        }
        let prior: Vec<Stage> = ledger
            .prior_to(Stage::LayerDesign)
            .iter()
            .map(|row| row.stage)
            .collect();
        assert_eq!(prior, vec![Stage::Analysis, Stage::Marketing]);
        assert!(ledger.prior_to(Stage::Analysis).is_empty());
        assert_eq!(ledger.prior_to(Stage::HtmlComposition).len(), 4);
        Ok(())
    }

    #[test]
    fn stage_documents_and_capabilities() {
        assert_eq!(Stage::Analysis.document_name(), "event_analysis.md");
        assert_eq!(Stage::LayerGeneration.document_name(), "layer_generation.json");
        assert_eq!(Stage::HtmlComposition.capability(), Capability::CodeGeneration);
        assert_eq!(Stage::Marketing.capability(), Capability::TextGeneration);
    }
}
