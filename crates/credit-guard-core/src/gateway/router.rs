use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ModelTier;

const FAST_TASKS: &[&str] = &[
    "validation",
    "summary",
    "simple_classification",
    "data_extraction",
    "format_conversion",
    "quick_check",
];

const CAPABLE_TASKS: &[&str] = &[
    "financial_analysis",
    "risk_assessment",
    "scenario_analysis",
    "strategic_planning",
    "complex_reasoning",
    "explanation_generation",
];

/// Task category to model tier table. Unknown tasks go to the capable tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    pub routes: BTreeMap<String, ModelTier>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let routes = FAST_TASKS
            .iter()
            .map(|task| (task.to_string(), ModelTier::Fast))
            .chain(
                CAPABLE_TASKS
                    .iter()
                    .map(|task| (task.to_string(), ModelTier::Capable)),
            )
            .collect();
        Self { routes }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecommendation {
    pub task: String,
    pub tier: ModelTier,
    pub deployment: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRouter {
    table: RoutingTable,
    fast_deployment: String,
    capable_deployment: String,
}

impl ModelRouter {
    pub fn new(
        table: RoutingTable,
        fast_deployment: impl Into<String>,
        capable_deployment: impl Into<String>,
    ) -> Self {
        Self {
            table,
            fast_deployment: fast_deployment.into(),
            capable_deployment: capable_deployment.into(),
        }
    }

    pub fn tier_for(&self, task: &str) -> ModelTier {
        self.table
            .routes
            .get(&normalize(task))
            .copied()
            .unwrap_or(ModelTier::Capable)
    }

    pub fn recommend(&self, task: &str) -> ModelRecommendation {
        let key = normalize(task);
        let (tier, reason) = match self.table.routes.get(&key) {
            Some(ModelTier::Fast) => (
                ModelTier::Fast,
                "simple task: fast tier keeps cost and latency low",
            ),
            Some(ModelTier::Capable) => (
                ModelTier::Capable,
                "complex task: capable tier gives higher quality",
            ),
            None => (
                ModelTier::Capable,
                "unknown task: defaulting to the capable tier",
            ),
        };
        ModelRecommendation {
            task: key,
            tier,
            deployment: self.deployment(tier).to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn deployment(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_deployment,
            ModelTier::Capable => &self.capable_deployment,
        }
    }

    /// Known task names grouped by tier.
    pub fn tasks(&self) -> impl Iterator<Item = (&str, ModelTier)> {
        self.table
            .routes
            .iter()
            .map(|(task, tier)| (task.as_str(), *tier))
    }
}

fn normalize(task: &str) -> String {
    task.trim().to_lowercase().replace([' ', '-'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ModelRouter {
        ModelRouter::new(RoutingTable::default(), "gpt-4o-mini", "gpt-4o")
    }

    #[test]
    fn routes_known_tasks() {
        let router = router();
        assert_eq!(router.tier_for("validation"), ModelTier::Fast);
        assert_eq!(router.tier_for("Risk Assessment"), ModelTier::Capable);
        let rec = router.recommend("summary");
        assert_eq!(rec.deployment, "gpt-4o-mini");
        assert_eq!(rec.tier, ModelTier::Fast);
    }

    #[test]
    fn unknown_tasks_default_to_capable() {
        let rec = router().recommend("poetry");
        assert_eq!(rec.tier, ModelTier::Capable);
        assert_eq!(rec.deployment, "gpt-4o");
        assert!(rec.reason.contains("unknown"));
    }

    #[test]
    fn table_is_configuration() {
        let table: RoutingTable =
            serde_json::from_str(r#"{"translation":"fast","validation":"capable"}"#).unwrap();
        let router = ModelRouter::new(table, "mini", "full");
        assert_eq!(router.tier_for("translation"), ModelTier::Fast);
        assert_eq!(router.tier_for("validation"), ModelTier::Capable);
        assert_eq!(router.tasks().count(), 2);
    }
}
