use crate::config::PlanConfig;
use crate::domain::types::UsageGroupDefinition;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A plan and the usage groups it meters
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub usage_groups: Vec<UsageGroupDefinition>,
}

impl Plan {
    pub fn new(id: impl Into<String>, usage_groups: Vec<UsageGroupDefinition>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            usage_groups,
        }
    }

    pub fn usage_group(&self, name: &str) -> Option<&UsageGroupDefinition> {
        self.usage_groups.iter().find(|g| g.name == name)
    }
}

impl From<&PlanConfig> for Plan {
    fn from(config: &PlanConfig) -> Self {
        Self {
            id: config.id.clone(),
            title: if config.title.is_empty() {
                config.id.clone()
            } else {
                config.title.clone()
            },
            usage_groups: config.usage_groups.clone(),
        }
    }
}

/// Source of plan metadata: which usage groups a plan meters, their kind
/// and the free quota granted per revision.
pub trait PlanDefinition: Send + Sync {
    fn plan(&self, plan_id: &str) -> Option<Plan>;
}

/// Plans held in memory, usually loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: Arc<RwLock<HashMap<String, Plan>>>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(plans: &[PlanConfig]) -> Self {
        let catalog = Self::new();
        for plan in plans {
            catalog.insert(Plan::from(plan));
        }
        catalog
    }

    pub fn insert(&self, plan: Plan) {
        if let Ok(mut plans) = self.plans.write() {
            plans.insert(plan.id.clone(), plan);
        }
    }

    pub fn len(&self) -> usize {
        self.plans.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PlanDefinition for PlanCatalog {
    fn plan(&self, plan_id: &str) -> Option<Plan> {
        self.plans.read().ok()?.get(plan_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_catalog_from_config() {
        let configs = vec![PlanConfig {
            id: "team".to_string(),
            title: String::new(),
            usage_groups: vec![
                UsageGroupDefinition::gauge("environments", dec!(2)),
                UsageGroupDefinition::counter("bandwidth", dec!(100)),
            ],
        }];

        let catalog = PlanCatalog::from_config(&configs);
        assert_eq!(catalog.len(), 1);

        let plan = catalog.plan("team").unwrap();
        assert_eq!(plan.title, "team");
        assert_eq!(
            plan.usage_group("bandwidth").map(|g| g.free_quantity),
            Some(dec!(100))
        );
        assert!(plan.usage_group("seats").is_none());
        assert!(catalog.plan("enterprise").is_none());
    }
}
