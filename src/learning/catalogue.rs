//! Action catalogue for the Q-learning agent.

use crate::config::CatalogueConfig;

/// Supplies the ordered set of candidate diagnoses
///
/// Order matters: argmax ties resolve to the earliest action.
pub trait ActionCatalogueProvider: Send + Sync {
    fn actions(&self) -> Vec<String>;
}

/// Fixed catalogue, usually taken from configuration
#[derive(Debug, Clone)]
pub struct StaticCatalogue {
    actions: Vec<String>,
}

impl StaticCatalogue {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = std::collections::HashSet::new();
        let actions = actions
            .into_iter()
            .map(Into::into)
            .filter(|a: &String| seen.insert(a.clone()))
            .collect();
        Self { actions }
    }

    pub fn from_config(config: &CatalogueConfig) -> Self {
        Self::new(config.diagnoses.iter().cloned())
    }
}

impl ActionCatalogueProvider for StaticCatalogue {
    fn actions(&self) -> Vec<String> {
        self.actions.clone()
    }
}
