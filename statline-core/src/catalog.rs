//! Source catalog
//!
//! Read-only registry of sources and fallback chains, built once from the
//! validated configuration.

use statline_common::config::{
    validate_catalog, ChainConfig, ExhaustionPolicy, SourceConfig, StatlineConfig,
};
use statline_common::Result;
use std::collections::HashMap;

/// One upstream data provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub weight: u8,
    pub tier: String,
    pub fields: Vec<String>,
    pub timeout_ms: Option<u64>,
}

impl From<&SourceConfig> for Source {
    fn from(config: &SourceConfig) -> Self {
        Self {
            id: config.id.clone(),
            weight: config.weight,
            tier: config.tier.clone(),
            fields: config.fields.clone(),
            timeout_ms: config.timeout_ms,
        }
    }
}

/// Ordered preference list for one logical data need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    pub name: String,
    pub sources: Vec<String>,
    pub exhaustion: ExhaustionPolicy,
}

impl From<&ChainConfig> for FallbackChain {
    fn from(config: &ChainConfig) -> Self {
        Self {
            name: config.name.clone(),
            sources: config.sources.clone(),
            exhaustion: config.exhaustion,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceCatalog {
    sources: Vec<Source>,
    chains: Vec<FallbackChain>,
    source_index: HashMap<String, usize>,
    chain_index: HashMap<String, usize>,
}

impl SourceCatalog {
    pub fn from_config(config: &StatlineConfig) -> Result<Self> {
        Self::new(&config.sources, &config.chains)
    }

    /// Validate and index sources and chains
    pub fn new(sources: &[SourceConfig], chains: &[ChainConfig]) -> Result<Self> {
        validate_catalog(sources, chains)?;

        let sources: Vec<Source> = sources.iter().map(Source::from).collect();
        let chains: Vec<FallbackChain> = chains.iter().map(FallbackChain::from).collect();

        let source_index = sources
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        let chain_index = chains
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        tracing::debug!(
            sources = sources.len(),
            chains = chains.len(),
            "Source catalog built"
        );

        Ok(Self {
            sources,
            chains,
            source_index,
            chain_index,
        })
    }

    pub fn source(&self, id: &str) -> Option<&Source> {
        self.source_index.get(id).map(|&i| &self.sources[i])
    }

    pub fn weight(&self, id: &str) -> Option<u8> {
        self.source(id).map(|s| s.weight)
    }

    pub fn chain(&self, name: &str) -> Option<&FallbackChain> {
        self.chain_index.get(name).map(|&i| &self.chains[i])
    }

    /// Names of every chain listing `source_id`, in declaration order
    pub fn chains_for_source(&self, source_id: &str) -> Vec<&str> {
        self.chains
            .iter()
            .filter(|c| c.sources.iter().any(|s| s == source_id))
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn chains(&self) -> &[FallbackChain] {
        &self.chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str, weight: u8) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            weight,
            tier: "standard".to_string(),
            fields: vec![],
            timeout_ms: None,
        }
    }

    fn chain(name: &str, sources: &[&str], exhaustion: ExhaustionPolicy) -> ChainConfig {
        ChainConfig {
            name: name.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            exhaustion,
        }
    }

    #[test]
    fn test_lookup_and_membership() {
        let catalog = SourceCatalog::new(
            &[source("nbac", 100), source("reconstruct", 85), source("espn", 80)],
            &[
                chain("team_boxscores", &["nbac", "reconstruct", "espn"], ExhaustionPolicy::Fail),
                chain("schedule", &["espn"], ExhaustionPolicy::Skip),
            ],
        )
        .unwrap();

        assert_eq!(catalog.weight("reconstruct"), Some(85));
        assert_eq!(catalog.weight("bdl"), None);
        assert_eq!(
            catalog.chain("team_boxscores").unwrap().sources,
            vec!["nbac", "reconstruct", "espn"]
        );
        assert_eq!(catalog.chains_for_source("espn"), vec!["team_boxscores", "schedule"]);
        assert_eq!(catalog.chains_for_source("nbac"), vec!["team_boxscores"]);
        assert!(catalog.chain("missing").is_none());
    }

    #[test]
    fn test_construction_rejects_unknown_source() {
        let result = SourceCatalog::new(
            &[source("nbac", 100)],
            &[chain("team_boxscores", &["nbac", "espn"], ExhaustionPolicy::Fail)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_construction_rejects_duplicate_in_chain() {
        let result = SourceCatalog::new(
            &[source("nbac", 100)],
            &[chain("team_boxscores", &["nbac", "nbac"], ExhaustionPolicy::Skip)],
        );
        assert!(result.is_err());
    }
}
