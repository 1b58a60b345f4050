//! JSON file loading for tier tables and governance tunables.

use std::path::Path;

use super::{ConfigResult, GovernanceConfig, validate_config, validate_tier_table};
use crate::tier::TierTable;

/// Load and validate a tier table from a JSON file keyed by tier name.
pub async fn load_tier_table(path: impl AsRef<Path>) -> ConfigResult<TierTable> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    let table = TierTable::from_json(&content)?;
    validate_tier_table(&table)?;
    tracing::debug!(path = %path.as_ref().display(), tiers = table.len(), "Loaded tier table");
    Ok(table)
}

/// Load governance tunables from a JSON file. A missing file yields defaults.
pub async fn load_config(path: impl AsRef<Path>) -> ConfigResult<GovernanceConfig> {
    let path = path.as_ref();
    if !tokio::fs::try_exists(path).await? {
        return Ok(GovernanceConfig::default());
    }
    let content = tokio::fs::read_to_string(path).await?;
    let config = GovernanceConfig::from_json(&content)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::tier::TierName;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_tier_table() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tiers.json");
        let json = serde_json::to_string_pretty(&TierTable::builtin()).unwrap();
        tokio::fs::write(&path, json).await.unwrap();

        let table = load_tier_table(&path).await.unwrap();
        assert_eq!(table.get(TierName::Enterprise).unwrap().max_pool_size, 50);
    }

    #[tokio::test]
    async fn test_load_tier_table_rejects_incomplete() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tiers.json");
        let only_free = TierTable::empty().with_tier(
            TierName::Free,
            crate::tier::TierConfig::defaults_for(TierName::Free),
        );
        tokio::fs::write(&path, serde_json::to_string(&only_free).unwrap())
            .await
            .unwrap();

        let result = load_tier_table(&path).await;
        assert!(matches!(result, Err(ConfigError::ValidationErrors(_))));
    }

    #[tokio::test]
    async fn test_load_tier_table_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_tier_table(temp_dir.path().join("absent.json")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_load_config_missing_file_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = load_config(temp_dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(config.event_buffer, GovernanceConfig::default().event_buffer);
    }

    #[tokio::test]
    async fn test_load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("governance.json");
        tokio::fs::write(&path, r#"{"event_buffer": 32}"#)
            .await
            .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.event_buffer, 32);
    }
}
