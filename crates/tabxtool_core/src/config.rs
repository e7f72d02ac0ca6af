use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::pack::{DEFAULT_BATCH_SIZE, DEFAULT_CEILING_BYTES, PackOptions};
use crate::record::Language;
use crate::report::DEFAULT_LONG_FIELD_THRESHOLD;
use crate::tabx::{DEFAULT_DESCRIPTION, DEFAULT_INDENT, TabxLayout};

pub const DEFAULT_PREFIX: &str = "unified_npc_balloon";
pub const DEFAULT_USER_AGENT: &str = "tabxtool/0.1";
pub const DEFAULT_NAMESPACE: &str = "Data";
pub const DEFAULT_SUMMARY: &str = "Upload tabx chunk via tabxtool";
/// Highest remote chunk index inspected when pruning stale pages.
pub const DEFAULT_MAX_REMOTE_CHUNKS: usize = 20;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolConfig {
    #[serde(default)]
    pub pack: PackSection,
    #[serde(default)]
    pub tabx: TabxSection,
    #[serde(default)]
    pub wiki: WikiSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PackSection {
    pub ceiling_bytes: Option<i64>,
    pub batch_size: Option<i64>,
    pub long_field_threshold: Option<usize>,
    pub indent: Option<usize>,
    pub languages: Option<Vec<String>>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TabxSection {
    #[serde(default)]
    pub description: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub namespace: Option<String>,
    pub summary: Option<String>,
    pub max_remote_chunks: Option<usize>,
}

impl ToolConfig {
    pub fn pack_options(&self) -> Result<PackOptions> {
        let options = PackOptions::new(
            self.pack.ceiling_bytes.unwrap_or(DEFAULT_CEILING_BYTES as i64),
            self.pack.batch_size.unwrap_or(DEFAULT_BATCH_SIZE as i64),
            self.pack
                .long_field_threshold
                .unwrap_or(DEFAULT_LONG_FIELD_THRESHOLD),
        )?;
        Ok(options)
    }

    pub fn languages(&self) -> Result<Vec<Language>> {
        let Some(codes) = &self.pack.languages else {
            return Ok(Language::ALL.to_vec());
        };
        let mut languages = Vec::with_capacity(codes.len());
        for code in codes {
            let Some(language) = Language::from_code(code) else {
                bail!("unknown language code in [pack].languages: {code}");
            };
            if languages.contains(&language) {
                bail!("duplicate language code in [pack].languages: {code}");
            }
            languages.push(language);
        }
        Ok(languages)
    }

    pub fn layout(&self) -> Result<TabxLayout> {
        let description = if self.tabx.description.is_empty() {
            BTreeMap::from([("zh".to_string(), DEFAULT_DESCRIPTION.to_string())])
        } else {
            self.tabx.description.clone()
        };
        Ok(TabxLayout::new(
            description,
            &self.languages()?,
            self.pack.indent.unwrap_or(DEFAULT_INDENT),
        ))
    }

    pub fn prefix(&self) -> &str {
        self.pack
            .prefix
            .as_deref()
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or(DEFAULT_PREFIX)
    }

    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        env_override("WIKI_API_URL").or_else(|| self.wiki.api_url.clone())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn namespace(&self) -> &str {
        self.wiki.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn summary(&self) -> &str {
        self.wiki.summary.as_deref().unwrap_or(DEFAULT_SUMMARY)
    }

    pub fn max_remote_chunks(&self) -> usize {
        self.wiki
            .max_remote_chunks
            .unwrap_or(DEFAULT_MAX_REMOTE_CHUNKS)
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load and parse a ToolConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ToolConfig> {
    if !config_path.exists() {
        return Ok(ToolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ToolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
