//! Named branch keyword sets offered as match selections.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPreset {
    pub label: String,
    pub keywords: Vec<String>,
}

impl BranchPreset {
    pub fn new(label: &str, keywords: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Matcher specification, `Label: kw1, kw2`.
    pub fn spec(&self) -> String {
        format!("{}: {}", self.label, self.keywords.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPresets {
    #[serde(default = "default_version")]
    pub version: u32,
    pub presets: Vec<BranchPreset>,
}

fn default_version() -> u32 {
    1
}

impl Default for BranchPresets {
    fn default() -> Self {
        Self {
            version: 1,
            presets: vec![
                BranchPreset::new("Computer Science", &["cs", "cse", "computer science", "computer engineering"]),
                BranchPreset::new("Electronics", &["ec", "ece", "electronics", "electronics and communication"]),
                BranchPreset::new("Electrical", &["ee", "eee", "electrical"]),
                BranchPreset::new("Information Technology", &["it", "information technology"]),
                BranchPreset::new("Artificial Intelligence", &["ai", "artificial intelligence", "data science"]),
                BranchPreset::new("Mechanical", &["me", "mechanical"]),
                BranchPreset::new("Civil", &["ce", "civil"]),
                BranchPreset::new("Chemical", &["ch", "che", "chemical"]),
            ],
        }
    }
}

impl BranchPresets {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let presets: Self = serde_yaml::from_str(text).context("parsing branch presets")?;
        if let Some(empty) = presets.presets.iter().find(|p| p.keywords.is_empty()) {
            anyhow::bail!("branch preset {:?} has no keywords", empty.label);
        }
        Ok(presets)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Presets from `path` when it exists, the built-in set otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_path(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn find(&self, label: &str) -> Option<&BranchPreset> {
        self.presets.iter().find(|p| p.label.eq_ignore_ascii_case(label.trim()))
    }

    /// Resolves a preset label to its keyword string; other text is used as typed.
    pub fn resolve_spec(&self, label_or_spec: &str) -> String {
        self.find(label_or_spec)
            .map(BranchPreset::spec)
            .unwrap_or_else(|| label_or_spec.to_string())
    }
}
