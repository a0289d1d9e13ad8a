//! Extraction profiles: the prompt and output schema for one document type.
//!
//! A profile lives on disk as a directory under the catalog root:
//!
//! ```text
//! profiles/
//! ├── estado/v0/          ← card statements
//! │   ├── prompt.md
//! │   └── schema.json
//! └── lineas_gastos/v0/   ← receipt line items
//!     ├── prompt.md
//!     └── schema.json
//! ```
//!
//! Keeping prompts out of the binary lets the extraction wording change
//! without a rebuild; tests load profiles from memory instead.

use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Appended to every system prompt so the model answers with bare JSON.
pub const SCHEMA_INSTRUCTION: &str = "Respond with a single JSON value that validates against the \
JSON schema below. Output ONLY the JSON: no markdown fences, no commentary.";

/// Heading placed before the parsed statement in card-reconciliation mode.
pub const STATEMENT_HEADER: &str = "PARSED CARD STATEMENT (JSON):";

/// Instruction placed after the parsed statement in card-reconciliation mode.
pub const STATEMENT_INSTRUCTION: &str =
    "Use this statement to fill the 'Estado de cuenta' field of every item.";

/// Prompt + output schema for one document type.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub prompt: String,
    pub output_schema: Value,
}

impl Profile {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>, output_schema: Value) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            output_schema,
        }
    }

    /// Copy of this profile whose prompt also carries the parsed statement.
    pub fn with_statement(&self, parsed: &Value) -> Self {
        let payload = serde_json::to_string_pretty(parsed).unwrap_or_else(|_| parsed.to_string());
        let prompt = [
            self.prompt.trim().to_string(),
            format!("{STATEMENT_HEADER}\n{payload}"),
            STATEMENT_INSTRUCTION.to_string(),
        ]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
        Self {
            prompt,
            ..self.clone()
        }
    }

    /// Full system message: prompt, then the schema instruction and schema.
    pub fn system_prompt(&self) -> String {
        let mut out = self.prompt.trim().to_string();
        if !self.output_schema.is_null() {
            let schema = serde_json::to_string_pretty(&self.output_schema)
                .unwrap_or_else(|_| self.output_schema.to_string());
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(SCHEMA_INSTRUCTION);
            out.push_str("\n\n");
            out.push_str(&schema);
        }
        out
    }
}

/// Source of named profiles.
#[async_trait]
pub trait ProfileCatalog: Send + Sync {
    async fn load(&self, name: &str) -> Result<Profile, CollaboratorError>;
}

/// Profiles stored as `{root}/{name}/prompt.md` + `{root}/{name}/schema.json`.
#[derive(Debug, Clone)]
pub struct DirProfileCatalog {
    root: PathBuf,
}

impl DirProfileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ProfileCatalog for DirProfileCatalog {
    async fn load(&self, name: &str) -> Result<Profile, CollaboratorError> {
        if name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(CollaboratorError::Other(format!("Invalid profile name '{name}'")));
        }
        let dir = self.root.join(name);
        let prompt_path = dir.join("prompt.md");
        let prompt = tokio::fs::read_to_string(&prompt_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    CollaboratorError::NotFound(format!("profile '{name}' ({})", prompt_path.display()))
                }
                _ => CollaboratorError::Io(e),
            })?;

        // A profile without a schema is allowed; the prompt must then describe the output.
        let schema_path = dir.join("schema.json");
        let output_schema = match tokio::fs::read_to_string(&schema_path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                CollaboratorError::Other(format!("Invalid schema for profile '{name}': {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Null,
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded profile '{}' from {}", name, dir.display());
        Ok(Profile::new(name, prompt, output_schema))
    }
}

/// Fixed set of profiles held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticProfileCatalog {
    profiles: HashMap<String, Profile>,
}

impl StaticProfileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, profile: Profile) -> Self {
        self.profiles.insert(profile.name.clone(), profile);
        self
    }
}

#[async_trait]
impl ProfileCatalog for StaticProfileCatalog {
    async fn load(&self, name: &str) -> Result<Profile, CollaboratorError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("profile '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statement_is_woven_after_prompt() {
        let p = Profile::new("lineas_gastos/v0", "Extract line items.\n", Value::Null);
        let woven = p.with_statement(&json!({"movimientos": [{"monto": 1200}]}));
        assert!(woven.prompt.starts_with("Extract line items.\n\nPARSED CARD STATEMENT (JSON):\n{"));
        assert!(woven.prompt.contains("\"monto\": 1200"));
        assert!(woven.prompt.ends_with(STATEMENT_INSTRUCTION));
        assert_eq!(woven.name, p.name);
        // Original untouched.
        assert_eq!(p.prompt, "Extract line items.\n");
    }

    #[test]
    fn system_prompt_carries_schema() {
        let p = Profile::new("estado/v0", "Read the statement.", json!({"type": "object"}));
        let sys = p.system_prompt();
        assert!(sys.starts_with("Read the statement.\n\n"));
        assert!(sys.contains(SCHEMA_INSTRUCTION));
        assert!(sys.contains("\"type\": \"object\""));

        let bare = Profile::new("x", "Only prompt", Value::Null);
        assert_eq!(bare.system_prompt(), "Only prompt");
    }

    #[tokio::test]
    async fn dir_catalog_loads_prompt_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("estado/v0");
        std::fs::create_dir_all(&p).unwrap();
        std::fs::write(p.join("prompt.md"), "Read it").unwrap();
        std::fs::write(p.join("schema.json"), r#"{"type":"object"}"#).unwrap();

        let catalog = DirProfileCatalog::new(dir.path());
        let profile = catalog.load("estado/v0").await.unwrap();
        assert_eq!(profile.prompt, "Read it");
        assert_eq!(profile.output_schema, json!({"type": "object"}));

        assert!(matches!(
            catalog.load("missing/v1").await.unwrap_err(),
            CollaboratorError::NotFound(_)
        ));
        assert!(catalog.load("../etc").await.is_err());
    }

    #[tokio::test]
    async fn static_catalog() {
        let catalog = StaticProfileCatalog::new().with(Profile::new("a", "p", Value::Null));
        assert_eq!(catalog.load("a").await.unwrap().prompt, "p");
        assert!(catalog.load("b").await.is_err());
    }
}
