use crate::error::{AppError, Result};
use serde::Deserialize;
use std::{fs, path::Path};
use toml_edit::{DocumentMut, Item, Table, value};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = ".config/invoice_flow.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub accounting: AccountingSection,
}

fn default_db_path() -> String {
    "data/invoices.db".to_string()
}

fn default_storage_dir() -> String {
    "data/documents".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    #[default]
    Remote,
    Ollama,
    Heuristics,
}

/// Which chat endpoint extraction and the assistants talk to.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub backend: LlmBackend,
    #[serde(default)]
    pub remote: RemoteEndpoint,
    #[serde(default)]
    pub ollama: OllamaEndpoint,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            remote: RemoteEndpoint::default(),
            ollama: OllamaEndpoint::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}

/// Hosted OpenAI-compatible gateway. Missing keys fall back field by field.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteEndpoint {
    pub base_url: String,
    pub model: String,
}

impl Default for RemoteEndpoint {
    fn default() -> Self {
        Self {
            base_url: "https://ai.gateway.lovable.dev/v1".to_string(),
            model: "google/gemini-2.5-flash".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaEndpoint {
    pub base_url: String,
    pub model: String,
}

impl Default for OllamaEndpoint {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "qwen2.5vl:7b".to_string(),
        }
    }
}

/// Accounts and journal used by the accounting export.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountingSection {
    #[serde(default = "default_journal")]
    pub purchase_journal: String,
    #[serde(default = "default_expense_account")]
    pub expense_account: String,
    #[serde(default = "default_vat_account")]
    pub vat_account: String,
    #[serde(default = "default_supplier_account")]
    pub supplier_account: String,
}

impl Default for AccountingSection {
    fn default() -> Self {
        Self {
            purchase_journal: default_journal(),
            expense_account: default_expense_account(),
            vat_account: default_vat_account(),
            supplier_account: default_supplier_account(),
        }
    }
}

fn default_journal() -> String {
    "HA".to_string()
}

fn default_expense_account() -> String {
    "607000".to_string()
}

fn default_vat_account() -> String {
    "445660".to_string()
}

fn default_supplier_account() -> String {
    "401000".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage_dir: default_storage_dir(),
            llm: LlmSection::default(),
            accounting: AccountingSection::default(),
        }
    }
}

impl Config {
    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Set a dotted key (e.g. `llm.remote.model`) in the config file, keeping
    /// the rest of the document untouched.
    pub fn set_value(path: impl AsRef<Path>, key: &str, new_value: &str) -> Result<()> {
        let path = path.as_ref();
        let content = if path.exists() {
            fs::read_to_string(path)?
        } else {
            String::new()
        };
        let updated = set_in_document(&content, key, new_value)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, updated)?;
        info!(key = %key, path = %path.display(), "Config updated");
        Ok(())
    }
}

fn set_in_document(content: &str, key: &str, new_value: &str) -> Result<String> {
    let mut doc = content.parse::<DocumentMut>()?;
    let parts: Vec<&str> = key.split('.').collect();
    let Some((last, sections)) = parts.split_last() else {
        return Err(AppError::Config("empty key".into()));
    };
    if last.is_empty() || sections.iter().any(|s| s.is_empty()) {
        return Err(AppError::Config(format!("invalid key '{key}'")));
    }

    let mut table: &mut Table = doc.as_table_mut();
    for section in sections {
        let entry = table
            .entry(section)
            .or_insert_with(|| Item::Table(Table::new()));
        table = entry
            .as_table_mut()
            .ok_or_else(|| AppError::Config(format!("'{section}' is not a table")))?;
    }

    // Keep numbers and booleans typed so the file still deserializes.
    table[*last] = if let Ok(b) = new_value.parse::<bool>() {
        value(b)
    } else if let Ok(n) = new_value.parse::<i64>() {
        value(n)
    } else {
        value(new_value)
    };
    Ok(doc.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.db_path, "data/invoices.db");
        assert_eq!(cfg.llm.backend, LlmBackend::Remote);
        assert_eq!(cfg.accounting.supplier_account, "401000");
    }

    #[test]
    fn backend_and_endpoint_override() {
        let cfg = Config::parse(
            r#"
            db_path = "x.db"
            [llm]
            backend = "heuristics"
            [llm.ollama]
            base_url = "http://gpu:11434/v1"
            model = "llava"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.db_path, "x.db");
        assert_eq!(cfg.llm.backend, LlmBackend::Heuristics);
        assert_eq!(cfg.llm.ollama.model, "llava");
        assert_eq!(cfg.llm.remote.model, "google/gemini-2.5-flash");
    }

    #[test]
    fn set_value_preserves_other_entries() {
        let original = "# invoices\ndb_path = \"a.db\"\n\n[llm]\nbackend = \"remote\"\n";
        let updated = set_in_document(original, "llm.remote.model", "gpt-4o").unwrap();
        assert!(updated.contains("# invoices"));
        let cfg = Config::parse(&updated).unwrap();
        assert_eq!(cfg.db_path, "a.db");
        assert_eq!(cfg.llm.remote.model, "gpt-4o");

        let updated = set_in_document(&updated, "llm.timeout_secs", "30").unwrap();
        assert_eq!(Config::parse(&updated).unwrap().llm.timeout_secs, 30);
    }

    #[test]
    fn partial_endpoint_tables_keep_field_defaults() {
        let cfg = Config::parse("[llm.remote]\nmodel = \"gpt-4o\"\n[llm.ollama]\nbase_url = \"http://gpu:11434/v1\"\n").unwrap();
        assert_eq!(cfg.llm.remote.model, "gpt-4o");
        assert_eq!(cfg.llm.remote.base_url, "https://ai.gateway.lovable.dev/v1");
        assert_eq!(cfg.llm.ollama.base_url, "http://gpu:11434/v1");
        assert_eq!(cfg.llm.ollama.model, "qwen2.5vl:7b");
    }

    #[test]
    fn set_value_rejects_bad_keys() {
        assert!(set_in_document("", "llm..model", "x").is_err());
        assert!(set_in_document("db_path = \"a\"", "db_path.inner", "x").is_err());
    }
}
