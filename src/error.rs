use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Config edit error: {0}")]
    TomlEdit(#[from] toml_edit::TomlError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("No approval rule matches amount {amount:.2} (critical supplier: {is_critical})")]
    NoMatchingRule { amount: f64, is_critical: bool },

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Limite de requêtes atteinte, veuillez réessayer dans quelques instants.")]
    RateLimited,

    #[error("Crédits IA épuisés, veuillez recharger votre espace de travail.")]
    PaymentRequired,

    #[error("AI gateway error {status}: {body}")]
    Gateway { status: u16, body: String },
}

impl AppError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AppError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Invalid(_) | AppError::NoMatchingRule { .. } => 2,
            AppError::NotFound { .. } => 3,
            AppError::Config(_) | AppError::TomlParse(_) | AppError::TomlEdit(_) => 4,
            AppError::RateLimited
            | AppError::PaymentRequired
            | AppError::Gateway { .. }
            | AppError::Http(_) => 5,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_limits_have_french_messages() {
        assert!(AppError::RateLimited.to_string().starts_with("Limite de requêtes"));
        assert!(AppError::PaymentRequired.to_string().contains("recharger"));
    }

    #[test]
    fn exit_codes_by_category() {
        assert_eq!(AppError::not_found("invoice", 4).exit_code(), 3);
        assert_eq!(AppError::Invalid("x".into()).exit_code(), 2);
        assert_eq!(AppError::RateLimited.exit_code(), 5);
        assert_eq!(AppError::not_found("invoice", 4).to_string(), "invoice 4 not found");
    }
}
