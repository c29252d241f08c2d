use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Required tool not found: {0}")]
    MissingTool(String),

    #[error("Elevated privilege required: {0}")]
    NotPrivileged(String),

    #[error("Provenance log missing or unreadable: {0}")]
    MissingProvenance(String),

    #[error("Unexpected headers in {file}: got [{found}]")]
    InvalidHeaders { file: String, found: String },

    #[error("{label}: {source}")]
    Phase {
        label: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap an error with the current-action label so abnormal termination
    /// names the failing step.
    pub fn at(self, label: &str) -> Error {
        match self {
            Error::Phase { .. } => self,
            other => Error::Phase {
                label: label.to_string(),
                source: Box::new(other),
            },
        }
    }
}
