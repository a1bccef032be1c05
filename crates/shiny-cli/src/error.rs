use shiny::core::io::tables::TableError;
use shiny::engine::error::EngineError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Shiny(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Table I/O failed: {0}")]
    Table(#[from] TableError),

    #[error("Failed to write '{path}': {source}", path = path.display())]
    FileWriting {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse file '{path}': {source}", path = path.display())]
    FileParsing {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a successful command leaves behind, as far as the exit status is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Clean,
    WithIssues(usize),
}

impl Completion {
    pub fn from_issue_count(issues: usize) -> Self {
        if issues == 0 { Self::Clean } else { Self::WithIssues(issues) }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::WithIssues(_) => 2,
        }
    }
}

pub const FATAL_EXIT_CODE: i32 = 1;
