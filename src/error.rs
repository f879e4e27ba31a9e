//! Error types for formula runs.
//!
//! Every variant is fatal to the run that produced it. The messages carry the
//! step index, the command and the expected vs actual values so an operator
//! can diagnose a failure without rerunning with `--debug`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormaError {
    /// The descriptor failed authoring-time validation.
    #[error("Invalid formula '{name}': {reason}")]
    InvalidFormula { name: String, reason: String },

    /// No formula with this name exists in the index.
    #[error("No formula named '{0}'")]
    FormulaNotFound(String),

    /// The formula has no registered keg.
    #[error("'{0}' is not installed")]
    NotInstalled(String),

    #[error("Could not resolve dependency '{dependency}' of '{formula}': {reason}")]
    DependencyResolution {
        formula: String,
        dependency: String,
        reason: String,
    },

    #[error("Failed to download {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("SHA-256 mismatch for {url}\n  expected: {expected}\n    actual: {actual}")]
    IntegrityMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// An install step failed. `step` is 1-based.
    #[error("Install step {step} (`{command}`) failed: {detail}")]
    BuildStep {
        step: usize,
        command: String,
        exit_code: Option<i32>,
        detail: String,
    },

    /// A test step failed its assertion. `step` is 1-based.
    #[error("Test step {step} (`{command}`) failed: {reason}")]
    TestAssertion {
        step: usize,
        command: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FormaError {
    /// Short name of the error kind, used when reporting a failed run.
    pub fn kind(&self) -> &'static str {
        match self {
            FormaError::InvalidFormula { .. } => "InvalidFormula",
            FormaError::FormulaNotFound(_) => "FormulaNotFound",
            FormaError::NotInstalled(_) => "NotInstalled",
            FormaError::DependencyResolution { .. } => "DependencyResolutionError",
            FormaError::Network { .. } => "NetworkError",
            FormaError::IntegrityMismatch { .. } => "IntegrityMismatchError",
            FormaError::BuildStep { .. } => "BuildStepError",
            FormaError::TestAssertion { .. } => "TestAssertionError",
            FormaError::Io(_) => "IoError",
            FormaError::Other(_) => "Error",
        }
    }
}

pub type Result<T> = std::result::Result<T, FormaError>;
