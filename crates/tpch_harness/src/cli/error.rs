//! Helpful error rendering for CLI commands
//!
//! Every error includes:
//! - What went wrong
//! - Context about the situation
//! - Suggestions for how to fix it

use crate::error::HarnessError;
use crate::orchestrator::WorkflowError;
use std::fmt;

/// An error with helpful context and suggestions
#[derive(Debug)]
pub struct HelpfulError {
    /// The main error message
    pub message: String,
    /// Additional context about what was happening
    pub context: Option<String>,
    /// Suggestions for how to fix the error
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Best rendering for whatever a command returned.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(helpful) = err.downcast_ref::<HelpfulError>() {
            return Self {
                message: helpful.message.clone(),
                context: helpful.context.clone(),
                suggestions: helpful.suggestions.clone(),
            };
        }
        if let Some(workflow) = err.downcast_ref::<WorkflowError>() {
            return Self::from(workflow);
        }
        if let Some(harness) = err.downcast_ref::<HarnessError>() {
            return Self::from(harness);
        }
        Self::new(format!("{:#}", err))
    }
}

impl From<&HarnessError> for HelpfulError {
    fn from(err: &HarnessError) -> Self {
        let mut helpful = Self::new(err.to_string());
        if let Some(suggestion) = err.suggestion() {
            helpful = helpful.with_suggestion(suggestion);
        }
        helpful
    }
}

impl From<&WorkflowError> for HelpfulError {
    fn from(err: &WorkflowError) -> Self {
        let mut helpful = Self::from(&err.primary).with_context(format!("Step '{}' failed", err.step));
        if let Some(cleanup) = &err.cleanup {
            helpful = helpful.with_suggestion(format!(
                "NOTE: stopping the server afterwards also failed: {}",
                cleanup
            ));
            if let Some(suggestion) = cleanup.suggestion() {
                helpful = helpful.with_suggestion(suggestion);
            }
        }
        helpful
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;

        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }

        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for HelpfulError {}
