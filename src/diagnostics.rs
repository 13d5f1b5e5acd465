use std::fmt;

use crate::error::PipelineError;
use crate::pipeline::Problem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Warning,
    Error,
}

/// A build diagnostic tagged with the asset it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: String,
    pub message: String,
}

impl Diagnostic {
    /// Warnings carry the problem's message only.
    pub fn warning(file: &str, problem: &Problem) -> Self {
        Self {
            severity: Severity::Warning,
            file: file.to_owned(),
            message: problem.message.clone(),
        }
    }

    /// Error reported by a stage that still produced output.
    pub fn error(file: &str, problem: &Problem) -> Self {
        Self {
            severity: Severity::Error,
            file: file.to_owned(),
            message: render_error(file, &problem.message, problem.stack.as_deref()),
        }
    }

    /// Error for an asset whose pipeline failed as a whole.
    pub fn failure(file: &str, error: &PipelineError) -> Self {
        Self {
            severity: Severity::Error,
            file: file.to_owned(),
            message: render_error(file, &error.to_string(), error.stack()),
        }
    }
}

fn render_error(file: &str, message: &str, stack: Option<&str>) -> String {
    match stack {
        Some(stack) => format!("{file} from chijimi\n{message}\n{stack}"),
        None => format!("{file} from chijimi\n{message}"),
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Warning => write!(f, "warning in {}: {}", self.file, self.message),
            Severity::Error => write!(f, "error: {}", self.message),
        }
    }
}
