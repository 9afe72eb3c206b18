//! Source-position-tagged diagnostic accumulation.
//!
//! The tokenizer, parser and compiler never abort on the first problem; they
//! push a [`Diagnostic`] and keep going so editor panels can show everything
//! at once.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One reported problem, anchored to a 1-based source position.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}:{}: {tag}: {}", self.line, self.column, self.message)
    }
}

/// Accumulates diagnostics across the whole front end.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, line: u32, column: u32, message: impl Into<String>) {
        self.items.push(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            line,
            column,
        });
    }

    pub fn warning(&mut self, line: u32, column: u32, message: impl Into<String>) {
        self.items.push(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            line,
            column,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.items
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.items)
    }

    /// Log every accumulated diagnostic through the `log` facade.
    pub fn log_all(&self) {
        for diag in &self.items {
            match diag.severity {
                Severity::Warning => log::warn!("{diag}"),
                Severity::Error => log::error!("{diag}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_detected_among_warnings() {
        let mut diags = Diagnostics::new();
        diags.warning(1, 1, "odd spacing");
        assert!(!diags.has_errors());

        diags.error(3, 7, "unexpected token");
        assert!(diags.has_errors());
        assert_eq!(diags.iter().count(), 2);
    }
}
