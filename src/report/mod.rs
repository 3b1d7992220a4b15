//! Report generation boundary.

mod generator;

pub use generator::{format_plan_markdown, generate_json_report, generate_markdown_report};

use crate::models::Run;
use async_trait::async_trait;

/// Produces the final report of a run once it enters `Reporting`.
///
/// Receives the run with fully merged step results, plan history and
/// discovered vulnerabilities.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, run: &Run) -> anyhow::Result<String>;
}

/// Renders the run as a Markdown document.
pub struct MarkdownReporter {
    model: String,
}

impl MarkdownReporter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

#[async_trait]
impl Reporter for MarkdownReporter {
    async fn report(&self, run: &Run) -> anyhow::Result<String> {
        Ok(generate_markdown_report(run, &self.model))
    }
}
