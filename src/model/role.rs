use serde::{Deserialize, Serialize};

use super::record::WorkItem;

const CITATION_DIRECTIVE: &str = "IMPORTANT: For every piece of information, include the complete URL \
where you found it, formatted as 'Source: https://example.com' right after each section. \
Do not use numbered references like [1] without the full URL.";

/// One processing lane: which agent runs the items and what it focuses on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleContext {
    pub name: String,
    pub agent: String,
    #[serde(default)]
    pub focus: Option<String>,
}

fn context_label(key: &str) -> &str {
    match key {
        "upc" => "UPC",
        "short_desc" => "Product Name",
        "long_desc" => "Description",
        other => other,
    }
}

impl RoleContext {
    pub fn new(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            focus: None,
        }
    }

    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus = Some(focus.into());
        self
    }

    /// The message posted for `item`. A plain item on a role without focus
    /// is sent verbatim.
    pub fn render_prompt(&self, item: &WorkItem) -> String {
        if item.context.is_none() && self.focus.is_none() {
            return item.prompt.clone();
        }

        let mut prompt = item.prompt.trim_end().to_string();
        if let Some(context) = &item.context {
            prompt.push_str("\n\n");
            for (key, value) in context {
                prompt.push_str(&format!("{}: {}\n", context_label(key), value));
            }
        }
        if let Some(focus) = &self.focus {
            prompt.push_str("\n\n");
            prompt.push_str(focus.trim());
            prompt.push_str("\n\n");
            prompt.push_str(CITATION_DIRECTIVE);
        }
        prompt
    }
}
