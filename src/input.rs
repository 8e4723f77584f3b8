//! Reading work items from input files.
//!
//! Accepted layouts:
//! - a JSON array whose entries are question strings or work item objects;
//! - a JSON product catalog, `{"products": [{"search_params": {...}}]}`;
//! - anything else is plain text, one question per non-empty line.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::{ResearchError, Result};
use crate::model::WorkItem;

/// Prompt used for catalog products; the product fields follow as context.
pub const PRODUCT_PROMPT: &str = "Search for information about the following product:";

#[derive(Deserialize)]
#[serde(untagged)]
enum Entry {
    Question(String),
    Item(WorkItem),
}

#[derive(Deserialize)]
struct Catalog {
    products: Vec<Product>,
}

#[derive(Deserialize)]
struct Product {
    search_params: BTreeMap<String, Value>,
}

fn param_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl From<Product> for WorkItem {
    fn from(product: Product) -> Self {
        let context = product
            .search_params
            .into_iter()
            .map(|(key, value)| (key, param_text(value)))
            .collect();
        WorkItem::with_context(PRODUCT_PROMPT, context)
    }
}

/// Parses input text. JSON is tried first when the text looks like JSON.
pub fn parse_work_items(text: &str) -> Result<Vec<WorkItem>> {
    let trimmed = text.trim_start();
    let items = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<Entry>>(text)?
            .into_iter()
            .map(|entry| match entry {
                Entry::Question(prompt) => WorkItem::new(prompt),
                Entry::Item(item) => item,
            })
            .collect::<Vec<_>>()
    } else if trimmed.starts_with('{') {
        serde_json::from_str::<Catalog>(text)?
            .products
            .into_iter()
            .map(WorkItem::from)
            .collect()
    } else {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(WorkItem::new)
            .collect()
    };

    if let Some(pos) = items.iter().position(|item| item.prompt.trim().is_empty()) {
        return Err(ResearchError::Input(format!(
            "item {} has an empty prompt",
            pos + 1
        )));
    }
    Ok(items)
}

pub fn read_work_items(path: &Path) -> Result<Vec<WorkItem>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ResearchError::Input(format!("cannot read {}: {e}", path.display())))?;
    let items = parse_work_items(&text)?;
    if items.is_empty() {
        return Err(ResearchError::Input(format!(
            "{} contains no work items",
            path.display()
        )));
    }
    info!(path = %path.display(), items = items.len(), "work items loaded");
    Ok(items)
}
