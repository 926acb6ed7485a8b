//! The canonical analysis result.
//!
//! Every field is always present. "No data" is an empty string or an empty
//! list, never `null`, so consumers never need to handle missing fields.

use std::borrow::Cow;

use schemars::JsonSchema;

use crate::prelude::*;

/// Version of the result shape stored in the cache. Bump this whenever
/// [`AnalysisResult`] changes incompatibly, so that old entries are ignored.
pub const RESULT_SCHEMA_VERSION: u32 = 1;

/// Structured content extracted from an image.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisResult {
    /// A description of the image as a whole.
    pub description: String,

    /// All visible text.
    pub text: String,

    /// Menu items, if the image contains a menu or price list.
    pub menu_items: Vec<MenuItem>,

    /// Tabular data.
    pub tables: Vec<Table>,

    /// Free-form insights about the image.
    pub analysis: Vec<String>,
}

impl AnalysisResult {
    /// Every non-empty piece of text in this result.
    ///
    /// Menu items are treated as a single piece of text each, so that a
    /// name and its price are judged together.
    pub fn text_content(&self) -> Vec<Cow<'_, str>> {
        let mut texts = vec![
            Cow::Borrowed(self.description.as_str()),
            Cow::Borrowed(self.text.as_str()),
        ];
        texts.extend(self.analysis.iter().map(|s| Cow::Borrowed(s.as_str())));
        texts.extend(self.menu_items.iter().map(|item| {
            Cow::Owned(format!(
                "{}{}{}{}",
                item.name, item.description, item.price, item.category
            ))
        }));
        for table in &self.tables {
            texts.extend(table.headers.iter().map(|s| Cow::Borrowed(s.as_str())));
            texts.extend(
                table
                    .rows
                    .iter()
                    .flatten()
                    .map(|s| Cow::Borrowed(s.as_str())),
            );
        }
        texts.retain(|text| !text.is_empty());
        texts
    }

    /// Does this result contain no usable content at all?
    pub fn is_empty(&self) -> bool {
        self.text_content().is_empty()
    }
}

/// A single menu entry.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct MenuItem {
    /// Item name.
    pub name: String,
    /// Price, as printed.
    pub price: String,
    /// Description, if any.
    pub description: String,
    /// Category, such as "Dessert" or "Main Course".
    pub category: String,
}

/// A table with column headers.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct Table {
    /// Column headers.
    pub headers: Vec<String>,
    /// Rows of cells. Rows may have different lengths.
    pub rows: Vec<Vec<String>>,
}
