//! Coercing loosely-typed model output into an [`AnalysisResult`].
//!
//! This never fails. Each field is handled on its own, and a missing or
//! wrongly-typed field becomes its empty default without affecting its
//! siblings. Unknown fields are dropped.

use serde_json::Map;

use crate::{
    prelude::*,
    result::{AnalysisResult, MenuItem, Table},
};

/// Coerce an arbitrary JSON value into an [`AnalysisResult`].
pub fn sanitize_result(value: &Value) -> AnalysisResult {
    let Some(obj) = value.as_object() else {
        warn!(kind = json_kind(value), "Model output is not an object, using empty result");
        return AnalysisResult::default();
    };

    AnalysisResult {
        description: string_field(obj, "description"),
        text: string_field(obj, "text"),
        menu_items: array_field(obj, "menuItems")
            .iter()
            .map(sanitize_menu_item)
            .collect(),
        tables: array_field(obj, "tables").iter().map(sanitize_table).collect(),
        analysis: array_field(obj, "analysis")
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
    }
}

fn sanitize_menu_item(value: &Value) -> MenuItem {
    let Some(obj) = value.as_object() else {
        return MenuItem::default();
    };
    MenuItem {
        name: scalar_field(obj, "name"),
        price: scalar_field(obj, "price"),
        description: scalar_field(obj, "description"),
        category: scalar_field(obj, "category"),
    }
}

fn sanitize_table(value: &Value) -> Table {
    let Some(obj) = value.as_object() else {
        return Table::default();
    };
    Table {
        headers: array_field(obj, "headers").iter().map(cell_to_string).collect(),
        // Rows which aren't themselves arrays can't be lined up with the
        // headers, so drop them.
        rows: array_field(obj, "rows")
            .iter()
            .filter_map(Value::as_array)
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect(),
    }
}

/// A string field, or empty if it's missing or not a string.
fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// An array field, or empty if it's missing or not an array.
fn array_field<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    obj.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// A field holding a primitive. Numbers and booleans are stringified, so a
/// price of `12.5` survives as `"12.5"`.
fn scalar_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
        _ => String::new(),
    }
}

/// A table cell. Anything that isn't a string is rendered as compact JSON,
/// except `null`, which is an empty cell.
fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_objects_become_empty_results() {
        for value in [
            Value::Null,
            json!(true),
            json!(42),
            json!("description"),
            json!([{"description": "x"}]),
        ] {
            assert_eq!(sanitize_result(&value), AnalysisResult::default());
        }
    }

    #[test]
    fn keeps_well_formed_fields() {
        let value = json!({
            "description": "A dessert menu",
            "text": "DESSERTS\nPudding 500",
            "menuItems": [
                {"name": "Pudding", "price": "500", "description": "Custard", "category": "Dessert"}
            ],
            "tables": [
                {"headers": ["Item", "Price"], "rows": [["Pudding", "500"]]}
            ],
            "analysis": ["Prices are in yen"],
            "confidence": 0.9,
        });
        let result = sanitize_result(&value);
        assert_eq!(result.description, "A dessert menu");
        assert_eq!(result.text, "DESSERTS\nPudding 500");
        assert_eq!(
            result.menu_items,
            vec![MenuItem {
                name: "Pudding".to_owned(),
                price: "500".to_owned(),
                description: "Custard".to_owned(),
                category: "Dessert".to_owned(),
            }]
        );
        assert_eq!(result.tables[0].headers, vec!["Item", "Price"]);
        assert_eq!(result.tables[0].rows, vec![vec!["Pudding", "500"]]);
        assert_eq!(result.analysis, vec!["Prices are in yen"]);
    }

    #[test]
    fn wrong_types_degrade_one_field_at_a_time() {
        let value = json!({
            "description": 17,
            "text": "still here",
            "menuItems": "not a list",
            "tables": null,
            "analysis": ["kept", 3, null, {"x": 1}, "also kept"],
        });
        let result = sanitize_result(&value);
        assert_eq!(result.description, "");
        assert_eq!(result.text, "still here");
        assert!(result.menu_items.is_empty());
        assert!(result.tables.is_empty());
        assert_eq!(result.analysis, vec!["kept", "also kept"]);
    }

    #[test]
    fn coerces_menu_item_fields() {
        let value = json!({
            "menuItems": [
                {"name": "Tea", "price": 3.5, "description": null, "category": ["Drinks"]},
                "just a string",
                null,
            ],
        });
        let result = sanitize_result(&value);
        assert_eq!(result.menu_items.len(), 3);
        assert_eq!(result.menu_items[0].name, "Tea");
        assert_eq!(result.menu_items[0].price, "3.5");
        assert_eq!(result.menu_items[0].description, "");
        assert_eq!(result.menu_items[0].category, "");
        assert_eq!(result.menu_items[1], MenuItem::default());
        assert_eq!(result.menu_items[2], MenuItem::default());
    }

    #[test]
    fn coerces_table_cells_and_drops_bad_rows() {
        let value = json!({
            "tables": [
                {
                    "headers": ["Item", 2, null],
                    "rows": [["Tea", 3, true, null, {"size": "L"}], "not a row", 7],
                },
                {"headers": "Item"},
                42,
            ],
        });
        let result = sanitize_result(&value);
        assert_eq!(result.tables.len(), 3);
        assert_eq!(result.tables[0].headers, vec!["Item", "2", ""]);
        assert_eq!(
            result.tables[0].rows,
            vec![vec!["Tea", "3", "true", "", r#"{"size":"L"}"#]]
        );
        assert_eq!(result.tables[1], Table::default());
        assert_eq!(result.tables[2], Table::default());
    }

    #[test]
    fn partial_objects_fill_in_defaults() {
        let result = sanitize_result(&json!({"description": "x"}));
        assert_eq!(
            result,
            AnalysisResult {
                description: "x".to_owned(),
                ..AnalysisResult::default()
            }
        );
    }
}
