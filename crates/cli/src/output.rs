//! Output formatting for CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// Pretty-printed JSON
    Json,
    /// One JSON document per line
    JsonLine,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, Self::Json | Self::JsonLine)
    }

    fn to_json<T: Serialize + ?Sized>(self, value: &T) -> String {
        let rendered = match self {
            Self::JsonLine => serde_json::to_string(value),
            _ => serde_json::to_string_pretty(value),
        };
        rendered.unwrap_or_default()
    }
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table<T: TableDisplay>(items: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    table
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => println!("{}", table(std::slice::from_ref(item))),
        _ => println!("{}", format.to_json(item)),
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table if items.is_empty() => println!("No items found."),
        OutputFormat::Table => println!("{}", table(items)),
        _ => println!("{}", format.to_json(items)),
    }
}

/// Print the outcome of a command that has no item to show
pub fn print_result(message: &str, format: OutputFormat) {
    if format.is_json() {
        println!("{}", format.to_json(&serde_json::json!({ "result": message })));
    } else {
        print_success(message);
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message, as a JSON document when JSON output was requested
pub fn print_error(message: &str, format: OutputFormat) {
    if format.is_json() {
        println!("{}", format.to_json(&serde_json::json!({ "error": message })));
    } else {
        eprintln!("❌ {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Item {
        name: &'static str,
    }

    #[test]
    fn test_json_line_is_single_line() {
        let items = [Item { name: "a" }, Item { name: "b" }];
        let line = OutputFormat::JsonLine.to_json(&items[..]);
        assert_eq!(line, r#"[{"name":"a"},{"name":"b"}]"#);

        let pretty = OutputFormat::Json.to_json(&items[..]);
        assert!(pretty.contains('\n'));
    }

    #[test]
    fn test_is_json() {
        assert!(!OutputFormat::Table.is_json());
        assert!(OutputFormat::Json.is_json());
        assert!(OutputFormat::JsonLine.is_json());
    }
}
