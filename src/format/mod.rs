//! Listing output: tables, user templates and JSON lines
//!
//! Templates use the `{{.Field}}` placeholders users know from the docker
//! CLI. They are rewritten to `{{ Field }}` and rendered with `tera`.
//! Table output is aligned the way Go's `tabwriter` aligns it.

use crate::error::Result;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tera::{Context, Tera};

const TABLE_PREFIX: &str = "table";
const JSON_FORMAT: &str = "json";

/// Minimum cell width of table columns
const MIN_WIDTH: usize = 10;
/// Spaces added after the widest cell of a column
const PADDING: usize = 3;

pub const STACK_TABLE: &str = "table {{.Name}}\t{{.Services}}";
pub const SERVICE_TABLE: &str =
    "table {{.ID}}\t{{.Name}}\t{{.Mode}}\t{{.Replicas}}\t{{.Image}}\t{{.Ports}}";
pub const TASK_TABLE: &str = "table {{.ID}}\t{{.Name}}\t{{.Image}}\t{{.Node}}\t{{.DesiredState}}\t{{.CurrentState}}\t{{.Error}}\t{{.Ports}}";

/// How rows are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formatter {
    /// Header plus aligned rows
    Table(String),
    /// One rendered template per row
    Raw(String),
    /// One JSON object per row
    Json,
}

impl Formatter {
    /// Parse a `--format` value, falling back to `default_table`
    pub fn new(format: Option<&str>, default_table: &str) -> Self {
        let format = format.map(str::trim).filter(|f| !f.is_empty());
        match format {
            None => Self::table(default_table),
            Some(JSON_FORMAT) => Formatter::Json,
            Some(TABLE_PREFIX) => Self::table(default_table),
            Some(f) if f.starts_with(TABLE_PREFIX) => Self::table(f),
            Some(f) => Formatter::Raw(unescape(f)),
        }
    }

    fn table(format: &str) -> Self {
        let body = format
            .strip_prefix(TABLE_PREFIX)
            .unwrap_or(format)
            .trim_matches(' ');
        Formatter::Table(unescape(body))
    }

    /// Render rows to text, newline-terminated
    pub fn render<R: Serialize + Default>(&self, rows: &[R]) -> Result<String> {
        match self {
            Formatter::Json => {
                let mut out = String::new();
                for row in rows {
                    out.push_str(&serde_json::to_string(row)?);
                    out.push('\n');
                }
                Ok(out)
            }
            Formatter::Raw(template) => {
                let tera = compile(template)?;
                let mut out = String::new();
                for row in rows {
                    out.push_str(&tera.render(ROW, &Context::from_serialize(row)?)?);
                    out.push('\n');
                }
                Ok(out)
            }
            Formatter::Table(template) => {
                let tera = compile(template)?;
                let mut lines = vec![tera.render(ROW, &header_context(&R::default())?)?];
                for row in rows {
                    lines.push(tera.render(ROW, &Context::from_serialize(row)?)?);
                }
                Ok(align(&lines))
            }
        }
    }
}

const ROW: &str = "row";

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").expect("valid regex"))
}

fn compile(template: &str) -> Result<Tera> {
    let converted = placeholder().replace_all(template, "{{ $1 }}");
    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    tera.add_raw_template(ROW, &converted)?;
    Ok(tera)
}

/// `\t` and `\n` typed on a command line become real tabs and newlines
fn unescape(format: &str) -> String {
    format.replace("\\t", "\t").replace("\\n", "\n")
}

/// Column title for a field name: `DesiredState` becomes `DESIRED STATE`
pub fn header_title(field: &str) -> String {
    let mut out = String::new();
    let mut previous_lower = false;
    for c in field.chars() {
        if c.is_uppercase() && previous_lower {
            out.push(' ');
        }
        previous_lower = c.is_lowercase();
        out.extend(c.to_uppercase());
    }
    out
}

fn header_context<R: Serialize>(row: &R) -> Result<Context> {
    let mut context = Context::new();
    if let serde_json::Value::Object(fields) = serde_json::to_value(row)? {
        for field in fields.keys() {
            context.insert(field.as_str(), &header_title(field));
        }
    }
    Ok(context)
}

/// Align tab-separated cells; text after the last tab is not padded
fn align(lines: &[String]) -> String {
    let rows: Vec<Vec<&str>> = lines.iter().map(|l| l.split('\t').collect()).collect();
    let mut widths: Vec<usize> = Vec::new();
    for row in &rows {
        for (i, cell) in row.iter().enumerate().take(row.len().saturating_sub(1)) {
            let width = (cell.chars().count() + PADDING).max(MIN_WIDTH);
            match widths.get_mut(i) {
                Some(w) => *w = (*w).max(width),
                None => widths.push(width),
            }
        }
    }

    let mut out = String::new();
    for row in rows {
        let last = row.len().saturating_sub(1);
        for (i, cell) in row.iter().enumerate() {
            out.push_str(cell);
            if i < last {
                let pad = widths[i] - cell.chars().count();
                out.extend(std::iter::repeat(' ').take(pad));
            }
        }
        out.push('\n');
    }
    out
}
