//! SQL statement templates.
//!
//! Statements are written once against a `{table}` placeholder and rendered
//! per call, so the same text can target the base table or one of its
//! partitions. Rendering is a pure function of its arguments.

use thiserror::Error;

use crate::zoid::{ROOT_ID, TRASHED_ID};

/// Default table for templates that do not name one.
pub const DEFAULT_TABLE: &str = "objects";

/// Template rendering error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlError {
    #[error("No value for substitution {{{0}}}")]
    MissingSubstitution(String),

    #[error("Unbalanced brace at offset {0}")]
    UnbalancedBrace(usize),
}

/// A storage backend as seen by the renderer and the DDL model.
pub trait PartitionSupport {
    fn supports_partitioning(&self) -> bool;
}

/// An object that may live in a partition of its table.
pub trait Partitioned {
    /// Partition id, 0 for the base table.
    fn part_id(&self) -> i64;
}

/// SQL flavour of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Predicate fragment matching `zoid` against a list bound at `param`.
    ///
    /// SQLite has no array parameters; the list is bound as a JSON array.
    pub fn zoid_set(&self, param: &str) -> String {
        match self {
            Dialect::Postgres => format!("= ANY({param})"),
            Dialect::Sqlite => format!("IN (SELECT value FROM json_each({param}))"),
        }
    }
}

/// Arguments to [`Sql::render`].
#[derive(Default)]
pub struct RenderArgs<'a> {
    storage: Option<&'a dyn PartitionSupport>,
    table: Option<&'a str>,
    object: Option<&'a dyn Partitioned>,
    extra: Vec<(&'a str, String)>,
}

impl<'a> RenderArgs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(mut self, storage: &'a dyn PartitionSupport) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Override the template's default table.
    pub fn table(mut self, table: &'a str) -> Self {
        self.table = Some(table);
        self
    }

    /// Object whose partition selects the table suffix.
    pub fn object(mut self, object: &'a dyn Partitioned) -> Self {
        self.object = Some(object);
        self
    }

    /// Extra named substitution.
    pub fn with(mut self, key: &'a str, value: impl ToString) -> Self {
        self.extra.push((key, value.to_string()));
        self
    }

    fn resolve_table(&self, default_table: &str) -> String {
        let mut table = self.table.unwrap_or(default_table).to_string();
        if let (Some(storage), Some(object)) = (self.storage, self.object)
            && storage.supports_partitioning()
            && object.part_id() != 0
        {
            table.push_str(&format!("_{}", object.part_id()));
        }
        table
    }
}

/// A statement template plus the table it targets by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sql {
    template: &'static str,
    default_table: &'static str,
}

impl Sql {
    pub const fn new(template: &'static str) -> Self {
        Self::with_table(template, DEFAULT_TABLE)
    }

    pub const fn with_table(template: &'static str, default_table: &'static str) -> Self {
        Self {
            template,
            default_table,
        }
    }

    pub fn template(&self) -> &'static str {
        self.template
    }

    pub fn default_table(&self) -> &'static str {
        self.default_table
    }

    /// Render with no storage, object or extra substitutions.
    pub fn render_default(&self) -> Result<String, SqlError> {
        self.render(&RenderArgs::default())
    }

    /// Render the template.
    ///
    /// `{table}` resolves to the requested (or default) table, suffixed with
    /// `_{part_id}` when the storage supports partitioning and the object sits
    /// in a non-zero partition. `{trashed_id}` and `{root_id}` resolve to the
    /// sentinels; anything else must be supplied through [`RenderArgs::with`].
    pub fn render(&self, args: &RenderArgs<'_>) -> Result<String, SqlError> {
        let table = args.resolve_table(self.default_table);
        interpolate(self.template, |key| match key {
            "table" => Some(table.clone()),
            "trashed_id" => Some(TRASHED_ID.to_string()),
            "root_id" => Some(ROOT_ID.to_string()),
            other => args
                .extra
                .iter()
                .find(|(k, _)| *k == other)
                .map(|(_, v)| v.clone()),
        })
    }
}

/// Replace `{name}` placeholders; `{{` and `}}` are literal braces.
fn interpolate(
    template: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, SqlError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if let Some(&(_, '{')) = chars.peek() {
                    chars.next();
                    out.push('{');
                    continue;
                }

                let mut end = None;
                for (i, c) in chars.by_ref() {
                    match c {
                        '}' => {
                            end = Some(i);
                            break;
                        }
                        '{' => return Err(SqlError::UnbalancedBrace(i)),
                        _ => {}
                    }
                }
                let end = end.ok_or(SqlError::UnbalancedBrace(pos))?;
                let key = &template[pos + 1..end];
                let value =
                    lookup(key).ok_or_else(|| SqlError::MissingSubstitution(key.to_string()))?;
                out.push_str(&value);
            }
            '}' => {
                if let Some(&(_, '}')) = chars.peek() {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(SqlError::UnbalancedBrace(pos));
                }
            }
            c => out.push(c),
        }
    }

    Ok(out)
}
