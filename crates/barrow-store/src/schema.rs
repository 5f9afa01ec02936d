//! Schema model for the object store.
//!
//! Tables, columns, indexes and sequences are plain values that emit
//! idempotent DDL (`IF NOT EXISTS` / `IF EXISTS`), with optional
//! list-partitioning on the `part` column for backends that support it.

use std::fmt;

use crate::sql::{Dialect, PartitionSupport};
use crate::zoid::TRASHED_ID;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Boolean,
    Text,
    Jsonb,
    Bytea,
    Int,
    Varchar(u32),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::BigInt => f.write_str("BIGINT"),
            ColumnType::Boolean => f.write_str("BOOLEAN"),
            ColumnType::Text => f.write_str("TEXT"),
            ColumnType::Jsonb => f.write_str("JSONB"),
            ColumnType::Bytea => f.write_str("BYTEA"),
            ColumnType::Int => f.write_str("INT"),
            ColumnType::Varchar(size) => write!(f, "VARCHAR({size})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub not_null: bool,
    pub references: Option<String>,
    pub on_delete: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            not_null: false,
            references: None,
            on_delete: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>) -> Self {
        self.references = Some(table.into());
        self
    }

    pub fn on_delete(mut self, action: impl Into<String>) -> Self {
        self.on_delete = Some(action.into());
        self
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.ty)?;
        if self.not_null {
            f.write_str(" NOT NULL")?;
        }
        if let Some(ref table) = self.references {
            write!(f, " REFERENCES {table}")?;
        }
        if let Some(ref action) = self.on_delete {
            write!(f, " ON DELETE {action}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub on_field: String,
    pub unique: bool,
    pub predicate: Option<String>,
}

impl Index {
    pub fn new(name: impl Into<String>, on_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_field: on_field.into(),
            unique: false,
            predicate: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Restrict the index to rows matching `predicate`.
    pub fn partial(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn get_sql(&self, table_name: &str) -> String {
        let kind = if self.unique { "UNIQUE INDEX" } else { "INDEX" };
        match self.predicate {
            Some(ref predicate) => format!(
                "CREATE {kind} IF NOT EXISTS {} ON {table_name} ({}) WHERE {predicate};",
                self.name, self.on_field
            ),
            None => format!(
                "CREATE {kind} IF NOT EXISTS {} ON {table_name} ({});",
                self.name, self.on_field
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequence {
    pub name: String,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Statements creating the sequence.
    ///
    /// SQLite has no sequences; a one-row table holding the last value stands
    /// in for one.
    pub fn get_sql(&self, dialect: Dialect) -> Vec<String> {
        match dialect {
            Dialect::Postgres => vec![self.to_string()],
            Dialect::Sqlite => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (last_value BIGINT NOT NULL);",
                    self.name
                ),
                format!(
                    "INSERT INTO {0} (last_value) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {0});",
                    self.name
                ),
            ],
        }
    }

    /// Statement advancing the sequence and returning the new value.
    pub fn next_value_sql(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Postgres => format!("SELECT nextval('{}')", self.name),
            Dialect::Sqlite => format!(
                "UPDATE {} SET last_value = last_value + 1 RETURNING last_value",
                self.name
            ),
        }
    }

    /// Statement reading the last issued value.
    pub fn current_value_sql(&self) -> String {
        format!("SELECT last_value FROM {}", self.name)
    }

    pub fn drop(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Postgres => format!("DROP SEQUENCE IF EXISTS {}", self.name),
            Dialect::Sqlite => format!("DROP TABLE IF EXISTS {}", self.name),
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CREATE SEQUENCE IF NOT EXISTS {};", self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
    pub primary_key: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.add_column(column);
        self
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn add_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// Remove the first column called `name`, if any.
    pub fn remove_column(&mut self, name: &str) {
        if let Some(pos) = self.columns.iter().position(|c| c.name == name) {
            self.columns.remove(pos);
        }
    }

    /// Remove then append: the replacement always ends up last.
    pub fn replace_column(&mut self, column: Column) {
        self.remove_column(&column.name);
        self.add_column(column);
    }

    fn partition_name(&self, partition: i64) -> String {
        format!("{}_{}", self.name, partition)
    }

    pub fn drop(&self, partition: Option<i64>) -> String {
        let table_name = match partition {
            Some(p) => self.partition_name(p),
            None => self.name.clone(),
        };
        format!("DROP TABLE IF EXISTS {table_name}")
    }

    /// DDL for the table, or for one partition of it.
    ///
    /// Under partitioning, indexes belong to each partition and are only
    /// emitted with the partition statements.
    pub fn get_statements(
        &self,
        storage: &dyn PartitionSupport,
        partition: Option<i64>,
    ) -> Vec<String> {
        if let Some(p) = partition {
            let table_name = self.partition_name(p);
            let mut statements = vec![format!(
                "CREATE TABLE IF NOT EXISTS {table_name}\nPARTITION OF {}\nFOR VALUES IN ({p});",
                self.name
            )];
            statements.extend(self.indexes.iter().map(|i| i.get_sql(&table_name)));
            return statements;
        }

        let mut lines: Vec<String> = self.columns.iter().map(|c| format!("    {c}")).collect();
        if !self.primary_key.is_empty() {
            lines.push(format!("    PRIMARY KEY ({})", self.primary_key.join(", ")));
        }

        let mut statement = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            self.name,
            lines.join(",\n")
        );
        let partitioned = storage.supports_partitioning();
        if partitioned {
            statement.push_str(" PARTITION BY LIST (part)");
        }
        statement.push(';');

        let mut statements = vec![statement];
        if !partitioned {
            statements.extend(self.indexes.iter().map(|i| i.get_sql(&self.name)));
        }
        statements
    }
}

/// The objects table.
pub fn objects_table(name: &str) -> Table {
    Table::new(name)
        .with_column(Column::new("zoid", ColumnType::BigInt).not_null())
        .with_column(Column::new("tid", ColumnType::BigInt).not_null())
        .with_column(Column::new("state_size", ColumnType::BigInt).not_null())
        .with_column(Column::new("part", ColumnType::BigInt).not_null())
        .with_column(Column::new("resource", ColumnType::Boolean).not_null())
        .with_column(Column::new("of", ColumnType::BigInt))
        .with_column(Column::new("otid", ColumnType::BigInt))
        .with_column(Column::new("parent_id", ColumnType::BigInt))
        .with_column(Column::new("id", ColumnType::Text))
        .with_column(Column::new("type", ColumnType::Text).not_null())
        .with_column(Column::new("state", ColumnType::Bytea))
        .with_primary_key(&["zoid"])
        .with_index(Index::new(format!("{name}_tid"), "tid"))
        .with_index(Index::new(format!("{name}_of"), "of"))
        .with_index(Index::new(format!("{name}_part"), "part"))
        .with_index(Index::new(format!("{name}_parent"), "parent_id"))
        .with_index(Index::new(format!("{name}_id"), "id"))
        .with_index(Index::new(format!("{name}_type"), "type"))
        .with_index(
            Index::new(format!("{name}_parent_id_id_key"), "parent_id, id")
                .unique()
                .partial(format!("parent_id != {TRASHED_ID}")),
        )
        .with_index(
            Index::new(format!("{name}_annotations_unique"), "of, id")
                .unique()
                .partial(format!("of IS NOT NULL AND of != {TRASHED_ID}")),
        )
}

/// The blob chunk table, owned by rows of `objects`.
pub fn blobs_table(name: &str, objects: &str) -> Table {
    Table::new(name)
        .with_column(Column::new("bid", ColumnType::Text).not_null())
        .with_column(
            Column::new("zoid", ColumnType::BigInt)
                .not_null()
                .references(objects)
                .on_delete("CASCADE"),
        )
        .with_column(Column::new("chunk_index", ColumnType::Int).not_null())
        .with_column(Column::new("data", ColumnType::Bytea))
        .with_primary_key(&["bid", "zoid", "chunk_index"])
        .with_index(Index::new(format!("{name}_bid"), "bid"))
        .with_index(Index::new(format!("{name}_zoid"), "zoid"))
        .with_index(Index::new(format!("{name}_chunk"), "chunk_index"))
}

/// Sequence issuing transaction ids.
pub fn tid_sequence(objects: &str) -> Sequence {
    Sequence::new(format!("{objects}_tid_seq"))
}

/// Sequence issuing object ids.
pub fn zoid_sequence(objects: &str) -> Sequence {
    Sequence::new(format!("{objects}_zoid_seq"))
}
