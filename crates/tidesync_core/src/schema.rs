//! Table definitions and the DDL generated from them.
//!
//! Every synced table gets three `AFTER` triggers that append to the
//! mutation log inside the statement that changed the row, plus a guard
//! trigger that keeps the `id` column immutable. Because SQLite runs
//! triggers as part of the triggering statement, the data write and its log
//! entry always commit or roll back together.

use crate::error::{StoreError, StoreResult};
use crate::oplog::{MUTATION_LOG_DDL, MUTATION_LOG_TABLE};

/// Version of the on-disk layout produced by this module.
pub const SCHEMA_FORMAT_VERSION: i64 = 1;

/// Milliseconds since the Unix epoch, evaluated inside SQLite.
const SQL_NOW_MILLIS: &str = "CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER)";

const RESERVED_TABLES: &[&str] = &[MUTATION_LOG_TABLE, "store_meta"];

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// TEXT.
    Text,
    /// INTEGER (also booleans and timestamps).
    Integer,
    /// REAL.
    Real,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

/// A column other than the implicit `id` primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Storage class.
    pub ty: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnDef {
    /// A NOT NULL column.
    pub fn required(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    /// A nullable column.
    pub fn optional(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }
}

/// Definition of one entity table.
///
/// Every table has an implicit `id TEXT PRIMARY KEY` column holding the
/// entity id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Table name (local and remote).
    pub name: String,
    /// Columns after `id`.
    pub columns: Vec<ColumnDef>,
    /// Columns that get a single-column index.
    pub indexes: Vec<String>,
    /// Whether writes are recorded in the mutation log.
    pub synced: bool,
}

impl TableDef {
    /// Creates a synced table definition.
    pub fn synced(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            synced: true,
        }
    }

    /// Creates a table that is never uploaded.
    pub fn local_only(name: impl Into<String>) -> Self {
        Self {
            synced: false,
            ..Self::synced(name)
        }
    }

    /// Adds a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds an index on a column.
    pub fn index(mut self, column: impl Into<String>) -> Self {
        self.indexes.push(column.into());
        self
    }

    /// Returns all column names including `id`.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once("id").chain(self.columns.iter().map(|c| c.name.as_str()))
    }

    fn validate(&self) -> StoreResult<()> {
        check_identifier(&self.name)?;
        if RESERVED_TABLES.contains(&self.name.as_str()) {
            return Err(StoreError::invalid_argument(format!(
                "table name {} is reserved",
                self.name
            )));
        }
        let mut seen = vec!["id"];
        for column in &self.columns {
            check_identifier(&column.name)?;
            if seen.contains(&column.name.as_str()) {
                return Err(StoreError::invalid_argument(format!(
                    "duplicate column {} in {}",
                    column.name, self.name
                )));
            }
            seen.push(&column.name);
        }
        for index in &self.indexes {
            if !seen.contains(&index.as_str()) {
                return Err(StoreError::invalid_argument(format!(
                    "index on unknown column {} in {}",
                    index, self.name
                )));
            }
        }
        Ok(())
    }

    fn create_sql(&self) -> String {
        let mut columns = vec!["id TEXT PRIMARY KEY NOT NULL".to_string()];
        for column in &self.columns {
            let null = if column.nullable { "" } else { " NOT NULL" };
            columns.push(format!("{} {}{}", column.name, column.ty.sql(), null));
        }
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n",
            self.name,
            columns.join(",\n    ")
        );
        for index in &self.indexes {
            sql.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table} ({col});\n",
                table = self.name,
                col = index
            ));
        }
        sql.push_str(&format!(
            "CREATE TRIGGER IF NOT EXISTS {table}__id_immutable \
             BEFORE UPDATE OF id ON {table} WHEN NEW.id IS NOT OLD.id \
             BEGIN SELECT RAISE(ABORT, 'entity ids are immutable'); END;\n",
            table = self.name
        ));
        if self.synced {
            sql.push_str(&self.trigger_sql());
        }
        sql
    }

    fn row_json(&self, alias: &str) -> String {
        let pairs: Vec<String> = self
            .column_names()
            .map(|c| format!("'{c}', {alias}.{c}"))
            .collect();
        format!("json_object({})", pairs.join(", "))
    }

    fn trigger_sql(&self) -> String {
        let log = MUTATION_LOG_TABLE;
        let table = &self.name;
        let insert_row = self.row_json("NEW");
        format!(
            "CREATE TRIGGER IF NOT EXISTS {table}__log_insert AFTER INSERT ON {table}
BEGIN
    INSERT INTO {log} (entity_table, entity_id, kind, payload, enqueued_at)
    VALUES ('{table}', NEW.id, 'CREATE', {insert_row}, {SQL_NOW_MILLIS});
END;
CREATE TRIGGER IF NOT EXISTS {table}__log_update AFTER UPDATE ON {table}
BEGIN
    INSERT INTO {log} (entity_table, entity_id, kind, payload, enqueued_at)
    VALUES ('{table}', NEW.id, 'UPDATE', {insert_row}, {SQL_NOW_MILLIS});
END;
CREATE TRIGGER IF NOT EXISTS {table}__log_delete AFTER DELETE ON {table}
BEGIN
    INSERT INTO {log} (entity_table, entity_id, kind, payload, enqueued_at)
    VALUES ('{table}', OLD.id, 'DELETE', NULL, {SQL_NOW_MILLIS});
END;
"
        )
    }
}

/// The set of tables a store is opened with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    tables: Vec<TableDef>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table.
    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    /// Returns the table definitions.
    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns true if writes to `name` are logged for upload.
    pub fn is_synced(&self, name: &str) -> bool {
        self.table(name).map(|t| t.synced).unwrap_or(false)
    }

    /// Validates names and column references.
    pub fn validate(&self) -> StoreResult<()> {
        for (i, table) in self.tables.iter().enumerate() {
            table.validate()?;
            if self.tables[..i].iter().any(|t| t.name == table.name) {
                return Err(StoreError::invalid_argument(format!(
                    "duplicate table {}",
                    table.name
                )));
            }
        }
        Ok(())
    }

    /// Returns the full DDL script for this schema, mutation log included.
    ///
    /// The script doubles as the schema fingerprint recorded in the store.
    pub fn ddl(&self) -> String {
        let mut sql = String::from(MUTATION_LOG_DDL);
        for table in &self.tables {
            sql.push_str(&table.create_sql());
        }
        sql
    }
}

fn check_identifier(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if valid && !name.starts_with("sqlite_") {
        Ok(())
    } else {
        Err(StoreError::invalid_argument(format!(
            "invalid identifier {name:?}: use lowercase letters, digits and underscores"
        )))
    }
}
