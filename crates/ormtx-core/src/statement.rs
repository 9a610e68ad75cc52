//! Structured statements and SQL dialects.
//!
//! The engine never builds SQL strings itself. It emits [`Statement`] values,
//! which SQL drivers render with [`Statement::to_sql`] for their [`Dialect`]
//! and which non-SQL backends can interpret structurally.

use crate::connection::WaitPolicy;
use crate::value::Value;

/// SQL dialect of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL: `$n` placeholders, reads run inside transactions
    Postgres,
    /// SQLite: `?n` placeholders, reads run outside transactions until a write
    #[default]
    Sqlite,
    /// MySQL: `?` placeholders, reads run inside transactions
    Mysql,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Does a plain read open a transaction on this backend?
    ///
    /// When `false`, reads run in autocommit mode until the first write (or
    /// until a session asks for `immediate` transactions).
    pub const fn reads_start_transaction(self) -> bool {
        match self {
            Dialect::Postgres | Dialect::Mysql => true,
            Dialect::Sqlite => false,
        }
    }

    /// Does this backend understand `SELECT ... FOR UPDATE`?
    pub const fn supports_for_update(self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }
}

/// A statement sent to a driver.
///
/// Filters and guards are conjunctions of column equalities; an empty
/// filter selects every row.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Read columns of matching rows, optionally taking row locks.
    Select {
        table: String,
        columns: Vec<String>,
        filter: Vec<(String, Value)>,
        lock: Option<WaitPolicy>,
    },
    /// Insert one row.
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Update the row identified by `key`, only if every guard still holds.
    Update {
        table: String,
        key: Vec<(String, Value)>,
        assignments: Vec<(String, Value)>,
        guards: Vec<(String, Value)>,
    },
    /// Delete the row identified by `key`, only if every guard still holds.
    Delete {
        table: String,
        key: Vec<(String, Value)>,
        guards: Vec<(String, Value)>,
    },
}

impl Statement {
    /// Target table.
    pub fn table(&self) -> &str {
        match self {
            Statement::Select { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// Does this statement modify data?
    pub fn is_modifying(&self) -> bool {
        !matches!(self, Statement::Select { .. })
    }

    /// Does this statement take row locks?
    pub fn is_locking(&self) -> bool {
        matches!(self, Statement::Select { lock: Some(_), .. })
    }

    /// Must this statement run inside a transaction regardless of backend policy?
    pub fn requires_transaction(&self) -> bool {
        self.is_modifying() || self.is_locking()
    }

    /// Render parameterized SQL for `dialect`.
    pub fn to_sql(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let q = |name: &str| dialect.quote_identifier(name);
        let mut params: Vec<Value> = Vec::new();
        let conditions = |pairs: &[(String, Value)], params: &mut Vec<Value>| -> Vec<String> {
            pairs
                .iter()
                .map(|(col, val)| {
                    if val.is_null() {
                        format!("{} IS NULL", q(col))
                    } else {
                        params.push(val.clone());
                        format!("{} = {}", q(col), dialect.placeholder(params.len()))
                    }
                })
                .collect()
        };

        let sql = match self {
            Statement::Select {
                table,
                columns,
                filter,
                lock,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| q(c)).collect();
                let mut sql = format!("SELECT {} FROM {}", cols.join(", "), q(table));
                let conds = conditions(filter, &mut params);
                if !conds.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&conds.join(" AND "));
                }
                if let Some(policy) = lock {
                    if dialect.supports_for_update() {
                        sql.push_str(" FOR UPDATE");
                        if *policy == WaitPolicy::NoWait {
                            sql.push_str(" NOWAIT");
                        }
                    }
                }
                sql
            }
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| q(c)).collect();
                let placeholders: Vec<String> =
                    (1..=values.len()).map(|i| dialect.placeholder(i)).collect();
                params.extend(values.iter().cloned());
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    q(table),
                    cols.join(", "),
                    placeholders.join(", ")
                )
            }
            Statement::Update {
                table,
                key,
                assignments,
                guards,
            } => {
                let sets: Vec<String> = assignments
                    .iter()
                    .map(|(col, val)| {
                        params.push(val.clone());
                        format!("{} = {}", q(col), dialect.placeholder(params.len()))
                    })
                    .collect();
                let mut conds = conditions(key, &mut params);
                conds.extend(conditions(guards, &mut params));
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    q(table),
                    sets.join(", "),
                    conds.join(" AND ")
                )
            }
            Statement::Delete { table, key, guards } => {
                let mut conds = conditions(key, &mut params);
                conds.extend(conditions(guards, &mut params));
                format!("DELETE FROM {} WHERE {}", q(table), conds.join(" AND "))
            }
        };
        (sql, params)
    }
}
