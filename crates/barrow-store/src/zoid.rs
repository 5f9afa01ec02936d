//! Object and transaction identifiers.
//!
//! Every persisted object is addressed by a [`Zoid`], an integer primary key.
//! Two values are reserved: [`ROOT_ID`] for the database root container and
//! [`TRASHED_ID`] for the synthetic trash parent of soft-deleted subtrees.
//! Allocated zoids start at 1, so neither sentinel is ever handed out.

use std::fmt;

use rusqlite::ToSql;
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Zoid of the database root container.
pub const ROOT_ID: Zoid = Zoid(0);

/// Zoid of the trash parent. Rows pointing at it are orphans by construction.
pub const TRASHED_ID: Zoid = Zoid(-1);

/// Integer object identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Zoid(pub i64);

impl Zoid {
    /// True for [`ROOT_ID`] and [`TRASHED_ID`].
    pub fn is_sentinel(self) -> bool {
        self == ROOT_ID || self == TRASHED_ID
    }
}

impl From<i64> for Zoid {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Zoid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Zoid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Zoid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}

/// Transaction id. Each commit stamps the rows it writes with a fresh one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Tid(pub i64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Tid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Tid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}
