//! Validated SQL identifiers.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! name that ends up spliced into SQL goes through [`Ident`] first.

use std::fmt;

use crate::DbError;

/// Longest identifier accepted; Postgres truncates anything beyond this.
pub const MAX_IDENT_LEN: usize = 63;

/// A table or column name restricted to `[A-Za-z0-9_]+`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self, DbError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DbError::InvalidIdentifier {
                name,
                reason: "empty",
            });
        }
        if name.len() > MAX_IDENT_LEN {
            return Err(DbError::InvalidIdentifier {
                name,
                reason: "longer than 63 bytes",
            });
        }
        if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(DbError::InvalidIdentifier {
                name,
                reason: "only ASCII letters, digits and '_' are allowed",
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier wrapped in double quotes, preserving case.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Ident {
    type Error = DbError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
