//! Schema-qualified identifiers with case-insensitive matching.
//!
//! Identifiers preserve the raw spelling supplied by the source but compare
//! and hash on a lower-cased canonical form, so `"T_1"` and `"t_1"` name the
//! same table.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single name part: a database, schema, or table name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ident {
    raw: String,
}

impl Ident {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The identifier as originally spelled.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The lower-cased form used for comparisons and map keys.
    pub fn canonical(&self) -> String {
        self.raw.to_lowercase()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl PartialEq for Ident {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Ident {}

impl Ord for Ident {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

impl PartialOrd for Ident {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Ident {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// An enclosing namespace for tables.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Schema {
    name: Ident,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Ident::new(name),
        }
    }

    pub fn name(&self) -> &Ident {
        &self.name
    }

    pub fn canonical(&self) -> String {
        self.name.canonical()
    }

    /// A table within this schema.
    pub fn table(&self, name: impl Into<String>) -> Table {
        Table {
            schema: self.clone(),
            name: Ident::new(name),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A schema-qualified table name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Table {
    schema: Schema,
    name: Ident,
}

impl Table {
    pub fn new(schema: Schema, name: impl Into<String>) -> Self {
        Self {
            schema,
            name: Ident::new(name),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn name(&self) -> &Ident {
        &self.name
    }

    /// The fully-qualified canonical key, `schema.table` lower-cased.
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.schema.canonical(), self.name.canonical())
    }

    /// All canonical parts joined with the given separator, for deriving
    /// names of auxiliary objects such as staging tables.
    pub fn mangled(&self, sep: char) -> String {
        format!("{}{}{}", self.schema.canonical(), sep, self.name.canonical())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}
