//! Backend-agnostic query model for listing items
//!
//! A [`Filter`] names a field, an operator and a value. Filters passed to
//! `list` combine with logical AND. [`Pagination`] is applied after all
//! filters.
//!
//! Before a backend sees a filter it is resolved into an [`ItemPredicate`],
//! which is the single place that decides which field/operator pairs are
//! supported. Each backend then translates predicates into its own query
//! language.
//!
//! # Example
//!
//! ```rust
//! use itemstore::repository::{Filter, Pagination};
//!
//! let filters = vec![
//!     Filter::contains("name", "phone"),
//!     Filter::gte("price", 100.0),
//! ];
//! let page = Pagination::new(20, 0);
//! assert!(page.is_effective());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{DbError, DbOperation, DbResult};
use crate::model::Item;

/// Comparison operators supported by [`Filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Exact equality
    Exact,
    /// Case-insensitive substring match
    #[default]
    Contains,
    /// Greater than or equal to
    GreaterOrEqual,
    /// Less than or equal to
    LessOrEqual,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Contains => write!(f, "contains"),
            Self::GreaterOrEqual => write!(f, ">="),
            Self::LessOrEqual => write!(f, "<="),
        }
    }
}

/// A typed value used in a [`Filter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl FilterValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for FilterValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

/// A single filter condition for listing items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    #[serde(default)]
    pub op: FilterOperator,
    pub value: FilterValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOperator, value: impl Into<FilterValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn exact(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::Exact, value)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::GreaterOrEqual, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOperator::LessOrEqual, value)
    }
}

/// Pagination parameters for limiting list results
///
/// A `limit` of zero disables pagination entirely: every matching row is
/// returned and `offset` is not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of results to return
    pub limit: u32,
    /// Number of results to skip
    #[serde(default)]
    pub offset: u32,
}

impl Pagination {
    #[must_use]
    pub const fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// Whether this pagination changes the result at all
    pub const fn is_effective(&self) -> bool {
        self.limit > 0
    }

    /// Slice an already filtered, ordered result set
    ///
    /// ```rust
    /// use itemstore::repository::Pagination;
    ///
    /// let rows = vec!["A", "B", "C", "D", "E"];
    /// assert_eq!(Pagination::new(2, 1).apply(rows.clone()), vec!["B", "C"]);
    /// assert!(Pagination::new(2, 9).apply(rows).is_empty());
    /// ```
    pub fn apply<T>(&self, rows: Vec<T>) -> Vec<T> {
        if !self.is_effective() {
            return rows;
        }
        rows.into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}

/// A filter resolved against the item schema
///
/// This is the authoritative rule table:
///
/// | field | operator | predicate |
/// |---|---|---|
/// | name | Exact | [`ItemPredicate::NameEquals`] |
/// | name | Contains | [`ItemPredicate::NameContains`] |
/// | price | Exact | [`ItemPredicate::PriceEquals`] |
/// | price | GreaterOrEqual | [`ItemPredicate::PriceAtLeast`] |
/// | price | LessOrEqual | [`ItemPredicate::PriceAtMost`] |
///
/// Anything else is rejected as a validation failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPredicate {
    NameEquals(String),
    /// Holds the needle already lowercased
    NameContains(String),
    PriceEquals(f64),
    PriceAtLeast(f64),
    PriceAtMost(f64),
}

impl ItemPredicate {
    /// Resolve one filter, rejecting unsupported field/operator/value shapes
    pub fn resolve(filter: &Filter) -> DbResult<Self> {
        let field = filter.field.trim().to_ascii_lowercase();
        match (field.as_str(), filter.op) {
            ("name", op) => {
                let text = filter.value.as_text().ok_or_else(|| {
                    DbError::validation(DbOperation::List, "name filter requires a text value")
                })?;
                match op {
                    FilterOperator::Exact => Ok(Self::NameEquals(text.to_string())),
                    FilterOperator::Contains => Ok(Self::NameContains(text.to_lowercase())),
                    other => Err(DbError::validation(
                        DbOperation::List,
                        format!("operator {} is not supported on name", other),
                    )),
                }
            }
            ("price", op) => {
                let number = filter.value.as_number().ok_or_else(|| {
                    DbError::validation(DbOperation::List, "price filter requires a numeric value")
                })?;
                if !number.is_finite() {
                    return Err(DbError::validation(
                        DbOperation::List,
                        format!("price filter value {} is not a finite number", number),
                    ));
                }
                match op {
                    FilterOperator::Exact => Ok(Self::PriceEquals(number)),
                    FilterOperator::GreaterOrEqual => Ok(Self::PriceAtLeast(number)),
                    FilterOperator::LessOrEqual => Ok(Self::PriceAtMost(number)),
                    FilterOperator::Contains => Err(DbError::validation(
                        DbOperation::List,
                        "operator contains is not supported on price",
                    )),
                }
            }
            _ => Err(DbError::validation(
                DbOperation::List,
                format!("unknown filter field '{}'", filter.field),
            )),
        }
    }

    /// Resolve every filter of a list call
    pub fn resolve_all(filters: &[Filter]) -> DbResult<Vec<Self>> {
        filters.iter().map(Self::resolve).collect()
    }

    /// Evaluate the predicate in process
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Self::NameEquals(name) => item.name == *name,
            Self::NameContains(needle) => item.name.to_lowercase().contains(needle.as_str()),
            Self::PriceEquals(price) => item.price == *price,
            Self::PriceAtLeast(price) => item.price >= *price,
            Self::PriceAtMost(price) => item.price <= *price,
        }
    }
}
