//! Translating item predicates into table-store queries
//!
//! The store can evaluate equality and range comparisons on typed properties
//! but has no substring operator. [`TablePlan::build`] splits the resolved
//! predicates into a native [`TableQuery`], sent to the store as an OData
//! `$filter`, and a [`ClientSideFilter`] applied after every page of the
//! native result has been fetched. A store with native search only needs a
//! different plan; the repository contract does not change.

use std::fmt::Write as _;

use serde_json::Value;

use super::client::{TableEntity, PARTITION_KEY};
use super::codec::{NAME, PRICE};
use crate::model::Item;
use crate::repository::ItemPredicate;

/// Comparison operators the store evaluates natively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ge,
    Le,
}

impl Comparison {
    fn keyword(self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Ge => "ge",
            Comparison::Le => "le",
        }
    }
}

/// Typed literal on the right-hand side of a native predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Double(f64),
}

impl Literal {
    fn render(&self, out: &mut String) {
        match self {
            Literal::String(s) => {
                out.push('\'');
                out.push_str(&s.replace('\'', "''"));
                out.push('\'');
            }
            // Debug formatting always keeps a decimal point, so the store
            // compares the literal as Edm.Double rather than Edm.Int32
            Literal::Double(n) => {
                let _ = write!(out, "{:?}", n);
            }
        }
    }

    fn compare(&self, value: &Value) -> Option<std::cmp::Ordering> {
        match self {
            Literal::String(expected) => value.as_str().map(|actual| actual.cmp(expected)),
            Literal::Double(expected) => value.as_f64().and_then(|actual| actual.partial_cmp(expected)),
        }
    }
}

/// A single server-side comparison on one property
#[derive(Debug, Clone, PartialEq)]
pub struct NativePredicate {
    pub property: String,
    pub op: Comparison,
    pub value: Literal,
}

impl NativePredicate {
    pub fn new(property: impl Into<String>, op: Comparison, value: Literal) -> Self {
        Self {
            property: property.into(),
            op,
            value,
        }
    }

    /// Evaluate against a stored entity; a missing or differently typed
    /// property never matches
    pub fn matches(&self, entity: &TableEntity) -> bool {
        let Some(ordering) = entity.get(&self.property).and_then(|v| self.value.compare(v)) else {
            return false;
        };
        match self.op {
            Comparison::Eq => ordering.is_eq(),
            Comparison::Ge => ordering.is_ge(),
            Comparison::Le => ordering.is_le(),
        }
    }
}

/// A native query: optional partition, AND-combined predicates, page size
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQuery {
    pub partition_key: Option<String>,
    pub predicates: Vec<NativePredicate>,
    /// Maximum entities per page
    pub top: Option<u32>,
}

impl TableQuery {
    /// Every entity in one partition
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: Some(partition_key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: NativePredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    #[must_use]
    pub fn with_top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    /// Render as an OData `$filter` expression, `None` when unfiltered
    ///
    /// ```rust
    /// use itemstore::table::{Comparison, Literal, NativePredicate, TableQuery};
    ///
    /// let query = TableQuery::partition("items")
    ///     .with_predicate(NativePredicate::new("Price", Comparison::Ge, Literal::Double(10.0)));
    /// assert_eq!(
    ///     query.to_odata().as_deref(),
    ///     Some("PartitionKey eq 'items' and Price ge 10.0")
    /// );
    /// ```
    pub fn to_odata(&self) -> Option<String> {
        let mut clauses = Vec::with_capacity(self.predicates.len() + 1);
        if let Some(partition_key) = &self.partition_key {
            clauses.push(NativePredicate::new(
                PARTITION_KEY,
                Comparison::Eq,
                Literal::String(partition_key.clone()),
            ));
        }
        clauses.extend(self.predicates.iter().cloned());
        if clauses.is_empty() {
            return None;
        }

        let mut out = String::new();
        for (i, clause) in clauses.iter().enumerate() {
            if i > 0 {
                out.push_str(" and ");
            }
            out.push_str(&clause.property);
            out.push(' ');
            out.push_str(clause.op.keyword());
            out.push(' ');
            clause.value.render(&mut out);
        }
        Some(out)
    }

    /// Evaluate the partition and every predicate against an entity
    pub fn matches(&self, entity: &TableEntity) -> bool {
        let partition_ok = match &self.partition_key {
            Some(pk) => entity.get(PARTITION_KEY).and_then(Value::as_str) == Some(pk.as_str()),
            None => true,
        };
        partition_ok && self.predicates.iter().all(|p| p.matches(entity))
    }
}

/// Predicates the store cannot evaluate, applied to decoded items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSideFilter {
    /// Lowercased substrings the name must contain
    name_contains: Vec<String>,
}

impl ClientSideFilter {
    pub fn is_empty(&self) -> bool {
        self.name_contains.is_empty()
    }

    pub fn matches(&self, item: &Item) -> bool {
        if self.is_empty() {
            return true;
        }
        let name = item.name.to_lowercase();
        self.name_contains.iter().all(|needle| name.contains(needle.as_str()))
    }
}

/// How one `list` call is split between the store and the client
#[derive(Debug, Clone, PartialEq)]
pub struct TablePlan {
    pub native: TableQuery,
    pub client_side: ClientSideFilter,
}

impl TablePlan {
    pub fn build(partition_key: &str, predicates: &[ItemPredicate]) -> Self {
        let mut native = TableQuery::partition(partition_key);
        let mut client_side = ClientSideFilter::default();

        for predicate in predicates {
            let native_predicate = match predicate {
                ItemPredicate::NameEquals(name) => {
                    NativePredicate::new(NAME, Comparison::Eq, Literal::String(name.clone()))
                }
                ItemPredicate::NameContains(needle) => {
                    client_side.name_contains.push(needle.clone());
                    continue;
                }
                ItemPredicate::PriceEquals(price) => {
                    NativePredicate::new(PRICE, Comparison::Eq, Literal::Double(*price))
                }
                ItemPredicate::PriceAtLeast(price) => {
                    NativePredicate::new(PRICE, Comparison::Ge, Literal::Double(*price))
                }
                ItemPredicate::PriceAtMost(price) => {
                    NativePredicate::new(PRICE, Comparison::Le, Literal::Double(*price))
                }
            };
            native.predicates.push(native_predicate);
        }

        Self {
            native,
            client_side,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::repository::Filter;

    fn plan(filters: &[Filter]) -> TablePlan {
        TablePlan::build("items", &ItemPredicate::resolve_all(filters).unwrap())
    }

    #[test]
    fn test_partition_only() {
        let plan = plan(&[]);
        assert_eq!(plan.native.to_odata().as_deref(), Some("PartitionKey eq 'items'"));
        assert!(plan.client_side.is_empty());
    }

    #[test]
    fn test_native_and_client_side_split() {
        let plan = plan(&[
            Filter::exact("name", "Phone"),
            Filter::contains("name", "Case"),
            Filter::gte("price", 10_i64),
            Filter::lte("price", 99.5),
        ]);

        assert_eq!(
            plan.native.to_odata().as_deref(),
            Some("PartitionKey eq 'items' and Name eq 'Phone' and Price ge 10.0 and Price le 99.5")
        );
        assert!(!plan.client_side.is_empty());
        assert!(plan.client_side.matches(&Item::new("Phone case", 1.0)));
        assert!(!plan.client_side.matches(&Item::new("Phone", 1.0)));
    }

    #[test]
    fn test_string_literal_quotes_are_doubled() {
        let plan = plan(&[Filter::exact("name", "O'Brien's")]);
        assert_eq!(
            plan.native.to_odata().as_deref(),
            Some("PartitionKey eq 'items' and Name eq 'O''Brien''s'")
        );
    }

    #[test]
    fn test_unfiltered_query_renders_nothing() {
        assert_eq!(TableQuery::default().with_top(1).to_odata(), None);
    }

    #[test]
    fn test_native_predicate_matching() {
        let entity: TableEntity = json!({
            "PartitionKey": "items",
            "Name": "Phone",
            "Price": 10.0
        })
        .as_object()
        .cloned()
        .unwrap();

        let query = TableQuery::partition("items")
            .with_predicate(NativePredicate::new(NAME, Comparison::Eq, Literal::String("Phone".into())))
            .with_predicate(NativePredicate::new(PRICE, Comparison::Ge, Literal::Double(10.0)));
        assert!(query.matches(&entity));

        let other_partition = TableQuery::partition("__sequence");
        assert!(!other_partition.matches(&entity));

        // type mismatch never matches
        let mistyped = NativePredicate::new(PRICE, Comparison::Eq, Literal::String("10".into()));
        assert!(!mistyped.matches(&entity));
    }
}
