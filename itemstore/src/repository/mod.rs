//! Repository contract, error taxonomy and query model
//!
//! This module holds everything the two storage backends share:
//!
//! - **Contract**: [`Repository`], the uniform CRUD/list/ping trait
//! - **Errors**: [`DbError`] with an operation tag and a canonical [`DbErrorKind`]
//! - **Filtering**: [`Filter`] and its resolved form [`ItemPredicate`]
//! - **Pagination**: [`Pagination`], applied after every filter
//! - **Resilience**: [`Resilient`], per-call timeouts and read retry
//!
//! # Example
//!
//! ```rust,ignore
//! use itemstore::repository::{DbErrorKind, Filter, Pagination, Repository};
//!
//! match repo.find_by_id(42).await {
//!     Ok(item) => println!("{} costs {}", item.name, item.price),
//!     Err(e) if e.kind() == DbErrorKind::NotFound => println!("no such item"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

mod error;
mod query;
mod resilient;
mod traits;

pub use error::{BoxedCause, DbError, DbErrorKind, DbOperation, DbResult};
pub use query::{Filter, FilterOperator, FilterValue, ItemPredicate, Pagination};
pub use resilient::{ResiliencePolicy, Resilient};
pub use traits::Repository;
