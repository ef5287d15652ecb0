//! Shape definitions and handles.
//!
//! A [`Shape`] is an immutable, predicate-defined view of one Postgres
//! relation. Its identity is the content-addressed [`ShapeHandle`] derived
//! from the definition, so equal definitions share logs and consumers.

pub mod predicate;

use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use fxhash::FxHasher64;
use serde::{Deserialize, Serialize};

use crate::change::Relation;
use predicate::Predicate;

// ---------------------------------------------------------------------------
// ShapeHandle
// ---------------------------------------------------------------------------

/// Stable content-addressed identifier for a shape.
///
/// Used as the key in registries and log directories. Two shapes with the
/// same definition always produce the same handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeHandle(String);

impl ShapeHandle {
    /// Wraps an existing handle string (e.g. parsed from a request path).
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        ShapeHandle(handle.into())
    }

    /// Returns the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// WriteUnit
// ---------------------------------------------------------------------------

/// Granularity at which a consumer writes a transaction to its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteUnit {
    /// Buffer the whole transaction in memory; append and commit at the
    /// commit marker.
    Txn,
    /// Append each fragment as it arrives; only the committed watermark
    /// waits for the commit marker.
    TxnFragment,
}

impl fmt::Display for WriteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteUnit::Txn => f.write_str("txn"),
            WriteUnit::TxnFragment => f.write_str("txn_fragment"),
        }
    }
}

impl FromStr for WriteUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "txn" => Ok(WriteUnit::Txn),
            "txn_fragment" => Ok(WriteUnit::TxnFragment),
            other => Err(format!("unknown write_unit: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// A reference from an outer shape's predicate to an inner shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDependency {
    /// Handle of the inner shape the subquery reads.
    pub inner: ShapeHandle,
    /// Column of the outer relation tested for membership.
    pub outer_column: String,
    /// Column of the inner shape whose values form the membership set.
    pub inner_column: String,
}

/// An immutable shape definition: an origin relation plus an optional
/// `WHERE` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    relation: Relation,
    where_clause: Option<Predicate>,
}

impl Shape {
    /// Creates a shape over a whole relation.
    #[must_use]
    pub fn new(relation: Relation) -> Self {
        Self {
            relation,
            where_clause: None,
        }
    }

    /// Attaches a `WHERE` predicate.
    #[must_use]
    pub fn with_where(mut self, predicate: Predicate) -> Self {
        self.where_clause = Some(predicate);
        self
    }

    /// Returns the origin relation.
    #[must_use]
    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Returns the `WHERE` predicate, if any.
    #[must_use]
    pub fn where_clause(&self) -> Option<&Predicate> {
        self.where_clause.as_ref()
    }

    /// Returns `true` if the predicate has an `IN (SELECT …)` form
    /// referring to another shape.
    #[must_use]
    pub fn is_subquery_shape(&self) -> bool {
        !self.shape_dependencies().is_empty()
    }

    /// Returns `true` if the shape reads other shapes.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        self.is_subquery_shape()
    }

    /// Returns the inner-shape references of the predicate.
    #[must_use]
    pub fn shape_dependencies(&self) -> Vec<ShapeDependency> {
        match &self.where_clause {
            Some(pred) => pred.shape_references(),
            None => Vec::new(),
        }
    }

    /// Returns the content-addressed handle of this shape.
    #[must_use]
    pub fn handle(&self) -> ShapeHandle {
        let mut hasher = FxHasher64::default();
        hasher.write(self.relation.to_string().as_bytes());
        if let Some(pred) = &self.where_clause {
            hasher.write(b"?");
            hasher.write(pred.to_string().as_bytes());
        }
        ShapeHandle(format!("{:016x}", hasher.finish()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
