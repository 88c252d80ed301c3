//! Preparation of GraphQL operations into executable plans.
use std::hash::Hash;
use std::hash::Hasher;

use bytes::Bytes;

use crate::error::PlanError;
use crate::operation::OperationKind;

mod caching_query_planner;

pub use caching_query_planner::CachingQueryPlanner;

/// An operation after parsing and normalization, ready to be planned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedOperation {
    /// Canonical re-printed operation document
    pub printed: String,
    pub operation_name: Option<String>,
    pub kind: OperationKind,
    /// Variables extracted from inline arguments during normalization, as a JSON object
    pub extracted_variables: Bytes,
}

#[derive(Hash)]
struct OperationKey<'a> {
    printed: &'a str,
    operation_name: Option<&'a str>,
    extracted_variables: &'a [u8],
}

impl NormalizedOperation {
    /// 64-bit identifier of the operation shape, the key of the prepared plan cache.
    pub fn operation_id(&self) -> u64 {
        let mut hasher = StructHasher::new();
        OperationKey {
            printed: &self.printed,
            operation_name: self.operation_name.as_deref(),
            extracted_variables: &self.extracted_variables,
        }
        .hash(&mut hasher);
        hasher.finalize()
    }
}

/// Parses, normalizes and plans operations.
///
/// Implemented on top of a GraphQL library; `plan` is expensive and runs on the blocking pool.
pub trait QueryPlanner: Send + Sync + 'static {
    type Plan: Send + Sync + 'static;

    fn normalize(
        &self,
        query: &str,
        operation_name: Option<&str>,
    ) -> Result<NormalizedOperation, PlanError>;

    fn plan(&self, operation: &NormalizedOperation) -> Result<Self::Plan, PlanError>;
}

/// A compiled plan shared by every request with the same operation shape.
#[derive(Debug)]
pub struct PreparedPlan<P> {
    pub plan: P,
    pub kind: OperationKind,
    pub extracted_variables: Bytes,
}

struct StructHasher {
    hasher: blake3::Hasher,
}

impl StructHasher {
    fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    fn finalize(self) -> u64 {
        let hash = self.hasher.finalize();
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(id)
    }
}

impl Hasher for StructHasher {
    fn finish(&self) -> u64 {
        unreachable!()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(&[0xFF][..]);
        self.hasher.update(bytes);
    }
}
