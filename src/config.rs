//! Plan-time description of one hash join.

use std::sync::Arc;

use crate::chunk::FieldType;
use crate::codec;
use crate::error::{JoinError, Result};
use crate::predicate::Predicate;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_PARTITION_NUMBER: usize = 16;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024;

/// Join semantics, always read as `left JOIN right`. Semi and anti joins output
/// left columns only.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    Semi,
    AntiSemi,
}

#[derive(Clone)]
pub struct JoinConfig {
    pub join_type: JoinType,
    /// The right input builds the hash table; otherwise the left one does.
    pub right_as_build: bool,
    pub concurrency: usize,
    pub partition_number: usize,
    pub max_chunk_size: usize,
    pub left_keys: Vec<usize>,
    pub right_keys: Vec<usize>,
    /// Per key: NULL equals NULL (`<=>`). Empty means all false.
    pub null_eq: Vec<bool>,
    /// A left row failing this filter never matches.
    pub left_filter: Option<Arc<dyn Predicate>>,
    pub right_filter: Option<Arc<dyn Predicate>>,
    /// Checked on candidate pairs laid out as the projected left columns
    /// followed by the projected right columns.
    pub other_condition: Option<Arc<dyn Predicate>>,
    /// Projected columns per side; `None` keeps all of them.
    pub left_used: Option<Vec<usize>>,
    pub right_used: Option<Vec<usize>>,
    pub collect_stats: bool,
}

impl JoinConfig {
    pub fn new(join_type: JoinType, left_keys: Vec<usize>, right_keys: Vec<usize>) -> Self {
        Self {
            join_type,
            right_as_build: true,
            concurrency: DEFAULT_CONCURRENCY,
            partition_number: DEFAULT_PARTITION_NUMBER,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            left_keys,
            right_keys,
            null_eq: Vec::new(),
            left_filter: None,
            right_filter: None,
            other_condition: None,
            left_used: None,
            right_used: None,
            collect_stats: false,
        }
    }

    pub fn with_left_as_build(mut self) -> Self {
        self.right_as_build = false;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_partitions(mut self, partition_number: usize) -> Self {
        self.partition_number = partition_number;
        self
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn with_null_eq(mut self, null_eq: Vec<bool>) -> Self {
        self.null_eq = null_eq;
        self
    }

    pub fn with_left_filter(mut self, filter: Arc<dyn Predicate>) -> Self {
        self.left_filter = Some(filter);
        self
    }

    pub fn with_right_filter(mut self, filter: Arc<dyn Predicate>) -> Self {
        self.right_filter = Some(filter);
        self
    }

    pub fn with_other_condition(mut self, cond: Arc<dyn Predicate>) -> Self {
        self.other_condition = Some(cond);
        self
    }

    pub fn with_projection(mut self, left_used: Vec<usize>, right_used: Vec<usize>) -> Self {
        self.left_used = Some(left_used);
        self.right_used = Some(right_used);
        self
    }

    pub fn with_stats(mut self) -> Self {
        self.collect_stats = true;
        self
    }

    /// Checks the config against the input schemas.
    pub(crate) fn validate(&self, left: &[FieldType], right: &[FieldType]) -> Result<()> {
        let invalid = |msg: String| Err(JoinError::InvalidConfig(msg));
        if self.concurrency == 0 {
            return invalid("concurrency must be positive".into());
        }
        if self.partition_number == 0 {
            return invalid("partition number must be positive".into());
        }
        if self.max_chunk_size == 0 {
            return invalid("max chunk size must be positive".into());
        }
        if self.left_keys.is_empty() || self.left_keys.len() != self.right_keys.len() {
            return invalid(format!(
                "key count mismatch: {} left, {} right",
                self.left_keys.len(),
                self.right_keys.len()
            ));
        }
        if !self.null_eq.is_empty() && self.null_eq.len() != self.left_keys.len() {
            return invalid("null_eq must have one entry per key".into());
        }
        for (name, cols, types) in [
            ("left key", &self.left_keys, left),
            ("right key", &self.right_keys, right),
        ] {
            if let Some(&c) = cols.iter().find(|&&c| c >= types.len()) {
                return invalid(format!("{name} column {c} out of range"));
            }
        }
        for (name, used, types) in [
            ("left", &self.left_used, left),
            ("right", &self.right_used, right),
        ] {
            if let Some(&c) = used.iter().flatten().find(|&&c| c >= types.len()) {
                return invalid(format!("{name} projected column {c} out of range"));
            }
        }
        for (&l, &r) in self.left_keys.iter().zip(&self.right_keys) {
            if !codec::comparable(&left[l], &right[r]) {
                return invalid(format!(
                    "cannot compare {:?} with {:?}",
                    left[l].kind, right[r].kind
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for JoinConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinConfig")
            .field("join_type", &self.join_type)
            .field("right_as_build", &self.right_as_build)
            .field("concurrency", &self.concurrency)
            .field("partition_number", &self.partition_number)
            .field("max_chunk_size", &self.max_chunk_size)
            .field("left_keys", &self.left_keys)
            .field("right_keys", &self.right_keys)
            .field("has_other_condition", &self.other_condition.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = JoinConfig::new(JoinType::Inner, vec![0], vec![0]);
        assert!(cfg.right_as_build);
        assert_eq!(cfg.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(cfg.partition_number, DEFAULT_PARTITION_NUMBER);
        assert!(cfg.validate(&[FieldType::int()], &[FieldType::int()]).is_ok());
    }

    #[test]
    fn rejects_bad_configs() {
        let ints = [FieldType::int(), FieldType::string()];
        let base = || JoinConfig::new(JoinType::Inner, vec![0], vec![0]);

        assert!(base().with_concurrency(0).validate(&ints, &ints).is_err());
        assert!(base().with_partitions(0).validate(&ints, &ints).is_err());
        assert!(JoinConfig::new(JoinType::Inner, vec![0, 1], vec![0])
            .validate(&ints, &ints)
            .is_err());
        assert!(JoinConfig::new(JoinType::Inner, vec![5], vec![0])
            .validate(&ints, &ints)
            .is_err());
        assert!(JoinConfig::new(JoinType::Inner, vec![0], vec![1])
            .validate(&ints, &ints)
            .is_err());
        assert!(base().with_projection(vec![0], vec![7]).validate(&ints, &ints).is_err());
        assert!(base().with_null_eq(vec![true, false]).validate(&ints, &ints).is_err());
    }

    #[test]
    fn signed_and_unsigned_keys_are_comparable() {
        let cfg = JoinConfig::new(JoinType::Inner, vec![0], vec![0]);
        assert!(cfg.validate(&[FieldType::int()], &[FieldType::uint()]).is_ok());
        assert!(cfg.validate(&[FieldType::float()], &[FieldType::int()]).is_err());
    }
}
