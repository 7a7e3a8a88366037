//! Expansion of a requested type selection into an ordered [`TypeSet`].

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::warn;

use crate::catalog::QuantType;
use crate::error::{QuantError, Result};

/// Token that selects every applicable catalog type.
pub const WILDCARD: &str = "ALL";

/// Ordered, duplicate-free set of quantization types in catalog order.
///
/// Only admission control removes entries; [`TypeSet::freeze`] produces the
/// immutable set the pipeline executes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeSet {
    types: Vec<QuantType>,
}

impl TypeSet {
    /// Build a set from arbitrary types, deduplicating into catalog order.
    pub fn from_types(types: impl IntoIterator<Item = QuantType>) -> Self {
        let mut types: Vec<QuantType> = types.into_iter().collect();
        types.sort_by_key(|q| q.catalog_index());
        types.dedup();
        Self { types }
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuantType> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.iter().any(|q| q.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|q| q.name()).collect()
    }

    /// Remove a type by identifier; returns whether it was present.
    pub(crate) fn remove(&mut self, name: &str) -> bool {
        let before = self.types.len();
        self.types.retain(|q| q.name() != name);
        self.types.len() != before
    }

    pub fn freeze(self) -> FrozenTypeSet {
        FrozenTypeSet { types: self.types }
    }
}

/// The final, immutable set of types a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrozenTypeSet {
    types: Vec<QuantType>,
}

impl FrozenTypeSet {
    pub fn iter(&self) -> impl Iterator<Item = &QuantType> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|q| q.name()).collect()
    }
}

/// Resolve requested type tokens against the catalog.
///
/// The wildcard drops passthrough formats, and also drops imatrix types when
/// `has_imatrix` is false. Explicit requests are kept as-is; a missing imatrix
/// for them is reported later by the pipeline.
pub fn resolve<S: AsRef<str>>(requested: &[S], has_imatrix: bool) -> Result<TypeSet> {
    if requested.is_empty() {
        return Err(QuantError::Config {
            message: "no quantization types requested".to_string(),
        });
    }

    let mut explicit = BTreeSet::new();
    let mut wildcard = false;

    for token in requested {
        let token = token.as_ref();
        if token.trim().eq_ignore_ascii_case(WILDCARD) {
            wildcard = true;
            continue;
        }
        let quant = QuantType::parse(token).ok_or_else(|| QuantError::UnknownQuantType {
            name: token.trim().to_string(),
        })?;
        explicit.insert(quant.catalog_index());
    }

    if !wildcard {
        return Ok(TypeSet::from_types(
            QuantType::all().filter(|q| explicit.contains(&q.catalog_index())),
        ));
    }

    let skipped: Vec<&str> = if has_imatrix {
        Vec::new()
    } else {
        QuantType::all()
            .filter(|q| q.requires_imatrix())
            .map(|q| q.name())
            .collect()
    };
    if !skipped.is_empty() {
        warn!(
            "imatrix not provided. Skipping quantization types: {}",
            skipped.join(", ")
        );
    }

    Ok(TypeSet::from_types(QuantType::all().filter(|q| {
        !q.is_passthrough() && (has_imatrix || !q.requires_imatrix())
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_request_in_catalog_order() {
        let set = resolve(&["q8_0", "Q4_0", "Q4_K_M"], false).unwrap();
        assert_eq!(set.names(), vec!["Q4_0", "Q4_K_M", "Q8_0"]);
    }

    #[test]
    fn test_duplicates_collapse() {
        let set = resolve(&["Q4_0", "q4_0", " Q4_0 "], false).unwrap();
        assert_eq!(set.names(), vec!["Q4_0"]);
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let err = resolve(&["Q4_0", "Q7_K"], true).unwrap_err();
        assert!(matches!(err, QuantError::UnknownQuantType { ref name } if name == "Q7_K"));
    }

    #[test]
    fn test_empty_request_rejected() {
        let empty: [&str; 0] = [];
        assert!(resolve(&empty, true).is_err());
    }

    #[test]
    fn test_wildcard_without_imatrix_excludes_marked_types() {
        let set = resolve(&["all"], false).unwrap();
        assert!(set.iter().all(|q| !q.requires_imatrix()));
        assert!(set.iter().all(|q| !q.is_passthrough()));
        assert!(!set.contains("Q2_K_S"));
        assert!(set.iter().all(|q| !q.name().starts_with("IQ")));

        let expected = QuantType::all()
            .filter(|q| !q.is_passthrough() && !q.requires_imatrix())
            .count();
        assert_eq!(set.len(), expected);
        assert_eq!(set.len(), 17);
    }

    #[test]
    fn test_wildcard_with_imatrix_keeps_every_quantizing_type() {
        let set = resolve(&["ALL"], true).unwrap();
        let expected: Vec<_> = QuantType::all()
            .filter(|q| !q.is_passthrough())
            .map(|q| q.name())
            .collect();
        assert_eq!(set.names(), expected);
    }

    #[test]
    fn test_explicit_imatrix_type_is_kept() {
        let set = resolve(&["IQ2_M"], false).unwrap();
        assert_eq!(set.names(), vec!["IQ2_M"]);
    }

    #[test]
    fn test_freeze_preserves_order() {
        let frozen = resolve(&["Q8_0", "Q2_K"], false).unwrap().freeze();
        assert_eq!(frozen.names(), vec!["Q2_K", "Q8_0"]);
    }
}
