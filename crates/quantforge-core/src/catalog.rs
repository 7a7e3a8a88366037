//! Quantization type catalog and output-size model.
//!
//! The catalog order is the order output files are produced in, so it is kept
//! stable. [`CompressionTable`] is a plain value: the pipeline receives one at
//! construction and tests substitute their own.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::config::AdmissionConfig;

/// Every quantization type `llama-quantize` accepts, in production order.
const CATALOG: &[&str] = &[
    "Q4_0", "Q4_1", "Q5_0", "Q5_1", "IQ2_XXS", "IQ2_XS", "IQ2_S", "IQ2_M", "IQ1_S", "IQ1_M",
    "Q2_K", "Q2_K_S", "IQ3_XXS", "IQ3_S", "IQ3_M", "Q3_K", "IQ3_XS", "Q3_K_S", "Q3_K_M",
    "Q3_K_L", "IQ4_NL", "IQ4_XS", "Q4_K", "Q4_K_S", "Q4_K_M", "Q5_K", "Q5_K_S", "Q5_K_M",
    "Q6_K", "Q8_0", "F16", "BF16", "F32", "COPY",
];

/// Formats that copy or widen weights instead of quantizing them.
const PASSTHROUGH: &[&str] = &["F16", "BF16", "F32", "COPY"];

/// Non-IQ types that still need an importance matrix.
const IMATRIX_EXTRA: &[&str] = &["Q2_K_S"];

/// Measured output size relative to an F16 input.
const REFERENCE_RATIOS: &[(&str, f64)] = &[
    ("Q4_0", 0.29099),
    ("IQ1_M", 0.13454),
    ("IQ3_XS", 0.2189),
    ("Q2_K", 0.19784),
    ("Q4_1", 0.31926),
    ("IQ3_XXS", 0.2038),
    ("Q3_K_M", 0.2501),
    ("IQ1_S", 0.12568),
    ("Q3_K", 0.2501),
    ("Q3_K_S", 0.228),
    ("Q4_K", 0.3062),
    ("Q5_0", 0.3493),
    ("Q2_K_S", 0.186),
    ("Q5_K_S", 0.3484),
    ("Q8_0", 0.5315),
    ("Q4_K_S", 0.292),
    ("Q5_K", 0.3567),
    ("IQ2_XS", 0.1621),
    ("IQ2_XXS", 0.1493),
    ("IQ4_XS", 0.2767),
    ("Q5_1", 0.3776),
    ("Q6_K", 0.4104),
    ("IQ3_S", 0.2291),
    ("IQ2_S", 0.1716),
    ("IQ3_M", 0.2355),
    ("Q4_K_M", 0.30622),
    ("IQ2_M", 0.1834),
    ("Q5_K_M", 0.3567),
    ("IQ4_NL", 0.29112),
    ("Q3_K_L", 0.2689),
];

/// A single quantization type from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct QuantType {
    name: &'static str,
    requires_imatrix: bool,
    passthrough: bool,
}

impl QuantType {
    fn from_catalog(name: &'static str) -> Self {
        Self {
            name,
            requires_imatrix: name.starts_with("IQ") || IMATRIX_EXTRA.contains(&name),
            passthrough: PASSTHROUGH.contains(&name),
        }
    }

    /// Look up a type by identifier, ignoring case and surrounding whitespace.
    pub fn parse(token: &str) -> Option<Self> {
        let normalized = token.trim().to_uppercase();
        CATALOG
            .iter()
            .find(|name| **name == normalized)
            .map(|name| Self::from_catalog(name))
    }

    /// All catalog types in production order.
    pub fn all() -> impl Iterator<Item = QuantType> {
        CATALOG.iter().map(|name| Self::from_catalog(name))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn requires_imatrix(&self) -> bool {
        self.requires_imatrix
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Position in the catalog, used to keep sets in production order.
    pub(crate) fn catalog_index(&self) -> usize {
        CATALOG
            .iter()
            .position(|name| *name == self.name)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Expected output size of each type as a fraction of the input model size.
#[derive(Debug, Clone)]
pub struct CompressionTable {
    ratios: HashMap<String, f64>,
    safety_margin: f64,
}

impl Default for CompressionTable {
    fn default() -> Self {
        Self::from_ratios(REFERENCE_RATIOS.iter().map(|(name, ratio)| (*name, *ratio)))
    }
}

impl CompressionTable {
    /// Build a table from `(type, ratio)` pairs with the standard safety margin.
    pub fn from_ratios<'a>(ratios: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        Self {
            ratios: ratios
                .into_iter()
                .map(|(name, ratio)| (name.to_uppercase(), ratio))
                .collect(),
            safety_margin: AdmissionConfig::SIZE_SAFETY_MARGIN,
        }
    }

    pub fn ratio(&self, quant: QuantType) -> Option<f64> {
        self.ratios.get(quant.name()).copied()
    }

    /// Estimated output bytes for one type, or `None` when the ratio is unknown.
    pub fn estimate(&self, input_size: u64, quant: QuantType) -> Option<u64> {
        self.ratio(quant)
            .map(|ratio| (input_size as f64 * ratio * self.safety_margin).round() as u64)
    }
}
