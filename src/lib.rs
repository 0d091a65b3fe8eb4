//! # vocest - Variant of Concern signature and proportion estimation
//!
//! Turns aligned sequencing reads into per-position coverage and mutation
//! counts, selects lineage-defining mutation signatures from a database of
//! lineage-labelled sequences, and estimates the proportion of a sample's
//! reads that carry a lineage signature with a confidence interval and a
//! test for lineage presence.

pub mod background;
pub mod bam;
pub mod estimate;
pub mod extract;
pub mod reference;
pub mod report;
pub mod signature;
pub mod tally;
pub mod utils;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Kind of difference between a read and the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Substitution,
    Insertion,
    Deletion,
}

impl MutationKind {
    fn symbol(self) -> char {
        match self {
            MutationKind::Substitution => '~',
            MutationKind::Insertion => '+',
            MutationKind::Deletion => '-',
        }
    }
}

/// A difference from the reference at a 1-based position.
///
/// Substitutions sit on the substituted base, deletions on the first deleted
/// base with the run length as `alt`, insertions on the reference base that
/// follows the inserted bases. The label is informational only and is ignored
/// by equality, ordering and hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub position: u32,
    pub alt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Mutation {
    pub fn new(kind: MutationKind, position: u32, alt: impl Into<String>) -> Self {
        Self {
            kind,
            position,
            alt: alt.into(),
            label: None,
        }
    }

    pub fn substitution(position: u32, alt: impl Into<String>) -> Self {
        Self::new(MutationKind::Substitution, position, alt)
    }

    pub fn insertion(position: u32, alt: impl Into<String>) -> Self {
        Self::new(MutationKind::Insertion, position, alt)
    }

    pub fn deletion(position: u32, length: u32) -> Self {
        Self::new(MutationKind::Deletion, position, length.to_string())
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn key(&self) -> (u32, MutationKind, &str) {
        (self.position, self.kind, self.alt.as_str())
    }
}

impl PartialEq for Mutation {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Mutation {}

impl Hash for Mutation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Mutation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Mutation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MutationKind::Substitution => write!(f, "~{}{}", self.position, self.alt),
            kind => write!(f, "{}{}.{}", kind.symbol(), self.position, self.alt),
        }
    }
}

impl FromStr for Mutation {
    type Err = VocError;

    /// Parses `~241T`, `+100.AT`, `-200.3` and the barcode form `C241T`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || VocError::InvalidRecord(format!("Invalid mutation: {}", s));

        let mut chars = s.chars();
        let first = chars.next().ok_or_else(invalid)?;
        let rest = chars.as_str();

        let parse_pos = |digits: &str| -> VocResult<u32> {
            match digits.parse::<u32>() {
                Ok(pos) if pos >= 1 => Ok(pos),
                _ => Err(invalid()),
            }
        };

        match first {
            '~' | 'A' | 'C' | 'G' | 'T' => {
                let split = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
                let (digits, alt) = rest.split_at(split);
                if alt.len() != 1 {
                    return Err(invalid());
                }
                Ok(Mutation::substitution(parse_pos(digits)?, alt))
            }
            '+' | '-' => {
                let (digits, alt) = rest.split_once('.').ok_or_else(invalid)?;
                let position = parse_pos(digits)?;
                if first == '+' {
                    if alt.is_empty() {
                        return Err(invalid());
                    }
                    Ok(Mutation::insertion(position, alt))
                } else {
                    let length = alt.parse::<u32>().map_err(|_| invalid())?;
                    if length == 0 {
                        return Err(invalid());
                    }
                    Ok(Mutation::deletion(position, length))
                }
            }
            _ => Err(invalid()),
        }
    }
}

/// Inclusive 1-based range of reference positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, pos: u32) -> bool {
        self.start <= pos && pos <= self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// Parameters for turning aligned reads into mutations
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub min_quality: u8, // Minimum phred quality for a mismatching base
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self { min_quality: 10 }
    }
}

/// Presence/absence thresholds for signature selection
#[derive(Debug, Clone)]
pub struct SignatureConfig {
    pub min_target: f64,     // Target presence must be strictly above
    pub max_background: f64, // Background presence must be strictly below
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            min_target: 0.95,
            max_background: 0.05,
        }
    }
}

/// Parameters for the proportion estimate and presence test
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub null_value: f64,
    pub confidence_level: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            null_value: 0.01,
            confidence_level: 0.95,
            max_iterations: 50,
            tolerance: 1e-10,
        }
    }
}

/// Error types for the vocest library
#[derive(Debug, thiserror::Error)]
pub enum VocError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTSlib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("FASTA/FASTQ parse error: {0}")]
    Fastx(#[from] needletail::errors::ParseError),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Malformed input in {record}: position {position} outside reference of length {genome_len}"
    )]
    MalformedInput {
        record: String,
        position: u64,
        genome_len: u32,
    },

    #[error("No defining mutations for lineage {0}")]
    EmptySignature(String),

    #[error("Frequency undefined for {0}: no coverage")]
    UndefinedFrequency(String),

    #[error(
        "Estimate undefined for sample {sample}, lineage {lineage}: \
         no coverage of defining mutations"
    )]
    UndefinedEstimate { sample: String, lineage: String },

    #[error("Model fit failed: {0}")]
    NumericalFitFailure(String),
}

pub type VocResult<T> = Result<T, VocError>;
