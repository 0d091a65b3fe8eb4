//! Reference genome loading and position lookup

use crate::{utils::validate_file_exists, VocError, VocResult};
use std::path::Path;

/// Reference sequence indexed by 1-based position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceGenome {
    name: String,
    seq: Vec<u8>,
}

impl ReferenceGenome {
    pub fn new(name: impl Into<String>, seq: &[u8]) -> VocResult<Self> {
        if seq.is_empty() {
            return Err(VocError::InvalidRecord("Reference sequence is empty".to_string()));
        }
        if seq.len() > u32::MAX as usize {
            return Err(VocError::InvalidRecord(format!(
                "Reference sequence too long: {} bases",
                seq.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            seq: seq.iter().map(|b| b.to_ascii_uppercase()).collect(),
        })
    }

    /// Load the first record of a FASTA file, plain or gzipped
    pub fn from_fasta<P: AsRef<Path>>(path: P) -> VocResult<Self> {
        let path = path.as_ref();
        validate_file_exists(path)?;

        let mut reader = needletail::parse_fastx_file(path)?;
        let reference = match reader.next() {
            Some(record) => {
                let record = record?;
                Self::new(record_name(record.id()), &record.seq())?
            }
            None => {
                return Err(VocError::InvalidRecord(format!(
                    "No sequence found in {}",
                    path.display()
                )))
            }
        };

        if reader.next().is_some() {
            log::warn!(
                "Reference file {} has more than one record, using {}",
                path.display(),
                reference.name
            );
        }

        log::info!("Loaded reference {} ({} bp)", reference.name, reference.len());
        Ok(reference)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u32 {
        self.seq.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Base at a 1-based position, `None` outside the genome
    pub fn base(&self, pos: u32) -> Option<u8> {
        if pos == 0 {
            return None;
        }
        self.seq.get(pos as usize - 1).copied()
    }
}

/// Sequence name from a FASTA header: the first whitespace-separated word
pub(crate) fn record_name(id: &[u8]) -> String {
    String::from_utf8_lossy(id)
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}
