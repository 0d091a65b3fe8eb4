//! Lineage signature selection and signature files

use crate::{
    background::PresenceTable, utils::open_reader, Mutation, MutationKind, SignatureConfig,
    VocError, VocResult,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, Read, Write};
use std::path::Path;

/// A defining mutation with the presence fractions it was selected on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub mutation: Mutation,
    pub target_fraction: f64,
    pub background_fraction: f64,
}

/// Mutations that discriminate a lineage from background sequences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageSignature {
    pub lineage: String,
    pub created: NaiveDate,
    pub entries: Vec<SignatureEntry>,
}

impl LineageSignature {
    pub fn new(
        lineage: impl Into<String>,
        created: NaiveDate,
        mut entries: Vec<SignatureEntry>,
    ) -> Self {
        entries.sort_by(|a, b| a.mutation.cmp(&b.mutation));
        entries.dedup_by(|a, b| a.mutation == b.mutation);
        Self {
            lineage: lineage.into(),
            created,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.entries.iter().map(|e| &e.mutation)
    }

    /// A lineage cannot be estimated without defining mutations
    pub fn ensure_not_empty(&self) -> VocResult<()> {
        if self.is_empty() {
            return Err(VocError::EmptySignature(self.lineage.clone()));
        }
        Ok(())
    }
}

/// Validate presence/absence thresholds
pub fn validate_signature_config(config: &SignatureConfig) -> VocResult<()> {
    if !(0.0..=1.0).contains(&config.min_target) {
        return Err(VocError::InvalidConfig(
            "min_target must be between 0 and 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.max_background) {
        return Err(VocError::InvalidConfig(
            "max_background must be between 0 and 1".to_string(),
        ));
    }
    Ok(())
}

/// Select every mutation nearly fixed in the target and nearly absent from
/// the background. Both comparisons are strict; a mutation with no background
/// fraction is never selected. The result may be empty.
pub fn select_signature(
    lineage: &str,
    target: &PresenceTable,
    background: &PresenceTable,
    config: &SignatureConfig,
    created: NaiveDate,
) -> LineageSignature {
    let entries: Vec<SignatureEntry> = target
        .iter()
        .filter(|&(_, target_fraction)| target_fraction > config.min_target)
        .filter_map(|(m, target_fraction)| {
            let background_fraction = background.get(m)?;
            (background_fraction < config.max_background).then(|| SignatureEntry {
                mutation: m.clone(),
                target_fraction,
                background_fraction,
            })
        })
        .collect();

    log::info!(
        "Selected {} defining mutations for {} out of {} candidates",
        entries.len(),
        lineage,
        target.len()
    );

    LineageSignature::new(lineage, created, entries)
}

/// One line of a signature file
#[derive(Debug, Serialize, Deserialize)]
struct SignatureRow {
    #[serde(rename = "type")]
    kind: MutationKind,
    position: u32,
    alt: String,
    label: Option<String>,
    target: Option<f64>,
    background: Option<f64>,
}

const HEADER_PREFIX: &str = "#lineage=";

/// Write a signature as CSV with a lineage/date comment line
pub fn write_signature<P: AsRef<Path>>(signature: &LineageSignature, path: P) -> VocResult<()> {
    let mut file = File::create(path)?;
    writeln!(
        file,
        "{}{},created={}",
        HEADER_PREFIX, signature.lineage, signature.created
    )?;

    let mut writer = csv::Writer::from_writer(file);
    for entry in &signature.entries {
        writer.serialize(SignatureRow {
            kind: entry.mutation.kind,
            position: entry.mutation.position,
            alt: entry.mutation.alt.clone(),
            label: entry.mutation.label.clone(),
            target: Some(entry.target_fraction),
            background: Some(entry.background_fraction),
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a signature file.
///
/// The lineage and date come from the comment line when present, otherwise
/// from the file stem and today's date. Missing fractions default to a fully
/// fixed, background-free mutation.
pub fn read_signature<P: AsRef<Path>>(path: P) -> VocResult<LineageSignature> {
    let mut reader = open_reader(&path)?;

    let mut first_line = String::new();
    let mut lineage = None;
    let mut created = None;
    let mut body = String::new();

    reader.read_line(&mut first_line)?;
    if let Some(meta) = first_line.trim().strip_prefix(HEADER_PREFIX) {
        let (name, date) = match meta.split_once(",created=") {
            Some((name, date)) => (name, Some(date)),
            None => (meta, None),
        };
        lineage = Some(name.trim().to_string());
        if let Some(date) = date {
            created = Some(NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|e| {
                VocError::InvalidRecord(format!("Invalid signature date {:?}: {}", date, e))
            })?);
        }
    } else {
        body.push_str(&first_line);
    }
    reader.read_to_string(&mut body)?;

    let lineage = lineage.unwrap_or_else(|| {
        path.as_ref()
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    });
    let created = created.unwrap_or_else(|| chrono::Local::now().date_naive());

    let mut csv_reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut entries = Vec::new();
    for row in csv_reader.deserialize::<SignatureRow>() {
        let row = row?;
        if row.position == 0 {
            return Err(VocError::InvalidRecord(format!(
                "Signature position must be at least 1 in {}",
                lineage
            )));
        }
        let mut mutation = Mutation::new(row.kind, row.position, row.alt);
        mutation.label = row.label.filter(|l| !l.is_empty());
        entries.push(SignatureEntry {
            mutation,
            target_fraction: row.target.unwrap_or(1.0),
            background_fraction: row.background.unwrap_or(0.0),
        });
    }

    Ok(LineageSignature::new(lineage, created, entries))
}

/// Write a signature as JSON
pub fn write_signature_json<P: AsRef<Path>>(
    signature: &LineageSignature,
    path: P,
) -> VocResult<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, signature)?;
    Ok(())
}
