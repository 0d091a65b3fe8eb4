//! Per-lineage mutation presence across a database of sequences

use crate::{
    extract::{AlignedRead, MutationExtractor, ReadObservation},
    reference::{record_name, ReferenceGenome},
    tally::{CoverageVector, MalformedPolicy, MutationCountTable, Observation, Tally},
    utils::{open_reader, validate_file_exists},
    Mutation, Span, VocError, VocResult,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// One database sequence compared against the reference, with its lineage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub lineage: String,
    pub observation: ReadObservation,
}

impl Observation for SequenceRecord {
    fn id(&self) -> &str {
        &self.observation.name
    }

    fn mutations(&self) -> &BTreeSet<Mutation> {
        &self.observation.mutations
    }

    fn covered(&self) -> &[Span] {
        &self.observation.covered
    }
}

/// Presence fraction of each mutation within a set of sequences.
///
/// A mutation never observed has fraction 0 where the set covers its
/// position and no fraction at all where it does not.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable {
    fractions: BTreeMap<Mutation, f64>,
    coverage: Option<CoverageVector>,
}

impl PresenceTable {
    pub fn from_tally(tally: &Tally) -> Self {
        let fractions = tally
            .counts
            .iter()
            .filter_map(|(m, count)| {
                let coverage = tally.coverage_of(m);
                (coverage > 0).then(|| (m.clone(), count as f64 / coverage as f64))
            })
            .collect();

        Self {
            fractions,
            coverage: Some(tally.coverage.clone()),
        }
    }

    /// Table of known fractions only; unlisted mutations have no fraction
    pub fn from_fractions<I: IntoIterator<Item = (Mutation, f64)>>(fractions: I) -> Self {
        Self {
            fractions: fractions.into_iter().collect(),
            coverage: None,
        }
    }

    pub fn get(&self, mutation: &Mutation) -> Option<f64> {
        if let Some(&fraction) = self.fractions.get(mutation) {
            return Some(fraction);
        }
        self.coverage
            .as_ref()
            .filter(|coverage| coverage.depth(mutation.position) > 0)
            .map(|_| 0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Mutation, f64)> {
        self.fractions.iter().map(|(m, &f)| (m, f))
    }

    pub fn len(&self) -> usize {
        self.fractions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fractions.is_empty()
    }
}

/// Per-lineage tallies over a sequence database
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    genome_len: u32,
    lineages: BTreeMap<String, Tally>,
}

impl BackgroundModel {
    pub fn new(genome_len: u32) -> Self {
        Self {
            genome_len,
            lineages: BTreeMap::new(),
        }
    }

    /// Count one sequence toward its lineage.
    ///
    /// A lineage is only added once one of its sequences has been counted.
    pub fn add(&mut self, record: &SequenceRecord) -> VocResult<()> {
        if let Some(tally) = self.lineages.get_mut(&record.lineage) {
            return tally.observe(record);
        }
        let mut tally = Tally::new(self.genome_len);
        tally.observe(record)?;
        self.lineages.insert(record.lineage.clone(), tally);
        Ok(())
    }

    /// Build from a stream of sequences, returning the number skipped as malformed
    pub fn build<I>(
        records: I,
        genome_len: u32,
        policy: MalformedPolicy,
    ) -> VocResult<(Self, usize)>
    where
        I: IntoIterator<Item = VocResult<SequenceRecord>>,
    {
        let mut model = Self::new(genome_len);
        let mut skipped = 0;

        for record in records {
            match record.and_then(|r| model.add(&r)) {
                Ok(()) => {}
                Err(e @ VocError::MalformedInput { .. }) if policy == MalformedPolicy::Skip => {
                    log::warn!("Skipping sequence: {}", e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Built background over {} lineages ({} sequences skipped)",
            model.lineages.len(),
            skipped
        );
        Ok((model, skipped))
    }

    /// Build from in-memory sequences, tallying each lineage on its own worker
    pub fn from_records(
        records: &[SequenceRecord],
        genome_len: u32,
        policy: MalformedPolicy,
    ) -> VocResult<(Self, usize)> {
        let mut groups: BTreeMap<&str, Vec<&SequenceRecord>> = BTreeMap::new();
        for record in records {
            groups.entry(record.lineage.as_str()).or_default().push(record);
        }

        let tallies: Vec<(String, Tally, usize)> = groups
            .into_par_iter()
            .map(|(lineage, group)| -> VocResult<(String, Tally, usize)> {
                let mut tally = Tally::new(genome_len);
                let skipped = tally.observe_all(group.into_iter().map(Ok), policy)?;
                Ok((lineage.to_string(), tally, skipped))
            })
            .collect::<VocResult<_>>()?;

        let mut model = Self::new(genome_len);
        let mut skipped = 0;
        for (lineage, tally, n) in tallies {
            skipped += n;
            if tally.observations > 0 {
                model.lineages.insert(lineage, tally);
            }
        }
        Ok((model, skipped))
    }

    pub fn genome_len(&self) -> u32 {
        self.genome_len
    }

    pub fn lineage_names(&self) -> impl Iterator<Item = &str> {
        self.lineages.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, lineage: &str) -> bool {
        self.lineages.contains_key(lineage)
    }

    pub fn tally(&self, lineage: &str) -> Option<&Tally> {
        self.lineages.get(lineage)
    }

    /// Number of sequences counted for a lineage
    pub fn sequences(&self, lineage: &str) -> u64 {
        self.lineages.get(lineage).map_or(0, |t| t.observations)
    }

    /// Presence fraction of each mutation within one lineage
    pub fn presence(&self, lineage: &str) -> Option<PresenceTable> {
        self.lineages.get(lineage).map(PresenceTable::from_tally)
    }

    /// Presence fractions pooled over every sequence not in `lineage`
    pub fn background_excluding(&self, lineage: &str) -> VocResult<PresenceTable> {
        let mut pooled = Tally::new(self.genome_len);
        for (name, tally) in &self.lineages {
            if name != lineage {
                pooled.merge(tally)?;
            }
        }
        Ok(PresenceTable::from_tally(&pooled))
    }

    /// Number of lineages in which the mutation was observed at least once
    pub fn lineages_carrying(&self, mutation: &Mutation) -> usize {
        self.lineages
            .values()
            .filter(|t| t.counts.count(mutation) > 0)
            .count()
    }

    /// Occurrences of each mutation across the whole database
    pub fn global_counts(&self) -> MutationCountTable {
        let mut counts = MutationCountTable::new();
        for tally in self.lineages.values() {
            for (m, c) in tally.counts.iter() {
                counts.add(m.clone(), c);
            }
        }
        counts
    }

    /// Total mutation occurrences across the sequences of a lineage
    pub fn lineage_total(&self, lineage: &str) -> u64 {
        self.lineages.get(lineage).map_or(0, |t| t.counts.total())
    }
}

/// Read a two-column `name,lineage` CSV
pub fn read_lineage_map<P: AsRef<Path>>(path: P) -> VocResult<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(open_reader(path)?);

    let mut lineages = HashMap::new();
    for result in reader.records() {
        let record = result?;
        if record.len() < 2 {
            return Err(VocError::InvalidRecord(format!(
                "Expected name and lineage columns, got {:?}",
                record
            )));
        }
        lineages.insert(record[0].trim().to_string(), record[1].trim().to_string());
    }
    Ok(lineages)
}

/// Extract database sequences from a reference-length alignment, plain or
/// gzipped FASTA.
///
/// Sequences without a lineage in `lineages` are skipped.
pub fn read_aligned_database<P: AsRef<Path>>(
    path: P,
    lineages: &HashMap<String, String>,
    extractor: &MutationExtractor,
) -> VocResult<Vec<VocResult<SequenceRecord>>> {
    let genome_len = extractor.reference().len() as usize;
    let mut records = Vec::new();
    let mut unlabelled = 0usize;

    let path = path.as_ref();
    validate_file_exists(path)?;

    let mut reader = needletail::parse_fastx_file(path)?;
    while let Some(record) = reader.next() {
        let record = record?;
        let name = record_name(record.id());
        let Some(lineage) = lineages.get(&name) else {
            unlabelled += 1;
            continue;
        };

        let seq = record.seq();
        if seq.len() != genome_len {
            log::warn!(
                "Aligned sequence {} has length {}, expected {}",
                name,
                seq.len(),
                genome_len
            );
        }

        let read = AlignedRead::from_aligned_sequence(name, &seq);
        records.push(extractor.extract(&read).map(|observation| SequenceRecord {
            lineage: lineage.clone(),
            observation,
        }));
    }

    if unlabelled > 0 {
        log::warn!("Skipped {} sequences with no lineage assignment", unlabelled);
    }
    Ok(records)
}

/// Read a lineage barcode matrix: one row per lineage, one column per
/// mutation (`C241T` form), cells 1 where the lineage carries the mutation.
///
/// Each lineage becomes a single sequence covering the whole genome. A
/// column whose reference base disagrees with `reference` is rejected.
pub fn read_barcodes<P: AsRef<Path>>(
    path: P,
    reference: &ReferenceGenome,
) -> VocResult<Vec<SequenceRecord>> {
    let genome_len = reference.len();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(open_reader(path)?);

    let mutations: Vec<Mutation> = reader
        .headers()?
        .iter()
        .skip(1)
        .map(|h| barcode_mutation(h, reference))
        .collect::<VocResult<_>>()?;

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let lineage = row.get(0).unwrap_or("").trim().to_string();
        if lineage.is_empty() {
            return Err(VocError::InvalidRecord("Barcode row without lineage".to_string()));
        }

        let mut carried = BTreeSet::new();
        for (m, cell) in mutations.iter().zip(row.iter().skip(1)) {
            let value: f64 = cell.trim().parse().map_err(|_| {
                VocError::InvalidRecord(format!("Invalid barcode value {:?} for {}", cell, lineage))
            })?;
            if value > 0.5 {
                carried.insert(m.clone());
            }
        }

        records.push(SequenceRecord {
            lineage: lineage.clone(),
            observation: ReadObservation {
                name: lineage,
                mutations: carried,
                covered: vec![Span::new(1, genome_len)],
            },
        });
    }
    Ok(records)
}

/// Parse a barcode column header, checking its position and reference base
fn barcode_mutation(header: &str, reference: &ReferenceGenome) -> VocResult<Mutation> {
    let header = header.trim();
    let mutation: Mutation = header.parse()?;

    let Some(ref_base) = reference.base(mutation.position) else {
        return Err(VocError::InvalidRecord(format!(
            "Barcode mutation {} lies outside reference {} of length {}",
            header,
            reference.name(),
            reference.len()
        )));
    };

    let stated = header.bytes().next().filter(|b| b.is_ascii_alphabetic());
    if let Some(stated) = stated.filter(|b| !b.eq_ignore_ascii_case(&ref_base)) {
        return Err(VocError::InvalidRecord(format!(
            "Barcode mutation {} expects {} at position {}, reference {} has {}",
            header,
            stated as char,
            mutation.position,
            reference.name(),
            ref_base as char
        )));
    }
    Ok(mutation)
}
