//! SAM/BAM reading and per-sample counting

use crate::{
    extract::{AlignedRead, MutationExtractor, ReadObservation},
    tally::{MalformedPolicy, Tally},
    utils::log_progress,
    VocResult,
};
use rayon::prelude::*;
use rust_htslib::bam::{self, Read, Record};
use std::collections::HashMap;
use std::path::Path;

/// Options for a counting pass over an alignment file
#[derive(Debug, Clone)]
pub struct BamCountOptions {
    /// Stop after this many primary mapped records
    pub limit: Option<usize>,
    pub policy: MalformedPolicy,
    /// Records extracted in parallel per batch
    pub batch_size: usize,
    /// htslib decompression threads
    pub threads: usize,
}

impl Default for BamCountOptions {
    fn default() -> Self {
        Self {
            limit: None,
            policy: MalformedPolicy::Skip,
            batch_size: 10_000,
            threads: 1,
        }
    }
}

/// What happened to the records of one alignment file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BamSummary {
    /// Primary mapped records read
    pub records: usize,
    /// Unmapped, secondary and supplementary records ignored
    pub filtered: usize,
    /// Mate pairs merged into one observation
    pub pairs: usize,
    /// Records skipped as malformed
    pub skipped: usize,
}

fn is_counted(record: &Record) -> bool {
    !(record.is_unmapped() || record.is_secondary() || record.is_supplementary())
}

fn expects_mate(record: &Record) -> bool {
    record.is_paired() && !record.is_mate_unmapped()
}

/// Holds first mates until their partner arrives
#[derive(Debug, Default)]
pub struct MatePairer {
    pending: HashMap<String, ReadObservation>,
    pairs: usize,
}

impl MatePairer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a mate. Returns the merged pair once both mates are seen.
    pub fn push(&mut self, obs: ReadObservation) -> Option<ReadObservation> {
        match self.pending.remove(&obs.name) {
            Some(first) => {
                self.pairs += 1;
                Some(first.merge_pair(obs))
            }
            None => {
                self.pending.insert(obs.name.clone(), obs);
                None
            }
        }
    }

    pub fn pairs(&self) -> usize {
        self.pairs
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Mates whose partner never arrived, counted as single reads
    pub fn into_unpaired(self) -> Vec<ReadObservation> {
        let mut unpaired: Vec<ReadObservation> = self.pending.into_values().collect();
        unpaired.sort_by(|a, b| a.name.cmp(&b.name));
        unpaired
    }
}

struct BatchCounter<'a> {
    extractor: &'a MutationExtractor,
    policy: MalformedPolicy,
    pairer: MatePairer,
    tally: Tally,
    skipped: usize,
}

impl BatchCounter<'_> {
    fn count(&mut self, batch: Vec<(VocResult<AlignedRead>, bool)>) -> VocResult<()> {
        let extractor = self.extractor;
        let extracted: Vec<(VocResult<ReadObservation>, bool)> = batch
            .into_par_iter()
            .map(|(read, paired)| (read.and_then(|r| extractor.extract(&r)), paired))
            .collect();

        let pairer = &mut self.pairer;
        let ready = extracted.into_iter().filter_map(|(obs, paired)| match obs {
            Ok(obs) if paired => pairer.push(obs).map(Ok),
            other => Some(other),
        });
        self.skipped += self.tally.observe_all(ready, self.policy)?;
        Ok(())
    }
}

/// Count coverage and mutations over every primary mapped record of a
/// SAM/BAM file. Mates sharing a query name are merged before counting.
pub fn count_bam<P: AsRef<Path>>(
    path: P,
    extractor: &MutationExtractor,
    options: &BamCountOptions,
) -> VocResult<(Tally, BamSummary)> {
    let path = path.as_ref();
    let mut reader = bam::Reader::from_path(path)?;
    if options.threads > 1 {
        reader.set_threads(options.threads)?;
    }

    let genome_len = extractor.reference().len();
    check_header(reader.header(), extractor);

    let mut counter = BatchCounter {
        extractor,
        policy: options.policy,
        pairer: MatePairer::new(),
        tally: Tally::new(genome_len),
        skipped: 0,
    };
    let mut summary = BamSummary::default();
    let batch_size = options.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);

    for result in reader.records() {
        let record = result?;
        if !is_counted(&record) {
            summary.filtered += 1;
            continue;
        }
        if options.limit.is_some_and(|limit| summary.records >= limit) {
            log::info!("Read limit of {} records reached", summary.records);
            break;
        }

        summary.records += 1;
        batch.push((AlignedRead::from_record(&record), expects_mate(&record)));

        if batch.len() >= batch_size {
            counter.count(std::mem::take(&mut batch))?;
            log_progress(summary.records, options.limit.unwrap_or(0), "alignment records");
        }
    }
    counter.count(batch)?;

    summary.pairs = counter.pairer.pairs();
    if counter.pairer.pending() > 0 {
        log::debug!(
            "{} mates without a partner, counted as single reads",
            counter.pairer.pending()
        );
    }
    let unpaired = counter.pairer.into_unpaired();
    counter.skipped += counter
        .tally
        .observe_all(unpaired.into_iter().map(Ok), options.policy)?;
    summary.skipped = counter.skipped;

    log::info!(
        "{}: {} records, {} pairs merged, {} filtered, {} skipped",
        path.display(),
        summary.records,
        summary.pairs,
        summary.filtered,
        summary.skipped
    );

    Ok((counter.tally, summary))
}

fn check_header(header: &bam::HeaderView, extractor: &MutationExtractor) {
    let reference = extractor.reference();
    if header.target_count() == 0 {
        log::warn!("Alignment header lists no reference sequences");
        return;
    }
    if header.target_count() > 1 {
        log::warn!(
            "Alignment header lists {} reference sequences, all records are counted against {}",
            header.target_count(),
            reference.name()
        );
    }
    if let Some(len) = header.target_len(0) {
        if len != reference.len() as u64 {
            log::warn!(
                "Alignment reference length {} differs from {} ({} bases)",
                len,
                reference.name(),
                reference.len()
            );
        }
    }
}
