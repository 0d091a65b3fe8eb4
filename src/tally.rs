//! Coverage and mutation counting over reads or whole sequences

use crate::{utils::chunk_work, Mutation, Span, VocError, VocResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A unit of observation that can be counted: a read, a read pair or a
/// database sequence.
pub trait Observation {
    fn id(&self) -> &str;
    fn mutations(&self) -> &BTreeSet<Mutation>;
    fn covered(&self) -> &[Span];
}

/// What to do with a record that references positions outside the genome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    Skip,
    Abort,
}

/// Number of observations covering each reference position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageVector(Vec<u32>);

impl CoverageVector {
    pub fn new(genome_len: u32) -> Self {
        Self(vec![0; genome_len as usize])
    }

    pub fn from_depths(depths: Vec<u32>) -> Self {
        Self(depths)
    }

    pub fn genome_len(&self) -> u32 {
        self.0.len() as u32
    }

    /// Depth at a 1-based position, zero outside the genome
    pub fn depth(&self, pos: u32) -> u32 {
        if pos == 0 {
            return 0;
        }
        self.0.get(pos as usize - 1).copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    fn add_span(&mut self, span: &Span) {
        for depth in &mut self.0[span.start as usize - 1..span.end as usize] {
            *depth += 1;
        }
    }

    fn merge(&mut self, other: &CoverageVector) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a += b;
        }
    }
}

/// Occurrence count per distinct mutation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationCountTable(BTreeMap<Mutation, u32>);

impl MutationCountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, mutation: &Mutation) -> u32 {
        self.0.get(mutation).copied().unwrap_or(0)
    }

    pub fn add(&mut self, mutation: Mutation, count: u32) {
        *self.0.entry(mutation).or_insert(0) += count;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Mutation, u32)> {
        self.0.iter().map(|(m, &c)| (m, c))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.0.values().map(|&c| c as u64).sum()
    }

    fn merge(&mut self, other: &MutationCountTable) {
        for (m, &c) in &other.0 {
            self.add(m.clone(), c);
        }
    }
}

/// Coverage and mutation counts accumulated over a set of observations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub coverage: CoverageVector,
    pub counts: MutationCountTable,
    pub observations: u64,
}

impl Tally {
    pub fn new(genome_len: u32) -> Self {
        Self {
            coverage: CoverageVector::new(genome_len),
            counts: MutationCountTable::new(),
            observations: 0,
        }
    }

    pub fn from_parts(coverage: CoverageVector, counts: MutationCountTable) -> Self {
        Self {
            coverage,
            counts,
            observations: 0,
        }
    }

    pub fn genome_len(&self) -> u32 {
        self.coverage.genome_len()
    }

    /// Count one observation. Nothing is counted if any of its positions lie
    /// outside the genome.
    pub fn observe<O: Observation>(&mut self, obs: &O) -> VocResult<()> {
        self.validate(obs)?;

        for span in obs.covered() {
            self.coverage.add_span(span);
        }
        for m in obs.mutations() {
            self.counts.add(m.clone(), 1);
        }
        self.observations += 1;
        Ok(())
    }

    fn validate<O: Observation>(&self, obs: &O) -> VocResult<()> {
        let genome_len = self.genome_len();
        let malformed = |position: u32| VocError::MalformedInput {
            record: obs.id().to_string(),
            position: position as u64,
            genome_len,
        };

        for span in obs.covered() {
            if span.start == 0 || span.start > span.end {
                return Err(malformed(span.start));
            }
            if span.end > genome_len {
                return Err(malformed(span.end));
            }
        }
        for m in obs.mutations() {
            if m.position == 0 || m.position > genome_len {
                return Err(malformed(m.position));
            }
        }
        Ok(())
    }

    /// Count a stream of observations, returning how many were skipped
    pub fn observe_all<O, I>(
        &mut self,
        observations: I,
        policy: MalformedPolicy,
    ) -> VocResult<usize>
    where
        O: Observation,
        I: IntoIterator<Item = VocResult<O>>,
    {
        let mut skipped = 0;
        for obs in observations {
            let result = obs.and_then(|obs| self.observe(&obs));
            match result {
                Ok(()) => {}
                Err(e @ VocError::MalformedInput { .. }) if policy == MalformedPolicy::Skip => {
                    log::warn!("Skipping record: {}", e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(skipped)
    }

    /// Add another tally over the same genome, key by key
    pub fn merge(&mut self, other: &Tally) -> VocResult<()> {
        if other.genome_len() != self.genome_len() {
            return Err(VocError::InvalidRecord(format!(
                "Cannot merge tallies over genomes of length {} and {}",
                self.genome_len(),
                other.genome_len()
            )));
        }
        self.coverage.merge(&other.coverage);
        self.counts.merge(&other.counts);
        self.observations += other.observations;
        Ok(())
    }

    /// Coverage at the position a mutation is counted against
    pub fn coverage_of(&self, mutation: &Mutation) -> u32 {
        self.coverage.depth(mutation.position)
    }

    /// Fraction of covering observations that carry the mutation
    pub fn frequency(&self, mutation: &Mutation) -> VocResult<f64> {
        let coverage = self.coverage_of(mutation);
        if coverage == 0 {
            return Err(VocError::UndefinedFrequency(mutation.to_string()));
        }
        Ok(self.counts.count(mutation) as f64 / coverage as f64)
    }
}

/// Count observations in parallel partitions and merge the partial tallies.
///
/// The result equals a sequential fold over the same observations.
pub fn tally_parallel<O>(
    observations: &[O],
    genome_len: u32,
    num_chunks: usize,
    policy: MalformedPolicy,
) -> VocResult<(Tally, usize)>
where
    O: Observation + Sync,
{
    let chunks = chunk_work(observations, num_chunks);

    let partials: Vec<(Tally, usize)> = chunks
        .into_par_iter()
        .map(|chunk| -> VocResult<(Tally, usize)> {
            let mut tally = Tally::new(genome_len);
            let skipped = tally.observe_all(chunk.iter().map(Ok), policy)?;
            Ok((tally, skipped))
        })
        .collect::<VocResult<_>>()?;

    let mut total = Tally::new(genome_len);
    let mut skipped = 0;
    for (partial, n) in &partials {
        total.merge(partial)?;
        skipped += n;
    }
    Ok((total, skipped))
}

impl<O: Observation> Observation for &O {
    fn id(&self) -> &str {
        (*self).id()
    }

    fn mutations(&self) -> &BTreeSet<Mutation> {
        (*self).mutations()
    }

    fn covered(&self) -> &[Span] {
        (*self).covered()
    }
}
