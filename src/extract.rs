//! Mutation extraction from aligned reads and sequences

use crate::{
    reference::ReferenceGenome, tally::Observation, ExtractConfig, Mutation, Span, VocError,
    VocResult,
};
use rust_htslib::bam::record::{Cigar, Record};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a read shows at one step along the reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignedEvent {
    /// Base call aligned to the next reference position
    Base { base: u8, qual: Option<u8> },
    /// Next reference position is deleted in the read
    Gap,
    /// Bases present in the read but not in the reference; consumes no position
    Insertion(Vec<u8>),
    /// Next reference position is spanned but carries no information
    Skip,
}

impl AlignedEvent {
    fn consumes_reference(&self) -> bool {
        !matches!(self, AlignedEvent::Insertion(_))
    }
}

/// One read (or aligned sequence) as a walk along the reference from `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedRead {
    pub name: String,
    /// 1-based reference position of the first consuming event
    pub start: u64,
    pub events: Vec<AlignedEvent>,
}

impl AlignedRead {
    pub fn new(name: impl Into<String>, start: u64, events: Vec<AlignedEvent>) -> Self {
        Self {
            name: name.into(),
            start,
            events,
        }
    }

    /// Build from a CIGAR alignment starting at 0-based reference position `pos0`.
    ///
    /// Clipped and padded bases are dropped. An empty quality string, or one
    /// starting with 0xff as BAM stores missing qualities, means no qualities.
    pub fn from_cigar(
        name: impl Into<String>,
        pos0: i64,
        cigar: &[Cigar],
        seq: &[u8],
        qual: &[u8],
    ) -> VocResult<Self> {
        let name = name.into();
        if pos0 < 0 {
            return Err(VocError::InvalidRecord(format!(
                "Read {} has negative position {}",
                name, pos0
            )));
        }

        let has_qual = !qual.is_empty() && qual[0] != 0xff;
        let mut events = Vec::new();
        let mut qi = 0usize;

        let too_short = |name: &str| {
            VocError::InvalidRecord(format!("CIGAR of read {} is longer than its sequence", name))
        };

        for op in cigar {
            match *op {
                Cigar::Match(n) | Cigar::Equal(n) | Cigar::Diff(n) => {
                    let n = n as usize;
                    if qi + n > seq.len() {
                        return Err(too_short(&name));
                    }
                    for i in qi..qi + n {
                        let qual = if has_qual { qual.get(i).copied() } else { None };
                        events.push(AlignedEvent::Base { base: seq[i], qual });
                    }
                    qi += n;
                }
                Cigar::Ins(n) => {
                    let n = n as usize;
                    if qi + n > seq.len() {
                        return Err(too_short(&name));
                    }
                    events.push(AlignedEvent::Insertion(seq[qi..qi + n].to_vec()));
                    qi += n;
                }
                Cigar::Del(n) => events.extend((0..n).map(|_| AlignedEvent::Gap)),
                Cigar::RefSkip(n) => events.extend((0..n).map(|_| AlignedEvent::Skip)),
                Cigar::SoftClip(n) => qi += n as usize,
                Cigar::HardClip(_) | Cigar::Pad(_) => {}
            }
        }

        Ok(Self::new(name, pos0 as u64 + 1, events))
    }

    /// Build from an htslib alignment record
    pub fn from_record(record: &Record) -> VocResult<Self> {
        let name = String::from_utf8_lossy(record.qname()).into_owned();
        let cigar: Vec<Cigar> = record.cigar().iter().copied().collect();
        let seq = record.seq().as_bytes();
        Self::from_cigar(name, record.pos(), &cigar, &seq, record.qual())
    }

    /// Build from one row of a reference-length multiple alignment.
    ///
    /// Leading and trailing `-` are unaligned, internal `-` are deletions and
    /// anything other than A, C, G, T is missing data.
    pub fn from_aligned_sequence(name: impl Into<String>, seq: &[u8]) -> Self {
        let first = seq.iter().position(|&b| b != b'-');
        let last = seq.iter().rposition(|&b| b != b'-');

        let (start, events) = match (first, last) {
            (Some(first), Some(last)) => {
                let events = seq[first..=last]
                    .iter()
                    .map(|&b| match b.to_ascii_uppercase() {
                        b'-' => AlignedEvent::Gap,
                        base @ (b'A' | b'C' | b'G' | b'T') => {
                            AlignedEvent::Base { base, qual: None }
                        }
                        _ => AlignedEvent::Skip,
                    })
                    .collect();
                (first as u64 + 1, events)
            }
            _ => (1, Vec::new()),
        };

        Self::new(name, start, events)
    }

    /// Reference positions walked by the read, whether or not they are informative
    pub fn span(&self) -> Option<Span> {
        let consumed = self.events.iter().filter(|e| e.consumes_reference()).count() as u64;
        if consumed == 0 {
            return None;
        }
        let end = self.start + consumed - 1;
        Some(Span::new(self.start as u32, end.min(u32::MAX as u64) as u32))
    }
}

/// Mutations and covered positions observed in one read, read pair or sequence
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadObservation {
    pub name: String,
    pub mutations: BTreeSet<Mutation>,
    /// Sorted, non-overlapping, non-adjacent spans
    pub covered: Vec<Span>,
}

impl ReadObservation {
    pub fn covers(&self, pos: u32) -> bool {
        let idx = self.covered.partition_point(|s| s.end < pos);
        self.covered.get(idx).is_some_and(|s| s.contains(pos))
    }

    /// Combine the two mates of a read pair.
    ///
    /// Positions covered by both mates count once. Where both mates cover a
    /// mutation's position they must agree for it to be kept.
    pub fn merge_pair(self, mate: ReadObservation) -> ReadObservation {
        let mutations = self
            .mutations
            .union(&mate.mutations)
            .filter(|m| {
                if self.covers(m.position) && mate.covers(m.position) {
                    self.mutations.contains(*m) && mate.mutations.contains(*m)
                } else {
                    true
                }
            })
            .cloned()
            .collect();

        let mut spans = self.covered;
        spans.extend(mate.covered);

        ReadObservation {
            name: self.name,
            mutations,
            covered: union_spans(spans),
        }
    }
}

impl Observation for ReadObservation {
    fn id(&self) -> &str {
        &self.name
    }

    fn mutations(&self) -> &BTreeSet<Mutation> {
        &self.mutations
    }

    fn covered(&self) -> &[Span] {
        &self.covered
    }
}

/// Sort and merge overlapping or adjacent spans
pub fn union_spans(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort();
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Accumulates covered positions into spans while walking a read
#[derive(Default)]
struct SpanBuilder {
    spans: Vec<Span>,
}

impl SpanBuilder {
    fn push(&mut self, pos: u32) {
        match self.spans.last_mut() {
            Some(last) if last.end + 1 == pos => last.end = pos,
            _ => self.spans.push(Span::new(pos, pos)),
        }
    }
}

fn flush_deletion(deletion: &mut Option<(u32, u32)>, mutations: &mut BTreeSet<Mutation>) {
    if let Some((start, len)) = deletion.take() {
        mutations.insert(Mutation::deletion(start, len));
    }
}

fn is_nucleotide(base: u8) -> bool {
    matches!(base, b'A' | b'C' | b'G' | b'T')
}

/// Compares aligned reads against the reference
#[derive(Debug, Clone)]
pub struct MutationExtractor {
    reference: Arc<ReferenceGenome>,
    config: ExtractConfig,
}

impl MutationExtractor {
    pub fn new(reference: Arc<ReferenceGenome>, config: ExtractConfig) -> Self {
        Self { reference, config }
    }

    pub fn reference(&self) -> &ReferenceGenome {
        &self.reference
    }

    /// Extract the mutations and covered positions of one read
    pub fn extract(&self, read: &AlignedRead) -> VocResult<ReadObservation> {
        let genome_len = self.reference.len();
        let malformed = |position: u64| VocError::MalformedInput {
            record: read.name.clone(),
            position,
            genome_len,
        };

        let mut mutations = BTreeSet::new();
        let mut spans = SpanBuilder::default();
        let mut deletion: Option<(u32, u32)> = None;
        let mut pending_insertion: Option<Vec<u8>> = None;
        let mut pos = read.start;

        for event in &read.events {
            if let AlignedEvent::Insertion(bases) = event {
                flush_deletion(&mut deletion, &mut mutations);
                pending_insertion
                    .get_or_insert_with(Vec::new)
                    .extend(bases.iter().map(|b| b.to_ascii_uppercase()));
                continue;
            }

            if pos == 0 || pos > genome_len as u64 {
                return Err(malformed(pos));
            }
            let p = pos as u32;
            pos += 1;

            let covered = match event {
                AlignedEvent::Base { base, qual } => {
                    flush_deletion(&mut deletion, &mut mutations);
                    let base = base.to_ascii_uppercase();
                    let ref_base = self.reference.base(p).unwrap_or(b'N');

                    if !is_nucleotide(base) {
                        false
                    } else if base == ref_base {
                        true
                    } else if qual.map_or(true, |q| q >= self.config.min_quality) {
                        mutations.insert(Mutation::substitution(p, (base as char).to_string()));
                        true
                    } else {
                        false
                    }
                }
                AlignedEvent::Gap => {
                    deletion = match deletion {
                        Some((start, len)) => Some((start, len + 1)),
                        None => Some((p, 1)),
                    };
                    true
                }
                AlignedEvent::Skip => {
                    flush_deletion(&mut deletion, &mut mutations);
                    false
                }
                AlignedEvent::Insertion(_) => unreachable!("insertions handled above"),
            };

            if covered {
                spans.push(p);
                if let Some(bases) = pending_insertion.take() {
                    let alt = String::from_utf8_lossy(&bases).into_owned();
                    mutations.insert(Mutation::insertion(p, alt));
                }
            } else {
                pending_insertion = None;
            }
        }

        flush_deletion(&mut deletion, &mut mutations);
        if pending_insertion.is_some() {
            log::debug!("Dropping trailing insertion in read {}", read.name);
        }

        Ok(ReadObservation {
            name: read.name.clone(),
            mutations,
            covered: spans.spans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(seq: &[u8]) -> MutationExtractor {
        let reference = Arc::new(ReferenceGenome::new("ref", seq).unwrap());
        MutationExtractor::new(reference, ExtractConfig::default())
    }

    fn read(start: u64, cigar: &[Cigar], seq: &[u8]) -> AlignedRead {
        AlignedRead::from_cigar("r1", start as i64 - 1, cigar, seq, &[]).unwrap()
    }

    #[test]
    fn test_single_substitution() {
        let ext = extractor(b"ACGT");
        let obs = ext.extract(&read(1, &[Cigar::Match(4)], b"ACGA")).unwrap();

        let expected: BTreeSet<Mutation> = [Mutation::substitution(4, "A")].into_iter().collect();
        assert_eq!(obs.mutations, expected);
        assert_eq!(obs.covered, vec![Span::new(1, 4)]);
    }

    #[test]
    fn test_single_substitution_tallied() {
        use crate::tally::Tally;

        let ext = extractor(b"ACGT");
        let obs = ext.extract(&read(1, &[Cigar::Match(4)], b"ACGA")).unwrap();

        let mut tally = Tally::new(4);
        tally.observe(&obs).unwrap();
        assert_eq!(tally.coverage.as_slice(), &[1, 1, 1, 1]);
        assert_eq!(tally.counts.count(&Mutation::substitution(4, "A")), 1);
        assert_eq!(tally.counts.len(), 1);
        assert_eq!(tally.observations, 1);
    }

    #[test]
    fn test_perfect_match_has_no_mutations() {
        let ext = extractor(b"ACGTACGT");
        let obs = ext.extract(&read(3, &[Cigar::Equal(4)], b"GTAC")).unwrap();
        assert!(obs.mutations.is_empty());
        assert_eq!(obs.covered, vec![Span::new(3, 6)]);
    }

    #[test]
    fn test_deletion_run_is_one_mutation() {
        let ext = extractor(b"ACGTACGTAC");
        let cigar = [Cigar::Match(2), Cigar::Del(3), Cigar::Match(3)];
        let obs = ext.extract(&read(1, &cigar, b"ACCGT")).unwrap();

        let expected: BTreeSet<Mutation> = [Mutation::deletion(3, 3)].into_iter().collect();
        assert_eq!(obs.mutations, expected);
        // Deleted positions are covered by the read
        assert_eq!(obs.covered, vec![Span::new(1, 8)]);
    }

    #[test]
    fn test_insertion_anchored_on_following_base() {
        let ext = extractor(b"ACGTACGT");
        let cigar = [Cigar::Match(3), Cigar::Ins(2), Cigar::Match(3)];
        let obs = ext.extract(&read(1, &cigar, b"ACGttTAC")).unwrap();

        let expected: BTreeSet<Mutation> = [Mutation::insertion(4, "TT")].into_iter().collect();
        assert_eq!(obs.mutations, expected);
        assert_eq!(obs.covered, vec![Span::new(1, 6)]);
    }

    #[test]
    fn test_trailing_insertion_dropped() {
        let ext = extractor(b"ACGTACGT");
        let cigar = [Cigar::Match(4), Cigar::Ins(2)];
        let obs = ext.extract(&read(1, &cigar, b"ACGTGG")).unwrap();
        assert!(obs.mutations.is_empty());
    }

    #[test]
    fn test_soft_clip_contributes_nothing() {
        let ext = extractor(b"ACGTACGT");
        let cigar = [Cigar::SoftClip(3), Cigar::Match(4), Cigar::HardClip(5)];
        let obs = ext.extract(&read(2, &cigar, b"TTTCGTA")).unwrap();
        assert!(obs.mutations.is_empty());
        assert_eq!(obs.covered, vec![Span::new(2, 5)]);
    }

    #[test]
    fn test_ambiguous_and_low_quality_bases_are_missing() {
        let ext = extractor(b"ACGTACGT");
        // N at position 2, low-quality mismatch at position 4, good mismatch at 6
        let qual = [30, 30, 30, 5, 30, 30];
        let r = AlignedRead::from_cigar("r1", 0, &[Cigar::Match(6)], b"ANGAAG", &qual).unwrap();
        let obs = ext.extract(&r).unwrap();

        let expected: BTreeSet<Mutation> = [Mutation::substitution(6, "G")].into_iter().collect();
        assert_eq!(obs.mutations, expected);
        assert_eq!(
            obs.covered,
            vec![Span::new(1, 1), Span::new(3, 3), Span::new(5, 6)]
        );
    }

    #[test]
    fn test_missing_quality_marker() {
        let ext = extractor(b"ACGT");
        let r = AlignedRead::from_cigar("r1", 0, &[Cigar::Match(4)], b"ACGA", &[0xff; 4]).unwrap();
        let obs = ext.extract(&r).unwrap();
        assert!(obs.mutations.contains(&Mutation::substitution(4, "A")));
    }

    #[test]
    fn test_ref_skip_not_covered() {
        let ext = extractor(b"ACGTACGT");
        let cigar = [Cigar::Match(2), Cigar::RefSkip(3), Cigar::Match(2)];
        let obs = ext.extract(&read(1, &cigar, b"ACCG")).unwrap();
        assert!(obs.mutations.is_empty());
        assert_eq!(obs.covered, vec![Span::new(1, 2), Span::new(6, 7)]);
    }

    #[test]
    fn test_read_past_reference_end_is_malformed() {
        let ext = extractor(b"ACGT");
        let result = ext.extract(&read(3, &[Cigar::Match(4)], b"GTAA"));
        match result {
            Err(VocError::MalformedInput { position, genome_len, .. }) => {
                assert_eq!(position, 5);
                assert_eq!(genome_len, 4);
            }
            other => panic!("Expected MalformedInput, got {:?}", other),
        }
    }

    #[test]
    fn test_cigar_longer_than_sequence() {
        let result = AlignedRead::from_cigar("r1", 0, &[Cigar::Match(10)], b"ACGT", &[]);
        assert!(matches!(result, Err(VocError::InvalidRecord(_))));
    }

    #[test]
    fn test_aligned_sequence() {
        let ext = extractor(b"ACGTACGTAC");
        let r = AlignedRead::from_aligned_sequence("seq1", b"--GTTC--NC");
        assert_eq!(r.start, 3);
        assert_eq!(r.span(), Some(Span::new(3, 10)));

        let obs = ext.extract(&r).unwrap();
        let expected: BTreeSet<Mutation> =
            [Mutation::substitution(5, "T"), Mutation::deletion(7, 2)]
                .into_iter()
                .collect();
        assert_eq!(obs.mutations, expected);
        assert_eq!(obs.covered, vec![Span::new(3, 8), Span::new(10, 10)]);
    }

    #[test]
    fn test_all_gap_sequence() {
        let r = AlignedRead::from_aligned_sequence("empty", b"----");
        assert!(r.events.is_empty());
        assert_eq!(r.span(), None);
    }

    #[test]
    fn test_merge_pair_overlap_requires_agreement() {
        let m_both = Mutation::substitution(5, "T");
        let m_only_a = Mutation::substitution(6, "G");
        let m_outside = Mutation::substitution(2, "A");

        let a = ReadObservation {
            name: "pair".to_string(),
            mutations: [m_both.clone(), m_only_a.clone(), m_outside.clone()].into_iter().collect(),
            covered: vec![Span::new(1, 8)],
        };
        let b = ReadObservation {
            name: "pair".to_string(),
            mutations: [m_both.clone()].into_iter().collect(),
            covered: vec![Span::new(4, 12)],
        };

        let merged = a.merge_pair(b);
        let expected: BTreeSet<Mutation> = [m_both, m_outside].into_iter().collect();
        assert_eq!(merged.mutations, expected);
        assert_eq!(merged.covered, vec![Span::new(1, 12)]);
    }

    #[test]
    fn test_merge_pair_disjoint_keeps_all() {
        let a = ReadObservation {
            name: "pair".to_string(),
            mutations: [Mutation::substitution(2, "A")].into_iter().collect(),
            covered: vec![Span::new(1, 4)],
        };
        let b = ReadObservation {
            name: "pair".to_string(),
            mutations: [Mutation::substitution(9, "C")].into_iter().collect(),
            covered: vec![Span::new(8, 10)],
        };

        let merged = a.merge_pair(b);
        assert_eq!(merged.mutations.len(), 2);
        assert_eq!(merged.covered, vec![Span::new(1, 4), Span::new(8, 10)]);
        assert!(merged.covers(9));
        assert!(!merged.covers(6));
    }

    #[test]
    fn test_union_spans() {
        let spans = vec![Span::new(5, 9), Span::new(1, 3), Span::new(4, 4), Span::new(12, 15)];
        assert_eq!(union_spans(spans), vec![Span::new(1, 9), Span::new(12, 15)]);
    }
}
