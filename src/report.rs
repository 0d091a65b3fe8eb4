//! Output artifacts: per-pair JSON reports, run summaries and mapped-read tables

use crate::{
    estimate::{MutationEvidence, PairOutcome, SampleEstimate, TestResult},
    tally::{CoverageVector, MutationCountTable, Tally},
    utils::{create_writer, open_reader, sanitize_file_component},
    Mutation, VocError, VocResult,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

pub type Metadata = BTreeMap<String, String>;

/// Estimate fields of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateSummary {
    pub est: f64,
    pub lower: f64,
    pub upper: f64,
    pub p_value: f64,
    pub decision: TestResult,
    pub null_value: f64,
    pub confidence_level: f64,
}

/// JSON artifact for one (sample, lineage) estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateReport {
    pub lineage: String,
    pub sample_id: String,
    pub created: DateTime<Local>,
    pub estimate: EstimateSummary,
    /// Counts of the signature's mutations in the sample
    pub mutations: Vec<MutationEvidence>,
    pub coverage: CoverageVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl EstimateReport {
    pub fn new(estimate: &SampleEstimate, tally: &Tally, metadata: Option<Metadata>) -> Self {
        Self {
            lineage: estimate.lineage.clone(),
            sample_id: estimate.sample_id.clone(),
            created: Local::now(),
            estimate: EstimateSummary {
                est: estimate.point_estimate,
                lower: estimate.ci_lower,
                upper: estimate.ci_upper,
                p_value: estimate.p_value,
                decision: estimate.test_result,
                null_value: estimate.null_value,
                confidence_level: estimate.confidence_level,
            },
            mutations: estimate.per_mutation_counts.clone(),
            coverage: tally.coverage.clone(),
            metadata,
        }
    }
}

/// `<outdir>/<sample>-<lineage>.json`
pub fn report_path<P: AsRef<Path>>(outdir: P, sample_id: &str, lineage: &str) -> PathBuf {
    outdir.as_ref().join(format!(
        "{}-{}.json",
        sanitize_file_component(sample_id),
        sanitize_file_component(lineage)
    ))
}

pub fn write_report<P: AsRef<Path>>(report: &EstimateReport, path: P) -> VocResult<()> {
    let mut writer = create_writer(path)?;
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

pub fn read_report<P: AsRef<Path>>(path: P) -> VocResult<EstimateReport> {
    let reader = open_reader(path)?;
    Ok(serde_json::from_reader(reader)?)
}

#[derive(Debug, Serialize, Deserialize)]
struct SummaryRow {
    sample_id: String,
    lineage: String,
    est: Option<f64>,
    lower: Option<f64>,
    upper: Option<f64>,
    p_value: Option<f64>,
    decision: Option<TestResult>,
    error: Option<String>,
}

/// Write one row per (sample, lineage) pair, failed pairs included
pub fn write_summary<P: AsRef<Path>>(outcomes: &[PairOutcome], path: P) -> VocResult<()> {
    let mut sorted: Vec<&PairOutcome> = outcomes.iter().collect();
    sorted.sort_by(|a, b| (&a.sample_id, &a.lineage).cmp(&(&b.sample_id, &b.lineage)));

    let mut writer = csv::Writer::from_writer(create_writer(path)?);
    for outcome in sorted {
        let row = match &outcome.result {
            Ok(est) => SummaryRow {
                sample_id: outcome.sample_id.clone(),
                lineage: outcome.lineage.clone(),
                est: Some(est.point_estimate),
                lower: Some(est.ci_lower),
                upper: Some(est.ci_upper),
                p_value: Some(est.p_value),
                decision: Some(est.test_result),
                error: None,
            },
            Err(e) => SummaryRow {
                sample_id: outcome.sample_id.clone(),
                lineage: outcome.lineage.clone(),
                est: None,
                lower: None,
                upper: None,
                p_value: None,
                decision: None,
                error: Some(e.to_string()),
            },
        };
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct MappedRow {
    position: u32,
    mutation: String,
    label: Option<String>,
    count: u32,
    coverage: u32,
    frequency: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CoverageRow {
    position: u32,
    coverage: u32,
}

/// `<outdir>/<prefix>.mapped.csv` and `<outdir>/<prefix>.coverage.csv`
pub fn mapped_paths<P: AsRef<Path>>(outdir: P, prefix: &str) -> (PathBuf, PathBuf) {
    let outdir = outdir.as_ref();
    (
        outdir.join(format!("{}.mapped.csv", prefix)),
        outdir.join(format!("{}.coverage.csv", prefix)),
    )
}

/// Write every observed mutation with its count, coverage and frequency
pub fn write_mapped_csv<P: AsRef<Path>>(tally: &Tally, path: P) -> VocResult<()> {
    let mut writer = csv::Writer::from_writer(create_writer(path)?);
    for (mutation, count) in tally.counts.iter() {
        writer.serialize(MappedRow {
            position: mutation.position,
            mutation: mutation.to_string(),
            label: mutation.label.clone(),
            count,
            coverage: tally.coverage_of(mutation),
            frequency: tally.frequency(mutation).ok(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_coverage_csv<P: AsRef<Path>>(coverage: &CoverageVector, path: P) -> VocResult<()> {
    let mut writer = csv::Writer::from_writer(create_writer(path)?);
    for (i, &depth) in coverage.as_slice().iter().enumerate() {
        writer.serialize(CoverageRow {
            position: i as u32 + 1,
            coverage: depth,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Rebuild a sample tally from its mapped and coverage tables.
///
/// A mutation counted more often than its position is covered is rejected.
pub fn read_mapped_tally<P: AsRef<Path>>(
    mapped: P,
    coverage: P,
    genome_len: u32,
) -> VocResult<Tally> {
    let mut depths = vec![0u32; genome_len as usize];
    let coverage_name = coverage.as_ref().to_string_lossy().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(open_reader(&coverage)?);
    for row in reader.deserialize::<CoverageRow>() {
        let row = row?;
        if row.position == 0 || row.position > genome_len {
            return Err(VocError::MalformedInput {
                record: coverage_name,
                position: row.position as u64,
                genome_len,
            });
        }
        depths[row.position as usize - 1] = row.coverage;
    }

    let mapped_name = mapped.as_ref().to_string_lossy().to_string();
    let mut counts = MutationCountTable::new();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(open_reader(&mapped)?);
    for row in reader.deserialize::<MappedRow>() {
        let row = row?;
        let mut mutation: Mutation = row.mutation.parse()?;
        if mutation.position != row.position {
            return Err(VocError::InvalidRecord(format!(
                "Mutation {} listed at position {} in {}",
                row.mutation, row.position, mapped_name
            )));
        }
        if mutation.position == 0 || mutation.position > genome_len {
            return Err(VocError::MalformedInput {
                record: mapped_name,
                position: mutation.position as u64,
                genome_len,
            });
        }
        let depth = depths[mutation.position as usize - 1];
        if row.count > depth || row.count > row.coverage {
            return Err(VocError::InvalidRecord(format!(
                "Mutation {} counted {} times but covered {} times ({} listed) in {}",
                row.mutation, row.count, depth, row.coverage, mapped_name
            )));
        }
        mutation.label = row.label.filter(|l| !l.is_empty());
        counts.add(mutation, row.count);
    }

    log::debug!(
        "Read {} mutations over {} positions from {}",
        counts.len(),
        genome_len,
        mapped_name
    );
    Ok(Tally::from_parts(CoverageVector::from_depths(depths), counts))
}

/// Read a sample metadata CSV keyed by its first column
pub fn read_metadata<P: AsRef<Path>>(path: P) -> VocResult<HashMap<String, Metadata>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(open_reader(&path)?);
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(VocError::InvalidRecord(format!(
            "Metadata file {} has no header",
            path.as_ref().display()
        )));
    }

    let mut metadata = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let Some(sample_id) = record.get(0) else {
            continue;
        };
        let fields: Metadata = headers
            .iter()
            .zip(record.iter())
            .skip(1)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        metadata.insert(sample_id.to_string(), fields);
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tally() -> Tally {
        let mut counts = MutationCountTable::new();
        counts.add(Mutation::substitution(2, "T").with_label("S:D614G"), 3);
        counts.add(Mutation::deletion(4, 2), 1);
        counts.add(Mutation::insertion(5, "AT"), 2);
        Tally::from_parts(CoverageVector::from_depths(vec![4, 4, 5, 5, 2, 0]), counts)
    }

    fn estimate(sample: &str, lineage: &str) -> SampleEstimate {
        SampleEstimate {
            lineage: lineage.to_string(),
            sample_id: sample.to_string(),
            point_estimate: 0.75,
            ci_lower: 0.3,
            ci_upper: 0.95,
            p_value: 0.001,
            null_value: 0.01,
            confidence_level: 0.95,
            test_result: TestResult::RejectNull,
            per_mutation_counts: vec![MutationEvidence {
                mutation: Mutation::substitution(2, "T"),
                count: 3,
                coverage: 4,
                weight: 1.0,
            }],
        }
    }

    #[test]
    fn test_mapped_tables_round_trip() {
        let dir = tempdir().unwrap();
        let (mapped, coverage) = mapped_paths(dir.path(), "sample1");
        let original = tally();

        write_mapped_csv(&original, &mapped).unwrap();
        write_coverage_csv(&original.coverage, &coverage).unwrap();

        let content = std::fs::read_to_string(&mapped).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "position,mutation,label,count,coverage,frequency");
        assert_eq!(lines[1], "2,~2T,S:D614G,3,4,0.75");
        assert_eq!(lines.len(), 4);

        let restored = read_mapped_tally(&mapped, &coverage, 6).unwrap();
        assert_eq!(restored, original);
        assert_eq!(
            restored.counts.iter().next().unwrap().0.label.as_deref(),
            Some("S:D614G")
        );
    }

    #[test]
    fn test_mapped_out_of_range() {
        let dir = tempdir().unwrap();
        let (mapped, coverage) = mapped_paths(dir.path(), "s");
        write_mapped_csv(&tally(), &mapped).unwrap();
        write_coverage_csv(&tally().coverage, &coverage).unwrap();

        let result = read_mapped_tally(&mapped, &coverage, 3);
        assert!(matches!(result, Err(VocError::MalformedInput { .. })));
    }

    #[test]
    fn test_mapped_count_above_coverage() {
        let dir = tempdir().unwrap();
        let (mapped, coverage) = mapped_paths(dir.path(), "s");
        write_coverage_csv(&tally().coverage, &coverage).unwrap();

        std::fs::write(
            &mapped,
            "position,mutation,label,count,coverage,frequency\n2,~2T,,50,10,5.0\n",
        )
        .unwrap();
        let result = read_mapped_tally(&mapped, &coverage, 6);
        assert!(matches!(result, Err(VocError::InvalidRecord(msg)) if msg.contains("~2T")));

        // Row agrees with itself but not with the coverage table
        std::fs::write(
            &mapped,
            "position,mutation,label,count,coverage,frequency\n2,~2T,,9,10,0.9\n",
        )
        .unwrap();
        let result = read_mapped_tally(&mapped, &coverage, 6);
        assert!(matches!(result, Err(VocError::InvalidRecord(_))));
    }

    #[test]
    fn test_report_json() {
        let dir = tempdir().unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("site".to_string(), "plant-a".to_string());

        let report = EstimateReport::new(&estimate("s/1", "BA.2.86"), &tally(), Some(metadata));
        let path = report_path(dir.path(), "s/1", "BA.2.86");
        assert!(path.ends_with("s_1-BA.2.86.json"));

        write_report(&report, &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["lineage"], "BA.2.86");
        assert_eq!(value["estimate"]["est"], 0.75);
        assert_eq!(value["estimate"]["decision"], "reject_null");
        assert_eq!(value["coverage"].as_array().unwrap().len(), 6);
        assert_eq!(value["metadata"]["site"], "plant-a");

        let restored = read_report(&path).unwrap();
        assert_eq!(restored.estimate, report.estimate);
    }

    #[test]
    fn test_summary_includes_failures() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let outcomes = vec![
            PairOutcome {
                sample_id: "s2".to_string(),
                lineage: "BA.1".to_string(),
                result: Err(VocError::UndefinedEstimate {
                    sample: "s2".to_string(),
                    lineage: "BA.1".to_string(),
                }),
            },
            PairOutcome {
                sample_id: "s1".to_string(),
                lineage: "BA.1".to_string(),
                result: Ok(estimate("s1", "BA.1")),
            },
        ];

        write_summary(&outcomes, &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "sample_id,lineage,est,lower,upper,p_value,decision,error");
        assert!(lines[1].starts_with("s1,BA.1,0.75,0.3,0.95,0.001,reject_null,"));
        assert!(lines[2].starts_with("s2,BA.1,,,,,,"));
        assert!(lines[2].contains("no coverage"));
    }

    #[test]
    fn test_read_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.csv");
        std::fs::write(&path, "sample,site,date\ns1,plant-a,2024-01-02\ns2,plant-b,2024-01-03\n")
            .unwrap();

        let metadata = read_metadata(&path).unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["s1"]["site"], "plant-a");
        assert_eq!(metadata["s2"]["date"], "2024-01-03");
        assert!(!metadata["s1"].contains_key("sample"));
    }
}
