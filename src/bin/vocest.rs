//! Combined CLI binary for vocest - counts reads and estimates lineage proportions in one step

use clap::Parser;
use env_logger::Env;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vocest_rs::{
    bam::{count_bam, BamCountOptions},
    estimate::{estimate_batch, validate_estimator_config, SampleCounts, TestResult},
    extract::MutationExtractor,
    reference::ReferenceGenome,
    report::{
        mapped_paths, read_mapped_tally, read_metadata, report_path, write_coverage_csv,
        write_mapped_csv, write_report, write_summary, EstimateReport,
    },
    signature::read_signature,
    tally::MalformedPolicy,
    utils::{get_num_cpus, validate_file_readable, Timer},
    EstimatorConfig, ExtractConfig, VocError, VocResult,
};

#[derive(Parser)]
#[command(name = "vocest")]
#[command(about = "vocest - lineage proportion estimation from aligned reads")]
#[command(long_about = "
vocest estimates the proportion of a sample's reads that carry the defining
mutations of a lineage, with a confidence interval and a test of whether the
lineage is present above a null proportion.

This tool combines counting and estimation in a single step:
1. Counts coverage and mutations from each SAM/BAM file (or reads previously
   written mapped/coverage tables)
2. Fits one shared proportion per (sample, lineage) pair with a binomial GLM
   on the logit scale, weighting each defining mutation by its presence in the
   lineage
3. Writes one <sample>-<lineage>.json report per successful pair and a
   summary.csv with one row per pair, failures included

The presence test rejects the null hypothesis when the null proportion lies
outside the confidence interval.

Signature files are produced by the `signature` tool; mapped/coverage tables
by the `mapped` tool.
")]
struct Args {
    /// Path to the reference genome FASTA
    #[arg(long, value_name = "FILE")]
    reference: PathBuf,

    /// Input SAM/BAM file, one per sample; may be repeated
    #[arg(long, value_name = "FILE")]
    input_bam: Vec<PathBuf>,

    /// Mapped table written by `mapped`
    #[arg(long, value_name = "FILE", requires = "coverage")]
    mapped: Option<PathBuf>,

    /// Coverage table written by `mapped`
    #[arg(long, value_name = "FILE", requires = "mapped")]
    coverage: Option<PathBuf>,

    /// Lineage signature file; may be repeated
    #[arg(long, value_name = "FILE", required = true)]
    signature: Vec<PathBuf>,

    /// Sample identifier, only valid with a single input
    #[arg(long)]
    sample_id: Option<String>,

    /// Sample metadata CSV keyed by sample identifier in the first column
    #[arg(long, value_name = "FILE")]
    metadata: Option<PathBuf>,

    /// Output directory for reports and the run summary
    #[arg(long, value_name = "DIR")]
    outdir: PathBuf,

    /// Also write mapped/coverage tables for each alignment input
    #[arg(long)]
    write_mapped: bool,

    /// Proportion under the null hypothesis of lineage absence
    #[arg(long = "null", default_value_t = 0.01)]
    null_value: f64,

    /// Confidence level of the interval
    #[arg(long, default_value_t = 0.95)]
    confidence: f64,

    /// Minimum base quality for a mismatching base
    #[arg(long, default_value_t = 10)]
    min_quality: u8,

    /// Stop after this many alignment records per input
    #[arg(long)]
    limit: Option<usize>,

    /// Number of threads to use for parallel processing
    #[arg(long, default_value_t = get_num_cpus())]
    num_threads: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Force overwrite of output files if they exist
    #[arg(short, long)]
    force: bool,
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Sample identifiers in input order: alignments first, then the mapped table
fn sample_ids(args: &Args) -> VocResult<Vec<String>> {
    let inputs = args.input_bam.len() + usize::from(args.mapped.is_some());
    if inputs == 0 {
        return Err(VocError::InvalidConfig(
            "provide --input-bam or --mapped with --coverage".to_string(),
        ));
    }

    let ids: Vec<String> = match &args.sample_id {
        Some(id) if inputs == 1 => vec![id.clone()],
        Some(_) => {
            return Err(VocError::InvalidConfig(
                "--sample-id can only be used with a single input".to_string(),
            ))
        }
        None => args
            .input_bam
            .iter()
            .map(|p| file_stem(p))
            .chain(args.mapped.iter().map(|p| {
                file_stem(p)
                    .trim_end_matches(".mapped")
                    .to_string()
            }))
            .collect(),
    };

    let mut seen = HashSet::new();
    if let Some(duplicate) = ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(VocError::InvalidConfig(format!(
            "Duplicate sample identifier {}; use distinct file names",
            duplicate
        )));
    }
    Ok(ids)
}

fn run() -> VocResult<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    log::info!("Starting vocest combined analysis");
    log::info!("Reference: {:?}", args.reference);
    log::info!("Output directory: {:?}", args.outdir);
    log::info!("Number of threads: {}", args.num_threads);

    let config = EstimatorConfig {
        null_value: args.null_value,
        confidence_level: args.confidence,
        ..EstimatorConfig::default()
    };
    validate_estimator_config(&config)?;
    log::info!(
        "Configuration: null={}, confidence={}",
        config.null_value,
        config.confidence_level
    );

    validate_file_readable(&args.reference)?;
    for path in args.input_bam.iter().chain(&args.signature) {
        validate_file_readable(path)?;
    }
    let ids = sample_ids(&args)?;

    let summary_path = args.outdir.join("summary.csv");
    if summary_path.exists() && !args.force {
        return Err(VocError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("Output file {:?} already exists. Use --force to overwrite.", summary_path),
        )));
    }
    std::fs::create_dir_all(&args.outdir)?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.num_threads)
        .build_global()
        .map_err(|e| VocError::InvalidConfig(format!("Thread pool: {}", e)))?;

    let reference = Arc::new(ReferenceGenome::from_fasta(&args.reference)?);
    let genome_len = reference.len();

    // Step 1: Read signatures
    let signatures = args
        .signature
        .iter()
        .map(read_signature)
        .collect::<VocResult<Vec<_>>>()?;
    for signature in &signatures {
        if signature.is_empty() {
            log::warn!("Signature for {} has no defining mutations", signature.lineage);
        } else {
            log::info!(
                "Signature {} ({}): {} mutations",
                signature.lineage,
                signature.created,
                signature.len()
            );
        }
    }

    // Step 2: Count each sample
    let mut samples = Vec::with_capacity(ids.len());
    let mut ids = ids.into_iter();

    let extractor = MutationExtractor::new(
        reference,
        ExtractConfig {
            min_quality: args.min_quality,
        },
    );
    let options = BamCountOptions {
        limit: args.limit,
        policy: MalformedPolicy::Skip,
        threads: args.num_threads,
        ..BamCountOptions::default()
    };
    for (bam_path, sample_id) in args.input_bam.iter().zip(ids.by_ref()) {
        let _timer = Timer::new(&format!("Counting {}", sample_id));
        let (tally, summary) = count_bam(bam_path, &extractor, &options)?;
        if summary.records == 0 {
            log::warn!("No mapped reads found for sample {}", sample_id);
        }

        if args.write_mapped {
            let (mapped, coverage) = mapped_paths(&args.outdir, &sample_id);
            write_mapped_csv(&tally, &mapped)?;
            write_coverage_csv(&tally.coverage, &coverage)?;
        }
        samples.push(SampleCounts::new(sample_id, tally));
    }

    if let (Some(mapped), Some(coverage), Some(sample_id)) =
        (&args.mapped, &args.coverage, ids.next())
    {
        let tally = read_mapped_tally(mapped, coverage, genome_len)?;
        log::info!("Read {} mutations for sample {}", tally.counts.len(), sample_id);
        samples.push(SampleCounts::new(sample_id, tally));
    }

    let metadata = match &args.metadata {
        Some(path) => read_metadata(path)?,
        None => Default::default(),
    };

    // Step 3: Estimate every (sample, lineage) pair
    let outcomes = {
        let _timer = Timer::new("Estimating lineage proportions");
        estimate_batch(&samples, &signatures, &config)
    };

    // Step 4: Write reports
    let mut detected = 0;
    let mut failed = 0;
    for outcome in &outcomes {
        let Ok(estimate) = &outcome.result else {
            failed += 1;
            continue;
        };
        if estimate.test_result == TestResult::RejectNull {
            detected += 1;
        }

        let tally = samples
            .iter()
            .find(|s| s.sample_id == outcome.sample_id)
            .map(|s| &s.tally)
            .ok_or_else(|| {
                VocError::InvalidRecord(format!("Unknown sample {}", outcome.sample_id))
            })?;
        let sample_metadata = metadata.get(&outcome.sample_id).cloned();
        let report = EstimateReport::new(estimate, tally, sample_metadata);
        let path = report_path(&args.outdir, &outcome.sample_id, &outcome.lineage);
        write_report(&report, &path)?;
        log::debug!("Report written to: {:?}", path);
    }
    write_summary(&outcomes, &summary_path)?;

    log::info!("Estimation summary:");
    log::info!("  Pairs: {}", outcomes.len());
    log::info!("  Lineage detected: {}", detected);
    log::info!("  Not detected: {}", outcomes.len() - detected - failed);
    log::info!("  Failed: {}", failed);
    log::info!("Run summary written to: {:?}", summary_path);

    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: VocError) -> ! {
    match error {
        VocError::FileNotFound(path) => {
            eprintln!("Error: File not found: {}", path);
            eprintln!("Please check that the file exists and is readable.");
        }
        VocError::InvalidRecord(msg) => {
            eprintln!("Error: Invalid input data: {}", msg);
            eprintln!("Please check that your signature and table files are properly formatted.");
        }
        VocError::InvalidConfig(msg) => {
            eprintln!("Error: Invalid configuration: {}", msg);
            eprintln!("Please check the null value, confidence level and inputs.");
        }
        VocError::Htslib(ref e) => {
            eprintln!("Error: SAM/BAM processing error: {}", e);
            eprintln!("Please check that your alignment file is valid.");
        }
        VocError::Fastx(ref e) => {
            eprintln!("Error: Reference FASTA error: {}", e);
            eprintln!("Please check that the reference file is valid FASTA.");
        }
        VocError::Io(ref e) => {
            eprintln!("Error: I/O error: {}", e);
            eprintln!("Please check file permissions and disk space.");
        }
        VocError::Csv(ref e) => {
            eprintln!("Error: CSV error: {}", e);
            eprintln!(
                "Please check the column layout of your signature, mapped and metadata files."
            );
        }
        other => {
            eprintln!("Error: {}", other);
        }
    }
    std::process::exit(1);
}

fn main() {
    if let Err(e) = run() {
        handle_error(e);
    }
}
