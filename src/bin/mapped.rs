//! CLI binary for read counting - alignments in, mapped and coverage tables out

use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use std::sync::Arc;
use vocest_rs::{
    bam::{count_bam, BamCountOptions},
    extract::MutationExtractor,
    reference::ReferenceGenome,
    report::{mapped_paths, write_coverage_csv, write_mapped_csv},
    tally::MalformedPolicy,
    utils::{get_num_cpus, validate_file_readable, Timer},
    ExtractConfig, VocError, VocResult,
};

#[derive(Parser)]
#[command(name = "mapped")]
#[command(about = "Count mutations and coverage from aligned reads")]
#[command(long_about = "
Reads a SAM or BAM file aligned against a single reference genome and counts,
for every reference position, how many reads cover it and, for every
substitution, insertion and deletion, how many reads carry it.

Mates sharing a query name are merged into one observation. Unmapped,
secondary and supplementary records are ignored. Mismatching bases below the
minimum quality are treated as missing data.

Two tables are written to the output directory:
- <prefix>.mapped.csv:   position,mutation,label,count,coverage,frequency
- <prefix>.coverage.csv: position,coverage

Both can be passed to `vocest --mapped/--coverage` to estimate lineage
proportions without re-reading the alignments.
")]
struct Args {
    /// Path to the reference genome FASTA
    #[arg(long, value_name = "FILE")]
    reference: PathBuf,

    /// Path to the input SAM/BAM file
    #[arg(long, value_name = "FILE")]
    input_bam: PathBuf,

    /// Output directory
    #[arg(long, value_name = "DIR", default_value = ".")]
    outdir: PathBuf,

    /// Output file prefix, defaults to the input file stem
    #[arg(long)]
    prefix: Option<String>,

    /// Minimum base quality for a mismatching base
    #[arg(long, default_value_t = 10)]
    min_quality: u8,

    /// Stop after this many alignment records
    #[arg(long)]
    limit: Option<usize>,

    /// Abort on reads outside the reference instead of skipping them
    #[arg(long)]
    strict: bool,

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

fn run() -> VocResult<()> {
    let args = Args::parse();

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

    validate_file_readable(&args.reference)?;
    validate_file_readable(&args.input_bam)?;

    let prefix = match &args.prefix {
        Some(prefix) => prefix.clone(),
        None => args
            .input_bam
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "sample".to_string()),
    };
    let (mapped_path, coverage_path) = mapped_paths(&args.outdir, &prefix);

    for path in [&mapped_path, &coverage_path] {
        if path.exists() && !args.force {
            return Err(VocError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("Output file {:?} already exists. Use --force to overwrite.", path),
            )));
        }
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.num_threads)
        .build_global()
        .map_err(|e| VocError::InvalidConfig(format!("Thread pool: {}", e)))?;

    log::info!("Reference: {:?}", args.reference);
    log::info!("Input alignments: {:?}", args.input_bam);
    log::info!("Number of threads: {}", args.num_threads);

    let reference = Arc::new(ReferenceGenome::from_fasta(&args.reference)?);
    let extractor = MutationExtractor::new(
        reference,
        ExtractConfig {
            min_quality: args.min_quality,
        },
    );

    let options = BamCountOptions {
        limit: args.limit,
        policy: if args.strict {
            MalformedPolicy::Abort
        } else {
            MalformedPolicy::Skip
        },
        threads: args.num_threads,
        ..BamCountOptions::default()
    };

    let (tally, summary) = {
        let _timer = Timer::new("Counting alignments");
        count_bam(&args.input_bam, &extractor, &options)?
    };

    if summary.records == 0 {
        log::warn!("No mapped reads found in {:?}", args.input_bam);
    }
    log::info!(
        "Counted {} observations with {} distinct mutations",
        tally.observations,
        tally.counts.len()
    );

    write_mapped_csv(&tally, &mapped_path)?;
    write_coverage_csv(&tally.coverage, &coverage_path)?;

    log::info!("Mapped table written to: {:?}", mapped_path);
    log::info!("Coverage table written to: {:?}", coverage_path);

    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: VocError) -> ! {
    match error {
        VocError::FileNotFound(path) => {
            eprintln!("Error: File not found: {}", path);
            eprintln!("Please check that the file exists and is readable.");
        }
        VocError::Htslib(ref e) => {
            eprintln!("Error: SAM/BAM processing error: {}", e);
            eprintln!("Please check that the alignment file is valid.");
        }
        VocError::Fastx(ref e) => {
            eprintln!("Error: Reference FASTA error: {}", e);
            eprintln!("Please check that the reference file is valid FASTA.");
        }
        VocError::MalformedInput {
            record,
            position,
            genome_len,
        } => {
            eprintln!(
                "Error: Read {} reaches position {} beyond the reference length {}",
                record, position, genome_len
            );
            eprintln!("Please check that the reads were aligned against the given reference.");
        }
        VocError::InvalidConfig(msg) => {
            eprintln!("Error: Invalid configuration: {}", msg);
        }
        VocError::Io(ref e) => {
            eprintln!("Error: I/O error: {}", e);
            eprintln!("Please check file permissions and disk space.");
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
