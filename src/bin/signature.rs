//! CLI binary for signature selection - lineage database in, signature files out

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vocest_rs::{
    background::{read_aligned_database, read_barcodes, read_lineage_map, BackgroundModel},
    extract::MutationExtractor,
    reference::ReferenceGenome,
    signature::{
        select_signature, validate_signature_config, write_signature, write_signature_json,
        LineageSignature,
    },
    tally::MalformedPolicy,
    utils::{get_num_cpus, sanitize_file_component, Timer},
    ExtractConfig, SignatureConfig,
};

#[derive(Parser)]
#[command(name = "signature")]
#[command(about = "Select lineage-defining mutation signatures from a sequence database")]
#[command(long_about = "
Builds per-lineage mutation presence tables from a database of lineage-labelled
genomes and selects, for each requested lineage, the mutations present in more
than --min-target of its sequences and in fewer than --max-background of all
other sequences.

The database is either a reference-length multiple alignment (--alignment)
with a name,lineage table (--lineages), or a barcode matrix (--barcodes) with
one row per lineage and one column per mutation.

One <lineage>.csv signature file is written per lineage into --outdir, with a
#lineage=<name>,created=<date> comment line followed by
type,position,alt,label,target,background rows.
")]
struct Args {
    /// Path to the reference genome FASTA
    #[arg(long, value_name = "FILE")]
    reference: PathBuf,

    /// Reference-length aligned FASTA of database genomes
    #[arg(long, value_name = "FILE", requires = "lineages", conflicts_with = "barcodes")]
    alignment: Option<PathBuf>,

    /// CSV mapping sequence names to lineages
    #[arg(long, value_name = "FILE")]
    lineages: Option<PathBuf>,

    /// Lineage barcode matrix CSV
    #[arg(long, value_name = "FILE")]
    barcodes: Option<PathBuf>,

    /// Lineage to build a signature for; repeat for several, omit for all
    #[arg(long = "lineage", value_name = "NAME")]
    targets: Vec<String>,

    /// Target presence must be strictly above this
    #[arg(long, default_value_t = 0.95)]
    min_target: f64,

    /// Background presence must be strictly below this
    #[arg(long, default_value_t = 0.05)]
    max_background: f64,

    /// Output directory for signature files
    #[arg(long, value_name = "DIR", default_value = ".")]
    outdir: PathBuf,

    /// Also write each signature as JSON
    #[arg(long)]
    json: bool,

    /// Fail when a requested lineage yields no defining mutations
    #[arg(long)]
    fail_on_empty: bool,

    /// Number of threads to use for parallel processing
    #[arg(long, default_value_t = get_num_cpus())]
    num_threads: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn build_model(args: &Args, reference: Arc<ReferenceGenome>) -> Result<BackgroundModel> {
    let genome_len = reference.len();

    let (model, skipped) = match (&args.alignment, &args.lineages, &args.barcodes) {
        (Some(alignment), Some(lineages), None) => {
            let lineage_map = read_lineage_map(lineages)
                .with_context(|| format!("reading lineage table {:?}", lineages))?;
            log::info!("Read {} lineage assignments", lineage_map.len());

            let extractor = MutationExtractor::new(reference, ExtractConfig::default());
            let records = read_aligned_database(alignment, &lineage_map, &extractor)
                .with_context(|| format!("reading aligned database {:?}", alignment))?;
            BackgroundModel::build(records, genome_len, MalformedPolicy::Skip)?
        }
        (None, _, Some(barcodes)) => {
            let records = read_barcodes(barcodes, &reference)
                .with_context(|| format!("reading barcode matrix {:?}", barcodes))?;
            BackgroundModel::from_records(&records, genome_len, MalformedPolicy::Skip)?
        }
        _ => bail!("provide either --alignment with --lineages, or --barcodes"),
    };

    if skipped > 0 {
        log::warn!("{} database sequences skipped as malformed", skipped);
    }
    Ok(model)
}

fn write_outputs(outdir: &Path, signature: &LineageSignature, json: bool) -> Result<()> {
    let stem = sanitize_file_component(&signature.lineage);
    let csv_path = outdir.join(format!("{}.csv", stem));
    write_signature(signature, &csv_path).with_context(|| format!("writing {:?}", csv_path))?;
    log::info!("Signature written to: {:?}", csv_path);

    if json {
        let json_path = outdir.join(format!("{}.json", stem));
        write_signature_json(signature, &json_path)
            .with_context(|| format!("writing {:?}", json_path))?;
    }
    Ok(())
}

fn run() -> Result<()> {
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

    let config = SignatureConfig {
        min_target: args.min_target,
        max_background: args.max_background,
    };
    validate_signature_config(&config)?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.num_threads)
        .build_global()
        .context("configuring thread pool")?;

    let reference = Arc::new(
        ReferenceGenome::from_fasta(&args.reference)
            .with_context(|| format!("reading reference {:?}", args.reference))?,
    );
    log::info!("Reference {} ({} bases)", reference.name(), reference.len());

    let model = {
        let _timer = Timer::new("Building background model");
        build_model(&args, reference)?
    };

    let targets: Vec<String> = if args.targets.is_empty() {
        model.lineage_names().map(str::to_string).collect()
    } else {
        args.targets.clone()
    };
    if let Some(missing) = targets.iter().find(|t| !model.contains(t)) {
        bail!("lineage {} has no sequences in the database", missing);
    }

    std::fs::create_dir_all(&args.outdir)
        .with_context(|| format!("creating output directory {:?}", args.outdir))?;

    let created = chrono::Local::now().date_naive();
    let mut written = 0;
    for lineage in &targets {
        let target = model
            .presence(lineage)
            .with_context(|| format!("no presence table for {}", lineage))?;
        let background = model.background_excluding(lineage)?;
        let signature = select_signature(lineage, &target, &background, &config, created);

        if signature.is_empty() {
            if args.fail_on_empty {
                bail!(
                    "no mutation in {} is above {} in the lineage and below {} elsewhere",
                    lineage,
                    config.min_target,
                    config.max_background
                );
            }
            log::warn!(
                "Lineage {} has no defining mutations ({} sequences), no signature written",
                lineage,
                model.sequences(lineage)
            );
            continue;
        }

        write_outputs(&args.outdir, &signature, args.json)?;
        written += 1;
    }

    log::info!("Wrote {} of {} signatures", written, targets.len());
    if written == 0 {
        bail!("no signatures could be built");
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_alignment_requires_lineages() {
        let result = Args::try_parse_from([
            "signature",
            "--reference",
            "ref.fa",
            "--alignment",
            "aligned.fa",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_model_from_barcodes() {
        let dir = tempfile::tempdir().unwrap();
        let barcodes = dir.path().join("barcodes.csv");
        std::fs::write(&barcodes, "lineage,A2T,C3G\nBA.1,1,0\nBA.2,1,1\n").unwrap();

        let args = Args::try_parse_from([
            "signature",
            "--reference",
            "ref.fa",
            "--barcodes",
            barcodes.to_str().unwrap(),
            "--lineage",
            "BA.2",
        ])
        .unwrap();
        assert_eq!(args.targets, vec!["BA.2"]);

        let reference = Arc::new(ReferenceGenome::new("ref", b"AACCGGTT").unwrap());
        let model = build_model(&args, reference).unwrap();
        assert!(model.contains("BA.1"));
        assert!(model.contains("BA.2"));

        let signature = select_signature(
            "BA.2",
            &model.presence("BA.2").unwrap(),
            &model.background_excluding("BA.2").unwrap(),
            &SignatureConfig::default(),
            chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        );
        assert_eq!(signature.len(), 1);
        assert_eq!(signature.entries[0].mutation.to_string(), "~3G");
    }
}
