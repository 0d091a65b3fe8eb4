fn main() {
    println!("vocest-rs - Variant of Concern signature and proportion estimation");
    println!();
    println!("🔬 RECOMMENDED: Use the combined tool for most workflows:");
    println!("  vocest     - Complete analysis: BAM + signatures → JSON reports + summary");
    println!();
    println!("📋 Tools for the individual stages:");
    println!("  signature  - Select lineage-defining mutations (alignment or barcodes → CSV)");
    println!("  mapped     - Count mutations and coverage (BAM → mapped/coverage CSV)");
    println!();
    println!("📖 For help with each tool:");
    println!("  cargo run -- --help                    # Combined tool");
    println!("  cargo run --bin signature -- --help    # Signature selection");
    println!("  cargo run --bin mapped -- --help       # Read counting only");
    println!();
    println!("🚀 Quick start example:");
    println!("  cargo run --bin signature -- --reference ref.fa --alignment gisaid.fa \\");
    println!("      --lineages lineages.csv --lineage BA.2.86 --outdir signatures");
    println!("  cargo run -- --reference ref.fa --input-bam sample.bam \\");
    println!("      --signature signatures/BA.2.86.csv --outdir results");
}
