use anyhow::Result;
use bulkload::{Loader, LoaderOptions, PostingListWriter, RdfTransformer, SharedState};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bulk-load an RDF N-Triples/N-Quads dump into sorted posting lists.
#[derive(Parser, Debug)]
struct Args {
    /// RDF input file; `.gz` is decompressed on the fly
    #[arg(long)]
    rdf: PathBuf,
    /// Schema file
    #[arg(long)]
    schema: PathBuf,
    /// Output directory for postings.jsonl and schema.txt
    #[arg(long)]
    out: PathBuf,
    /// Root for the temporary run directory
    #[arg(long, default_value = "tmp")]
    tmp: PathBuf,
    /// Mapper pool size and reducer concurrency
    #[arg(long, default_value_t = num_cpus::get())]
    workers: usize,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let opts = LoaderOptions::new(&args.rdf, &args.schema, &args.out, &args.tmp, args.workers);
    let state = SharedState::new(opts)?;
    let transformer = RdfTransformer::new(state.uids.clone(), state.schema.clone())?;
    let aggregator = PostingListWriter::create(&args.out, state.schema.clone(), state.progress.clone())?;

    let mut loader = Loader::new(state, transformer, aggregator);
    loader.run()?;
    info!(uids = loader.state().uids.len(), out = %args.out.display(), "Done");
    Ok(())
}
