use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::warn;

use heaplens::heap::Heap;
use heaplens::histo::Histo;
use heaplens::reader::{read_heap_dump, Options};
use heaplens::session::Session;

/// Offline analyzer for JVM HPROF heap dumps.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Heap dump file to read
    heap_file: PathBuf,

    /// Print a class histogram of the whole heap and exit
    #[arg(long)]
    histo: bool,

    /// Write a CPU profile to this file (accepted for compatibility;
    /// profiling is not built into this binary)
    #[arg(long, value_name = "PATH")]
    cpuprofile: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.cpuprofile.is_some() {
        warn!("cpu profiling is not supported in this build");
    }

    // the reference graph is only needed for interactive queries
    let options = Options {
        need_refs: !args.histo,
    };
    let heap = read_heap_dump(&args.heap_file, &options)
        .with_context(|| format!("reading {}", args.heap_file.display()))?;

    if args.histo {
        full_histogram(&heap)?;
    } else {
        Session::new(heap).interact()?;
    }
    Ok(())
}

/// `--histo`: one histogram of every object in the dump.
fn full_histogram(heap: &Heap) -> anyhow::Result<()> {
    let mut histo = Histo::new(heap);
    for oid in 1..=heap.max_oid() {
        histo.add(oid);
    }
    let mut stdout = std::io::stdout();
    histo.print(&mut stdout, None)?;
    Ok(())
}
