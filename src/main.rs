use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;

use natspy::core::demangle;
use natspy::core::ptime::ProfMethod;
use natspy::core::symbols::AddressIndex;
use natspy::core::types::Pid;
use natspy::sampler::{self, Config, DEFAULT_FREQUENCY};
use natspy::ui::visualize;

#[derive(Debug, Parser)]
#[command(
    name = "natspy",
    version,
    about = "Sampling profiler for native Linux processes"
)]
struct Args {
    /// Profile frequency in Hz
    #[arg(short = 'f', long, value_name = "FREQ", default_value_t = DEFAULT_FREQUENCY,
          value_parser = clap::value_parser!(u32).range(1..=10_000))]
    freq: u32,

    /// Visualize only nodes costing at least this percentage of the session
    #[arg(short = 't', long, value_name = "N", default_value_t = 5.0)]
    threshold: f64,

    /// Show at most N levels of the call tree
    #[arg(short = 'm', long, value_name = "N")]
    max_depth: Option<usize>,

    /// Profile elapsed wall-clock time instead of CPU time
    #[arg(short = 'r', long)]
    realtime: bool,

    /// Save a Callgrind dump to FILE on exit
    #[arg(short = 'd', long, value_name = "FILE")]
    dump: Option<PathBuf>,

    /// Print the full stack instead of collapsing the start-up chain
    #[arg(long)]
    full_stack: bool,

    /// Print the resolved function table and exit
    #[arg(long)]
    print_symbols: bool,

    /// Process ID to profile
    #[arg(value_parser = clap::value_parser!(i32).range(1..))]
    pid: i32,
}

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit(0),
                _ => exit(64),
            }
        }
    };

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        for cause in e.chain().skip(1) {
            eprintln!("- {}", cause);
        }
        exit(2);
    }
}

fn run(args: Args) -> Result<()> {
    let pid = Pid::from_raw(args.pid);

    natspy::status!("Reading symbols of process {}", pid);
    let index = AddressIndex::load(pid, demangle::auto)?;
    natspy::status!("{} functions indexed", index.len());

    if args.print_symbols {
        index.print(&mut std::io::stdout())?;
        return Ok(());
    }

    let method = if args.realtime {
        ProfMethod::RealTime
    } else {
        ProfMethod::CpuTime
    };

    let config = Config {
        pid,
        frequency: args.freq,
        method,
        dump_path: args.dump,
        view: visualize::Options {
            threshold: args.threshold,
            max_depth: args.max_depth,
            full_stack: args.full_stack,
            name_width: None,
        },
    };
    sampler::run(config, index)
}
