//! Read-only view of a formatted device: geometry, pools and slab
//! occupancy.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use penumbra::{ObjectStore, Result};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "penumbra-inspect",
    version,
    about = "Print the layout and pool state of a penumbra device"
)]
struct Cli {
    /// Data device to inspect.
    device: PathBuf,

    /// Separate metadata device, when formatted with one.
    #[arg(long)]
    md_device: Option<PathBuf>,
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {name:.<28} {value}");
}

fn inspect(cli: &Cli) -> Result<()> {
    let store = match &cli.md_device {
        Some(md) => ObjectStore::open_with_md(&cli.device, md)?,
        None => ObjectStore::open(&cli.device)?,
    };
    let geo = store.geometry();

    println!("device {}", cli.device.display());
    print_field("logical block", format!("{} B", geo.lb_nbytes));
    print_field("device blocks", geo.nlb);
    print_field("slab size", format!("{} blocks", geo.slab_nlb));
    print_field("slabs", geo.nslabs);
    print_field("free slabs", store.free_slab_count());
    print_field("pool entries", geo.npools);
    print_field("metadata blocks", geo.meta_nlb());

    let mut any = false;
    for (ndx, pool) in store.pools() {
        if !any {
            println!("pools:");
            any = true;
        }
        let root = match pool.root {
            Some(obj) => obj.to_string(),
            None => "unset".to_string(),
        };
        println!(
            "  [{ndx}] {:?}: obj {} blocks, {} objects/slab, root {root}",
            pool.name, pool.obj_nlb, pool.slab_nobj
        );
    }
    if !any {
        println!("no pools");
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = inspect(&cli) {
        eprintln!("penumbra-inspect: {e}");
        process::exit(1);
    }
}
