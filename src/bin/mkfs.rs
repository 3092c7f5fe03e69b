//! Format a device for penumbra.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use penumbra::{format, FormatParams};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "penumbra-mkfs",
    version,
    about = "Lay out penumbra pools and slabs on a block device"
)]
struct Cli {
    /// Data device or backing file to format.
    device: PathBuf,

    /// Place metadata on a separate device.
    #[arg(long)]
    md_device: Option<PathBuf>,

    /// Slab size, in logical blocks.
    #[arg(long)]
    slab_nlb: u32,

    /// Number of pools to reserve entries for (0 = one per slab).
    #[arg(long, default_value_t = 0)]
    npools: u32,

    /// Logical block size override for raw device nodes.
    #[arg(long)]
    block_size: Option<u32>,

    /// Print the resulting geometry.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let params = FormatParams {
        dev_path: cli.device.clone(),
        md_dev_path: cli.md_device.clone(),
        npools: cli.npools,
        slab_nlb: cli.slab_nlb,
        lb_nbytes: cli.block_size,
    };
    let geo = match format(&params) {
        Ok(geo) => geo,
        Err(e) => {
            eprintln!("penumbra-mkfs: {e}");
            process::exit(1);
        }
    };

    println!(
        "formatted {}: {} pools, {} slabs of {} blocks",
        cli.device.display(),
        geo.npools,
        geo.nslabs,
        geo.slab_nlb
    );
    if cli.verbose {
        println!("  logical block ..... {} B", geo.lb_nbytes);
        println!("  device blocks ..... {}", geo.nlb);
        println!("  super region ...... {} blocks", geo.md_nlb);
        println!(
            "  pool segment ...... {} blocks (freelist {}, index {}, entries {})",
            geo.pool_sgmt.nlb(),
            geo.pool_sgmt.freelist_nlb,
            geo.pool_sgmt.htbl_nlb,
            geo.pool_sgmt.entries_nlb
        );
        println!("  slab segment ...... {} blocks", geo.slab_sgmt_nlb);
        println!(
            "  slab data ......... {} blocks",
            u64::from(geo.nslabs) * u64::from(geo.slab_nlb)
        );
    }
}
