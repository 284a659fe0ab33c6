//! Thin CLI front-end over `vmdk-core`: convert a flat or sparse disk image
//! into a stream-optimized VMDK, or print a summary of one.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use vmdk_core::vmdk::descriptor::DescriptorConfig;
use vmdk_core::vmdk::flat::FlatBackend;
use vmdk_core::vmdk::sparse::{is_sparse_vmdk, SparseReader};
use vmdk_core::{copy, parallel};

#[derive(Parser)]
#[command(name = "vmdk-tool")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a disk image into a new stream-optimized VMDK extent.
    Convert {
        /// Path to the source image (flat or stream-optimized sparse).
        source: PathBuf,

        /// Path of the stream-optimized VMDK extent to create.
        destination: PathBuf,

        /// Read ahead with multiple threads. Only valid for a flat source.
        #[arg(long)]
        parallel: bool,
    },

    /// Print capacity and allocated-range usage for a disk image.
    Info {
        /// Path to the image (flat or stream-optimized sparse).
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            source,
            destination,
            parallel: use_parallel,
        } => convert(&source, &destination, use_parallel),
        Commands::Info { path } => show_info(&path),
    }
}

fn convert(source: &Path, destination: &Path, use_parallel: bool) -> Result<()> {
    let is_sparse =
        is_sparse_vmdk(source).with_context(|| format!("probing {}", source.display()))?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template is valid"),
    );
    progress.set_message(format!("copying {} -> {}", source.display(), destination.display()));
    progress.enable_steady_tick(std::time::Duration::from_millis(100));

    if is_sparse {
        if use_parallel {
            bail!("--parallel is only supported for flat sources");
        }
        let mut reader =
            SparseReader::open(source).with_context(|| format!("opening {}", source.display()))?;
        copy::copy_disk(&mut reader, destination, DescriptorConfig::default())
            .with_context(|| format!("copying into {}", destination.display()))?;
    } else {
        let backend =
            FlatBackend::open(source).with_context(|| format!("opening {}", source.display()))?;
        if use_parallel {
            let capacity_sectors =
                vmdk_core::vmdk::le::ceil_div(backend.capacity(), vmdk_core::vmdk::le::SECTOR_SIZE);
            let mut writer = vmdk_core::vmdk::stream::StreamWriter::create(
                destination,
                capacity_sectors,
                DescriptorConfig::default(),
            )
            .with_context(|| format!("creating {}", destination.display()))?;
            match parallel::parallel_copy_flat(&backend, &mut writer) {
                Ok(()) => writer.close().context("finalizing destination")?,
                Err(e) => {
                    let _ = writer.abort();
                    return Err(e).context("parallel copy failed");
                }
            }
        } else {
            let mut backend = backend;
            copy::copy_disk(&mut backend, destination, DescriptorConfig::default())
                .with_context(|| format!("copying into {}", destination.display()))?;
        }
    }

    progress.finish_with_message(format!("wrote {}", destination.display()));
    Ok(())
}

fn show_info(path: &Path) -> Result<()> {
    let is_sparse =
        is_sparse_vmdk(path).with_context(|| format!("probing {}", path.display()))?;

    if is_sparse {
        let mut reader =
            SparseReader::open(path).with_context(|| format!("opening {}", path.display()))?;
        let capacity = reader.capacity();
        let mut used = 0u64;
        let mut cursor = 0u64;
        while let Some((start, len)) = reader.next_data(cursor) {
            used += len;
            cursor = start + len;
        }
        println!("{}", path.display());
        println!("  kind:     stream-optimized sparse");
        println!("  capacity: {capacity} bytes");
        println!("  used:     {used} bytes");
    } else {
        let backend = FlatBackend::open(path).with_context(|| format!("opening {}", path.display()))?;
        let capacity = backend.capacity();
        let mut used = 0u64;
        let mut cursor = 0u64;
        while let Some((start, len)) = backend.next_data(cursor)? {
            used += len;
            cursor = start + len;
        }
        println!("{}", path.display());
        println!("  kind:     flat");
        println!("  capacity: {capacity} bytes");
        println!("  used:     {used} bytes");
    }

    Ok(())
}
