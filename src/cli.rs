use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::cache::path::{cache_root, container_path};
use crate::cache::{CacheHeader, ContainerImage};
use crate::codec::{peek_name, peek_sections};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::index::{Entry, EntryIndex, EntryKind};
use crate::utils::logger;

#[derive(Parser, Debug)]
#[command(name = "codecache", version, about = "Code cache container tool")]
pub struct CodeCacheCli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl CodeCacheCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Prints the header and every entry of a container.
    Inspect {
        path: PathBuf,
        #[arg(long)]
        /// Emit JSON instead of a table.
        json: bool,
    },
    /// Checks the internal consistency of a container.
    Verify { path: PathBuf },
    /// Prints the configuration taken from the environment.
    Config {
        #[arg(long)]
        /// Also show the default container location for this application.
        app: Option<String>,
    },
}

pub fn run() -> Result<()> {
    let cli = CodeCacheCli::parse();
    logger::init_with_verbosity(cli.verbose);
    match &cli.command {
        Command::Inspect { path, json } => handle_inspect(path, *json),
        Command::Verify { path } => handle_verify(path),
        Command::Config { app } => handle_config(app.as_deref()),
    }
}

fn open(path: &Path) -> Result<ContainerImage> {
    ContainerImage::open_unchecked(path)
        .with_context(|| format!("failed to open container {}", path.display()))
}

#[derive(Debug, Serialize)]
struct EntryReport {
    kind: EntryKind,
    id: u32,
    name: Option<String>,
    comp_level: u8,
    comp_id: u32,
    decompile: u32,
    inlined_bytecodes: u32,
    flags: String,
    size: u32,
    code_size: u32,
}

impl EntryReport {
    fn new(image: &ContainerImage, entry: &Entry) -> Self {
        let name = image
            .payload(entry)
            .and_then(|payload| peek_name(payload, entry))
            .map(str::to_owned)
            .ok();
        Self {
            kind: entry.kind,
            id: entry.id,
            name,
            comp_level: entry.comp_level,
            comp_id: entry.comp_id,
            decompile: entry.decompile,
            inlined_bytecodes: entry.num_inlined_bytecodes,
            flags: format!("{:?}", entry.flags),
            size: entry.size,
            code_size: entry.code_size,
        }
    }
}

#[derive(Debug, Serialize)]
struct InspectReport {
    header: CacheHeader,
    created: Option<String>,
    strings: usize,
    entries: Vec<EntryReport>,
}

fn handle_inspect(path: &Path, json: bool) -> Result<()> {
    let image = open(path)?;
    let entries = image.entries()?;
    let report = InspectReport {
        header: *image.header(),
        created: image.header().created().map(|time| time.to_rfc3339()),
        strings: image.strings()?.len(),
        entries: entries
            .iter()
            .map(|entry| EntryReport::new(&image, entry))
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let header = &report.header;
    println!("{} {}", "container".bold(), path.display());
    println!("  version      {}", header.version);
    println!("  size         {} bytes", header.cache_size);
    println!(
        "  created      {}",
        report.created.as_deref().unwrap_or("unknown")
    );
    println!(
        "  entries      {} ({} stubs, {} blobs, {} adapters, {} methods)",
        header.entries.count,
        header.counts.stubs,
        header.counts.blobs,
        header.counts.adapters,
        header.counts.code
    );
    println!("  preload      {}", header.preload.count);
    println!("  strings      {}", report.strings);
    println!("  fingerprint  {:?}", header.fingerprint);
    println!();
    println!(
        "{}",
        format!(
            "{:>5}  {:<11} {:>10} {:>3} {:>4} {:>8} {:>8}  name",
            "#", "kind", "id", "lvl", "dec", "size", "code"
        )
        .dimmed()
    );
    for (index, entry) in report.entries.iter().enumerate() {
        println!(
            "{:>5}  {:<11} {:>10} {:>3} {:>4} {:>8} {:>8}  {}",
            index,
            entry.kind.name(),
            entry.id,
            entry.comp_level,
            entry.decompile,
            entry.size,
            entry.code_size,
            entry.name.as_deref().unwrap_or("<unreadable>")
        );
    }
    Ok(())
}

/// Structural problems in one entry.
fn verify_entry(image: &ContainerImage, entry: &Entry) -> Result<(), CacheError> {
    let payload = image.payload(entry)?;
    peek_name(payload, entry)?;
    peek_sections(payload, entry)?;
    Ok(())
}

fn handle_verify(path: &Path) -> Result<()> {
    let image = open(path)?;
    let entries = image.entries()?;
    image.strings()?;
    EntryIndex::from_loaded(entries.clone(), image.search_keys()?, image.preload_indices()?)
        .context("search or preload table is inconsistent")?;

    let pb = ProgressBar::new(entries.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("verifying [{elapsed_precise}] {wide_bar} {pos}/{len}")?
            .progress_chars("=> "),
    );
    let problems: Vec<(usize, CacheError)> = entries
        .par_iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let result = verify_entry(&image, entry);
            pb.inc(1);
            result.err().map(|err| (index, err))
        })
        .collect();
    pb.finish_and_clear();

    if problems.is_empty() {
        println!(
            "{} {} ({} entries)",
            "ok".green().bold(),
            path.display(),
            entries.len()
        );
        return Ok(());
    }
    for (index, err) in &problems {
        debug!(index, error = %err, "entry failed verification");
        println!("{} entry {index}: {err}", "error".red().bold());
    }
    bail!("{} of {} entries are damaged", problems.len(), entries.len())
}

#[derive(Debug, Serialize)]
struct ConfigReport {
    cache_root: Option<PathBuf>,
    default_container: Option<PathBuf>,
    config: CacheConfig,
}

fn handle_config(app: Option<&str>) -> Result<()> {
    let root = cache_root().ok();
    let default_container = root
        .as_deref()
        .zip(app)
        .map(|(root, app)| container_path(root, app));
    let report = ConfigReport {
        cache_root: root,
        default_container,
        config: CacheConfig::from_env(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
