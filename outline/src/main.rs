use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use outline::calendar::DateFormat;
use outline::convert::{ConvertOptions, convert_str};
use outline::dialect::SourceFormat;
use outline::summary::{mismatches, summarize_forest};
use outline::tif::TifFile;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "outline",
    about = "Convert Roam and Logseq exports into an intermediate node graph",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert one or more JSON exports.
    Convert(ConvertArgs),

    /// Recount converted files and compare against their stored summary.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Export files or directories containing .json exports.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Source format; overrides the options file.
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
    /// TOML options file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Spelling of calendar node names; overrides the options file.
    #[arg(long, value_enum)]
    calendar_format: Option<CalendarArg>,
    /// Write the result to this file instead of stdout.
    #[arg(long, conflicts_with = "out_dir")]
    output: Option<PathBuf>,
    /// Write `<stem>.tif.json` per input into this directory.
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Emit compact JSON.
    #[arg(long)]
    compact: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    /// Converted files or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Roam,
    Logseq,
}

impl From<FormatArg> for SourceFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Roam => SourceFormat::Roam,
            FormatArg::Logseq => SourceFormat::Logseq,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CalendarArg {
    MonthDayYear,
    Iso,
}

impl From<CalendarArg> for DateFormat {
    fn from(value: CalendarArg) -> Self {
        match value {
            CalendarArg::MonthDayYear => DateFormat::MonthDayYear,
            CalendarArg::Iso => DateFormat::Iso,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Convert(args) => handle_convert(args),
        Commands::Inspect(args) => handle_inspect(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_options(args: &ConvertArgs) -> Result<ConvertOptions> {
    let mut options = match &args.config {
        Some(path) => {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading options {:?}", path))?;
            ConvertOptions::from_toml_str(&text)
                .with_context(|| format!("parsing options {:?}", path))?
        }
        None => ConvertOptions::default(),
    };
    if let Some(format) = args.format {
        options.format = format.into();
    }
    if let Some(calendar) = args.calendar_format {
        options.calendar_format = calendar.into();
    }
    Ok(options)
}

fn handle_convert(args: ConvertArgs) -> Result<()> {
    let options = load_options(&args)?;
    let expanded = expand_inputs(&args.inputs, is_export)?;
    if expanded.is_empty() {
        anyhow::bail!("no .json exports found in the provided inputs");
    }
    if expanded.len() > 1 && args.out_dir.is_none() {
        anyhow::bail!("{} exports found; use --out-dir to convert more than one", expanded.len());
    }

    for path in &expanded {
        debug!(?path, format = ?options.format, "converting");
        let input = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let file = convert_str(&input, &options).with_context(|| format!("converting {:?}", path))?;
        let json = file.to_json(!args.compact)?;

        if let Some(dir) = &args.out_dir {
            fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
            let target = output_path_for(dir, path);
            fs::write(&target, json).with_context(|| format!("writing {:?}", target))?;
            info!(?target, nodes = file.summary.total_nodes, "wrote intermediate file");
        } else if let Some(target) = &args.output {
            fs::write(target, json).with_context(|| format!("writing {:?}", target))?;
            info!(?target, nodes = file.summary.total_nodes, "wrote intermediate file");
        } else {
            println!("{json}");
        }
    }
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let expanded = expand_inputs(&args.inputs, is_intermediate)?;
    if expanded.is_empty() {
        anyhow::bail!("no .tif.json files found in the provided inputs");
    }

    let mut inconsistent = 0;
    for path in &expanded {
        let input = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let file = TifFile::from_json(&input).with_context(|| format!("parsing {:?}", path))?;
        let counted = summarize_forest(&file.nodes);
        let stored = file.summary;
        println!(
            "{}: {} nodes, {} top-level, {} leaves, {} calendar, {} fields, {} broken refs",
            path.display(),
            counted.total_nodes,
            counted.top_level_nodes,
            counted.leaf_nodes,
            counted.calendar_nodes,
            counted.fields,
            stored.broken_refs,
        );
        let diffs = mismatches(&stored, &counted);
        for (field, expected, actual) in &diffs {
            println!("  {field}: summary says {expected}, tree has {actual}");
        }
        if !diffs.is_empty() {
            warn!(?path, "summary does not match the node tree");
            inconsistent += 1;
        }
    }

    if inconsistent > 0 {
        anyhow::bail!("{inconsistent} file(s) have summaries that disagree with their nodes");
    }
    Ok(())
}

fn is_intermediate(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".tif.json"))
}

fn is_export(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json") && !is_intermediate(path)
}

fn output_path_for(dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    dir.join(format!("{stem}.tif.json"))
}

fn expand_inputs(paths: &[PathBuf], accept: fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new(), accept)?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !accept(&canonical) {
                anyhow::bail!("{:?} is not a supported input file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(
    path: &Path,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
    accept: fn(&Path) -> bool,
) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited, accept)?;
        }
    } else if metadata.is_file() && accept(&canonical) {
        debug!(file = ?canonical, "found input");
        out.push(canonical);
    }
    Ok(())
}
