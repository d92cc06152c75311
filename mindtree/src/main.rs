use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mindtree::core::DEFAULT_MAX_DEPTH;
use mindtree::document::topic_count;
use mindtree::pipeline;
use mindtree::storage::JsonWorkbookStore;
use mindtree::{DecodeOptions, Format};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mindtree",
    about = "Convert mind-map topic trees to and from indented text, JSON, XML and YAML",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    /// Deepest topic tree accepted when decoding.
    #[arg(long, global = true, env = "MINDTREE_MAX_DEPTH", default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract a document's topic tree into a text encoding.
    Parse(ParseArgs),

    /// Build a document from a text encoding of a topic tree.
    Generate(GenerateArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Mind-map document to read.
    document: PathBuf,
    /// Output encoding. Defaults to the output file's extension.
    #[arg(short, long, value_enum)]
    format: Option<FormatArg>,
    /// Write here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Multi-line, indented JSON and XML.
    #[arg(long)]
    pretty: bool,
    /// Overwrite the output file without asking.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Encoded topic tree to read.
    source: PathBuf,
    /// Mind-map document to write.
    #[arg(short, long)]
    output: PathBuf,
    /// Source encoding. Defaults to the source file's extension.
    #[arg(short, long, value_enum)]
    format: Option<FormatArg>,
    /// Overwrite the document without asking.
    #[arg(long)]
    force: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Json,
    Xml,
    Yaml,
    Text,
}

impl From<FormatArg> for Format {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => Format::Json,
            FormatArg::Xml => Format::Xml,
            FormatArg::Yaml => Format::Yaml,
            FormatArg::Text => Format::Text,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let options = DecodeOptions {
        max_depth: cli.max_depth,
    };
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Generate(args) => handle_generate(args, &options),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs {
        document,
        format,
        output,
        pretty,
        force,
    } = args;

    if !document.is_file() {
        anyhow::bail!("document {:?} does not exist", document);
    }
    let format = resolve_format(format, output.as_deref())?;
    debug!(%format, "parsing {:?}", document);

    let text = pipeline::extract_text(&JsonWorkbookStore, &document, format, pretty)
        .with_context(|| format!("extracting {:?}", document))?;

    match output {
        Some(path) => {
            if !confirm_overwrite(&path, force)? {
                eprintln!("Left {:?} untouched.", path);
                return Ok(());
            }
            fs::write(&path, text.as_bytes()).with_context(|| format!("writing {:?}", path))?;
            println!("Wrote {format} to {:?}", path);
        }
        None => {
            print!("{text}");
            if !text.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_generate(args: GenerateArgs, options: &DecodeOptions) -> Result<()> {
    let GenerateArgs {
        source,
        output,
        format,
        force,
    } = args;

    if !source.is_file() {
        anyhow::bail!("source {:?} does not exist", source);
    }
    let format = resolve_format(format, Some(&source))?;
    if !confirm_overwrite(&output, force)? {
        eprintln!("Left {:?} untouched.", output);
        return Ok(());
    }

    debug!(%format, "generating {:?} from {:?}", output, source);
    let text = fs::read_to_string(&source).with_context(|| format!("reading {:?}", source))?;
    let workbook = pipeline::construct(&JsonWorkbookStore, &text, format, options, &output)
        .with_context(|| format!("generating {:?} from {:?}", output, source))?;

    let topics = workbook
        .primary_sheet()
        .map(|sheet| topic_count(sheet.root_topic()))
        .unwrap_or(0);
    println!("Wrote {topics} topics to {:?}", output);
    Ok(())
}

/// An explicit `--format` wins; otherwise the file extension decides.
fn resolve_format(explicit: Option<FormatArg>, path: Option<&Path>) -> Result<Format> {
    if let Some(arg) = explicit {
        return Ok(arg.into());
    }
    match path {
        Some(path) => Format::from_path(path).with_context(|| {
            format!(
                "cannot tell the format of {:?} from its extension; pass --format",
                path
            )
        }),
        None => anyhow::bail!("--format is required when writing to stdout"),
    }
}

fn confirm_overwrite(path: &Path, force: bool) -> Result<bool> {
    if force || !path.exists() {
        return Ok(true);
    }
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut stderr = io::stderr();
    ask_overwrite(path, &mut input, &mut stderr)
}

fn ask_overwrite(path: &Path, input: &mut impl BufRead, prompt: &mut impl Write) -> Result<bool> {
    write!(prompt, "{:?} already exists. Overwrite? [y/N] ", path)?;
    prompt.flush()?;
    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("reading overwrite confirmation")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
