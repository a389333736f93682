//! CLI Entry Point for specwriter
//!
//! Converts a recorded document stream into a SPEC data file.
//!
//! The input is JSON Lines, one `["kind", {document}]` pair per line, as
//! produced by serializing run engine callbacks in order.
//!
//! # Usage
//!
//! ```bash
//! specwriter convert run.jsonl --output scan.spec
//! specwriter convert run.jsonl --output scan.spec --config config/specwriter.toml --log-format json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use specwriter::tracing_config::{self, OutputFormat, TracingConfig};
use specwriter::{SpecWriter, SpecWriterConfig};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "specwriter")]
#[command(about = "Write SPEC data files from run documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a JSON Lines document stream into a SPEC file
    Convert {
        /// Path to the .jsonl document stream
        input: PathBuf,

        /// SPEC file to create (truncated if it exists)
        #[arg(long, short)]
        output: PathBuf,

        /// Optional configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overrides the configured log level
        #[arg(long)]
        log_level: Option<String>,

        /// Log output format: pretty, compact, json
        #[arg(long, default_value = "compact")]
        log_format: OutputFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            output,
            config,
            log_level,
            log_format,
        } => {
            let mut config = match config {
                Some(path) => SpecWriterConfig::load_from(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => SpecWriterConfig::from_env()?,
            };
            if let Some(level) = log_level {
                config.log_level = level;
            }
            config.validate()?;

            let tracing = TracingConfig::from_writer_config(&config)
                .map_err(anyhow::Error::msg)?
                .with_format(log_format);
            tracing_config::init(tracing).map_err(anyhow::Error::msg)?;

            convert(input, output, config)
        }
    }
}

fn convert(input: PathBuf, output: PathBuf, config: SpecWriterConfig) -> Result<()> {
    let reader = BufReader::new(
        File::open(&input).with_context(|| format!("opening {}", input.display()))?,
    );

    let mut writer = SpecWriter::new(config);
    writer.newfile(&output)?;

    let mut documents = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let (kind, body) = parse_line(&line)
            .with_context(|| format!("{}:{}", input.display(), index + 1))?;
        writer.receiver(&kind, body)?;
        documents += 1;
    }
    writer.close()?;

    let diagnostics = writer.diagnostics().len();
    tracing::info!(
        documents,
        diagnostics,
        scans = writer.last_scan_number(),
        output = %output.display(),
        "Conversion finished"
    );
    if diagnostics > 0 {
        eprintln!("{diagnostics} document(s) were skipped or adjusted; see warnings above");
    }
    Ok(())
}

fn parse_line(line: &str) -> Result<(String, Value)> {
    let value: Value = serde_json::from_str(line)?;
    match value {
        Value::Array(mut pair) if pair.len() == 2 => {
            let body = pair.pop().unwrap_or(Value::Null);
            match pair.pop() {
                Some(Value::String(kind)) => Ok((kind, body)),
                _ => bail!("document kind must be a string"),
            }
        }
        _ => bail!("expected a [\"kind\", {{document}}] pair"),
    }
}
