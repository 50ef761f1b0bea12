//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use clonifier::config::BackendKind;
use clonifier::model::{PcrSettings, Primer};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

/// Load, convert and simulate PCR on DNA sequences through an isolated worker.
#[derive(Parser, Debug)]
#[command(name = "clonifier")]
#[command(author, version = clonifier::version::clap_version(), long_version = clonifier::version::long_version())]
#[command(about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Where the worker runs (default: process).
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// Fail instead of falling back to the thread backend when the worker
    /// cannot start.
    #[arg(long, global = true)]
    pub no_fallback: bool,

    /// Serve the worker protocol on stdin/stdout.
    #[arg(long, hide = true)]
    pub internal_worker: bool,

    /// Level of the log events a worker forwards.
    #[arg(long, env = "CLONIFIER_WORKER_LOG", default_value_t = LevelFilter::INFO, hide = true)]
    pub worker_log: LevelFilter,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a FASTA or binary sequence file and show its sequences.
    Parse(ParseArgs),

    /// Convert a sequence file to the binary format.
    Convert(ConvertArgs),

    /// Simulate PCR with a set of primers.
    Pcr(PcrArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "clonifier",
            &mut std::io::stdout(),
        );
    }
}

#[derive(Parser, Debug)]
pub struct ParseArgs {
    /// FASTA file, or a file written by `convert`.
    pub file: PathBuf,

    /// Print metadata as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ConvertArgs {
    /// Sequence file to read. Only its first sequence is converted.
    pub input: PathBuf,

    /// Where to write the binary sequence.
    pub output: PathBuf,
}

#[derive(Parser, Debug)]
pub struct PcrArgs {
    /// Template sequence file; its first sequence is used.
    pub file: PathBuf,

    /// Primer as NAME=SEQUENCE. Repeat for every primer.
    #[arg(short, long = "primer", value_parser = parse_primer, required = true)]
    pub primers: Vec<Primer>,

    /// Bases at the 3' end that must match exactly.
    #[arg(long, default_value_t = PcrSettings::default().min_fp)]
    pub min_fp: usize,

    /// Shortest product to report.
    #[arg(long, default_value_t = PcrSettings::default().min_len)]
    pub min_len: usize,

    /// Longest product to report.
    #[arg(long, default_value_t = PcrSettings::default().max_len)]
    pub max_len: usize,

    /// Print products as JSON.
    #[arg(long)]
    pub json: bool,
}

impl PcrArgs {
    pub fn settings(&self) -> PcrSettings {
        PcrSettings {
            min_fp: self.min_fp,
            min_len: self.min_len,
            max_len: self.max_len,
        }
    }
}

fn parse_primer(s: &str) -> Result<Primer, String> {
    let (name, seq) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected NAME=SEQUENCE, got '{}'", s))?;
    if name.is_empty() || seq.is_empty() {
        return Err(format!("Expected NAME=SEQUENCE, got '{}'", s));
    }
    if let Some(bad) = seq.chars().find(|c| !c.is_ascii_alphabetic()) {
        return Err(format!("Invalid base '{}' in primer '{}'", bad, name));
    }
    Ok(Primer::new(name, seq.to_ascii_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_command() {
        let args = Cli::try_parse_from(["clonifier", "parse", "seqs.fa", "--json"]).unwrap();
        match args.command {
            Some(Commands::Parse(parse)) => {
                assert_eq!(parse.file, PathBuf::from("seqs.fa"));
                assert!(parse.json);
            }
            other => panic!("Expected Parse command, got {:?}", other),
        }
    }

    #[test]
    fn test_pcr_primers_and_defaults() {
        let args = Cli::try_parse_from([
            "clonifier",
            "pcr",
            "template.fa",
            "--primer",
            "fw=acgtacgt",
            "-p",
            "rv=TTGGCCAA",
            "--min-len",
            "20",
        ])
        .unwrap();
        match args.command {
            Some(Commands::Pcr(pcr)) => {
                assert_eq!(
                    pcr.primers,
                    vec![Primer::new("fw", "ACGTACGT"), Primer::new("rv", "TTGGCCAA")]
                );
                let settings = pcr.settings();
                assert_eq!(settings.min_len, 20);
                assert_eq!(settings.min_fp, 15);
                assert_eq!(settings.max_len, 5000);
            }
            other => panic!("Expected Pcr command, got {:?}", other),
        }
    }

    #[test]
    fn test_pcr_requires_primer() {
        assert!(Cli::try_parse_from(["clonifier", "pcr", "template.fa"]).is_err());
        assert!(Cli::try_parse_from(["clonifier", "pcr", "t.fa", "-p", "noequals"]).is_err());
        assert!(Cli::try_parse_from(["clonifier", "pcr", "t.fa", "-p", "x=AC-GT"]).is_err());
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from([
            "clonifier",
            "-vv",
            "--backend",
            "thread",
            "--no-fallback",
            "parse",
            "a.fa",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.backend, Some(BackendKind::Thread));
        assert!(args.no_fallback);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["clonifier", "-v", "-q", "parse", "a.fa"]).is_err());
    }

    #[test]
    fn test_internal_worker_needs_no_command() {
        let args = Cli::try_parse_from(["clonifier", "--internal-worker"]).unwrap();
        assert!(args.internal_worker);
        assert!(args.command.is_none());
    }
}
