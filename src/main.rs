//! clonifier - sequence tools on top of the worker bridge

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use clonifier::bridge::proxies::{self, Seq};
use clonifier::bridge::{Connection, Pcrer};
use clonifier::config::BridgeConfig;
use clonifier::logging::{self, LogConfig};
use clonifier::model::{Metadata, PcrProduct};
use clonifier::worker;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use std::path::Path;
use std::time::Duration;

use cli::{Cli, Commands};

/// Parses arguments, runs the selected command and prints the error chain
/// on failure (exit status 1).
///
/// With `--internal-worker` the process becomes a worker instead and never
/// returns.
fn main() {
    let cli = Cli::parse();

    if cli.internal_worker {
        worker::stdio::run_worker_main(cli.worker_log);
    }

    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(LogConfig::for_cli(cli.verbose, cli.quiet).with_env_overrides());

    let result = match &cli.command {
        Some(Commands::Parse(args)) => run(&cli, |conn| cmd_parse(conn, args)),
        Some(Commands::Convert(args)) => run(&cli, |conn| cmd_convert(conn, args)),
        Some(Commands::Pcr(args)) => run(&cli, |conn| cmd_pcr(conn, args)),
        Some(Commands::Completions(args)) => {
            args.generate();
            Ok(())
        }
        None => Ok(()),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn bridge_config(cli: &Cli) -> BridgeConfig {
    let mut config = BridgeConfig::new().with_env_overrides();
    if let Some(backend) = cli.backend {
        config = config.with_primary(backend);
    }
    if cli.no_fallback {
        config = config.with_fallback(None);
    }
    config
}

/// Run `command` against a fresh worker connection and shut it down after.
fn run<F, Fut>(cli: &Cli, command: F) -> Result<()>
where
    F: FnOnce(Connection) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let config = bridge_config(cli);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        let conn = Connection::start(&config);
        conn.ready()
            .await
            .with_context(|| format!("Worker ({} backend) did not start", config.primary))?;

        // calls in flight when the worker dies are never answered
        let mut states = conn.watch_state();
        let result = tokio::select! {
            result = command(conn.clone()) => result,
            lost = states.wait_for(|state| state.is_terminal()) => {
                drop(lost);
                Err(worker_lost(&conn))
            }
        };
        conn.shutdown();
        result
    })
}

fn worker_lost(conn: &Connection) -> anyhow::Error {
    match conn.fatal_error() {
        Some(fatal) => anyhow::Error::new(fatal).context("Worker stopped before the command finished"),
        None => anyhow::anyhow!("Worker connection closed before the command finished"),
    }
}

/// Load every sequence in `path`: a file written by `convert`, or FASTA.
async fn load(conn: &Connection, path: &Path) -> Result<Vec<Seq>> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let is_binary = data
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    let seqs = if is_binary {
        vec![proxies::parse_bin(conn, data).await?]
    } else {
        proxies::parse_fasta(conn, data).await?
    };

    if seqs.is_empty() {
        bail!("No sequences found in {}", path.display());
    }
    Ok(seqs)
}

/// Load `path` and keep only its first sequence.
async fn load_first(conn: &Connection, path: &Path) -> Result<Seq> {
    let mut seqs = load(conn, path).await?.into_iter();
    let first = seqs.next().context("No sequences loaded")?;
    seqs.for_each(Seq::free);
    Ok(first)
}

async fn cmd_parse(conn: Connection, args: &cli::ParseArgs) -> Result<()> {
    let seqs = load(&conn, &args.file).await?;

    let mut metadata: Vec<Metadata> = Vec::with_capacity(seqs.len());
    for seq in &seqs {
        metadata.push(seq.get_metadata().await?);
    }
    seqs.into_iter().for_each(Seq::free);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }
    for meta in &metadata {
        let name = if meta.name.is_empty() {
            "(unnamed)"
        } else {
            meta.name.as_str()
        };
        let topology = if meta.circular { "circular" } else { "linear" };
        println!(
            "{}  {} bp  {}",
            name.if_supports_color(Stdout, |text| text.bold()),
            meta.len,
            topology.if_supports_color(Stdout, |text| text.dimmed()),
        );
    }
    Ok(())
}

async fn cmd_convert(conn: Connection, args: &cli::ConvertArgs) -> Result<()> {
    let seq = load_first(&conn, &args.input).await?;
    let bytes = seq.to_bin().await;
    seq.free();
    let bytes = bytes?;

    tokio::fs::write(&args.output, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    eprintln!(
        "{} {} bytes to {}",
        "Wrote".if_supports_color(Stderr, |text| text.green()),
        bytes.len(),
        args.output.display()
    );
    Ok(())
}

async fn cmd_pcr(conn: Connection, args: &cli::PcrArgs) -> Result<()> {
    let template = load_first(&conn, &args.file).await?;
    let pcrer = Pcrer::create(&conn, &template, &args.primers, args.settings()).await;
    template.free();
    let pcrer = pcrer?;

    let products = pcr_products(&pcrer).await;
    pcrer.free();
    let products = products?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&products)?);
        return Ok(());
    }
    if products.is_empty() {
        println!("No products.");
    }
    for product in &products {
        println!(
            "{} + {}  {}..{}  {} bp",
            product.primer_fwd.if_supports_color(Stdout, |text| text.cyan()),
            product.primer_rev.if_supports_color(Stdout, |text| text.cyan()),
            product.start,
            product.end,
            product.len.if_supports_color(Stdout, |text| text.bold()),
        );
    }
    Ok(())
}

/// Wait for a PCR simulation to finish and collect its products.
async fn pcr_products(pcrer: &Pcrer) -> Result<Vec<PcrProduct>> {
    loop {
        let status = pcrer.get_status().await?;
        if status.cancelled {
            bail!("PCR was cancelled");
        }
        if status.done {
            break;
        }
        tracing::debug!(percent = status.percent, "PCR running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let results = pcrer.get_result().await?;
    let products = results.get_products().await;
    results.free();
    Ok(products?)
}
