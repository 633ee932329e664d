use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use montage::demux::{DemuxEvent, Demuxer};
use montage::timeline::Manifest;
use montage::SoftwareCodecs;

#[derive(Parser, Debug)]
#[command(name = "montage", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a JSON timeline manifest into a fragmented MP4.
    Compose(ComposeArgs),
    /// Print the tracks and sample totals of an MP4 file.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct ComposeArgs {
    /// Timeline manifest JSON. Clip paths are relative to its directory.
    #[arg(long)]
    manifest: PathBuf,

    /// Output MP4 path.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// MP4 file to inspect.
    path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("montage=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Compose(args) => cmd_compose(args).await,
        Command::Probe(args) => cmd_probe(args).await,
    }
}

async fn cmd_compose(args: ComposeArgs) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(&args.manifest)
        .with_context(|| format!("open manifest '{}'", args.manifest.display()))?;
    let manifest = Manifest::from_json(&json)?;
    let base_dir = args.manifest.parent().unwrap_or_else(|| Path::new("."));

    let combinator = manifest.build(base_dir, Arc::new(SoftwareCodecs)).await?;
    let duration = combinator.duration();
    let mut stream = combinator.output()?;

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    let mut out = tokio::fs::File::create(&args.out)
        .await
        .with_context(|| format!("create '{}'", args.out.display()))?;

    let mut written = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, finalizing output");
                stream.stop();
            }
            chunk = stream.next_chunk() => {
                let Some(chunk) = chunk else { break };
                let chunk = chunk?;
                out.write_all(&chunk).await.context("write output")?;
                written += chunk.len() as u64;
            }
        }
    }
    out.flush().await.context("flush output")?;

    eprintln!(
        "wrote {} ({written} bytes, {:.3}s)",
        args.out.display(),
        duration as f64 / 1e6
    );
    Ok(())
}

async fn cmd_probe(args: ProbeArgs) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(&args.path)
        .await
        .with_context(|| format!("open '{}'", args.path.display()))?;
    let mut demuxer = Demuxer::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut totals: Vec<(u32, u64, i64)> = Vec::new();

    let mut account = |events: Vec<DemuxEvent>| {
        for event in events {
            match event {
                DemuxEvent::Ready(_) => {}
                DemuxEvent::Samples { track_id, samples } => {
                    let idx = match totals.iter().position(|t| t.0 == track_id) {
                        Some(i) => i,
                        None => {
                            totals.push((track_id, 0, 0));
                            totals.len() - 1
                        }
                    };
                    totals[idx].1 += samples.len() as u64;
                    totals[idx].2 += samples.iter().map(|s| s.duration).sum::<i64>();
                }
            }
        }
    };

    loop {
        let n = file.read(&mut buf).await.context("read input")?;
        if n == 0 {
            break;
        }
        account(demuxer.push(&buf[..n])?);
    }
    account(demuxer.finish()?);

    let movie = demuxer.movie().context("input has no movie header")?;
    println!(
        "duration: {:.3}s  fragmented: {}",
        movie.duration as f64 / 1e6,
        movie.fragmented
    );
    for (key, value) in &movie.tags {
        println!("tag {key}: {value}");
    }
    for track in &movie.tracks {
        let (samples, total) = totals
            .iter()
            .find(|t| t.0 == track.track_id)
            .map_or((0, 0), |t| (t.1, t.2));
        println!(
            "track {} {:?} codec={} samples={samples} duration={:.3}s",
            track.track_id,
            track.kind,
            track.config.codec(),
            total as f64 / 1e6
        );
    }
    Ok(())
}
