use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gpt_lab::{
    rank_top_k, reduce_attention_with, significant_tokens, AttentionSelection, DownloadEvent,
    DownloadOutcome, DownloadRequest, Downloader, EventKind, Manifest, Settings,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "gpt-lab", version, about = "Model/dataset downloads and token probability tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one file (Ctrl-C cancels)
    Fetch {
        url: String,
        /// Where to write the file
        #[arg(long)]
        out: PathBuf,
        /// Name tag for the blob; defaults to the output file name
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
        #[arg(long, default_value = "cli")]
        id: String,
    },
    /// List a model/dataset manifest, optionally downloading one entry
    Manifest {
        url: String,
        /// Entry id to download
        #[arg(long)]
        download: Option<String>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Per-token attention weights from a JSON `[step][layer][head][row][key]` tensor
    Attention {
        tensor: PathBuf,
        #[arg(long, default_value_t = 0)]
        step: usize,
        #[arg(long, default_value_t = 0)]
        layer: usize,
        #[arg(long)]
        query_index: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Rank a probability distribution (JSON arrays)
    TopK {
        #[arg(long)]
        probs: String,
        #[arg(long)]
        vocab: String,
        #[arg(short, default_value_t = 5)]
        k: usize,
        /// List every token above the significance threshold instead
        #[arg(long)]
        significant: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("loading settings")?;

    match cli.command {
        Commands::Fetch {
            url,
            out,
            name,
            mime,
            id,
        } => {
            let name = name.unwrap_or_else(|| {
                out.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "download".to_string())
            });
            fetch(&settings, DownloadRequest::new(id, url, name, mime), out).await
        }
        Commands::Manifest {
            url,
            download,
            out_dir,
        } => {
            let client = settings.download.client().context("building HTTP client")?;
            let manifest = Manifest::fetch(&client, &url).await?;
            for entry in &manifest.entries {
                println!("{}\t{}\t{} bytes\t{}", entry.id, entry.file_name(), entry.size, entry.url);
            }
            let Some(id) = download else { return Ok(()) };
            let Some(entry) = manifest.find(&id) else {
                bail!("no entry {} in {}", id, url);
            };
            let dest = out_dir.join(entry.file_name());
            fetch(&settings, entry.to_request(), dest).await
        }
        Commands::Attention {
            tensor,
            step,
            layer,
            query_index,
            offset,
        } => {
            let text = tokio::fs::read_to_string(&tensor)
                .await
                .with_context(|| format!("reading {:?}", tensor))?;
            let tensor: gpt_lab::attention::AttentionTensor =
                serde_json::from_str(&text).context("tensor must be a 5-level nested JSON array")?;
            let selection = AttentionSelection {
                step,
                layer,
                query_index,
                offset,
            };
            for (position, weight) in reduce_attention_with(&tensor, &selection, &settings.attention)
                .iter()
                .enumerate()
            {
                match weight.head {
                    Some(head) => println!("{}\thead {}\t{:.4}", position, head, weight.weight),
                    None => println!("{}\t-\t{:.4}", position, weight.weight),
                }
            }
            Ok(())
        }
        Commands::TopK {
            probs,
            vocab,
            k,
            significant,
        } => {
            let probs: Vec<f32> = serde_json::from_str(&probs).context("--probs must be a JSON array of numbers")?;
            let vocab: Vec<String> = serde_json::from_str(&vocab).context("--vocab must be a JSON array of strings")?;
            if significant {
                for token in significant_tokens(&vocab, &probs) {
                    println!("{}\t{:?}\t{:.4}", token.index, token.text, token.probability);
                }
            } else {
                for token in rank_top_k(&probs, &vocab, k) {
                    println!("{:?}\t{:.4}", token.token, token.probability);
                }
            }
            Ok(())
        }
    }
}

async fn fetch(settings: &Settings, request: DownloadRequest, dest: PathBuf) -> Result<()> {
    let downloader = Downloader::builder(request)
        .config(settings.download.clone())
        .on(EventKind::Progress, |event| {
            if let DownloadEvent::Progress { loaded, total } = event {
                tracing::trace!("progress {}/{}", loaded, total);
            }
        })
        .spawn();

    let outcome = tokio::select! {
        outcome = downloader.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            downloader.cancel();
            downloader.wait().await
        }
    };

    match outcome {
        DownloadOutcome::Completed(file) => {
            file.write_to(&dest)
                .await
                .with_context(|| format!("writing {:?}", dest))?;
            println!("{} ({} bytes, {})", dest.display(), file.len(), file.mime);
            Ok(())
        }
        DownloadOutcome::Failed(err) => Err(err).context("download failed"),
        DownloadOutcome::Cancelled => bail!("download cancelled"),
    }
}
