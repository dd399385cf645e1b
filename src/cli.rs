use anyhow::{Context, Result};
use clap::Subcommand;
use courier::download::{DownloadEvent, Outcome};
use courier::model::DownloadStatus;
use courier::progress::format_bytes;
use courier::registry::DownloadRegistry;
use bytes::Bytes;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const DEFAULT_SERVER: &str = "http://127.0.0.1:3000";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the files directory and the download history (default)
    Serve,

    /// List the files offered by a server
    List {
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Download one file and record the outcome in the server's history
    Fetch {
        /// Path of the file, relative to the server's files directory
        file: String,

        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,

        /// Directory to save the file into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Print the server's download history
    History {
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,

        /// Clear the history instead of printing it
        #[arg(long)]
        clear: bool,
    },
}

pub async fn list(registry: &DownloadRegistry) -> Result<()> {
    let files = registry.list_files().await?;
    if files.is_empty() {
        println!("No files available.");
    }
    for file in files {
        println!("{:>10}  {}", format_bytes(file.size), file.name);
    }
    Ok(())
}

pub async fn history(registry: &DownloadRegistry, clear: bool) -> Result<()> {
    let records = if clear {
        registry.clear_history().await?
    } else {
        registry.history().await?
    };
    if records.is_empty() {
        println!("History is empty.");
    }
    for record in records {
        println!("{:>6}  {:<9} {}", record.id, record.status, record.name);
    }
    Ok(())
}

pub async fn fetch(registry: &DownloadRegistry, file: &str, out: &Path) -> Result<()> {
    let recorded = registry
        .record_start(file)
        .await
        .with_context(|| format!("Could not register download of {}", file))?;
    let id = recorded.ndx;

    let download = match registry.start(file, id).await {
        Ok(download) => download,
        Err(e) => {
            mark(registry, file, id, DownloadStatus::Failed).await;
            return Err(e).with_context(|| format!("Could not open {}", file));
        }
    };

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("=>-"),
    );

    let chunks: Arc<Mutex<Option<Vec<Bytes>>>> = Arc::new(Mutex::new(None));
    let _progress = {
        let pb = pb.clone();
        let chunks = chunks.clone();
        download.subscribe(move |event| match event {
            DownloadEvent::Update(p) => {
                if let Ok(percent) = p.progress.parse::<f64>() {
                    pb.set_position(percent as u64);
                }
                pb.set_message(format!("{} {}", format_bytes(p.loaded_bytes), p.speed));
            }
            DownloadEvent::Finished { chunks: data } => {
                if let Ok(mut slot) = chunks.lock() {
                    *slot = Some(data.clone());
                }
            }
            DownloadEvent::Stopped => pb.abandon_with_message("Download stopped by user"),
        })
    };

    let stopper = download.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    let outcome = download.start().await;
    ctrl_c.abort();

    match outcome {
        Ok(Outcome::Finished { bytes }) => {
            pb.finish_with_message(format!("{} done", format_bytes(bytes)));
            let data = chunks
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .unwrap_or_default();
            let target = save(out, file, &data).await?;
            info!("Saved {} to {:?}", file, target);
            mark(registry, file, id, DownloadStatus::Complete).await;
            Ok(())
        }
        Ok(Outcome::Stopped) => {
            mark(registry, file, id, DownloadStatus::Canceled).await;
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Download failed");
            mark(registry, file, id, DownloadStatus::Failed).await;
            Err(e).with_context(|| format!("Download of {} failed", file))
        }
    }
}

async fn mark(registry: &DownloadRegistry, file: &str, id: courier::DownloadId, status: DownloadStatus) {
    if let Err(e) = registry.record_status(file, id, status).await {
        warn!("Could not record {} for download {}: {}", status, id, e);
    }
}

async fn save(out: &Path, file: &str, chunks: &[Bytes]) -> Result<PathBuf> {
    let name = file.rsplit('/').next().unwrap_or(file);
    tokio::fs::create_dir_all(out).await?;
    let target = out.join(name);

    let mut handle = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("Could not create {:?}", target))?;
    for chunk in chunks {
        handle.write_all(chunk).await?;
    }
    handle.flush().await?;
    Ok(target)
}
