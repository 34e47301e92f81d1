//! SD card commands - list, fetch, store and delete files on the probe

use anyhow::{Context, Result};
use bytes::Bytes;
use canbadger_proto::EntryKind;
use canbadger_session::{ProbeClient, SessionEvent};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::output::{EntryRow, OutputContext};

/// List every file and directory on the card
pub async fn ls(client: &ProbeClient, ctx: &OutputContext) -> Result<()> {
    let entries = client.list_directory().await?;
    let rows: Vec<EntryRow> = entries
        .iter()
        .map(|entry| EntryRow {
            kind: match entry.kind {
                EntryKind::File => "file",
                EntryKind::Directory => "dir",
            }
            .to_string(),
            path: entry.path(),
        })
        .collect();
    ctx.print(&rows);
    Ok(())
}

/// Download `path`, writing it to `out` or stdout
pub async fn get(
    client: &ProbeClient,
    path: &str,
    out: Option<&Path>,
    ctx: &OutputContext,
) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {bytes} {msg}")?);
    pb.set_message(path.to_string());
    let tracker = track_progress(client, pb.clone());

    let result = client.download(path).await;
    tracker.abort();
    pb.finish_and_clear();
    let data = result?;

    match out {
        Some(out) => {
            std::fs::write(out, &data)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            ctx.success(&format!("{path}: {} bytes -> {}", data.len(), out.display()));
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
    }
    Ok(())
}

/// Upload a local file into `dir` on the card
pub async fn put(
    client: &ProbeClient,
    file: &Path,
    dir: &str,
    name: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let name = match name {
        Some(name) => name.to_string(),
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .context("File name is not valid UTF-8")?
            .to_string(),
    };

    let pb = ProgressBar::new(data.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(name.clone());
    let tracker = track_progress(client, pb.clone());

    let result = client.upload(dir, &name, Bytes::from(data)).await;
    tracker.abort();
    pb.finish_and_clear();
    let packets = result?;

    ctx.success(&format!("Uploaded {name} to {dir} in {packets} packet(s)"));
    Ok(())
}

pub async fn rm(client: &ProbeClient, path: &str, ctx: &OutputContext) -> Result<()> {
    client.delete_file(path).await?;
    ctx.success(&format!("Deleted {path}"));
    Ok(())
}

/// Move `pb` along with the session's transfer progress events
fn track_progress(client: &ProbeClient, pb: ProgressBar) -> JoinHandle<()> {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::TransferProgress { bytes, .. }) => pb.set_position(bytes as u64),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}
