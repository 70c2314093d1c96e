//! End-to-end demo over the in-memory hub

use std::path::Path;

use anyhow::{ensure, Result};
use clap::Args;
use serde_json::json;

use hgx_core::{ApiId, HgxConfig};
use hgx_dynamic::{NewObject, RegistrationKey};
use hgx_testkit::{identities, MemoryHub, Recorder};

/// Demo parameters
#[derive(Debug, Clone, Args)]
pub struct DemoArgs {
    /// Updates to publish after the genesis frame
    #[arg(short, long, default_value = "5")]
    pub updates: u32,

    /// Lookahead of the demo object
    #[arg(short, long)]
    pub legroom: Option<u32>,

    /// Revoke the reader before the last update
    #[arg(long)]
    pub revoke: bool,
}

pub async fn run(args: DemoArgs, config_path: &Path) -> Result<()> {
    let config = HgxConfig::load(Some(config_path))?;
    let hub = MemoryHub::new();
    let [author, reader] = identities::<2>();
    let author = hub.connect(author, config.clone())?;
    let reader = hub.connect(reader, config)?;
    let writer = author.session().await?;
    let observer = reader.session().await?;

    let mut spec = NewObject::dynamic(ApiId::from_schema("hgx.demo"), b"update 0".to_vec());
    spec.legroom = args.legroom;
    let object = writer.new_object(spec).await?;
    tracing::info!(object = %object.address, updates = args.updates, "Demo object created");
    writer.share(object.address, reader.address()).await?;
    reader.handle.quiesce().await?;

    let recorder = Recorder::new();
    observer
        .append_callback(
            RegistrationKey::Object(object.address),
            recorder.non_blocking("reader"),
        )
        .await?;

    for i in 1..=args.updates {
        if args.revoke && i == args.updates {
            writer.unshare(object.address, reader.address()).await?;
        }
        writer
            .update(object.address, format!("update {i}").into_bytes())
            .await?;
    }
    reader.handle.quiesce().await?;

    let frames: Vec<_> = hub
        .stored_frames(&object.address)
        .iter()
        .map(|frame| {
            json!({
                "index": frame.index,
                "epoch": frame.epoch,
                "keyshare": frame.keyshare.as_ref().map(|k| k.recipients().count()),
                "address": frame.address().to_string(),
            })
        })
        .collect();
    let observed: Vec<_> = recorder
        .payloads()
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect();
    let reader_view = observer.get(object.address).await?;
    ensure!(
        args.revoke || reader_view.index == Some(u64::from(args.updates)),
        "reader stopped at {:?}",
        reader_view.index
    );

    let report = json!({
        "object": object.address.to_string(),
        "author": author.address().to_string(),
        "reader": reader.address().to_string(),
        "frames": frames,
        "observed": observed,
        "reader_head": reader_view.index,
        "stats": {
            "frames_published": hub.stats().frames_published,
            "frames_delivered": hub.stats().frames_delivered,
            "grants_sent": hub.stats().grants_sent,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    author.handle.shutdown().await;
    reader.handle.shutdown().await;
    Ok(())
}
