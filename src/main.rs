//! AS4 codec inspection binary.
//!
//! Run with: `as4-codec --input message.bin --content-type 'multipart/related; boundary="b"'`

use anyhow::{Context, Result};
use as4_codec::model::{AttachmentContent, MessageUnit, SignalVariant};
use as4_codec::{CodecConfig, CodecDispatcher};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// AS4 message inspector.
///
/// Decodes an AS4 message from a file and prints a summary of its message
/// units and attachments. Useful for checking what a partner actually put
/// on the wire.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the raw message body to decode
    #[arg(short, long)]
    input: PathBuf,

    /// Declared content type of the message, boundary parameter included
    #[arg(short = 't', long)]
    content_type: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = if args.config.exists() {
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        CodecConfig::default()
    };

    let data = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    info!(
        input = %args.input.display(),
        bytes = data.len(),
        content_type = %args.content_type,
        "decoding message"
    );

    let dispatcher = CodecDispatcher::new(config);
    let message = dispatcher
        .deserialize_async(data, args.content_type.clone(), CancellationToken::new())
        .await
        .context("Failed to decode message")?;

    println!(
        "message: {} unit(s), {} attachment(s), signed={} encrypted={}",
        message.units().len(),
        message.attachments().len(),
        message.security.is_signed,
        message.security.is_encrypted
    );

    for unit in message.units() {
        match unit {
            MessageUnit::User(user) => {
                println!(
                    "  user message {}: service={} action={} parts={}",
                    user.info.message_id,
                    user.collaboration.service.value,
                    user.collaboration.action,
                    user.part_infos.len()
                );
            }
            MessageUnit::Signal(signal) => {
                let kind = match &signal.variant {
                    SignalVariant::Receipt(_) => "receipt".to_string(),
                    SignalVariant::Error(lines) => format!("error ({} line(s))", lines.len()),
                    SignalVariant::PullRequest { mpc } => format!("pull request (mpc={mpc})"),
                };
                println!(
                    "  signal message {}: {} ref_to={}",
                    signal.info.message_id,
                    kind,
                    signal.info.ref_to_message_id.as_deref().unwrap_or("-")
                );
            }
        }
    }

    for attachment in message.attachments() {
        let size = match &attachment.content {
            AttachmentContent::Bytes(b) => format!("{} bytes", b.len()),
            AttachmentContent::Reader(_) => "streamed".to_string(),
        };
        println!(
            "  attachment {}: {} ({})",
            attachment.id, attachment.content_type, size
        );
    }

    Ok(())
}
