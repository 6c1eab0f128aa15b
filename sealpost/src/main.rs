//! Sealpost - sign and encrypt an RFC 5322 message with S/MIME and send it.

use std::{io::Write, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use sealpost_utils::{load_config, EmailMessage, SmimeMailer};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sealpost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, env = "SEALPOST_CONFIG", default_value = "sealpost.toml")]
    config: PathBuf,

    /// Raw message (.eml) to send
    message: PathBuf,

    /// Envelope sender, defaults to the From header
    #[arg(long)]
    from: Option<String>,

    /// Envelope recipients, defaults to the To and Cc headers
    #[arg(long)]
    to: Vec<String>,

    /// Print the sealed message to stdout instead of sending it
    #[arg(long)]
    seal_only: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            warn!("No recipient accepted the message");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Sealpost exited with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = load_config(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let credentials = config
        .smime
        .credentials()
        .context("building S/MIME credentials")?;
    let transport = config.transport.build().context("building transport")?;
    let mailer = SmimeMailer::new(credentials, transport);

    let raw = tokio::fs::read_to_string(&cli.message)
        .await
        .with_context(|| format!("reading message {}", cli.message.display()))?;
    let mut message = EmailMessage::parse(&raw);
    if let Some(from) = cli.from {
        message.from = from;
    }
    if !cli.to.is_empty() {
        message.recipients = cli.to;
    }

    if cli.seal_only {
        let sealed = mailer.seal(&message).context("sealing message")?;
        std::io::stdout()
            .write_all(sealed.raw().as_bytes())
            .context("writing sealed message")?;
        return Ok(true);
    }

    if message.recipients.is_empty() {
        anyhow::bail!("message has no recipients, use --to");
    }

    let accepted = mailer.send(&mut message).await.context("sending message")?;
    for recipient in message.failed_recipients() {
        warn!(to = %recipient, "Recipient failed");
    }
    info!(
        message_id = %message.message_id,
        accepted,
        failed = message.failed_recipients().len(),
        "Send finished"
    );
    Ok(accepted)
}
