//! layerscope CLI entry point.

mod args;
mod output;

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use layerscope_core::capture::CaptureCommand;
use layerscope_core::{
    platform, register_builtins, DefaultDriver, DissectorRegistry, Filter, SessionEvent,
    SessionFactory, SessionState, TokenRegistry,
};

use args::Args;
use output::OutputFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    if args.permission {
        let permission = platform::permission();
        println!("{permission}");
        return Ok(());
    }

    let registry = DissectorRegistry::new(Arc::new(TokenRegistry::new()));
    register_builtins(&registry).context("Failed to register built-in dissectors")?;

    if args.tokens {
        list_tokens(registry.tokens());
        return Ok(());
    }

    let display_filter = args
        .display_filter
        .as_deref()
        .map(Filter::compile)
        .transpose()
        .context("Invalid display filter")?;

    let mut factory = SessionFactory::new(Arc::new(registry));
    if let Some(command) = &args.capture_command {
        let command = CaptureCommand::parse(command).context("Invalid capture command")?;
        factory = factory.with_driver(DefaultDriver::with_command(command));
    }

    let session = factory
        .create(args.capture_parameters())
        .await
        .context("Failed to create capture session. Use --help for usage.")?;
    let mut events = session.subscribe();

    if session.target().is_live() {
        session
            .start()
            .await
            .with_context(|| format!("Failed to start capture on {}", session.target()))?;
    } else {
        session
            .replay()
            .await
            .with_context(|| format!("Failed to replay {}", session.target()))?;
    }

    let formatter = OutputFormatter::new(args.format, Arc::clone(session.snapshot().tokens()));
    let mut stdout = io::stdout();
    let mut printed = 0u64;
    let mut last_printed = None;
    let mut last_published = None;
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::PacketDissected { packet, stream_layers, .. } => {
                        last_published = Some(packet.index);
                        if args.count.is_some_and(|n| printed >= n) {
                            continue;
                        }
                        let highlights = match &display_filter {
                            Some(filter) => {
                                let result = filter.evaluate_with_streams(&packet, &stream_layers);
                                if !result.matched {
                                    continue;
                                }
                                result.attrs
                            }
                            None => Vec::new(),
                        };
                        formatter.write_packet(&packet, &highlights, &mut stdout)?;
                        printed += 1;
                        last_printed = Some(packet.index);

                        if args.count.is_some_and(|n| printed >= n) {
                            debug!(printed, "Packet count reached");
                            session.stop().await?;
                        }
                    }
                    SessionEvent::StreamLayerCompleted { layer, .. } => {
                        // Layers whose packet the capture filter dropped stand alone
                        let show = if last_published == Some(layer.packet_index) {
                            last_printed == Some(layer.packet_index)
                        } else {
                            display_filter.as_ref().map_or(true, |f| f.matches_layer(&layer.layer))
                        };
                        if show {
                            formatter.write_stream_layer(&layer, &mut stdout)?;
                        }
                    }
                    SessionEvent::CaptureError { message, .. } => {
                        eprintln!("Capture error: {message}");
                    }
                    SessionEvent::StateChanged { to, .. } if to.is_terminal() => break,
                    _ => {}
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                info!("Interrupted, stopping capture");
                session.stop().await?;
            }
        }
    }

    let state = session.wait().await;
    let stats = session.stats();
    eprintln!(
        "{} packets received, {} dissected, {} dropped, {} filtered, {} stream layers, {} corrupt layers",
        stats.received,
        stats.dissected,
        stats.dropped,
        stats.filtered,
        stats.stream_layers,
        stats.corrupt_layers
    );
    if events.dropped() > 0 {
        eprintln!("{} events not shown, output fell behind the capture", events.dropped());
    }

    if state == SessionState::Failed {
        let reason = session.failure().unwrap_or_else(|| "unknown error".to_string());
        bail!("Capture on {} failed: {reason}", session.target());
    }
    Ok(())
}

fn list_tokens(tokens: &TokenRegistry) {
    println!("Registered Tokens:");
    println!("{:-<60}", "");
    for token in tokens.tokens() {
        println!("  {:<30} {}", token.id(), token.name());
    }
}
