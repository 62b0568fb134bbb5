//! Watch command - print events until interrupted.

use std::path::PathBuf;

use anyhow::{Context, anyhow, bail};
use console::style;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::watcher::{EventMask, WatchEvent, WatchOptions, WatchService};

/// Flags of the `watch` subcommand.
#[derive(Debug, Clone, Default)]
pub struct WatchArgs {
    pub paths: Vec<PathBuf>,
    pub recursive: bool,
    pub events: Option<String>,
    pub json: bool,
    pub verbose: bool,
}

/// Merge command-line flags over the configured watch defaults.
pub fn resolve_options(settings: &Settings, args: &WatchArgs) -> anyhow::Result<WatchOptions> {
    let mut options = WatchOptions::try_from(&settings.watcher)
        .map_err(|e| anyhow!("invalid watcher.events in configuration: {e}"))?;

    if args.recursive {
        options = options.recursive(true);
    }
    if let Some(events) = &args.events {
        let mask = EventMask::parse_list(events).map_err(|e| anyhow!("--events: {e}"))?;
        options = options.mask(mask);
    }
    Ok(options)
}

/// One output line for an event.
pub fn format_event(event: &WatchEvent, json: bool, verbose: bool) -> anyhow::Result<String> {
    if json {
        return serde_json::to_string(event).context("encoding event");
    }

    let name = format!("{:<13}", event.event_name);
    let mut line = format!("{} {}", style(name).green(), event.path.display());
    if verbose {
        line.push_str(&format!(" ({})", style(event.source.display()).dim()));
    }
    Ok(line)
}

/// Run watch command.
pub async fn run_watch(settings: &Settings, args: WatchArgs) -> anyhow::Result<()> {
    let options = resolve_options(settings, &args)?;
    let service = WatchService::new(&settings.watcher)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<WatchEvent>();

    let mut started = 0;
    for path in &args.paths {
        let tx = tx.clone();
        let result = service
            .start_watching(path.clone(), options, move |event| {
                let _ = tx.send(event);
            })
            .await;

        match result {
            Ok(id) => {
                started += 1;
                crate::log_event!("cli", "watching", "{}", id.display());
                if args.verbose {
                    let dirs = service.watched_directories(&id).await?;
                    eprintln!("Watching {} ({} directories)", id.display(), dirs.len());
                    for dir in dirs {
                        eprintln!("  {}", dir.display());
                    }
                }
            }
            Err(e) => eprintln!("{}: {e}", style("error").red().bold()),
        }
    }
    drop(tx);

    if started == 0 {
        service.dispose();
        bail!("no path could be watched");
    }
    if !args.json {
        eprintln!(
            "Watching {started} path(s), mask {:#06x}{}. Press Ctrl-C to stop.",
            options.mask.bits(),
            if options.recursive { ", recursive" } else { "" }
        );
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                println!("{}", format_event(&event, args.json, args.verbose)?);
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                break;
            }
        }
    }

    let stopped = service.stop_all().await.unwrap_or(0);
    crate::debug_event!("cli", "stopped", "{stopped} watches");
    service.dispose();
    Ok(())
}
