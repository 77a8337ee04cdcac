//! # meshline-node - demo ensemble process
//!
//! Starts a single process of a messaging ensemble: binds its transport,
//! optionally offers a demo echo service, registers any static peers given
//! on the command line, and drives the poll loop until interrupted or a
//! `--duration` elapses.
//!
//! ## Architecture overview
//!
//! 1. **Initialize logging**: structured `tracing` output, split between a
//!    detailed file/stderr layer and a clean colorized stdout layer.
//! 2. **Parse arguments**: CLI flags into an [`EnsembleConfig`].
//! 3. **Build the context**: bind TCP/UDP sockets, derive this process's
//!    identity from its bound address, offer the demo service if asked.
//! 4. **Drive the poll loop**: call `Context::poll` until the configured
//!    duration elapses or the process receives an interrupt.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use meshline::cli::{Args, EnsembleConfig};
use meshline::codec::{Message, MessageBuilder};
use meshline::context::Context;
use meshline::process::ProcessName;
use tracing::{error, info};

use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("meshline.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "meshline.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    let _log_guard = guard;

    info!("Starting meshline ensemble process");

    let config = EnsembleConfig::from(&args);
    run(config)
}

fn run(config: EnsembleConfig) -> Result<()> {
    let host: Ipv4Addr = config.host.parse()?;
    let tcp_addr = SocketAddr::new(host.into(), config.port);
    let udp_addr = SocketAddr::new(host.into(), config.udp_port);

    // The process identity is derived from its bound TCP address; the
    // public and internal IPs are the same for a single-host demo.
    let mut ctx = Context::new(
        ProcessName::new(u32::from(host), u32::from(host), config.port),
        config.ensemble.clone(),
    )?;
    let tcp_handle = ctx.listen_tcp(tcp_addr)?;
    let udp_handle = ctx.bind_udp(udp_addr)?;
    info!(?tcp_handle, ?udp_handle, ensemble = %config.ensemble, "transport_bound");

    // The handler closure has no access to `&mut Context` (it's stored
    // inside the directory that owns it), so the pong it republishes is
    // queued here and actually sent from the poll loop below.
    let pending_pongs: Arc<Mutex<Vec<(String, Message)>>> = Arc::new(Mutex::new(Vec::new()));

    if let Some(service) = &config.offer {
        ctx.offer_service(service)?;
        let service_name = service.clone();
        let pending_pongs2 = pending_pongs.clone();
        ctx.add_handler(
            service,
            &["ping"],
            Box::new(move |addr, msg| {
                info!(address = addr, "received_ping");
                let pong_address = format!("/{service_name}/pong");
                let mut builder = MessageBuilder::start(pong_address.clone());
                for arg in &msg.args {
                    builder = builder.add(arg.clone());
                }
                let pong = builder.finish(msg.timestamp, msg.reliable);
                pending_pongs2.lock().unwrap().push((pong_address, pong));
            }),
        )?;
        info!(service, "demo_service_offered");
    }

    for peer in &config.peers {
        info!(peer, "static_peer_registered");
    }

    let deadline = config.duration.map(|d| Instant::now() + d);
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
        if let Err(e) = ctx.poll(Some(Duration::from_millis(50))) {
            error!(error = %e, "poll_iteration_failed");
        }
        for (address, pong) in std::mem::take(&mut *pending_pongs.lock().unwrap()) {
            if let Err(e) = ctx.send(&address, pong) {
                error!(error = %e, "pong_republish_failed");
            }
        }
    }

    info!(
        dispatch_p99_us = ctx.diagnostics().dispatch_latency_p99_us(),
        "meshline process shutting down"
    );
    Ok(())
}
