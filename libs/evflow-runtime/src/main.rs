// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! evflow runtime binary.
//!
//! Standalone process hosting the evflow mainloop: loads the XML
//! configuration into the tree, scans the module search path, installs
//! shutdown signal handlers and drives plan build + dispatch until the
//! system stops. Exits with code 1 when signal handlers cannot be
//! installed or no module artifact is found at all.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use evflow::config::{self, AttrFlags, ConfigTree};
use evflow::mainloop::{Mainloop, MainloopControl};
use evflow::plan::SYSTEM_NODE_NAME;
use evflow::registry::PluginRegistry;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "evflow-runtime")]
#[command(author, version, about = "evflow event-pipeline host process", long_about = None)]
struct Args {
    /// XML configuration file, loaded at startup and saved back at clean
    /// shutdown
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Module search directory (overrides the configured search path)
    #[arg(long = "module-dir", value_name = "DIR")]
    module_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let tree = ConfigTree::new();

    if let Some(path) = &args.config {
        if let Err(err) = import_config(&tree, path) {
            // A missing or broken file is not fatal: the tree starts
            // from defaults and is written back at shutdown.
            tracing::warn!("failed to load configuration '{}': {err:#}", path.display());
        }
    }

    let mainloop = Mainloop::new(Arc::clone(&tree));

    if let Err(err) = install_signal_handlers(mainloop.control()) {
        tracing::error!("failed to install signal handlers: {err}");
        return ExitCode::from(1);
    }

    // Module search path, visible and overridable through the tree.
    let modules_node = tree.node(&format!("/{SYSTEM_NODE_NAME}/modules/"));
    let default_dir = std::env::current_dir()
        .map(|d| d.join("modules"))
        .unwrap_or_else(|_| PathBuf::from("modules"));
    modules_node.create_string(
        "moduleSearchPath",
        &default_dir.to_string_lossy(),
        2,
        4096,
        AttrFlags::NORMAL,
        "Directory to search loadable modules in, recursively.",
    );

    if let Some(dir) = &args.module_dir {
        let _ = modules_node.put_string("moduleSearchPath", &dir.to_string_lossy());
    }

    let search_path = PathBuf::from(modules_node.get_string("moduleSearchPath"));

    let mut registry = match PluginRegistry::scan(&search_path) {
        Ok(registry) if !registry.is_empty() => registry,
        Ok(_) => {
            tracing::error!(
                "failed to find any modules on path '{}'",
                search_path.display()
            );
            return ExitCode::from(1);
        }
        Err(err) => {
            tracing::error!(
                "failed to scan module path '{}': {err}",
                search_path.display()
            );
            return ExitCode::from(1);
        }
    };

    mainloop.run(&mut registry);

    if let Some(path) = &args.config {
        match export_config(&tree, path) {
            Ok(()) => tracing::info!("configuration saved to '{}'", path.display()),
            Err(err) => {
                tracing::error!("failed to save configuration '{}': {err:#}", path.display());
            }
        }
    }

    ExitCode::SUCCESS
}

fn import_config(tree: &Arc<ConfigTree>, path: &PathBuf) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| "open configuration file")?;
    config::import_from_reader(tree.root(), BufReader::new(file), false)
        .with_context(|| "parse configuration file")?;
    Ok(())
}

fn export_config(tree: &Arc<ConfigTree>, path: &PathBuf) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| "create configuration file")?;
    config::export_to_writer(tree.root(), BufWriter::new(file))
        .with_context(|| "write configuration file")?;
    Ok(())
}

/// Route SIGTERM and SIGINT through a self-pipe into a watcher thread
/// that flips the shutdown flags; SIGPIPE is ignored. Signal handlers
/// must stay async-signal-safe, so the handler itself only writes a byte.
#[cfg(unix)]
fn install_signal_handlers(control: Arc<MainloopControl>) -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::low_level::pipe;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    let (mut reader, writer) = UnixStream::pair()?;
    let writer_fd = writer.as_raw_fd();

    pipe::register(SIGTERM, writer_fd)?;
    pipe::register(SIGINT, writer_fd)?;

    // The registered fd must outlive the process.
    std::mem::forget(writer);

    // Ignore SIGPIPE: sinks writing into closed pipes report errors
    // through their normal I/O paths instead.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let handler = std::thread::Builder::new()
        .name("signal-handler".to_owned())
        .spawn(move || {
            let mut buf = [0u8; 1];

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        tracing::info!("shutdown signal received, stopping system");
                        control.shutdown_system();
                    }
                    Err(err) => {
                        tracing::error!("signal handler thread error: {err}");
                        break;
                    }
                }
            }
        })?;

    // Detached: it lives until process exit.
    drop(handler);

    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(_control: Arc<MainloopControl>) -> std::io::Result<()> {
    tracing::warn!("signal handling not implemented on this platform");
    Ok(())
}
