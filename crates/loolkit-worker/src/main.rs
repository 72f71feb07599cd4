//! The per-document worker process.
//!
//! A supervisor forks this binary once per editing session. The
//! lifecycle is explicit and ordered: load and pre-initialize the engine
//! (the shared object lives outside the jail), open the control
//! connection (the descriptor survives the chroot), build and enter the
//! jail, obtain the Office handle, then serve the one document until the
//! last session leaves or the supervisor hangs up. Setup failures exit
//! immediately with [`worker::EXIT_SOFTWARE`] (or
//! [`worker::EXIT_CAPABILITY`] for capability trouble) so the supervisor
//! can reap and replace the worker; it also owns jail cleanup.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use loolkit_core::queue::TileQueue;
use loolkit_worker::channel;
use loolkit_worker::control::ControlLoop;
use loolkit_worker::engine::Engine;
use loolkit_worker::jail::JailBuilder;
use loolkit_worker::logging;
use loolkit_worker::worker;
use tracing::{error, info};

/// Per-document jailed worker for collaborative editing sessions.
#[derive(Parser, Debug)]
#[command(name = "loolkit-worker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory under which the jail is created
    #[arg(long)]
    child_root: PathBuf,

    /// System template donor tree
    #[arg(long)]
    sys_template: PathBuf,

    /// Engine template donor tree
    #[arg(long)]
    lo_template: PathBuf,

    /// Engine subpath inside the jail
    #[arg(long, default_value = "lo")]
    lo_sub_path: String,

    /// Supervisor control socket
    #[arg(long)]
    control_socket: PathBuf,

    /// Skip jail construction and capability drop (development only)
    #[arg(long)]
    no_capabilities: bool,

    /// Report the engine version in the connect handshake
    #[arg(long)]
    query_version: bool,

    /// Also print the engine version to stdout
    #[arg(long)]
    display_version: bool,
}

fn main() {
    let args = Args::parse();
    logging::init_from_env();
    if let Err(err) = worker::install_signal_handlers() {
        error!(error = %err, "cannot install signal handlers");
        worker::fast_exit(worker::EXIT_SOFTWARE);
    }

    // The jail directory is named after our pid; the supervisor knows it
    // implicitly and reaps it when we die.
    let jail_id = process::id().to_string();
    info!(jail = %jail_id, "kit process started");

    match run(&args, &jail_id) {
        Ok(()) => {
            info!("process finished");
            worker::fast_exit(worker::EXIT_OK);
        }
        Err(code) => worker::fast_exit(code),
    }
}

fn run(args: &Args, jail_id: &str) -> Result<(), i32> {
    // dlopen and lok_preinit must precede jail entry: the shared object
    // is resolved through paths outside the jail.
    let engine = match Engine::load(&args.lo_template) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "engine pre-initialization failed");
            return Err(worker::EXIT_SOFTWARE);
        }
    };

    // Open the control connection before the chroot hides the socket
    // path; the descriptor survives jail entry.
    let (mut reader, chan) = match channel::connect(&args.control_socket) {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, "cannot reach the supervisor");
            return Err(worker::EXIT_SOFTWARE);
        }
    };

    let (install_dir, user_profile_url) = if args.no_capabilities {
        info!(
            template = %args.lo_template.display(),
            "using template as install path, skipping jail setup"
        );
        let jail = args.child_root.join(jail_id);
        (
            format!("{}/program", args.lo_template.display()),
            format!("file://{}/user", jail.display()),
        )
    } else {
        let builder = JailBuilder::new(
            &args.child_root,
            &args.sys_template,
            &args.lo_template,
            args.lo_sub_path.clone(),
            jail_id,
        );
        match builder.build() {
            Ok(paths) => (paths.install_dir, paths.user_profile_url),
            Err(err) => {
                error!(error = %err, "jail construction failed");
                return Err(if err.is_capability() {
                    worker::EXIT_CAPABILITY
                } else {
                    worker::EXIT_SOFTWARE
                });
            }
        }
    };

    let office = match engine.init(&install_dir, &user_profile_url) {
        Ok(office) => office,
        Err(err) => {
            error!(error = %err, "engine initialization failed");
            return Err(worker::EXIT_SOFTWARE);
        }
    };
    info!("process is ready");

    let version = if args.query_version {
        office.lock().version_info()
    } else {
        None
    };
    if args.display_version {
        if let Some(version) = &version {
            println!("office version details: {version}");
        }
    }
    let hello = worker::handshake_line(process::id(), version.as_deref());
    if let Err(err) = chan.send_text_frame(&hello) {
        error!(error = %err, "handshake failed");
        return Err(worker::EXIT_SOFTWARE);
    }

    let chan = Arc::new(chan);
    let queue = Arc::new(TileQueue::new());
    let mut control = ControlLoop::new(office, chan, queue, jail_id.to_string());
    if let Err(err) = control.run(&mut reader) {
        // Protocol trouble after setup is never fatal by itself; fall
        // through to the clean exit.
        error!(error = %err, "control loop failed");
    }
    // Dropping the loop tears down the document and joins its pump.
    drop(control);
    Ok(())
}
