// CLASSIFICATION: COMMUNITY
// Filename: main.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-07-31

//! Command-line entry point. One binary serves a directory or mounts a
//! remote one, depending on which option pair is given.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use log::error;

use tetherfs::client::app::{self as client_app, ClientOptions};
use tetherfs::server::app::{self as server_app, ServerOptions};

#[derive(Parser)]
#[command(
    name = "tetherfs",
    version,
    about = "Mount a remote directory over a framed message link"
)]
struct Args {
    /// Serve this directory to a remote client.
    #[arg(long, value_name = "DIR")]
    serve: Option<PathBuf>,

    /// Endpoint to listen on, e.g. tcp://0.0.0.0:7070.
    #[arg(long, value_name = "ENDPOINT")]
    listen: Option<String>,

    /// Mount the remote directory here.
    #[arg(long, value_name = "DIR")]
    mountpoint: Option<PathBuf>,

    /// Server endpoint to connect to, e.g. tcp://host:7070.
    #[arg(long, value_name = "ENDPOINT")]
    connect: Option<String>,

    /// Preload files whose path starts with this prefix after every
    /// tree reload; may be given multiple times.
    #[arg(long, value_name = "PREFIX")]
    preload: Vec<String>,

    /// Worker threads serving requests.
    #[arg(long, value_name = "N", default_value_t = 50)]
    workers: usize,
}

static QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    // first interrupt asks for a clean shutdown, a second one returns
    // the signal to its default disposition
    if QUIT.swap(true, Ordering::SeqCst) {
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
        }
    }
}

fn install_quit_handler() {
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let is_help = matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = err.print();
            return if is_help {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    install_quit_handler();

    let result = match (args.serve, args.listen, args.mountpoint, args.connect) {
        (Some(root), Some(endpoint), None, None) => server_app::run(
            ServerOptions {
                endpoint,
                root,
                workers: args.workers.max(1),
            },
            &QUIT,
        ),
        (None, None, Some(mountpoint), Some(endpoint)) => client_app::run(
            ClientOptions {
                endpoint,
                mountpoint,
                preload: args.preload,
            },
            &QUIT,
        ),
        _ => {
            eprintln!("use either --serve DIR --listen ENDPOINT or --mountpoint DIR --connect ENDPOINT (see --help)");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
