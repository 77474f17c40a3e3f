//! rgrid-launch: stand-alone launcher for the bootstrap fabric.
//!
//! Listens for N worker connections, indexes them by announced rank, and
//! serves the flat-star collective protocol until the job closes or
//! aborts. Workers find us through MPIRUN_HOST / MPIRUN_PORT.

use std::net::{Ipv4Addr, TcpListener};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use rgrid_launcher::{accept_workers, process_ops};

#[derive(Parser)]
#[command(name = "rgrid-launch", about = "Flat-star launcher for rgrid jobs")]
struct Args {
    /// Number of worker processes to expect
    #[arg(short = 'n', long)]
    nprocs: usize,

    /// Port to listen on (0 = OS-assigned, printed on startup)
    #[arg(short, long, default_value_t = 0)]
    port: u16,
}

fn run(args: Args) -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, args.port))
        .with_context(|| format!("binding port {}", args.port))?;
    let port = listener.local_addr()?.port();
    info!("listening on port {port} for {} workers", args.nprocs);
    // workers read this to build their MPIRUN_PORT
    println!("{port}");

    let mut conns = accept_workers(&listener, args.nprocs).context("accepting workers")?;
    info!("all {} workers connected", args.nprocs);
    process_ops(&mut conns).context("collective engine")?;
    info!("job closed cleanly");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    if args.nprocs == 0 {
        error!("--nprocs must be at least 1");
        return ExitCode::FAILURE;
    }
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
