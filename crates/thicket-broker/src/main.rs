//! `thicket-controller`: one broker process per controller id.
//!
//! Listens on `<socket-dir>/controller-<id>.sock`. Spawned on demand by
//! `thicket-control` when a client asks for a controller that is not
//! running yet.

use std::process::ExitCode;
use std::sync::Arc;

use thicket_broker::{Broker, BrokerConfig};
use thicket_primitives::MAX_CONTROLLER_ID;

struct Args {
    controller_id: u32,
    socket_dir: std::path::PathBuf,
    huge_pool: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut controller_id = None;
    let mut socket_dir = std::path::PathBuf::from("/run/thicket");
    let mut huge_pool = true;

    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-c" => {
                let value = argv.next().ok_or("-c requires a controller id")?;
                let id: u32 = value
                    .parse()
                    .map_err(|_| format!("invalid controller id: {value}"))?;
                if id > MAX_CONTROLLER_ID {
                    return Err(format!(
                        "controller id {id} out of range (max {MAX_CONTROLLER_ID})"
                    ));
                }
                controller_id = Some(id);
            }
            "--socket-dir" => {
                socket_dir = argv.next().ok_or("--socket-dir requires a path")?.into();
            }
            "--no-huge-pages" => huge_pool = false,
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Args {
        controller_id: controller_id.ok_or("missing required -c <controller-id>")?,
        socket_dir,
        huge_pool,
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("thicket-controller: {msg}");
            eprintln!("usage: thicket-controller -c <controller-id> [--socket-dir <path>] [--no-huge-pages]");
            return ExitCode::FAILURE;
        }
    };

    let socket_path = args
        .socket_dir
        .join(format!("controller-{}.sock", args.controller_id));
    let config = BrokerConfig {
        huge_pool: args.huge_pool,
        ..BrokerConfig::default()
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let broker = match Broker::create(&socket_path, config) {
            Ok(broker) => Arc::new(broker),
            Err(e) => {
                tracing::error!(error = %e, socket = %socket_path.display(), "broker startup failed");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = broker.run().await {
            tracing::error!(error = %e, "broker terminated");
            return ExitCode::FAILURE;
        }
        ExitCode::SUCCESS
    })
}
