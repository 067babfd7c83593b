//! servdctl - control client for servd
//!
//! Talks to the daemon over its unix socket; one request per invocation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::UnixStream;

use servd::protocol::{self, Request, Response, SOCKET_PATH};

#[derive(Parser)]
#[command(name = "servdctl")]
#[command(about = "Control the servd init system")]
struct Args {
    /// Control socket path
    #[arg(long, default_value = SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List services and their state
    List,

    /// Show one service
    Status {
        /// Service identifier, e.g. "sshd" or "udhcpc:eth1"
        ident: String,
    },

    /// Start a service (clears manual and crashing blocks)
    Start { ident: String },

    /// Stop a service (sets the manual block)
    Stop { ident: String },

    /// Stop/start cycle a running service
    Restart { ident: String },

    /// Reload the configuration files
    Reload,

    /// Switch runlevel; 0 powers off, 6 reboots
    Runlevel { level: u8 },

    /// Dump the condition store
    Conditions,

    /// Ping the daemon
    Ping,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let request = match args.command {
        Command::List => Request::List,
        Command::Status { ident } => Request::Status { ident },
        Command::Start { ident } => Request::Start { ident },
        Command::Stop { ident } => Request::Stop { ident },
        Command::Restart { ident } => Request::Restart { ident },
        Command::Reload => Request::Reload,
        Command::Runlevel { level } => Request::Runlevel { level },
        Command::Conditions => Request::Conditions,
        Command::Ping => Request::Ping,
    };

    let mut stream = match UnixStream::connect(&args.socket).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Cannot connect to {}: {}", args.socket.display(), e);
            eprintln!("Is servd running?");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(e) = protocol::send(&mut stream, &request).await {
        eprintln!("Request failed: {}", e);
        return std::process::ExitCode::FAILURE;
    }

    let response: Response = match protocol::recv(&mut stream).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("Bad response: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    print_response(response)
}

fn print_response(response: Response) -> std::process::ExitCode {
    match response {
        Response::Ok => std::process::ExitCode::SUCCESS,
        Response::Pong => {
            println!("pong");
            std::process::ExitCode::SUCCESS
        }
        Response::Error(msg) => {
            eprintln!("error: {}", msg);
            std::process::ExitCode::FAILURE
        }
        Response::Services(services) => {
            println!(
                "{:<20} {:<8} {:<9} {:<10} {:>6}  {}",
                "IDENT", "KIND", "STATE", "BLOCK", "PID", "DESCRIPTION"
            );
            for svc in services {
                println!(
                    "{:<20} {:<8} {:<9} {:<10} {:>6}  {}",
                    svc.ident, svc.kind, svc.state, svc.block, svc.pid, svc.description
                );
            }
            std::process::ExitCode::SUCCESS
        }
        Response::Conditions(conds) => {
            for (name, state) in conds {
                println!("{:<40} {}", name, state);
            }
            std::process::ExitCode::SUCCESS
        }
        Response::Runlevel { current, previous } => {
            println!("{} {}", previous, current);
            std::process::ExitCode::SUCCESS
        }
    }
}
