//! servd - runlevel-based init and service supervisor
//!
//! As PID 1:
//! - Mounts the base filesystems
//! - Runs the bootstrap (S) runlevel, then the configured runlevel
//! - Supervises services, reaps zombies, reacts to conditions
//! - Tears the machine down on shutdown signals
//!
//! In the foreground (`-f`) it supervises without owning the machine,
//! which is how the test suite and development sessions run it.
//!
//! All supervision runs on a single thread: signals, timer deadlines and
//! control connections are multiplexed below and handed to the supervisor
//! synchronously.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use log::info;
use tokio::net::{UnixListener, UnixStream};

use servd::cond::COND_DIR;
use servd::conf::CONF_DIR;
use servd::hooks::HookPoint;
use servd::pid1::{self, SignalHandler};
use servd::protocol::{self, Request, SOCKET_PATH};
use servd::supervisor::Supervisor;

/// Grace period for services to drain on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "servd")]
#[command(about = "Runlevel-based init and service supervisor")]
struct Args {
    /// Run in the foreground, without PID 1 responsibilities
    #[arg(long, short = 'f')]
    foreground: bool,

    /// Configuration directory
    #[arg(long, default_value = CONF_DIR)]
    conf_dir: PathBuf,

    /// Condition store directory
    #[arg(long, default_value = COND_DIR)]
    cond_dir: PathBuf,

    /// Control socket path
    #[arg(long, default_value = SOCKET_PATH)]
    socket: PathBuf,

    /// Runlevel to enter after bootstrap, overriding the configuration
    #[arg(long)]
    runlevel: Option<u8>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let is_pid1 = pid1::is_pid1();
    if is_pid1 {
        if let Err(e) = pid1::init() {
            // Keep going; some mounts may have succeeded
            log::error!("PID 1 initialization failed: {}", e);
        }
    }

    let mut sup = Supervisor::new(&args.conf_dir, &args.cond_dir);
    sup.set_verbose(args.foreground);
    sup.set_console(is_pid1);

    // Base filesystems are up; conditions become usable from here on
    sup.conds_mut().set_available(true);
    sup.run_hook(HookPoint::BasefsUp);

    if let Some(level) = args.runlevel {
        sup.set_default_runlevel(level);
    }

    match sup.load_config() {
        Ok(count) => info!("Loaded {} services from {}", count, args.conf_dir.display()),
        Err(e) => log::error!("Cannot load {}: {}", args.conf_dir.display(), e),
    }

    let mut signals = SignalHandler::new()?;

    // Stale socket from a previous run
    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)?;
    info!("servd listening on {}", args.socket.display());

    sup.bootstrap();
    sup.tick(Instant::now());

    // Main loop: every wakeup is converted into a synchronous tick
    let kind = loop {
        if let Some(kind) = sup.halting() {
            break kind;
        }

        let deadline = sup.next_deadline();
        tokio::select! {
            sig = signals.wait() => sup.handle_signal(sig),
            conn = listener.accept() => match conn {
                Ok((stream, _)) => handle_connection(&mut sup, stream).await,
                Err(e) => log::error!("accept error: {}", e),
            },
            _ = sleep_until_deadline(deadline) => {}
        }
        sup.tick(Instant::now());
    };

    // Drain services with a global deadline, then finalize
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while !sup.teardown_complete() && Instant::now() < deadline {
        tokio::select! {
            sig = signals.wait() => sup.handle_signal(sig),
            _ = tokio::time::sleep(Duration::from_millis(100)) => sup.collect(),
        }
        sup.tick(Instant::now());
    }
    if !sup.teardown_complete() {
        log::warn!("Shutdown grace period expired with services still up");
    }

    if is_pid1 {
        pid1::finalize(kind);
    }

    info!("Not PID 1, exiting instead of {}", kind.as_str());
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// One request, one response per connection
async fn handle_connection(sup: &mut Supervisor, mut stream: UnixStream) {
    let request: Request = match protocol::recv(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            log::debug!("Bad control request: {}", e);
            return;
        }
    };

    log::debug!("Control request: {:?}", request);
    let response = sup.handle_request(request);
    if let Err(e) = protocol::send(&mut stream, &response).await {
        log::debug!("Control response failed: {}", e);
    }
}
