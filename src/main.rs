//! servd-conf - parse and display servd configuration files
//!
//! Offline syntax checker: parses a stanza file the way the daemon would
//! and prints what it understood, one block per record.

use std::path::PathBuf;

use clap::Parser;

use servd::conf::{parse_line, ConfItem};

#[derive(Parser)]
#[command(name = "servd-conf")]
#[command(about = "Check and display servd configuration files")]
struct Args {
    /// Path to a .conf file
    path: PathBuf,

    /// Only report errors, no dump
    #[arg(long, short = 'q')]
    quiet: bool,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let content = match std::fs::read_to_string(&args.path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("{}: {}", args.path.display(), e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let mut errors = 0;
    for (lineno, line) in content.lines().enumerate() {
        match parse_line(line) {
            Ok(None) => {}
            Ok(Some(item)) => {
                if !args.quiet {
                    display(&item);
                }
            }
            Err(e) => {
                errors += 1;
                eprintln!("{}:{}: {}", args.path.display(), lineno + 1, e);
            }
        }
    }

    if errors > 0 {
        eprintln!("{} error(s) in {}", errors, args.path.display());
        std::process::ExitCode::FAILURE
    } else {
        std::process::ExitCode::SUCCESS
    }
}

fn display(item: &ConfItem) {
    match item {
        ConfItem::Runlevel(level) => println!("runlevel {}\n", level),
        ConfItem::Rlimit(name, limit) => println!("rlimit {} = {}\n", name, limit),
        ConfItem::Stanza(s) => {
            println!("{} {}", s.kind.as_str(), s.cmd);
            if !s.args.is_empty() {
                println!("  args      = {}", s.args.join(" "));
            }
            if !s.instance.is_empty() {
                println!("  instance  = {}", s.instance);
            }
            if let Some(name) = &s.name {
                println!("  name      = {}", name);
            }
            println!("  runlevels = {}", s.runlevels);
            if !s.conds.is_empty() {
                println!("  condition = {}", s.conds.join(","));
            }
            if !s.sighup {
                println!("  reload    = stop/start (no SIGHUP)");
            }
            if let Some(user) = &s.username {
                match &s.group {
                    Some(group) => println!("  user      = {}:{}", user, group),
                    None => println!("  user      = {}", user),
                }
            }
            if let Some(sig) = s.sighalt {
                println!("  halt      = {}", sig);
            }
            if let Some(delay) = s.killdelay {
                println!("  kill      = {:?}", delay);
            }
            if let Some(env) = &s.env_file {
                println!(
                    "  env       = {}{}",
                    if env.required { "" } else { "-" },
                    env.path.display()
                );
            }
            if let Some(pidfile) = &s.pidfile {
                println!(
                    "  pidfile   = {}{}",
                    if pidfile.forking { "!" } else { "" },
                    pidfile.path.display()
                );
            }
            if s.manual {
                println!("  manual    = yes");
            }
            if let Some(tty) = &s.tty {
                println!("  tty       = {:?}", tty);
            }
            if !s.desc.is_empty() {
                println!("  descr     = {}", s.desc);
            }
            println!();
        }
    }
}
