// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stand-alone monitor for shared memory sessions.
//
// Usage:
//   fmq-shmmonitor --shmid <id> [--session <name>] [--self-destruct]
//                  [--interactive] [--view-only] [--daemonize]
//                  [--cleanup-on-exit] [--cleanup] [--timeout <ms>]
//                  [--interval <ms>]
//
// Watches the session's heartbeat counter and removes every fmq_<id>_*
// object once the participants are dead or unresponsive. With --cleanup
// it sweeps immediately and exits.

use std::sync::atomic::Ordering;
use std::sync::{Mutex, OnceLock};

use libfmq::monitor::{cleanup_full, Monitor, MonitorConfig};
use libfmq::shm_id::build_shm_id;

struct Args {
    shm_id: Option<String>,
    session: Option<String>,
    cleanup_now: bool,
    config: MonitorConfig,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        shm_id: None,
        session: None,
        cleanup_now: false,
        config: MonitorConfig::default(),
    };

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "--shmid" => {
                i += 1;
                args.shm_id = Some(argv.get(i).ok_or("--shmid needs a value")?.clone());
            }
            "--session" => {
                i += 1;
                args.session = Some(argv.get(i).ok_or("--session needs a value")?.clone());
            }
            "--self-destruct" | "-x" => args.config.self_destruct = true,
            "--interactive" | "-i" => args.config.interactive = true,
            "--view-only" | "-v" => args.config.view_only = true,
            "--daemonize" | "-d" => args.config.run_as_daemon = true,
            "--cleanup-on-exit" => args.config.clean_on_exit = true,
            "--cleanup" | "-c" => args.cleanup_now = true,
            "--timeout" | "-t" => {
                i += 1;
                args.config.timeout_ms = argv
                    .get(i)
                    .ok_or("--timeout needs a value")?
                    .parse()
                    .map_err(|_| "--timeout needs a number of milliseconds")?;
            }
            "--interval" => {
                i += 1;
                args.config.interval_ms = argv
                    .get(i)
                    .ok_or("--interval needs a value")?
                    .parse()
                    .map_err(|_| "--interval needs a number of milliseconds")?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }
    Ok(args)
}

fn print_help() {
    eprintln!("usage: fmq-shmmonitor --shmid <id> | --session <name> [options]");
    eprintln!("  --self-destruct    exit after the session has been cleaned once");
    eprintln!("  --interactive      log a periodic status line");
    eprintln!("  --view-only        observe, never clean");
    eprintln!("  --daemonize        run detached");
    eprintln!("  --cleanup-on-exit  sweep the session objects on exit");
    eprintln!("  --cleanup          sweep immediately and exit");
    eprintln!("  --timeout <ms>     heartbeat stasis window (default 2000)");
    eprintln!("  --interval <ms>    loop period (default 100)");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("fmq-shmmonitor: {e}");
            print_help();
            std::process::exit(1);
        }
    };

    let shm_id = match (&args.shm_id, &args.session) {
        (Some(id), _) => id.clone(),
        (None, Some(session)) => build_shm_id(session),
        (None, None) => {
            eprintln!("fmq-shmmonitor: either --shmid or --session is required");
            print_help();
            std::process::exit(1);
        }
    };

    if args.cleanup_now {
        cleanup_full(&shm_id, true);
        return;
    }

    let mut monitor = match Monitor::new(&shm_id, args.config) {
        Ok(monitor) => monitor,
        Err(e) => {
            eprintln!("fmq-shmmonitor: {e}");
            std::process::exit(1);
        }
    };

    install_signal_hook(monitor.terminate_flag());
    monitor.run();
}

// Minimal signal hook: sets the terminate flag on SIGINT / SIGTERM.
fn install_signal_hook(flag: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    static FLAG: OnceLock<Mutex<std::sync::Arc<std::sync::atomic::AtomicBool>>> = OnceLock::new();
    FLAG.get_or_init(|| Mutex::new(flag));
    extern "C" fn handler(_: libc::c_int) {
        if let Some(flag) = FLAG.get() {
            if let Ok(flag) = flag.lock() {
                flag.store(true, Ordering::Release);
            }
        }
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
    }
}
