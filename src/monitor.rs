// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Session monitor: watches the heartbeat counter of a session and reclaims
// every shared object once the participants are dead or unresponsive. Runs
// as the stand-alone `fmq-shmmonitor` process, but the cleanup sweeps are
// plain functions so the last-out factory can perform the final sweep
// without a monitor.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::common::{DEFAULT_MONITOR_INTERVAL_MS, DEFAULT_MONITOR_TIMEOUT_MS};
use crate::errors::{Error, Result};
use crate::management::{ManagementSegment, MAX_REGIONS, MAX_SEGMENTS};
use crate::platform::{NamedMutex, ShmMapping};
use crate::queue::BlockQueue;
use crate::shm_id::{shm_name, shm_name_id};

use crate::common::FIRST_REGION_ID;

/// Behavior flags and intervals of a monitor instance.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Exit after the session has been cleaned once.
    pub self_destruct: bool,
    /// Periodically log a status line.
    pub interactive: bool,
    /// Observe only, never clean.
    pub view_only: bool,
    /// Started detached from a controlling terminal.
    pub run_as_daemon: bool,
    /// Sweep the session objects when the monitor exits.
    pub clean_on_exit: bool,
    /// Heartbeat stasis window after which the session is declared dead.
    pub timeout_ms: u64,
    /// Main loop period.
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            self_destruct: false,
            interactive: false,
            view_only: false,
            run_as_daemon: false,
            clean_on_exit: false,
            timeout_ms: DEFAULT_MONITOR_TIMEOUT_MS,
            interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
        }
    }
}

/// Monitor of one session's shared memory objects.
pub struct Monitor {
    shm_id: String,
    config: MonitorConfig,
    presence: Option<NamedMutex>,
    control_queue: Option<BlockQueue>,
    seen_once: bool,
    last_heartbeat_value: u64,
    last_heartbeat_at: Instant,
    device_heartbeats: HashMap<String, Instant>,
    terminating: Arc<AtomicBool>,
}

impl Monitor {
    /// Create the monitor and advertise its presence. Fails when another
    /// monitor already owns the presence mutex for this session.
    pub fn new(shm_id: &str, config: MonitorConfig) -> Result<Self> {
        let presence = NamedMutex::create_exclusive(&shm_name(shm_id, "ms")).map_err(|e| {
            Error::Transport(format!(
                "cannot advertise monitor for shm id {shm_id}, already running? ({e})"
            ))
        })?;
        let control_queue = BlockQueue::open_or_create(&shm_name(shm_id, "cq"), 256, 64).ok();

        Ok(Self {
            shm_id: shm_id.to_string(),
            config,
            presence: Some(presence),
            control_queue,
            seen_once: false,
            last_heartbeat_value: 0,
            last_heartbeat_at: Instant::now(),
            device_heartbeats: HashMap::new(),
            terminating: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the run loop; hand it to a signal handler.
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminating)
    }

    /// Main loop: poll the session heartbeat every `interval_ms`, reclaim
    /// everything once it stalls for longer than `timeout_ms`.
    pub fn run(&mut self) {
        info!(
            "monitoring shared memory id {} (timeout {} ms, interval {} ms{})",
            self.shm_id,
            self.config.timeout_ms,
            self.config.interval_ms,
            if self.config.view_only { ", view only" } else { "" }
        );

        while !self.terminating.load(Ordering::Acquire) {
            self.drain_control_queue();
            self.check_heartbeats();
            thread::sleep(Duration::from_millis(self.config.interval_ms));
        }

        if self.config.clean_on_exit && !self.config.view_only {
            cleanup_full(&self.shm_id, true);
        }
    }

    fn drain_control_queue(&mut self) {
        let Some(queue) = &self.control_queue else {
            return;
        };
        let mut buf = [0u8; 64];
        while let Some(n) = queue.timed_receive(&mut buf, 0) {
            let device = String::from_utf8_lossy(&buf[..n]).into_owned();
            self.device_heartbeats.insert(device, Instant::now());
        }
    }

    fn check_heartbeats(&mut self) {
        match ManagementSegment::open_existing(&shm_name(&self.shm_id, "mng")) {
            Ok(mgmt) => {
                let value = mgmt.heartbeat();
                if !self.seen_once || value != self.last_heartbeat_value {
                    self.seen_once = true;
                    self.last_heartbeat_value = value;
                    self.last_heartbeat_at = Instant::now();
                }

                if self.config.interactive {
                    debug!(
                        "shm id {}: heartbeat {}, devices {}, known device ids {}",
                        self.shm_id,
                        value,
                        mgmt.device_count(),
                        self.device_heartbeats.len()
                    );
                }

                let stale = self.last_heartbeat_at.elapsed()
                    >= Duration::from_millis(self.config.timeout_ms);
                if stale {
                    if self.config.view_only {
                        warn!(
                            "session {} looks dead (no heartbeat for {} ms), view only mode, not cleaning",
                            self.shm_id, self.config.timeout_ms
                        );
                        self.last_heartbeat_at = Instant::now();
                        return;
                    }
                    warn!(
                        "no heartbeat from session {} within {} ms, cleaning up",
                        self.shm_id, self.config.timeout_ms
                    );
                    drop(mgmt);
                    self.cleanup_session();
                }
            }
            Err(_) => {
                if self.seen_once && self.config.self_destruct {
                    debug!(
                        "management segment for {} is gone, self-destructing",
                        self.shm_id
                    );
                    self.terminating.store(true, Ordering::Release);
                }
            }
        }
    }

    fn cleanup_session(&mut self) {
        // The full sweep removes the presence mutex and control queue as
        // well; recreate them unless this monitor is about to exit.
        self.control_queue = None;
        self.presence = None;
        cleanup_full(&self.shm_id, true);

        self.seen_once = false;
        self.device_heartbeats.clear();

        if self.config.self_destruct {
            self.terminating.store(true, Ordering::Release);
        } else {
            self.presence = NamedMutex::create_exclusive(&shm_name(&self.shm_id, "ms")).ok();
            self.control_queue =
                BlockQueue::open_or_create(&shm_name(&self.shm_id, "cq"), 256, 64).ok();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // Withdraw the presence advertisement so a later monitor can take
        // over the session.
        self.control_queue = None;
        if self.presence.take().is_some() {
            NamedMutex::remove(&shm_name(&self.shm_id, "ms"));
            BlockQueue::remove(&shm_name(&self.shm_id, "cq"));
        }
    }
}

// ---------------------------------------------------------------------------
// Cleanup sweeps, callable without a monitor instance.
// ---------------------------------------------------------------------------

fn record(results: &mut Vec<(String, bool)>, name: String, removed: bool, verbose: bool) {
    if verbose {
        if removed {
            println!("Removed '{name}'");
        } else {
            println!("Did not remove '{name}' (not found)");
        }
    } else {
        debug!("cleanup: {name} {}", if removed { "removed" } else { "not found" });
    }
    results.push((name, removed));
}

/// Remove every shared object created by the devices of a session: managed
/// segments, the management segment, unmanaged regions with their queues
/// and refcount segments, and the session mutex.
pub fn cleanup(shm_id: &str, verbose: bool) -> Vec<(String, bool)> {
    let mut results = Vec::new();

    // Enumerate through the registries while the management segment is
    // still there; fall back to a sweep over the default id ranges.
    match ManagementSegment::open_existing(&shm_name(shm_id, "mng")) {
        Ok(mgmt) => {
            for (id, _) in mgmt.segments() {
                let name = shm_name_id(shm_id, "m", id);
                let removed = ShmMapping::unlink(&name);
                record(&mut results, name, removed, verbose);
            }
            for (id, rec) in mgmt.regions() {
                let name = shm_name_id(shm_id, "rg", id);
                if let Some(dir) = &rec.path {
                    let path = dir.join(&name);
                    let removed = ShmMapping::remove_file(&path);
                    record(&mut results, path.display().to_string(), removed, verbose);
                } else {
                    let removed = ShmMapping::unlink(&name);
                    record(&mut results, name, removed, verbose);
                }
                let queue_name = shm_name_id(shm_id, "rgq", id);
                let removed = BlockQueue::remove(&queue_name);
                record(&mut results, queue_name, removed, verbose);
                let rc_name = shm_name_id(shm_id, "rrc", id);
                let removed = ShmMapping::unlink(&rc_name);
                record(&mut results, rc_name, removed, verbose);
            }
        }
        Err(_) => {
            for id in 0..MAX_SEGMENTS as u16 {
                let name = shm_name_id(shm_id, "m", id);
                let removed = ShmMapping::unlink(&name);
                if removed {
                    record(&mut results, name, removed, verbose);
                }
            }
            for id in 0..MAX_REGIONS as u16 {
                let rid = FIRST_REGION_ID as u16 + id;
                for suffix in ["rg", "rgq", "rrc"] {
                    let name = shm_name_id(shm_id, suffix, rid);
                    let removed = ShmMapping::unlink(&name);
                    if removed {
                        record(&mut results, name, removed, verbose);
                    }
                }
            }
        }
    }

    let name = shm_name(shm_id, "mng");
    let removed = ShmMapping::unlink(&name);
    record(&mut results, name, removed, verbose);

    let name = shm_name(shm_id, "mtx");
    let removed = NamedMutex::remove(&name);
    record(&mut results, name, removed, verbose);

    // The control queue is fed by the device heartbeat threads.
    let name = shm_name(shm_id, "cq");
    let removed = BlockQueue::remove(&name);
    record(&mut results, name, removed, verbose);

    results
}

/// `cleanup` plus the monitor's own presence mutex.
pub fn cleanup_full(shm_id: &str, verbose: bool) -> Vec<(String, bool)> {
    let mut results = cleanup(shm_id, verbose);

    let name = shm_name(shm_id, "ms");
    let removed = NamedMutex::remove(&name);
    record(&mut results, name, removed, verbose);

    results
}

/// Remove a single named shm object.
pub fn remove_object(name: &str) -> bool {
    ShmMapping::unlink(name)
}

/// Remove a file mapping.
pub fn remove_file_mapping(path: &Path) -> bool {
    ShmMapping::remove_file(path)
}

/// Remove a named queue.
pub fn remove_queue(name: &str) -> bool {
    BlockQueue::remove(name)
}

/// Remove a named mutex.
pub fn remove_mutex(name: &str) -> bool {
    NamedMutex::remove(name)
}

// ---------------------------------------------------------------------------
// Monitor autolaunch used by the factory.
// ---------------------------------------------------------------------------

const MONITOR_WAIT_STEP_MS: u64 = 10;
const MONITOR_WAIT_TRIES: u32 = 1000;

fn monitor_binary() -> Command {
    if let Ok(path) = std::env::var("FMQ_SHMMONITOR") {
        return Command::new(path);
    }
    // Prefer a sibling of the running binary, fall back to PATH.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("fmq-shmmonitor");
            if sibling.is_file() {
                return Command::new(sibling);
            }
        }
    }
    Command::new("fmq-shmmonitor")
}

/// Ensure a monitor runs for `shm_id`: spawn `fmq-shmmonitor` when no
/// presence mutex exists, then wait for it to come up (~10 s).
pub fn start_monitor(shm_id: &str) -> Result<()> {
    if NamedMutex::exists(&shm_name(shm_id, "ms")) {
        debug!("found fmq-shmmonitor for shared memory id {shm_id}");
        return Ok(());
    }

    debug!("no fmq-shmmonitor found for shared memory id {shm_id}, starting...");
    let mut command = monitor_binary();
    command
        .arg("--shmid")
        .arg(shm_id)
        .arg("--self-destruct")
        .arg("--daemonize");
    command.spawn().map_err(|e| {
        error!("could not spawn fmq-shmmonitor: {e}");
        Error::Transport(format!("could not spawn fmq-shmmonitor: {e}"))
    })?;

    for _ in 0..MONITOR_WAIT_TRIES {
        if NamedMutex::exists(&shm_name(shm_id, "ms")) {
            debug!("started fmq-shmmonitor for shared memory id {shm_id}");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(MONITOR_WAIT_STEP_MS));
    }

    Err(Error::Transport(format!(
        "did not get response from fmq-shmmonitor after {} ms",
        MONITOR_WAIT_STEP_MS * MONITOR_WAIT_TRIES as u64
    )))
}
