/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The poll-directory daemon.
//!
//! Four kinds of threads cooperate: a *poller* watches the incoming
//! directory and queues files once their size is stable across two scans;
//! a *dispatcher* pops queued files, blocks on the command-slot free list,
//! and spawns the configured command with `%s` replaced by the file path;
//! a *reaper* collects children, settles the file's disposition (archive
//! on exit 0, error directory otherwise) and returns the slot; and one
//! short-lived *timer* thread per running command delivers the configured
//! signal escalation unless the reaper wakes it first.
//!
//! Lock order: the slot free-list mutex is never taken while holding a
//! per-command gate, only the reverse.

use crate::shutdown;
use anyhow::{ensure, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub mod archive;
pub mod shell;

use archive::{move_file, ArchiveFiler};

/// Upper bound on `--simultaneous`.
pub const MAX_SIMULTANEOUS: usize = 50;
/// Default directory poll interval, in seconds.
pub const DEFAULT_POLL_INTERVAL: u64 = 15;
/// Granularity of interruptible sleeps.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PollExecConfig {
    pub incoming_dir: PathBuf,
    pub error_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub flat_archive: bool,
    /// Command template; `%s` is replaced by the file path.
    pub command: String,
    pub post_archive_command: Option<String>,
    /// Parallel command slots, 1..=[`MAX_SIMULTANEOUS`].
    pub simultaneous: usize,
    /// Signal escalation: `(signal, seconds)` pairs, each delay measured
    /// from the previous signal.
    pub timeouts: Vec<(i32, u64)>,
    pub polling_interval: Duration,
    /// Shell to run commands with; probed when absent.
    pub shell: Option<PathBuf>,
    /// Local stop flag, checked alongside the process shutdown flag.
    pub stop: Arc<AtomicBool>,
}

impl Default for PollExecConfig {
    fn default() -> Self {
        PollExecConfig {
            incoming_dir: PathBuf::new(),
            error_dir: PathBuf::new(),
            archive_dir: None,
            flat_archive: false,
            command: String::new(),
            post_archive_command: None,
            simultaneous: 1,
            timeouts: Vec::new(),
            polling_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL),
            shell: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Counters reported when the daemon stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollExecStats {
    pub dispatched: u64,
    pub archived: u64,
    pub errored: u64,
}

/// The command-slot free list. Fork failures permanently shrink `total`.
struct SlotPool {
    free: usize,
    total: usize,
}

/// Wakes a command's timer thread when the child has been reaped.
struct TimerGate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl TimerGate {
    fn new() -> Arc<Self> {
        Arc::new(TimerGate {
            done: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Sleeps up to `delay`, returning early (true) if the child exited.
    fn wait(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut done = self.done.lock().unwrap();
        loop {
            if *done {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
    }

    fn open(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

struct Running {
    path: PathBuf,
    gate: Arc<TimerGate>,
}

struct Daemon {
    config: PollExecConfig,
    shell: PathBuf,
    filer: ArchiveFiler,
    slots: Mutex<SlotPool>,
    slots_cv: Condvar,
    running: Mutex<HashMap<i32, Running>>,
    dispatch_done: AtomicBool,
    stats: Mutex<PollExecStats>,
}

impl Daemon {
    fn stopping(&self) -> bool {
        shutdown::requested() || self.config.stop.load(Ordering::Relaxed)
    }
}

/// Runs the daemon until a termination signal (or the config's stop flag)
/// and every outstanding child has been collected.
pub fn run(config: PollExecConfig) -> Result<PollExecStats> {
    ensure!(
        (1..=MAX_SIMULTANEOUS).contains(&config.simultaneous),
        "--simultaneous must be between 1 and {}",
        MAX_SIMULTANEOUS
    );
    ensure!(
        config.command.contains("%s"),
        "The command template must contain %s"
    );
    ensure!(
        config.incoming_dir.is_dir(),
        "Incoming directory {} does not exist",
        config.incoming_dir.display()
    );
    std::fs::create_dir_all(&config.error_dir).with_context(|| {
        format!(
            "Could not create error directory {}",
            config.error_dir.display()
        )
    })?;
    let shell = match &config.shell {
        Some(shell) => shell.clone(),
        None => shell::select_shell()?,
    };
    log::info!(
        "Watching {} with {} slot(s)",
        config.incoming_dir.display(),
        config.simultaneous
    );
    let filer = ArchiveFiler::new(
        config.archive_dir.clone(),
        config.flat_archive,
        config.post_archive_command.clone(),
        shell.clone(),
    );
    let daemon = Daemon {
        slots: Mutex::new(SlotPool {
            free: config.simultaneous,
            total: config.simultaneous,
        }),
        slots_cv: Condvar::new(),
        running: Mutex::new(HashMap::new()),
        dispatch_done: AtomicBool::new(false),
        stats: Mutex::new(PollExecStats::default()),
        shell,
        filer,
        config,
    };

    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::scope(|scope| {
        scope.spawn(|| poller(&daemon, tx));
        scope.spawn(|| dispatcher(&daemon, rx, scope));
        scope.spawn(|| reaper(&daemon));
    });
    let stats = *daemon.stats.lock().unwrap();
    log::info!(
        "Stopped: {} dispatched, {} archived, {} errored",
        stats.dispatched,
        stats.archived,
        stats.errored
    );
    Ok(stats)
}

/// Scans the incoming directory and queues files whose size is unchanged
/// between two consecutive scans. Hidden files are skipped; a queued file
/// is not offered again.
fn poller(daemon: &Daemon, tx: Sender<PathBuf>) {
    #[derive(PartialEq)]
    enum State {
        Seen(u64),
        Queued,
    }
    let mut known: HashMap<PathBuf, State> = HashMap::new();
    while !daemon.stopping() {
        let mut present = Vec::new();
        match std::fs::read_dir(&daemon.config.incoming_dir) {
            Err(err) => log::warn!(
                "Could not scan {}: {}",
                daemon.config.incoming_dir.display(),
                err
            ),
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let hidden = path
                        .file_name()
                        .is_some_and(|name| name.to_string_lossy().starts_with('.'));
                    let Ok(meta) = entry.metadata() else { continue };
                    if hidden || !meta.is_file() {
                        continue;
                    }
                    present.push(path.clone());
                    match known.get(&path) {
                        Some(State::Queued) => {}
                        Some(State::Seen(size)) if *size == meta.len() => {
                            log::debug!("Queueing {}", path.display());
                            if tx.send(path.clone()).is_err() {
                                return;
                            }
                            known.insert(path, State::Queued);
                        }
                        _ => {
                            known.insert(path, State::Seen(meta.len()));
                        }
                    }
                }
            }
        }
        // Forget files that moved away so a same-named future file is new.
        known.retain(|path, _| present.contains(path));
        sleep_interruptible(daemon, daemon.config.polling_interval);
    }
}

fn sleep_interruptible(daemon: &Daemon, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !daemon.stopping() {
        std::thread::sleep(TICK.min(deadline - Instant::now()));
    }
}

/// Pops queued files, waits for a free command slot, and spawns the
/// command. A failed spawn permanently forfeits the slot and requeues the
/// file for another attempt.
fn dispatcher<'scope>(
    daemon: &'scope Daemon,
    rx: Receiver<PathBuf>,
    scope: &'scope std::thread::Scope<'scope, '_>,
) {
    let mut retry: VecDeque<PathBuf> = VecDeque::new();
    loop {
        let path = match retry.pop_front() {
            Some(path) => path,
            None => match rx.recv_timeout(TICK) {
                Ok(path) => path,
                Err(RecvTimeoutError::Timeout) => {
                    if daemon.stopping() {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };
        if daemon.stopping() {
            break;
        }
        if !acquire_slot(daemon) {
            break;
        }
        spawn_command(daemon, path, &mut retry, scope);
    }
    daemon.dispatch_done.store(true, Ordering::Release);
}

/// Blocks until a slot is free; false when stopping or when every slot
/// has been forfeited.
fn acquire_slot(daemon: &Daemon) -> bool {
    let mut slots = daemon.slots.lock().unwrap();
    loop {
        if slots.total == 0 {
            log::error!("Every command slot was lost to spawn failures; stopping");
            return false;
        }
        if slots.free > 0 {
            slots.free -= 1;
            return true;
        }
        if daemon.stopping() {
            return false;
        }
        let (guard, _) = daemon.slots_cv.wait_timeout(slots, TICK).unwrap();
        slots = guard;
    }
}

fn spawn_command<'scope>(
    daemon: &'scope Daemon,
    path: PathBuf,
    retry: &mut VecDeque<PathBuf>,
    scope: &'scope std::thread::Scope<'scope, '_>,
) {
    let command = daemon.config.command.replace("%s", &path.display().to_string());
    // Holding the running map across the spawn keeps the reaper from
    // seeing an exited child before its entry exists.
    let mut running = daemon.running.lock().unwrap();
    match Command::new(&daemon.shell).arg("-c").arg(&command).spawn() {
        Ok(child) => {
            let pid = child.id() as i32;
            log::info!("[{}] running {:?}", pid, command);
            let gate = TimerGate::new();
            running.insert(
                pid,
                Running {
                    path,
                    gate: gate.clone(),
                },
            );
            drop(running);
            daemon.stats.lock().unwrap().dispatched += 1;
            if !daemon.config.timeouts.is_empty() {
                let timeouts = daemon.config.timeouts.clone();
                scope.spawn(move || timer(pid, timeouts, gate));
            }
        }
        Err(err) => {
            drop(running);
            log::error!("Could not spawn {:?}: {}; slot forfeited", command, err);
            let mut slots = daemon.slots.lock().unwrap();
            slots.total -= 1;
            retry.push_back(path);
        }
    }
}

/// Delivers the escalation chain to one child, unless the gate opens
/// first. Each delay is measured from the previous signal.
fn timer(pid: i32, timeouts: Vec<(i32, u64)>, gate: Arc<TimerGate>) {
    for (signal, delay) in timeouts {
        if gate.wait(Duration::from_secs(delay)) {
            return;
        }
        log::info!("[{}] sending signal {} after {}s", pid, signal, delay);
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

/// Collects children, settles each file's disposition, wakes the matching
/// timer, and returns the slot. Runs until the dispatcher is done and no
/// child is outstanding.
fn reaper(daemon: &Daemon) {
    loop {
        if daemon.running.lock().unwrap().is_empty() {
            if daemon.dispatch_done.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(TICK);
            continue;
        }
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid <= 0 {
            std::thread::sleep(TICK);
            continue;
        }
        let Some(entry) = daemon.running.lock().unwrap().remove(&pid) else {
            // Not one of ours (e.g. a probe leftover).
            continue;
        };
        entry.gate.open();
        let success = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
        settle(daemon, &entry.path, success);
        let mut slots = daemon.slots.lock().unwrap();
        slots.free += 1;
        drop(slots);
        daemon.slots_cv.notify_one();
    }
}

/// Exactly one disposition per file: archive (or delete) on success, the
/// error directory otherwise.
fn settle(daemon: &Daemon, path: &Path, success: bool) {
    if success {
        match daemon.filer.file(path, None) {
            Ok(Some(to)) => log::info!("Archived {} as {}", path.display(), to.display()),
            Ok(None) => log::info!("Removed {}", path.display()),
            Err(err) => log::error!("Could not archive {}: {}", path.display(), err),
        }
        daemon.stats.lock().unwrap().archived += 1;
    } else {
        let destination = daemon
            .config
            .error_dir
            .join(path.file_name().unwrap_or_default());
        match move_file(path, &destination) {
            Ok(()) => log::info!("Moved {} to {}", path.display(), destination.display()),
            Err(err) => log::error!("Could not move {} aside: {}", path.display(), err),
        }
        daemon.stats.lock().unwrap().errored += 1;
    }
}
