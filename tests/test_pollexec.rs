/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! End-to-end test of the poll-directory daemon.
//!
//! Everything runs in a single test function: the reaper waits on any
//! child of the process, so two daemons in concurrently running tests
//! would steal each other's children.

use anyhow::Result;
use flowkit::daemon::{run, PollExecConfig, PollExecStats};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixture {
    incoming: PathBuf,
    error: PathBuf,
    archive: PathBuf,
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<Result<PollExecStats>>,
}

fn start_daemon(root: &Path, command: &str, timeouts: Vec<(i32, u64)>) -> Fixture {
    let incoming = root.join("incoming");
    let error = root.join("error");
    let archive = root.join("archive");
    std::fs::create_dir_all(&incoming).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let config = PollExecConfig {
        incoming_dir: incoming.clone(),
        error_dir: error.clone(),
        archive_dir: Some(archive.clone()),
        flat_archive: true,
        command: command.to_owned(),
        simultaneous: 2,
        timeouts,
        polling_interval: Duration::from_millis(100),
        shell: Some(PathBuf::from("/bin/sh")),
        stop: stop.clone(),
        ..Default::default()
    };
    let handle = std::thread::spawn(move || run(config));
    Fixture {
        incoming,
        error,
        archive,
        stop,
        handle,
    }
}

fn wait_until(what: &str, deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(
            start.elapsed() < deadline,
            "timed out waiting for {}",
            what
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_pollexec_dispositions() {
    let dir = tempfile::tempdir().unwrap();

    // Success: the file ends up in the archive, exactly once.
    {
        let fixture = start_daemon(&dir.path().join("ok"), "test -f %s", Vec::new());
        std::fs::write(fixture.incoming.join("good"), b"payload").unwrap();
        let archived = fixture.archive.join("good");
        wait_until("archive disposition", Duration::from_secs(20), || {
            archived.exists()
        });
        assert!(!fixture.incoming.join("good").exists());
        assert!(!fixture.error.join("good").exists());
        fixture.stop.store(true, Ordering::Relaxed);
        let stats = fixture.handle.join().unwrap().unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.errored, 0);
    }

    // Failure: the file moves to the error directory, not the archive.
    {
        let fixture = start_daemon(&dir.path().join("bad"), "exit 1 # %s", Vec::new());
        std::fs::write(fixture.incoming.join("doomed"), b"payload").unwrap();
        let quarantined = fixture.error.join("doomed");
        wait_until("error disposition", Duration::from_secs(20), || {
            quarantined.exists()
        });
        assert!(!fixture.archive.join("doomed").exists());
        fixture.stop.store(true, Ordering::Relaxed);
        let stats = fixture.handle.join().unwrap().unwrap();
        assert_eq!(stats.errored, 1);
    }

    // Hidden files are never picked up.
    {
        let fixture = start_daemon(&dir.path().join("hidden"), "test -f %s", Vec::new());
        std::fs::write(fixture.incoming.join(".hidden"), b"payload").unwrap();
        std::fs::write(fixture.incoming.join("visible"), b"payload").unwrap();
        wait_until("visible file", Duration::from_secs(20), || {
            fixture.archive.join("visible").exists()
        });
        assert!(fixture.incoming.join(".hidden").exists());
        fixture.stop.store(true, Ordering::Relaxed);
        let stats = fixture.handle.join().unwrap().unwrap();
        assert_eq!(stats.dispatched, 1);
    }

    // Escalation: a hanging command is terminated by the timer, the file
    // is quarantined, and the later SIGKILL stage never has to fire (the
    // daemon would otherwise not stop for another 30 seconds).
    {
        let started = Instant::now();
        let fixture = start_daemon(
            &dir.path().join("hang"),
            "sleep 600 # %s",
            vec![(libc::SIGTERM, 1), (libc::SIGKILL, 30)],
        );
        std::fs::write(fixture.incoming.join("stuck"), b"payload").unwrap();
        let quarantined = fixture.error.join("stuck");
        wait_until("escalation disposition", Duration::from_secs(20), || {
            quarantined.exists()
        });
        fixture.stop.store(true, Ordering::Relaxed);
        let stats = fixture.handle.join().unwrap().unwrap();
        assert_eq!(stats.errored, 1);
        assert!(
            started.elapsed() < Duration::from_secs(25),
            "the SIGTERM stage should have settled this long before SIGKILL"
        );
    }
}
