//! SIGUSR1 drops every live session but leaves the server accepting.
//!
//! Kept in its own test binary: the signal is sent to the whole test
//! process.

use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

use pipekv::{KvsClient, KvsError, Server, ServerConfig};

#[test]
fn sigusr1_drops_sessions_but_not_the_listener() {
    let dir = TempDir::new().unwrap();
    let jobs = dir.path().join("jobs");
    std::fs::create_dir(&jobs).unwrap();
    let pipe_name = format!("test_sig_{}", std::process::id());

    let server = Server::bind(ServerConfig {
        jobs_dir: jobs,
        max_threads: 1,
        max_backups: 1,
        pipe_name: pipe_name.clone(),
    })
    .unwrap();
    server.serve_sessions();

    server
        .store()
        .write(&[("k".to_owned(), "v".to_owned())])
        .unwrap();

    let mut victim = KvsClient::connect(
        &pipe_name,
        dir.path().join("v.req"),
        dir.path().join("v.resp"),
        dir.path().join("v.notif"),
    )
    .unwrap();
    let mut notifications = victim.take_notifications().unwrap();
    victim.subscribe("k").unwrap();

    // The handler only sets a flag; the hostess consumes it on its
    // next wake-up, which the follow-up connect provides.
    kill(Pid::this(), Signal::SIGUSR1).unwrap();
    thread::sleep(Duration::from_millis(200));

    let survivor = KvsClient::connect(
        &pipe_name,
        dir.path().join("s.req"),
        dir.path().join("s.resp"),
        dir.path().join("s.notif"),
    )
    .unwrap();

    // The victim's pipes were unlinked and its notification stream
    // ended; its next request fails fast.
    assert_eq!(notifications.next_record().unwrap(), None);
    assert!(matches!(
        victim.subscribe("k"),
        Err(KvsError::SessionClosed | KvsError::Io(_))
    ));

    // New sessions are fully functional.
    survivor.subscribe("k").unwrap();
    survivor.disconnect().unwrap();
    server.shutdown();
}
