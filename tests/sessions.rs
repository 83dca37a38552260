use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use pipekv::{KvsClient, KvsError, Result, Server, ServerConfig, SessionState, MAX_SESSIONS};

static NEXT_PIPE: AtomicUsize = AtomicUsize::new(0);

/// Boots a server with an empty job directory and live sessions.
fn boot(tag: &str) -> (Arc<Server>, TempDir, String) {
    let dir = TempDir::new().unwrap();
    let jobs = dir.path().join("jobs");
    std::fs::create_dir(&jobs).unwrap();
    let pipe_name = format!(
        "test_{}_{}_{}",
        tag,
        std::process::id(),
        NEXT_PIPE.fetch_add(1, Ordering::SeqCst)
    );
    let server = Server::bind(ServerConfig {
        jobs_dir: jobs,
        max_threads: 1,
        max_backups: 1,
        pipe_name: pipe_name.clone(),
    })
    .unwrap();
    server.serve_sessions();
    (server, dir, pipe_name)
}

fn pipe_set(dir: &TempDir, tag: &str) -> (PathBuf, PathBuf, PathBuf) {
    (
        dir.path().join(format!("{tag}.req")),
        dir.path().join(format!("{tag}.resp")),
        dir.path().join(format!("{tag}.notif")),
    )
}

fn connect(dir: &TempDir, pipe_name: &str, tag: &str) -> Result<KvsClient> {
    let (req, resp, notif) = pipe_set(dir, tag);
    KvsClient::connect(pipe_name, req, resp, notif)
}

fn seed(server: &Server, key: &str) {
    server
        .store()
        .write(&[(key.to_owned(), "seed".to_owned())])
        .unwrap();
}

#[test]
fn subscriber_sees_batch_writes_in_order() {
    let (server, dir, pipe_name) = boot("order");
    let mut client = connect(&dir, &pipe_name, "c").unwrap();
    let mut notifications = client.take_notifications().unwrap();

    seed(&server, "k");
    client.subscribe("k").unwrap();

    server
        .store()
        .write(&[
            ("k".to_owned(), "v1".to_owned()),
            ("k".to_owned(), "v2".to_owned()),
        ])
        .unwrap();

    assert_eq!(
        notifications.next_record().unwrap(),
        Some(("k".to_owned(), "v1".to_owned()))
    );
    assert_eq!(
        notifications.next_record().unwrap(),
        Some(("k".to_owned(), "v2".to_owned()))
    );
    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn deleting_an_absent_key_notifies_nobody() {
    let (server, dir, pipe_name) = boot("absent");
    let mut client = connect(&dir, &pipe_name, "c").unwrap();
    let mut notifications = client.take_notifications().unwrap();

    seed(&server, "watched");
    client.subscribe("watched").unwrap();

    // DELETE of a key that never existed must not produce a record;
    // the next record the client sees is the sentinel write.
    let mut out = Vec::new();
    server
        .store()
        .delete(&["watched_not".to_owned()], &mut out)
        .unwrap();
    assert_eq!(out, b"[(watched_not,KVSMISSING)]\n");

    server
        .store()
        .write(&[("watched".to_owned(), "sentinel".to_owned())])
        .unwrap();
    assert_eq!(
        notifications.next_record().unwrap(),
        Some(("watched".to_owned(), "sentinel".to_owned()))
    );
    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn unsubscribe_stops_the_stream() {
    let (server, dir, pipe_name) = boot("unsub");
    let mut client = connect(&dir, &pipe_name, "c").unwrap();
    let mut notifications = client.take_notifications().unwrap();

    seed(&server, "a");
    seed(&server, "b");
    client.subscribe("a").unwrap();
    client.subscribe("b").unwrap();
    client.unsubscribe("a").unwrap();

    server
        .store()
        .write(&[("a".to_owned(), "v".to_owned())])
        .unwrap();
    server
        .store()
        .write(&[("b".to_owned(), "v".to_owned())])
        .unwrap();

    // Only the still-subscribed key arrives.
    assert_eq!(
        notifications.next_record().unwrap(),
        Some(("b".to_owned(), "v".to_owned()))
    );
    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn server_refuses_what_the_protocol_says_it_must() {
    let (server, dir, pipe_name) = boot("refuse");
    let client = connect(&dir, &pipe_name, "c").unwrap();

    // Subscribing to an absent key is refused.
    assert!(matches!(
        client.subscribe("nothing_here"),
        Err(KvsError::Refused(_))
    ));
    // Unsubscribing a key that was never subscribed is refused.
    seed(&server, "real");
    assert!(matches!(
        client.unsubscribe("real"),
        Err(KvsError::Refused(_))
    ));
    // And the session still works afterwards.
    client.subscribe("real").unwrap();
    client.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn disconnect_frees_the_slot_for_the_next_client() {
    let (server, dir, pipe_name) = boot("reuse");
    seed(&server, "k");

    let mut first = connect(&dir, &pipe_name, "first").unwrap();
    let mut notifications = first.take_notifications().unwrap();
    first.subscribe("k").unwrap();
    first.disconnect().unwrap();

    // The notification pipe drains to EOF once the server lets go,
    // and the slot is FREE again.
    assert_eq!(notifications.next_record().unwrap(), None);
    assert!((0..MAX_SESSIONS).all(|idx| server.sessions().state(idx) == SessionState::Free));

    let second = connect(&dir, &pipe_name, "second").unwrap();
    second.subscribe("k").unwrap();

    // The first session's subscriptions died with it: only one record
    // per write may arrive, on the second client's pipe.
    server
        .store()
        .write(&[("k".to_owned(), "fresh".to_owned())])
        .unwrap();
    second.disconnect().unwrap();
    server.shutdown();
}

#[test]
fn connect_blocks_while_all_slots_are_taken() {
    let (server, dir, pipe_name) = boot("full");
    seed(&server, "k");

    let mut clients = Vec::new();
    for i in 0..MAX_SESSIONS {
        clients.push(connect(&dir, &pipe_name, &format!("c{i}")).unwrap());
    }

    let latecomer = {
        let (req, resp, notif) = pipe_set(&dir, "late");
        let pipe_name = pipe_name.clone();
        thread::spawn(move || KvsClient::connect(&pipe_name, req, resp, notif))
    };
    // The latecomer cannot finish its handshake while the table is full.
    thread::sleep(Duration::from_millis(300));
    assert!(!latecomer.is_finished());

    clients.pop().unwrap().disconnect().unwrap();
    let latecomer = latecomer.join().unwrap().unwrap();
    latecomer.disconnect().unwrap();
    for client in clients {
        client.disconnect().unwrap();
    }
    server.shutdown();
}
