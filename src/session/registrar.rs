use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use super::{Pipes, SessionState, SessionTable, MAX_SESSIONS};
use crate::protocol::{encode_reply, ConnectRequest, OpCode, CONNECT_RECORD_LEN};
use crate::{fifo, Result};

/// Set by the SIGUSR1 handler; the hostess consumes it between
/// blocking reads on the rendezvous FIFO.
static DROP_ALL: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    DROP_ALL.store(true, Ordering::Relaxed);
}

/// Installs process-wide signal dispositions.
///
/// SIGUSR1 only sets a flag; teardown runs on the hostess thread.
/// SIGPIPE is ignored so a gone peer surfaces as `EPIPE` on write.
pub(crate) fn install_signal_handlers() -> Result<()> {
    let usr1 = SigAction::new(
        SigHandler::Handler(on_sigusr1),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let pipe = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGUSR1, &usr1)?;
        sigaction(Signal::SIGPIPE, &pipe)?;
    }
    Ok(())
}

/// Blocks SIGUSR1 on the calling thread.
///
/// Called on the boot thread before anything else is spawned, so
/// every worker inherits the mask and only the hostess (which
/// unblocks it) takes delivery.
pub(crate) fn mask_sigusr1() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGUSR1);
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;
    Ok(())
}

fn unmask_sigusr1() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGUSR1);
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)?;
    Ok(())
}

/// Spawns the hostess thread servicing the rendezvous FIFO.
pub(crate) fn spawn_hostess(rendezvous: PathBuf, table: Arc<SessionTable>) {
    thread::Builder::new()
        .name("hostess".to_owned())
        .spawn(move || hostess_loop(&rendezvous, &table))
        .expect("failed to spawn hostess thread");
}

/// Accept loop: read CONNECT records, register clients, honor SIGUSR1.
///
/// The read end is reopened after every EOF (all clients closed their
/// write ends); a blocking open or read interrupted by SIGUSR1 falls
/// through to the flag check.
fn hostess_loop(rendezvous: &Path, table: &Arc<SessionTable>) {
    if let Err(e) = unmask_sigusr1() {
        error!("hostess: failed to unblock SIGUSR1: {e}");
    }
    info!("hostess: accepting connections on {}", rendezvous.display());

    loop {
        if DROP_ALL.swap(false, Ordering::Relaxed) {
            drop_all_sessions(table);
        }
        let fd = match fifo::open_read_raw(rendezvous) {
            Ok(fd) => fd,
            Err(Errno::EINTR) => continue,
            Err(Errno::ENOENT) => {
                // Shutdown unlinked the rendezvous FIFO.
                debug!("hostess: rendezvous pipe is gone, exiting");
                return;
            }
            Err(e) => {
                error!("hostess: failed to open rendezvous pipe: {e}");
                return;
            }
        };

        loop {
            if DROP_ALL.swap(false, Ordering::Relaxed) {
                drop_all_sessions(table);
            }
            let mut record = [0u8; CONNECT_RECORD_LEN];
            match fifo::read_record(&fd, &mut record) {
                Ok(true) => handle_connect(table, &record),
                Ok(false) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("hostess: rendezvous read failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Registers one client from a CONNECT record.
fn handle_connect(table: &SessionTable, record: &[u8; CONNECT_RECORD_LEN]) {
    let request = match ConnectRequest::decode(record) {
        Ok(request) => request,
        Err(e) => {
            warn!("hostess: rejecting connect record: {e}");
            return;
        }
    };
    if request.req_path.is_empty() || request.notif_path.is_empty() {
        warn!("hostess: connect record with empty pipe paths");
        refuse(&request.resp_path);
        return;
    }
    if request.resp_path.is_empty() {
        warn!("hostess: connect record with no response pipe");
        return;
    }

    // Blocks while all slots are occupied; the connecting client waits.
    let idx = table.claim();

    let resp_path = PathBuf::from(&request.resp_path);
    let mut resp = match fifo::open_write(&resp_path) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("hostess: failed to open response pipe of new client: {e}");
            table.set_state(idx, SessionState::Free);
            return;
        }
    };
    if let Err(e) = resp.write_all(&encode_reply(OpCode::Connect, true)) {
        warn!("hostess: failed to acknowledge connect: {e}");
        table.set_state(idx, SessionState::Free);
        return;
    }
    drop(resp);

    // The client opens its notification read end right after the
    // acknowledgement; this open rendezvouses with it.
    let notif_path = PathBuf::from(&request.notif_path);
    let notif = match fifo::open_write(&notif_path) {
        Ok(notif) => notif,
        Err(e) => {
            warn!("hostess: failed to open notification pipe of new client: {e}");
            table.set_state(idx, SessionState::Free);
            return;
        }
    };

    table.activate(
        idx,
        Pipes {
            req_path: PathBuf::from(&request.req_path),
            resp_path,
            notif_path,
            notif,
        },
    );
    info!("session {idx}: client registered");
}

/// Best-effort refusal when the CONNECT record itself is unusable.
fn refuse(resp_path: &str) {
    if let Ok(mut resp) = fifo::try_open_write(Path::new(resp_path)) {
        let _ = resp.write_all(&encode_reply(OpCode::Connect, false));
    }
}

/// SIGUSR1 teardown: every non-FREE slot is dropped.
///
/// For each slot: a synthetic `('0','0')` reply is pushed at the
/// response FIFO if the client is listening, the slot is freed (which
/// closes the notification write end), the request FIFO is poked so a
/// worker blocked in `open` wakes to EOF, and only then are the
/// client's pipes unlinked. New connects keep working; the rendezvous
/// FIFO is untouched.
fn drop_all_sessions(table: &SessionTable) {
    info!("dropping all sessions");
    for idx in 0..MAX_SESSIONS {
        if table.state(idx) == SessionState::Free {
            continue;
        }
        let snapshot = table.with_content(idx, |c| {
            c.pipes.as_ref().map(|p| {
                (
                    c.generation,
                    p.req_path.clone(),
                    p.resp_path.clone(),
                    p.notif_path.clone(),
                )
            })
        });
        let Some((generation, req_path, resp_path, notif_path)) = snapshot else {
            continue;
        };

        if let Ok(mut resp) = fifo::try_open_write(&resp_path) {
            let _ = resp.write_all(&encode_reply(OpCode::Dropped, true));
        }

        // Free first: the slot's worker can no longer tear down a
        // session that has already moved on, and the release pokes a
        // worker blocked in open(req). The paths must still exist for
        // that poke, so unlinking comes last.
        if !table.release_if(idx, generation) {
            continue;
        }
        for path in [&req_path, &resp_path, &notif_path] {
            if let Err(e) = fifo::remove(path) {
                warn!("failed to unlink client pipe {}: {e}", path.display());
            }
        }
        debug!("session {idx}: dropped");
    }
}
