use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};

use super::{SessionState, SessionTable, MAX_SESSIONS, MAX_SUBS_PER_SESSION};
use crate::protocol::{encode_reply, OpCode, Request, MAX_STRING_SIZE};
use crate::store::Store;
use crate::{fifo, KvsError, Result};

/// Spawns one worker thread per session slot.
pub(crate) fn spawn_workers(table: &Arc<SessionTable>, store: &Arc<Store>) {
    for idx in 0..MAX_SESSIONS {
        let table = table.clone();
        let store = store.clone();
        thread::Builder::new()
            .name(format!("session-{idx}"))
            .spawn(move || loop {
                table.wait_for_active(idx);
                serve_session(idx, &table, &store);
            })
            .expect("failed to spawn session worker");
    }
}

/// Serves one client on slot `idx` until it disconnects or fails.
fn serve_session(idx: usize, table: &SessionTable, store: &Store) {
    debug!("session {idx}: worker attached");
    loop {
        let Some((generation, req_path)) = table.with_content(idx, |c| {
            c.pipes
                .as_ref()
                .map(|p| (c.generation, p.req_path.clone()))
        }) else {
            return;
        };
        if table.state(idx) != SessionState::Active {
            return;
        }

        // One open/read per request: the client opens its request pipe,
        // writes one record and closes it again.
        let request = match read_request(&req_path) {
            Ok(request) => request,
            Err(e) => {
                debug!("session {idx}: dropping client: {e}");
                table.release_if(idx, generation);
                return;
            }
        };

        let (ok, disconnecting) = apply_request(idx, table, store, &request);

        if let Err(e) = send_reply(idx, table, request.op_code(), ok) {
            warn!("session {idx}: failed to reply: {e}");
            table.release_if(idx, generation);
            return;
        }

        if disconnecting {
            info!("session {idx}: client disconnected");
            table.release_if(idx, generation);
            return;
        }
    }
}

/// Reads one fixed-length request record from the request FIFO.
///
/// A short read means the peer violated the framing (or is gone); the
/// caller drains the session without replying.
fn read_request(req_path: &PathBuf) -> Result<Request> {
    let mut req = fifo::open_read(req_path)?;
    let mut op = [0u8; 1];
    read_exactly(&mut req, &mut op)?;
    match OpCode::from_byte(op[0])? {
        OpCode::Disconnect => Ok(Request::Disconnect),
        OpCode::Subscribe | OpCode::Unsubscribe => {
            let mut field = [0u8; MAX_STRING_SIZE];
            read_exactly(&mut req, &mut field)?;
            let key = crate::protocol::trim_field(&field)?;
            if op[0] == OpCode::Subscribe as u8 {
                Ok(Request::Subscribe(key))
            } else {
                Ok(Request::Unsubscribe(key))
            }
        }
        OpCode::Connect | OpCode::Dropped => Err(KvsError::UnknownOpCode(op[0])),
    }
}

fn read_exactly(file: &mut File, buf: &mut [u8]) -> Result<()> {
    file.read_exact(buf)
        .map_err(|_| KvsError::Protocol("short read on request record"))
}

/// Applies a request to the slot, returning `(status_ok, disconnecting)`.
pub(crate) fn apply_request(
    idx: usize,
    table: &SessionTable,
    store: &Store,
    request: &Request,
) -> (bool, bool) {
    match request {
        Request::Subscribe(key) => {
            // A subscription requires the key to exist in the store.
            if !store.check(key) {
                return (false, false);
            }
            let ok = table.with_content(idx, |c| {
                if c.subscriptions.iter().any(|k| k == key) {
                    true
                } else if c.subscriptions.len() >= MAX_SUBS_PER_SESSION {
                    false
                } else {
                    c.subscriptions.push(key.clone());
                    true
                }
            });
            (ok, false)
        }
        Request::Unsubscribe(key) => {
            let ok = table.with_content(idx, |c| {
                match c.subscriptions.iter().position(|k| k == key) {
                    Some(at) => {
                        c.subscriptions.remove(at);
                        true
                    }
                    None => false,
                }
            });
            (ok, false)
        }
        Request::Disconnect => {
            table.with_content(idx, |c| c.subscriptions.clear());
            table.set_state(idx, SessionState::Draining);
            (true, true)
        }
    }
}

/// Opens the response FIFO and writes the 2-byte reply.
fn send_reply(idx: usize, table: &SessionTable, op: OpCode, ok: bool) -> Result<()> {
    let Some(resp_path) = table.with_content(idx, |c| {
        c.pipes.as_ref().map(|p| p.resp_path.clone())
    }) else {
        return Err(KvsError::SessionClosed);
    };
    let mut resp = fifo::open_write(&resp_path)?;
    resp.write_all(&encode_reply(op, ok))?;
    Ok(())
}
