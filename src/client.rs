use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::protocol::{
    ConnectRequest, OpCode, Request, NOTIFICATION_LEN, REPLY_LEN, STATUS_OK,
};
use crate::server::rendezvous_path;
use crate::{decode_notification, fifo, KvsError, Result, MAX_STRING_SIZE};

/// The client of a pipekv server.
///
/// Owns the three client-side FIFOs for one session. Every request is
/// one open-write-close on the request pipe followed by a 2-byte reply
/// on the response pipe, so at most one request is in flight.
pub struct KvsClient {
    req_path: PathBuf,
    resp_path: PathBuf,
    notif_path: PathBuf,
    notifications: Option<Notifications>,
}

/// Blocking reader over a session's notification pipe.
///
/// Split off the client with [`KvsClient::take_notifications`] so a
/// dedicated thread can consume records while requests continue.
pub struct Notifications {
    pipe: File,
}

impl Notifications {
    /// Reads the next `(key, value)` record.
    ///
    /// Returns `None` when the server closed the pipe (disconnect or
    /// session drop).
    pub fn next_record(&mut self) -> Result<Option<(String, String)>> {
        let mut record = [0u8; NOTIFICATION_LEN];
        match self.pipe.read_exact(&mut record) {
            Ok(()) => Ok(Some(decode_notification(&record)?)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn wire_path(path: &Path) -> Result<&str> {
    let text = path
        .to_str()
        .ok_or_else(|| KvsError::InvalidArgument("pipe path is not UTF-8".to_owned()))?;
    if text.is_empty() || text.len() > MAX_STRING_SIZE {
        return Err(KvsError::InvalidArgument(format!(
            "pipe path must be 1..={MAX_STRING_SIZE} bytes: {text}"
        )));
    }
    Ok(text)
}

impl KvsClient {
    /// Connects to the server listening on `/tmp/server_<pipe_name>`.
    ///
    /// Creates the three FIFOs (replacing stale ones), sends the
    /// CONNECT record and completes the reply handshake. The paths
    /// must fit the 40-byte wire fields.
    pub fn connect(
        pipe_name: &str,
        req_path: impl Into<PathBuf>,
        resp_path: impl Into<PathBuf>,
        notif_path: impl Into<PathBuf>,
    ) -> Result<KvsClient> {
        let req_path = req_path.into();
        let resp_path = resp_path.into();
        let notif_path = notif_path.into();

        let record = ConnectRequest {
            req_path: wire_path(&req_path)?.to_owned(),
            resp_path: wire_path(&resp_path)?.to_owned(),
            notif_path: wire_path(&notif_path)?.to_owned(),
        }
        .encode();

        let server_pipe = rendezvous_path(pipe_name);
        if !server_pipe.exists() {
            return Err(KvsError::SessionClosed);
        }

        fifo::create(&req_path)?;
        fifo::create(&resp_path)?;
        fifo::create(&notif_path)?;

        let mut server = fifo::open_write(&server_pipe)?;
        server.write_all(&record)?;
        drop(server);

        let reply = read_reply(&resp_path)?;
        if reply != [OpCode::Connect as u8, STATUS_OK] {
            return Err(KvsError::Refused("connect"));
        }
        debug!("connected to {}", server_pipe.display());

        // The server's registrar opens the notification write end
        // right after acknowledging; rendezvous with it.
        let pipe = fifo::open_read(&notif_path)?;

        Ok(KvsClient {
            req_path,
            resp_path,
            notif_path,
            notifications: Some(Notifications { pipe }),
        })
    }

    /// Hands out the notification reader. `None` after the first call.
    pub fn take_notifications(&mut self) -> Option<Notifications> {
        self.notifications.take()
    }

    /// Subscribes to change notifications for `key`.
    ///
    /// The server refuses keys absent from the store and sessions at
    /// their subscription cap.
    pub fn subscribe(&self, key: &str) -> Result<()> {
        self.request(&Request::Subscribe(key.to_owned()), "subscribe")
    }

    /// Removes the subscription for `key`.
    pub fn unsubscribe(&self, key: &str) -> Result<()> {
        self.request(&Request::Unsubscribe(key.to_owned()), "unsubscribe")
    }

    /// Ends the session and removes the client-owned FIFOs.
    pub fn disconnect(self) -> Result<()> {
        self.request(&Request::Disconnect, "disconnect")?;
        for path in [&self.req_path, &self.resp_path, &self.notif_path] {
            fifo::remove(path)?;
        }
        Ok(())
    }

    /// One request/reply round trip.
    fn request(&self, request: &Request, what: &'static str) -> Result<()> {
        // The server unlinks a dropped session's pipes; fail fast
        // instead of blocking on an open nobody will answer.
        if !self.req_path.exists() {
            return Err(KvsError::SessionClosed);
        }
        let mut req = fifo::open_write(&self.req_path)?;
        req.write_all(&request.encode())?;
        drop(req);

        let reply = read_reply(&self.resp_path)?;
        if reply[0] == OpCode::Dropped as u8 {
            return Err(KvsError::SessionClosed);
        }
        if reply[0] != request.op_code() as u8 {
            return Err(KvsError::Protocol("reply echoes a different op-code"));
        }
        if reply[1] != STATUS_OK {
            return Err(KvsError::Refused(what));
        }
        Ok(())
    }
}

fn read_reply(resp_path: &Path) -> Result<[u8; REPLY_LEN]> {
    if !resp_path.exists() {
        return Err(KvsError::SessionClosed);
    }
    let mut resp = fifo::open_read(resp_path)?;
    let mut reply = [0u8; REPLY_LEN];
    resp.read_exact(&mut reply)
        .map_err(|_| KvsError::Protocol("short read on reply record"))?;
    Ok(reply)
}
