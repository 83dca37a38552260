use std::io::Write;
use std::sync::Arc;

use log::{debug, warn};

use crate::protocol::encode_notification;
use crate::session::{SessionState, SessionTable, MAX_SESSIONS};
use crate::store::UpdateListener;

/// Routes store mutations to subscribed sessions.
///
/// Registered with the store at boot as its [`UpdateListener`]; the
/// store stays ignorant of sessions and pipes. Each delivery is one
/// 80-byte write, which is under `PIPE_BUF` and therefore atomic, so
/// records from concurrent mutators never interleave within a session.
pub struct Notifier {
    sessions: Arc<SessionTable>,
}

impl Notifier {
    /// Creates a notifier fanning out to `sessions`.
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Notifier { sessions }
    }
}

enum Delivery {
    NotSubscribed,
    Sent,
    Failed(u64),
}

impl UpdateListener for Notifier {
    fn key_updated(&self, key: &str, value: &str) {
        let record = encode_notification(key, value);
        for idx in 0..MAX_SESSIONS {
            if self.sessions.state(idx) != SessionState::Active {
                continue;
            }
            let outcome = self.sessions.with_content(idx, |content| {
                if !content.subscriptions.iter().any(|k| k == key) {
                    return Delivery::NotSubscribed;
                }
                match &mut content.pipes {
                    Some(pipes) => match pipes.notif.write_all(&record) {
                        Ok(()) => Delivery::Sent,
                        Err(_) => Delivery::Failed(content.generation),
                    },
                    None => Delivery::NotSubscribed,
                }
            });
            match outcome {
                Delivery::NotSubscribed => {}
                Delivery::Sent => debug!("session {idx}: notified {key}"),
                Delivery::Failed(generation) => {
                    // The client is gone; the notification is dropped
                    // and the mutation stands.
                    warn!("session {idx}: notification undeliverable, dropping session");
                    self.sessions.release_if(idx, generation);
                }
            }
        }
    }
}
