//! Wire protocol shared by server and clients.
//!
//! Every record is byte-exact: one ASCII op-code byte followed by
//! fixed-width fields padded with spaces to [`MAX_STRING_SIZE`] bytes.
//! Records are smaller than `PIPE_BUF`, so a single `write` to a FIFO
//! carries a whole record atomically.

use crate::{KvsError, Result};

/// Maximum length, in bytes, of a key, a value, or a client pipe path.
pub const MAX_STRING_SIZE: usize = 40;

/// Length of a CONNECT record: op-code plus three padded pipe paths.
pub const CONNECT_RECORD_LEN: usize = 1 + 3 * MAX_STRING_SIZE;

/// Length of a notification record: padded key plus padded value.
pub const NOTIFICATION_LEN: usize = 2 * MAX_STRING_SIZE;

/// Length of a reply record: op-code echo plus status byte.
pub const REPLY_LEN: usize = 2;

/// Value field sent in place of a real value when a key is deleted.
pub const TOMBSTONE: &str = "DELETED";

/// Status byte for a successful operation.
pub const STATUS_OK: u8 = b'0';

/// Status byte for a refused operation.
pub const STATUS_ERR: u8 = b'1';

/// Op-codes used on the rendezvous and request pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Synthetic reply sent when the server drops a session.
    Dropped = b'0',
    /// Client connection record on the rendezvous FIFO.
    Connect = b'1',
    /// Session teardown request.
    Disconnect = b'2',
    /// Subscribe to change notifications for one key.
    Subscribe = b'3',
    /// Remove a subscription.
    Unsubscribe = b'4',
}

impl OpCode {
    /// Maps a raw byte back to an op-code.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'0' => Ok(OpCode::Dropped),
            b'1' => Ok(OpCode::Connect),
            b'2' => Ok(OpCode::Disconnect),
            b'3' => Ok(OpCode::Subscribe),
            b'4' => Ok(OpCode::Unsubscribe),
            other => Err(KvsError::UnknownOpCode(other)),
        }
    }
}

/// Writes `src` into a fixed-width field, space-padded.
///
/// Input longer than the field is truncated; the wire layer never
/// rejects oversize strings, it cuts them to `MAX_STRING_SIZE` bytes.
pub fn pad_field(dst: &mut [u8], src: &str) {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
    dst[len..].fill(b' ');
}

/// Recovers a string from a fixed-width field, stripping the padding.
///
/// Trailing spaces are not representable in field values; they belong
/// to the padding and are removed. Non-UTF-8 bytes are rejected.
pub fn trim_field(field: &[u8]) -> Result<String> {
    let end = field
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |pos| pos + 1);
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| KvsError::Protocol("field is not valid UTF-8"))
}

/// The 121-byte CONNECT record a client writes to the rendezvous FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Path of the client's request FIFO.
    pub req_path: String,
    /// Path of the client's response FIFO.
    pub resp_path: String,
    /// Path of the client's notification FIFO.
    pub notif_path: String,
}

impl ConnectRequest {
    /// Encodes the record, truncating each path to the field width.
    pub fn encode(&self) -> [u8; CONNECT_RECORD_LEN] {
        let mut record = [0u8; CONNECT_RECORD_LEN];
        record[0] = OpCode::Connect as u8;
        pad_field(&mut record[1..1 + MAX_STRING_SIZE], &self.req_path);
        pad_field(
            &mut record[1 + MAX_STRING_SIZE..1 + 2 * MAX_STRING_SIZE],
            &self.resp_path,
        );
        pad_field(&mut record[1 + 2 * MAX_STRING_SIZE..], &self.notif_path);
        record
    }

    /// Decodes a full CONNECT record.
    pub fn decode(record: &[u8; CONNECT_RECORD_LEN]) -> Result<Self> {
        if record[0] != OpCode::Connect as u8 {
            return Err(KvsError::UnknownOpCode(record[0]));
        }
        Ok(ConnectRequest {
            req_path: trim_field(&record[1..1 + MAX_STRING_SIZE])?,
            resp_path: trim_field(&record[1 + MAX_STRING_SIZE..1 + 2 * MAX_STRING_SIZE])?,
            notif_path: trim_field(&record[1 + 2 * MAX_STRING_SIZE..])?,
        })
    }
}

/// A request read from a session's request FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `'2'`: tear the session down.
    Disconnect,
    /// `'3' key[40]`: subscribe to a key.
    Subscribe(String),
    /// `'4' key[40]`: unsubscribe from a key.
    Unsubscribe(String),
}

impl Request {
    /// Encodes the request into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Disconnect => vec![OpCode::Disconnect as u8],
            Request::Subscribe(key) | Request::Unsubscribe(key) => {
                let mut record = vec![0u8; 1 + MAX_STRING_SIZE];
                record[0] = match self {
                    Request::Subscribe(_) => OpCode::Subscribe as u8,
                    _ => OpCode::Unsubscribe as u8,
                };
                pad_field(&mut record[1..], key);
                record
            }
        }
    }

    /// Op-code echoed back in the reply to this request.
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Disconnect => OpCode::Disconnect,
            Request::Subscribe(_) => OpCode::Subscribe,
            Request::Unsubscribe(_) => OpCode::Unsubscribe,
        }
    }
}

/// Encodes the 2-byte reply: op-code echo plus status.
pub fn encode_reply(op: OpCode, ok: bool) -> [u8; REPLY_LEN] {
    [op as u8, if ok { STATUS_OK } else { STATUS_ERR }]
}

/// Encodes an 80-byte notification record.
pub fn encode_notification(key: &str, value: &str) -> [u8; NOTIFICATION_LEN] {
    let mut record = [0u8; NOTIFICATION_LEN];
    pad_field(&mut record[..MAX_STRING_SIZE], key);
    pad_field(&mut record[MAX_STRING_SIZE..], value);
    record
}

/// Decodes an 80-byte notification record into `(key, value)`.
pub fn decode_notification(record: &[u8; NOTIFICATION_LEN]) -> Result<(String, String)> {
    Ok((
        trim_field(&record[..MAX_STRING_SIZE])?,
        trim_field(&record[MAX_STRING_SIZE..])?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_and_trim_round_trip() {
        let mut field = [0u8; MAX_STRING_SIZE];
        pad_field(&mut field, "alpha");
        assert_eq!(&field[..5], b"alpha");
        assert!(field[5..].iter().all(|&b| b == b' '));
        assert_eq!(trim_field(&field).unwrap(), "alpha");
    }

    #[test]
    fn oversize_input_is_truncated() {
        let long = "k".repeat(MAX_STRING_SIZE + 7);
        let mut field = [0u8; MAX_STRING_SIZE];
        pad_field(&mut field, &long);
        assert_eq!(trim_field(&field).unwrap(), "k".repeat(MAX_STRING_SIZE));
    }

    #[test]
    fn connect_record_round_trip() {
        let req = ConnectRequest {
            req_path: "/tmp/c1.req".to_owned(),
            resp_path: "/tmp/c1.resp".to_owned(),
            notif_path: "/tmp/c1.notif".to_owned(),
        };
        let record = req.encode();
        assert_eq!(record.len(), CONNECT_RECORD_LEN);
        assert_eq!(record[0], b'1');
        assert_eq!(ConnectRequest::decode(&record).unwrap(), req);
    }

    #[test]
    fn request_wire_forms() {
        assert_eq!(Request::Disconnect.encode(), vec![b'2']);

        let sub = Request::Subscribe("k".to_owned()).encode();
        assert_eq!(sub.len(), 1 + MAX_STRING_SIZE);
        assert_eq!(sub[0], b'3');
        assert_eq!(sub[1], b'k');
        assert_eq!(sub[2], b' ');

        let unsub = Request::Unsubscribe("k".to_owned()).encode();
        assert_eq!(unsub[0], b'4');
    }

    #[test]
    fn notification_round_trip() {
        let record = encode_notification("door", "open");
        assert_eq!(record.len(), NOTIFICATION_LEN);
        assert_eq!(decode_notification(&record).unwrap(), ("door".to_owned(), "open".to_owned()));
    }

    #[test]
    fn tombstone_looks_like_a_plain_value() {
        // A client cannot tell a delete from a write of the literal
        // string "DELETED"; the wire format does not distinguish them.
        let record = encode_notification("k", TOMBSTONE);
        assert_eq!(decode_notification(&record).unwrap().1, TOMBSTONE);
    }

    #[test]
    fn reply_encoding() {
        assert_eq!(encode_reply(OpCode::Subscribe, true), [b'3', b'0']);
        assert_eq!(encode_reply(OpCode::Connect, false), [b'1', b'1']);
    }

    #[test]
    fn unknown_op_code_is_rejected() {
        assert!(matches!(
            OpCode::from_byte(b'9'),
            Err(KvsError::UnknownOpCode(b'9'))
        ));
    }
}
