//! The wire protocol shared by clients and replicas: a fixed set of tagged
//! text fields, serialized as `` key:value `` tokens joined by backticks and
//! framed on the stream by a decimal ASCII length prefix.
//!
//! Example frame for a `view` request:
//!
//! ```text
//! 31`0:v`2:8`3:c17`4:Harvard University`
//! ```
//!
//! Backtick is the token separator and therefore must not appear inside any
//! field value; callers validate user input before it reaches [`Message`].

use parking_lot::Mutex;
use std::fmt::{self, Display, Formatter};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use thiserror::Error;

/// Result type for transport and codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors surfaced by the transport and the codec.
///
/// Callers never retry: a client converts any of these into replica demotion,
/// while a replica converts them into an implicit quit for the offending
/// connection.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer shut the connection down cleanly.
    #[error("connection closed by peer")]
    Closed,

    /// The connection broke mid-stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame or field that does not follow the protocol.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// The nine transaction codes understood by both sides.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Transaction {
    /// Connection handshake carrying the client id.
    Init,
    /// A no-op request broadcast periodically so every client keeps
    /// contributing a head to each replica's stability test.
    Dummy,
    /// List every site.
    List,
    /// View one site's availability.
    View,
    /// Edit one site's availability.
    Edit,
    /// Add a new site.
    New,
    /// Client is disconnecting.
    Quit,
    /// Per-request acknowledgment from a replica.
    Ack,
    /// Failure notice from a replica that has been disabled.
    Failure,
}

impl Transaction {
    /// The single-letter wire code.
    pub fn code(self) -> char {
        match self {
            Transaction::Init => 'i',
            Transaction::Dummy => 'd',
            Transaction::List => 'l',
            Transaction::View => 'v',
            Transaction::Edit => 'e',
            Transaction::New => 'n',
            Transaction::Quit => 'q',
            Transaction::Ack => 'k',
            Transaction::Failure => 'f',
        }
    }

    /// Parses a wire code. Unknown codes are a protocol error.
    pub fn from_code(code: &str) -> Option<Transaction> {
        match code {
            "i" => Some(Transaction::Init),
            "d" => Some(Transaction::Dummy),
            "l" => Some(Transaction::List),
            "v" => Some(Transaction::View),
            "e" => Some(Transaction::Edit),
            "n" => Some(Transaction::New),
            "q" => Some(Transaction::Quit),
            "k" => Some(Transaction::Ack),
            "f" => Some(Transaction::Failure),
            _ => None,
        }
    }

    /// Whether this transaction mutates or reads the application database.
    pub fn is_application(self) -> bool {
        matches!(
            self,
            Transaction::List | Transaction::View | Transaction::Edit | Transaction::New
        )
    }
}

impl Display for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// Field key codes. `transaction` is the only field present in every message.
const KEY_TRANSACTION: &str = "0";
const KEY_LCLOCK: &str = "1";
const KEY_RSEQNO: &str = "2";
const KEY_CLIENT_ID: &str = "3";
const KEY_SITE_NAME: &str = "4";
const KEY_VACCINE_NO: &str = "5";
const KEY_ZIP_CODE: &str = "6";
const KEY_OUTPUT_MSG: &str = "7";

/// One protocol message: a transaction code plus whichever fields that
/// transaction carries. Absent fields are simply not encoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub transaction: Transaction,
    /// Sender's logical clock at send time.
    pub lclock: Option<u64>,
    /// The broadcasting client's logical clock at broadcast time; the order
    /// protocol's sort key.
    pub rseqno: Option<u64>,
    pub client_id: Option<String>,
    pub site_name: Option<String>,
    pub vaccine_no: Option<String>,
    pub zip_code: Option<String>,
    pub output_msg: Option<String>,
}

impl Message {
    /// Constructs a message with no fields beyond the transaction code.
    pub fn new(transaction: Transaction) -> Self {
        Message {
            transaction,
            lclock: None,
            rseqno: None,
            client_id: None,
            site_name: None,
            vaccine_no: None,
            zip_code: None,
            output_msg: None,
        }
    }

    /// A `list` request.
    pub fn list() -> Self {
        Message::new(Transaction::List)
    }

    /// A `view` request for one site.
    pub fn view(site_name: impl Into<String>) -> Self {
        let mut msg = Message::new(Transaction::View);
        msg.site_name = Some(site_name.into());
        msg
    }

    /// An `edit` request setting one site's availability.
    pub fn edit(site_name: impl Into<String>, vaccine_no: impl Into<String>) -> Self {
        let mut msg = Message::new(Transaction::Edit);
        msg.site_name = Some(site_name.into());
        msg.vaccine_no = Some(vaccine_no.into());
        msg
    }

    /// A `new` request registering a site.
    pub fn new_site(site_name: impl Into<String>, zip_code: impl Into<String>) -> Self {
        let mut msg = Message::new(Transaction::New);
        msg.site_name = Some(site_name.into());
        msg.zip_code = Some(zip_code.into());
        msg
    }

    /// Serializes to the backtick token format (without the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        let mut push = |key: &str, value: &str| {
            debug_assert!(!value.contains('`'), "`` ` `` is the token separator");
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push('`');
        };

        push(KEY_TRANSACTION, &self.transaction.code().to_string());
        if let Some(v) = self.lclock {
            push(KEY_LCLOCK, &v.to_string());
        }
        if let Some(v) = self.rseqno {
            push(KEY_RSEQNO, &v.to_string());
        }
        if let Some(v) = &self.client_id {
            push(KEY_CLIENT_ID, v);
        }
        if let Some(v) = &self.site_name {
            push(KEY_SITE_NAME, v);
        }
        if let Some(v) = &self.vaccine_no {
            push(KEY_VACCINE_NO, v);
        }
        if let Some(v) = &self.zip_code {
            push(KEY_ZIP_CODE, v);
        }
        if let Some(v) = &self.output_msg {
            push(KEY_OUTPUT_MSG, v);
        }
        out.into_bytes()
    }

    /// Parses the backtick token format. Field order does not matter; the
    /// transaction field is mandatory.
    pub fn decode(payload: &[u8]) -> WireResult<Message> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| WireError::Malformed(format!("payload is not UTF-8: {e}")))?;

        let mut transaction = None;
        let mut msg = Message::new(Transaction::Dummy); // placeholder until the 0 key is seen
        for token in text.split('`') {
            if token.is_empty() {
                continue; // the trailing separator
            }
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| WireError::Malformed(format!("token without separator: {token:?}")))?;
            match key {
                KEY_TRANSACTION => {
                    transaction = Some(Transaction::from_code(value).ok_or_else(|| {
                        WireError::Malformed(format!("unknown transaction code: {value:?}"))
                    })?);
                }
                KEY_LCLOCK => msg.lclock = Some(parse_decimal("lclock", value)?),
                KEY_RSEQNO => msg.rseqno = Some(parse_decimal("rseqno", value)?),
                KEY_CLIENT_ID => msg.client_id = Some(value.to_owned()),
                KEY_SITE_NAME => msg.site_name = Some(value.to_owned()),
                KEY_VACCINE_NO => msg.vaccine_no = Some(value.to_owned()),
                KEY_ZIP_CODE => msg.zip_code = Some(value.to_owned()),
                KEY_OUTPUT_MSG => msg.output_msg = Some(value.to_owned()),
                _ => return Err(WireError::Malformed(format!("unknown field key: {key:?}"))),
            }
        }

        msg.transaction =
            transaction.ok_or_else(|| WireError::Malformed("missing transaction field".into()))?;
        Ok(msg)
    }
}

/// A reliable, ordered, bidirectional message channel over one TCP stream.
///
/// Writes are serialized by an internal lock so any task holding a reference
/// can send; receives are single-consumer by convention (one receiver task
/// per channel) but locked as well so misuse cannot interleave frames.
pub struct Channel {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    peer: SocketAddr,
}

impl Channel {
    /// Wraps an established stream.
    pub fn new(stream: TcpStream) -> WireResult<Channel> {
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        Ok(Channel {
            reader: Mutex::new(reader),
            writer: Mutex::new(stream),
            peer,
        })
    }

    /// Connects to a peer.
    pub fn connect(addr: impl ToSocketAddrs) -> WireResult<Channel> {
        Channel::new(TcpStream::connect(addr)?)
    }

    /// The remote address, for logging.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Frames and sends one message. Blocks; mutually exclusive with other
    /// senders on the same channel.
    pub fn send(&self, msg: &Message) -> WireResult<()> {
        let payload = msg.encode();
        let mut frame = payload.len().to_string().into_bytes();
        frame.push(b'`');
        frame.extend_from_slice(&payload);

        let mut writer = self.writer.lock();
        writer.write_all(&frame)?;
        Ok(())
    }

    /// Receives and decodes one message. Blocks until a full frame arrives.
    pub fn recv(&self) -> WireResult<Message> {
        let payload = {
            let mut reader = self.reader.lock();

            // The length prefix has no fixed width, so it is read one byte at
            // a time up to the backtick delimiter.
            let mut digits = Vec::new();
            loop {
                let mut byte = [0u8; 1];
                if reader.read(&mut byte)? == 0 {
                    return Err(WireError::Closed);
                }
                if byte[0] == b'`' {
                    break;
                }
                digits.push(byte[0]);
            }
            let len: usize = std::str::from_utf8(&digits)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    WireError::Malformed(format!(
                        "frame length is not a decimal: {:?}",
                        String::from_utf8_lossy(&digits)
                    ))
                })?;

            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    WireError::Closed
                } else {
                    WireError::Io(e)
                }
            })?;
            payload
        };
        Message::decode(&payload)
    }

    /// Closes both directions. Errors are ignored; the peer observes
    /// [`WireError::Closed`] on its next receive.
    pub fn shutdown(&self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("peer", &self.peer).finish()
    }
}

fn parse_decimal(field: &str, value: &str) -> WireResult<u64> {
    value
        .parse()
        .map_err(|_| WireError::Malformed(format!("{field} is not a decimal: {value:?}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn encodes_in_key_value_token_format() {
        let mut msg = Message::view("Harvard University");
        msg.rseqno = Some(8);
        msg.client_id = Some("c17".to_owned());
        assert_eq!(
            String::from_utf8(msg.encode()).unwrap(),
            "0:v`2:8`3:c17`4:Harvard University`"
        );
    }

    #[test]
    fn decodes_regardless_of_field_order() {
        let msg = Message::decode(b"3:c17`2:8`0:v`4:Harvard University`").unwrap();
        assert_eq!(msg.transaction, Transaction::View);
        assert_eq!(msg.rseqno, Some(8));
        assert_eq!(msg.client_id.as_deref(), Some("c17"));
        assert_eq!(msg.site_name.as_deref(), Some("Harvard University"));
        assert_eq!(msg.lclock, None);
    }

    #[test]
    fn round_trips_every_field() {
        let mut msg = Message::new(Transaction::Edit);
        msg.lclock = Some(42);
        msg.rseqno = Some(41);
        msg.client_id = Some("20210401120000".to_owned());
        msg.site_name = Some("MIT".to_owned());
        msg.vaccine_no = Some("True".to_owned());
        msg.zip_code = Some("02138".to_owned());
        msg.output_msg = Some("line one\nline two".to_owned());
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn rejects_protocol_errors() {
        // Unknown transaction code.
        assert!(matches!(
            Message::decode(b"0:x`"),
            Err(WireError::Malformed(_))
        ));
        // Non-decimal rseqno.
        assert!(matches!(
            Message::decode(b"0:d`2:abc`"),
            Err(WireError::Malformed(_))
        ));
        // Missing transaction.
        assert!(matches!(
            Message::decode(b"1:3`"),
            Err(WireError::Malformed(_))
        ));
        // Token without the key/value separator.
        assert!(matches!(
            Message::decode(b"0:d`garbage`"),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn frames_across_a_real_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let chan = Channel::new(stream).unwrap();
            let first = chan.recv().unwrap();
            let second = chan.recv().unwrap();
            chan.send(&second).unwrap();
            (first, chan)
        });

        let chan = Channel::connect(addr).unwrap();
        let mut init = Message::new(Transaction::Init);
        init.lclock = Some(0);
        init.client_id = Some("c1".to_owned());
        chan.send(&init).unwrap();
        let view = Message::view("Site with spaces");
        chan.send(&view).unwrap();

        let (received_init, server_chan) = server.join().unwrap();
        assert_eq!(received_init, init);
        assert_eq!(chan.recv().unwrap(), view);

        // A shutdown surfaces as `Closed`, not as a panic.
        server_chan.shutdown();
        assert!(matches!(chan.recv(), Err(WireError::Closed)));
    }
}
