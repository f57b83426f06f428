use std::fmt::{Debug, Formatter, Result};
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::error::FramingError;
use crate::pow;
use crate::wire::constants::{COMMAND_LEN, MAGIC};

/// A raw Bitmessage message frame.
///
/// A frame consists of:
/// - 4-byte magic value (network identifier)
/// - 12-byte command
/// - 4-byte payload length
/// - 4-byte checksum
/// - variable-length payload
///
/// Length and checksum are not stored: they are computed from `payload` when
/// the frame is encoded and verified against it when a frame is decoded, so a
/// `RawMessage` that exists is always internally consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub magic: u32,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Builds a frame for the main network.
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self {
            magic: MAGIC,
            command,
            payload,
        }
    }

    /// First 4 bytes of the double SHA-512 of the payload.
    pub fn checksum(&self) -> [u8; 4] {
        pow::checksum(&self.payload)
    }
}

/// Implemented by types that can be decoded from a raw message payload.
pub trait Decode: Sized {
    fn decode(payload: &[u8]) -> io::Result<Self>;
}

/// Implemented by types that can be appended to a message payload.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()>;
}

/// A decoded Bitmessage protocol message.
///
/// Each variant corresponds to a known command. Commands this node does not
/// know are kept as [`Message::Unknown`] so they can be logged or forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Addr(Vec<NetworkAddress>),
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    GetPubKey(Object),
    PubKey(Object),
    Msg(Object),
    Broadcast(Object),
    Unknown { command: String, payload: Vec<u8> },
}

impl TryFrom<RawMessage> for Message {
    type Error = io::Error;

    fn try_from(raw: RawMessage) -> io::Result<Self> {
        match raw.command {
            Command::Version => Ok(Message::Version(VersionMessage::decode(&raw.payload)?)),
            Command::Verack => Ok(Message::Verack),
            Command::Addr => Ok(Message::Addr(Vec::<NetworkAddress>::decode(&raw.payload)?)),
            Command::Inv => Ok(Message::Inv(Vec::<InventoryVector>::decode(&raw.payload)?)),
            Command::GetData => Ok(Message::GetData(Vec::<InventoryVector>::decode(
                &raw.payload,
            )?)),
            Command::GetPubKey => Ok(Message::GetPubKey(Object::decode(&raw.payload)?)),
            Command::PubKey => Ok(Message::PubKey(Object::decode(&raw.payload)?)),
            Command::Msg => Ok(Message::Msg(Object::decode(&raw.payload)?)),
            Command::Broadcast => Ok(Message::Broadcast(Object::decode_broadcast(&raw.payload)?)),
            Command::Unknown(command) => Ok(Message::Unknown {
                command,
                payload: raw.payload,
            }),
        }
    }
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Addr(_) => Command::Addr,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::GetPubKey(_) => Command::GetPubKey,
            Message::PubKey(_) => Command::PubKey,
            Message::Msg(_) => Command::Msg,
            Message::Broadcast(_) => Command::Broadcast,
            Message::Unknown { command, .. } => Command::Unknown(command.clone()),
        }
    }

    /// Serializes the payload and wraps it in a main network frame.
    ///
    /// Fails with `InvalidInput` when the command name does not fit the
    /// 12-byte command field.
    pub fn to_raw(&self) -> io::Result<RawMessage> {
        let command = self.command();
        if command.name().len() > COMMAND_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("command '{}' longer than {COMMAND_LEN} bytes", command.name()),
            ));
        }

        let mut payload = Vec::new();

        match self {
            Message::Version(v) => v.encode(&mut payload)?,
            Message::Verack => {}
            Message::Addr(list) => list.encode(&mut payload)?,
            Message::Inv(list) | Message::GetData(list) => list.encode(&mut payload)?,
            Message::GetPubKey(o)
            | Message::PubKey(o)
            | Message::Msg(o)
            | Message::Broadcast(o) => o.encode(&mut payload)?,
            Message::Unknown { payload: p, .. } => payload.extend_from_slice(p),
        }

        Ok(RawMessage::new(command, payload))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    // Handshake
    Version,
    Verack,
    // Peer and inventory exchange
    Addr,
    Inv,
    GetData,
    // Objects
    GetPubKey,
    PubKey,
    Msg,
    Broadcast,

    Unknown(String),
}

impl TryFrom<&[u8; 12]> for Command {
    type Error = FramingError;

    /// Parses the NUL-padded command field.
    ///
    /// Everything after the first NUL must be NUL as well, otherwise the
    /// whole message is rejected without looking at it further.
    fn try_from(field: &[u8; 12]) -> std::result::Result<Self, FramingError> {
        let end = field.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);

        if field[end..].iter().any(|&b| b != 0) {
            return Err(FramingError::BadPadding { field: *field });
        }

        let name = &field[..end];
        if name.is_empty() || !name.iter().all(u8::is_ascii_graphic) {
            return Err(FramingError::BadCommand { field: *field });
        }

        // ASCII checked above
        let name = String::from_utf8_lossy(name);

        Ok(match name.as_ref() {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "addr" => Command::Addr,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "getpubkey" => Command::GetPubKey,
            "pubkey" => Command::PubKey,
            "msg" => Command::Msg,
            "broadcast" => Command::Broadcast,
            _ => Command::Unknown(name.to_string()),
        })
    }
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::GetPubKey => "getpubkey",
            Command::PubKey => "pubkey",
            Command::Msg => "msg",
            Command::Broadcast => "broadcast",
            Command::Unknown(name) => name,
        }
    }

    /// Returns the 12-byte command field.
    ///
    /// The command string is ASCII and padded with zero bytes. Unknown names
    /// longer than the field are truncated.
    pub fn as_bytes(&self) -> [u8; 12] {
        let name = self.name().as_bytes();
        let len = name.len().min(COMMAND_LEN);

        let mut padded = [0u8; 12];
        padded[..len].copy_from_slice(&name[..len]);
        padded
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.name())
    }
}

/// Network address without time and stream, as embedded in `version`.
///
/// The IP is always 16 bytes on the wire; IPv4 peers are carried in the
/// IPv4-mapped range `::ffff:a.b.c.d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr {
    pub services: Services,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddr {
    pub fn from_socket_addr(services: Services, addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };

        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    /// The endpoint to dial. IPv4-mapped addresses come back as IPv4.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = match self.ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.ip),
        };
        SocketAddr::new(ip, self.port)
    }
}

/// A reachable peer endpoint as advertised in `addr` messages.
///
/// Carries no liveness guarantee: `time` is only the advertiser's claim of
/// when the node was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub time: u32,
    pub stream: u32,
    pub addr: NetAddr,
}

impl NetworkAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr.socket_addr()
    }
}

/// Sent by both sides right after a connection is established. Nothing else
/// is exchanged until both peers have seen each other's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: Services,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    /// The IP in this field is ignored by the receiver; only the port is used.
    pub addr_from: NetAddr,
    /// Random value used to detect connections to self.
    pub nonce: u64,
    pub user_agent: String,
    /// Streams the sender is interested in.
    pub streams: Vec<u32>,
}

/// Identifies an object without transmitting it.
///
/// The first 32 bytes of the double SHA-512 of the object payload. Two
/// objects with equal vectors are treated as the same object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InventoryVector(pub [u8; 32]);

impl InventoryVector {
    pub fn of(object_payload: &[u8]) -> Self {
        let hash = pow::hash_chain(object_payload);
        let mut vector = [0u8; 32];
        vector.copy_from_slice(&hash[..32]);
        InventoryVector(vector)
    }
}

impl Debug for InventoryVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "InventoryVector({})", hex::encode(self.0))
    }
}

/// A network object: `getpubkey`, `pubkey`, `msg` or `broadcast`.
///
/// Objects are shared with the whole stream and must carry a proof of work.
/// Only the common prefix is decoded; the rest of the payload (keys,
/// signatures, encrypted data) is kept opaque in `body`.
///
/// ```text
/// uint64   pow_nonce
/// uint32   time
/// var_int  broadcast_version   (broadcast only)
/// var_int  address_version
/// var_int  stream
/// ...      body
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub pow_nonce: u64,
    pub time: u32,
    pub broadcast_version: Option<u64>,
    pub address_version: u64,
    pub stream: u64,
    pub body: Vec<u8>,
}

/// Service flags advertised in `version` and `addr`.
///
/// The flags are forward-compatible: unknown bits are preserved.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Services(u64);

impl Services {
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns true if all bits in `other` are set.
    pub const fn contains(self, other: Services) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const NONE: Services = Services(0x00);

    /// 0x01: a normal network node.
    pub const NODE_NETWORK: Services = Services(0x01);
}

impl From<u64> for Services {
    fn from(value: u64) -> Self {
        Services::new(value)
    }
}

impl Debug for Services {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        if self.is_empty() {
            return write!(f, "Services(NONE)");
        }

        if self.contains(Self::NODE_NETWORK) {
            write!(f, "Services(NODE_NETWORK) [0x{:016x}]", self.bits())
        } else {
            write!(f, "Services(0x{:016x})", self.bits())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::{decode, encode};
    use crate::wire::constants::MAX_PAYLOAD_LEN;
    use std::net::Ipv4Addr;

    fn sample_version() -> VersionMessage {
        VersionMessage {
            version: 2,
            services: Services::NODE_NETWORK,
            timestamp: 1_365_900_000,
            addr_recv: NetAddr::from_socket_addr(
                Services::NODE_NETWORK,
                "192.168.1.1:8444".parse().unwrap(),
            ),
            addr_from: NetAddr::from_socket_addr(
                Services::NODE_NETWORK,
                "127.0.0.1:8444".parse().unwrap(),
            ),
            nonce: 0x1234_5678_90ab_cdef,
            user_agent: "/PyBitmessage:0.2.8/".to_string(),
            streams: vec![1],
        }
    }

    #[test]
    fn command_parses_nul_padded_names() {
        let mut field = [0u8; 12];
        field[..6].copy_from_slice(b"verack");
        assert_eq!(Command::try_from(&field).unwrap(), Command::Verack);

        field = Command::Broadcast.as_bytes();
        assert_eq!(Command::try_from(&field).unwrap(), Command::Broadcast);
    }

    #[test]
    fn command_rejects_garbage_after_nul() {
        let mut field = [0u8; 12];
        field[..7].copy_from_slice(b"version");
        field[10] = b'x';

        assert!(matches!(
            Command::try_from(&field),
            Err(FramingError::BadPadding { .. })
        ));
    }

    #[test]
    fn command_rejects_empty_and_non_ascii_names() {
        assert!(matches!(
            Command::try_from(&[0u8; 12]),
            Err(FramingError::BadCommand { .. })
        ));

        let mut field = [0u8; 12];
        field[..3].copy_from_slice(&[b'm', 0xC3, b'g']);
        assert!(matches!(
            Command::try_from(&field),
            Err(FramingError::BadCommand { .. })
        ));
    }

    #[test]
    fn command_keeps_unknown_names() {
        let mut field = [0u8; 12];
        field[..4].copy_from_slice(b"ping");
        assert_eq!(
            Command::try_from(&field).unwrap(),
            Command::Unknown("ping".to_string())
        );
    }

    #[test]
    fn net_addr_maps_ipv4_into_ipv6() {
        let addr = NetAddr::from_socket_addr(Services::NONE, "10.0.0.1:8444".parse().unwrap());
        assert_eq!(
            addr.ip.octets(),
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 1]
        );
        assert_eq!(
            addr.socket_addr(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8444)
        );
    }

    #[test]
    fn net_addr_keeps_native_ipv6() {
        let sock: SocketAddr = "[2001:db8::1]:8444".parse().unwrap();
        assert_eq!(
            NetAddr::from_socket_addr(Services::NONE, sock).socket_addr(),
            sock
        );
    }

    #[test]
    fn version_message_survives_the_wire() {
        let msg = Message::Version(sample_version());
        let bytes = encode(&msg.to_raw().unwrap());

        let (raw, rest) = decode(&bytes, MAX_PAYLOAD_LEN).unwrap();
        assert!(rest.is_empty());
        assert_eq!(Message::try_from(raw).unwrap(), msg);
    }

    #[test]
    fn broadcast_object_survives_the_wire() {
        let msg = Message::Broadcast(Object {
            pow_nonce: 42,
            time: 1_365_900_000,
            broadcast_version: Some(1),
            address_version: 2,
            stream: 1,
            body: vec![0x04; 70],
        });
        let bytes = encode(&msg.to_raw().unwrap());

        let (raw, _) = decode(&bytes, MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(raw.command, Command::Broadcast);
        assert_eq!(Message::try_from(raw).unwrap(), msg);
    }

    #[test]
    fn unknown_message_is_preserved() {
        let raw = RawMessage::new(Command::Unknown("ping".into()), vec![1, 2, 3]);
        let Message::Unknown { command, payload } = Message::try_from(raw.clone()).unwrap() else {
            panic!("expected Message::Unknown");
        };
        assert_eq!(command, "ping");
        assert_eq!(payload, vec![1, 2, 3]);

        let back = Message::Unknown { command, payload }.to_raw().unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn overlong_command_name_is_not_framed() {
        let msg = Message::Unknown {
            command: "averyveryverylongname".to_string(),
            payload: vec![],
        };
        let err = msg.to_raw().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let msg = Message::Unknown {
            command: "twelve_bytes".to_string(),
            payload: vec![1, 2],
        };
        let raw = msg.to_raw().unwrap();
        assert_eq!(&raw.command.as_bytes(), b"twelve_bytes");
        assert_eq!(Message::try_from(raw).unwrap(), msg);
    }

    #[test]
    fn message_from_truncated_version_is_an_error() {
        let raw = RawMessage::new(Command::Version, vec![0u8; 10]);
        assert!(Message::try_from(raw).is_err());
    }

    #[test]
    fn inventory_vector_is_first_half_of_hash_chain() {
        let payload = b"object payload";
        let vector = InventoryVector::of(payload);
        assert_eq!(vector.0[..], pow::hash_chain(payload)[..32]);
    }
}
