use std::io::{self};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};

use crate::wire::constants::PROTOCOL_VERSION;
use crate::wire::message::{
    Encode, InventoryVector, NetAddr, NetworkAddress, Object, Services, VersionMessage,
};

/// Builds the `version` message this node sends to `remote`.
///
/// The payload layout is:
///
/// ```text
/// int32         version
/// uint64        services
/// int64         timestamp
/// net_addr      addr_recv
/// net_addr      addr_from
/// uint64        nonce
/// var_str       user_agent
/// var_int_list  stream_numbers
/// ```
///
/// `addr_from` carries the loopback address: receivers ignore the IP and only
/// use the port we listen on.
///
/// # Example
///
/// ```
/// use bitmessage::wire::payload::build_version;
/// use bitmessage::wire::message::Services;
///
/// let addr_recv = "10.0.0.1:8444".parse().unwrap();
/// let v = build_version(Services::NODE_NETWORK, addr_recv, 8444, 7, "/test/", &[1]);
/// assert_eq!(v.streams, vec![1]);
/// assert_eq!(v.addr_recv.port, 8444);
/// ```
pub fn build_version(
    services: Services,
    remote: SocketAddr,
    listen_port: u16,
    nonce: u64,
    user_agent: &str,
    streams: &[u32],
) -> VersionMessage {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    let from = SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), listen_port);

    VersionMessage {
        version: PROTOCOL_VERSION,
        services,
        timestamp,
        addr_recv: NetAddr::from_socket_addr(Services::NODE_NETWORK, remote),
        addr_from: NetAddr::from_socket_addr(services, from),
        nonce,
        user_agent: user_agent.to_string(),
        streams: streams.to_vec(),
    }
}

impl Encode for VersionMessage {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_i32::<BigEndian>(self.version)?;
        out.write_u64::<BigEndian>(self.services.bits())?;
        out.write_i64::<BigEndian>(self.timestamp)?;
        self.addr_recv.encode(out)?;
        self.addr_from.encode(out)?;
        out.write_u64::<BigEndian>(self.nonce)?;
        write_var_str(&self.user_agent, out);

        write_varint(self.streams.len() as u64, out);
        for stream in &self.streams {
            write_varint(*stream as u64, out);
        }

        Ok(())
    }
}

impl Encode for NetAddr {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u64::<BigEndian>(self.services.bits())?;
        out.extend_from_slice(&self.ip.octets());
        out.write_u16::<BigEndian>(self.port)?;
        Ok(())
    }
}

impl Encode for Vec<NetworkAddress> {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        write_varint(self.len() as u64, out);

        for entry in self {
            out.write_u32::<BigEndian>(entry.time)?;
            out.write_u32::<BigEndian>(entry.stream)?;
            entry.addr.encode(out)?;
        }

        Ok(())
    }
}

impl Encode for Vec<InventoryVector> {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        write_varint(self.len() as u64, out);

        for vector in self {
            out.extend_from_slice(&vector.0);
        }

        Ok(())
    }
}

impl Encode for Object {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u64::<BigEndian>(self.pow_nonce)?;
        out.write_u32::<BigEndian>(self.time)?;
        if let Some(version) = self.broadcast_version {
            write_varint(version, out);
        }
        write_varint(self.address_version, out);
        write_varint(self.stream, out);
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

/// Appends a `var_int`: one byte below `0xfd`, otherwise a marker byte and a
/// big-endian u16, u32 or u64.
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend(&value.to_be_bytes());
        }
    }
}

/// Appends a `var_str` (a `var_int` length followed by the bytes).
pub fn write_var_str(value: &str, out: &mut Vec<u8>) {
    write_varint(value.len() as u64, out);
    out.extend_from_slice(value.as_bytes());
}
