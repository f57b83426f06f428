use std::io::{self};
use std::net::Ipv6Addr;

use crate::wire::constants::{MAX_ADDR_ENTRIES, MAX_INV_ENTRIES};
use crate::wire::message::{
    Decode, InventoryVector, NetAddr, NetworkAddress, Object, Services, VersionMessage,
};

impl Decode for VersionMessage {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let version = read_i32(payload, &mut c)?;
        let services = Services::from(read_u64(payload, &mut c)?);
        let timestamp = read_i64(payload, &mut c)?;
        let addr_recv = decode_net_addr(payload, &mut c)?;
        let addr_from = decode_net_addr(payload, &mut c)?;
        let nonce = read_u64(payload, &mut c)?;
        let user_agent = read_var_str(payload, &mut c, "version: user_agent")?;

        let count = read_varint(payload, &mut c)? as usize;
        if count > MAX_ADDR_ENTRIES {
            return Err(invalid("version: too many stream numbers"));
        }
        let mut streams = Vec::with_capacity(count);
        for _ in 0..count {
            let stream = u32::try_from(read_varint(payload, &mut c)?)
                .map_err(|_| invalid("version: stream number out of range"))?;
            streams.push(stream);
        }

        Ok(VersionMessage {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            streams,
        })
    }
}

impl Decode for Vec<NetworkAddress> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let count = read_varint(payload, &mut c)? as usize;

        if count > MAX_ADDR_ENTRIES {
            return Err(invalid("addr: exceeds 1000-entry limit"));
        }

        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let time = read_u32(payload, &mut c)?;
            let stream = read_u32(payload, &mut c)?;
            let addr = decode_net_addr(payload, &mut c)?;
            entries.push(NetworkAddress { time, stream, addr });
        }

        Ok(entries)
    }
}

impl Decode for Vec<InventoryVector> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let count = read_varint(payload, &mut c)? as usize;

        if count > MAX_INV_ENTRIES {
            return Err(invalid("inv: exceeds 50000-entry limit"));
        }

        let mut vectors = Vec::with_capacity(count);
        for _ in 0..count {
            vectors.push(InventoryVector(slice32(payload, &mut c, "inv: vector")?));
        }

        Ok(vectors)
    }
}

impl Decode for Object {
    /// Decodes `getpubkey`, `pubkey` and `msg` objects.
    fn decode(payload: &[u8]) -> io::Result<Self> {
        decode_object(payload, false)
    }
}

impl Object {
    /// Decodes a `broadcast` object, which carries an extra version field
    /// before the address version.
    pub fn decode_broadcast(payload: &[u8]) -> io::Result<Self> {
        decode_object(payload, true)
    }
}

fn decode_object(p: &[u8], broadcast: bool) -> io::Result<Object> {
    let mut c = 0;

    let pow_nonce = read_u64(p, &mut c)?;
    let time = read_u32(p, &mut c)?;
    let broadcast_version = if broadcast {
        Some(read_varint(p, &mut c)?)
    } else {
        None
    };
    let address_version = read_varint(p, &mut c)?;
    let stream = read_varint(p, &mut c)?;

    Ok(Object {
        pow_nonce,
        time,
        broadcast_version,
        address_version,
        stream,
        body: p[c..].to_vec(),
    })
}

pub(crate) fn decode_net_addr(p: &[u8], c: &mut usize) -> io::Result<NetAddr> {
    let services = Services::from(read_u64(p, c)?);
    let ip = Ipv6Addr::from(slice16(p, c, "net_addr: ip")?);
    let port = u16::from_be_bytes(slice2(p, c, "net_addr: port")?);

    Ok(NetAddr { services, ip, port })
}

fn eof(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, context)
}

fn invalid(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, context)
}

/// Reads a `var_int`. Multi-byte forms are big-endian.
pub(crate) fn read_varint(p: &[u8], c: &mut usize) -> io::Result<u64> {
    let first = *p.get(*c).ok_or_else(|| eof("varint"))?;
    *c += 1;
    match first {
        0xFD => Ok(u16::from_be_bytes(slice2(p, c, "varint:fd")?) as u64),
        0xFE => Ok(u32::from_be_bytes(slice4(p, c, "varint:fe")?) as u64),
        0xFF => Ok(u64::from_be_bytes(slice8(p, c, "varint:ff")?)),
        n => Ok(n as u64),
    }
}

fn read_var_str(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<String> {
    let len = read_varint(p, c)? as usize;
    let bytes = p
        .get(*c..c.saturating_add(len))
        .ok_or_else(|| eof(ctx))?;
    *c += len;

    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_i32(p: &[u8], c: &mut usize) -> io::Result<i32> {
    Ok(i32::from_be_bytes(slice4(p, c, "i32")?))
}
fn read_i64(p: &[u8], c: &mut usize) -> io::Result<i64> {
    Ok(i64::from_be_bytes(slice8(p, c, "i64")?))
}
fn read_u32(p: &[u8], c: &mut usize) -> io::Result<u32> {
    Ok(u32::from_be_bytes(slice4(p, c, "u32")?))
}
fn read_u64(p: &[u8], c: &mut usize) -> io::Result<u64> {
    Ok(u64::from_be_bytes(slice8(p, c, "u64")?))
}

fn slice<const N: usize>(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(p.get(*c..c.saturating_add(N)).ok_or_else(|| eof(ctx))?);
    *c += N;
    Ok(out)
}

fn slice2(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 2]> {
    slice::<2>(p, c, ctx)
}
fn slice4(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 4]> {
    slice::<4>(p, c, ctx)
}
fn slice8(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 8]> {
    slice::<8>(p, c, ctx)
}
fn slice16(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 16]> {
    slice::<16>(p, c, ctx)
}
fn slice32(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 32]> {
    slice::<32>(p, c, ctx)
}
