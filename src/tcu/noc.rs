use byteorder::{ByteOrder, LE};

use super::error::Error;

/// Number of bits of a NoC address that select the tile.
pub const TILE_BITS: u32 = 12;
/// Number of bits of a NoC address that form the tile-local offset.
pub const OFFSET_BITS: u32 = 52;
pub const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// A global NoC address, decomposed as `tile:12 | offset:52`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NocAddr {
    pub tile: u16,
    pub offset: u64,
}

impl NocAddr {
    pub fn new(tile: u16, offset: u64) -> NocAddr {
        debug_assert!(u64::from(tile) < (1 << TILE_BITS));
        debug_assert!(offset <= OFFSET_MASK);
        NocAddr { tile, offset }
    }

    pub fn from_raw(raw: u64) -> NocAddr {
        NocAddr { tile: (raw >> OFFSET_BITS) as u16, offset: raw & OFFSET_MASK }
    }

    pub fn to_raw(self) -> u64 {
        (u64::from(self.tile) << OFFSET_BITS) | self.offset
    }
}

/// Discrete-event packet commands, shared by all ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemCmd {
    ReadReq,
    WriteReq,
    ReadResp,
    WriteResp,
}

impl MemCmd {
    pub fn is_read(self) -> bool {
        matches!(self, MemCmd::ReadReq | MemCmd::ReadResp)
    }

    pub fn is_response(self) -> bool {
        matches!(self, MemCmd::ReadResp | MemCmd::WriteResp)
    }

    pub fn response(self) -> MemCmd {
        match self {
            MemCmd::ReadReq => MemCmd::ReadResp,
            MemCmd::WriteReq => MemCmd::WriteResp,
            _ => self,
        }
    }
}

/// What a NoC packet means to the receiving TCU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NocPacketType {
    Message,
    ReadReq,
    WriteReq,
    CacheMemReq,
    CacheMemReqFunc,
}

bitflags::bitflags! {
    /// Flags attached to NoC requests.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NocFlags: u8 {
        /// The triggered transfer must not cause a pagefault.
        const NOPF = 1 << 0;
        /// The request originates from a privileged TCU.
        const PRIV = 1 << 1;
    }
}

/// Sender state of packets travelling over the NoC. The response carries it
/// back unchanged except for `result`, which the receiver fills in.
#[derive(Clone, Copy, Debug)]
pub struct NocSenderState {
    pub ptype: NocPacketType,
    pub origin: u16,
    pub cmd_id: u64,
    pub flags: NocFlags,
    pub result: Error,
}

/// Sender state distinguishing the port a packet belongs to.
#[derive(Clone, Copy, Debug)]
pub enum SenderState {
    None,
    Noc(NocSenderState),
    /// A local memory request issued by the transfer unit: transfer id plus
    /// the buffer offset the response data belongs to.
    Mem { xfer: u64, offset: usize },
    /// A cache-to-memory request forwarded for the LLC slave port.
    Llc { origin: u16 },
}

/// A discrete-event packet. `data` is empty for read requests and write
/// responses.
#[derive(Clone, Debug)]
pub struct Packet {
    pub addr: u64,
    pub size: usize,
    pub cmd: MemCmd,
    pub data: Vec<u8>,
    pub sender: SenderState,
}

impl Packet {
    pub fn read(addr: u64, size: usize) -> Packet {
        Packet { addr, size, cmd: MemCmd::ReadReq, data: Vec::new(), sender: SenderState::None }
    }

    pub fn write(addr: u64, data: Vec<u8>) -> Packet {
        Packet { addr, size: data.len(), cmd: MemCmd::WriteReq, data, sender: SenderState::None }
    }

    /// Turn this request into its response, reusing address and sender state.
    pub fn into_response(mut self, data: Vec<u8>) -> Packet {
        self.cmd = self.cmd.response();
        self.data = data;
        self
    }
}

bitflags::bitflags! {
    /// Flags of the wire message header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u8 {
        const REPLY = 1 << 0;
        const GRANT_CREDITS = 1 << 1;
        const REPLY_ENABLED = 1 << 2;
        const PAGEFAULT = 1 << 3;
    }
}

/// Size of the packed wire header in bytes.
pub const HEADER_SIZE: usize = 25;

/// The message header as it travels over the NoC, immediately followed by the
/// payload bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Header {
    pub flags: HeaderFlags,
    pub sender_tile: u8,
    pub sender_ep: u16,
    pub reply_ep: u16,
    pub length: u16,
    pub label: u64,
    pub reply_label: u64,
    pub reply_size: u8,
}

impl Header {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.flags.bits();
        buf[1] = self.sender_tile;
        LE::write_u16(&mut buf[2..4], self.sender_ep);
        LE::write_u16(&mut buf[4..6], self.reply_ep);
        LE::write_u16(&mut buf[6..8], self.length);
        LE::write_u64(&mut buf[8..16], self.label);
        LE::write_u64(&mut buf[16..24], self.reply_label);
        buf[24] = self.reply_size;
    }

    pub fn decode(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Header {
            flags: HeaderFlags::from_bits_truncate(buf[0]),
            sender_tile: buf[1],
            sender_ep: LE::read_u16(&buf[2..4]),
            reply_ep: LE::read_u16(&buf[4..6]),
            length: LE::read_u16(&buf[6..8]),
            label: LE::read_u64(&buf[8..16]),
            reply_label: LE::read_u64(&buf[16..24]),
            reply_size: buf[24],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noc_addr_round_trip() {
        let addr = NocAddr::new(0x123, 0xDEAD_BEEF);
        assert_eq!(NocAddr::from_raw(addr.to_raw()), addr);
        assert_eq!(NocAddr::from_raw(addr.to_raw()).tile, 0x123);
    }

    #[test]
    fn header_round_trip() {
        let hd = Header {
            flags: HeaderFlags::REPLY | HeaderFlags::GRANT_CREDITS,
            sender_tile: 3,
            sender_ep: 17,
            reply_ep: 0xFFFF,
            length: 48,
            label: 0xA5A5_0000_1111_2222,
            reply_label: 7,
            reply_size: 6,
        };
        let mut buf = [0u8; HEADER_SIZE];
        hd.encode(&mut buf);
        let back = Header::decode(&buf).unwrap();
        assert_eq!(back.flags, hd.flags);
        assert_eq!(back.sender_ep, 17);
        assert_eq!(back.reply_ep, 0xFFFF);
        assert_eq!(back.label, hd.label);
        assert_eq!(back.reply_size, 6);
    }
}
