use super::error::Error;

pub type EpId = u16;
pub type ActId = u16;

pub const NUM_UNPRIV_REGS: usize = 6;
pub const NUM_PRIV_REGS: usize = 5;
pub const NUM_EXT_REGS: usize = 2;
pub const EP_REGS: usize = 3;
pub const PRINT_REGS: usize = 32;

/// Sentinel for unlimited credits on a send endpoint.
pub const UNLIM_CREDITS: u8 = 0x3F;
/// "No activity running" id.
pub const INVALID_ACT: ActId = 0xFFFF;
/// Sentinel for a receive endpoint without reply endpoints.
pub const NO_REPLIES: EpId = 0xFFFF;
/// Maximum number of slots of a receive ring (occupied/unread are 32-bit).
pub const MAX_MSGS: usize = 32;

/// The unprivileged registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum UnprivReg {
    /// Starts commands and signals their completion.
    Command = 0,
    /// Aborts the running command when written.
    Abort = 1,
    /// Data address (low half) and size (high half) of commands.
    Data = 2,
    /// Additional command argument (reply label, memory offset, ...).
    Arg1 = 3,
    /// The running activity: id in the low half, unread-message count above.
    CurAct = 4,
    /// Prints the print-buffer registers into the log when written.
    Print = 5,
}

/// The privileged registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum PrivReg {
    PrivCmd = 0,
    PrivCmdArg = 1,
    /// Core-request descriptor; the core answers by writing it back.
    CoreReq = 2,
    /// The activity parked by the last XCHG_ACT.
    OldAct = 3,
    ClearIrq = 4,
}

/// The external registers, writable only over the NoC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ExtReg {
    Features = 0,
    ExtCmd = 1,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Features: u64 {
        const PRIV = 1 << 0;
        const IRQ_ON_MSG = 1 << 1;
    }
}

/// Who performs a register access; determines write permissions and shows up
/// in the access trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegAccess {
    Cpu,
    Noc,
    Tcu,
}

impl RegAccess {
    fn name(self) -> &'static str {
        match self {
            RegAccess::Cpu => "CPU",
            RegAccess::Noc => "NOC",
            RegAccess::Tcu => "TCU",
        }
    }
}

bitflags::bitflags! {
    /// Which engine-triggering registers a request wrote.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Wrote: u32 {
        const CMD = 1 << 0;
        const ABORT = 1 << 1;
        const PRINT = 1 << 2;
        const PRIV_CMD = 1 << 3;
        const CORE_REQ = 1 << 4;
        const CLEAR_IRQ = 1 << 5;
        const EXT_CMD = 1 << 6;
    }
}

/// Unprivileged command opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdOp {
    Idle,
    Send,
    Reply,
    Read,
    Write,
    FetchMsg,
    AckMsg,
    Sleep,
    Print,
    Unknown(u8),
}

impl CmdOp {
    fn from_bits(bits: u64) -> CmdOp {
        match bits {
            0 => CmdOp::Idle,
            1 => CmdOp::Send,
            2 => CmdOp::Reply,
            3 => CmdOp::Read,
            4 => CmdOp::Write,
            5 => CmdOp::FetchMsg,
            6 => CmdOp::AckMsg,
            7 => CmdOp::Sleep,
            8 => CmdOp::Print,
            v => CmdOp::Unknown(v as u8),
        }
    }

    fn bits(self) -> u64 {
        match self {
            CmdOp::Idle => 0,
            CmdOp::Send => 1,
            CmdOp::Reply => 2,
            CmdOp::Read => 3,
            CmdOp::Write => 4,
            CmdOp::FetchMsg => 5,
            CmdOp::AckMsg => 6,
            CmdOp::Sleep => 7,
            CmdOp::Print => 8,
            CmdOp::Unknown(v) => v as u64,
        }
    }
}

/// Decoded COMMAND register: `opcode:4 | ep:16 | flags:1 | error:4 | arg:32`.
#[derive(Clone, Copy, Debug)]
pub struct Cmd {
    pub op: CmdOp,
    pub ep: EpId,
    pub nopf: bool,
    pub error: Error,
    pub arg: u32,
}

impl Cmd {
    pub fn from_reg(reg: u64) -> Cmd {
        Cmd {
            op: CmdOp::from_bits(reg & 0xF),
            ep: ((reg >> 4) & 0xFFFF) as EpId,
            nopf: (reg >> 20) & 1 != 0,
            error: Error::from_bits((reg >> 21) & 0xF),
            arg: (reg >> 25) as u32,
        }
    }

    pub fn to_reg(self) -> u64 {
        self.op.bits()
            | (u64::from(self.ep) << 4)
            | (u64::from(self.nopf) << 20)
            | (self.error.bits() << 21)
            | (u64::from(self.arg) << 25)
    }
}

/// Decoded PRIV_CMD / EXT_CMD register: `opcode:4 | error:4 | arg:56`.
#[derive(Clone, Copy, Debug)]
pub struct SideCmd {
    pub op: u8,
    pub error: Error,
    pub arg: u64,
}

impl SideCmd {
    pub fn from_reg(reg: u64) -> SideCmd {
        SideCmd {
            op: (reg & 0xF) as u8,
            error: Error::from_bits((reg >> 4) & 0xF),
            arg: reg >> 8,
        }
    }

    pub fn to_reg(self) -> u64 {
        u64::from(self.op) | (self.error.bits() << 4) | (self.arg << 8)
    }
}

pub mod priv_op {
    pub const IDLE: u8 = 0;
    pub const INV_PAGE: u8 = 1;
    pub const INV_TLB: u8 = 2;
    pub const XCHG_ACT: u8 = 3;
}

pub mod ext_op {
    pub const IDLE: u8 = 0;
    pub const INV_EP: u8 = 1;
    pub const INV_REPLY: u8 = 2;
    pub const RESET: u8 = 3;
}

const EP_TYPE_INVALID: u64 = 0;
const EP_TYPE_SEND: u64 = 1;
const EP_TYPE_RECEIVE: u64 = 2;
const EP_TYPE_MEMORY: u64 = 3;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        /// Use-once reply endpoint, generated at message arrival.
        const REPLY = 1 << 0;
        /// Replies on this endpoint carry the PAGEFAULT header flag.
        const PF = 1 << 1;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl MemFlags {
    pub const RW: MemFlags = MemFlags::READ.union(MemFlags::WRITE);
}

#[derive(Clone, Copy, Debug)]
pub struct SendEp {
    pub act: ActId,
    pub target_tile: u16,
    pub target_ep: EpId,
    pub label: u64,
    /// log2 of the maximum message size; 0 marks the endpoint unusable.
    pub msg_size: u8,
    pub max_crd: u8,
    pub cur_crd: u8,
    /// Receive endpoint of the original sender that gets the credit back.
    pub crd_ep: EpId,
    pub flags: SendFlags,
}

impl SendEp {
    pub fn is_unlimited(&self) -> bool {
        self.cur_crd == UNLIM_CREDITS
    }

    fn to_regs(&self) -> [u64; 3] {
        let r0 = EP_TYPE_SEND
            | (u64::from(self.act) << 3)
            | (u64::from(self.flags.bits()) << 19)
            | (u64::from(self.cur_crd & 0x3F) << 21)
            | (u64::from(self.max_crd & 0x3F) << 27)
            | (u64::from(self.msg_size & 0x3F) << 33)
            | (u64::from(self.crd_ep) << 39);
        let r1 = u64::from(self.target_tile) | (u64::from(self.target_ep) << 16);
        [r0, r1, self.label]
    }

    fn from_regs(r: [u64; 3]) -> SendEp {
        SendEp {
            act: ((r[0] >> 3) & 0xFFFF) as ActId,
            flags: SendFlags::from_bits_truncate(((r[0] >> 19) & 0x3) as u8),
            cur_crd: ((r[0] >> 21) & 0x3F) as u8,
            max_crd: ((r[0] >> 27) & 0x3F) as u8,
            msg_size: ((r[0] >> 33) & 0x3F) as u8,
            crd_ep: ((r[0] >> 39) & 0xFFFF) as EpId,
            target_tile: (r[1] & 0xFFFF) as u16,
            target_ep: ((r[1] >> 16) & 0xFFFF) as EpId,
            label: r[2],
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RecvEp {
    pub act: ActId,
    pub buf_addr: u64,
    /// log2 of the ring slot count.
    pub size: u8,
    /// log2 of the slot size in bytes.
    pub msg_size: u8,
    /// First of `1 << size` contiguous reply send endpoints, or `NO_REPLIES`.
    pub reply_eps: EpId,
    pub occupied: u32,
    pub unread: u32,
    pub rd_pos: u8,
    pub wr_pos: u8,
}

impl RecvEp {
    pub fn slots(&self) -> usize {
        1 << self.size
    }

    pub fn slot_size(&self) -> u64 {
        1 << self.msg_size
    }

    pub fn is_occupied(&self, idx: usize) -> bool {
        self.occupied & (1 << idx) != 0
    }

    pub fn set_occupied(&mut self, idx: usize, val: bool) {
        if val {
            self.occupied |= 1 << idx;
        } else {
            self.occupied &= !(1 << idx);
        }
    }

    pub fn is_unread(&self, idx: usize) -> bool {
        self.unread & (1 << idx) != 0
    }

    pub fn set_unread(&mut self, idx: usize, val: bool) {
        if val {
            self.unread |= 1 << idx;
        } else {
            self.unread &= !(1 << idx);
        }
    }

    /// Number of received-but-unread messages. Always equals the number of
    /// set unread bits.
    pub fn msg_count(&self) -> u32 {
        self.unread.count_ones()
    }

    /// Slot index of the message at the given absolute address.
    pub fn msg_to_idx(&self, msg_addr: u64) -> Option<usize> {
        let off = msg_addr.checked_sub(self.buf_addr)?;
        let idx = (off >> self.msg_size) as usize;
        if idx < self.slots() { Some(idx) } else { None }
    }

    fn to_regs(&self) -> [u64; 3] {
        let r0 = EP_TYPE_RECEIVE
            | (u64::from(self.act) << 3)
            | (u64::from(self.size & 0x3F) << 19)
            | (u64::from(self.msg_size & 0x3F) << 25)
            | (u64::from(self.reply_eps) << 31)
            | (u64::from(self.rd_pos & 0x7F) << 47)
            | (u64::from(self.wr_pos & 0x7F) << 54);
        let r2 = u64::from(self.occupied) | (u64::from(self.unread) << 32);
        [r0, self.buf_addr, r2]
    }

    fn from_regs(r: [u64; 3]) -> RecvEp {
        RecvEp {
            act: ((r[0] >> 3) & 0xFFFF) as ActId,
            size: ((r[0] >> 19) & 0x3F) as u8,
            msg_size: ((r[0] >> 25) & 0x3F) as u8,
            reply_eps: ((r[0] >> 31) & 0xFFFF) as EpId,
            rd_pos: ((r[0] >> 47) & 0x7F) as u8,
            wr_pos: ((r[0] >> 54) & 0x7F) as u8,
            buf_addr: r[1],
            occupied: r[2] as u32,
            unread: (r[2] >> 32) as u32,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MemEp {
    pub act: ActId,
    pub target_tile: u16,
    pub target_addr: u64,
    pub size: u64,
    pub flags: MemFlags,
}

impl MemEp {
    fn to_regs(&self) -> [u64; 3] {
        let r0 = EP_TYPE_MEMORY
            | (u64::from(self.act) << 3)
            | (u64::from(self.flags.bits()) << 19)
            | (u64::from(self.target_tile) << 21);
        [r0, self.target_addr, self.size]
    }

    fn from_regs(r: [u64; 3]) -> MemEp {
        MemEp {
            act: ((r[0] >> 3) & 0xFFFF) as ActId,
            flags: MemFlags::from_bits_truncate(((r[0] >> 19) & 0x3) as u8),
            target_tile: ((r[0] >> 21) & 0xFFFF) as u16,
            target_addr: r[1],
            size: r[2],
        }
    }
}

/// A typed view of one 3-word endpoint slot.
#[derive(Clone, Copy, Debug)]
pub enum Ep {
    Invalid,
    Send(SendEp),
    Receive(RecvEp),
    Memory(MemEp),
}

impl Ep {
    fn to_regs(&self) -> [u64; 3] {
        match self {
            Ep::Invalid => [0; 3],
            Ep::Send(ep) => ep.to_regs(),
            Ep::Receive(ep) => ep.to_regs(),
            Ep::Memory(ep) => ep.to_regs(),
        }
    }

    fn from_regs(r: [u64; 3]) -> Ep {
        match r[0] & 0x7 {
            EP_TYPE_SEND => Ep::Send(SendEp::from_regs(r)),
            EP_TYPE_RECEIVE => Ep::Receive(RecvEp::from_regs(r)),
            EP_TYPE_MEMORY => Ep::Memory(MemEp::from_regs(r)),
            _ => Ep::Invalid,
        }
    }
}

/// The register file: dense 64-bit register groups addressable by the local
/// core over MMIO and by remote tiles over the NoC.
///
/// MMIO layout, in 8-byte words: unprivileged group, privileged group,
/// external group, endpoint array (3 words each), print buffer.
pub struct RegFile {
    unpriv: [u64; NUM_UNPRIV_REGS],
    privs: [u64; NUM_PRIV_REGS],
    ext: [u64; NUM_EXT_REGS],
    eps: Vec<[u64; 3]>,
    print_buf: [u64; PRINT_REGS],
}

const UNPRIV_BASE: u64 = 0;
const PRIV_BASE: u64 = UNPRIV_BASE + (NUM_UNPRIV_REGS * 8) as u64;
const EXT_BASE: u64 = PRIV_BASE + (NUM_PRIV_REGS * 8) as u64;
pub const EP_BASE: u64 = EXT_BASE + (NUM_EXT_REGS * 8) as u64;

pub fn unpriv_reg_addr(reg: UnprivReg) -> u64 {
    UNPRIV_BASE + reg as u64 * 8
}

pub fn priv_reg_addr(reg: PrivReg) -> u64 {
    PRIV_BASE + reg as u64 * 8
}

pub fn ext_reg_addr(reg: ExtReg) -> u64 {
    EXT_BASE + reg as u64 * 8
}

impl RegFile {
    pub fn new(num_eps: usize) -> RegFile {
        let mut rf = RegFile {
            unpriv: [0; NUM_UNPRIV_REGS],
            privs: [0; NUM_PRIV_REGS],
            ext: [0; NUM_EXT_REGS],
            eps: vec![[0; 3]; num_eps],
            print_buf: [0; PRINT_REGS],
        };
        // At boot, every tile is privileged and no activity is running.
        rf.set_ext(ExtReg::Features, Features::PRIV.bits(), RegAccess::Tcu);
        rf.set_unpriv(UnprivReg::CurAct, u64::from(INVALID_ACT), RegAccess::Tcu);
        rf
    }

    pub fn num_eps(&self) -> usize {
        self.eps.len()
    }

    /// Size of the MMIO window in bytes.
    pub fn size(&self) -> u64 {
        self.print_base() + (PRINT_REGS * 8) as u64
    }

    fn print_base(&self) -> u64 {
        EP_BASE + (self.eps.len() * EP_REGS * 8) as u64
    }

    pub fn get_unpriv(&self, reg: UnprivReg) -> u64 {
        self.unpriv[reg as usize]
    }

    pub fn set_unpriv(&mut self, reg: UnprivReg, value: u64, access: RegAccess) {
        trace!(target: "TcuReg", "{}-> CMD[{:?}]: {:#018x}", access.name(), reg, value);
        self.unpriv[reg as usize] = value;
    }

    pub fn get_priv(&self, reg: PrivReg) -> u64 {
        self.privs[reg as usize]
    }

    pub fn set_priv(&mut self, reg: PrivReg, value: u64, access: RegAccess) {
        trace!(target: "TcuReg", "{}-> PRI[{:?}]: {:#018x}", access.name(), reg, value);
        self.privs[reg as usize] = value;
    }

    pub fn get_ext(&self, reg: ExtReg) -> u64 {
        self.ext[reg as usize]
    }

    pub fn set_ext(&mut self, reg: ExtReg, value: u64, access: RegAccess) {
        trace!(target: "TcuReg", "{}-> EXT[{:?}]: {:#018x}", access.name(), reg, value);
        self.ext[reg as usize] = value;
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        Features::from_bits_truncate(self.get_ext(ExtReg::Features)).contains(feature)
    }

    pub fn get_ep(&self, ep: EpId) -> Ep {
        Ep::from_regs(self.eps[ep as usize])
    }

    pub fn set_ep(&mut self, ep: EpId, value: &Ep) {
        trace!(target: "TcuReg", "TCU-> EP{:<3}: {:x?}", ep, value);
        self.eps[ep as usize] = value.to_regs();
    }

    pub fn get_send_ep(&self, ep: EpId) -> Option<SendEp> {
        if usize::from(ep) >= self.eps.len() {
            return None;
        }
        match self.get_ep(ep) {
            Ep::Send(sep) => Some(sep),
            _ => None,
        }
    }

    pub fn get_recv_ep(&self, ep: EpId) -> Option<RecvEp> {
        if usize::from(ep) >= self.eps.len() {
            return None;
        }
        match self.get_ep(ep) {
            Ep::Receive(rep) => Some(rep),
            _ => None,
        }
    }

    pub fn get_mem_ep(&self, ep: EpId) -> Option<MemEp> {
        if usize::from(ep) >= self.eps.len() {
            return None;
        }
        match self.get_ep(ep) {
            Ep::Memory(mep) => Some(mep),
            _ => None,
        }
    }

    pub fn invalidate_ep(&mut self, ep: EpId) {
        trace!(target: "TcuReg", "TCU-> EP{:<3}: invalidated", ep);
        self.eps[ep as usize] = [0; 3];
    }

    /// The running activity as `(id, unread message count)`.
    pub fn cur_act(&self) -> (ActId, u32) {
        let reg = self.get_unpriv(UnprivReg::CurAct);
        ((reg & 0xFFFF) as ActId, ((reg >> 16) & 0xFFFF) as u32)
    }

    pub fn set_cur_act(&mut self, id: ActId, msgs: u32) {
        self.set_unpriv(
            UnprivReg::CurAct,
            u64::from(id) | (u64::from(msgs & 0xFFFF) << 16),
            RegAccess::Tcu,
        );
    }

    pub fn add_msg(&mut self) {
        let (id, msgs) = self.cur_act();
        self.set_cur_act(id, msgs + 1);
    }

    pub fn rem_msg(&mut self) {
        let (id, msgs) = self.cur_act();
        debug_assert!(msgs > 0);
        self.set_cur_act(id, msgs.saturating_sub(1));
    }

    /// Data address and size of the current command.
    pub fn data(&self) -> (u64, usize) {
        let reg = self.get_unpriv(UnprivReg::Data);
        (reg & 0xFFFF_FFFF, (reg >> 32) as usize)
    }

    pub fn set_data(&mut self, addr: u64, size: usize) {
        self.set_unpriv(
            UnprivReg::Data,
            (addr & 0xFFFF_FFFF) | ((size as u64) << 32),
            RegAccess::Tcu,
        );
    }

    pub fn print_bytes(&self, len: usize) -> Vec<u8> {
        let len = len.min(PRINT_REGS * 8);
        let mut bytes = Vec::with_capacity(len);
        for (i, reg) in self.print_buf.iter().enumerate() {
            if i * 8 >= len {
                break;
            }
            bytes.extend_from_slice(&reg.to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    /// Perform a word-granular register access. Invalid addresses read as
    /// zero; writes that the requester is not allowed to perform are dropped.
    /// The returned mask names the engine-triggering registers written.
    pub fn access(
        &mut self,
        addr: u64,
        data: &mut [u64],
        is_read: bool,
        access: RegAccess,
    ) -> Wrote {
        let mut wrote = Wrote::default();
        let is_priv = self.has_feature(Features::PRIV);

        for (i, word) in data.iter_mut().enumerate() {
            let reg_addr = addr + (i * 8) as u64;

            if reg_addr < PRIV_BASE {
                let idx = (reg_addr / 8) as usize;
                if is_read {
                    *word = self.unpriv[idx];
                    continue;
                }
                // The command registers cannot be written from the NoC; the
                // activity register only by the TCU itself.
                let ok = match idx {
                    x if x == UnprivReg::CurAct as usize => access == RegAccess::Tcu,
                    _ => access == RegAccess::Cpu || access == RegAccess::Tcu,
                };
                if !ok {
                    error!(target: "TcuReg", "{}: dropping write to unpriv reg {}", access.name(), idx);
                    continue;
                }
                match idx {
                    x if x == UnprivReg::Command as usize => wrote |= Wrote::CMD,
                    x if x == UnprivReg::Abort as usize => wrote |= Wrote::ABORT,
                    x if x == UnprivReg::Print as usize => wrote |= Wrote::PRINT,
                    _ => {}
                }
                trace!(target: "TcuReg", "{}-> CMD[{}]: {:#018x}", access.name(), idx, *word);
                self.unpriv[idx] = *word;
            } else if reg_addr < EXT_BASE {
                let idx = ((reg_addr - PRIV_BASE) / 8) as usize;
                if is_read {
                    *word = self.privs[idx];
                    continue;
                }
                match idx {
                    x if x == PrivReg::PrivCmd as usize => wrote |= Wrote::PRIV_CMD,
                    x if x == PrivReg::CoreReq as usize => wrote |= Wrote::CORE_REQ,
                    x if x == PrivReg::ClearIrq as usize => wrote |= Wrote::CLEAR_IRQ,
                    _ => {}
                }
                trace!(target: "TcuReg", "{}-> PRI[{}]: {:#018x}", access.name(), idx, *word);
                self.privs[idx] = *word;
            } else if reg_addr < EP_BASE {
                let idx = ((reg_addr - EXT_BASE) / 8) as usize;
                if is_read {
                    *word = self.ext[idx];
                    continue;
                }
                // External registers cannot be set by the local core.
                if access == RegAccess::Cpu {
                    error!(target: "TcuReg", "CPU: dropping write to ext reg {}", idx);
                    continue;
                }
                if idx == ExtReg::ExtCmd as usize {
                    wrote |= Wrote::EXT_CMD;
                }
                trace!(target: "TcuReg", "{}-> EXT[{}]: {:#018x}", access.name(), idx, *word);
                self.ext[idx] = *word;
            } else if reg_addr < self.print_base() {
                let ep_addr = reg_addr - EP_BASE;
                let ep = (ep_addr / (EP_REGS * 8) as u64) as usize;
                let reg = (ep_addr / 8) as usize % EP_REGS;
                if is_read {
                    *word = self.eps[ep][reg];
                    continue;
                }
                // Endpoints are configured from remote (privileged) TCUs, or
                // locally while the tile itself is still privileged.
                if access == RegAccess::Cpu && !is_priv {
                    error!(target: "TcuReg", "CPU: dropping write to EP{}.{}", ep, reg);
                    continue;
                }
                trace!(target: "TcuReg", "{}-> EP{:<3}.{}: {:#018x}", access.name(), ep, reg, *word);
                self.eps[ep][reg] = *word;
            } else if reg_addr < self.size() {
                let idx = ((reg_addr - self.print_base()) / 8) as usize;
                if is_read {
                    *word = self.print_buf[idx];
                } else {
                    self.print_buf[idx] = *word;
                }
            } else {
                // Out-of-range accesses (e.g. speculative) read as zero.
                if is_read {
                    *word = 0;
                }
            }
        }

        wrote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ep_round_trip() {
        let mut rf = RegFile::new(16);
        let sep = SendEp {
            act: 5,
            target_tile: 3,
            target_ep: 4,
            label: 0xA,
            msg_size: 6,
            max_crd: 2,
            cur_crd: 1,
            crd_ep: 7,
            flags: SendFlags::REPLY,
        };
        rf.set_ep(2, &Ep::Send(sep));
        let back = rf.get_send_ep(2).unwrap();
        assert_eq!(back.target_tile, 3);
        assert_eq!(back.target_ep, 4);
        assert_eq!(back.label, 0xA);
        assert_eq!(back.cur_crd, 1);
        assert_eq!(back.max_crd, 2);
        assert_eq!(back.crd_ep, 7);
        assert!(back.flags.contains(SendFlags::REPLY));

        let rep = RecvEp {
            act: 5,
            buf_addr: 0x1000,
            size: 1,
            msg_size: 6,
            reply_eps: 5,
            occupied: 0b01,
            unread: 0b01,
            rd_pos: 0,
            wr_pos: 1,
        };
        rf.set_ep(4, &Ep::Receive(rep));
        let back = rf.get_recv_ep(4).unwrap();
        assert_eq!(back.buf_addr, 0x1000);
        assert_eq!(back.slots(), 2);
        assert_eq!(back.msg_count(), 1);
        assert_eq!(back.reply_eps, 5);
        assert!(rf.get_send_ep(4).is_none());
    }

    #[test]
    fn command_reg_round_trip() {
        let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 4 };
        let back = Cmd::from_reg(cmd.to_reg());
        assert_eq!(back.op, CmdOp::Send);
        assert_eq!(back.ep, 2);
        assert_eq!(back.arg, 4);

        let done = Cmd { error: Error::MissCredits, op: CmdOp::Idle, ..cmd };
        assert_eq!(Cmd::from_reg(done.to_reg()).error, Error::MissCredits);
    }

    #[test]
    fn noc_may_not_write_command() {
        let mut rf = RegFile::new(4);
        let mut words = [0xDEAD_u64];
        rf.access(UnprivReg::Command as u64 * 8, &mut words, false, RegAccess::Noc);
        assert_eq!(rf.get_unpriv(UnprivReg::Command), 0);

        let wrote = rf.access(UnprivReg::Command as u64 * 8, &mut words, false, RegAccess::Cpu);
        assert_eq!(rf.get_unpriv(UnprivReg::Command), 0xDEAD);
        assert!(wrote.contains(Wrote::CMD));
    }

    #[test]
    fn cpu_may_not_write_ext() {
        let mut rf = RegFile::new(4);
        let mut words = [0x11_u64];
        rf.access(EXT_BASE + 8, &mut words, false, RegAccess::Cpu);
        assert_eq!(rf.get_ext(ExtReg::ExtCmd), 0);
        let wrote = rf.access(EXT_BASE + 8, &mut words, false, RegAccess::Noc);
        assert!(wrote.contains(Wrote::EXT_CMD));
        assert_eq!(rf.get_ext(ExtReg::ExtCmd), 0x11);
    }
}
