//! The host-simulator side of the model: clock, event queue, tile arena and
//! the local scratchpad memory each TCU's memory port talks to.
//!
//! Every externally visible state change happens inside a [`Work`] item
//! dispatched from the queue; suspended operations are re-entered through
//! these tags rather than captured closures.

pub mod event;

pub use event::EventQueue;

use crate::config::Config;
use crate::tcu::error::Error;
use crate::tcu::noc::{MemCmd, NocAddr, NocPacketType, Packet, SenderState};
use crate::tcu::regs::{Ep, RegAccess, UnprivReg};
use crate::tcu::Tcu;

/// A unit of scheduled work, delivered to one tile.
#[derive(Debug)]
pub enum Work {
    /// MMIO access from the local core.
    CpuRequest(Packet),
    /// Release the cache slave port.
    CpuRequestFinished,
    /// A packet arriving at the tile's NoC slave port.
    NocRequest(Packet),
    /// Response to a NoC request this tile issued.
    NocResponse(Packet),
    /// Release the NoC slave port.
    NocRequestFinished,
    /// A request to the tile-local memory.
    MemRequest(Packet),
    /// Response from the tile-local memory.
    MemResponse(Packet),
    /// Cache-to-memory traffic entering the LLC slave port.
    LlcRequest(Packet),
    ExecCommand,
    ExecPrivCommand,
    ExecExtCommand,
    AbortCommand,
    FinishCommand { cmd_id: u64, error: Error },
    /// Step the transfer with the given id.
    ProcessTransfer(u64),
    /// The core answered through the CORE_REQ register.
    CompleteCoreReqs,
    SleepTimeout { cmd_id: u64 },
}

/// Per-dispatch context handed to the models: the current cycle plus the
/// ability to schedule further work.
pub struct Ctx<'a> {
    pub cycle: u64,
    queue: &'a mut EventQueue,
}

impl<'a> Ctx<'a> {
    pub fn sched(&mut self, tile: usize, delay: u64, work: Work) {
        self.queue.sched(tile, delay, work);
    }
}

/// Tile-local memory with fixed access latencies.
pub struct Scratchpad {
    pub bytes: Vec<u8>,
    read_latency: u64,
    write_latency: u64,
}

impl Scratchpad {
    fn new(size: usize, read_latency: u64, write_latency: u64) -> Scratchpad {
        Scratchpad { bytes: vec![0; size], read_latency, write_latency }
    }

    fn handle(&mut self, tile: usize, pkt: Packet, ctx: &mut Ctx) {
        let addr = pkt.addr as usize;
        let (resp, delay) = match pkt.cmd {
            MemCmd::ReadReq => {
                let mut data = vec![0; pkt.size];
                if addr + pkt.size <= self.bytes.len() {
                    data.copy_from_slice(&self.bytes[addr..addr + pkt.size]);
                } else {
                    error!(target: "Spm", "read at {:#x}+{:#x} out of bounds", addr, pkt.size);
                }
                (pkt.into_response(data), self.read_latency)
            }
            MemCmd::WriteReq => {
                if addr + pkt.data.len() <= self.bytes.len() {
                    self.bytes[addr..addr + pkt.data.len()].copy_from_slice(&pkt.data);
                } else {
                    error!(target: "Spm", "write at {:#x}+{:#x} out of bounds", addr, pkt.data.len());
                }
                (pkt.into_response(Vec::new()), self.write_latency)
            }
            _ => {
                error!(target: "Spm", "unexpected memory packet {:?}", pkt.cmd);
                return;
            }
        };
        ctx.sched(tile, delay, Work::MemResponse(resp));
    }

    /// Serve a functional NoC access immediately, without timing or port
    /// state.
    fn handle_functional(&mut self, pkt: Packet, ctx: &mut Ctx) {
        let SenderState::Noc(noc) = pkt.sender else { return };
        let offset = NocAddr::from_raw(pkt.addr).offset as usize;
        let resp = match pkt.cmd {
            MemCmd::ReadReq => {
                let mut data = vec![0; pkt.size];
                if offset + pkt.size <= self.bytes.len() {
                    data.copy_from_slice(&self.bytes[offset..offset + pkt.size]);
                }
                pkt.into_response(data)
            }
            MemCmd::WriteReq => {
                if offset + pkt.data.len() <= self.bytes.len() {
                    self.bytes[offset..offset + pkt.data.len()].copy_from_slice(&pkt.data);
                }
                pkt.into_response(Vec::new())
            }
            _ => return,
        };
        ctx.sched(noc.origin.into(), 0, Work::NocResponse(resp));
    }
}

/// One tile: a TCU plus its local memory. Tiles without a core simply never
/// see CPU requests.
pub struct Tile {
    pub tcu: Tcu,
    pub spm: Scratchpad,
}

impl Tile {
    fn handle(&mut self, id: usize, work: Work, ctx: &mut Ctx) {
        match work {
            Work::MemRequest(pkt) => self.spm.handle(id, pkt, ctx),
            // Functional NoC accesses bypass the TCU's busy accounting.
            Work::NocRequest(pkt)
                if matches!(pkt.sender,
                    SenderState::Noc(n) if n.ptype == NocPacketType::CacheMemReqFunc) =>
            {
                self.spm.handle_functional(pkt, ctx)
            }
            work => self.tcu.handle(work, ctx),
        }
    }
}

/// The arena owning all tiles and the event queue. Cross-tile communication
/// exists only as scheduled work, so tiles never alias each other.
pub struct System {
    queue: EventQueue,
    tiles: Vec<Tile>,
}

impl System {
    pub fn new(config: &Config) -> System {
        let tiles = (0..config.tiles)
            .map(|i| Tile {
                tcu: Tcu::new(i as u16, config.tcu.clone()),
                spm: Scratchpad::new(
                    config.mem_size,
                    config.tcu.spm_read_latency,
                    config.tcu.spm_write_latency,
                ),
            })
            .collect();
        System { queue: EventQueue::new(), tiles }
    }

    pub fn cycle(&self) -> u64 {
        self.queue.cycle()
    }

    pub fn tcu(&self, tile: usize) -> &Tcu {
        &self.tiles[tile].tcu
    }

    pub fn tcu_mut(&mut self, tile: usize) -> &mut Tcu {
        &mut self.tiles[tile].tcu
    }

    /// Run until no events remain or the cycle limit is passed. Events past
    /// the limit stay queued for a later run.
    pub fn run_until(&mut self, limit: u64) {
        while matches!(self.queue.peek_time(), Some(t) if t <= limit) {
            let entry = self.queue.pop().unwrap();
            let mut ctx = Ctx { cycle: entry.time, queue: &mut self.queue };
            self.tiles[entry.tile].handle(entry.tile, entry.work, &mut ctx);
        }
    }

    pub fn run(&mut self) {
        self.run_until(u64::MAX);
    }

    /// Whether any event is still pending.
    pub fn idle(&self) -> bool {
        self.queue.is_empty()
    }

    // -- test and loader conveniences --

    /// Functional write into a tile's local memory.
    pub fn write_mem(&mut self, tile: usize, addr: u64, data: &[u8]) {
        let addr = addr as usize;
        self.tiles[tile].spm.bytes[addr..addr + data.len()].copy_from_slice(data);
    }

    /// Functional read from a tile's local memory.
    pub fn read_mem(&self, tile: usize, addr: u64, len: usize) -> Vec<u8> {
        let addr = addr as usize;
        self.tiles[tile].spm.bytes[addr..addr + len].to_vec()
    }

    /// Configure an endpoint, the way the kernel tile would over the NoC.
    pub fn set_ep(&mut self, tile: usize, ep: u16, value: Ep) {
        self.tiles[tile].tcu.regs.set_ep(ep, &value);
    }

    /// Timed MMIO register write from the tile's core.
    pub fn cpu_write_reg(&mut self, tile: usize, addr: u64, value: u64) {
        let pkt = Packet::write(addr, value.to_le_bytes().to_vec());
        self.queue.sched(tile, 0, Work::CpuRequest(pkt));
    }

    pub fn cpu_write_unpriv(&mut self, tile: usize, reg: UnprivReg, value: u64) {
        self.cpu_write_reg(tile, reg as u64 * 8, value);
    }

    /// Functional register read, as the core would see it.
    pub fn cpu_read_unpriv(&mut self, tile: usize, reg: UnprivReg) -> u64 {
        self.tiles[tile].tcu.mmio_read(reg as u64 * 8)
    }

    /// Write a privileged register (e.g. the CORE_REQ response).
    pub fn cpu_write_priv(&mut self, tile: usize, reg: crate::tcu::regs::PrivReg, value: u64) {
        self.cpu_write_reg(tile, crate::tcu::regs::priv_reg_addr(reg), value);
    }

    /// Timed register write over the NoC, the way a remote kernel configures
    /// a tile (`offset` is relative to the register file).
    pub fn noc_write_reg(&mut self, from: usize, tile: usize, offset: u64, value: u64) {
        let addr = NocAddr::new(tile as u16, crate::tcu::MMIO_BASE + offset).to_raw();
        let mut pkt = Packet::write(addr, value.to_le_bytes().to_vec());
        pkt.sender = SenderState::Noc(crate::tcu::noc::NocSenderState {
            ptype: NocPacketType::WriteReq,
            origin: from as u16,
            cmd_id: 0,
            flags: crate::tcu::noc::NocFlags::empty(),
            result: Error::None,
        });
        self.queue.sched(tile, 0, Work::NocRequest(pkt));
    }

    /// Issue an LLC request and run to completion; returns the response.
    pub fn llc_request(&mut self, tile: usize, pkt: Packet) -> Option<Packet> {
        self.queue.sched(tile, 0, Work::LlcRequest(pkt));
        self.run();
        self.tiles[tile].tcu.llc_resp.take()
    }

    /// Functional access to the register file, bypassing ports and timing.
    pub fn reg_access(&mut self, tile: usize, addr: u64, words: &mut [u64], is_read: bool) {
        self.tiles[tile].tcu.regs.access(addr, words, is_read, RegAccess::Cpu);
    }
}
