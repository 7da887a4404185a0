pub mod core_reqs;
pub mod error;
pub mod mem;
pub mod msg;
pub mod noc;
pub mod ports;
pub mod regs;
pub mod tlb;
pub mod xfer;

use std::io::Write;

use byteorder::{ByteOrder, LE};

use crate::config::TcuParams;
use crate::sim::{Ctx, Work};
use core_reqs::CoreRequests;
use error::Error;
use msg::MsgUnit;
use noc::{MemCmd, NocAddr, NocPacketType, NocSenderState, Packet, SenderState};
use ports::SlavePort;
use regs::{
    ext_op, priv_op, Cmd, CmdOp, EpId, PrivReg, RegAccess, RegFile, SideCmd, UnprivReg,
};
use tlb::TcuTlb;
use xfer::XferUnit;

/// Base of the register-file MMIO window within a tile's NoC offset space;
/// everything below is backed by the tile's local memory.
pub const MMIO_BASE: u64 = 0xF000_0000;

bitflags::bitflags! {
    /// IRQ lines towards the local core.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Irq: u64 {
        const CORE_REQ = 1 << 0;
        const MSG = 1 << 1;
    }
}

#[derive(Default)]
pub struct Statistics {
    pub commands: [u64; 9],
    pub priv_commands: [u64; 4],
    pub ext_commands: [u64; 4],
    pub noc_msg_recvs: u64,
    pub noc_read_recvs: u64,
    pub noc_write_recvs: u64,
    pub reg_file_reqs: u64,
    pub int_mem_reqs: u64,
    pub ext_mem_reqs: u64,
    pub irq_injects: u64,
    pub resets: u64,
}

/// The per-tile trusted communication unit.
///
/// All externally visible state changes happen inside work items dispatched
/// by the owning tile; the struct itself is free of interior mutability.
pub struct Tcu {
    pub tile: u16,
    pub params: TcuParams,
    pub regs: RegFile,
    pub tlb: Option<TcuTlb>,
    pub xfer: XferUnit,
    pub msg: MsgUnit,
    pub core_reqs: CoreRequests,
    pub stats: Statistics,

    noc_slave: SlavePort,
    cache_slave: SlavePort,
    llc_slave: SlavePort,

    /// Id of the running unprivileged command; 0 when idle.
    cmd_id: u64,
    next_cmd_id: u64,
    /// Transfer owned by the running command, for aborts.
    cmd_xfer: Option<u64>,
    cmd_sent: bool,
    /// Outstanding chunk size of a READ/WRITE command.
    mem_chunk: usize,

    sleeping: bool,
    wake_ep: Option<EpId>,

    irqs: Irq,
    /// Response of the last LLC request, picked up by the cache model.
    pub llc_resp: Option<Packet>,
}

impl Tcu {
    pub fn new(tile: u16, params: TcuParams) -> Tcu {
        assert!(
            params.max_noc_packet_size <= params.buf_size,
            "NoC packets must fit into a transfer buffer"
        );
        let tlb = match params.tlb_entries {
            0 => None,
            n => Some(TcuTlb::new(n)),
        };
        Tcu {
            tile,
            regs: RegFile::new(params.num_eps),
            xfer: XferUnit::new(params.buf_count, params.buf_size, tlb.is_some()),
            tlb,
            msg: MsgUnit::new(),
            core_reqs: CoreRequests::new(),
            stats: Statistics::default(),
            noc_slave: SlavePort::new("noc_slave"),
            cache_slave: SlavePort::new("cache_slave"),
            llc_slave: SlavePort::new("llc_slave"),
            cmd_id: 0,
            next_cmd_id: 1,
            cmd_xfer: None,
            cmd_sent: false,
            mem_chunk: 0,
            sleeping: false,
            wake_ep: None,
            irqs: Irq::empty(),
            llc_resp: None,
            params,
        }
    }

    /// Dispatch one work item. This is the only entry point of the model;
    /// every suspension re-enters here with a tagged item.
    pub fn handle(&mut self, work: Work, ctx: &mut Ctx) {
        match work {
            Work::CpuRequest(pkt) => self.handle_cpu_request(pkt, ctx),
            Work::CpuRequestFinished => self.cpu_request_finished(ctx),
            Work::NocRequest(pkt) => self.handle_noc_request(pkt, ctx),
            Work::NocResponse(pkt) => self.complete_noc_request(pkt, ctx),
            Work::NocRequestFinished => self.noc_request_finished(ctx),
            Work::MemResponse(pkt) => self.complete_mem_request(pkt, ctx),
            Work::LlcRequest(pkt) => self.handle_llc_request(pkt, ctx),
            Work::ExecCommand => self.execute_command(ctx),
            Work::ExecPrivCommand => self.execute_priv_command(ctx),
            Work::ExecExtCommand => self.execute_ext_command(ctx),
            Work::AbortCommand => self.abort_command(ctx),
            Work::FinishCommand { cmd_id, error } => self.finish_command(cmd_id, error, ctx),
            Work::ProcessTransfer(id) => self.xfer_process(id, ctx),
            Work::CompleteCoreReqs => self.core_req_complete(ctx),
            Work::SleepTimeout { cmd_id } => self.sleep_timeout(cmd_id, ctx),
            Work::MemRequest(_) => unreachable!("memory requests are handled by the tile"),
        }
    }

    pub fn irqs(&self) -> Irq {
        self.irqs
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub(crate) fn set_irq(&mut self, irq: Irq, ctx: &mut Ctx) {
        if !self.irqs.contains(irq) {
            self.irqs |= irq;
            self.stats.irq_injects += 1;
        }
        // An interrupt always ends a sleep.
        self.stop_sleep(ctx);
    }

    fn stop_sleep(&mut self, ctx: &mut Ctx) {
        if !self.sleeping {
            return;
        }
        self.sleeping = false;
        let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
        if self.cmd_id != 0 && cmd.op == CmdOp::Sleep {
            self.schedule_finish(1, Error::None, ctx);
        }
    }

    fn clear_irq(&mut self, bits: u64) {
        self.irqs &= !Irq::from_bits_truncate(bits);
    }

    /// Functional register read, as the local core would see it.
    pub fn mmio_read(&mut self, addr: u64) -> u64 {
        let mut words = [0u64];
        self.regs.access(addr, &mut words, true, RegAccess::Cpu);
        words[0]
    }

    // -- command engine --

    fn execute_command(&mut self, ctx: &mut Ctx) {
        let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
        if cmd.op == CmdOp::Idle {
            return;
        }
        if self.cmd_id != 0 {
            error!(target: "TcuCmd", "command {:?} written while another is running", cmd.op);
            return;
        }
        self.cmd_id = self.next_cmd_id;
        self.next_cmd_id += 1;
        self.cmd_sent = false;
        debug!(target: "TcuCmd", "command[{}] {:?} ep={} arg={:#x}", self.cmd_id, cmd.op, cmd.ep, cmd.arg);
        if let CmdOp::Unknown(_) = cmd.op {
            self.schedule_finish(1, Error::UnknownCmd, ctx);
            return;
        }
        self.stats.commands[cmd.op_index()] += 1;

        match cmd.op {
            CmdOp::Send | CmdOp::Reply => self.msg_start_transmission(cmd, ctx),
            CmdOp::Read | CmdOp::Write => self.mem_start(cmd, ctx),
            CmdOp::FetchMsg => {
                let addr = self.msg_fetch(cmd.ep);
                self.regs.set_unpriv(UnprivReg::Arg1, addr, RegAccess::Tcu);
                self.schedule_finish(1, Error::None, ctx);
            }
            CmdOp::AckMsg => {
                let err = self.msg_ack(cmd.ep, u64::from(cmd.arg));
                self.schedule_finish(1, err, ctx);
            }
            CmdOp::Sleep => {
                let wake_ep = match cmd.arg as u16 {
                    0xFFFF => None,
                    ep => Some(ep),
                };
                let timeout = self.regs.get_unpriv(UnprivReg::Arg1);
                if !self.start_sleep(wake_ep, timeout, ctx) {
                    self.schedule_finish(1, Error::None, ctx);
                }
            }
            CmdOp::Print => {
                let (_, len) = self.regs.data();
                self.print_line(len);
                self.schedule_finish(1, Error::None, ctx);
            }
            CmdOp::Idle | CmdOp::Unknown(_) => unreachable!(),
        }
    }

    /// Schedule command completion with the given error. Stale completions
    /// (an earlier command, or one that was aborted meanwhile) are dropped
    /// by `finish_command`.
    pub(crate) fn schedule_finish(&mut self, delay: u64, error: Error, ctx: &mut Ctx) {
        ctx.sched(self.tile.into(), delay, Work::FinishCommand { cmd_id: self.cmd_id, error });
    }

    fn finish_command(&mut self, cmd_id: u64, error: Error, ctx: &mut Ctx) {
        if cmd_id != self.cmd_id || cmd_id == 0 {
            return;
        }
        let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
        debug!(target: "TcuCmd", "command[{}] {:?} finished: {:?}", cmd_id, cmd.op, error);

        match cmd.op {
            // Every failure after the credit check rolls the credit back.
            CmdOp::Send if error != Error::None => self.msg_finish_send(error, cmd.ep),
            // A successful reply consumes the original message.
            CmdOp::Reply if error == Error::None => {
                let _ = self.msg_ack(cmd.ep, u64::from(cmd.arg));
            }
            _ => {}
        }

        self.cmd_id = 0;
        self.cmd_xfer = None;
        self.cmd_sent = false;
        self.sleeping = false;
        self.regs.set_unpriv(
            UnprivReg::Command,
            Cmd { op: CmdOp::Idle, error, ..cmd }.to_reg(),
            RegAccess::Tcu,
        );
    }

    fn abort_command(&mut self, ctx: &mut Ctx) {
        let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
        if self.cmd_id == 0 || cmd.op == CmdOp::Idle {
            self.regs.set_unpriv(UnprivReg::Abort, 0, RegAccess::Tcu);
            return;
        }
        debug!(target: "TcuCmd", "command[{}] {:?} aborting (sent={})",
            self.cmd_id, cmd.op, self.cmd_sent);
        match self.cmd_xfer {
            // The abort drives the transfer's drain path, which completes the
            // command with the recorded error.
            Some(id) => self.xfer_abort(id, Error::Abort, ctx),
            None => self.schedule_finish(1, Error::Abort, ctx),
        }
        self.regs.set_unpriv(UnprivReg::Abort, 0, RegAccess::Tcu);
    }

    // -- privileged and external commands --

    fn execute_priv_command(&mut self, _ctx: &mut Ctx) {
        let cmd = SideCmd::from_reg(self.regs.get_priv(PrivReg::PrivCmd));
        let arg = self.regs.get_priv(PrivReg::PrivCmdArg);
        if cmd.op == priv_op::IDLE {
            return;
        }
        debug!(target: "TcuCmd", "priv command {} arg={:#x}", cmd.op, arg);
        let error = match cmd.op {
            priv_op::XCHG_ACT => {
                self.stats.priv_commands[priv_op::XCHG_ACT as usize] += 1;
                let old = self.regs.get_unpriv(UnprivReg::CurAct);
                self.regs.set_priv(PrivReg::OldAct, old, RegAccess::Tcu);
                self.regs.set_unpriv(UnprivReg::CurAct, arg & 0xFFFF_FFFF, RegAccess::Tcu);
                Error::None
            }
            priv_op::INV_PAGE => {
                self.stats.priv_commands[priv_op::INV_PAGE as usize] += 1;
                let asid = (cmd.arg & 0xFFFF) as u16;
                match self.tlb.as_mut() {
                    Some(tlb) => {
                        tlb.remove(arg, asid);
                        Error::None
                    }
                    None => Error::UnknownCmd,
                }
            }
            priv_op::INV_TLB => {
                self.stats.priv_commands[priv_op::INV_TLB as usize] += 1;
                match self.tlb.as_mut() {
                    Some(tlb) => {
                        tlb.clear();
                        Error::None
                    }
                    None => Error::UnknownCmd,
                }
            }
            _ => Error::UnknownCmd,
        };
        self.regs.set_priv(
            PrivReg::PrivCmd,
            SideCmd { op: priv_op::IDLE, error, arg: 0 }.to_reg(),
            RegAccess::Tcu,
        );
    }

    fn execute_ext_command(&mut self, ctx: &mut Ctx) {
        let cmd = SideCmd::from_reg(self.regs.get_ext(regs::ExtReg::ExtCmd));
        if cmd.op == ext_op::IDLE {
            return;
        }
        debug!(target: "TcuCmd", "ext command {} arg={:#x}", cmd.op, cmd.arg);
        let error = match cmd.op {
            ext_op::INV_EP => {
                self.stats.ext_commands[ext_op::INV_EP as usize] += 1;
                let ep = (cmd.arg & 0xFFFF) as EpId;
                let force = (cmd.arg >> 16) & 1 != 0;
                self.ext_invalidate_ep(ep, force)
            }
            ext_op::INV_REPLY => {
                self.stats.ext_commands[ext_op::INV_REPLY as usize] += 1;
                let rep = (cmd.arg & 0xFFFF) as EpId;
                let tile = ((cmd.arg >> 16) & 0xFFF) as u16;
                let sep = ((cmd.arg >> 32) & 0xFFFF) as EpId;
                self.msg_invalidate_reply(rep, tile, sep)
            }
            ext_op::RESET => {
                self.stats.ext_commands[ext_op::RESET as usize] += 1;
                self.reset(ctx);
                Error::None
            }
            _ => Error::UnknownCmd,
        };
        self.regs.set_ext(
            regs::ExtReg::ExtCmd,
            SideCmd { op: ext_op::IDLE, error, arg: 0 }.to_reg(),
            RegAccess::Tcu,
        );
    }

    fn ext_invalidate_ep(&mut self, ep: EpId, force: bool) -> Error {
        if usize::from(ep) >= self.regs.num_eps() {
            return Error::InvEp;
        }
        if !force {
            match self.regs.get_ep(ep) {
                // Outstanding credits would be lost.
                regs::Ep::Send(sep) if !sep.is_unlimited() && sep.cur_crd != sep.max_crd => {
                    return Error::MissCredits;
                }
                // Unread messages would be lost.
                regs::Ep::Receive(rep) if rep.msg_count() > 0 => return Error::InvMsg,
                _ => {}
            }
        }
        self.regs.invalidate_ep(ep);
        Error::None
    }

    fn reset(&mut self, ctx: &mut Ctx) {
        debug!(target: "TcuCmd", "tile reset");
        self.stats.resets += 1;
        if let Some(tlb) = self.tlb.as_mut() {
            tlb.clear();
        }
        self.xfer_abort_local(true, ctx);
        self.core_reqs.clear();
        self.regs.set_priv(PrivReg::CoreReq, 0, RegAccess::Tcu);
        self.irqs = Irq::empty();
        self.sleeping = false;
        self.cmd_id = 0;
        self.cmd_xfer = None;
        self.regs.set_unpriv(UnprivReg::Command, 0, RegAccess::Tcu);
    }

    // -- sleep --

    fn start_sleep(&mut self, wake_ep: Option<EpId>, timeout: u64, ctx: &mut Ctx) -> bool {
        if self.has_message(wake_ep) || !self.irqs.is_empty() {
            return false;
        }
        debug!(target: "TcuCmd", "sleeping (wake_ep={:?}, timeout={})", wake_ep, timeout);
        self.sleeping = true;
        self.wake_ep = wake_ep;
        if timeout != 0 {
            ctx.sched(self.tile.into(), timeout, Work::SleepTimeout { cmd_id: self.cmd_id });
        }
        true
    }

    fn sleep_timeout(&mut self, cmd_id: u64, ctx: &mut Ctx) {
        if cmd_id == self.cmd_id && self.sleeping {
            self.sleeping = false;
            self.schedule_finish(1, Error::None, ctx);
        }
    }

    fn has_message(&self, ep: Option<EpId>) -> bool {
        match ep {
            Some(ep) => self.regs.get_recv_ep(ep).map(|r| r.msg_count() > 0).unwrap_or(false),
            None => self.regs.cur_act().1 > 0,
        }
    }

    /// Wake the core on message arrival; `ep` names the endpoint the message
    /// landed on.
    pub(crate) fn wakeup_core(&mut self, ep: Option<EpId>, ctx: &mut Ctx) {
        if !self.sleeping {
            return;
        }
        let wakes = match (self.wake_ep, ep) {
            (None, _) | (_, None) => true,
            (Some(w), Some(e)) => w == e,
        };
        if wakes {
            debug!(target: "TcuCmd", "waking up core");
            self.stop_sleep(ctx);
        }
    }

    fn print_line(&mut self, len: usize) {
        let bytes = self.regs.print_bytes(len);
        info!(target: "TcuPrint", "{}", String::from_utf8_lossy(&bytes));
    }

    // -- CPU side --

    fn handle_cpu_request(&mut self, pkt: Packet, ctx: &mut Ctx) {
        // A second access while one is in flight waits for the retry.
        let Some(pkt) = self.cache_slave.recv_timing_req(pkt) else { return };
        self.stats.reg_file_reqs += 1;
        let is_read = pkt.cmd.is_read();
        let mut words = packet_words(&pkt);
        let wrote = self.regs.access(pkt.addr, &mut words, is_read, RegAccess::Cpu);
        self.handle_reg_wrote(wrote, ctx);
        ctx.sched(self.tile.into(), self.params.register_access_latency, Work::CpuRequestFinished);
    }

    fn cpu_request_finished(&mut self, ctx: &mut Ctx) {
        if let Some(retry) = self.cache_slave.request_finished() {
            ctx.sched(self.tile.into(), 1, Work::CpuRequest(retry));
        }
    }

    /// React to writes of engine-triggering registers, independent of where
    /// the write came from. Endpoint-validity changes are complete at this
    /// point; everything below only schedules follow-up work.
    fn handle_reg_wrote(&mut self, wrote: regs::Wrote, ctx: &mut Ctx) {
        let lat = self.params.register_access_latency;
        if wrote.contains(regs::Wrote::CMD) {
            let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
            if cmd.op != CmdOp::Idle {
                ctx.sched(self.tile.into(), lat, Work::ExecCommand);
            }
        }
        if wrote.contains(regs::Wrote::ABORT) {
            ctx.sched(self.tile.into(), lat, Work::AbortCommand);
        }
        if wrote.contains(regs::Wrote::PRINT) {
            let len = self.regs.get_unpriv(UnprivReg::Print) as usize;
            self.print_line(len);
        }
        if wrote.contains(regs::Wrote::PRIV_CMD) {
            ctx.sched(self.tile.into(), lat, Work::ExecPrivCommand);
        }
        if wrote.contains(regs::Wrote::EXT_CMD) {
            ctx.sched(self.tile.into(), lat, Work::ExecExtCommand);
        }
        if wrote.contains(regs::Wrote::CORE_REQ) {
            ctx.sched(self.tile.into(), lat, Work::CompleteCoreReqs);
        }
        if wrote.contains(regs::Wrote::CLEAR_IRQ) {
            let bits = self.regs.get_priv(PrivReg::ClearIrq);
            self.clear_irq(bits);
        }
    }

    // -- NoC side --

    pub(crate) fn send_noc_request(&mut self, pkt: Packet, delay: u64, ctx: &mut Ctx) {
        let dest = NocAddr::from_raw(pkt.addr).tile;
        trace!(target: "TcuPort", "sending {:?} to tile {} at {:#x} ({} bytes)",
            pkt.cmd, dest, pkt.addr, pkt.size);
        ctx.sched(dest.into(), delay, Work::NocRequest(pkt));
    }

    pub(crate) fn send_noc_response(&mut self, pkt: Packet, ctx: &mut Ctx) {
        assert!(matches!(pkt.sender, SenderState::Noc(_)), "NoC response without sender state");
        // Every deliverable response goes back to its own origin.
        for pkt in self.noc_slave.send_response(pkt) {
            let SenderState::Noc(noc) = pkt.sender else { continue };
            ctx.sched(noc.origin.into(), 1, Work::NocResponse(pkt));
        }
    }

    pub(crate) fn send_noc_response_for(
        &mut self,
        req: Packet,
        mut noc: NocSenderState,
        result: Error,
        data: Vec<u8>,
        ctx: &mut Ctx,
    ) {
        noc.result = result;
        let mut resp = req.into_response(data);
        resp.sender = SenderState::Noc(noc);
        self.send_noc_response(resp, ctx);
        ctx.sched(self.tile.into(), 1, Work::NocRequestFinished);
    }

    fn handle_noc_request(&mut self, pkt: Packet, ctx: &mut Ctx) {
        let SenderState::Noc(noc) = pkt.sender else {
            error!(target: "TcuPort", "NoC request without sender state");
            return;
        };

        // Functional accesses are served by the tile and never get here.
        let Some(pkt) = self.noc_slave.recv_timing_req(pkt) else { return };
        match noc.ptype {
            NocPacketType::Message => {
                self.stats.noc_msg_recvs += 1;
                self.msg_recv_from_noc(pkt, noc, ctx);
            }
            _ => self.handle_noc_mem_request(pkt, noc, ctx),
        }
    }

    /// Remote reads and writes: the register-file window is dispatched to the
    /// register file, everything else to the local memory.
    fn handle_noc_mem_request(&mut self, pkt: Packet, noc: NocSenderState, ctx: &mut Ctx) {
        let offset = NocAddr::from_raw(pkt.addr).offset;
        if offset >= MMIO_BASE && offset < MMIO_BASE + self.regs.size() {
            self.stats.reg_file_reqs += 1;
            let is_read = pkt.cmd.is_read();
            let mut words = packet_words(&pkt);
            let wrote = self.regs.access(offset - MMIO_BASE, &mut words, is_read, RegAccess::Noc);
            let data = if is_read { words_to_bytes(&words) } else { Vec::new() };
            self.handle_reg_wrote(wrote, ctx);
            self.send_noc_response_for(pkt, noc, Error::None, data, ctx);
            return;
        }

        match pkt.cmd {
            MemCmd::ReadReq => {
                self.stats.noc_read_recvs += 1;
                self.mem_recv_remote_read(pkt, noc, ctx);
            }
            MemCmd::WriteReq => {
                self.stats.noc_write_recvs += 1;
                self.mem_recv_remote_write(pkt, noc, ctx);
            }
            _ => error!(target: "TcuPort", "unexpected NoC request {:?}", pkt.cmd),
        }
    }

    fn noc_request_finished(&mut self, ctx: &mut Ctx) {
        if let Some(retry) = self.noc_slave.request_finished() {
            ctx.sched(self.tile.into(), 1, Work::NocRequest(retry));
        }
    }

    fn complete_noc_request(&mut self, pkt: Packet, ctx: &mut Ctx) {
        let SenderState::Noc(noc) = pkt.sender else {
            error!(target: "TcuPort", "NoC response without sender state");
            return;
        };
        match noc.ptype {
            NocPacketType::Message => {
                if noc.cmd_id != self.cmd_id || self.cmd_id == 0 {
                    trace!(target: "TcuPort", "ignoring late message response (cmd {})", noc.cmd_id);
                    return;
                }
                self.schedule_finish(1, noc.result, ctx);
            }
            NocPacketType::ReadReq => {
                if noc.cmd_id != self.cmd_id || self.cmd_id == 0 {
                    return;
                }
                self.mem_read_response(pkt, noc, ctx);
            }
            NocPacketType::WriteReq => {
                if noc.cmd_id != self.cmd_id || self.cmd_id == 0 {
                    return;
                }
                self.mem_write_response(noc, ctx);
            }
            NocPacketType::CacheMemReq | NocPacketType::CacheMemReqFunc => {
                self.llc_complete(pkt, ctx);
            }
        }
    }

    pub(crate) fn complete_mem_request(&mut self, pkt: Packet, ctx: &mut Ctx) {
        self.stats.int_mem_reqs += 1;
        let SenderState::Mem { xfer, .. } = pkt.sender else {
            error!(target: "TcuPort", "memory response without sender state");
            return;
        };
        self.xfer_recv_mem_response(xfer, Some(pkt), ctx);
    }

    // -- LLC side --

    /// Cache-to-memory traffic passes through the TCU and is re-addressed
    /// into the memory tile's NoC range.
    fn handle_llc_request(&mut self, pkt: Packet, ctx: &mut Ctx) {
        let Some(mut pkt) = self.llc_slave.recv_timing_req(pkt) else { return };
        if pkt.addr + pkt.size as u64 > self.params.mem_region_size {
            error!(target: "TcuPort", "LLC request at {:#x} out of range", pkt.addr);
            let size = pkt.size;
            self.llc_resp = Some(pkt.into_response(vec![0; size]));
            if let Some(retry) = self.llc_slave.request_finished() {
                ctx.sched(self.tile.into(), 1, Work::LlcRequest(retry));
            }
            return;
        }
        self.stats.ext_mem_reqs += 1;
        let dest = NocAddr::new(self.params.mem_tile, self.params.mem_offset + pkt.addr);
        pkt.addr = dest.to_raw();
        pkt.sender = SenderState::Noc(NocSenderState {
            ptype: NocPacketType::CacheMemReq,
            origin: self.tile,
            cmd_id: 0,
            flags: noc::NocFlags::empty(),
            result: Error::None,
        });
        self.send_noc_request(pkt, self.params.cmd_to_noc_latency, ctx);
    }

    fn llc_complete(&mut self, pkt: Packet, ctx: &mut Ctx) {
        self.llc_resp = Some(pkt);
        if let Some(retry) = self.llc_slave.request_finished() {
            ctx.sched(self.tile.into(), 1, Work::LlcRequest(retry));
        }
    }

    pub fn print_stats(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        writeln!(writer, "Tile {}", self.tile)?;
        writeln!(writer, "Commands         {:?}", self.stats.commands)?;
        writeln!(writer, "NocMsgRecvs      {}", self.stats.noc_msg_recvs)?;
        writeln!(writer, "NocReadRecvs     {}", self.stats.noc_read_recvs)?;
        writeln!(writer, "NocWriteRecvs    {}", self.stats.noc_write_recvs)?;
        writeln!(writer, "RegFileReqs      {}", self.stats.reg_file_reqs)?;
        writeln!(writer, "IntMemReqs       {}", self.stats.int_mem_reqs)?;
        writeln!(writer, "IrqInjects       {}", self.stats.irq_injects)?;
        self.msg.print_stats(writer)?;
        self.xfer.print_stats(writer)?;
        self.core_reqs.print_stats(writer)?;
        if let Some(tlb) = &self.tlb {
            tlb.print_stats(writer)?;
        }
        Ok(())
    }
}

impl Cmd {
    fn op_index(&self) -> usize {
        match self.op {
            CmdOp::Idle => 0,
            CmdOp::Send => 1,
            CmdOp::Reply => 2,
            CmdOp::Read => 3,
            CmdOp::Write => 4,
            CmdOp::FetchMsg => 5,
            CmdOp::AckMsg => 6,
            CmdOp::Sleep => 7,
            CmdOp::Print => 8,
            CmdOp::Unknown(_) => 0,
        }
    }
}

/// View packet data as register words, zero-padded for reads and for a
/// trailing partial word.
fn packet_words(pkt: &Packet) -> Vec<u64> {
    if pkt.cmd.is_read() {
        vec![0; (pkt.size + 7) / 8]
    } else {
        pkt.data
            .chunks(8)
            .map(|c| {
                let mut word = [0u8; 8];
                word[..c.len()].copy_from_slice(c);
                LE::read_u64(&word)
            })
            .collect()
    }
}

fn words_to_bytes(words: &[u64]) -> Vec<u8> {
    let mut bytes = vec![0; words.len() * 8];
    for (i, w) in words.iter().enumerate() {
        LE::write_u64(&mut bytes[i * 8..(i + 1) * 8], *w);
    }
    bytes
}
