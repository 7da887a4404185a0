use super::error::Error;
use super::noc::{
    MemCmd, NocAddr, NocFlags, NocPacketType, NocSenderState, Packet, SenderState,
};
use super::regs::{Cmd, CmdOp, MemFlags, UnprivReg, RegAccess};
use super::xfer::{TransferKind, XferFlags};
use super::Tcu;
use crate::sim::Ctx;

impl Tcu {
    /// Start a READ or WRITE command through a memory endpoint. The data
    /// region is moved chunk-wise: each chunk is one buffer-backed transfer
    /// plus one NoC request, and DATA/ARG1 advance as chunks complete.
    pub(crate) fn mem_start(&mut self, cmd: Cmd, ctx: &mut Ctx) {
        let Some(mep) = self.regs.get_mem_ep(cmd.ep) else {
            debug!(target: "TcuXfers", "EP{}: no memory EP", cmd.ep);
            self.schedule_finish(1, Error::NoMep, ctx);
            return;
        };
        let (cur_act, _) = self.regs.cur_act();
        if mep.act != cur_act {
            self.schedule_finish(1, Error::ForeignEp, ctx);
            return;
        }
        let needed = if cmd.op == CmdOp::Read { MemFlags::READ } else { MemFlags::WRITE };
        if !mep.flags.contains(needed) {
            debug!(target: "TcuXfers", "EP{}: operation not permitted (flags={:?})", cmd.ep, mep.flags);
            self.schedule_finish(1, Error::NoPerm, ctx);
            return;
        }

        let (_, size) = self.regs.data();
        let offset = self.regs.get_unpriv(UnprivReg::Arg1);
        if size == 0 {
            self.schedule_finish(1, Error::None, ctx);
            return;
        }
        match offset.checked_add(size as u64) {
            Some(end) if end <= mep.size => {}
            _ => {
                debug!(target: "TcuXfers", "EP{}: {:#x}+{:#x} out of bounds ({:#x})",
                    cmd.ep, offset, size, mep.size);
                self.schedule_finish(1, Error::OutOfBounds, ctx);
                return;
            }
        }

        if cmd.op == CmdOp::Read {
            self.mem_issue_read_chunk(ctx);
        } else {
            self.mem_collect_write_chunk(ctx);
        }
    }

    /// Request the next chunk of a READ from the remote tile.
    fn mem_issue_read_chunk(&mut self, ctx: &mut Ctx) {
        let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
        let Some(mep) = self.regs.get_mem_ep(cmd.ep) else {
            self.schedule_finish(1, Error::NoMep, ctx);
            return;
        };
        let (_, size) = self.regs.data();
        let offset = self.regs.get_unpriv(UnprivReg::Arg1);
        let chunk = size.min(self.params.max_noc_packet_size);
        self.mem_chunk = chunk;

        let dest = NocAddr::new(mep.target_tile, mep.target_addr + offset);
        debug!(target: "TcuXfers", "[rd -> {}] {:#x} bytes @ {:#x}", mep.target_tile, chunk, offset);
        let mut pkt = Packet::read(dest.to_raw(), chunk);
        pkt.sender = SenderState::Noc(NocSenderState {
            ptype: NocPacketType::ReadReq,
            origin: self.tile,
            cmd_id: self.cmd_id,
            flags: if cmd.nopf { NocFlags::NOPF } else { NocFlags::empty() },
            result: Error::None,
        });
        self.cmd_sent = true;
        self.send_noc_request(pkt, self.params.cmd_to_noc_latency, ctx);
    }

    /// A chunk of remote-read data arrived; commit it into the local data
    /// region through a transfer.
    pub(crate) fn mem_read_response(&mut self, pkt: Packet, noc: NocSenderState, ctx: &mut Ctx) {
        if noc.result != Error::None {
            self.schedule_finish(1, noc.result, ctx);
            return;
        }
        let (addr, _) = self.regs.data();
        let size = pkt.data.len();
        let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
        let flags = if cmd.nopf { XferFlags::NOPF } else { XferFlags::empty() };
        let id = self.start_transfer(
            TransferKind::ReadResult { payload: pkt.data },
            addr,
            size,
            flags,
            self.params.noc_to_transfer_latency,
            ctx,
        );
        self.cmd_xfer = Some(id);
    }

    /// The local commit of a read chunk finished; advance or complete.
    pub(crate) fn mem_read_chunk_done(&mut self, result: Error, ctx: &mut Ctx) {
        self.cmd_xfer = None;
        if result != Error::None {
            self.schedule_finish(1, result, ctx);
            return;
        }
        self.mem_advance_chunk(ctx, true);
    }

    /// Collect the next chunk of a WRITE from local memory.
    fn mem_collect_write_chunk(&mut self, ctx: &mut Ctx) {
        let cmd = Cmd::from_reg(self.regs.get_unpriv(UnprivReg::Command));
        let Some(mep) = self.regs.get_mem_ep(cmd.ep) else {
            self.schedule_finish(1, Error::NoMep, ctx);
            return;
        };
        let (addr, size) = self.regs.data();
        let offset = self.regs.get_unpriv(UnprivReg::Arg1);
        let chunk = size.min(self.params.max_noc_packet_size);
        self.mem_chunk = chunk;

        let dest = NocAddr::new(mep.target_tile, mep.target_addr + offset);
        debug!(target: "TcuXfers", "[wr -> {}] {:#x} bytes @ {:#x}", mep.target_tile, chunk, offset);
        let flags = if cmd.nopf { XferFlags::NOPF } else { XferFlags::empty() };
        let id = self.start_transfer(TransferKind::WriteChunk { dest }, addr, chunk, flags, 0, ctx);
        self.cmd_xfer = Some(id);
    }

    /// A write chunk has been collected into a buffer; emit the NoC request.
    pub(crate) fn mem_write_chunk_collected(
        &mut self,
        result: Error,
        dest: NocAddr,
        data: Vec<u8>,
        ctx: &mut Ctx,
    ) {
        self.cmd_xfer = None;
        if result != Error::None {
            self.schedule_finish(1, result, ctx);
            return;
        }
        let mut pkt = Packet::write(dest.to_raw(), data);
        pkt.sender = SenderState::Noc(NocSenderState {
            ptype: NocPacketType::WriteReq,
            origin: self.tile,
            cmd_id: self.cmd_id,
            flags: NocFlags::empty(),
            result: Error::None,
        });
        self.cmd_sent = true;
        self.send_noc_request(pkt, self.params.cmd_to_noc_latency, ctx);
    }

    /// The remote tile acknowledged a write chunk.
    pub(crate) fn mem_write_response(&mut self, noc: NocSenderState, ctx: &mut Ctx) {
        if noc.result != Error::None {
            self.schedule_finish(1, noc.result, ctx);
            return;
        }
        self.mem_advance_chunk(ctx, false);
    }

    fn mem_advance_chunk(&mut self, ctx: &mut Ctx, read: bool) {
        let (addr, size) = self.regs.data();
        let offset = self.regs.get_unpriv(UnprivReg::Arg1);
        let chunk = self.mem_chunk.min(size);
        self.regs.set_data(addr + chunk as u64, size - chunk);
        self.regs.set_unpriv(UnprivReg::Arg1, offset + chunk as u64, RegAccess::Tcu);

        if size - chunk > 0 {
            if read {
                self.mem_issue_read_chunk(ctx);
            } else {
                self.mem_collect_write_chunk(ctx);
            }
        } else {
            self.schedule_finish(1, Error::None, ctx);
        }
    }

    /// Serve a remote read request from local memory.
    pub(crate) fn mem_recv_remote_read(&mut self, pkt: Packet, noc: NocSenderState, ctx: &mut Ctx) {
        let offset = NocAddr::from_raw(pkt.addr).offset;
        let kind = TransferKind::RemoteRead { reply: noc, noc_addr: pkt.addr };
        self.start_transfer(
            kind,
            offset,
            pkt.size,
            XferFlags::NOXLATE | XferFlags::NOPF,
            self.params.noc_to_transfer_latency,
            ctx,
        );
    }

    /// Commit a remote write request to local memory.
    pub(crate) fn mem_recv_remote_write(&mut self, pkt: Packet, noc: NocSenderState, ctx: &mut Ctx) {
        let offset = NocAddr::from_raw(pkt.addr).offset;
        let size = pkt.data.len();
        let kind = TransferKind::RemoteWrite { reply: noc, noc_addr: pkt.addr, payload: pkt.data };
        self.start_transfer(
            kind,
            offset,
            size,
            XferFlags::NOXLATE | XferFlags::NOPF,
            self.params.noc_to_transfer_latency,
            ctx,
        );
    }

    /// A transfer serving a remote request finished; answer the NoC.
    pub(crate) fn mem_remote_done(
        &mut self,
        mut reply: NocSenderState,
        noc_addr: u64,
        result: Error,
        data: Vec<u8>,
        read: bool,
        ctx: &mut Ctx,
    ) {
        reply.result = result;
        let resp = Packet {
            addr: noc_addr,
            size: data.len(),
            cmd: if read { MemCmd::ReadResp } else { MemCmd::WriteResp },
            data,
            sender: SenderState::Noc(reply),
        };
        self.send_noc_response(resp, ctx);
    }
}
