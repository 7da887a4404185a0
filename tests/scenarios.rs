//! End-to-end scenarios: two or three tiles exchanging messages and memory
//! traffic through their TCUs, driven the way software drives the hardware
//! (register writes, then letting the simulation settle).

use tilesim::config::{Config, TcuParams};
use tilesim::sim::System;
use tilesim::tcu::error::Error;
use tilesim::tcu::msg::check_recv_invariants;
use tilesim::tcu::noc::{Header, HeaderFlags, MemCmd, Packet, HEADER_SIZE};
use tilesim::tcu::regs::{
    ext_op, ext_reg_addr, Cmd, CmdOp, Ep, ExtReg, MemEp, MemFlags, PrivReg, RecvEp, SendEp,
    SendFlags, SideCmd, UnprivReg, INVALID_ACT, NO_REPLIES, UNLIM_CREDITS,
};
use tilesim::tcu::tlb::TlbFlags;

const A: usize = 0;
const B: usize = 1;

/// The common scenario configuration: 16 EPs, 4 buffers of 64 bytes,
/// 64-byte message slots.
fn config() -> Config {
    Config {
        tiles: 2,
        mem_size: 0x10000,
        tcu: TcuParams {
            num_eps: 16,
            max_noc_packet_size: 64,
            block_size: 64,
            buf_count: 4,
            buf_size: 64,
            ..TcuParams::default()
        },
    }
}

fn send_ep(target: (u16, u16), label: u64, crd: u8) -> Ep {
    Ep::Send(SendEp {
        act: INVALID_ACT,
        target_tile: target.0,
        target_ep: target.1,
        label,
        msg_size: 6,
        max_crd: crd,
        cur_crd: crd,
        crd_ep: 0,
        flags: SendFlags::empty(),
    })
}

fn recv_ep(buf_addr: u64, size: u8, reply_eps: u16) -> Ep {
    Ep::Receive(RecvEp {
        act: INVALID_ACT,
        buf_addr,
        size,
        msg_size: 6,
        reply_eps,
        occupied: 0,
        unread: 0,
        rd_pos: 0,
        wr_pos: 0,
    })
}

fn data_reg(addr: u64, size: usize) -> u64 {
    addr | ((size as u64) << 32)
}

fn submit(sys: &mut System, tile: usize, op: CmdOp, ep: u16, arg: u32) {
    let cmd = Cmd { op, ep, nopf: false, error: Error::None, arg };
    sys.cpu_write_unpriv(tile, UnprivReg::Command, cmd.to_reg());
    sys.run();
}

/// The command must have completed; returns its error code.
fn finished(sys: &mut System, tile: usize) -> Error {
    let cmd = Cmd::from_reg(sys.cpu_read_unpriv(tile, UnprivReg::Command));
    assert_eq!(cmd.op, CmdOp::Idle, "command still running");
    cmd.error
}

fn send(sys: &mut System, tile: usize, ep: u16, addr: u64, data: &[u8], reply_ep: u16) -> Error {
    sys.write_mem(tile, addr, data);
    sys.cpu_write_unpriv(tile, UnprivReg::Data, data_reg(addr, data.len()));
    sys.cpu_write_unpriv(tile, UnprivReg::Arg1, 0xBB);
    submit(sys, tile, CmdOp::Send, ep, u32::from(reply_ep));
    finished(sys, tile)
}

#[test]
fn ping_and_reply() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));
    sys.set_ep(A, 3, recv_ep(0x2000, 0, NO_REPLIES));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, 5));

    assert_eq!(send(&mut sys, A, 2, 0x100, b"ABCDEFGH", 3), Error::None);
    assert_eq!(sys.tcu(A).regs.get_send_ep(2).unwrap().cur_crd, 0);

    let rep = sys.tcu(B).regs.get_recv_ep(4).unwrap();
    assert_eq!(rep.msg_count(), 1);
    check_recv_invariants(&rep);

    // Fetch yields the first ring slot; header and body match the send.
    submit(&mut sys, B, CmdOp::FetchMsg, 4, 0);
    assert_eq!(finished(&mut sys, B), Error::None);
    let msg_addr = sys.cpu_read_unpriv(B, UnprivReg::Arg1);
    assert_eq!(msg_addr, 0x1000);

    let raw = sys.read_mem(B, msg_addr, HEADER_SIZE + 8);
    let header = Header::decode(&raw).unwrap();
    assert_eq!(header.length, 8);
    assert_eq!(header.label, 0xA);
    assert_eq!(header.sender_tile, A as u8);
    assert_eq!(header.sender_ep, 2);
    assert_eq!(header.reply_ep, 3);
    assert_eq!(header.reply_label, 0xBB);
    assert!(header.flags.contains(HeaderFlags::REPLY_ENABLED));
    assert_eq!(&raw[HEADER_SIZE..], b"ABCDEFGH");

    // The reply EP was installed for the slot.
    let reply_sep = sys.tcu(B).regs.get_send_ep(5).unwrap();
    assert!(reply_sep.flags.contains(SendFlags::REPLY));
    assert_eq!(reply_sep.target_tile, A as u16);
    assert_eq!(reply_sep.crd_ep, 2);

    sys.write_mem(B, 0x300, b"OK");
    sys.cpu_write_unpriv(B, UnprivReg::Data, data_reg(0x300, 2));
    submit(&mut sys, B, CmdOp::Reply, 4, (msg_addr - 0x1000) as u32);
    assert_eq!(finished(&mut sys, B), Error::None);

    // The credit came back, the slot is released, the reply EP is consumed.
    assert_eq!(sys.tcu(A).regs.get_send_ep(2).unwrap().cur_crd, 1);
    let rep = sys.tcu(B).regs.get_recv_ep(4).unwrap();
    assert_eq!(rep.occupied, 0);
    check_recv_invariants(&rep);
    assert!(sys.tcu(B).regs.get_send_ep(5).is_none());

    // The reply body arrived on A's reply endpoint.
    let rep = sys.tcu(A).regs.get_recv_ep(3).unwrap();
    assert_eq!(rep.msg_count(), 1);
    let raw = sys.read_mem(A, 0x2000, HEADER_SIZE + 2);
    let header = Header::decode(&raw).unwrap();
    assert!(header.flags.contains(HeaderFlags::REPLY | HeaderFlags::GRANT_CREDITS));
    assert_eq!(header.label, 0xBB);
    assert_eq!(&raw[HEADER_SIZE..], b"OK");
}

#[test]
fn credit_exhaustion() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 2));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, NO_REPLIES));

    assert_eq!(send(&mut sys, A, 2, 0x100, b"one", 0xFFFF), Error::None);
    assert_eq!(send(&mut sys, A, 2, 0x100, b"two", 0xFFFF), Error::None);
    // The third send fails without touching any state.
    assert_eq!(send(&mut sys, A, 2, 0x100, b"three", 0xFFFF), Error::MissCredits);

    let sep = sys.tcu(A).regs.get_send_ep(2).unwrap();
    assert_eq!(sep.cur_crd, 0);
    assert_eq!(sep.max_crd, 2);
    assert_eq!(sys.tcu(B).regs.get_recv_ep(4).unwrap().msg_count(), 2);
}

#[test]
fn ring_overflow() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, UNLIM_CREDITS));
    // Ring capacity 2.
    sys.set_ep(B, 4, recv_ep(0x1000, 1, NO_REPLIES));

    assert_eq!(send(&mut sys, A, 2, 0x100, b"one", 0xFFFF), Error::None);
    assert_eq!(send(&mut sys, A, 2, 0x100, b"two", 0xFFFF), Error::None);
    assert_eq!(send(&mut sys, A, 2, 0x100, b"three", 0xFFFF), Error::NoRingSpace);

    assert_eq!(sys.tcu(B).msg.stats.no_space, 1);
    let rep = sys.tcu(B).regs.get_recv_ep(4).unwrap();
    assert_eq!(rep.msg_count(), 2);
    check_recv_invariants(&rep);
}

#[test]
fn abort_during_translation() {
    let mut cfg = config();
    cfg.tcu.tlb_entries = 8;
    cfg.tcu.buf_size = 8192;
    cfg.tcu.max_noc_packet_size = 8192;
    let mut sys = System::new(&cfg);
    sys.tcu_mut(B).tlb = None;

    sys.set_ep(A, 2, Ep::Send(SendEp {
        act: INVALID_ACT,
        target_tile: B as u16,
        target_ep: 4,
        label: 0xA,
        msg_size: 13,
        max_crd: 1,
        cur_crd: 1,
        crd_ep: 0,
        flags: SendFlags::empty(),
    }));
    sys.set_ep(B, 4, Ep::Receive(RecvEp {
        act: INVALID_ACT,
        buf_addr: 0x1000,
        size: 0,
        msg_size: 13,
        reply_eps: NO_REPLIES,
        occupied: 0,
        unread: 0,
        rd_pos: 0,
        wr_pos: 0,
    }));

    // 4 KiB send through an unmapped page: the transfer suspends in
    // translation, waiting for the core.
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x5000, 4096));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0);
    let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 0xFFFF };
    sys.cpu_write_unpriv(A, UnprivReg::Command, cmd.to_reg());
    sys.run();

    assert_eq!(Cmd::from_reg(sys.cpu_read_unpriv(A, UnprivReg::Command)).op, CmdOp::Send);
    assert_eq!(sys.tcu(A).regs.get_priv(PrivReg::CoreReq) & 0xF, 2, "translate request raised");

    sys.cpu_write_unpriv(A, UnprivReg::Abort, 1);
    sys.run();

    assert_eq!(finished(&mut sys, A), Error::Abort);
    // The translate request is gone, the credit is restored, and nothing
    // landed at the destination.
    assert_eq!(sys.tcu(A).regs.get_priv(PrivReg::CoreReq), 0);
    assert_eq!(sys.tcu(A).regs.get_send_ep(2).unwrap().cur_crd, 1);
    assert_eq!(sys.tcu(B).regs.get_recv_ep(4).unwrap().msg_count(), 0);
    assert!(sys.read_mem(B, 0x1000, 64).iter().all(|&b| b == 0));
}

#[test]
fn double_reply_fails() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));
    sys.set_ep(A, 3, recv_ep(0x2000, 0, NO_REPLIES));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, 5));

    assert_eq!(send(&mut sys, A, 2, 0x100, b"ping", 3), Error::None);
    submit(&mut sys, B, CmdOp::FetchMsg, 4, 0);
    let msg_addr = sys.cpu_read_unpriv(B, UnprivReg::Arg1);
    let offset = (msg_addr - 0x1000) as u32;

    sys.write_mem(B, 0x300, b"OK");
    sys.cpu_write_unpriv(B, UnprivReg::Data, data_reg(0x300, 2));
    submit(&mut sys, B, CmdOp::Reply, 4, offset);
    assert_eq!(finished(&mut sys, B), Error::None);

    // The slot was acked and its reply EP invalidated; replying again to the
    // same slot must fail.
    sys.cpu_write_unpriv(B, UnprivReg::Data, data_reg(0x300, 2));
    submit(&mut sys, B, CmdOp::Reply, 4, offset);
    assert_eq!(finished(&mut sys, B), Error::InvEp);
}

#[test]
fn remote_read_and_write() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 1, Ep::Memory(MemEp {
        act: INVALID_ACT,
        target_tile: B as u16,
        target_addr: 0x2000,
        size: 0x1000,
        flags: MemFlags::RW,
    }));

    let pattern: Vec<u8> = (0..0x80u32).map(|i| (i * 7) as u8).collect();
    sys.write_mem(B, 0x2040, &pattern);

    // READ(ep, local=0x500, off=0x40, size=0x80): spans two NoC chunks.
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x500, 0x80));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0x40);
    submit(&mut sys, A, CmdOp::Read, 1, 0);
    assert_eq!(finished(&mut sys, A), Error::None);
    assert_eq!(sys.read_mem(A, 0x500, 0x80), pattern);

    // WRITE back to a different offset.
    let pattern2: Vec<u8> = (0..0x80u32).map(|i| (i * 13 + 1) as u8).collect();
    sys.write_mem(A, 0x600, &pattern2);
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x600, 0x80));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0x200);
    submit(&mut sys, A, CmdOp::Write, 1, 0);
    assert_eq!(finished(&mut sys, A), Error::None);
    assert_eq!(sys.read_mem(B, 0x2200, 0x80), pattern2);
}

#[test]
fn memory_ep_checks() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 1, Ep::Memory(MemEp {
        act: INVALID_ACT,
        target_tile: B as u16,
        target_addr: 0x2000,
        size: 0x1000,
        flags: MemFlags::READ,
    }));

    // Write through a read-only EP.
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x600, 0x10));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0);
    submit(&mut sys, A, CmdOp::Write, 1, 0);
    assert_eq!(finished(&mut sys, A), Error::NoPerm);

    // Out-of-bounds read.
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x500, 0x80));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0xFFF0);
    submit(&mut sys, A, CmdOp::Read, 1, 0);
    assert_eq!(finished(&mut sys, A), Error::OutOfBounds);

    // READ through a send EP.
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0, 1));
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x500, 0x10));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0);
    submit(&mut sys, A, CmdOp::Read, 2, 0);
    assert_eq!(finished(&mut sys, A), Error::NoMep);
}

#[test]
fn fetch_empty_and_ack() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, 5));

    // Fetching from an empty ring yields the sentinel.
    submit(&mut sys, B, CmdOp::FetchMsg, 4, 0);
    assert_eq!(finished(&mut sys, B), Error::None);
    assert_eq!(sys.cpu_read_unpriv(B, UnprivReg::Arg1), u64::MAX);

    assert_eq!(send(&mut sys, A, 2, 0x100, b"hi", 0xFFFF), Error::None);
    submit(&mut sys, B, CmdOp::FetchMsg, 4, 0);
    let msg_addr = sys.cpu_read_unpriv(B, UnprivReg::Arg1);
    assert_eq!(msg_addr, 0x1000);
    assert!(sys.tcu(B).regs.get_send_ep(5).is_some());

    // ACK releases the slot and consumes the reply EP.
    submit(&mut sys, B, CmdOp::AckMsg, 4, (msg_addr - 0x1000) as u32);
    assert_eq!(finished(&mut sys, B), Error::None);
    let rep = sys.tcu(B).regs.get_recv_ep(4).unwrap();
    assert_eq!(rep.occupied, 0);
    assert_eq!(rep.msg_count(), 0);
    assert!(sys.tcu(B).regs.get_send_ep(5).is_none());

    // Acking the same slot again is an error.
    submit(&mut sys, B, CmdOp::AckMsg, 4, 0);
    assert_eq!(finished(&mut sys, B), Error::InvMsg);
}

#[test]
fn unlimited_credits_suppress_return() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, UNLIM_CREDITS));
    sys.set_ep(A, 3, recv_ep(0x2000, 0, NO_REPLIES));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, 5));

    assert_eq!(send(&mut sys, A, 2, 0x100, b"ping", 3), Error::None);

    // The header carries the sentinel instead of the sending EP.
    let raw = sys.read_mem(B, 0x1000, HEADER_SIZE);
    let header = Header::decode(&raw).unwrap();
    assert_eq!(usize::from(header.sender_ep), 16);

    submit(&mut sys, B, CmdOp::FetchMsg, 4, 0);
    sys.write_mem(B, 0x300, b"OK");
    sys.cpu_write_unpriv(B, UnprivReg::Data, data_reg(0x300, 2));
    submit(&mut sys, B, CmdOp::Reply, 4, 0);
    assert_eq!(finished(&mut sys, B), Error::None);

    // The reply arrived, and the unlimited EP is untouched.
    assert_eq!(sys.tcu(A).regs.get_recv_ep(3).unwrap().msg_count(), 1);
    assert_eq!(sys.tcu(A).regs.get_send_ep(2).unwrap().cur_crd, UNLIM_CREDITS);
}

#[test]
fn oversized_send_rejected() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, NO_REPLIES));

    // 60 bytes of payload exceed the 64-byte slot once the header is added.
    let data = [0x55u8; 60];
    assert_eq!(send(&mut sys, A, 2, 0x100, &data, 0xFFFF), Error::OutOfBounds);
    // The check happens before the credit is paid.
    assert_eq!(sys.tcu(A).regs.get_send_ep(2).unwrap().cur_crd, 1);
}

#[test]
fn sleep_until_message() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 3, recv_ep(0x2000, 1, NO_REPLIES));
    sys.set_ep(B, 2, send_ep((A as u16, 3), 0x5, 1));

    // A goes to sleep waiting on EP3, then B's message wakes it.
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0);
    let cmd = Cmd { op: CmdOp::Sleep, ep: 0, nopf: false, error: Error::None, arg: 3 };
    sys.cpu_write_unpriv(A, UnprivReg::Command, cmd.to_reg());

    sys.write_mem(B, 0x100, b"wake");
    sys.cpu_write_unpriv(B, UnprivReg::Data, data_reg(0x100, 4));
    sys.cpu_write_unpriv(B, UnprivReg::Arg1, 0);
    let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 0xFFFF };
    sys.cpu_write_unpriv(B, UnprivReg::Command, cmd.to_reg());

    sys.run();
    assert_eq!(finished(&mut sys, A), Error::None);
    assert!(!sys.tcu(A).is_sleeping());
    assert_eq!(sys.tcu(A).regs.get_recv_ep(3).unwrap().msg_count(), 1);
}

#[test]
fn sleep_timeout_expires() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 3, recv_ep(0x2000, 1, NO_REPLIES));

    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 200);
    let cmd = Cmd { op: CmdOp::Sleep, ep: 0, nopf: false, error: Error::None, arg: 3 };
    sys.cpu_write_unpriv(A, UnprivReg::Command, cmd.to_reg());
    sys.run();

    assert_eq!(finished(&mut sys, A), Error::None);
    assert!(sys.cycle() >= 200);
}

#[test]
fn translation_resolved_by_core() {
    let mut cfg = config();
    cfg.tcu.tlb_entries = 8;
    let mut sys = System::new(&cfg);
    sys.tcu_mut(B).tlb = None;

    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, NO_REPLIES));

    // Payload lives at physical 0x8100, reached through virtual 0x5100.
    sys.write_mem(A, 0x8100, b"mapped!!");
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x5100, 8));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0);
    let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 0xFFFF };
    sys.cpu_write_unpriv(A, UnprivReg::Command, cmd.to_reg());
    sys.run();

    // The transfer suspended on a translate request; answer it.
    let req = sys.tcu(A).regs.get_priv(PrivReg::CoreReq);
    assert_eq!(req & 0xF, 2);
    assert_eq!(req >> 24, 0x5);
    let resp = 3 | (u64::from(TlbFlags::RW.bits()) << 4) | (0x8 << 24);
    sys.cpu_write_priv(A, PrivReg::CoreReq, resp);
    sys.run();

    assert_eq!(finished(&mut sys, A), Error::None);
    let raw = sys.read_mem(B, 0x1000, HEADER_SIZE + 8);
    assert_eq!(&raw[HEADER_SIZE..], b"mapped!!");

    // The entry was inserted; a second send hits the TLB without a request.
    assert_eq!(sys.tcu(A).regs.get_priv(PrivReg::CoreReq), 0);
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x5100, 8));
    let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 0xFFFF };
    sys.cpu_write_unpriv(A, UnprivReg::Command, cmd.to_reg());
    sys.run();
    assert_eq!(finished(&mut sys, A), Error::None);
    assert_eq!(sys.tcu(A).regs.get_priv(PrivReg::CoreReq), 0);
    assert_eq!(sys.tcu(B).regs.get_recv_ep(4).unwrap().msg_count(), 2);
}

#[test]
fn nopf_pagefault_is_immediate() {
    let mut cfg = config();
    cfg.tcu.tlb_entries = 8;
    let mut sys = System::new(&cfg);
    sys.tcu_mut(B).tlb = None;

    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, NO_REPLIES));

    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x5100, 8));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0);
    let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: true, error: Error::None, arg: 0xFFFF };
    sys.cpu_write_unpriv(A, UnprivReg::Command, cmd.to_reg());
    sys.run();

    assert_eq!(finished(&mut sys, A), Error::Pagefault);
    // No core request was raised, and the credit was rolled back.
    assert_eq!(sys.tcu(A).regs.get_priv(PrivReg::CoreReq), 0);
    assert_eq!(sys.tcu(A).regs.get_send_ep(2).unwrap().cur_crd, 1);
}

#[test]
fn buffer0_reserved_for_nonfaulting() {
    let mut cfg = config();
    cfg.tcu.tlb_entries = 8;
    let mut sys = System::new(&cfg);
    sys.tcu_mut(B).tlb = None;

    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));
    sys.set_ep(B, 4, recv_ep(0x1000, 1, NO_REPLIES));

    // Map the payload page so the send proceeds without a core request.
    sys.tcu_mut(A).tlb.as_mut().unwrap().insert(0x5000, INVALID_ACT, 0x8000, TlbFlags::RW);
    sys.write_mem(A, 0x8100, b"data");
    sys.cpu_write_unpriv(A, UnprivReg::Data, data_reg(0x5100, 4));
    sys.cpu_write_unpriv(A, UnprivReg::Arg1, 0);
    let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 0xFFFF };
    sys.cpu_write_unpriv(A, UnprivReg::Command, cmd.to_reg());

    // Step the simulation and check that the faultable transfer never
    // occupies buffer 0, which is reserved to break pagefault deadlocks.
    let mut now = 0;
    while !sys.idle() {
        now += 1;
        assert!(now < 10_000, "simulation did not settle");
        sys.run_until(now);
        if let Some(t) = &sys.tcu(A).xfer.buffers()[0].xfer {
            assert!(
                t.flags.contains(tilesim::tcu::xfer::XferFlags::NOPF)
                    || t.flags.contains(tilesim::tcu::xfer::XferFlags::MSGRECV),
                "faultable transfer in buffer 0"
            );
        }
    }
    assert_eq!(finished(&mut sys, A), Error::None);
}

#[test]
fn concurrent_receives_are_serialized() {
    let mut cfg = config();
    cfg.tiles = 3;
    let mut sys = System::new(&cfg);
    let c = 2usize;
    sys.set_ep(A, 2, send_ep((c as u16, 4), 0x1, 1));
    sys.set_ep(B, 2, send_ep((c as u16, 4), 0x2, 1));
    sys.set_ep(c, 4, recv_ep(0x1000, 2, NO_REPLIES));

    // Both tiles fire at once; the receiver's NoC port and the MSGRECV
    // serialization order the two deliveries.
    for (tile, body) in [(A, b"from tile A!"), (B, b"from tile B!")] {
        sys.write_mem(tile, 0x100, body);
        sys.cpu_write_unpriv(tile, UnprivReg::Data, data_reg(0x100, body.len()));
        sys.cpu_write_unpriv(tile, UnprivReg::Arg1, 0);
        let cmd = Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 0xFFFF };
        sys.cpu_write_unpriv(tile, UnprivReg::Command, cmd.to_reg());
    }
    sys.run();

    assert_eq!(finished(&mut sys, A), Error::None);
    assert_eq!(finished(&mut sys, B), Error::None);
    let rep = sys.tcu(c).regs.get_recv_ep(4).unwrap();
    assert_eq!(rep.msg_count(), 2);
    check_recv_invariants(&rep);

    let mut labels = Vec::new();
    for slot in 0..2 {
        let raw = sys.read_mem(c, 0x1000 + slot * 64, HEADER_SIZE + 12);
        let header = Header::decode(&raw).unwrap();
        labels.push(header.label);
        assert_eq!(header.length, 12);
    }
    labels.sort();
    assert_eq!(labels, vec![0x1, 0x2]);
}

#[test]
fn foreign_activity_raises_core_request() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, send_ep((B as u16, 4), 0xA, 1));

    // B runs activity 5; EP4 belongs to activity 7.
    sys.cpu_write_priv(B, PrivReg::PrivCmdArg, 5);
    sys.cpu_write_priv(B, PrivReg::PrivCmd, SideCmd { op: 3, error: Error::None, arg: 0 }.to_reg());
    sys.run();
    assert_eq!(sys.tcu(B).regs.cur_act(), (5, 0));
    assert_eq!(sys.tcu(B).regs.get_priv(PrivReg::OldAct) & 0xFFFF, 0xFFFF);

    sys.set_ep(B, 4, Ep::Receive(RecvEp {
        act: 7,
        buf_addr: 0x1000,
        size: 1,
        msg_size: 6,
        reply_eps: NO_REPLIES,
        occupied: 0,
        unread: 0,
        rd_pos: 0,
        wr_pos: 0,
    }));

    assert_eq!(send(&mut sys, A, 2, 0x100, b"xx", 0xFFFF), Error::None);

    // The message is stored, but the running activity is not notified;
    // instead a foreign-receive request is presented to the core.
    let req = sys.tcu(B).regs.get_priv(PrivReg::CoreReq);
    assert_eq!(req & 0xF, 1);
    assert_eq!((req >> 4) & 0xFFFF, 4);
    assert_eq!(req >> 48, 7);
    assert_eq!(sys.tcu(B).regs.cur_act(), (5, 0));
    assert_eq!(sys.tcu(B).regs.get_recv_ep(4).unwrap().msg_count(), 1);

    sys.cpu_write_priv(B, PrivReg::CoreReq, 3);
    sys.run();
    assert_eq!(sys.tcu(B).regs.get_priv(PrivReg::CoreReq), 0);
}

#[test]
fn ext_invalidate_ep_over_noc() {
    let mut sys = System::new(&config());
    sys.set_ep(A, 2, Ep::Send(SendEp {
        act: INVALID_ACT,
        target_tile: B as u16,
        target_ep: 4,
        label: 0,
        msg_size: 6,
        max_crd: 2,
        cur_crd: 1,
        crd_ep: 0,
        flags: SendFlags::empty(),
    }));

    // Without force, an EP with credits in flight is not torn down.
    let cmd = SideCmd { op: ext_op::INV_EP, error: Error::None, arg: 2 };
    sys.noc_write_reg(B, A, ext_reg_addr(ExtReg::ExtCmd), cmd.to_reg());
    sys.run();
    let done = SideCmd::from_reg(sys.tcu(A).regs.get_ext(ExtReg::ExtCmd));
    assert_eq!(done.op, ext_op::IDLE);
    assert_eq!(done.error, Error::MissCredits);
    assert!(sys.tcu(A).regs.get_send_ep(2).is_some());

    // With force it is.
    let cmd = SideCmd { op: ext_op::INV_EP, error: Error::None, arg: 2 | (1 << 16) };
    sys.noc_write_reg(B, A, ext_reg_addr(ExtReg::ExtCmd), cmd.to_reg());
    sys.run();
    let done = SideCmd::from_reg(sys.tcu(A).regs.get_ext(ExtReg::ExtCmd));
    assert_eq!(done.error, Error::None);
    assert!(sys.tcu(A).regs.get_send_ep(2).is_none());
}

#[test]
fn llc_requests_forwarded_to_memory_tile() {
    let mut cfg = config();
    cfg.tcu.mem_tile = B as u16;
    cfg.tcu.mem_offset = 0x8000;
    cfg.tcu.mem_region_size = 0x1000;
    let mut sys = System::new(&cfg);

    let pattern: Vec<u8> = (0..16u32).map(|i| i as u8 + 1).collect();
    sys.write_mem(B, 0x8040, &pattern);

    let resp = sys.llc_request(A, Packet::read(0x40, 16)).unwrap();
    assert_eq!(resp.cmd, MemCmd::ReadResp);
    assert_eq!(resp.data, pattern);

    let resp = sys.llc_request(A, Packet::write(0x60, vec![0xAB; 8])).unwrap();
    assert_eq!(resp.cmd, MemCmd::WriteResp);
    assert_eq!(sys.read_mem(B, 0x8060, 8), vec![0xAB; 8]);

    // Out-of-range requests get a dummy response and never reach the NoC.
    let resp = sys.llc_request(A, Packet::read(0x2000, 16)).unwrap();
    assert_eq!(resp.data, vec![0; 16]);
}
