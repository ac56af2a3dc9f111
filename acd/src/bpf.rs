//! Kernel-side ARP prefilter.
//!
//! Every context shares one packet socket across all of its probes, so the
//! kernel must discard the vast majority of ARP traffic before it reaches
//! userspace. This module assembles a `SOCKET_FILTER` eBPF program that
//! accepts a frame only if its sender or target protocol address is present
//! in a hash map of watched IPs, and rejects our own outgoing frames echoed
//! back by the kernel. The map is owned by userspace and updated as probes
//! come and go.
//!
//! The program is tiny and fixed-shape, so it is assembled by hand rather
//! than compiled. Map keys are the host-order interpretation of the
//! big-endian address bytes, which is exactly what the legacy `LD_ABS`
//! packet loads produce in `r0`.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::arp::MacAddr;

// instruction classes
const BPF_LD: u8 = 0x00;
const BPF_STX: u8 = 0x03;
const BPF_ALU: u8 = 0x04;
const BPF_JMP: u8 = 0x05;
const BPF_ALU64: u8 = 0x07;

// size modifiers
const BPF_W: u8 = 0x00;
const BPF_H: u8 = 0x08;
const BPF_B: u8 = 0x10;
const BPF_DW: u8 = 0x18;

// mode modifiers
const BPF_IMM: u8 = 0x00;
const BPF_ABS: u8 = 0x20;
const BPF_MEM: u8 = 0x60;

// source operand
const BPF_K: u8 = 0x00;
const BPF_X: u8 = 0x08;

// alu / jump operations
const BPF_ADD: u8 = 0x00;
const BPF_MOV: u8 = 0xb0;
const BPF_JEQ: u8 = 0x10;
const BPF_JNE: u8 = 0x50;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;

const BPF_PSEUDO_MAP_FD: u8 = 1;
const BPF_FUNC_MAP_LOOKUP_ELEM: i32 = 1;

const R0: u8 = 0;
const R1: u8 = 1;
const R2: u8 = 2;
const R6: u8 = 6;
const R7: u8 = 7;
const R10: u8 = 10;

// bpf(2) commands and types
const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_PROG_LOAD: libc::c_int = 5;
const BPF_MAP_TYPE_HASH: u32 = 1;
const BPF_PROG_TYPE_SOCKET_FILTER: u32 = 1;
const BPF_NOEXIST: u64 = 1;

/// Value returned by the filter for accepted frames; the kernel truncates
/// the frame to this many bytes, which comfortably covers any ARP packet.
const ACCEPT_LEN: i32 = 0xffff;

/// One eBPF instruction in the kernel's wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Insn {
    code: u8,
    regs: u8,
    off: i16,
    imm: i32,
}

impl Insn {
    const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        // dst_reg occupies the low-order nibble of the kernel's bitfield
        // pair on little-endian targets, the high-order one on big-endian.
        #[cfg(target_endian = "little")]
        let regs = dst | (src << 4);
        #[cfg(target_endian = "big")]
        let regs = (dst << 4) | src;
        Insn {
            code,
            regs,
            off,
            imm,
        }
    }

    const fn mov64_reg(dst: u8, src: u8) -> Self {
        Insn::new(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0)
    }

    const fn mov64_imm(dst: u8, imm: i32) -> Self {
        Insn::new(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm)
    }

    /// 32-bit move; zero-extends, so an immediate with the top bit set can
    /// be compared against `LD_ABS` results with a register jump.
    const fn mov32_imm(dst: u8, imm: i32) -> Self {
        Insn::new(BPF_ALU | BPF_MOV | BPF_K, dst, 0, 0, imm)
    }

    const fn alu64_add_imm(dst: u8, imm: i32) -> Self {
        Insn::new(BPF_ALU64 | BPF_ADD | BPF_K, dst, 0, 0, imm)
    }

    /// Legacy packet load: `r0 = ntoh(*(size *)(pkt + off))`, `r6` holds
    /// the socket buffer.
    const fn ld_abs(size: u8, off: i32) -> Self {
        Insn::new(BPF_LD | BPF_ABS | size, 0, 0, 0, off)
    }

    const fn stx_mem(size: u8, dst: u8, src: u8, off: i16) -> Self {
        Insn::new(BPF_STX | BPF_MEM | size, dst, src, off, 0)
    }

    const fn jeq_imm(dst: u8, imm: i32, off: i16) -> Self {
        Insn::new(BPF_JMP | BPF_JEQ | BPF_K, dst, 0, off, imm)
    }

    const fn jne_imm(dst: u8, imm: i32, off: i16) -> Self {
        Insn::new(BPF_JMP | BPF_JNE | BPF_K, dst, 0, off, imm)
    }

    const fn jne_reg(dst: u8, src: u8, off: i16) -> Self {
        Insn::new(BPF_JMP | BPF_JNE | BPF_X, dst, src, off, 0)
    }

    const fn call(func: i32) -> Self {
        Insn::new(BPF_JMP | BPF_CALL, 0, 0, 0, func)
    }

    const fn exit() -> Self {
        Insn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0)
    }

    #[cfg(test)]
    fn dst_reg(&self) -> usize {
        if cfg!(target_endian = "little") {
            (self.regs & 0x0f) as usize
        } else {
            (self.regs >> 4) as usize
        }
    }

    #[cfg(test)]
    fn src_reg(&self) -> usize {
        if cfg!(target_endian = "little") {
            (self.regs >> 4) as usize
        } else {
            (self.regs & 0x0f) as usize
        }
    }

    /// Map fd relocation; occupies two instruction slots.
    const fn ld_map_fd(dst: u8, fd: RawFd) -> [Self; 2] {
        [
            Insn::new(BPF_LD | BPF_DW | BPF_IMM, dst, BPF_PSEUDO_MAP_FD, 0, fd),
            Insn::new(0, 0, 0, 0, 0),
        ]
    }
}

/// Assembles the socket filter against `map_fd`.
///
/// Packet offsets are relative to the ARP header, since the socket runs in
/// cooked (`SOCK_DGRAM`) mode. The program:
///
/// - drops anything that is not an Ethernet/IPv4 ARP request or reply,
/// - drops frames whose sender hardware address is `mac` (our own echoes),
/// - accepts if the sender protocol address is in the map,
/// - else accepts if the target protocol address is in the map,
/// - else drops.
pub(crate) fn filter_program(map_fd: RawFd, mac: MacAddr) -> Vec<Insn> {
    let m = mac.octets();
    let mac_hi = u32::from_be_bytes([m[0], m[1], m[2], m[3]]) as i32;
    let mac_lo = u16::from_be_bytes([m[4], m[5]]) as i32;

    let mut prog = vec![
        /*  0 */ Insn::mov64_reg(R6, R1),
        /*  1 */ Insn::ld_abs(BPF_H, 0), // hardware type
        /*  2 */ Insn::jne_imm(R0, 1, 30),
        /*  3 */ Insn::ld_abs(BPF_H, 2), // protocol type
        /*  4 */ Insn::jne_imm(R0, 0x0800, 28),
        /*  5 */ Insn::ld_abs(BPF_B, 4), // hardware len
        /*  6 */ Insn::jne_imm(R0, 6, 26),
        /*  7 */ Insn::ld_abs(BPF_B, 5), // protocol len
        /*  8 */ Insn::jne_imm(R0, 4, 24),
        /*  9 */ Insn::ld_abs(BPF_H, 6), // operation
        /* 10 */ Insn::jeq_imm(R0, 1, 1),
        /* 11 */ Insn::jne_imm(R0, 2, 21),
        /* 12 */ Insn::ld_abs(BPF_W, 8), // sha[0..4]
        /* 13 */ Insn::mov32_imm(R7, mac_hi),
        /* 14 */ Insn::jne_reg(R0, R7, 2),
        /* 15 */ Insn::ld_abs(BPF_H, 12), // sha[4..6]
        /* 16 */ Insn::jeq_imm(R0, mac_lo, 16),
        /* 17 */ Insn::ld_abs(BPF_W, 14), // spa
        /* 18 */ Insn::stx_mem(BPF_W, R10, R0, -4),
        /* 19 */ Insn::mov64_reg(R2, R10),
        /* 20 */ Insn::alu64_add_imm(R2, -4),
    ];
    prog.extend(Insn::ld_map_fd(R1, map_fd)); // 21, 22
    prog.extend([
        /* 23 */ Insn::call(BPF_FUNC_MAP_LOOKUP_ELEM),
        /* 24 */ Insn::jne_imm(R0, 0, 10),
        /* 25 */ Insn::ld_abs(BPF_W, 24), // tpa
        /* 26 */ Insn::stx_mem(BPF_W, R10, R0, -4),
        /* 27 */ Insn::mov64_reg(R2, R10),
        /* 28 */ Insn::alu64_add_imm(R2, -4),
    ]);
    prog.extend(Insn::ld_map_fd(R1, map_fd)); // 29, 30
    prog.extend([
        /* 31 */ Insn::call(BPF_FUNC_MAP_LOOKUP_ELEM),
        /* 32 */ Insn::jne_imm(R0, 0, 2),
        /* 33 */ Insn::mov64_imm(R0, 0), // drop
        /* 34 */ Insn::exit(),
        /* 35 */ Insn::mov64_imm(R0, ACCEPT_LEN), // accept
        /* 36 */ Insn::exit(),
    ]);
    prog
}

fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<libc::c_long> {
    let r = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>(),
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r)
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    // occupies the kernel's prog_flags slot, which must be zero
    prog_flags: u32,
}

/// Creates the watched-IP hash map with room for `max_entries` addresses.
pub(crate) fn map_create(max_entries: u32) -> io::Result<OwnedFd> {
    let mut attr = MapCreateAttr {
        map_type: BPF_MAP_TYPE_HASH,
        key_size: 4,
        value_size: 1,
        max_entries,
        map_flags: 0,
    };
    let fd = sys_bpf(BPF_MAP_CREATE, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

pub(crate) fn map_insert(map: &OwnedFd, ip: Ipv4Addr) -> io::Result<()> {
    let key: u32 = ip.into();
    let value: u8 = 0;
    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        key: &key as *const u32 as u64,
        value: &value as *const u8 as u64,
        flags: BPF_NOEXIST,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr)?;
    Ok(())
}

pub(crate) fn map_remove(map: &OwnedFd, ip: Ipv4Addr) -> io::Result<()> {
    let key: u32 = ip.into();
    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        key: &key as *const u32 as u64,
        ..Default::default()
    };
    sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr)?;
    Ok(())
}

/// Loads the assembled program; the returned fd may be closed once it is
/// attached to a socket.
pub(crate) fn prog_load(insns: &[Insn]) -> io::Result<OwnedFd> {
    static LICENSE: &[u8] = b"Dual MIT/GPL\0";
    let mut attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_SOCKET_FILTER,
        insn_cnt: insns.len() as u32,
        insns: insns.as_ptr() as u64,
        license: LICENSE.as_ptr() as u64,
        ..Default::default()
    };
    let fd = sys_bpf(BPF_PROG_LOAD, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::arp::ArpPacket;

    const MAC: MacAddr = MacAddr([0xaa, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const PEER: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const MAP_FD: RawFd = 7;

    /// Executes the filter the way the in-kernel interpreter would, over the
    /// handful of opcodes the program uses. Returns the filter verdict.
    fn run(prog: &[Insn], packet: &[u8], map: &HashSet<u32>) -> u64 {
        let mut reg = [0u64; 11];
        let mut stack = [0u8; 512];
        reg[10] = 512;
        let mut pc = 0usize;
        loop {
            let insn = prog[pc];
            let dst = insn.dst_reg();
            let src = insn.src_reg();
            pc += 1;
            match insn.code {
                c if c == BPF_ALU64 | BPF_MOV | BPF_X => reg[dst] = reg[src],
                c if c == BPF_ALU64 | BPF_MOV | BPF_K => reg[dst] = insn.imm as i64 as u64,
                c if c == BPF_ALU | BPF_MOV | BPF_K => reg[dst] = insn.imm as u32 as u64,
                c if c == BPF_ALU64 | BPF_ADD | BPF_K => {
                    reg[dst] = reg[dst].wrapping_add(insn.imm as i64 as u64)
                }
                c if c & 0xe7 == BPF_LD | BPF_ABS => {
                    let off = insn.imm as usize;
                    let size = match insn.code & 0x18 {
                        x if x == BPF_B => 1,
                        x if x == BPF_H => 2,
                        _ => 4,
                    };
                    if off + size > packet.len() {
                        return 0; // failed packet loads abort with a drop
                    }
                    let mut v = 0u64;
                    for b in &packet[off..off + size] {
                        v = (v << 8) | u64::from(*b);
                    }
                    reg[0] = v;
                }
                c if c == BPF_STX | BPF_MEM | BPF_W => {
                    let addr = (reg[dst] as i64 + i64::from(insn.off)) as usize;
                    stack[addr..addr + 4].copy_from_slice(&(reg[src] as u32).to_le_bytes());
                }
                c if c == BPF_LD | BPF_DW | BPF_IMM => {
                    assert_eq!(src as u8, BPF_PSEUDO_MAP_FD);
                    assert_eq!(insn.imm, MAP_FD);
                    reg[dst] = insn.imm as u64;
                    pc += 1; // second slot of the wide instruction
                }
                c if c == BPF_JMP | BPF_CALL => {
                    assert_eq!(insn.imm, BPF_FUNC_MAP_LOOKUP_ELEM);
                    let addr = reg[2] as usize;
                    let key = u32::from_le_bytes(stack[addr..addr + 4].try_into().unwrap());
                    reg[0] = u64::from(map.contains(&key));
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    if reg[dst] == insn.imm as i64 as u64 {
                        pc = (pc as i64 + i64::from(insn.off)) as usize;
                    }
                }
                c if c == BPF_JMP | BPF_JNE | BPF_K => {
                    if reg[dst] != insn.imm as i64 as u64 {
                        pc = (pc as i64 + i64::from(insn.off)) as usize;
                    }
                }
                c if c == BPF_JMP | BPF_JNE | BPF_X => {
                    if reg[dst] != reg[src] {
                        pc = (pc as i64 + i64::from(insn.off)) as usize;
                    }
                }
                c if c == BPF_JMP | BPF_EXIT => return reg[0],
                c => panic!("unhandled opcode {c:#x} at {}", pc - 1),
            }
        }
    }

    fn watched(ips: &[Ipv4Addr]) -> HashSet<u32> {
        ips.iter().map(|ip| u32::from(*ip)).collect()
    }

    #[test]
    fn accepts_watched_target() {
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        let prog = filter_program(MAP_FD, MAC);
        let pkt = ArpPacket::probe(PEER, ip).to_bytes();
        assert_ne!(run(&prog, &pkt, &watched(&[ip])), 0);
    }

    #[test]
    fn accepts_watched_sender() {
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        let prog = filter_program(MAP_FD, MAC);
        let pkt = ArpPacket::announcement(PEER, ip).to_bytes();
        assert_ne!(run(&prog, &pkt, &watched(&[ip])), 0);
    }

    #[test]
    fn drops_unwatched_address() {
        let prog = filter_program(MAP_FD, MAC);
        let pkt = ArpPacket::probe(PEER, Ipv4Addr::new(10, 9, 9, 9)).to_bytes();
        assert_eq!(
            run(&prog, &pkt, &watched(&[Ipv4Addr::new(192, 0, 2, 10)])),
            0
        );
    }

    #[test]
    fn drops_own_echo() {
        // The MAC under test starts with 0xaa, so the first-word compare
        // exercises an immediate with the sign bit set.
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        let prog = filter_program(MAP_FD, MAC);
        let pkt = ArpPacket::announcement(MAC, ip).to_bytes();
        assert_eq!(run(&prog, &pkt, &watched(&[ip])), 0);
    }

    #[test]
    fn near_miss_sha_still_accepted() {
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        let mut close = MAC.octets();
        close[5] ^= 0x01; // same first word, different tail
        let prog = filter_program(MAP_FD, MAC);
        let pkt = ArpPacket::announcement(MacAddr(close), ip).to_bytes();
        assert_ne!(run(&prog, &pkt, &watched(&[ip])), 0);
    }

    #[test]
    fn drops_short_and_non_arp() {
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        let prog = filter_program(MAP_FD, MAC);
        let map = watched(&[ip]);

        let good = ArpPacket::probe(PEER, ip).to_bytes();
        assert_eq!(run(&prog, &good[..20], &map), 0);

        let mut rarp = good.clone();
        rarp[7] = 3;
        assert_eq!(run(&prog, &rarp, &map), 0);
    }
}
