use std::mem::offset_of;

use log::warn;
use uxn::Uxn;
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

use crate::{dev, dev_mut, Ports};

/// Number of auxiliary expansion banks, each the size of main RAM
const BANK_COUNT: usize = 15;

pub struct System {
    exit: Option<i32>,
    banks: [Box<[u8; 65536]>; BANK_COUNT],
}

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct SystemPorts {
    _unused: [u8; 2],
    expansion: U16<BigEndian>,
    wst: u8,
    rst: u8,
    _metadata: U16<BigEndian>,
    _red: U16<BigEndian>,
    _green: U16<BigEndian>,
    _blue: U16<BigEndian>,
    debug: u8,
    state: u8,
}

impl Ports for SystemPorts {
    const BASE: u8 = 0x00;
}

impl SystemPorts {
    const EXPANSION: u8 = (offset_of!(Self, expansion) + 1) as u8;
    const WST: u8 = offset_of!(Self, wst) as u8;
    const RST: u8 = offset_of!(Self, rst) as u8;
    const DEBUG: u8 = offset_of!(Self, debug) as u8;
    const STATE: u8 = offset_of!(Self, state) as u8;
}

/// Expansion command tags, read from the byte the `expansion` port points at
mod cmd {
    pub const FILL: u8 = 0x00;
    pub const CPYL: u8 = 0x01;
    pub const CPYR: u8 = 0x02;
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl System {
    pub fn new() -> Self {
        let banks = [(); BANK_COUNT].map(|_| Box::new([0u8; 65536]));
        Self { exit: None, banks }
    }

    /// Resets the peripheral, loading the given data into expansion banks
    pub fn reset(&mut self, mut extra: &[u8]) {
        for b in &mut self.banks {
            let n = extra.len().min(b.len());
            b[..n].copy_from_slice(&extra[..n]);
            b[n..].fill(0u8);
            extra = &extra[n..];
        }
        self.exit = None;
    }

    pub fn deo(&mut self, vm: &mut Uxn, page: &[u8; 256], port: u8) {
        let p = dev::<SystemPorts>(page);
        match port {
            SystemPorts::EXPANSION => self.expansion(vm, p.expansion.get()),
            SystemPorts::WST => {
                let n = p.wst;
                vm.work_mut().set_len(n);
            }
            SystemPorts::RST => {
                let n = p.rst;
                vm.ret_mut().set_len(n);
            }
            SystemPorts::DEBUG => {
                if p.debug != 0 {
                    Self::inspect(vm);
                }
            }
            SystemPorts::STATE => {
                if p.state != 0 {
                    self.exit = Some(i32::from(p.state & !0x80));
                }
            }
            _ => (),
        }
    }

    pub fn dei(&mut self, vm: &mut Uxn, page: &mut [u8; 256], port: u8) {
        let p = dev_mut::<SystemPorts>(page);
        match port {
            SystemPorts::WST => p.wst = vm.work().len(),
            SystemPorts::RST => p.rst = vm.ret().len(),
            _ => (),
        }
    }

    /// Runs one memory-expansion command
    ///
    /// Bank 0 is main RAM; banks past the last auxiliary one are ignored
    /// with a warning.
    fn expansion(&mut self, vm: &mut Uxn, addr: u16) {
        let field = |i: u16| vm.ram_read_short(addr.wrapping_add(i));
        match vm.ram_read_byte(addr) {
            cmd::FILL => {
                let (length, bank, dst) = (field(1), field(3), field(5));
                let value = vm.ram_read_byte(addr.wrapping_add(7));
                for i in 0..length {
                    self.write(vm, bank, dst.wrapping_add(i), value);
                }
            }
            op @ (cmd::CPYL | cmd::CPYR) => {
                let length = field(1);
                let (src_bank, src) = (field(3), field(5));
                let (dst_bank, dst) = (field(7), field(9));
                for i in 0..length {
                    // cpyr walks backwards so overlapping ranges can shift
                    // right without clobbering themselves
                    let i = if op == cmd::CPYL {
                        i
                    } else {
                        length.wrapping_sub(1).wrapping_sub(i)
                    };
                    let v = self.read(vm, src_bank, src.wrapping_add(i));
                    self.write(vm, dst_bank, dst.wrapping_add(i), v);
                }
            }
            op => warn!("invalid expansion command {op:#04x}"),
        }
    }

    fn read(&mut self, vm: &Uxn, bank: u16, addr: u16) -> u8 {
        match usize::from(bank).checked_sub(1) {
            None => vm.ram_read_byte(addr),
            Some(b) => match self.banks.get(b) {
                Some(mem) => mem[usize::from(addr)],
                None => {
                    warn!("read from missing bank {bank}");
                    0
                }
            },
        }
    }

    fn write(&mut self, vm: &mut Uxn, bank: u16, addr: u16, v: u8) {
        match usize::from(bank).checked_sub(1) {
            None => vm.ram_write_byte(addr, v),
            Some(b) => match self.banks.get_mut(b) {
                Some(mem) => mem[usize::from(addr)] = v,
                None => warn!("write to missing bank {bank}"),
            },
        }
    }

    /// Dumps the top of both stacks to stderr
    fn inspect(vm: &Uxn) {
        for (name, st) in [("WST", vm.work()), ("RST", vm.ret())] {
            let mut line = format!("{name} ");
            for i in (0..8).rev() {
                line.push_str(&format!("{:02x} ", st.peek_byte_at(i)));
            }
            eprintln!("{line}<");
        }
    }

    /// Returns `true` if the exit flag is set
    pub fn should_exit(&self) -> bool {
        self.exit.is_some()
    }

    /// Clears and returns the exit code (if present)
    pub fn exit(&mut self) -> Option<i32> {
        self.exit.take()
    }
}
