//! Interpreter core for the Uxn virtual processor
//!
//! Uxn is a stack-based 8-bit CPU with 64 KiB of byte-addressable memory,
//! two 256-byte circular stacks, and 256 opcodes derived from 32 base
//! operations and three mode flags (short, return, keep).  The core owns no
//! peripherals: `DEI` and `DEO` hand a port address (and value) to a
//! [`Device`] supplied by the caller, which may mutate VM state and re-enter
//! [`Uxn::run`] to invoke vectors.
//!
//! Execution is total.  Addresses and stack indices wrap, division by zero
//! yields zero, and the only ways out of [`Uxn::run`] are the `BRK` opcode
//! and a device callback requesting a halt.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod op;
mod stack;

pub use stack::Stack;
use stack::{Operands, Word};

/// Host-side handler for the `DEI*` and `DEO*` opcodes
///
/// The callbacks receive the VM handle and may freely read and write its RAM
/// and stacks; they may also call [`Uxn::run`] recursively to execute a
/// vector.  Stack mutations made by the device are visible to the next
/// opcode, because the interpreter holds no stack state outside the VM
/// across a bridge call.
pub trait Device {
    /// Produces the value for a `DEI` read of the given port
    ///
    /// Only the low byte is used unless `wide` is set.
    fn dei(&mut self, vm: &mut Uxn, port: u8, wide: bool) -> u16;

    /// Consumes a `DEO` write to the given port
    ///
    /// Returns `true` if execution should continue, `false` to halt the
    /// current `run`.
    #[must_use]
    fn deo(&mut self, vm: &mut Uxn, port: u8, value: u16, wide: bool) -> bool;
}

/// Device that reads zeros and discards writes
pub struct NullDevice;

impl Device for NullDevice {
    fn dei(&mut self, _vm: &mut Uxn, _port: u8, _wide: bool) -> u16 {
        0
    }
    fn deo(&mut self, _vm: &mut Uxn, _port: u8, _value: u16, _wide: bool) -> bool {
        true
    }
}

/// The virtual machine itself
///
/// The VM borrows its RAM from the caller and owns both stacks.  It holds no
/// allocation and no device state.
pub struct Uxn<'a> {
    /// 64 KiB of VM memory
    ram: &'a mut [u8; 65536],

    /// Working stack
    work: Stack,

    /// Return stack
    ret: Stack,
}

impl<'a> Uxn<'a> {
    /// Builds a new VM over the given RAM
    pub fn new(ram: &'a mut [u8; 65536]) -> Self {
        Self {
            ram,
            work: Stack::default(),
            ret: Stack::default(),
        }
    }

    /// Clears RAM and stacks, then loads the ROM at `0x0100`
    ///
    /// Returns trailing ROM data that did not fit in RAM (or an empty
    /// slice); the caller may load it into expansion memory.
    #[must_use]
    pub fn reset<'b>(&mut self, rom: &'b [u8]) -> &'b [u8] {
        self.ram.fill(0);
        self.work = Stack::default();
        self.ret = Stack::default();
        let n = rom.len().min(self.ram.len() - 0x100);
        self.ram[0x100..][..n].copy_from_slice(&rom[..n]);
        &rom[n..]
    }

    /// Runs the VM from the given address until it stops
    ///
    /// Execution ends when a `BRK` is fetched or when the device's
    /// [`deo`](Device::deo) callback returns `false`; either way the
    /// returned program counter points one past the final opcode.
    #[inline]
    pub fn run<D: Device>(&mut self, dev: &mut D, mut pc: u16) -> u16 {
        loop {
            let op = self.fetch(&mut pc);
            match self.step(op, dev, pc) {
                Some(next) => pc = next,
                None => break pc,
            }
        }
    }

    /// Shared borrow of the working stack
    #[inline]
    pub fn work(&self) -> &Stack {
        &self.work
    }

    /// Mutable borrow of the working stack
    #[inline]
    pub fn work_mut(&mut self) -> &mut Stack {
        &mut self.work
    }

    /// Shared borrow of the return stack
    #[inline]
    pub fn ret(&self) -> &Stack {
        &self.ret
    }

    /// Mutable borrow of the return stack
    #[inline]
    pub fn ret_mut(&mut self) -> &mut Stack {
        &mut self.ret
    }

    /// Reads a byte from RAM
    #[inline]
    pub fn ram_read_byte(&self, addr: u16) -> u8 {
        self.ram[usize::from(addr)]
    }

    /// Writes a byte to RAM
    #[inline]
    pub fn ram_write_byte(&mut self, addr: u16, v: u8) {
        self.ram[usize::from(addr)] = v;
    }

    /// Reads a big-endian short from RAM
    ///
    /// At the top of RAM the low byte wraps to address 0.
    #[inline]
    pub fn ram_read_short(&self, addr: u16) -> u16 {
        self.ram_get::<u16>(addr)
    }

    /// Reads the byte at the program counter and advances it
    #[inline]
    fn fetch(&mut self, pc: &mut u16) -> u8 {
        let v = self.ram[usize::from(*pc)];
        *pc = pc.wrapping_add(1);
        v
    }

    /// Reads a big-endian short at the program counter and advances it
    #[inline]
    fn fetch_short(&mut self, pc: &mut u16) -> u16 {
        let hi = self.fetch(pc);
        let lo = self.fetch(pc);
        u16::from_be_bytes([hi, lo])
    }

    #[inline]
    fn fetch_word<W: Word>(&mut self, pc: &mut u16) -> W {
        if W::WIDE {
            W::narrow(self.fetch_short(pc))
        } else {
            W::narrow(u16::from(self.fetch(pc)))
        }
    }

    #[inline]
    fn ram_get<W: Word>(&self, addr: u16) -> W {
        if W::WIDE {
            let hi = self.ram[usize::from(addr)];
            let lo = self.ram[usize::from(addr.wrapping_add(1))];
            W::narrow(u16::from_be_bytes([hi, lo]))
        } else {
            W::narrow(u16::from(self.ram[usize::from(addr)]))
        }
    }

    #[inline]
    fn ram_set<W: Word>(&mut self, addr: u16, v: W) {
        if W::WIDE {
            let [hi, lo] = v.widen().to_be_bytes();
            self.ram[usize::from(addr)] = hi;
            self.ram[usize::from(addr.wrapping_add(1))] = lo;
        } else {
            self.ram[usize::from(addr)] = v.widen() as u8;
        }
    }

    /// The stack that operands come from and results go to
    #[inline]
    fn active<const KEEP: bool, const RET: bool>(&mut self) -> Operands<'_, KEEP> {
        Operands::new(if RET { &mut self.ret } else { &mut self.work })
    }

    /// The opposite stack, used by the cross-stack transfer of `JSR`/`STH`
    #[inline]
    fn inactive<const RET: bool>(&mut self) -> &mut Stack {
        if RET {
            &mut self.work
        } else {
            &mut self.ret
        }
    }

    /// Executes a single opcode, returning the next program counter
    ///
    /// `pc` already points past the opcode byte.  `None` stops the run.
    #[inline]
    fn step(&mut self, op: u8, dev: &mut dyn Device, pc: u16) -> Option<u16> {
        match op {
            op::BRK => None,
            op::INC => self.inc::<u8, false, false>(pc),
            op::POP => self.pop::<u8, false, false>(pc),
            op::NIP => self.nip::<u8, false, false>(pc),
            op::SWP => self.swp::<u8, false, false>(pc),
            op::ROT => self.rot::<u8, false, false>(pc),
            op::DUP => self.dup::<u8, false, false>(pc),
            op::OVR => self.ovr::<u8, false, false>(pc),
            op::EQU => self.equ::<u8, false, false>(pc),
            op::NEQ => self.neq::<u8, false, false>(pc),
            op::GTH => self.gth::<u8, false, false>(pc),
            op::LTH => self.lth::<u8, false, false>(pc),
            op::JMP => self.jmp::<u8, false, false>(pc),
            op::JCN => self.jcn::<u8, false, false>(pc),
            op::JSR => self.jsr::<u8, false, false>(pc),
            op::STH => self.sth::<u8, false, false>(pc),
            op::LDZ => self.ldz::<u8, false, false>(pc),
            op::STZ => self.stz::<u8, false, false>(pc),
            op::LDR => self.ldr::<u8, false, false>(pc),
            op::STR => self.str::<u8, false, false>(pc),
            op::LDA => self.lda::<u8, false, false>(pc),
            op::STA => self.sta::<u8, false, false>(pc),
            op::DEI => self.dei::<u8, false, false>(dev, pc),
            op::DEO => self.deo::<u8, false, false>(dev, pc),
            op::ADD => self.add::<u8, false, false>(pc),
            op::SUB => self.sub::<u8, false, false>(pc),
            op::MUL => self.mul::<u8, false, false>(pc),
            op::DIV => self.div::<u8, false, false>(pc),
            op::AND => self.and::<u8, false, false>(pc),
            op::ORA => self.ora::<u8, false, false>(pc),
            op::EOR => self.eor::<u8, false, false>(pc),
            op::SFT => self.sft::<u8, false, false>(pc),
            op::JCI => self.jci(pc),
            op::INC2 => self.inc::<u16, false, false>(pc),
            op::POP2 => self.pop::<u16, false, false>(pc),
            op::NIP2 => self.nip::<u16, false, false>(pc),
            op::SWP2 => self.swp::<u16, false, false>(pc),
            op::ROT2 => self.rot::<u16, false, false>(pc),
            op::DUP2 => self.dup::<u16, false, false>(pc),
            op::OVR2 => self.ovr::<u16, false, false>(pc),
            op::EQU2 => self.equ::<u16, false, false>(pc),
            op::NEQ2 => self.neq::<u16, false, false>(pc),
            op::GTH2 => self.gth::<u16, false, false>(pc),
            op::LTH2 => self.lth::<u16, false, false>(pc),
            op::JMP2 => self.jmp::<u16, false, false>(pc),
            op::JCN2 => self.jcn::<u16, false, false>(pc),
            op::JSR2 => self.jsr::<u16, false, false>(pc),
            op::STH2 => self.sth::<u16, false, false>(pc),
            op::LDZ2 => self.ldz::<u16, false, false>(pc),
            op::STZ2 => self.stz::<u16, false, false>(pc),
            op::LDR2 => self.ldr::<u16, false, false>(pc),
            op::STR2 => self.str::<u16, false, false>(pc),
            op::LDA2 => self.lda::<u16, false, false>(pc),
            op::STA2 => self.sta::<u16, false, false>(pc),
            op::DEI2 => self.dei::<u16, false, false>(dev, pc),
            op::DEO2 => self.deo::<u16, false, false>(dev, pc),
            op::ADD2 => self.add::<u16, false, false>(pc),
            op::SUB2 => self.sub::<u16, false, false>(pc),
            op::MUL2 => self.mul::<u16, false, false>(pc),
            op::DIV2 => self.div::<u16, false, false>(pc),
            op::AND2 => self.and::<u16, false, false>(pc),
            op::ORA2 => self.ora::<u16, false, false>(pc),
            op::EOR2 => self.eor::<u16, false, false>(pc),
            op::SFT2 => self.sft::<u16, false, false>(pc),
            op::JMI => self.jmi(pc),
            op::INCr => self.inc::<u8, false, true>(pc),
            op::POPr => self.pop::<u8, false, true>(pc),
            op::NIPr => self.nip::<u8, false, true>(pc),
            op::SWPr => self.swp::<u8, false, true>(pc),
            op::ROTr => self.rot::<u8, false, true>(pc),
            op::DUPr => self.dup::<u8, false, true>(pc),
            op::OVRr => self.ovr::<u8, false, true>(pc),
            op::EQUr => self.equ::<u8, false, true>(pc),
            op::NEQr => self.neq::<u8, false, true>(pc),
            op::GTHr => self.gth::<u8, false, true>(pc),
            op::LTHr => self.lth::<u8, false, true>(pc),
            op::JMPr => self.jmp::<u8, false, true>(pc),
            op::JCNr => self.jcn::<u8, false, true>(pc),
            op::JSRr => self.jsr::<u8, false, true>(pc),
            op::STHr => self.sth::<u8, false, true>(pc),
            op::LDZr => self.ldz::<u8, false, true>(pc),
            op::STZr => self.stz::<u8, false, true>(pc),
            op::LDRr => self.ldr::<u8, false, true>(pc),
            op::STRr => self.str::<u8, false, true>(pc),
            op::LDAr => self.lda::<u8, false, true>(pc),
            op::STAr => self.sta::<u8, false, true>(pc),
            op::DEIr => self.dei::<u8, false, true>(dev, pc),
            op::DEOr => self.deo::<u8, false, true>(dev, pc),
            op::ADDr => self.add::<u8, false, true>(pc),
            op::SUBr => self.sub::<u8, false, true>(pc),
            op::MULr => self.mul::<u8, false, true>(pc),
            op::DIVr => self.div::<u8, false, true>(pc),
            op::ANDr => self.and::<u8, false, true>(pc),
            op::ORAr => self.ora::<u8, false, true>(pc),
            op::EORr => self.eor::<u8, false, true>(pc),
            op::SFTr => self.sft::<u8, false, true>(pc),
            op::JSI => self.jsi(pc),
            op::INC2r => self.inc::<u16, false, true>(pc),
            op::POP2r => self.pop::<u16, false, true>(pc),
            op::NIP2r => self.nip::<u16, false, true>(pc),
            op::SWP2r => self.swp::<u16, false, true>(pc),
            op::ROT2r => self.rot::<u16, false, true>(pc),
            op::DUP2r => self.dup::<u16, false, true>(pc),
            op::OVR2r => self.ovr::<u16, false, true>(pc),
            op::EQU2r => self.equ::<u16, false, true>(pc),
            op::NEQ2r => self.neq::<u16, false, true>(pc),
            op::GTH2r => self.gth::<u16, false, true>(pc),
            op::LTH2r => self.lth::<u16, false, true>(pc),
            op::JMP2r => self.jmp::<u16, false, true>(pc),
            op::JCN2r => self.jcn::<u16, false, true>(pc),
            op::JSR2r => self.jsr::<u16, false, true>(pc),
            op::STH2r => self.sth::<u16, false, true>(pc),
            op::LDZ2r => self.ldz::<u16, false, true>(pc),
            op::STZ2r => self.stz::<u16, false, true>(pc),
            op::LDR2r => self.ldr::<u16, false, true>(pc),
            op::STR2r => self.str::<u16, false, true>(pc),
            op::LDA2r => self.lda::<u16, false, true>(pc),
            op::STA2r => self.sta::<u16, false, true>(pc),
            op::DEI2r => self.dei::<u16, false, true>(dev, pc),
            op::DEO2r => self.deo::<u16, false, true>(dev, pc),
            op::ADD2r => self.add::<u16, false, true>(pc),
            op::SUB2r => self.sub::<u16, false, true>(pc),
            op::MUL2r => self.mul::<u16, false, true>(pc),
            op::DIV2r => self.div::<u16, false, true>(pc),
            op::AND2r => self.and::<u16, false, true>(pc),
            op::ORA2r => self.ora::<u16, false, true>(pc),
            op::EOR2r => self.eor::<u16, false, true>(pc),
            op::SFT2r => self.sft::<u16, false, true>(pc),
            op::LIT => self.lit::<u8, false>(pc),
            op::INCk => self.inc::<u8, true, false>(pc),
            op::POPk => self.pop::<u8, true, false>(pc),
            op::NIPk => self.nip::<u8, true, false>(pc),
            op::SWPk => self.swp::<u8, true, false>(pc),
            op::ROTk => self.rot::<u8, true, false>(pc),
            op::DUPk => self.dup::<u8, true, false>(pc),
            op::OVRk => self.ovr::<u8, true, false>(pc),
            op::EQUk => self.equ::<u8, true, false>(pc),
            op::NEQk => self.neq::<u8, true, false>(pc),
            op::GTHk => self.gth::<u8, true, false>(pc),
            op::LTHk => self.lth::<u8, true, false>(pc),
            op::JMPk => self.jmp::<u8, true, false>(pc),
            op::JCNk => self.jcn::<u8, true, false>(pc),
            op::JSRk => self.jsr::<u8, true, false>(pc),
            op::STHk => self.sth::<u8, true, false>(pc),
            op::LDZk => self.ldz::<u8, true, false>(pc),
            op::STZk => self.stz::<u8, true, false>(pc),
            op::LDRk => self.ldr::<u8, true, false>(pc),
            op::STRk => self.str::<u8, true, false>(pc),
            op::LDAk => self.lda::<u8, true, false>(pc),
            op::STAk => self.sta::<u8, true, false>(pc),
            op::DEIk => self.dei::<u8, true, false>(dev, pc),
            op::DEOk => self.deo::<u8, true, false>(dev, pc),
            op::ADDk => self.add::<u8, true, false>(pc),
            op::SUBk => self.sub::<u8, true, false>(pc),
            op::MULk => self.mul::<u8, true, false>(pc),
            op::DIVk => self.div::<u8, true, false>(pc),
            op::ANDk => self.and::<u8, true, false>(pc),
            op::ORAk => self.ora::<u8, true, false>(pc),
            op::EORk => self.eor::<u8, true, false>(pc),
            op::SFTk => self.sft::<u8, true, false>(pc),
            op::LIT2 => self.lit::<u16, false>(pc),
            op::INC2k => self.inc::<u16, true, false>(pc),
            op::POP2k => self.pop::<u16, true, false>(pc),
            op::NIP2k => self.nip::<u16, true, false>(pc),
            op::SWP2k => self.swp::<u16, true, false>(pc),
            op::ROT2k => self.rot::<u16, true, false>(pc),
            op::DUP2k => self.dup::<u16, true, false>(pc),
            op::OVR2k => self.ovr::<u16, true, false>(pc),
            op::EQU2k => self.equ::<u16, true, false>(pc),
            op::NEQ2k => self.neq::<u16, true, false>(pc),
            op::GTH2k => self.gth::<u16, true, false>(pc),
            op::LTH2k => self.lth::<u16, true, false>(pc),
            op::JMP2k => self.jmp::<u16, true, false>(pc),
            op::JCN2k => self.jcn::<u16, true, false>(pc),
            op::JSR2k => self.jsr::<u16, true, false>(pc),
            op::STH2k => self.sth::<u16, true, false>(pc),
            op::LDZ2k => self.ldz::<u16, true, false>(pc),
            op::STZ2k => self.stz::<u16, true, false>(pc),
            op::LDR2k => self.ldr::<u16, true, false>(pc),
            op::STR2k => self.str::<u16, true, false>(pc),
            op::LDA2k => self.lda::<u16, true, false>(pc),
            op::STA2k => self.sta::<u16, true, false>(pc),
            op::DEI2k => self.dei::<u16, true, false>(dev, pc),
            op::DEO2k => self.deo::<u16, true, false>(dev, pc),
            op::ADD2k => self.add::<u16, true, false>(pc),
            op::SUB2k => self.sub::<u16, true, false>(pc),
            op::MUL2k => self.mul::<u16, true, false>(pc),
            op::DIV2k => self.div::<u16, true, false>(pc),
            op::AND2k => self.and::<u16, true, false>(pc),
            op::ORA2k => self.ora::<u16, true, false>(pc),
            op::EOR2k => self.eor::<u16, true, false>(pc),
            op::SFT2k => self.sft::<u16, true, false>(pc),
            op::LITr => self.lit::<u8, true>(pc),
            op::INCkr => self.inc::<u8, true, true>(pc),
            op::POPkr => self.pop::<u8, true, true>(pc),
            op::NIPkr => self.nip::<u8, true, true>(pc),
            op::SWPkr => self.swp::<u8, true, true>(pc),
            op::ROTkr => self.rot::<u8, true, true>(pc),
            op::DUPkr => self.dup::<u8, true, true>(pc),
            op::OVRkr => self.ovr::<u8, true, true>(pc),
            op::EQUkr => self.equ::<u8, true, true>(pc),
            op::NEQkr => self.neq::<u8, true, true>(pc),
            op::GTHkr => self.gth::<u8, true, true>(pc),
            op::LTHkr => self.lth::<u8, true, true>(pc),
            op::JMPkr => self.jmp::<u8, true, true>(pc),
            op::JCNkr => self.jcn::<u8, true, true>(pc),
            op::JSRkr => self.jsr::<u8, true, true>(pc),
            op::STHkr => self.sth::<u8, true, true>(pc),
            op::LDZkr => self.ldz::<u8, true, true>(pc),
            op::STZkr => self.stz::<u8, true, true>(pc),
            op::LDRkr => self.ldr::<u8, true, true>(pc),
            op::STRkr => self.str::<u8, true, true>(pc),
            op::LDAkr => self.lda::<u8, true, true>(pc),
            op::STAkr => self.sta::<u8, true, true>(pc),
            op::DEIkr => self.dei::<u8, true, true>(dev, pc),
            op::DEOkr => self.deo::<u8, true, true>(dev, pc),
            op::ADDkr => self.add::<u8, true, true>(pc),
            op::SUBkr => self.sub::<u8, true, true>(pc),
            op::MULkr => self.mul::<u8, true, true>(pc),
            op::DIVkr => self.div::<u8, true, true>(pc),
            op::ANDkr => self.and::<u8, true, true>(pc),
            op::ORAkr => self.ora::<u8, true, true>(pc),
            op::EORkr => self.eor::<u8, true, true>(pc),
            op::SFTkr => self.sft::<u8, true, true>(pc),
            op::LIT2r => self.lit::<u16, true>(pc),
            op::INC2kr => self.inc::<u16, true, true>(pc),
            op::POP2kr => self.pop::<u16, true, true>(pc),
            op::NIP2kr => self.nip::<u16, true, true>(pc),
            op::SWP2kr => self.swp::<u16, true, true>(pc),
            op::ROT2kr => self.rot::<u16, true, true>(pc),
            op::DUP2kr => self.dup::<u16, true, true>(pc),
            op::OVR2kr => self.ovr::<u16, true, true>(pc),
            op::EQU2kr => self.equ::<u16, true, true>(pc),
            op::NEQ2kr => self.neq::<u16, true, true>(pc),
            op::GTH2kr => self.gth::<u16, true, true>(pc),
            op::LTH2kr => self.lth::<u16, true, true>(pc),
            op::JMP2kr => self.jmp::<u16, true, true>(pc),
            op::JCN2kr => self.jcn::<u16, true, true>(pc),
            op::JSR2kr => self.jsr::<u16, true, true>(pc),
            op::STH2kr => self.sth::<u16, true, true>(pc),
            op::LDZ2kr => self.ldz::<u16, true, true>(pc),
            op::STZ2kr => self.stz::<u16, true, true>(pc),
            op::LDR2kr => self.ldr::<u16, true, true>(pc),
            op::STR2kr => self.str::<u16, true, true>(pc),
            op::LDA2kr => self.lda::<u16, true, true>(pc),
            op::STA2kr => self.sta::<u16, true, true>(pc),
            op::DEI2kr => self.dei::<u16, true, true>(dev, pc),
            op::DEO2kr => self.deo::<u16, true, true>(dev, pc),
            op::ADD2kr => self.add::<u16, true, true>(pc),
            op::SUB2kr => self.sub::<u16, true, true>(pc),
            op::MUL2kr => self.mul::<u16, true, true>(pc),
            op::DIV2kr => self.div::<u16, true, true>(pc),
            op::AND2kr => self.and::<u16, true, true>(pc),
            op::ORA2kr => self.ora::<u16, true, true>(pc),
            op::EOR2kr => self.eor::<u16, true, true>(pc),
            op::SFT2kr => self.sft::<u16, true, true>(pc),
        }
    }

    /// `JCI`: fetches a short, pops a condition byte from the working stack,
    /// and adds the short to `pc` if the condition is nonzero
    #[inline]
    fn jci(&mut self, mut pc: u16) -> Option<u16> {
        let dt = self.fetch_short(&mut pc);
        if self.work.pop_byte() != 0 {
            pc = pc.wrapping_add(dt);
        }
        Some(pc)
    }

    /// `JMI`: fetches a short and adds it to `pc`
    #[inline]
    fn jmi(&mut self, mut pc: u16) -> Option<u16> {
        let dt = self.fetch_short(&mut pc);
        Some(pc.wrapping_add(dt))
    }

    /// `JSI`: like `JMI`, but first pushes the return address
    #[inline]
    fn jsi(&mut self, mut pc: u16) -> Option<u16> {
        let dt = self.fetch_short(&mut pc);
        self.ret.push_short(pc);
        Some(pc.wrapping_add(dt))
    }

    /// `LIT`: fetches the next value in memory and pushes it
    #[inline]
    fn lit<W: Word, const RET: bool>(&mut self, mut pc: u16) -> Option<u16> {
        let v: W = self.fetch_word(&mut pc);
        self.active::<false, RET>().put(v);
        Some(pc)
    }

    /// `INC a -- a+1`
    #[inline]
    fn inc<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let v: W = s.take();
        s.put(v.add(W::narrow(1)));
        Some(pc)
    }

    /// `POP a --`
    #[inline]
    fn pop<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let _: W = self.active::<KEEP, RET>().take();
        Some(pc)
    }

    /// `NIP a b -- b`
    #[inline]
    fn nip<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let b: W = s.take();
        let _: W = s.take();
        s.put(b);
        Some(pc)
    }

    /// `SWP a b -- b a`
    #[inline]
    fn swp<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let b: W = s.take();
        let a: W = s.take();
        s.put(b);
        s.put(a);
        Some(pc)
    }

    /// `ROT a b c -- b c a`
    #[inline]
    fn rot<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let c: W = s.take();
        let b: W = s.take();
        let a: W = s.take();
        s.put(b);
        s.put(c);
        s.put(a);
        Some(pc)
    }

    /// `DUP a -- a a`
    #[inline]
    fn dup<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let v: W = s.take();
        s.put(v);
        s.put(v);
        Some(pc)
    }

    /// `OVR a b -- a b a`
    #[inline]
    fn ovr<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let b: W = s.take();
        let a: W = s.take();
        s.put(a);
        s.put(b);
        s.put(a);
        Some(pc)
    }

    /// `EQU a b -- bool8`
    #[inline]
    fn equ<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.compare::<W, KEEP, RET>(pc, |a, b| a == b)
    }

    /// `NEQ a b -- bool8`
    #[inline]
    fn neq<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.compare::<W, KEEP, RET>(pc, |a, b| a != b)
    }

    /// `GTH a b -- bool8`
    #[inline]
    fn gth<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.compare::<W, KEEP, RET>(pc, |a, b| a > b)
    }

    /// `LTH a b -- bool8`
    #[inline]
    fn lth<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.compare::<W, KEEP, RET>(pc, |a, b| a < b)
    }

    /// `JMP addr --`: signed byte displacement, or absolute in short mode
    #[inline]
    fn jmp<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let dst: W = self.active::<KEEP, RET>().take();
        Some(dst.target(pc))
    }

    /// `JCN cond8 addr --`: the target is popped first, then the condition
    /// byte; the jump is taken if the condition is nonzero
    #[inline]
    fn jcn<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let dst: W = s.take();
        let cond = s.take_byte();
        Some(if cond != 0 { dst.target(pc) } else { pc })
    }

    /// `JSR addr -- | ret16`: stashes `pc` on the other stack, then jumps
    #[inline]
    fn jsr<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.inactive::<RET>().push_short(pc);
        let dst: W = self.active::<KEEP, RET>().take();
        Some(dst.target(pc))
    }

    /// `STH a -- | a`: moves a value to the other stack
    #[inline]
    fn sth<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let v: W = self.active::<KEEP, RET>().take();
        self.inactive::<RET>().push_word(v);
        Some(pc)
    }

    /// `LDZ addr8 -- value`
    #[inline]
    fn ldz<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let addr = self.active::<KEEP, RET>().take_byte();
        let v: W = self.ram_get(u16::from(addr));
        self.active::<KEEP, RET>().put(v);
        Some(pc)
    }

    /// `STZ val addr8 --`
    ///
    /// The short form writes its low byte at `addr+1` wrapped modulo the
    /// full address space, not modulo the zero page.
    #[inline]
    fn stz<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let addr = s.take_byte();
        let v: W = s.take();
        self.ram_set(u16::from(addr), v);
        Some(pc)
    }

    /// `LDR addr8 -- value`: signed displacement from `pc`
    #[inline]
    fn ldr<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let offset = self.active::<KEEP, RET>().take_byte();
        let v: W = self.ram_get(offset.target(pc));
        self.active::<KEEP, RET>().put(v);
        Some(pc)
    }

    /// `STR val addr8 --`: signed displacement from `pc`
    #[inline]
    fn str<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let offset = s.take_byte();
        let v: W = s.take();
        self.ram_set(offset.target(pc), v);
        Some(pc)
    }

    /// `LDA addr16 -- value`
    #[inline]
    fn lda<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let addr = self.active::<KEEP, RET>().take_short();
        let v: W = self.ram_get(addr);
        self.active::<KEEP, RET>().put(v);
        Some(pc)
    }

    /// `STA val addr16 --`
    #[inline]
    fn sta<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let addr = s.take_short();
        let v: W = s.take();
        self.ram_set(addr, v);
        Some(pc)
    }

    /// `DEI device8 -- value`: asks the device bridge for a port value
    ///
    /// The result slots are reserved on the active stack before the bridge
    /// call, matching `uxn.c`, which grows the stack ahead of the device
    /// handler; a device reading the stack height mid-instruction
    /// (`System.wst`/`System.rst`) counts the pending result.
    #[inline]
    fn dei<W: Word, const KEEP: bool, const RET: bool>(
        &mut self,
        dev: &mut dyn Device,
        pc: u16,
    ) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let port = s.take_byte();
        s.reserve(if W::WIDE { 2 } else { 1 });
        let v = dev.dei(self, port, W::WIDE);
        self.active::<KEEP, RET>().emplace(W::narrow(v));
        Some(pc)
    }

    /// `DEO val device8 --`: hands a port write to the device bridge
    ///
    /// The device decides whether execution continues.
    #[inline]
    fn deo<W: Word, const KEEP: bool, const RET: bool>(
        &mut self,
        dev: &mut dyn Device,
        pc: u16,
    ) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let port = s.take_byte();
        let v: W = s.take();
        if dev.deo(self, port, v.widen(), W::WIDE) {
            Some(pc)
        } else {
            None
        }
    }

    /// `ADD a b -- a+b`
    #[inline]
    fn add<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.binary::<W, KEEP, RET>(pc, W::add)
    }

    /// `SUB a b -- a-b`
    #[inline]
    fn sub<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.binary::<W, KEEP, RET>(pc, W::sub)
    }

    /// `MUL a b -- a*b`
    #[inline]
    fn mul<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.binary::<W, KEEP, RET>(pc, W::mul)
    }

    /// `DIV a b -- a/b`, where division by zero yields zero
    #[inline]
    fn div<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.binary::<W, KEEP, RET>(pc, W::div)
    }

    /// `AND a b -- a&b`
    #[inline]
    fn and<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.binary::<W, KEEP, RET>(pc, W::and)
    }

    /// `ORA a b -- a|b`
    #[inline]
    fn ora<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.binary::<W, KEEP, RET>(pc, W::or)
    }

    /// `EOR a b -- a^b`
    #[inline]
    fn eor<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        self.binary::<W, KEEP, RET>(pc, W::xor)
    }

    /// `SFT a shift8 -- c`: right shift by the low nibble, then left shift
    /// by the high nibble
    #[inline]
    fn sft<W: Word, const KEEP: bool, const RET: bool>(&mut self, pc: u16) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let shift = s.take_byte();
        let v: W = s.take();
        s.put(v.shr(u32::from(shift & 0xf)).shl(u32::from(shift >> 4)));
        Some(pc)
    }

    #[inline]
    fn binary<W: Word, const KEEP: bool, const RET: bool>(
        &mut self,
        pc: u16,
        f: fn(W, W) -> W,
    ) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let b: W = s.take();
        let a: W = s.take();
        s.put(f(a, b));
        Some(pc)
    }

    /// Comparisons always push a single byte, whatever the operand width
    #[inline]
    fn compare<W: Word, const KEEP: bool, const RET: bool>(
        &mut self,
        pc: u16,
        f: fn(W, W) -> bool,
    ) -> Option<u16> {
        let mut s = self.active::<KEEP, RET>();
        let b: W = s.take();
        let a: W = s.take();
        s.put_byte(u8::from(f(a, b)));
        Some(pc)
    }
}

#[cfg(feature = "alloc")]
mod ram {
    extern crate alloc;
    use alloc::{boxed::Box, vec};

    /// Heap-allocated 64 KiB RAM for the VM
    ///
    /// Only available with the `"alloc"` feature.
    pub struct Ram(Box<[u8; 65536]>);

    impl Ram {
        /// Builds a zero-filled RAM
        pub fn new() -> Self {
            Ram(vec![0u8; 65536].into_boxed_slice().try_into().unwrap())
        }

        /// Leaks the allocation, yielding a `'static` buffer
        pub fn leak(self) -> &'static mut [u8; 65536] {
            Box::leak(self.0)
        }
    }

    impl Default for Ram {
        fn default() -> Self {
            Self::new()
        }
    }

    impl core::ops::Deref for Ram {
        type Target = [u8; 65536];
        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl core::ops::DerefMut for Ram {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }
}

#[cfg(feature = "alloc")]
pub use ram::Ram;

#[cfg(all(feature = "alloc", test))]
mod tests {
    use super::*;

    /// VM state captured after a run, stacks listed bottom to top
    struct Halted {
        work: Vec<u8>,
        ret: Vec<u8>,
        pc: u16,
    }

    fn dump(s: &Stack) -> Vec<u8> {
        (0..s.len()).rev().map(|i| s.peek_byte_at(i)).collect()
    }

    fn run_with<D: Device>(rom: &[u8], dev: &mut D) -> Halted {
        let mut ram = Ram::new();
        let mut vm = Uxn::new(&mut ram);
        let _ = vm.reset(rom);
        let pc = vm.run(dev, 0x100);
        Halted {
            work: dump(vm.work()),
            ret: dump(vm.ret()),
            pc,
        }
    }

    fn run_rom(rom: &[u8]) -> Halted {
        run_with(rom, &mut NullDevice)
    }

    #[test]
    fn add_bytes() {
        // LIT 2a LIT 02 ADD BRK
        let h = run_rom(&[0x80, 0x2a, 0x80, 0x02, 0x18, 0x00]);
        assert_eq!(h.work, [0x2c]);
        assert!(h.ret.is_empty());
        assert_eq!(h.pc, 0x106);
    }

    #[test]
    fn add_shorts() {
        // LIT2 0005 LIT2 0003 ADD2 BRK
        let h = run_rom(&[0xa0, 0x00, 0x05, 0xa0, 0x00, 0x03, 0x38, 0x00]);
        assert_eq!(h.work, [0x00, 0x08]);
        assert_eq!(h.pc, 0x108);
    }

    #[test]
    fn div_by_zero() {
        // LIT 01 LIT 00 DIV BRK
        let h = run_rom(&[0x80, 0x01, 0x80, 0x00, 0x1b, 0x00]);
        assert_eq!(h.work, [0x00]);

        // LIT2 0010 LIT2 0000 DIV2 BRK
        let h = run_rom(&[0xa0, 0x00, 0x10, 0xa0, 0x00, 0x00, 0x3b, 0x00]);
        assert_eq!(h.work, [0x00, 0x00]);
    }

    #[test]
    fn inc_wraps() {
        // LIT ff INC BRK
        let h = run_rom(&[0x80, 0xff, 0x01, 0x00]);
        assert_eq!(h.work, [0x00]);

        // LIT2 ffff INC2 BRK
        let h = run_rom(&[0xa0, 0xff, 0xff, 0x21, 0x00]);
        assert_eq!(h.work, [0x00, 0x00]);
    }

    #[test]
    fn jcn_pops_target_then_condition() {
        // LIT 05 LIT 03 JCN ... : the target (3) is on top, the condition
        // (5) beneath it, so the branch lands at 0x105 + 3 = 0x108
        let h = run_rom(&[0x80, 0x05, 0x80, 0x03, 0x0d, 0x02, 0x00]);
        assert!(h.work.is_empty());
        assert_eq!(h.pc, 0x109);
    }

    #[test]
    fn jcn_falls_through_on_zero() {
        let h = run_rom(&[0x80, 0x00, 0x80, 0x02, 0x0d, 0x00, 0x00]);
        assert!(h.work.is_empty());
        assert_eq!(h.pc, 0x106);
    }

    #[test]
    fn jci_and_jmi() {
        // LIT 01 JCI +0002, landing on the BRK at 0x107
        let h = run_rom(&[0x80, 0x01, 0x20, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(h.pc, 0x108);

        // LIT 00 JCI +0002 falls through to the BRK at 0x105
        let h = run_rom(&[0x80, 0x00, 0x20, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(h.pc, 0x106);

        // JMI +0003
        let h = run_rom(&[0x40, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(h.pc, 0x107);
    }

    #[test]
    fn jsi_pushes_return_address() {
        // JSI +0002 BRK BRK
        let h = run_rom(&[0x60, 0x00, 0x02, 0x00, 0x00]);
        assert_eq!(h.ret, [0x01, 0x03]);
        assert_eq!(h.pc, 0x106);
    }

    #[test]
    fn jsr_and_jmp2r() {
        // LIT 02 JSR skips two bytes; the stashed return address is 0x103
        let h = run_rom(&[0x80, 0x02, 0x0e, 0x00, 0x00, 0x00]);
        assert_eq!(h.ret, [0x01, 0x03]);
        assert_eq!(h.pc, 0x106);

        // JSI into a routine that runs LIT 42, then returns with JMP2r
        let h = run_rom(&[0x60, 0x00, 0x02, 0x00, 0x00, 0x80, 0x42, 0x6c]);
        assert_eq!(h.work, [0x42]);
        assert!(h.ret.is_empty());
        assert_eq!(h.pc, 0x104);
    }

    #[test]
    fn literals() {
        let h = run_rom(&[0x80, 0x12, 0x00]); // LIT
        assert_eq!(h.work, [0x12]);

        let h = run_rom(&[0xa0, 0xab, 0xcd, 0x00]); // LIT2
        assert_eq!(h.work, [0xab, 0xcd]);

        let h = run_rom(&[0xc0, 0x34, 0x00]); // LITr
        assert_eq!(h.ret, [0x34]);

        let h = run_rom(&[0xe0, 0x12, 0x34, 0x00]); // LIT2r
        assert_eq!(h.ret, [0x12, 0x34]);
    }

    #[test]
    fn stack_shuffles() {
        // NIP2k
        let h = run_rom(&[0xa0, 0x12, 0x34, 0xa0, 0x56, 0x78, 0xa3, 0x00]);
        assert_eq!(h.work, [0x12, 0x34, 0x56, 0x78, 0x56, 0x78]);

        // SWP2
        let h = run_rom(&[0xa0, 0x12, 0x34, 0xa0, 0x56, 0x78, 0x24, 0x00]);
        assert_eq!(h.work, [0x56, 0x78, 0x12, 0x34]);

        // ROT: a b c -- b c a
        let h = run_rom(&[0x80, 0x01, 0x80, 0x02, 0x80, 0x03, 0x05, 0x00]);
        assert_eq!(h.work, [0x02, 0x03, 0x01]);

        // OVR
        let h = run_rom(&[0x80, 0x12, 0x80, 0x34, 0x07, 0x00]);
        assert_eq!(h.work, [0x12, 0x34, 0x12]);
    }

    #[test]
    fn keep_mode_leaves_operands() {
        // DUP2k: the original short stays, plus two copies
        let h = run_rom(&[0xa0, 0x12, 0x34, 0xa6, 0x00]);
        assert_eq!(h.work, [0x12, 0x34, 0x12, 0x34, 0x12, 0x34]);

        // POP2k is a no-op
        let h = run_rom(&[0xa0, 0x12, 0x34, 0xa2, 0x00]);
        assert_eq!(h.work, [0x12, 0x34]);

        // GTHk
        let h = run_rom(&[0x80, 0x34, 0x80, 0x12, 0x8a, 0x00]);
        assert_eq!(h.work, [0x34, 0x12, 0x01]);

        // ADD2k
        let h = run_rom(&[0xa0, 0x00, 0x05, 0xa0, 0x00, 0x03, 0xb8, 0x00]);
        assert_eq!(h.work, [0x00, 0x05, 0x00, 0x03, 0x00, 0x08]);
    }

    #[test]
    fn keep_then_drop_matches_plain() {
        // DUPk POP leaves the same stack as DUP
        let kept = run_rom(&[0x80, 0x77, 0x86, 0x02, 0x00]);
        let plain = run_rom(&[0x80, 0x77, 0x06, 0x00]);
        assert_eq!(kept.work, plain.work);
    }

    #[test]
    fn sth_round_trips() {
        // LIT2 beef STH2 STH2r: over to the return stack and back
        let h = run_rom(&[0xa0, 0xbe, 0xef, 0x2f, 0x6f, 0x00]);
        assert_eq!(h.work, [0xbe, 0xef]);
        assert!(h.ret.is_empty());

        // LITr 34 STHr
        let h = run_rom(&[0xc0, 0x34, 0x4f, 0x00]);
        assert_eq!(h.work, [0x34]);
        assert!(h.ret.is_empty());
    }

    #[test]
    fn return_mode_swaps_stacks() {
        // LITr 02 LITr 03 ADDr
        let h = run_rom(&[0xc0, 0x02, 0xc0, 0x03, 0x58, 0x00]);
        assert!(h.work.is_empty());
        assert_eq!(h.ret, [0x05]);
    }

    #[test]
    fn comparisons_push_bytes() {
        // EQU2k pushes a single byte over the kept shorts
        let h = run_rom(&[0xa0, 0xab, 0xcd, 0xa0, 0xab, 0xcd, 0xa8, 0x00]);
        assert_eq!(h.work, [0xab, 0xcd, 0xab, 0xcd, 0x01]);

        // LTH2
        let h = run_rom(&[0xa0, 0x00, 0x01, 0xa0, 0x00, 0x00, 0x2b, 0x00]);
        assert_eq!(h.work, [0x00]);
    }

    #[test]
    fn shifts() {
        // SFT: right by low nibble, then left by high nibble
        let h = run_rom(&[0x80, 0x34, 0x80, 0x10, 0x1f, 0x00]);
        assert_eq!(h.work, [0x68]);

        let h = run_rom(&[0x80, 0x34, 0x80, 0x01, 0x1f, 0x00]);
        assert_eq!(h.work, [0x1a]);

        // SFTk
        let h = run_rom(&[0x80, 0x34, 0x80, 0x33, 0x9f, 0x00]);
        assert_eq!(h.work, [0x34, 0x33, 0x30]);

        // SFT2 takes a byte shift but a short value
        let h = run_rom(&[0xa0, 0x12, 0x48, 0x80, 0x34, 0x3f, 0x00]);
        assert_eq!(h.work, [0x09, 0x20]);
    }

    #[test]
    fn zero_page_addressing() {
        // LIT 42 LIT 10 STZ, then LIT 10 LDZ reads it back
        let h = run_rom(&[0x80, 0x42, 0x80, 0x10, 0x11, 0x80, 0x10, 0x10, 0x00]);
        assert_eq!(h.work, [0x42]);
    }

    #[test]
    fn stz2_low_byte_wraps_past_the_zero_page() {
        let mut ram = Ram::new();
        let mut vm = Uxn::new(&mut ram);
        // LIT2 abcd LIT ff STZ2: the high byte lands at 0x00ff, the low
        // byte at 0x0100, overwriting the already-executed LIT2
        let _ = vm.reset(&[0xa0, 0xab, 0xcd, 0x80, 0xff, 0x31, 0x00]);
        vm.run(&mut NullDevice, 0x100);
        assert_eq!(vm.ram_read_byte(0x00ff), 0xab);
        assert_eq!(vm.ram_read_byte(0x0100), 0xcd);
        assert_eq!(vm.ram_read_short(0x00ff), 0xabcd);
    }

    #[test]
    fn relative_addressing() {
        // LIT fe LDR reads two bytes back from the post-fetch pc, which is
        // the LIT operand itself
        let h = run_rom(&[0x80, 0xfe, 0x12, 0x00]);
        assert_eq!(h.work, [0xfe]);

        // LDR2 one byte forward, past the BRK
        let h = run_rom(&[0x80, 0x01, 0x32, 0x00, 0xab, 0xcd]);
        assert_eq!(h.work, [0xab, 0xcd]);
        assert_eq!(h.pc, 0x104);

        // LIT 99 LIT 01 STR writes past the BRK
        let mut ram = Ram::new();
        let mut vm = Uxn::new(&mut ram);
        let _ = vm.reset(&[0x80, 0x99, 0x80, 0x01, 0x13, 0x00]);
        vm.run(&mut NullDevice, 0x100);
        assert_eq!(vm.ram_read_byte(0x106), 0x99);
    }

    #[test]
    fn absolute_addressing() {
        // LIT 42 LIT2 8000 STA, LIT2 8000 LDA
        let h = run_rom(&[
            0x80, 0x42, 0xa0, 0x80, 0x00, 0x15, 0xa0, 0x80, 0x00, 0x14, 0x00,
        ]);
        assert_eq!(h.work, [0x42]);

        // The short forms move two bytes
        let h = run_rom(&[
            0xa0, 0xbe, 0xef, 0xa0, 0x90, 0x00, 0x35, 0xa0, 0x90, 0x00, 0x34, 0x00,
        ]);
        assert_eq!(h.work, [0xbe, 0xef]);
    }

    #[test]
    fn jmp_modes() {
        // LIT 01 JMP skips one byte
        let h = run_rom(&[0x80, 0x01, 0x0c, 0xff, 0x00]);
        assert_eq!(h.pc, 0x105);

        // JMP2 to an absolute address
        let h = run_rom(&[0xa0, 0x01, 0x08, 0x2c, 0xff, 0xff, 0xff, 0xff, 0x00]);
        assert_eq!(h.pc, 0x109);
    }

    #[test]
    fn growing_a_stack_256_times_restores_its_index() {
        let mut rom = vec![];
        for i in 0..=255u8 {
            rom.push(0x80); // LIT
            rom.push(i);
        }
        rom.push(0x00);
        let h = run_rom(&rom);
        assert!(h.work.is_empty());
    }

    #[test]
    fn underflow_reads_the_wrapped_slot() {
        // POP on an empty stack leaves 255 bytes behind
        let h = run_rom(&[0x02, 0x00]);
        assert_eq!(h.work.len(), 255);
    }

    /// Bridge double for the device tests below
    struct Probe {
        value: u16,
        halt: bool,
        last: Option<(u8, u16, bool)>,
    }

    impl Probe {
        fn new(value: u16) -> Self {
            Self {
                value,
                halt: false,
                last: None,
            }
        }
    }

    impl Device for Probe {
        fn dei(&mut self, _vm: &mut Uxn, _port: u8, _wide: bool) -> u16 {
            self.value
        }
        fn deo(&mut self, _vm: &mut Uxn, port: u8, value: u16, wide: bool) -> bool {
            self.last = Some((port, value, wide));
            !self.halt
        }
    }

    #[test]
    fn dei_pushes_the_bridge_value() {
        let mut dev = Probe::new(0xbeef);

        // Byte reads only see the low byte
        let h = run_with(&[0x80, 0x10, 0x16, 0x00], &mut dev);
        assert_eq!(h.work, [0xef]);

        let h = run_with(&[0x80, 0x10, 0x36, 0x00], &mut dev);
        assert_eq!(h.work, [0xbe, 0xef]);

        // DEIk keeps the port byte below the result
        let h = run_with(&[0x80, 0x10, 0x96, 0x00], &mut dev);
        assert_eq!(h.work, [0x10, 0xef]);
    }

    #[test]
    fn deo_hands_port_and_value_to_the_bridge() {
        let mut dev = Probe::new(0);
        let h = run_with(&[0x80, 0x42, 0x80, 0x18, 0x17, 0x00], &mut dev);
        assert_eq!(dev.last, Some((0x18, 0x42, false)));
        assert_eq!(h.pc, 0x106);

        let h = run_with(&[0xa0, 0xbe, 0xef, 0x80, 0x20, 0x37, 0x00], &mut dev);
        assert_eq!(dev.last, Some((0x20, 0xbeef, true)));
        assert_eq!(h.pc, 0x107);
    }

    #[test]
    fn deo_halt_stops_the_run() {
        let mut dev = Probe::new(0);
        dev.halt = true;
        let h = run_with(&[0x80, 0x42, 0x80, 0x18, 0x17, 0x00], &mut dev);
        assert_eq!(h.pc, 0x105);
    }

    /// Device whose `deo` re-enters the interpreter at a fixed vector
    struct Reentrant;

    impl Device for Reentrant {
        fn dei(&mut self, _vm: &mut Uxn, _port: u8, _wide: bool) -> u16 {
            0
        }
        fn deo(&mut self, vm: &mut Uxn, _port: u8, value: u16, _wide: bool) -> bool {
            if value == 1 {
                vm.run(self, 0x200);
            }
            true
        }
    }

    #[test]
    fn device_may_reenter_the_interpreter() {
        let mut ram = Ram::new();
        let mut vm = Uxn::new(&mut ram);
        // LIT 01 LIT 30 DEO BRK; the vector at 0x200 pushes 0x99
        let _ = vm.reset(&[0x80, 0x01, 0x80, 0x30, 0x17, 0x00]);
        vm.ram_write_byte(0x200, 0x80);
        vm.ram_write_byte(0x201, 0x99);
        vm.ram_write_byte(0x202, 0x00);

        let pc = vm.run(&mut Reentrant, 0x100);

        // The nested run's stack effect is visible after the outer BRK
        assert_eq!(dump(vm.work()), [0x99]);
        assert_eq!(pc, 0x106);
    }

    #[test]
    fn reset_returns_trailing_rom_data() {
        let mut ram = Ram::new();
        let mut vm = Uxn::new(&mut ram);
        let rom = vec![0xaa; 0xff00 + 8];
        let extra = vm.reset(&rom);
        assert_eq!(extra.len(), 8);
        assert_eq!(vm.ram_read_byte(0x100), 0xaa);
        assert_eq!(vm.ram_read_byte(0xffff), 0xaa);
        assert_eq!(vm.ram_read_byte(0x00ff), 0x00);
    }

    #[test]
    fn opcode_names_follow_the_table_layout() {
        assert_eq!(op::name(0x00), "BRK");
        assert_eq!(op::name(0x20), "JCI");
        assert_eq!(op::name(0x40), "JMI");
        assert_eq!(op::name(0x60), "JSI");
        assert_eq!(op::name(0x80), "LIT");
        assert_eq!(op::name(0xa0), "LIT2");
        assert_eq!(op::name(0xc0), "LITr");
        assert_eq!(op::name(0xe0), "LIT2r");
        assert_eq!(op::ADD, 0x18);
        assert_eq!(op::ADD2, 0x38);
        assert_eq!(op::INC2kr, 0xe1);
        assert_eq!(op::name(0xff), "SFT2kr");
    }
}
