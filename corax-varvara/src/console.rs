use std::mem::offset_of;

use uxn::Uxn;
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

use crate::{dev, dev_mut, Ports};

pub struct Console {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ConsolePorts {
    vector: U16<BigEndian>,
    read: u8,
    _pad: [u8; 4],
    type_: u8,
    write: u8,
    error: u8,
    _tail: [u8; 6],
}

impl Ports for ConsolePorts {
    const BASE: u8 = 0x10;
}

impl ConsolePorts {
    const WRITE: u8 = Self::BASE | offset_of!(Self, write) as u8;
    const ERROR: u8 = Self::BASE | offset_of!(Self, error) as u8;
}

/// Origin tag for a byte delivered through the `read` port
#[derive(Copy, Clone, Debug)]
pub enum Type {
    /// No input is queued
    #[allow(unused)]
    NoQueue = 0,
    /// A byte read from the host's stdin
    Stdin = 1,
    /// A byte of a command-line argument
    Argument = 2,
    /// The separator between two arguments
    ArgumentSpacer = 3,
    /// The end of the argument list
    ArgumentEnd = 4,
}

/// Spawns a worker thread that forwards `stdin` bytes over a channel
///
/// The thread exits when stdin closes or the receiver is dropped.
pub fn worker() -> std::sync::mpsc::Receiver<u8> {
    use std::io::Read;
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 32];
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &c in &buf[..n] {
                if tx.send(c).is_err() {
                    return;
                }
            }
        }
    });
    rx
}

impl Console {
    pub fn new() -> Self {
        Self {
            stdout: vec![],
            stderr: vec![],
        }
    }

    pub fn deo(&mut self, page: &[u8; 256], port: u8) {
        let p = dev::<ConsolePorts>(page);
        match port {
            ConsolePorts::WRITE => self.stdout.push(p.write),
            ConsolePorts::ERROR => self.stderr.push(p.error),
            _ => (),
        }
    }

    pub fn dei(&mut self, _vm: &mut Uxn, _page: &mut [u8; 256], _port: u8) {
        // Nothing to refresh; reads see whatever the page already holds
    }

    /// Sets the `type` port ahead of a `read` delivery
    pub fn set_type(&mut self, page: &mut [u8; 256], ty: Type) {
        dev_mut::<ConsolePorts>(page).type_ = ty as u8;
    }

    /// Stores an incoming byte in the `read` port and returns the vector
    /// that should be invoked for it
    pub fn store(&mut self, page: &mut [u8; 256], c: u8) -> u16 {
        let p = dev_mut::<ConsolePorts>(page);
        p.read = c;
        p.vector.get()
    }

    /// Takes the `stdout` buffer, leaving it empty
    pub fn stdout(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stdout)
    }

    /// Takes the `stderr` buffer, leaving it empty
    pub fn stderr(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stderr)
    }
}
