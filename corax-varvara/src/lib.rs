//! Console-oriented subset of the Varvara computer system
//!
//! This crate owns the 256-byte device-port page and dispatches `DEI`/`DEO`
//! traffic from the [`uxn`] core to the system, console, and datetime
//! devices.  Devices react to port writes, accumulate console output, and
//! invoke program vectors by re-entering [`Uxn::run`].
#![warn(missing_docs)]

use std::io::Write;

use log::warn;
use uxn::{Device, Uxn};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

mod console;
mod datetime;
mod system;

pub use console::worker as console_worker;
pub use console::Type as ConsoleType;

/// Size of one device's slice of the port page
pub const DEV_SIZE: usize = 16;

/// A typed view over one device's 16 bytes of the port page
pub trait Ports: AsBytes + FromBytes + FromZeroes {
    /// Base address of the device, of the form `0xA0`
    const BASE: u8;
}

/// Borrows a device's ports from the page
fn dev<P: Ports>(page: &[u8; 256]) -> &P {
    P::ref_from(&page[usize::from(P::BASE)..][..DEV_SIZE]).unwrap()
}

/// Mutably borrows a device's ports from the page
fn dev_mut<P: Ports>(page: &mut [u8; 256]) -> &mut P {
    P::mut_from(&mut page[usize::from(P::BASE)..][..DEV_SIZE]).unwrap()
}

/// Output accumulated since the previous drain
///
/// Returned by [`Varvara::output`]; the buffers are taken from the console
/// device and will be empty on a second call.
#[must_use]
pub struct Output {
    /// Bytes written to the console `write` port
    pub stdout: Vec<u8>,

    /// Bytes written to the console `error` port
    pub stderr: Vec<u8>,

    /// Exit code requested through the system `state` port
    pub exit: Option<i32>,
}

impl Output {
    /// Prints `stdout` and `stderr` to the host streams
    pub fn print(&self) -> std::io::Result<()> {
        if !self.stdout.is_empty() {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&self.stdout)?;
            stdout.flush()?;
        }
        if !self.stderr.is_empty() {
            let mut stderr = std::io::stderr().lock();
            stderr.write_all(&self.stderr)?;
            stderr.flush()?;
        }
        Ok(())
    }

    /// Prints both streams, then exits the process if the VM asked to
    pub fn check(&self) -> std::io::Result<()> {
        self.print()?;
        if let Some(e) = self.exit {
            log::info!("requested exit ({e})");
            std::process::exit(e);
        }
        Ok(())
    }
}

/// Handle to the peripherals and their port page
pub struct Varvara {
    ports: [u8; 256],

    system: system::System,
    console: console::Console,
    datetime: datetime::Datetime,

    /// Device nibbles we have already complained about
    already_warned: [bool; 16],
}

impl Default for Varvara {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Varvara {
    fn dei(&mut self, vm: &mut Uxn, port: u8, wide: bool) -> u16 {
        self.dei_port(vm, port);
        if wide {
            self.dei_port(vm, port.wrapping_add(1));
            let hi = self.ports[usize::from(port)];
            let lo = self.ports[usize::from(port.wrapping_add(1))];
            u16::from_be_bytes([hi, lo])
        } else {
            u16::from(self.ports[usize::from(port)])
        }
    }

    fn deo(&mut self, vm: &mut Uxn, port: u8, value: u16, wide: bool) -> bool {
        if wide {
            let [hi, lo] = value.to_be_bytes();
            self.ports[usize::from(port)] = hi;
            self.ports[usize::from(port.wrapping_add(1))] = lo;
        } else {
            self.ports[usize::from(port)] = value as u8;
        }
        self.deo_port(vm, port);
        if wide {
            self.deo_port(vm, port.wrapping_add(1));
        }
        !self.system.should_exit()
    }
}

impl Varvara {
    /// Builds the peripherals with an empty port page
    pub fn new() -> Self {
        Self {
            ports: [0u8; 256],
            system: system::System::new(),
            console: console::Console::new(),
            datetime: datetime::Datetime,
            already_warned: [false; 16],
        }
    }

    /// Clears the port page and device state, loading `extra` (trailing ROM
    /// data) into the system device's expansion banks
    pub fn reset(&mut self, extra: &[u8]) {
        self.ports.fill(0);
        self.system.reset(extra);
        self.console = console::Console::new();
        self.already_warned.fill(false);
    }

    /// Lets a device refresh the page byte behind a `DEI` read
    fn dei_port(&mut self, vm: &mut Uxn, port: u8) {
        match port & 0xf0 {
            system::SystemPorts::BASE => self.system.dei(vm, &mut self.ports, port),
            console::ConsolePorts::BASE => self.console.dei(vm, &mut self.ports, port),
            datetime::DatetimePorts::BASE => self.datetime.dei(&mut self.ports, port),
            t => self.warn_missing(t),
        }
    }

    /// Notifies a device of one written page byte
    fn deo_port(&mut self, vm: &mut Uxn, port: u8) {
        match port & 0xf0 {
            system::SystemPorts::BASE => self.system.deo(vm, &self.ports, port),
            console::ConsolePorts::BASE => self.console.deo(&self.ports, port),
            datetime::DatetimePorts::BASE => (),
            t => self.warn_missing(t),
        }
    }

    fn warn_missing(&mut self, t: u8) {
        if !self.already_warned[usize::from(t >> 4)] {
            warn!("unimplemented device {t:#04x}");
            self.already_warned[usize::from(t >> 4)] = true;
        }
    }

    /// Drains the accumulated output state
    pub fn output(&mut self, _vm: &Uxn) -> Output {
        Output {
            stdout: self.console.stdout(),
            stderr: self.console.stderr(),
            exit: self.system.exit(),
        }
    }

    /// Sends one character from the host console
    ///
    /// Stores the byte in the console `read` port, marks it as stdin, and
    /// runs the console vector (if any).
    pub fn console(&mut self, vm: &mut Uxn, c: u8) {
        self.console.set_type(&mut self.ports, console::Type::Stdin);
        let vector = self.console.store(&mut self.ports, c);
        self.call_vector(vm, vector);
    }

    /// Sends command-line arguments through the console protocol
    ///
    /// Each argument is delivered byte by byte with the `type` port set to
    /// `Argument`, separated by newlines marked as spacers; the final
    /// newline is marked as the argument end.  The type is left set to
    /// `Stdin` and the output state is returned.
    pub fn send_args(&mut self, vm: &mut Uxn, args: &[String]) -> Output {
        for (i, arg) in args.iter().enumerate() {
            self.console
                .set_type(&mut self.ports, console::Type::Argument);
            for c in arg.bytes() {
                let vector = self.console.store(&mut self.ports, c);
                self.call_vector(vm, vector);
            }

            let ty = if i == args.len() - 1 {
                console::Type::ArgumentEnd
            } else {
                console::Type::ArgumentSpacer
            };
            self.console.set_type(&mut self.ports, ty);
            let vector = self.console.store(&mut self.ports, b'\n');
            self.call_vector(vm, vector);
        }
        self.console.set_type(&mut self.ports, console::Type::Stdin);
        self.output(vm)
    }

    /// Runs the VM at the given vector; vector 0 is ignored
    fn call_vector(&mut self, vm: &mut Uxn, vector: u16) {
        if vector != 0 {
            vm.run(self, vector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn ports_structs_span_one_device() {
        assert_eq!(size_of::<system::SystemPorts>(), DEV_SIZE);
        assert_eq!(size_of::<console::ConsolePorts>(), DEV_SIZE);
        assert_eq!(size_of::<datetime::DatetimePorts>(), DEV_SIZE);
    }
}
