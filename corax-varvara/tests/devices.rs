use uxn::{Ram, Uxn};
use varvara::Varvara;

/// ROM that registers `0x0110` as the console vector; the routine there
/// echoes the `read` port back out through the `write` port.
fn echo_rom() -> Vec<u8> {
    let mut rom = vec![
        0xa0, 0x01, 0x10, // LIT2 0110
        0x80, 0x10, // LIT 10
        0x37, // DEO2 (console vector)
        0x00, // BRK
    ];
    rom.resize(0x10, 0x00);
    rom.extend_from_slice(&[
        0x80, 0x12, // LIT 12
        0x16, // DEI (console read)
        0x80, 0x18, // LIT 18
        0x17, // DEO (console write)
        0x00, // BRK
    ]);
    rom
}

#[test]
fn console_write_accumulates_stdout() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    // LIT 'h' LIT 18 DEO, LIT 'i' LIT 19 DEO
    let rom = [
        0x80, b'h', 0x80, 0x18, 0x17, //
        0x80, b'i', 0x80, 0x19, 0x17, //
        0x00,
    ];
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);

    let out = dev.output(&vm);
    assert_eq!(out.stdout, b"h");
    assert_eq!(out.stderr, b"i");
    assert_eq!(out.exit, None);

    // The accumulators drain on read
    let out = dev.output(&vm);
    assert!(out.stdout.is_empty());
}

#[test]
fn console_input_invokes_the_vector() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    let rom = echo_rom();
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);
    assert!(dev.output(&vm).stdout.is_empty());

    dev.console(&mut vm, b'x');
    dev.console(&mut vm, b'y');
    assert_eq!(dev.output(&vm).stdout, b"xy");
}

#[test]
fn arguments_are_delivered_through_the_console() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    let rom = echo_rom();
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);

    let args = vec!["one".to_owned(), "two".to_owned()];
    let out = dev.send_args(&mut vm, &args);
    assert_eq!(out.stdout, b"one\ntwo\n");
}

#[test]
fn state_port_requests_exit() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    // LIT 81 LIT 0f DEO, then an unreachable console write
    let rom = [
        0x80, 0x81, 0x80, 0x0f, 0x17, //
        0x80, b'z', 0x80, 0x18, 0x17, //
        0x00,
    ];
    let extra = vm.reset(&rom);
    dev.reset(extra);
    let pc = vm.run(&mut dev, 0x100);

    // The run stops at the DEO, before the console write
    assert_eq!(pc, 0x105);
    let out = dev.output(&vm);
    assert_eq!(out.exit, Some(1));
    assert!(out.stdout.is_empty());
}

#[test]
fn wst_port_resizes_the_working_stack() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    // LIT 05 LIT 04 DEO sets the working stack height to 5
    let rom = [0x80, 0x05, 0x80, 0x04, 0x17, 0x00];
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);
    assert_eq!(vm.work().len(), 5);

    // DEI on the same port reads the height back; the pending result slot
    // is already reserved when the device looks, so seven stacked bytes
    // read back as eight
    let rom = [0x80, 0x07, 0x80, 0x04, 0x17, 0x80, 0x04, 0x16, 0x00];
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);
    assert_eq!(vm.work().len(), 8);
    assert_eq!(vm.work().peek_byte_at(0), 8);
}

#[test]
fn stack_heights_count_the_pending_dei_result() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    // LIT 04 DEI2 reads wst and rst as one short: the popped port byte is
    // replaced by the two reserved result slots, so wst reads 2
    let rom = [0x80, 0x04, 0x36, 0x00];
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);
    assert_eq!(vm.work().len(), 2);
    assert_eq!(vm.work().peek_short_at(0), 0x0200);

    // LITr 05 DEIr reads rst on the stack it executes on
    let rom = [0xc0, 0x05, 0x56, 0x00];
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);
    assert_eq!(vm.ret().len(), 1);
    assert_eq!(vm.ret().peek_byte_at(0), 1);
    assert!(vm.work().is_empty());
}

#[test]
fn expansion_fill_writes_main_ram() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    // LIT2 0200 LIT 02 DEO2 points the expansion port at the command block
    let rom = [0xa0, 0x02, 0x00, 0x80, 0x02, 0x37, 0x00];
    let extra = vm.reset(&rom);
    dev.reset(extra);

    // fill: length 0004, bank 0000, addr 3000, value ab
    for (i, b) in [0x00, 0x00, 0x04, 0x00, 0x00, 0x30, 0x00, 0xab]
        .into_iter()
        .enumerate()
    {
        vm.ram_write_byte(0x200 + i as u16, b);
    }
    vm.run(&mut dev, 0x100);

    for addr in 0x3000..0x3004 {
        assert_eq!(vm.ram_read_byte(addr), 0xab);
    }
    assert_eq!(vm.ram_read_byte(0x3004), 0x00);
}

#[test]
fn datetime_reads_are_plausible() {
    let mut ram = Ram::new();
    let mut vm = Uxn::new(&mut ram);
    let mut dev = Varvara::new();

    // LIT c0 DEI2 (year), LIT c2 DEI (month)
    let rom = [0x80, 0xc0, 0x36, 0x80, 0xc2, 0x16, 0x00];
    let extra = vm.reset(&rom);
    dev.reset(extra);
    vm.run(&mut dev, 0x100);

    let month = vm.work().peek_byte_at(0);
    let year = vm.work().peek_short_at(1);
    assert!((2020..2200).contains(&year));
    assert!(month < 12);
}
