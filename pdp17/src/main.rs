use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;

use pdp17_core::bus::Bus;
use pdp17_core::constants::{Addr, Word, MAX_PAGES, PAGE_SIZE};
use pdp17_core::cpu::Cpu;
use pdp17_core::ram::Ram;
use pdp17_core::zpage::ZeroPage;
use pdp17_peripherals::{run_machine, stdin_source, Console};

/// Configures the command-line interface using clap
fn get_cli_config<'a>() -> clap::ArgMatches<'a> {
    clap::App::new("PDP-17")
        .version("0.1")
        .about("A 16-bit minicomputer emulator with a front-panel monitor")
        .subcommand(
            clap::SubCommand::with_name("demo")
                .help("Run the built-in console demonstration program"),
        )
        .get_matches()
}

fn main() {
    env_logger::init();

    // Ctrl-C raises the shared interrupt flag the run loop polls
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        error!("signal handler failed: {:?}", e);
        return;
    }

    let matches = get_cli_config();

    let mut bus = match Bus::new(PAGE_SIZE) {
        Ok(bus) => bus,
        Err(e) => {
            error!("bus setup failed: {}", e);
            return;
        }
    };

    // Flat memory behind every page above the zero page
    let ram = bus.add_unit(Box::new(Ram::new()));
    for page in 1..MAX_PAGES {
        if let Err(e) = bus.install(page, ram) {
            error!("memory install failed: {}", e);
            return;
        }
    }

    let mut cpu = match Cpu::new(bus) {
        Ok(cpu) => cpu,
        Err(e) => {
            error!("cpu install failed: {}", e);
            return;
        }
    };

    let mut console = match Console::attach(&mut cpu, Box::new(io::stdout()), stdin_source()) {
        Ok(console) => console,
        Err(e) => {
            error!("console install failed: {}", e);
            return;
        }
    };

    match matches.subcommand_name() {
        Some("demo") => run_demo(&mut cpu, &mut console, &interrupt),
        _ => monitor(&mut cpu, &mut console, &interrupt),
    }
}

/// Parses one monitor line into a command letter and an optional hex value.
/// Accepts both `a100` and `a 100`; anything beyond one value is garbage.
fn parse_command(line: &str) -> Option<(char, Option<Word>)> {
    let mut tokens = line.split_whitespace();
    let head = tokens.next()?;

    let mut chars = head.chars();
    let command = chars.next()?.to_ascii_lowercase();
    if !command.is_ascii_alphabetic() {
        return None;
    }

    let inline: String = chars.collect();
    let tail = tokens.next();
    if tokens.next().is_some() || (!inline.is_empty() && tail.is_some()) {
        return None;
    }

    match (inline.is_empty(), tail) {
        (true, None) => Some((command, None)),
        (false, None) => parse_hex(&inline).map(|value| (command, Some(value))),
        (true, Some(token)) => parse_hex(token).map(|value| (command, Some(value))),
        (false, Some(_)) => None,
    }
}

fn parse_hex(token: &str) -> Option<Word> {
    if token.len() > 4 {
        return None;
    }
    Word::from_str_radix(token, 16).ok()
}

/// Raw register dump, two rows: accumulators plus PSW, index registers
/// plus PC.
fn dump_registers(zpage: &ZeroPage) {
    println!("A0   A1   A2   A3   A4   A5   A6   PSW");
    println!(
        "{:04X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X}",
        zpage.get(0),
        zpage.get(1),
        zpage.get(2),
        zpage.get(3),
        zpage.get(4),
        zpage.get(5),
        zpage.get(6),
        zpage.get(7),
    );
    println!("I0   I1   I2   I3   I4   I5   I6   PC");
    println!(
        "{:04X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X}",
        zpage.get(8),
        zpage.get(9),
        zpage.get(10),
        zpage.get(11),
        zpage.get(12),
        zpage.get(13),
        zpage.get(14),
        zpage.get(15),
    );
}

/// The front-panel monitor loop.
fn monitor(cpu: &mut Cpu, console: &mut Console, interrupt: &Arc<AtomicBool>) {
    println!("\"PDP-17\" - for evaluation use only");

    let zpage = cpu.zpage();
    let stdin = io::stdin();
    let mut addr: Word = 0;
    let mut data: Word = 0;

    loop {
        print!("{:04X} {:04X}> ", addr, cpu.switches);
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("console read failed: {}", e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        let parsed = parse_command(&line);
        match parsed {
            Some(('a', Some(value))) => addr = value,
            Some(('d', value)) => {
                if let Some(value) = value {
                    data = value;
                }
                if cpu.bus.write(addr as Addr, data).is_err() {
                    println!("?");
                }
                addr = addr.wrapping_add(1);
            }
            Some(('i', value)) => {
                if let Some(value) = value {
                    addr = value;
                }
                match cpu.bus.read(addr as Addr) {
                    Ok(word) => {
                        data = word;
                        println!("{:04X}", word);
                    }
                    Err(_) => println!("?"),
                }
                addr = addr.wrapping_add(1);
            }
            Some(('g', None)) => {
                zpage.set_pc(addr);
                resume(cpu, console, interrupt);
            }
            Some(('c', None)) => resume(cpu, console, interrupt),
            Some(('s', None)) => {
                cpu.step();
                dump_registers(&zpage);
            }
            Some(('r', None)) => dump_registers(&zpage),
            Some(('w', Some(value))) => cpu.switches = value,
            Some(('q', None)) => break,
            _ => println!("?"),
        }
    }
}

/// Clears any halt, rearms the interrupt flag, and runs with the console
/// attached.
fn resume(cpu: &mut Cpu, console: &mut Console, interrupt: &Arc<AtomicBool>) {
    cpu.clear_halt();
    interrupt.store(false, Ordering::Relaxed);
    run_machine(cpu, console, interrupt);
}

/// Hand-assembled greeting: for each character, clear A0, add the letter
/// from the data block at the top of the page, and print it through the
/// console device.
fn run_demo(cpu: &mut Cpu, console: &mut Console, interrupt: &Arc<AtomicBool>) {
    const ORIGIN: Addr = 0x0200;
    const TEXT: &[u8] = b"HELLO\r\n";
    const DATA: Addr = 0x02F0;

    const CLA: Word = 0xE080;
    const IOT_WRITE: Word = 0xC024; // unit 4, function 4
    const HLT: Word = 0xE102;

    let mut at = ORIGIN;
    for index in 0..TEXT.len() as Addr {
        let tad = 0x2000 | (DATA + index) as Word & 0xFF; // TAD A0, page-relative
        for word in [CLA, tad, IOT_WRITE] {
            if cpu.bus.write(at, word).is_err() {
                error!("demo load failed at {:04X}", at);
                return;
            }
            at += 1;
        }
    }
    let _ = cpu.bus.write(at, HLT);
    for (index, &byte) in TEXT.iter().enumerate() {
        let _ = cpu.bus.write(DATA + index as Addr, byte as Word);
    }

    cpu.zpage().set_pc(ORIGIN as Word);
    let executed = run_machine(cpu, console, interrupt);
    println!("{} cycles", executed);
}
