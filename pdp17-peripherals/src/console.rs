use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use pdp17_core::bus::{BusError, InstallError, Unit};
use pdp17_core::constants::console::*;
use pdp17_core::constants::psw::FLAG_IO;
use pdp17_core::constants::Word;
use pdp17_core::cpu::Cpu;
use pdp17_core::zpage::ZeroPage;

use crate::mailbox::Mailbox;

const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Bus-side half of the console: posts attention commands to the mailbox
/// and returns without waiting for a device thread to pick them up.
struct ConsoleAttn {
    mailbox: Arc<Mailbox>,
}

impl Unit for ConsoleAttn {
    fn attn(&mut self, unit: usize, cmd: Word) -> Result<(), BusError> {
        self.mailbox.post(unit, cmd);
        Ok(())
    }
}

/// The console terminal: one poll thread per direction, each claiming its
/// own unit's commands from the shared mailbox, acting on them, and
/// clearing the CPU's IO-pending bit. The CPU only ever sets that bit;
/// these threads own the clear.
pub struct Console {
    mailbox: Arc<Mailbox>,
    zpage: Arc<ZeroPage>,
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    source: Receiver<u8>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Console {
    /// Installs the console's attention handler for both unit numbers and
    /// returns the idle device, ready to `start`.
    pub fn attach(
        cpu: &mut Cpu,
        sink: Box<dyn Write + Send>,
        source: Receiver<u8>,
    ) -> Result<Console, InstallError> {
        let mailbox = Arc::new(Mailbox::new());
        let handle = cpu.bus.add_unit(Box::new(ConsoleAttn {
            mailbox: mailbox.clone(),
        }));
        cpu.bus.install_attn(UNIT_KEYBOARD, handle)?;
        cpu.bus.install_attn(UNIT_PRINTER, handle)?;

        Ok(Console {
            mailbox,
            zpage: cpu.zpage(),
            sink: Arc::new(Mutex::new(sink)),
            source,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    /// Spawns the per-run device threads.
    pub fn start(&mut self) {
        self.running.store(true, Ordering::Relaxed);

        let mailbox = self.mailbox.clone();
        let zpage = self.zpage.clone();
        let running = self.running.clone();
        let sink = self.sink.clone();
        self.workers
            .push(thread::spawn(move || output_loop(mailbox, zpage, running, sink)));

        let mailbox = self.mailbox.clone();
        let zpage = self.zpage.clone();
        let running = self.running.clone();
        let source = self.source.clone();
        self.workers
            .push(thread::spawn(move || input_loop(mailbox, zpage, running, source)));
    }

    /// Signals both poll loops, joins them, and forces the IO-pending bit
    /// false so an interrupted machine is never left stalled in IOWAIT.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.zpage.clear_flag(FLAG_IO);
    }
}

fn output_loop(
    mailbox: Arc<Mailbox>,
    zpage: Arc<ZeroPage>,
    running: Arc<AtomicBool>,
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
) {
    while running.load(Ordering::Relaxed) {
        match mailbox.claim(UNIT_PRINTER) {
            Some(FN_WRITE_CHAR) => {
                let byte = (zpage.get(zpage.acc_sel()) & 0xFF) as u8;
                let mut sink = sink.lock().unwrap();
                let _ = sink.write_all(&[byte]);
                let _ = sink.flush();
                zpage.clear_flag(FLAG_IO);
            }
            Some(cmd) => {
                // Unknown commands complete as no-ops; the clear still
                // happens so the CPU cannot wedge in IOWAIT.
                debug!("printer ignoring command {:o}", cmd);
                zpage.clear_flag(FLAG_IO);
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    }
}

fn input_loop(
    mailbox: Arc<Mailbox>,
    zpage: Arc<ZeroPage>,
    running: Arc<AtomicBool>,
    source: Receiver<u8>,
) {
    while running.load(Ordering::Relaxed) {
        match mailbox.claim(UNIT_KEYBOARD) {
            Some(FN_SKIP_IF_READY) => {
                if !source.is_empty() {
                    zpage.bump_pc();
                }
                zpage.clear_flag(FLAG_IO);
            }
            Some(FN_READ_CHAR) => {
                let byte = source.try_recv().unwrap_or(0);
                zpage.set(zpage.acc_sel(), byte as Word);
                zpage.clear_flag(FLAG_IO);
            }
            Some(cmd) => {
                debug!("keyboard ignoring command {:o}", cmd);
                zpage.clear_flag(FLAG_IO);
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    }
}

/// Bytes typed at the console. The pump thread lives for the whole process
/// because a blocked console read cannot be interrupted portably; the
/// per-run device threads consume from the channel it feeds.
pub fn stdin_source() -> Receiver<u8> {
    static SOURCE: OnceLock<Receiver<u8>> = OnceLock::new();
    SOURCE
        .get_or_init(|| {
            let (sender, receiver) = unbounded();
            thread::spawn(move || stdin_pump(sender));
            receiver
        })
        .clone()
}

fn stdin_pump(sender: Sender<u8>) {
    use std::io::Read;

    let mut byte = [0u8; 1];
    let mut stdin = std::io::stdin();
    loop {
        match stdin.read(&mut byte) {
            Ok(0) => break, // EOF
            Ok(_) => {
                if sender.send(byte[0]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Runs the machine with the console live: device threads up, the CPU loop
/// until halt or interrupt, then a full teardown. No device thread
/// outlives this call.
pub fn run_machine(cpu: &mut Cpu, console: &mut Console, interrupt: &AtomicBool) -> u64 {
    console.start();
    let executed = cpu.run(interrupt);
    console.stop();
    executed
}
