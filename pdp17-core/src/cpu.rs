use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, trace, warn};

use crate::bus::{Bus, BusError, InstallError};
use crate::constants::cycles;
use crate::constants::opcodes::*;
use crate::constants::psw::*;
use crate::constants::registers::*;
use crate::constants::{Addr, Word};
use crate::zpage::{ZeroPage, ZeroPageUnit};

/*
 * Basic instruction format
 * 15 14 13 | 12 11 10 | 9 | 8 | 7 .. 0
 *  opcode  |  AccSel  | I | Z | offset
 */

fn field_opcode(word: Word) -> Word {
    (word & 0xE000) >> 13
}

fn field_acc(word: Word) -> usize {
    ((word & 0x1C00) >> 10) as usize
}

fn field_indirect(word: Word) -> bool {
    word & 0x0200 != 0
}

fn field_zero(word: Word) -> bool {
    word & 0x0100 != 0
}

// IOT: 6-bit unit number in bits 8-3, 3-bit function in bits 2-0

fn field_iot_unit(word: Word) -> usize {
    ((word >> 3) & 0x3F) as usize
}

fn field_iot_function(word: Word) -> Word {
    word & 0x7
}

/// The PDP-17 processor: the bus it masters, its zero page, and the two
/// internal latches carried between cycles. All architectural state other
/// than `mar`/`mbr` lives in the zero page where the monitor can see it.
pub struct Cpu {
    pub bus: Bus,
    zpage: Arc<ZeroPage>,
    mar: Addr,
    mbr: Word,
    /// Front-panel switch register, read by the OSR micro-op.
    pub switches: Word,
}

impl Cpu {
    /// Builds a CPU on the given bus and claims page 0 for its register
    /// file.
    pub fn new(mut bus: Bus) -> Result<Cpu, InstallError> {
        let zpage = Arc::new(ZeroPage::new());
        let handle = bus.add_unit(Box::new(ZeroPageUnit::new(zpage.clone())));
        bus.install(0, handle)?;
        Ok(Cpu {
            bus,
            zpage,
            mar: 0,
            mbr: 0,
            switches: 0,
        })
    }

    /// Shared handle to the register file, for device threads and the
    /// monitor.
    pub fn zpage(&self) -> Arc<ZeroPage> {
        self.zpage.clone()
    }

    /// Effective address of an offset: forced into page 0 when the zero
    /// bit is set, otherwise relative to the page the PC is in. Pure for a
    /// given PC value.
    pub fn address(&self, zero_page: bool, offset: Addr) -> Addr {
        let offset = offset & self.bus.offset_mask();
        if zero_page {
            offset
        } else {
            offset | (self.zpage.pc() as Addr & !self.bus.offset_mask())
        }
    }

    /// Clears the CYCLE field so the next `step` fetches again. The
    /// monitor does this before resuming a halted machine.
    pub fn clear_halt(&self) {
        self.zpage.set_cycle(cycles::IFETCH);
    }

    /// Runs exactly one cycle-state handler, selected by the CYCLE field.
    /// A halted machine stays halted.
    pub fn step(&mut self) {
        match self.zpage.cycle() {
            cycles::IFETCH | cycles::IFETCH_ALT => self.cycle_ifetch(),
            cycles::INADDR => self.cycle_inaddr(),
            cycles::EXEC => self.cycle_exec(),
            cycles::IOWAIT => self.cycle_iowait(),
            cycles::WTBACK => self.cycle_wtback(),
            cycles::HALT => return,
            other => {
                error!("undefined cycle state {:X}, halting", other);
                self.zpage.set_cycle(cycles::HALT);
            }
        }
        trace!("psw={:04X} pc={:04X}", self.zpage.psw(), self.zpage.pc());
    }

    /// Spins `step` until the machine halts or the interrupt flag is
    /// raised. Returns the number of cycles executed; the halted state is
    /// never entered, so a machine already halted runs zero.
    pub fn run(&mut self, interrupt: &AtomicBool) -> u64 {
        let mut executed = 0;
        while self.zpage.cycle() != cycles::HALT && !interrupt.load(Ordering::Relaxed) {
            self.step();
            executed += 1;
        }
        executed
    }

    /// A bus fault mid-cycle is a machine check: log it and halt cleanly
    /// rather than run on with undefined data.
    fn machine_check(&mut self, err: BusError) {
        error!("machine check: {}", err);
        self.zpage.set_cycle(cycles::HALT);
    }

    // Register-file fast path for operand access; everything out of file
    // costs a bus transaction.

    fn local_read(&mut self, addr: Addr) -> Result<Word, BusError> {
        if addr <= REGISTER_PC as Addr {
            Ok(self.zpage.get(addr as usize))
        } else {
            self.bus.read(addr)
        }
    }

    fn local_write(&mut self, addr: Addr, value: Word) -> Result<(), BusError> {
        if addr <= REGISTER_PC as Addr {
            self.zpage.set(addr as usize, value);
            Ok(())
        } else {
            self.bus.write(addr, value)
        }
    }

    /// Resolves an indirection through a register slot; the auto-index
    /// registers post-increment when read this way.
    fn indirect_register(&mut self, addr: Addr) -> Addr {
        let index = addr as usize;
        let value = if (REGISTER_INDEX_FIRST..=REGISTER_INDEX_LAST).contains(&index) {
            self.zpage.post_increment(index)
        } else {
            self.zpage.get(index)
        };
        value as Addr
    }

    /// Cycle 0 (and 1): fetch, decode, and everything that can be finished
    /// inline.
    fn cycle_ifetch(&mut self) {
        self.zpage.clear_for_fetch();

        self.mar = self.zpage.bump_pc() as Addr;
        self.mbr = match self.bus.read(self.mar) {
            Ok(word) => word,
            Err(e) => return self.machine_check(e),
        };

        self.zpage.set_acc_sel(field_acc(self.mbr));

        match field_opcode(self.mbr) {
            OP_IOT => self.fetch_iot(),
            OP_OPR => self.fetch_opr(),
            op => self.fetch_basic(op),
        }

        // Pending-bit priority picks the next cycle; with nothing pending
        // the CYCLE field keeps whatever the inline dispatch left there
        // (the next fetch, or the halt state).
        if self.zpage.flag(FLAG_ID) {
            self.zpage.set_cycle(cycles::INADDR);
        } else if self.zpage.flag(FLAG_EX) {
            self.zpage.set_cycle(cycles::EXEC);
        } else if self.zpage.flag(FLAG_IO) {
            self.zpage.set_cycle(cycles::IOWAIT);
        }
    }

    /// Basic-instruction half of the fetch: compute the effective address,
    /// short-circuit what resolves inside the register file, queue up the
    /// rest.
    fn fetch_basic(&mut self, op: Word) {
        self.zpage.set_tmp(op);

        let indirect = field_indirect(self.mbr);
        self.mar = self.address(field_zero(self.mbr), self.mbr as Addr);

        if !indirect && self.mar <= REGISTER_PC as Addr {
            // The whole effect fits inside this fetch.
            if let Err(e) = self.exec_basic(op) {
                self.machine_check(e);
            }
            return;
        }

        self.zpage.set_flag(FLAG_EX);

        if indirect {
            if self.mar <= REGISTER_PC as Addr {
                self.mar = self.indirect_register(self.mar);
            } else {
                self.zpage.set_flag(FLAG_ID);
            }
        }
    }

    /// IOT half of the fetch: latch the function, raise IO, and hand the
    /// command to the unit. The device side owns the clear.
    fn fetch_iot(&mut self) {
        let unit = field_iot_unit(self.mbr);
        let function = field_iot_function(self.mbr);

        self.zpage.set_tmp(function);
        self.zpage.set_flag(FLAG_IO);

        if let Err(e) = self.bus.attn(unit, function) {
            // Nobody will ever service the command; do not stall on it.
            warn!("attn({}, {:o}) failed: {}", unit, function, e);
            self.zpage.clear_flag(FLAG_IO);
        }
    }

    /// Cycle 2: resolve the one pending indirection.
    fn cycle_inaddr(&mut self) {
        if self.mar <= REGISTER_PC as Addr {
            self.mar = self.indirect_register(self.mar);
        } else {
            match self.bus.read(self.mar) {
                Ok(word) => {
                    self.mbr = word;
                    self.mar = word as Addr;
                }
                Err(e) => return self.machine_check(e),
            }
        }
        self.zpage.set_cycle(cycles::EXEC);
    }

    /// Cycle 3: the basic-instruction effect against the resolved address.
    fn cycle_exec(&mut self) {
        let op = self.zpage.tmp();
        if let Err(e) = self.exec_basic(op) {
            return self.machine_check(e);
        }

        if self.zpage.flag(FLAG_ID) {
            self.zpage.set_cycle(cycles::WTBACK);
        } else {
            self.zpage.set_cycle(cycles::IFETCH);
        }
    }

    /// Cycle 4: hold until the device thread clears the IO bit.
    fn cycle_iowait(&mut self) {
        if self.zpage.flag(FLAG_IO) {
            std::hint::spin_loop();
        } else {
            self.zpage.set_cycle(cycles::IFETCH);
        }
    }

    /// Cycle 9: the store the EXEC cycle owed.
    fn cycle_wtback(&mut self) {
        self.zpage.set_cycle(cycles::IFETCH);
        if self.zpage.flag(FLAG_ID) {
            if let Err(e) = self.local_write(self.mar, self.mbr) {
                self.machine_check(e);
            }
        } else {
            self.zpage.set(self.zpage.acc_sel(), self.mbr);
        }
    }

    /// The basic-instruction effect, shared between the fetch short
    /// circuit and the EXEC cycle. ID left set means a store is still owed
    /// to the WTBACK cycle.
    fn exec_basic(&mut self, op: Word) -> Result<(), BusError> {
        let acc = self.zpage.acc_sel();
        match op {
            OP_AND => {
                self.mbr = self.zpage.get(acc) & self.local_read(self.mar)?;
                self.zpage.clear_flag(FLAG_ID);
                self.zpage.set(acc, self.mbr);
            }
            OP_TAD => {
                let sum = self.zpage.get(acc) as u32 + self.local_read(self.mar)? as u32;
                if sum > 0xFFFF {
                    // Carry complements the link rather than setting it
                    self.zpage.toggle_flag(FLAG_LK);
                }
                self.mbr = sum as Word;
                self.zpage.clear_flag(FLAG_ID);
                self.zpage.set(acc, self.mbr);
            }
            OP_ISZ if acc == ACC_NONE => {
                self.mbr = self.local_read(self.mar)?.wrapping_add(1);
                if self.mbr == 0 {
                    self.zpage.bump_pc();
                }
                if self.mar <= REGISTER_PC as Addr {
                    self.zpage.clear_flag(FLAG_ID);
                    self.zpage.set(self.mar as usize, self.mbr);
                } else {
                    // Store deferred to WTBACK
                    self.zpage.set_flag(FLAG_ID);
                }
            }
            OP_ISZ => {
                // STA: store the selected register, register unchanged
                self.mbr = self.zpage.get(acc);
                self.zpage.clear_flag(FLAG_ID);
                self.local_write(self.mar, self.mbr)?;
            }
            OP_DCA => {
                self.mbr = self.zpage.get(acc);
                self.local_write(self.mar, self.mbr)?;
                self.zpage.clear_flag(FLAG_ID);
                self.zpage.set(acc, 0);
            }
            OP_JMS => {
                self.mbr = self.zpage.pc();
                self.zpage.set_pc(self.mar as Word);
                self.zpage.clear_flag(FLAG_ID);
                if acc != ACC_NONE {
                    self.zpage.set(acc, self.mbr);
                }
            }
            OP_JMP if acc == ACC_NONE => {
                self.zpage.clear_flag(FLAG_ID);
                self.zpage.set_pc(self.mar as Word);
            }
            OP_JMP => {
                // JML: the word at the target rides along into the register
                self.mbr = self.local_read(self.mar)?;
                self.zpage.clear_flag(FLAG_ID);
                self.zpage.set(acc, self.mbr);
                self.zpage.set_pc(self.mar as Word);
            }
            _ => error!("basic executor dispatched opcode {:o}", op),
        }
        Ok(())
    }

    /// OPR dispatch: all three groups complete inline during the fetch.
    fn fetch_opr(&mut self) {
        self.zpage.set_flag(FLAG_OP);
        if self.mbr & 0x0200 != 0 {
            self.zpage.set_tmp(3);
            self.opr_alu();
        } else if self.mbr & 0x0100 != 0 {
            self.zpage.set_tmp(2);
            self.opr_skip();
        } else {
            self.zpage.set_tmp(1);
            self.opr_micro();
        }
    }

    /// Group 1: accumulator micro-ops in the fixed CLA CLL CMA CML IAC
    /// rotate order.
    fn opr_micro(&mut self) {
        let acc = self.zpage.acc_sel();
        let mut value = self.zpage.get(acc);

        if self.mbr & 0x0080 != 0 {
            value = 0; // CLA
        }
        if self.mbr & 0x0040 != 0 {
            self.zpage.clear_flag(FLAG_LK); // CLL
        }
        if self.mbr & 0x0020 != 0 {
            value = !value; // CMA
        }
        if self.mbr & 0x0010 != 0 {
            self.zpage.toggle_flag(FLAG_LK); // CML
        }
        if self.mbr & 0x0001 != 0 {
            // IAC, wraparound complementing the link
            let (sum, wrapped) = value.overflowing_add(1);
            value = sum;
            if wrapped {
                self.zpage.toggle_flag(FLAG_LK);
            }
        }

        value = match (self.mbr >> 1) & 0x7 {
            // BSW swaps the 6-bit halves of the low 12 bits
            0b001 => (value & 0xF000) | ((value & 0x3F) << 6) | ((value >> 6) & 0x3F),
            0b010 => self.rotate_link(value, true, 1),  // RAL
            0b011 => self.rotate_link(value, true, 2),  // RTL
            0b100 => self.rotate_link(value, false, 1), // RAR
            0b101 => self.rotate_link(value, false, 2), // RTR
            0b111 => value.rotate_left(8),              // HSW
            _ => value,
        };

        self.zpage.set(acc, value);
    }

    /// Rotates the 17-bit link:accumulator combination, leaving the new
    /// top bit in the link.
    fn rotate_link(&mut self, value: Word, left: bool, count: u32) -> Word {
        let mut combined = ((self.zpage.flag(FLAG_LK) as u32) << 16) | value as u32;
        for _ in 0..count {
            combined = if left {
                ((combined << 1) | (combined >> 16)) & 0x1FFFF
            } else {
                ((combined >> 1) | (combined << 16)) & 0x1FFFF
            };
        }
        if combined & 0x10000 != 0 {
            self.zpage.set_flag(FLAG_LK);
        } else {
            self.zpage.clear_flag(FLAG_LK);
        }
        combined as Word
    }

    /// Group 2: the skip chain, then CLA, OSR and HLT.
    fn opr_skip(&mut self) {
        let acc = self.zpage.acc_sel();
        let value = self.zpage.get(acc);

        let mut skip = false;
        if self.mbr & 0x0040 != 0 && value & 0x8000 != 0 {
            skip = true; // SMA
        }
        if self.mbr & 0x0020 != 0 && value == 0 {
            skip = true; // SZA
        }
        if self.mbr & 0x0010 != 0 && self.zpage.flag(FLAG_LK) {
            skip = true; // SNL
        }
        if self.mbr & 0x0008 != 0 {
            // AND-group sense: skip when no selected condition held
            skip = !skip;
        }
        if skip {
            self.zpage.bump_pc();
        }

        if self.mbr & (0x0080 | 0x0004) != 0 {
            let mut value = if self.mbr & 0x0080 != 0 { 0 } else { value }; // CLA
            if self.mbr & 0x0004 != 0 {
                value |= self.switches; // OSR
            }
            self.zpage.set(acc, value);
        }

        if self.mbr & 0x0002 != 0 {
            self.zpage.set_cycle(cycles::HALT); // HLT
        }
    }

    /// Group 3: register-register ALU and shifter. Bits 8-5 select the
    /// function, bits 3-0 a register (or, with bit 4, an immediate shift
    /// count).
    fn opr_alu(&mut self) {
        let acc = self.zpage.acc_sel();
        let function = (self.mbr >> 5) & 0xF;
        let immediate = self.mbr & 0x0010 != 0;
        let operand = (self.mbr & 0x000F) as usize;

        let value = self.zpage.get(acc);
        let count = if immediate {
            operand as u32
        } else {
            (self.zpage.get(operand) & 0xF) as u32
        };

        let result = match function {
            0x0 => self.zpage.get(operand), // MOV
            0x1 => {
                // SWP
                let other = self.zpage.get(operand);
                self.zpage.set(operand, value);
                other
            }
            0x2 => value | self.zpage.get(operand), // IOR
            0x3 => value ^ self.zpage.get(operand), // XOR
            0x4..=0x8 => self.shifter(function, value, count),
            _ => {
                warn!("reserved ALU function {:X}", function);
                value
            }
        };

        self.zpage.set(acc, result);
    }

    /// Shifts and rotates; the last bit shifted out lands in the link. A
    /// zero count moves nothing and spares the link.
    fn shifter(&mut self, function: Word, value: Word, count: u32) -> Word {
        if count == 0 {
            return value;
        }
        let (result, out) = match function {
            0x4 => (value << count, (value >> (16 - count)) & 1), // LSL
            0x5 => (value >> count, (value >> (count - 1)) & 1),  // LSR
            0x6 => {
                // ASR
                (((value as i16) >> count) as Word, (value >> (count - 1)) & 1)
            }
            0x7 => {
                // ROL: the last bit around lands at bit 0
                let rotated = value.rotate_left(count);
                (rotated, rotated & 1)
            }
            _ => {
                // ROR: the last bit around lands at bit 15
                let rotated = value.rotate_right(count);
                (rotated, rotated >> 15)
            }
        };
        if out != 0 {
            self.zpage.set_flag(FLAG_LK);
        } else {
            self.zpage.clear_flag(FLAG_LK);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MAX_PAGES, PAGE_SIZE};
    use crate::ram::Ram;
    use std::sync::Mutex;

    fn machine() -> Cpu {
        let mut bus = Bus::new(PAGE_SIZE).unwrap();
        let ram = bus.add_unit(Box::new(Ram::new()));
        for page in 1..MAX_PAGES {
            bus.install(page, ram).unwrap();
        }
        Cpu::new(bus).unwrap()
    }

    fn basic(op: Word, acc: usize, indirect: bool, zero: bool, offset: Word) -> Word {
        (op << 13)
            | ((acc as Word) << 10)
            | ((indirect as Word) << 9)
            | ((zero as Word) << 8)
            | (offset & 0xFF)
    }

    fn load(cpu: &mut Cpu, origin: Addr, words: &[Word]) {
        for (index, &word) in words.iter().enumerate() {
            cpu.bus.write(origin + index as Addr, word).unwrap();
        }
        cpu.zpage().set_pc(origin as Word);
    }

    const HLT: Word = 0xE102;
    const NOP: Word = 0xE000;

    #[test]
    fn address_is_pure_and_honors_the_zero_bit() {
        let cpu = machine();
        cpu.zpage().set_pc(0x1234);
        assert_eq!(cpu.address(true, 0x56), 0x0056);
        assert_eq!(cpu.address(false, 0x56), 0x1256);
        assert_eq!(cpu.address(false, 0x56), 0x1256);
        assert_eq!(cpu.address(false, 0xFFF), 0x12FF);
    }

    #[test]
    fn and_through_a_register_completes_in_one_fetch() {
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0xFFFF);
        zpage.set(1, 0xCCCC);
        load(&mut cpu, 0x0100, &[0b0000_0001_0000_0001]);

        cpu.step();
        assert_eq!(zpage.get(0), 0xCCCC);
        assert_eq!(zpage.get(1), 0xCCCC);
        assert_eq!(zpage.pc(), 0x0101);
        assert_eq!(zpage.cycle(), cycles::IFETCH);
    }

    #[test]
    fn tad_carry_complement_is_self_inverse() {
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x8000);
        zpage.set(1, 0x8000);
        load(
            &mut cpu,
            0x0100,
            &[basic(OP_TAD, 0, false, true, 1), basic(OP_TAD, 0, false, true, 1)],
        );

        cpu.step();
        assert!(zpage.flag(FLAG_LK), "first overflow complements the link");
        assert_eq!(zpage.get(0), 0x0000);

        zpage.set(0, 0x8000);
        cpu.step();
        assert!(!zpage.flag(FLAG_LK), "second overflow restores it");
    }

    #[test]
    fn isz_skips_exactly_one_word_on_wrap() {
        // Wrapping case
        let mut cpu = machine();
        cpu.bus.write(0x01F0, 0xFFFF).unwrap();
        load(&mut cpu, 0x0100, &[basic(OP_ISZ, ACC_NONE, false, false, 0xF0)]);
        for _ in 0..3 {
            cpu.step(); // IFETCH, EXEC, WTBACK
        }
        assert_eq!(cpu.bus.read(0x01F0), Ok(0));
        assert_eq!(cpu.zpage().pc(), 0x0102);

        // Non-wrapping case lands one word earlier
        let mut cpu = machine();
        cpu.bus.write(0x01F0, 0x1234).unwrap();
        load(&mut cpu, 0x0100, &[basic(OP_ISZ, ACC_NONE, false, false, 0xF0)]);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.bus.read(0x01F0), Ok(0x1235));
        assert_eq!(cpu.zpage().pc(), 0x0101);
    }

    #[test]
    fn short_circuit_matches_the_exec_path() {
        // The same TAD against a register slot, once through the fetch
        // short circuit and once driven through EXEC by hand.
        let mut fast = machine();
        fast.zpage().set(2, 0x7001);
        fast.zpage().set(3, 0x9005);
        load(&mut fast, 0x0100, &[basic(OP_TAD, 2, false, true, 3), NOP]);
        fast.step();
        fast.step();

        let mut slow = machine();
        let zpage = slow.zpage();
        zpage.set(2, 0x7001);
        zpage.set(3, 0x9005);
        slow.bus.write(0x0101, NOP).unwrap();
        zpage.set_pc(0x0101);
        zpage.set_acc_sel(2);
        zpage.set_tmp(OP_TAD);
        zpage.set_flag(FLAG_EX);
        zpage.set_cycle(cycles::EXEC);
        slow.mar = 3;
        slow.step();
        slow.step();

        for index in 0..PAGE_SIZE {
            assert_eq!(
                fast.zpage().get(index),
                slow.zpage().get(index),
                "register file slot {:o} diverged",
                index
            );
        }
    }

    #[test]
    fn sta_stores_the_selected_register_unchanged() {
        let mut cpu = machine();
        cpu.zpage().set(2, 0x1234);
        load(&mut cpu, 0x0100, &[basic(OP_ISZ, 2, false, false, 0xF0)]);
        cpu.step(); // IFETCH
        cpu.step(); // EXEC
        assert_eq!(cpu.bus.read(0x01F0), Ok(0x1234));
        assert_eq!(cpu.zpage().get(2), 0x1234);
    }

    #[test]
    fn dca_deposits_and_clears() {
        let mut cpu = machine();
        cpu.zpage().set(4, 0xBEEF);
        load(&mut cpu, 0x0100, &[basic(OP_DCA, 4, false, false, 0xF0)]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.bus.read(0x01F0), Ok(0xBEEF));
        assert_eq!(cpu.zpage().get(4), 0);
    }

    #[test]
    fn jms_links_into_the_selected_register() {
        let mut cpu = machine();
        load(&mut cpu, 0x0100, &[basic(OP_JMS, 6, false, false, 0x80)]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.zpage().get(6), 0x0101);
        assert_eq!(cpu.zpage().pc(), 0x0180);

        // With no register selected the return address is discarded
        let mut cpu = machine();
        load(&mut cpu, 0x0100, &[basic(OP_JMS, ACC_NONE, false, false, 0x80)]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.zpage().pc(), 0x0180);
    }

    #[test]
    fn jmp_is_plain_and_jml_loads_the_target_word() {
        let mut cpu = machine();
        cpu.zpage().set(1, 0xAAAA);
        load(&mut cpu, 0x0100, &[basic(OP_JMP, ACC_NONE, false, false, 0x80)]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.zpage().pc(), 0x0180);
        assert_eq!(cpu.zpage().get(1), 0xAAAA);

        let mut cpu = machine();
        cpu.bus.write(0x0180, 0x5A5A).unwrap();
        load(&mut cpu, 0x0100, &[basic(OP_JMP, 1, false, false, 0x80)]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.zpage().pc(), 0x0180);
        assert_eq!(cpu.zpage().get(1), 0x5A5A);
    }

    #[test]
    fn memory_indirection_costs_an_inaddr_cycle() {
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0xFFFF);
        cpu.bus.write(0x01FE, 0x0103).unwrap();
        cpu.bus.write(0x0103, 0xCCCC).unwrap();
        load(&mut cpu, 0x0100, &[basic(OP_AND, 0, true, false, 0xFE)]);

        cpu.step();
        assert_eq!(zpage.cycle(), cycles::INADDR);
        cpu.step();
        assert_eq!(zpage.cycle(), cycles::EXEC);
        cpu.step();
        assert_eq!(zpage.get(0), 0xCCCC);
    }

    #[test]
    fn auto_increment_applies_only_to_index_registers() {
        // Through I0: the old content is the address, the slot bumps
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0xFFFF);
        zpage.set(0o10, 0x0180);
        cpu.bus.write(0x0180, 0x0F0F).unwrap();
        load(&mut cpu, 0x0100, &[basic(OP_AND, 0, true, true, 0o10)]);
        cpu.step(); // resolves inline, EXEC pending
        cpu.step();
        assert_eq!(zpage.get(0), 0x0F0F);
        assert_eq!(zpage.get(0o10), 0x0181);

        // Through a plain accumulator slot: no bump
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0xFFFF);
        zpage.set(5, 0x0180);
        cpu.bus.write(0x0180, 0x0F0F).unwrap();
        load(&mut cpu, 0x0100, &[basic(OP_AND, 0, true, true, 5)]);
        cpu.step();
        cpu.step();
        assert_eq!(zpage.get(0), 0x0F0F);
        assert_eq!(zpage.get(5), 0x0180);
    }

    #[test]
    fn halt_ends_run_with_an_exact_cycle_count() {
        let mut cpu = machine();
        load(&mut cpu, 0x0100, &[NOP, HLT]);
        let interrupt = AtomicBool::new(false);
        assert_eq!(cpu.run(&interrupt), 2);
        assert_eq!(cpu.zpage().cycle(), cycles::HALT);

        // Stepping a halted machine is a no-op, and run refuses it
        let before = cpu.zpage().psw();
        cpu.step();
        assert_eq!(cpu.zpage().psw(), before);
        assert_eq!(cpu.run(&interrupt), 0);

        // Cleared, it resumes
        cpu.clear_halt();
        cpu.bus.write(0x0102, HLT).unwrap();
        assert_eq!(cpu.run(&interrupt), 1);
    }

    #[test]
    fn fetch_from_an_unbound_page_is_a_machine_check() {
        let bus = Bus::new(PAGE_SIZE).unwrap();
        let mut cpu = Cpu::new(bus).unwrap();
        cpu.zpage().set_pc(0x0100);
        cpu.step();
        assert_eq!(cpu.zpage().cycle(), cycles::HALT);
    }

    struct RecordingAttn {
        seen: Arc<Mutex<Vec<(usize, Word)>>>,
    }

    impl crate::bus::Unit for RecordingAttn {
        fn attn(&mut self, unit: usize, cmd: Word) -> Result<(), BusError> {
            self.seen.lock().unwrap().push((unit, cmd));
            Ok(())
        }
    }

    #[test]
    fn iot_parks_the_machine_until_the_device_clears_io() {
        let mut cpu = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let unit = cpu.bus.add_unit(Box::new(RecordingAttn { seen: seen.clone() }));
        cpu.bus.install_attn(0o4, unit).unwrap();

        // IOT unit 4, function 4
        load(&mut cpu, 0x0100, &[0xC024, HLT]);
        cpu.step();
        assert_eq!(*seen.lock().unwrap(), vec![(0o4, 0o4)]);
        assert_eq!(cpu.zpage().cycle(), cycles::IOWAIT);

        // Still waiting however often we step
        cpu.step();
        cpu.step();
        assert_eq!(cpu.zpage().cycle(), cycles::IOWAIT);

        // The device-side clear releases it
        cpu.zpage().clear_flag(FLAG_IO);
        cpu.step();
        assert_eq!(cpu.zpage().cycle(), cycles::IFETCH);
    }

    #[test]
    fn iot_to_an_unserviced_unit_does_not_stall() {
        let mut cpu = machine();
        load(&mut cpu, 0x0100, &[0xC024, HLT]);
        cpu.step();
        assert!(!cpu.zpage().flag(FLAG_IO));
        cpu.step();
        assert_eq!(cpu.zpage().cycle(), cycles::HALT);
    }

    #[test]
    fn opr_rotate_and_swap_block_matches_the_hardware_trace() {
        let mut cpu = machine();
        let zpage = cpu.zpage();
        for (index, value) in [0xCCCC, 0xCCCC, 0xCCCC, 0xCCCC, 0xCCCC, 0xE601, 0xCCCC]
            .into_iter()
            .enumerate()
        {
            zpage.set(index, value);
        }
        load(
            &mut cpu,
            0x0110,
            &[
                0xE0A0, // CLA CMA A0
                0xE4F1, // CLA CLL CMA CML IAC A1
                0xE804, // RAL A2
                0xEC08, // RAR A3
                0xF006, // RTL A4
                0xF80A, // RTR A6
                0xE01A, // CML RTR A0
                0xE81E, // CML HSW A2
                0xEC02, // BSW A3
                NOP,
                HLT,
            ],
        );

        let interrupt = AtomicBool::new(false);
        cpu.run(&interrupt);

        let registers: Vec<Word> = (0..7).map(|index| zpage.get(index)).collect();
        assert_eq!(
            registers,
            vec![0xFFFF, 0x0000, 0x9899, 0xE999, 0x3331, 0xE601, 0x7333]
        );
        assert!(!zpage.flag(FLAG_LK));
        assert_eq!(zpage.pc(), 0x011B);
    }

    #[test]
    fn skip_chain_covers_both_groups() {
        // SZA on a zero register skips one word
        let mut cpu = machine();
        load(&mut cpu, 0x0100, &[0xE120, HLT, HLT]);
        let interrupt = AtomicBool::new(false);
        cpu.run(&interrupt);
        assert_eq!(cpu.zpage().pc(), 0x0103);

        // SZA on a nonzero register falls through
        let mut cpu = machine();
        cpu.zpage().set(0, 1);
        load(&mut cpu, 0x0100, &[0xE120, HLT, HLT]);
        cpu.run(&interrupt);
        assert_eq!(cpu.zpage().pc(), 0x0102);

        // AND-group with no conditions is an unconditional skip
        let mut cpu = machine();
        cpu.zpage().set(0, 1);
        load(&mut cpu, 0x0100, &[0xE108, HLT, HLT]);
        cpu.run(&interrupt);
        assert_eq!(cpu.zpage().pc(), 0x0103);

        // SNL follows the link
        let mut cpu = machine();
        cpu.zpage().set(0, 1);
        cpu.zpage().set_flag(FLAG_LK);
        load(&mut cpu, 0x0100, &[0xE110, HLT, HLT]);
        cpu.run(&interrupt);
        assert_eq!(cpu.zpage().pc(), 0x0103);
    }

    #[test]
    fn osr_merges_the_switch_register() {
        let mut cpu = machine();
        cpu.switches = 0x1234;
        cpu.zpage().set(0, 0xF000);
        // CLA OSR, then OSR alone
        load(&mut cpu, 0x0100, &[0xE184, HLT]);
        let interrupt = AtomicBool::new(false);
        cpu.run(&interrupt);
        assert_eq!(cpu.zpage().get(0), 0x1234);

        let mut cpu = machine();
        cpu.switches = 0x1234;
        cpu.zpage().set(0, 0x4000);
        load(&mut cpu, 0x0100, &[0xE104, HLT]);
        cpu.run(&interrupt);
        assert_eq!(cpu.zpage().get(0), 0x5234);
    }

    #[test]
    fn alu_register_ops_move_swap_or_xor() {
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x00FF);
        zpage.set(1, 0x0F0F);

        // MOV A0 <- A1
        load(&mut cpu, 0x0100, &[0xE201]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x0F0F);

        // SWP A0 <-> A1
        zpage.set(0, 0xAAAA);
        zpage.set(1, 0x5555);
        load(&mut cpu, 0x0100, &[0xE221]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x5555);
        assert_eq!(zpage.get(1), 0xAAAA);

        // IOR and XOR
        zpage.set(0, 0x00FF);
        zpage.set(1, 0x0F0F);
        load(&mut cpu, 0x0100, &[0xE241]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x0FFF);

        zpage.set(0, 0x00FF);
        load(&mut cpu, 0x0100, &[0xE261]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x0FF0);
    }

    #[test]
    fn alu_shifts_update_the_link_with_the_last_bit_out() {
        // LSL by an immediate count of 4: bit 12 is the last one out
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x1001);
        load(&mut cpu, 0x0100, &[0xE294]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x0010);
        assert!(zpage.flag(FLAG_LK));

        // LSR by a register-held count
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x0005);
        zpage.set(1, 0x0003);
        load(&mut cpu, 0x0100, &[0xE2A1]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x0000);
        assert!(zpage.flag(FLAG_LK));

        // ASR propagates the sign
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x8002);
        load(&mut cpu, 0x0100, &[0xE2D1]);
        cpu.step();
        assert_eq!(zpage.get(0), 0xC001);
        assert!(!zpage.flag(FLAG_LK));

        // ROL and ROR carry the wrapped bit into the link
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x8000);
        load(&mut cpu, 0x0100, &[0xE2F1]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x0001);
        assert!(zpage.flag(FLAG_LK));

        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x0001);
        load(&mut cpu, 0x0100, &[0xE311]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x8000);
        assert!(zpage.flag(FLAG_LK));

        // A zero count spares the link
        let mut cpu = machine();
        let zpage = cpu.zpage();
        zpage.set(0, 0x8000);
        zpage.set_flag(FLAG_LK);
        load(&mut cpu, 0x0100, &[0xE290]);
        cpu.step();
        assert_eq!(zpage.get(0), 0x8000);
        assert!(zpage.flag(FLAG_LK));
    }

    #[test]
    fn interrupt_flag_stops_run_promptly() {
        let mut cpu = machine();
        // Tight self-loop
        load(&mut cpu, 0x0100, &[basic(OP_JMP, ACC_NONE, false, false, 0x00)]);
        let interrupt = Arc::new(AtomicBool::new(false));
        let setter = interrupt.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            setter.store(true, Ordering::Relaxed);
        });
        let executed = cpu.run(&interrupt);
        handle.join().unwrap();
        assert!(executed > 0);
        assert_ne!(cpu.zpage().cycle(), cycles::HALT);
    }
}
