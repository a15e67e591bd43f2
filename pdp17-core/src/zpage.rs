use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use crate::bus::{BusError, Unit};
use crate::constants::psw::*;
use crate::constants::registers::{REGISTER_FLAG, REGISTER_PC};
use crate::constants::{Addr, Word, PAGE_SIZE};

/// The CPU's own page: accumulators, index registers, PSW and PC, shared
/// with device threads. Every slot is an atomic word and all accesses are
/// relaxed, which keeps the polled-hardware behavior of the status bits: a
/// concurrent reader of the PSW may observe a device-side clear either
/// before or after it lands. Data handed to a device rides on the mailbox
/// lock, not on these atomics.
pub struct ZeroPage {
    words: [AtomicU16; PAGE_SIZE],
}

impl ZeroPage {
    pub fn new() -> ZeroPage {
        ZeroPage {
            words: std::array::from_fn(|_| AtomicU16::new(0)),
        }
    }

    pub fn get(&self, index: usize) -> Word {
        self.words[index].load(Ordering::Relaxed)
    }

    pub fn set(&self, index: usize, value: Word) {
        self.words[index].store(value, Ordering::Relaxed)
    }

    /// Post-incrementing read of a slot, as the hardware does for the PC
    /// during fetch and for the auto-index registers.
    pub fn post_increment(&self, index: usize) -> Word {
        self.words[index].fetch_add(1, Ordering::Relaxed)
    }

    pub fn pc(&self) -> Word {
        self.get(REGISTER_PC)
    }

    pub fn set_pc(&self, value: Word) {
        self.set(REGISTER_PC, value)
    }

    pub fn bump_pc(&self) -> Word {
        self.post_increment(REGISTER_PC)
    }

    pub fn psw(&self) -> Word {
        self.get(REGISTER_FLAG)
    }

    pub fn flag(&self, mask: Word) -> bool {
        self.psw() & mask != 0
    }

    pub fn set_flag(&self, mask: Word) {
        self.words[REGISTER_FLAG].fetch_or(mask, Ordering::Relaxed);
    }

    pub fn clear_flag(&self, mask: Word) {
        self.words[REGISTER_FLAG].fetch_and(!mask, Ordering::Relaxed);
    }

    pub fn toggle_flag(&self, mask: Word) {
        self.words[REGISTER_FLAG].fetch_xor(mask, Ordering::Relaxed);
    }

    /// Clears everything but the link bit, the first act of every fetch.
    pub fn clear_for_fetch(&self) {
        self.words[REGISTER_FLAG].fetch_and(FLAG_LK, Ordering::Relaxed);
    }

    fn field(&self, mask: Word, shift: u32) -> Word {
        (self.psw() & mask) >> shift
    }

    // Field updates are two atomic steps. Every field except the IO bit has
    // a single writer, so the transient clear is never observed.
    fn set_field(&self, mask: Word, shift: u32, value: Word) {
        let flags = &self.words[REGISTER_FLAG];
        flags.fetch_and(!mask, Ordering::Relaxed);
        flags.fetch_or((value << shift) & mask, Ordering::Relaxed);
    }

    /// Register selected by the current instruction's AccSel field.
    pub fn acc_sel(&self) -> usize {
        self.field(ACC_MASK, ACC_SHIFT) as usize
    }

    pub fn set_acc_sel(&self, value: usize) {
        self.set_field(ACC_MASK, ACC_SHIFT, value as Word)
    }

    /// Opcode or sub-function latched across cycles.
    pub fn tmp(&self) -> Word {
        self.field(TMP_MASK, TMP_SHIFT)
    }

    pub fn set_tmp(&self, value: Word) {
        self.set_field(TMP_MASK, TMP_SHIFT, value)
    }

    /// Cycle-state number; the sole selector of the next `step` handler.
    pub fn cycle(&self) -> Word {
        self.field(CYCLE_MASK, CYCLE_SHIFT)
    }

    pub fn set_cycle(&self, value: Word) {
        self.set_field(CYCLE_MASK, CYCLE_SHIFT, value)
    }
}

impl Default for ZeroPage {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus-side face of the zero page, claiming page 0.
pub struct ZeroPageUnit {
    zpage: Arc<ZeroPage>,
}

impl ZeroPageUnit {
    pub fn new(zpage: Arc<ZeroPage>) -> ZeroPageUnit {
        ZeroPageUnit { zpage }
    }
}

impl Unit for ZeroPageUnit {
    fn read(&mut self, addr: Addr) -> Result<Word, BusError> {
        Ok(self.zpage.get(addr as usize & (PAGE_SIZE - 1)))
    }

    fn write(&mut self, addr: Addr, value: Word) -> Result<(), BusError> {
        self.zpage.set(addr as usize & (PAGE_SIZE - 1), value);
        Ok(())
    }
}
