use crate::bus::{BusError, Unit};
use crate::constants::{Addr, Word};

/// Words in the flat demonstration memory.
pub const MEM_SIZE: usize = 65536;

/// Flat word-addressed store, indexed by the full bus address. Page 0 is
/// the CPU's, so the first page of this array is shadowed and unused.
pub struct Ram {
    words: Vec<Word>,
}

impl Ram {
    pub fn new() -> Ram {
        Ram {
            words: vec![0; MEM_SIZE],
        }
    }
}

impl Default for Ram {
    fn default() -> Self {
        Self::new()
    }
}

impl Unit for Ram {
    fn read(&mut self, addr: Addr) -> Result<Word, BusError> {
        self.words
            .get(addr as usize)
            .copied()
            .ok_or(BusError::InvalidAddress(addr))
    }

    fn write(&mut self, addr: Addr, value: Word) -> Result<(), BusError> {
        match self.words.get_mut(addr as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(BusError::InvalidAddress(addr)),
        }
    }
}
