use thiserror::Error;

use crate::constants::{Addr, Word, MAX_PAGES, MAX_UNITS};

/// Capability interface for anything installed on the bus. A unit overrides
/// the calls it serves; the defaults report the access as unsupported.
pub trait Unit: Send {
    fn read(&mut self, _addr: Addr) -> Result<Word, BusError> {
        Err(BusError::Unsupported)
    }

    fn write(&mut self, _addr: Addr, _value: Word) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn attn(&mut self, _unit: usize, _cmd: Word) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page size {0} is not a power of two")]
    BadPageSize(usize),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    #[error("page number {0} exceeds the page table")]
    InvalidPage(usize),
    #[error("unit number {0} exceeds the attention table")]
    InvalidUnit(usize),
    #[error("unit handle {0} was never registered")]
    UnknownUnit(usize),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("address {0:#010X} is outside the page table")]
    InvalidAddress(Addr),
    #[error("no unit claims the page at address {0:#06X}")]
    Unbound(Addr),
    #[error("no attention handler for unit {0}")]
    UnboundUnit(usize),
    #[error("unit does not support this access")]
    Unsupported,
}

/// Handle returned by [`Bus::add_unit`], used to bind the unit to page and
/// attention slots. One unit may claim any number of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHandle(usize);

/// Dispatcher routing word addressed reads and writes to units by page
/// number, and out-of-band attention commands to units by unit number.
pub struct Bus {
    offset_width: u32,
    offset_mask: Addr,
    units: Vec<Box<dyn Unit>>,
    pages: [Option<usize>; MAX_PAGES],
    attns: [Option<usize>; MAX_UNITS],
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("offset_width", &self.offset_width)
            .field("offset_mask", &self.offset_mask)
            .field("units", &self.units.len())
            .field("pages", &self.pages)
            .field("attns", &self.attns)
            .finish()
    }
}

impl Bus {
    /// Builds an empty bus. The page size fixes the offset width used for
    /// address splitting and must be a power of two.
    pub fn new(page_size: usize) -> Result<Bus, ConfigError> {
        if !page_size.is_power_of_two() {
            return Err(ConfigError::BadPageSize(page_size));
        }
        let offset_width = page_size.trailing_zeros();
        Ok(Bus {
            offset_width,
            offset_mask: (1 << offset_width) - 1,
            units: Vec::new(),
            pages: [None; MAX_PAGES],
            attns: [None; MAX_UNITS],
        })
    }

    pub fn offset_mask(&self) -> Addr {
        self.offset_mask
    }

    /// Registers a unit with the bus. The returned handle is what gets
    /// bound to slots; registration alone claims nothing.
    pub fn add_unit(&mut self, unit: Box<dyn Unit>) -> UnitHandle {
        self.units.push(unit);
        UnitHandle(self.units.len() - 1)
    }

    /// Binds a page to a registered unit. Rebinding overwrites the previous
    /// owner.
    pub fn install(&mut self, page: usize, handle: UnitHandle) -> Result<(), InstallError> {
        if page >= MAX_PAGES {
            return Err(InstallError::InvalidPage(page));
        }
        if handle.0 >= self.units.len() {
            return Err(InstallError::UnknownUnit(handle.0));
        }
        self.pages[page] = Some(handle.0);
        Ok(())
    }

    /// Binds an attention slot to a registered unit.
    pub fn install_attn(&mut self, unit_no: usize, handle: UnitHandle) -> Result<(), InstallError> {
        if unit_no >= MAX_UNITS {
            return Err(InstallError::InvalidUnit(unit_no));
        }
        if handle.0 >= self.units.len() {
            return Err(InstallError::UnknownUnit(handle.0));
        }
        self.attns[unit_no] = Some(handle.0);
        Ok(())
    }

    /// Splits an address into page and offset. The page may still fall
    /// outside the table; `read`/`write` reject that as an invalid address.
    pub fn split(&self, addr: Addr) -> (usize, usize) {
        (
            (addr >> self.offset_width) as usize,
            (addr & self.offset_mask) as usize,
        )
    }

    pub fn read(&mut self, addr: Addr) -> Result<Word, BusError> {
        let (page, _) = self.split(addr);
        match self.pages.get(page).copied() {
            Some(Some(index)) => self.units[index].read(addr),
            Some(None) => Err(BusError::Unbound(addr)),
            None => Err(BusError::InvalidAddress(addr)),
        }
    }

    pub fn write(&mut self, addr: Addr, value: Word) -> Result<(), BusError> {
        let (page, _) = self.split(addr);
        match self.pages.get(page).copied() {
            Some(Some(index)) => self.units[index].write(addr, value),
            Some(None) => Err(BusError::Unbound(addr)),
            None => Err(BusError::InvalidAddress(addr)),
        }
    }

    /// Delivers an out-of-band command, dispatched by unit number rather
    /// than by address. Whether the call blocks is up to the unit; the
    /// console posts to its mailbox and returns immediately.
    pub fn attn(&mut self, unit_no: usize, cmd: Word) -> Result<(), BusError> {
        match self.attns.get(unit_no).copied() {
            Some(Some(index)) => self.units[index].attn(unit_no, cmd),
            _ => Err(BusError::UnboundUnit(unit_no)),
        }
    }
}
