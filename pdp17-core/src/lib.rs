//! Core of the PDP-17 emulator: the page-dispatched bus, the CPU's zero
//! page with its packed status word, and the multi-cycle instruction
//! engine. Device-side code lives in `pdp17-peripherals`.

pub mod bus;
pub mod constants;
pub mod cpu;
pub mod ram;
pub mod zpage;
