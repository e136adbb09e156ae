//! Game Boy Memory Bank Controllers (MBCs).
//!
//! This module contains implementations of the cartridge mappers in scope
//! for this core: a pass-through ROM-only variant and MBC1/MBC3/MBC5.

mod mbc1;
mod mbc3;
mod mbc5;
mod rom_only;

pub use mbc1::Mbc1;
pub use mbc3::Mbc3;
pub use mbc5::Mbc5;
pub use rom_only::RomOnly;

/// Address-decoder tagged variant over the mapper families, replacing the
/// class-inheritance/singleton pattern the mapper hardware is usually
/// modeled with.
#[derive(Debug)]
pub enum Mapper {
    RomOnly(RomOnly),
    Mbc1(Mbc1),
    Mbc3(Mbc3),
    Mbc5(Mbc5),
}

impl Mapper {
    /// Instantiate the mapper family named by a cartridge header's mapper
    /// byte. `cart_type` is expected to already be one of the values
    /// `Cartridge::parse` accepted (anything else falls back to ROM-only).
    pub fn from_cart_type(cart_type: u8, rom: Vec<u8>, ram: Vec<u8>) -> Self {
        match cart_type {
            0x01..=0x03 => Mapper::Mbc1(Mbc1::new(rom, ram)),
            0x0F..=0x13 => Mapper::Mbc3(Mbc3::new(rom, ram)),
            0x19..=0x1E => Mapper::Mbc5(Mbc5::new(rom, ram)),
            _ => Mapper::RomOnly(RomOnly::new(rom, ram)),
        }
    }

    pub fn read_rom(&self, addr: u16) -> u8 {
        match self {
            Mapper::RomOnly(m) => m.read_rom(addr),
            Mapper::Mbc1(m) => m.read_rom(addr),
            Mapper::Mbc3(m) => m.read_rom(addr),
            Mapper::Mbc5(m) => m.read_rom(addr),
        }
    }

    pub fn write_rom(&mut self, addr: u16, val: u8) {
        match self {
            Mapper::RomOnly(m) => m.write_rom(addr, val),
            Mapper::Mbc1(m) => m.write_rom(addr, val),
            Mapper::Mbc3(m) => m.write_rom(addr, val),
            Mapper::Mbc5(m) => m.write_rom(addr, val),
        }
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        match self {
            Mapper::RomOnly(m) => m.read_ram(addr),
            Mapper::Mbc1(m) => m.read_ram(addr),
            Mapper::Mbc3(m) => m.read_ram(addr),
            Mapper::Mbc5(m) => m.read_ram(addr),
        }
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        match self {
            Mapper::RomOnly(m) => m.write_ram(addr, val),
            Mapper::Mbc1(m) => m.write_ram(addr, val),
            Mapper::Mbc3(m) => m.write_ram(addr, val),
            Mapper::Mbc5(m) => m.write_ram(addr, val),
        }
    }

    /// Drains the one-shot "RAM was just disabled" latch used to trigger a
    /// battery-save flush. `RomOnly` cart RAM is never gated, so it never
    /// fires.
    pub fn take_ram_disabled_event(&mut self) -> bool {
        match self {
            Mapper::RomOnly(_) => false,
            Mapper::Mbc1(m) => m.take_ram_disabled_event(),
            Mapper::Mbc3(m) => m.take_ram_disabled_event(),
            Mapper::Mbc5(m) => m.take_ram_disabled_event(),
        }
    }

    /// Current contents of battery-backed cart RAM, for save-file flushing.
    pub fn ram(&self) -> &[u8] {
        match self {
            Mapper::RomOnly(m) => m.ram(),
            Mapper::Mbc1(m) => m.ram(),
            Mapper::Mbc3(m) => m.ram(),
            Mapper::Mbc5(m) => m.ram(),
        }
    }

    /// Seeds cart RAM from a `.sav` file read back at mount time.
    pub fn load_ram(&mut self, saved: &[u8]) {
        match self {
            Mapper::RomOnly(m) => m.load_ram(saved),
            Mapper::Mbc1(m) => m.load_ram(saved),
            Mapper::Mbc3(m) => m.load_ram(saved),
            Mapper::Mbc5(m) => m.load_ram(saved),
        }
    }

    #[cfg(test)]
    pub fn name(&self) -> &str {
        match self {
            Mapper::RomOnly(_) => "ROM-only",
            Mapper::Mbc1(_) => "MBC1",
            Mapper::Mbc3(_) => "MBC3",
            Mapper::Mbc5(_) => "MBC5",
        }
    }
}
