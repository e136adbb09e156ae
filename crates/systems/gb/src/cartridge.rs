//! Cartridge header parsing.

/// Console variant a cartridge declares support for via the CGB flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleVariant {
    Dmg,
    Cgb,
}

#[derive(thiserror::Error, Debug)]
pub enum CartridgeError {
    #[error("ROM is too small to contain a header (need at least 0x150 bytes, got {0})")]
    TooSmall(usize),
    #[error("unsupported mapper code 0x{0:02X}")]
    UnsupportedMapper(u8),
    #[error("unsupported RAM size code 0x{0:02X}")]
    UnsupportedRamSize(u8),
}

/// A loaded ROM image plus its parsed header fields.
///
/// Constructed once by the external loader before emulation starts; the
/// bytes are immutable for the cartridge's lifetime (cart RAM is owned by
/// the mapper, not here).
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub title: String,
    pub console_variant: ConsoleVariant,
    pub mapper_code: u8,
    pub rom_size: usize,
    pub ram_size: usize,
    pub ram_present: bool,
    pub battery_buffered: bool,
    pub timer_present: bool,
    pub version: u8,
    pub header_checksum_valid: bool,
}

const HEADER_START: usize = 0x0100;

impl Cartridge {
    pub fn parse(rom: &[u8]) -> Result<Self, CartridgeError> {
        if rom.len() < HEADER_START + 0x50 {
            return Err(CartridgeError::TooSmall(rom.len()));
        }

        let title_bytes = &rom[0x0134..0x0144];
        let title_end = title_bytes.iter().position(|&b| b == 0).unwrap_or(16);
        let title = String::from_utf8_lossy(&title_bytes[..title_end])
            .trim_end()
            .to_string();

        let console_variant = if rom[0x0143] & 0x80 != 0 {
            ConsoleVariant::Cgb
        } else {
            ConsoleVariant::Dmg
        };

        let mapper_code = rom[0x0147];
        let (ram_present, battery_buffered, timer_present) = cart_type_flags(mapper_code)
            .ok_or(CartridgeError::UnsupportedMapper(mapper_code))?;

        let rom_size_code = rom[0x0148];
        let rom_size = 32 * 1024 * (1usize << rom_size_code.min(8));

        let ram_size_code = rom[0x0149];
        let ram_size = match ram_size_code {
            0x00 => 0,
            0x02 => 8 * 1024,
            0x03 => 32 * 1024,
            0x04 => 128 * 1024,
            0x05 => 64 * 1024,
            other => return Err(CartridgeError::UnsupportedRamSize(other)),
        };

        let version = rom[0x014C];

        let mut checksum: u8 = 0;
        for &b in &rom[0x0134..=0x014C] {
            checksum = checksum.wrapping_sub(b).wrapping_sub(1);
        }
        let header_checksum_valid = checksum == rom[0x014D];

        Ok(Self {
            title,
            console_variant,
            mapper_code,
            rom_size,
            ram_size,
            ram_present,
            battery_buffered,
            timer_present,
            version,
            header_checksum_valid,
        })
    }
}

/// `(ram_present, battery_buffered, timer_present)` derived from the
/// cartridge-type byte. Mapper families outside §4.2's scope (HuC, MBC2,
/// MBC6/7, camera, TAMA5, pocket cameras) are rejected rather than guessed.
fn cart_type_flags(cart_type: u8) -> Option<(bool, bool, bool)> {
    match cart_type {
        0x00 => Some((false, false, false)),       // ROM ONLY
        0x01 => Some((false, false, false)),       // MBC1
        0x02 => Some((true, false, false)),        // MBC1+RAM
        0x03 => Some((true, true, false)),         // MBC1+RAM+BATTERY
        0x0F => Some((false, true, true)),         // MBC3+TIMER+BATTERY
        0x10 => Some((true, true, true)),          // MBC3+TIMER+RAM+BATTERY
        0x11 => Some((false, false, false)),       // MBC3
        0x12 => Some((true, false, false)),        // MBC3+RAM
        0x13 => Some((true, true, false)),         // MBC3+RAM+BATTERY
        0x19 => Some((false, false, false)),       // MBC5
        0x1A => Some((true, false, false)),        // MBC5+RAM
        0x1B => Some((true, true, false)),         // MBC5+RAM+BATTERY
        0x1C => Some((false, false, false)),       // MBC5+RUMBLE
        0x1D => Some((true, false, false)),        // MBC5+RUMBLE+RAM
        0x1E => Some((true, true, false)),         // MBC5+RUMBLE+RAM+BATTERY
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rom(mapper: u8, rom_code: u8, ram_code: u8, cgb: bool, title: &str) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        for (i, b) in title.bytes().enumerate() {
            rom[0x0134 + i] = b;
        }
        rom[0x0143] = if cgb { 0x80 } else { 0x00 };
        rom[0x0147] = mapper;
        rom[0x0148] = rom_code;
        rom[0x0149] = ram_code;
        let mut checksum: u8 = 0;
        for &b in &rom[0x0134..=0x014C] {
            checksum = checksum.wrapping_sub(b).wrapping_sub(1);
        }
        rom[0x014D] = checksum;
        rom
    }

    #[test]
    fn parses_title_and_variant() {
        let rom = make_rom(0x00, 0, 0, false, "TESTGAME");
        let cart = Cartridge::parse(&rom).unwrap();
        assert_eq!(cart.title, "TESTGAME");
        assert_eq!(cart.console_variant, ConsoleVariant::Dmg);
        assert!(cart.header_checksum_valid);
    }

    #[test]
    fn parses_cgb_flag() {
        let rom = make_rom(0x00, 0, 0, true, "CGBGAME");
        let cart = Cartridge::parse(&rom).unwrap();
        assert_eq!(cart.console_variant, ConsoleVariant::Cgb);
    }

    #[test]
    fn mbc3_timer_battery_flags() {
        let rom = make_rom(0x10, 0, 0x03, false, "RTC");
        let cart = Cartridge::parse(&rom).unwrap();
        assert!(cart.ram_present);
        assert!(cart.battery_buffered);
        assert!(cart.timer_present);
        assert_eq!(cart.ram_size, 32 * 1024);
    }

    #[test]
    fn rejects_unsupported_mapper() {
        let rom = make_rom(0xFF, 0, 0, false, "HUC1");
        assert!(matches!(
            Cartridge::parse(&rom),
            Err(CartridgeError::UnsupportedMapper(0xFF))
        ));
    }

    #[test]
    fn rejects_too_small_rom() {
        let rom = vec![0u8; 0x10];
        assert!(matches!(
            Cartridge::parse(&rom),
            Err(CartridgeError::TooSmall(_))
        ));
    }

    #[test]
    fn rejects_unsanctioned_ram_size_code() {
        // 0x01 is not one of the header's enumerated RAM size codes.
        let rom = make_rom(0x00, 0, 0x01, false, "BADRAM");
        assert!(matches!(
            Cartridge::parse(&rom),
            Err(CartridgeError::UnsupportedRamSize(0x01))
        ));
    }
}
