//! Fused MEM+MMU: the full 16-bit address decoder and I/O register file.
//!
//! The distilled design keeps MEM (register file + side effects) and MMU
//! (address decode) as separate components sharing a context by reference.
//! Rust ownership makes that split expensive without `Rc<RefCell<_>>`, which
//! the rest of this codebase avoids, so both live here in one struct that
//! owns the mapper, PPU, APU and timer outright and implements
//! [`MemoryLr35902`] directly.

use emu_core::cpu_lr35902::{
    MemoryLr35902, IF_ADDR, INT_JOYPAD, INT_LCD_STAT, INT_TIMER, INT_VBLANK,
};
use emu_core::log;
use emu_core::logging::{LogCategory, LogLevel};
use emu_core::types::Frame;

use crate::apu::GbApu;
use crate::mappers::Mapper;
use crate::ppu::Ppu;
use crate::timer::Timer;

/// Button/dpad bit layout shared by `press`/`release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    A,
    B,
    Select,
    Start,
    Up,
    Down,
    Left,
    Right,
}

impl Button {
    fn is_dpad(self) -> bool {
        matches!(self, Button::Up | Button::Down | Button::Left | Button::Right)
    }

    /// Bit position within its half's nibble (buttons: A/B/Select/Start,
    /// dpad: Right/Left/Up/Down — the hardware's actual pin ordering).
    fn bit(self) -> u8 {
        match self {
            Button::A => 0,
            Button::B => 1,
            Button::Select => 2,
            Button::Start => 3,
            Button::Right => 0,
            Button::Left => 1,
            Button::Up => 2,
            Button::Down => 3,
        }
    }
}

#[derive(Debug, Default)]
struct OamDma {
    active: bool,
    src_base: u16,
    counter: u16,
}

#[derive(Debug, Default)]
struct VramDma {
    src: u16,
    dst: u16,
    hblank_active: bool,
    blocks_remaining: u16,
}

const VRAM_DMA_MC_PER_BLOCK: u32 = 8;

/// Holes in the `0xFF00-0xFF7F` page with no register behind them at all;
/// reads return `0xFF` rather than falling through to plain storage.
fn unmapped_io(addr: u16) -> bool {
    matches!(addr,
        0xFF03 | 0xFF08..=0xFF0E | 0xFF27..=0xFF2F | 0xFF4C
        | 0xFF57..=0xFF67 | 0xFF6C..=0xFF6F | 0xFF71..=0xFF75 | 0xFF78..=0xFF7F)
}

/// The full bus: mapper + PPU + APU + timer + WRAM/HRAM/IE/IF + joypad +
/// OAM-DMA/VRAM-DMA engines. Implements [`MemoryLr35902`] directly.
#[derive(Debug)]
pub struct Mmu {
    mapper: Mapper,
    ppu: Ppu,
    apu: GbApu,
    timer: Timer,

    wram: [[u8; 0x1000]; 8],
    wram_bank: u8,
    hram: [u8; 0x7F],
    io_regs: [u8; 0x80],

    ie: u8,
    if_reg: u8,
    if_written_this_tick: bool,

    joyp_select: u8,
    button_state: u8,
    dpad_state: u8,

    cgb: bool,
    double_speed: bool,
    speed_switch_requested: bool,

    oam_dma: OamDma,
    vram_dma: VramDma,

    ram_flush_pending: bool,
}

impl Mmu {
    pub fn new(mapper: Mapper, cgb: bool, sample_rate: u32) -> Self {
        Self {
            mapper,
            ppu: Ppu::new(cgb),
            apu: GbApu::new(sample_rate),
            timer: Timer::new(),
            wram: [[0; 0x1000]; 8],
            wram_bank: 1,
            hram: [0; 0x7F],
            io_regs: [0; 0x80],
            ie: 0,
            if_reg: 0xE1,
            if_written_this_tick: false,
            joyp_select: 0x30,
            button_state: 0,
            dpad_state: 0,
            cgb,
            double_speed: false,
            speed_switch_requested: false,
            oam_dma: OamDma::default(),
            vram_dma: VramDma::default(),
            ram_flush_pending: false,
        }
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn ppu_mut(&mut self) -> &mut Ppu {
        &mut self.ppu
    }

    pub fn take_frame(&mut self) -> Option<Frame> {
        self.ppu.take_frame()
    }

    pub fn drain_audio_samples(&mut self) -> Vec<(f32, f32)> {
        self.apu.drain_samples()
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.apu.set_sample_rate(rate);
    }

    pub fn ie(&self) -> u8 {
        self.ie
    }

    pub fn if_reg(&self) -> u8 {
        self.if_reg
    }

    pub fn is_double_speed(&self) -> bool {
        self.double_speed
    }

    /// Battery-backed cart RAM, for the save-file writer.
    pub fn cart_ram(&self) -> &[u8] {
        self.mapper.ram()
    }

    pub fn load_cart_ram(&mut self, saved: &[u8]) {
        self.mapper.load_ram(saved);
    }

    /// Consumes the one-shot "flush the save file now" request raised by a
    /// RAM-enable falling edge. Polled once per `step_frame()` and again on
    /// `shutdown()`.
    pub fn drain_ram_flush_request(&mut self) -> bool {
        std::mem::take(&mut self.ram_flush_pending)
    }

    pub fn press(&mut self, button: Button) {
        let bit = 1 << button.bit();
        let was_high = if button.is_dpad() {
            self.dpad_state & bit == 0
        } else {
            self.button_state & bit == 0
        };
        if button.is_dpad() {
            self.dpad_state |= bit;
        } else {
            self.button_state |= bit;
        }
        let selected = if button.is_dpad() {
            self.joyp_select & 0x10 == 0
        } else {
            self.joyp_select & 0x20 == 0
        };
        if was_high && selected {
            self.if_reg |= INT_JOYPAD;
        }
    }

    pub fn release(&mut self, button: Button) {
        let bit = 1 << button.bit();
        if button.is_dpad() {
            self.dpad_state &= !bit;
        } else {
            self.button_state &= !bit;
        }
    }

    fn read_joyp(&self) -> u8 {
        let mut low = 0x0F;
        if self.joyp_select & 0x20 == 0 {
            low &= !self.button_state;
        }
        if self.joyp_select & 0x10 == 0 {
            low &= !self.dpad_state;
        }
        0xC0 | self.joyp_select | (low & 0x0F)
    }

    fn read_key1(&self) -> u8 {
        0x7E | (self.speed_switch_requested as u8) | ((self.double_speed as u8) << 7)
    }

    fn write_key1(&mut self, v: u8) {
        // The CPU's STOP handler computes the *whole* new KEY1 value itself
        // (toggling bit 7 and clearing bit 0) and writes it back through
        // this same path, so a plain write here both arms the switch
        // (bit 0) and, when the CPU performs the switch, commits it
        // (bit 7) — there is no separate "perform switch" entry point.
        self.speed_switch_requested = v & 0x01 != 0;
        let requested_speed = v & 0x80 != 0;
        if requested_speed != self.double_speed {
            self.double_speed = requested_speed;
            self.timer.set_double_speed(self.double_speed);
        }
    }

    fn write_wram_bank_select(&mut self, v: u8) {
        let bank = v & 0x07;
        self.wram_bank = if bank == 0 { 1 } else { bank };
    }

    fn read_hdma5(&self) -> u8 {
        if self.vram_dma.hblank_active {
            (self.vram_dma.blocks_remaining.wrapping_sub(1) & 0x7F) as u8
        } else {
            0xFF
        }
    }

    fn write_hdma_src_hi(&mut self, v: u8) {
        self.vram_dma.src = (self.vram_dma.src & 0x00FF) | ((v as u16) << 8);
    }
    fn write_hdma_src_lo(&mut self, v: u8) {
        self.vram_dma.src = (self.vram_dma.src & 0xFF00) | ((v & 0xF0) as u16);
    }
    fn write_hdma_dst_hi(&mut self, v: u8) {
        self.vram_dma.dst = 0x8000 | ((self.vram_dma.dst & 0x00FF) | (((v & 0x1F) as u16) << 8));
    }
    fn write_hdma_dst_lo(&mut self, v: u8) {
        self.vram_dma.dst = (self.vram_dma.dst & 0xFF00) | ((v & 0xF0) as u16);
    }

    fn write_hdma5(&mut self, v: u8) {
        let start_hblank = v & 0x80 != 0;
        let blocks = ((v & 0x7F) as u16) + 1;

        if self.vram_dma.hblank_active && !start_hblank {
            // Cancel: HDMA5 reads back with bit 7 set (inactive).
            self.vram_dma.hblank_active = false;
            return;
        }

        if start_hblank {
            self.vram_dma.hblank_active = true;
            self.vram_dma.blocks_remaining = blocks;
            return;
        }

        // General-purpose: copy every block inline right now, then stall
        // the CPU (by ticking the rest of the hardware forward) for the
        // documented duration.
        for _ in 0..blocks {
            self.copy_vram_dma_block();
        }
        let speed = if self.double_speed { 2 } else { 1 };
        let stall_mc = blocks as u32 * VRAM_DMA_MC_PER_BLOCK * speed + 1;
        for _ in 0..stall_mc {
            self.tick();
        }
    }

    fn copy_vram_dma_block(&mut self) {
        if (0x8000..=0x9FFF).contains(&self.vram_dma.src) {
            log!(
                LogCategory::PPU,
                LogLevel::Warn,
                "VRAM-DMA source 0x{:04X} is itself VRAM; block rejected",
                self.vram_dma.src
            );
            self.vram_dma.src = self.vram_dma.src.wrapping_add(0x10);
            self.vram_dma.dst = self.vram_dma.dst.wrapping_add(0x10);
            if self.vram_dma.blocks_remaining > 0 {
                self.vram_dma.blocks_remaining -= 1;
            }
            return;
        }
        let bank = self.ppu.vbk() & 1;
        for i in 0..16u16 {
            let byte = self.read(self.vram_dma.src.wrapping_add(i));
            self.ppu
                .write_vram_bank(bank, self.vram_dma.dst.wrapping_add(i), byte);
        }
        self.vram_dma.src = self.vram_dma.src.wrapping_add(0x10);
        self.vram_dma.dst = self.vram_dma.dst.wrapping_add(0x10);
        if self.vram_dma.blocks_remaining > 0 {
            self.vram_dma.blocks_remaining -= 1;
        }
        if self.vram_dma.blocks_remaining == 0 {
            self.vram_dma.hblank_active = false;
        }
    }

    fn write_oam_dma(&mut self, v: u8) {
        let src_hi = v.min(0xDF);
        self.oam_dma.active = true;
        self.oam_dma.src_base = (src_hi as u16) << 8;
        self.oam_dma.counter = 0;
        self.io_regs[(0xFF46 - 0xFF00) as usize] = v;
    }

    fn step_oam_dma(&mut self) {
        if !self.oam_dma.active {
            return;
        }
        let src = self.oam_dma.src_base.wrapping_add(self.oam_dma.counter);
        let byte = self.read(src);
        self.ppu.oam_dma_write(self.oam_dma.counter as u8, byte);
        self.oam_dma.counter += 1;
        if self.oam_dma.counter >= 160 {
            self.oam_dma.active = false;
        }
    }

    fn read_wram_mirror(&self, addr: u16) -> u8 {
        let mirrored = addr - 0x2000;
        match mirrored {
            0xC000..=0xCFFF => self.wram[0][(mirrored - 0xC000) as usize],
            0xD000..=0xDFFF => self.wram[self.wram_bank as usize][(mirrored - 0xD000) as usize],
            _ => 0xFF,
        }
    }

    fn read_io(&mut self, addr: u16) -> u8 {
        match addr {
            0xFF00 => self.read_joyp(),
            0xFF04 => self.timer.div(),
            0xFF05 => self.timer.tima(),
            0xFF06 => self.timer.tma(),
            0xFF07 => self.timer.tac(),
            0xFF0F => 0xE0 | self.if_reg,
            0xFF10..=0xFF26 => self.apu.read_register(addr),
            0xFF30..=0xFF3F => self.apu.read_wave_ram(addr),
            0xFF40 => self.ppu.lcdc,
            0xFF41 => self.ppu.read_stat(),
            0xFF42 => self.ppu.scy,
            0xFF43 => self.ppu.scx,
            0xFF44 => self.ppu.ly,
            0xFF45 => self.ppu.lyc,
            0xFF46 => self.io_regs[(addr - 0xFF00) as usize],
            0xFF47 => self.ppu.bgp,
            0xFF48 => self.ppu.obp0,
            0xFF49 => self.ppu.obp1,
            0xFF4A => self.ppu.wy,
            0xFF4B => self.ppu.wx,
            0xFF4D if self.cgb => self.read_key1(),
            0xFF4F if self.cgb => self.ppu.vbk(),
            0xFF55 if self.cgb => self.read_hdma5(),
            0xFF68 if self.cgb => self.io_regs[(addr - 0xFF00) as usize] | 0x40,
            0xFF69 if self.cgb => self.ppu.read_bcpd(),
            0xFF6A if self.cgb => self.io_regs[(addr - 0xFF00) as usize] | 0x40,
            0xFF6B if self.cgb => self.ppu.read_ocpd(),
            0xFF70 if self.cgb => 0xF8 | self.wram_bank,
            _ if unmapped_io(addr) => 0xFF,
            _ => self.io_regs[(addr - 0xFF00) as usize],
        }
    }

    fn write_io(&mut self, addr: u16, v: u8) {
        match addr {
            0xFF00 => self.joyp_select = 0xC0 | (v & 0x30),
            0xFF04 => self.timer.write_div(),
            0xFF05 => self.timer.write_tima(v),
            0xFF06 => self.timer.write_tma(v),
            0xFF07 => self.timer.write_tac(v),
            0xFF0F => {
                self.if_reg = v & 0x1F;
                self.if_written_this_tick = true;
            }
            0xFF10..=0xFF26 => self.apu.write_register(addr, v),
            0xFF30..=0xFF3F => self.apu.write_wave_ram(addr, v),
            0xFF40 => self.ppu.write_lcdc(v),
            0xFF41 => self.ppu.write_stat(v),
            0xFF42 => self.ppu.scy = v,
            0xFF43 => self.ppu.scx = v,
            0xFF44 => {} // LY is read-only.
            0xFF45 => self.ppu.write_lyc(v),
            0xFF46 => self.write_oam_dma(v),
            0xFF47 => self.ppu.bgp = v,
            0xFF48 => self.ppu.obp0 = v,
            0xFF49 => self.ppu.obp1 = v,
            0xFF4A => self.ppu.wy = v,
            0xFF4B => self.ppu.wx = v,
            0xFF4D if self.cgb => self.write_key1(v),
            0xFF4F if self.cgb => self.ppu.write_vbk(v),
            0xFF51 if self.cgb => self.write_hdma_src_hi(v),
            0xFF52 if self.cgb => self.write_hdma_src_lo(v),
            0xFF53 if self.cgb => self.write_hdma_dst_hi(v),
            0xFF54 if self.cgb => self.write_hdma_dst_lo(v),
            0xFF55 if self.cgb => self.write_hdma5(v),
            0xFF68 if self.cgb => {
                self.io_regs[(addr - 0xFF00) as usize] = v;
                self.ppu.write_bcps(v);
            }
            0xFF69 if self.cgb => self.ppu.write_bcpd(v),
            0xFF6A if self.cgb => {
                self.io_regs[(addr - 0xFF00) as usize] = v;
                self.ppu.write_ocps(v);
            }
            0xFF6B if self.cgb => self.ppu.write_ocpd(v),
            0xFF70 if self.cgb => self.write_wram_bank_select(v),
            _ if unmapped_io(addr) => {}
            _ => self.io_regs[(addr - 0xFF00) as usize] = v,
        }
    }
}

impl MemoryLr35902 for Mmu {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF => self.mapper.read_rom(addr),
            0x8000..=0x9FFF => self.ppu.read_vram(addr),
            0xA000..=0xBFFF => self.mapper.read_ram(addr),
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize],
            0xD000..=0xDFFF => self.wram[self.wram_bank as usize][(addr - 0xD000) as usize],
            0xE000..=0xFDFF => self.read_wram_mirror(addr),
            0xFE00..=0xFE9F => self.ppu.read_oam(addr),
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00..=0xFF7F => self.read_io(addr),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie,
            _ => 0xFF,
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x7FFF => {
                self.mapper.write_rom(addr, value);
                if self.mapper.take_ram_disabled_event() {
                    self.ram_flush_pending = true;
                }
            }
            0x8000..=0x9FFF => self.ppu.write_vram(addr, value),
            0xA000..=0xBFFF => self.mapper.write_ram(addr, value),
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize] = value,
            0xD000..=0xDFFF => {
                self.wram[self.wram_bank as usize][(addr - 0xD000) as usize] = value
            }
            0xE000..=0xFDFF => {} // Echo region: writes dropped, only WRAM proper is writable.
            0xFE00..=0xFE9F => self.ppu.write_oam(addr, value),
            0xFEA0..=0xFEFF => {}
            0xFF00..=0xFF7F => self.write_io(addr, value),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = value,
            0xFFFF => self.ie = value,
            _ => {}
        }
    }

    fn tick(&mut self) {
        let if_written = std::mem::take(&mut self.if_written_this_tick);
        let timer_events = self.timer.tick(if_written);
        if timer_events.timer_irq {
            self.if_reg |= INT_TIMER;
        }
        if timer_events.apu_frame_sequencer_tick {
            self.apu.tick_frame_sequencer();
        }

        let dots = if self.double_speed { 2 } else { 4 };
        let ppu_events = self.ppu.step_dots(dots);
        if ppu_events.vblank_irq {
            self.if_reg |= INT_VBLANK;
        }
        if ppu_events.stat_irq {
            self.if_reg |= INT_LCD_STAT;
        }
        if ppu_events.hblank_entered && self.vram_dma.hblank_active {
            self.copy_vram_dma_block();
            let speed = if self.double_speed { 2 } else { 1 };
            let stall_mc = VRAM_DMA_MC_PER_BLOCK * speed + 1;
            for _ in 0..stall_mc {
                self.tick();
            }
        }

        self.apu.step(dots);
        self.step_oam_dma();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappers::Mapper;

    fn test_mmu() -> Mmu {
        let mapper = Mapper::from_cart_type(0x00, vec![0u8; 0x8000], vec![]);
        Mmu::new(mapper, false, 44100)
    }

    #[test]
    fn div_write_resets_internal_divider() {
        let mut mmu = test_mmu();
        for _ in 0..100 {
            mmu.tick();
        }
        assert_ne!(mmu.read(0xFF04), 0);
        mmu.write(0xFF04, 0xFF);
        assert_eq!(mmu.read(0xFF04), 0);
    }

    #[test]
    fn echo_region_mirrors_reads_but_drops_writes() {
        let mut mmu = test_mmu();
        mmu.write(0xC010, 0x42);
        assert_eq!(mmu.read(0xE010), 0x42);
        mmu.write(0xE020, 0x99);
        assert_eq!(mmu.read(0xC020), 0x00);
        assert_eq!(mmu.read(0xE020), 0x00);
    }

    #[test]
    fn unusable_region_reads_high() {
        let mut mmu = test_mmu();
        assert_eq!(mmu.read(0xFEA0), 0xFF);
        mmu.write(0xFEA0, 0x11);
        assert_eq!(mmu.read(0xFEA0), 0xFF);
    }

    #[test]
    fn if_write_is_visible_and_irq_request_sets_bits() {
        let mut mmu = test_mmu();
        mmu.write(0xFF0F, 0x1F);
        assert_eq!(mmu.if_reg(), 0x1F);
        assert_eq!(mmu.read(0xFF0F), 0xFF);
    }

    #[test]
    fn oam_dma_copies_160_bytes_over_160_mc() {
        let mut mmu = test_mmu();
        for i in 0..160u16 {
            mmu.write(0xC000 + i, i as u8);
        }
        mmu.write(0xFF46, 0xC0);
        for _ in 0..160 {
            mmu.tick();
        }
        for i in 0..160u16 {
            assert_eq!(mmu.read(0xFE00 + i), i as u8);
        }
    }

    #[test]
    fn joypad_press_on_selected_half_requests_irq() {
        let mut mmu = test_mmu();
        mmu.write(0xFF00, 0x10); // select buttons (bit4=0)
        mmu.press(Button::A);
        assert_eq!(mmu.if_reg() & INT_JOYPAD, INT_JOYPAD);
        assert_eq!(mmu.read(0xFF00) & 0x01, 0x00);
    }

    #[test]
    fn joypad_press_on_unselected_half_does_not_request_irq() {
        let mut mmu = test_mmu();
        mmu.write(0xFF00, 0x20); // select dpad only (bit5=0, bit4=1)
        mmu.press(Button::A);
        assert_eq!(mmu.if_reg() & INT_JOYPAD, 0);
    }

    #[test]
    fn wram_bank_zero_aliases_to_one() {
        let mut mmu = test_mmu();
        mmu.write(0xFF70, 0x00);
        mmu.write(0xD000, 0x7A);
        mmu.write(0xFF70, 0x01);
        assert_eq!(mmu.read(0xD000), 0x7A);
    }

    #[test]
    fn vram_blocked_during_mode_3() {
        let mut mmu = test_mmu();
        mmu.write(0xFF40, 0x91);
        // Drive the PPU until it enters mode 3 for line 0.
        for _ in 0..30 {
            mmu.tick();
            if mmu.ppu().mode() == 3 {
                break;
            }
        }
        assert_eq!(mmu.ppu().mode(), 3);
        assert_eq!(mmu.read(0x8000), 0xFF);
    }
}
