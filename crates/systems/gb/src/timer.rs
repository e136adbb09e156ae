//! DIV/TIMA timer, ticked once per machine cycle from [`crate::mmu::Mmu::tick`].
//!
//! The visible registers (DIV/TIMA/TMA/TAC) are derived from a free-running
//! internal 16-bit divider; TIMA increments on the falling edge of
//! `tima_enable & div[mask_bit]`, which is what makes TAC's clock-select
//! reproduce the documented "write DIV while TIMA's selected bit is set"
//! glitch as a side effect of normal falling-edge detection rather than a
//! special case.

/// Output of one [`Timer::tick`] call: which IRQs/taps fired on this MC.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerEvents {
    pub timer_irq: bool,
    /// Falling edge of the APU-DIV tap bit; the caller ticks the APU frame
    /// sequencer once per `true`.
    pub apu_frame_sequencer_tick: bool,
}

#[derive(Debug)]
pub struct Timer {
    div: u16,
    tima: u8,
    tma: u8,
    tac: u8,
    tima_reload_cycle: bool,
    tima_overflow_cycle: bool,
    prev_tima_bit: bool,
    prev_apu_tap_bit: bool,
    double_speed: bool,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            div: 0,
            tima: 0,
            tma: 0,
            tac: 0,
            tima_reload_cycle: false,
            tima_overflow_cycle: false,
            prev_tima_bit: false,
            prev_apu_tap_bit: false,
            double_speed: false,
        }
    }

    pub fn set_double_speed(&mut self, double: bool) {
        self.double_speed = double;
    }

    pub fn div(&self) -> u8 {
        (self.div >> 8) as u8
    }

    pub fn write_div(&mut self) {
        self.div = 0;
    }

    pub fn tima(&self) -> u8 {
        self.tima
    }

    /// Writes during the reload MC are dropped; the hardware reload already
    /// in flight wins.
    pub fn write_tima(&mut self, v: u8) {
        if self.tima_reload_cycle {
            return;
        }
        self.tima = v;
        self.tima_overflow_cycle = false;
    }

    pub fn tma(&self) -> u8 {
        self.tma
    }

    pub fn write_tma(&mut self, v: u8) {
        self.tma = v;
        if self.tima_reload_cycle {
            self.tima = v;
        }
    }

    pub fn tac(&self) -> u8 {
        self.tac | 0xF8
    }

    pub fn write_tac(&mut self, v: u8) {
        self.tac = v & 0x07;
    }

    fn tima_div_bit(&self) -> u16 {
        match self.tac & 0x03 {
            0 => 1 << 9,
            1 => 1 << 3,
            2 => 1 << 5,
            _ => 1 << 7,
        }
    }

    fn apu_tap_bit(&self) -> u16 {
        if self.double_speed {
            1 << 12
        } else {
            1 << 11
        }
    }

    /// Advances the timer by exactly one MC (§4.3's `tick_timers`
    /// sub-scheduler, steps 1/2/3/4). `if_written_this_mc` suppresses the
    /// reload IRQ when the CPU's own `IF` write races the hardware one.
    pub fn tick(&mut self, if_written_this_mc: bool) -> TimerEvents {
        let mut events = TimerEvents::default();

        if self.tima_reload_cycle {
            self.tima = self.tma;
            events.timer_irq = !if_written_this_mc;
            self.tima_reload_cycle = false;
        } else if self.tima_overflow_cycle {
            self.tima_overflow_cycle = false;
            self.tima_reload_cycle = true;
        }

        self.div = self.div.wrapping_add(4);

        let apu_bit = (self.div & self.apu_tap_bit()) != 0;
        if self.prev_apu_tap_bit && !apu_bit {
            events.apu_frame_sequencer_tick = true;
        }
        self.prev_apu_tap_bit = apu_bit;

        let tima_enable = self.tac & 0x04 != 0;
        let tima_bit = tima_enable && (self.div & self.tima_div_bit()) != 0;
        if self.prev_tima_bit && !tima_bit {
            let (next, overflowed) = self.tima.overflowing_add(1);
            self.tima = next;
            if overflowed {
                self.tima_overflow_cycle = true;
            }
        }
        self.prev_tima_bit = tima_bit;

        events
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
