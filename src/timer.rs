use bincode::{Decode, Encode};

/// TIMA reload sequencing after an overflow.
///
/// The counter reads 0 for four cycles after overflowing, then TMA is copied
/// in and the interrupt is requested. Writes interact with each phase
/// differently, which several licensed titles depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum ReloadPhase {
    Idle,
    /// Cycles left until the reload is applied.
    Counting(u8),
    /// The reload was applied this cycle.
    Loading,
}

#[derive(Debug, Encode, Decode)]
pub struct Timer {
    /// 16-bit internal divider counter. DIV register is the upper 8 bits.
    pub div: u16,
    /// Timer counter
    pub tima: u8,
    /// Timer modulo
    pub tma: u8,
    /// Timer control
    pub tac: u8,
    last_signal: bool,
    /// Previous TMA value when a write occurred this cycle
    tma_latch: Option<u8>,
    phase: ReloadPhase,
    /// Value the pending reload will apply
    reload_value: u8,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            div: 0,
            tima: 0,
            tma: 0,
            tac: 0,
            last_signal: false,
            tma_latch: None,
            phase: ReloadPhase::Idle,
            reload_value: 0,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF04 => (self.div >> 8) as u8,
            0xFF05 => self.tima,
            0xFF06 => self.tma,
            0xFF07 => self.tac | 0xF8,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8, if_reg: &mut u8) {
        match addr {
            0xFF04 => {
                self.reset_div(if_reg);
            }
            0xFF05 => {
                match self.phase {
                    // Ignored while the reload lands.
                    ReloadPhase::Loading | ReloadPhase::Counting(0) => {}
                    // Writing during the delay cancels the pending reload.
                    ReloadPhase::Counting(_) => {
                        self.tima = val;
                        self.phase = ReloadPhase::Idle;
                    }
                    ReloadPhase::Idle => self.tima = val,
                }
            }
            0xFF06 => {
                // Keep the old value around so an overflow in the same cycle
                // still latches it.
                self.tma_latch = Some(self.tma);
                self.tma = val;
                if let ReloadPhase::Counting(_) = self.phase {
                    self.reload_value = val;
                }
                if self.phase == ReloadPhase::Loading {
                    self.tima = val;
                }
            }
            0xFF07 => {
                let prev = Self::signal_with(self.div, self.tac);
                self.tac = val & 0x07;
                let new = Self::signal_with(self.div, self.tac);
                if prev && !new {
                    let tma_old = self.tma_latch.take();
                    self.increment(tma_old);
                }
                self.last_signal = new;
            }
            _ => {}
        }
    }

    /// Advance the timer by `cycles` CPU cycles and update IF when TIMA
    /// overflows.
    pub fn step(&mut self, cycles: u16, if_reg: &mut u8) {
        for _ in 0..cycles {
            self.run_reload(if_reg);
            let prev = self.last_signal;
            // Take any pending TMA write for this cycle
            let tma_old = self.tma_latch.take();
            self.div = self.div.wrapping_add(1);
            let new = self.signal();
            if prev && !new {
                self.increment(tma_old);
            }
            self.last_signal = new;
        }
    }

    /// Reset the internal divider counter, applying TIMA edge logic.
    pub fn reset_div(&mut self, if_reg: &mut u8) {
        self.run_reload(if_reg);
        let prev = Self::signal_with(self.div, self.tac);
        self.div = 0;
        let new = Self::signal_with(self.div, self.tac);
        if prev && !new {
            let tma_old = self.tma_latch.take();
            self.increment(tma_old);
        }
        self.last_signal = new;
    }

    fn run_reload(&mut self, if_reg: &mut u8) {
        match self.phase {
            ReloadPhase::Loading => self.phase = ReloadPhase::Idle,
            ReloadPhase::Counting(0) => {
                self.tima = self.reload_value;
                *if_reg |= 0x04;
                self.phase = ReloadPhase::Loading;
            }
            ReloadPhase::Counting(n) => self.phase = ReloadPhase::Counting(n - 1),
            ReloadPhase::Idle => {}
        }
    }

    fn increment(&mut self, tma_old: Option<u8>) {
        if self.tima == 0xFF {
            self.tima = 0;
            self.reload_value = tma_old.unwrap_or(self.tma);
            self.phase = ReloadPhase::Counting(3);
        } else {
            self.tima = self.tima.wrapping_add(1);
        }
    }

    fn signal(&self) -> bool {
        Self::signal_with(self.div, self.tac)
    }

    fn signal_with(div: u16, tac: u8) -> bool {
        if tac & 0x04 == 0 {
            return false;
        }
        let bit = match tac & 0x03 {
            0x00 => 9,
            0x01 => 3,
            0x02 => 5,
            _ => 7,
        };
        (div >> bit) & 1 != 0
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
