use crate::{
    apu::Apu, cartridge::Cartridge, hardware::DmgRevision, input::Input, ppu::Ppu, serial::Serial,
    timer::Timer,
};
use bincode::{Decode, Encode};

const WRAM_SIZE: usize = 0x2000;
const HRAM_SIZE: usize = 0x7F;

/// Memory bus: owns every addressable region and peripheral, decodes CPU
/// accesses, and carries the IF/IE interrupt latches the peripherals write
/// into.
#[derive(Encode, Decode)]
pub struct Mmu {
    pub wram: [u8; WRAM_SIZE],
    pub hram: [u8; HRAM_SIZE],
    pub cart: Option<Cartridge>,
    pub boot_rom: Option<Vec<u8>>,
    pub boot_mapped: bool,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub input: Input,
    dma_cycles: u16,
    dma_source: u16,
    pending_dma: Option<u16>,
    pending_delay: u16,
}

impl Mmu {
    /// Build a bus in the state the boot ROM leaves behind, for sessions
    /// that jump straight to the cartridge entry point.
    pub fn new_with_revision(revision: DmgRevision) -> Self {
        let mut timer = Timer::new();
        timer.div = revision.initial_div_counter();

        let mut ppu = Ppu::new();
        ppu.apply_boot_state(revision);

        Self {
            wram: [0; WRAM_SIZE],
            hram: [0; HRAM_SIZE],
            cart: None,
            boot_rom: None,
            boot_mapped: false,
            if_reg: 0xE1,
            ie_reg: 0,
            serial: Serial::new(),
            ppu,
            apu: Apu::new(),
            timer,
            input: Input::new(),
            dma_cycles: 0,
            dma_source: 0,
            pending_dma: None,
            pending_delay: 0,
        }
    }

    pub fn new() -> Self {
        Self::new_with_revision(DmgRevision::default())
    }

    /// Build a bus in the cold power-on state, for sessions that execute a
    /// boot ROM. The LCD and APU start switched off and the divider starts
    /// from zero.
    pub fn new_power_on() -> Self {
        let mut mmu = Self::new_with_revision(DmgRevision::default());
        mmu.timer = Timer::new();
        mmu.ppu = Ppu::new();
        mmu.apu.write_reg(0xFF26, 0x00);
        mmu.apu.take_samples();
        mmu.if_reg = 0xE0;
        mmu
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.boot_rom = Some(data);
        self.boot_mapped = true;
    }

    fn read_byte_inner(&mut self, addr: u16, allow_dma: bool) -> u8 {
        if !allow_dma && self.dma_cycles > 0 {
            // While the DMA engine holds the bus only the register page and
            // HRAM stay reachable; everything else reads back 0xFF.
            match addr {
                0xFF00..=0xFFFF => {}
                _ => return 0xFF,
            }
        }
        match addr {
            0x0000..=0x00FF if self.boot_mapped => self
                .boot_rom
                .as_ref()
                .and_then(|b| b.get(addr as usize).copied())
                .unwrap_or(0xFF),
            0x0000..=0x7FFF => self.cart.as_mut().map(|c| c.read(addr)).unwrap_or(0xFF),
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[(addr - 0x8000) as usize]
                } else {
                    0xFF
                }
            }
            0xA000..=0xBFFF => self.cart.as_mut().map(|c| c.read(addr)).unwrap_or(0xFF),
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize],
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize],
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => self.input.read(),
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.if_reg,
            0xFF10..=0xFF3F => self.apu.read_reg(addr),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B => self.ppu.read_reg(addr),
            0xFF46 => self.ppu.dma,
            0xFF50 => {
                if self.boot_mapped {
                    0xFE
                } else {
                    0xFF
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg,
            _ => 0xFF,
        }
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        self.read_byte_inner(addr, false)
    }

    fn dma_read_byte(&mut self, addr: u16) -> u8 {
        // Transfer sources past 0xDFFF wrap back into WRAM through the echo
        // region.
        let addr = if (0xFE00..=0xFF9F).contains(&addr) {
            addr.wrapping_sub(0x2000)
        } else {
            addr
        };
        self.read_byte_inner(addr, true)
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        if self.dma_cycles > 0 {
            match addr {
                0xFF00..=0xFFFF => {}
                _ => return,
            }
        }

        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[(addr - 0x8000) as usize] = val;
                }
            }
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize] = val,
            0xE000..=0xFDFF => self.wram[(addr - 0xE000) as usize] = val,
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00 => self.input.write(val, &mut self.if_reg),
            0xFF01 | 0xFF02 => self.serial.write(addr, val),
            0xFF04 => self.reset_div(),
            0xFF05..=0xFF07 => self.timer.write(addr, val, &mut self.if_reg),
            0xFF0F => self.if_reg = (val & 0x1F) | (self.if_reg & 0xE0),
            0xFF10..=0xFF3F => self.apu.write_reg(addr, val),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B => self.ppu.write_reg(addr, val, &mut self.if_reg),
            0xFF46 => {
                self.ppu.dma = val;
                self.pending_dma = Some((val as u16) << 8);
                // The transfer engages after a two machine cycle startup
                // window; a second write inside it replaces the source.
                self.pending_delay = 8;
                #[cfg(feature = "ppu-trace")]
                eprintln!("[DMA] scheduled src={:02X}00", val);
            }
            0xFF50 => {
                if val & 0x01 != 0 {
                    self.boot_mapped = false;
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val,
            _ => {}
        }
    }

    /// Reset the divider counter. The APU gets notified because a reset while
    /// its tap bit is high counts as a falling edge for the frame sequencer.
    pub fn reset_div(&mut self) {
        let prev_div = self.timer.div;
        self.timer.reset_div(&mut self.if_reg);
        self.apu.notify_div_reset(prev_div);
    }

    /// Advance every peripheral by the given number of machine cycles, in
    /// the fixed order the hardware multiplexes them: OAM DMA, Timer, Serial,
    /// audio, video.
    pub fn tick(&mut self, m_cycles: u8) {
        let dots = 4 * m_cycles as u16;
        if let Some(cart) = self.cart.as_mut() {
            cart.step_rtc(dots);
        }
        self.dma_step(dots);
        let prev_div = self.timer.div;
        self.timer.step(dots, &mut self.if_reg);
        self.serial.step(prev_div, self.timer.div, &mut self.if_reg);
        self.apu.step(prev_div, dots as u32);
        self.ppu.step(dots, &mut self.if_reg);
    }

    /// Advance the ongoing OAM DMA transfer if active.
    pub fn dma_step(&mut self, cycles: u16) {
        for _ in 0..cycles {
            if self.pending_delay > 0 {
                self.pending_delay -= 1;
                if self.pending_delay == 0
                    && let Some(src) = self.pending_dma.take()
                {
                    self.dma_source = src;
                    // 160 bytes, one per machine cycle.
                    self.dma_cycles = 640;
                    #[cfg(feature = "ppu-trace")]
                    eprintln!("[DMA] started src={:04X}", src);
                }
            }

            if self.dma_cycles == 0 {
                continue;
            }

            let elapsed = 640 - self.dma_cycles;
            if elapsed.is_multiple_of(4) {
                let idx: u16 = elapsed / 4;
                if idx < 0xA0 {
                    let byte = self.dma_read_byte(self.dma_source.wrapping_add(idx));
                    self.ppu.oam[idx as usize] = byte;
                }
            }

            self.dma_cycles -= 1;
        }
    }

    /// Return true if an OAM DMA transfer is in progress or pending.
    pub fn dma_active(&self) -> bool {
        self.dma_cycles > 0 || self.pending_delay > 0
    }

    pub fn take_serial(&mut self) -> Vec<u8> {
        self.serial.take_output()
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
