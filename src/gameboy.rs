use std::path::Path;

use crate::audio_queue::{AudioConsumer, AudioProducer, audio_queue};
use crate::cartridge::{Cartridge, CartridgeError};
use crate::cpu::Cpu;
use crate::hardware::DmgRevision;
use crate::input::Button;
use crate::mmu::Mmu;
use crate::ppu::{DOTS_PER_FRAME, SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::save_state::{self, SaveStateError};

/// An emulated DMG machine: CPU plus the memory bus holding every
/// peripheral. This is the type hosts drive.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
    pub(crate) revision: DmgRevision,
    audio_out: Option<AudioProducer>,
}

impl GameBoy {
    pub fn new() -> Self {
        Self::new_with_revision(DmgRevision::default())
    }

    /// Create a machine in the post-boot state the given revision's boot ROM
    /// leaves behind. Execution starts at the cartridge entry point.
    pub fn new_with_revision(revision: DmgRevision) -> Self {
        GameBoy {
            cpu: Cpu::new_with_revision(revision),
            mmu: Mmu::new_with_revision(revision),
            revision,
            audio_out: None,
        }
    }

    pub fn new_power_on() -> Self {
        Self::new_power_on_with_revision(DmgRevision::default())
    }

    /// Create a machine at the reset vector with nothing initialized, for
    /// running a boot ROM loaded via [`GameBoy::load_boot_rom`].
    pub fn new_power_on_with_revision(revision: DmgRevision) -> Self {
        GameBoy {
            cpu: Cpu::new_power_on(),
            mmu: Mmu::new_power_on(),
            revision,
            audio_out: None,
        }
    }

    /// Reset to the post-boot state, keeping the loaded cartridge and boot
    /// ROM image.
    pub fn reset(&mut self) {
        let cart = self.mmu.cart.take();
        let boot_rom = self.mmu.boot_rom.take();
        self.cpu = Cpu::new_with_revision(self.revision);
        self.mmu = Mmu::new_with_revision(self.revision);
        self.mmu.cart = cart;
        self.mmu.boot_rom = boot_rom;
    }

    /// Reset to the power-on state. If a boot ROM image is loaded it is
    /// mapped over the cartridge again.
    pub fn reset_power_on(&mut self) {
        let cart = self.mmu.cart.take();
        let boot_rom = self.mmu.boot_rom.take();
        self.cpu = Cpu::new_power_on();
        self.mmu = Mmu::new_power_on();
        self.mmu.cart = cart;
        if let Some(data) = boot_rom {
            self.mmu.load_boot_rom(data);
        }
    }

    pub fn revision(&self) -> DmgRevision {
        self.revision
    }

    pub fn load_rom(&mut self, data: Vec<u8>) -> Result<(), CartridgeError> {
        let cart = Cartridge::load(data)?;
        self.mmu.load_cart(cart);
        Ok(())
    }

    /// Load a ROM from disk. Battery RAM and RTC data are picked up from
    /// `.sav`/`.rtc` files next to the ROM when the cartridge has them.
    pub fn load_rom_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), CartridgeError> {
        let cart = Cartridge::from_file(path)?;
        self.mmu.load_cart(cart);
        Ok(())
    }

    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.mmu.load_boot_rom(data);
    }

    /// Execute one CPU instruction (or one idle cycle when halted or
    /// locked), advancing every peripheral in lockstep.
    pub fn step(&mut self) {
        self.cpu.step(&mut self.mmu);
        if let Some(out) = &self.audio_out {
            while let Some((left, right)) = self.mmu.apu.pop_sample() {
                // Dropped on overrun; the consumer is not keeping up.
                let _ = out.push_stereo(left, right);
            }
        }
    }

    /// Run until the video unit completes a frame. With the LCD turned off
    /// no frame ever completes, so this falls back to running one frame's
    /// worth of dots.
    pub fn run_frame(&mut self) {
        let deadline = self.cpu.cycles + DOTS_PER_FRAME as u64;
        while !self.mmu.ppu.frame_ready() && self.cpu.cycles < deadline {
            self.step();
        }
        self.mmu.ppu.clear_frame_flag();
    }

    /// Run for at least `t_cycles` 4 MHz cycles. Returns the number
    /// actually executed, which can overshoot by one instruction.
    pub fn run_cycles(&mut self, t_cycles: u64) -> u64 {
        let start = self.cpu.cycles;
        while self.cpu.cycles.wrapping_sub(start) < t_cycles {
            self.step();
        }
        self.cpu.cycles.wrapping_sub(start)
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.mmu
            .input
            .set_button(button, pressed, &mut self.mmu.if_reg);
    }

    /// Shade indices (0-3) for the last completed frame, row-major,
    /// `SCREEN_WIDTH` by `SCREEN_HEIGHT`.
    pub fn framebuffer(&self) -> &[u8; SCREEN_WIDTH * SCREEN_HEIGHT] {
        self.mmu.ppu.framebuffer()
    }

    pub fn frames(&self) -> u64 {
        self.mmu.ppu.frames()
    }

    /// Bytes the game pushed out the link port since the last call.
    pub fn take_serial(&mut self) -> Vec<u8> {
        self.mmu.take_serial()
    }

    /// Create a bounded queue for audio output and start filling it. The
    /// returned consumer can be handed to an audio callback on another
    /// thread.
    pub fn attach_audio(&mut self, capacity_frames: usize) -> AudioConsumer {
        let (producer, consumer) = audio_queue(capacity_frames);
        self.audio_out = Some(producer);
        consumer
    }

    pub fn detach_audio(&mut self) {
        self.audio_out = None;
    }

    pub fn set_audio_sample_rate(&mut self, rate: u32) {
        self.mmu.apu.set_sample_rate(rate);
    }

    /// Write battery-backed cartridge RAM (and RTC state) to the paths
    /// established when the ROM was loaded from disk. A cartridge without a
    /// battery is a no-op.
    pub fn save_ram(&mut self) -> std::io::Result<()> {
        match self.mmu.cart.as_mut() {
            Some(cart) => cart.save_ram(),
            None => Ok(()),
        }
    }

    /// Serialize the complete machine state.
    pub fn save_state(&self) -> Vec<u8> {
        save_state::serialize(self)
    }

    /// Replace the machine state with a previously serialized one. The
    /// current state is untouched on error.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SaveStateError> {
        save_state::restore(self, data)
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}
