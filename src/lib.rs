//! Cycle-accurate Game Boy (DMG) emulation core.
//!
//! This crate contains the platform-agnostic emulator logic (CPU/MMU/PPU/APU/
//! etc). It renders to an in-memory shade-index framebuffer and pushes audio
//! into a bounded queue; frontends drive the machine through the [`gameboy`]
//! facade.

/// Audio Processing Unit (APU) emulation.
pub mod apu;

/// Bounded audio ring buffer filled by the APU.
pub mod audio_queue;

/// Cartridge mappers (MBC) and ROM/RAM/RTC handling.
pub mod cartridge;

/// LR35902 CPU core.
pub mod cpu;

/// High-level facade that wires the CPU and MMU into a single machine.
pub mod gameboy;

/// Hardware revisions and revision-specific boot state.
pub mod hardware;

/// Joypad input register and edge-triggered interrupt behavior.
pub mod input;

/// Memory map and hardware plumbing.
pub mod mmu;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// Whole-machine snapshot encoding and restoring.
pub mod save_state;

/// Serial unit and link cable plumbing.
pub mod serial;

/// Divider/timer unit.
pub mod timer;
