//! Shared ROM fixtures for the integration tests.

#![allow(dead_code)]

use once_cell::sync::Lazy;

/// Shared 512 KiB MBC1 image with 32 KiB of RAM declared; clone before
/// loading so each test gets its own mapper state.
pub static MBC1_ROM: Lazy<Vec<u8>> = Lazy::new(|| rom_with_banks(0x03, 32, 0x03));

/// 32 KiB zero-filled image: no mapper, no RAM, every tile and map byte zero.
pub fn flat_rom() -> Vec<u8> {
    rom_with_banks(0x00, 2, 0x00)
}

/// 32 KiB flat image with `code` placed at the 0x0100 entry point, where
/// execution starts after boot.
pub fn program_rom(code: &[u8]) -> Vec<u8> {
    let mut rom = flat_rom();
    rom[0x0100..0x0100 + code.len()].copy_from_slice(code);
    rom
}

/// Build an image with the given mapper tag at 0x0147, `banks` 16 KiB ROM
/// banks, and the raw RAM size code at 0x0149. The first two bytes of every
/// bank hold the bank index little-endian so tests can observe which one is
/// mapped in.
pub fn rom_with_banks(cart_type: u8, banks: usize, ram_code: u8) -> Vec<u8> {
    let mut rom = vec![0u8; banks * 0x4000];
    rom[0x0147] = cart_type;
    rom[0x0148] = rom_size_code(banks);
    rom[0x0149] = ram_code;
    for bank in 0..banks {
        rom[bank * 0x4000] = bank as u8;
        rom[bank * 0x4000 + 1] = (bank >> 8) as u8;
    }
    rom
}

// Header code n declares 2^(n+1) banks.
fn rom_size_code(banks: usize) -> u8 {
    (banks.next_power_of_two().trailing_zeros().saturating_sub(1)) as u8
}
