//! Mapper behavior, battery persistence, and the RTC.

mod common;

use dmg_core::cartridge::{Cartridge, CartridgeError};

const SECOND: u64 = 4_194_304;

fn advance_seconds(cart: &mut Cartridge, seconds: u64) {
    let cycles = seconds * SECOND;
    for _ in 0..cycles / 4096 {
        cart.step_rtc(4096);
    }
}

#[test]
fn image_too_small_is_rejected() {
    match Cartridge::load(vec![0; 0x100]) {
        Err(CartridgeError::ImageTooSmall(len)) => assert_eq!(len, 0x100),
        other => panic!("expected ImageTooSmall, got {other:?}"),
    }
}

#[test]
fn short_image_is_padded_to_declared_size() {
    // Header claims 4 banks but only 2 are present.
    let mut rom = common::rom_with_banks(0x00, 2, 0x00);
    rom[0x0148] = 0x01;
    let mut cart = Cartridge::load(rom).unwrap();
    assert_eq!(cart.read(0x7FFF), 0xFF);
}

#[test]
fn flat_rom_reads_through() {
    let mut cart = Cartridge::load(common::flat_rom()).unwrap();
    assert_eq!(cart.read(0x0000), 0x00);
    assert_eq!(cart.read(0x4000), 0x01);
    // No RAM present.
    assert_eq!(cart.read(0xA000), 0xFF);
}

#[test]
fn mbc1_bank_zero_selects_bank_one() {
    let mut cart = Cartridge::load(common::MBC1_ROM.clone()).unwrap();
    cart.write(0x2000, 0x00);
    assert_eq!(cart.read(0x4000), 0x01);
}

#[test]
fn mbc1_bank_number_wraps_to_available_banks() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x01, 8, 0x00)).unwrap();
    cart.write(0x2000, 0x03);
    assert_eq!(cart.read(0x4000), 0x03);
    // Bank 10 on an 8-bank image folds to bank 2.
    cart.write(0x2000, 0x0A);
    assert_eq!(cart.read(0x4000), 0x02);
}

#[test]
fn mbc1_ram_requires_the_0a_key() {
    let mut cart = Cartridge::load(common::MBC1_ROM.clone()).unwrap();
    cart.write(0xA000, 0x42);
    assert_eq!(cart.read(0xA000), 0xFF);

    cart.write(0x0000, 0x0A);
    cart.write(0xA000, 0x42);
    assert_eq!(cart.read(0xA000), 0x42);

    // Any value without the low nibble 0xA disables again.
    cart.write(0x0000, 0x0B);
    assert_eq!(cart.read(0xA000), 0xFF);
}

#[test]
fn mbc1_ram_banking_needs_advanced_mode() {
    let mut cart = Cartridge::load(common::MBC1_ROM.clone()).unwrap();
    cart.write(0x0000, 0x0A);

    // Simple mode pins RAM bank 0 no matter what 0x4000 says.
    cart.write(0x4000, 0x02);
    cart.write(0xA000, 0x11);
    cart.write(0x6000, 0x01);
    cart.write(0xA000, 0x22);
    cart.write(0x6000, 0x00);
    assert_eq!(cart.read(0xA000), 0x11);
    cart.write(0x6000, 0x01);
    assert_eq!(cart.read(0xA000), 0x22);
}

#[test]
fn mbc1_advanced_mode_remaps_the_low_region() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x01, 64, 0x00)).unwrap();
    assert_eq!(cart.read(0x0000), 0x00);
    cart.write(0x4000, 0x01);
    assert_eq!(cart.read(0x0000), 0x00);
    cart.write(0x6000, 0x01);
    assert_eq!(cart.read(0x0000), 0x20);
}

#[test]
fn mbc2_registers_split_on_address_bit_8() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x06, 8, 0x00)).unwrap();
    // Bit 8 set: ROM bank select.
    cart.write(0x0100, 0x03);
    assert_eq!(cart.read(0x4000), 0x03);
    // Bit 8 clear: RAM enable.
    cart.write(0x0000, 0x0A);
    cart.write(0xA000, 0x05);
    assert_eq!(cart.read(0xA000) & 0x0F, 0x05);
    cart.write(0x0000, 0x00);
    assert_eq!(cart.read(0xA000), 0xFF);
}

#[test]
fn mbc2_ram_is_nibbles_mirrored_across_the_window() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x06, 8, 0x00)).unwrap();
    cart.write(0x0000, 0x0A);
    cart.write(0xA012, 0x5A);
    // Only the low nibble is stored; the upper reads back as open bus.
    assert_eq!(cart.read(0xA012), 0xFA);
    // 512 half-bytes repeat through the whole window.
    assert_eq!(cart.read(0xA212), 0xFA);
    assert_eq!(cart.read(0xBE12), 0xFA);
}

#[test]
fn mbc3_rtc_latch_freezes_reads() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x10, 8, 0x03)).unwrap();
    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x08); // seconds register

    cart.write(0x6000, 0x00);
    cart.write(0x6000, 0x01);
    assert_eq!(cart.read(0xA000), 0);

    advance_seconds(&mut cart, 2);
    // Still showing the latched value.
    assert_eq!(cart.read(0xA000), 0);

    cart.write(0x6000, 0x00);
    cart.write(0x6000, 0x01);
    assert_eq!(cart.read(0xA000), 2);
}

#[test]
fn mbc3_rtc_day_carry_and_halt() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x10, 8, 0x03)).unwrap();
    cart.write(0x0000, 0x0A);

    // Halt the clock, then park it just before midnight of day 0x1FF.
    cart.write(0x4000, 0x0C);
    cart.write(0xA000, 0x41); // halt + day bit 8
    cart.write(0x4000, 0x0B);
    cart.write(0xA000, 0xFF);
    cart.write(0x4000, 0x0A);
    cart.write(0xA000, 23);
    cart.write(0x4000, 0x09);
    cart.write(0xA000, 59);
    cart.write(0x4000, 0x08);
    cart.write(0xA000, 59);

    advance_seconds(&mut cart, 5);
    cart.write(0x6000, 0x00);
    cart.write(0x6000, 0x01);
    cart.write(0x4000, 0x08);
    // Halted: nothing moved.
    assert_eq!(cart.read(0xA000), 59);

    // Release the halt and cross midnight.
    cart.write(0x4000, 0x0C);
    cart.write(0xA000, 0x01);
    advance_seconds(&mut cart, 1);
    cart.write(0x6000, 0x00);
    cart.write(0x6000, 0x01);

    cart.write(0x4000, 0x08);
    assert_eq!(cart.read(0xA000), 0);
    cart.write(0x4000, 0x0B);
    assert_eq!(cart.read(0xA000), 0);
    cart.write(0x4000, 0x0C);
    let dh = cart.read(0xA000);
    // Day counter overflowed: bit 8 clear, carry set.
    assert_eq!(dh & 0x01, 0);
    assert_ne!(dh & 0x80, 0);
}

#[test]
fn mbc30_maps_eight_ram_banks() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x10, 8, 0x05)).unwrap();
    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x00);
    cart.write(0xA000, 0x11);
    cart.write(0x4000, 0x07);
    cart.write(0xA000, 0x77);
    cart.write(0x4000, 0x00);
    assert_eq!(cart.read(0xA000), 0x11);
    cart.write(0x4000, 0x07);
    assert_eq!(cart.read(0xA000), 0x77);
}

#[test]
fn mbc5_can_map_bank_zero() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x19, 8, 0x00)).unwrap();
    assert_eq!(cart.read(0x4000), 0x01);
    cart.write(0x2000, 0x00);
    assert_eq!(cart.read(0x4000), 0x00);
}

#[test]
fn mbc5_uses_the_ninth_bank_bit() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x19, 512, 0x00)).unwrap();
    cart.write(0x2000, 0x05);
    cart.write(0x3000, 0x01);
    assert_eq!(cart.read(0x4000), 0x05);
    assert_eq!(cart.read(0x4001), 0x01); // bank 0x105
    cart.write(0x3000, 0x00);
    assert_eq!(cart.read(0x4001), 0x00); // bank 0x005
}

#[test]
fn unknown_mapper_still_reads_the_fixed_image() {
    let mut cart = Cartridge::load(common::rom_with_banks(0xEE, 4, 0x02)).unwrap();
    assert_eq!(cart.read(0x0000), 0x00);
    assert_eq!(cart.read(0x4000), 0x01);

    // Banking and RAM are dead.
    cart.write(0x2000, 0x02);
    assert_eq!(cart.read(0x4000), 0x01);
    cart.write(0x0000, 0x0A);
    cart.write(0xA000, 0x42);
    assert_eq!(cart.read(0xA000), 0xFF);
}

#[test]
fn battery_ram_survives_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let rom_path = dir.path().join("game.gb");
    std::fs::write(&rom_path, common::rom_with_banks(0x03, 8, 0x02)).unwrap();

    {
        let mut cart = Cartridge::from_file(&rom_path).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0xA000, 0x42);
        cart.write(0xA123, 0x99);
        cart.save_ram().unwrap();
    }

    let mut cart = Cartridge::from_file(&rom_path).unwrap();
    cart.write(0x0000, 0x0A);
    assert_eq!(cart.read(0xA000), 0x42);
    assert_eq!(cart.read(0xA123), 0x99);
}

#[test]
fn rtc_registers_survive_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let rom_path = dir.path().join("clock.gb");
    std::fs::write(&rom_path, common::rom_with_banks(0x10, 8, 0x03)).unwrap();

    {
        let mut cart = Cartridge::from_file(&rom_path).unwrap();
        cart.write(0x0000, 0x0A);
        // Halt so the wall clock cannot advance it between runs.
        cart.write(0x4000, 0x0C);
        cart.write(0xA000, 0x40);
        cart.write(0x4000, 0x09);
        cart.write(0xA000, 35);
        cart.save_ram().unwrap();
    }

    let mut cart = Cartridge::from_file(&rom_path).unwrap();
    cart.write(0x0000, 0x0A);
    cart.write(0x6000, 0x00);
    cart.write(0x6000, 0x01);
    cart.write(0x4000, 0x09);
    assert_eq!(cart.read(0xA000), 35);
    cart.write(0x4000, 0x0C);
    assert_eq!(cart.read(0xA000) & 0x40, 0x40);
}

#[test]
fn battery_blob_matches_ram_size() {
    let mut cart = Cartridge::load(common::rom_with_banks(0x03, 8, 0x03)).unwrap();
    assert!(cart.has_battery());
    assert_eq!(cart.battery().len(), 0x8000);

    let mut image = vec![0u8; 0x8000];
    image[0x2000] = 0xAB;
    cart.load_battery(&image);
    cart.write(0x0000, 0x0A);
    cart.write(0x6000, 0x01);
    cart.write(0x4000, 0x01);
    assert_eq!(cart.read(0xA000), 0xAB);
}
