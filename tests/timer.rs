use dmg_core::timer::Timer;

#[test]
fn div_counts_at_16384_hz() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.step(256, &mut if_reg);
    assert_eq!(t.read(0xFF04), 1);
    assert_eq!(if_reg, 0);
}

#[test]
fn div_write_clears_the_whole_counter() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.div = 0xABCD;
    t.write(0xFF04, 0x12, &mut if_reg);
    assert_eq!(t.read(0xFF04), 0);
    assert_eq!(t.div, 0);
}

#[test]
fn div_reset_edge_increments_tima() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.div = 0x0200; // selected bit high
    t.write(0xFF07, 0x04, &mut if_reg); // enable, 4096 Hz (bit 9)
    t.write(0xFF04, 0, &mut if_reg); // reset is a falling edge
    assert_eq!(t.tima, 1);
    assert_eq!(if_reg, 0);
}

#[test]
fn tac_disable_edge_increments_tima() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.div = 0x0200;
    t.write(0xFF07, 0x04, &mut if_reg);
    t.write(0xFF07, 0x00, &mut if_reg); // disable -> falling edge
    assert_eq!(t.tima, 1);
}

#[test]
fn tac_selects_the_divider_bit() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.write(0xFF07, 0x05, &mut if_reg); // 262144 Hz (bit 3)
    t.step(16, &mut if_reg);
    assert_eq!(t.tima, 1);

    let mut t = Timer::new();
    t.write(0xFF07, 0x06, &mut if_reg); // 65536 Hz (bit 5)
    t.step(64, &mut if_reg);
    assert_eq!(t.tima, 1);

    let mut t = Timer::new();
    t.write(0xFF07, 0x07, &mut if_reg); // 16384 Hz (bit 7)
    t.step(256, &mut if_reg);
    assert_eq!(t.tima, 1);
}

#[test]
fn tac_unused_bits_read_high() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.write(0xFF07, 0x05, &mut if_reg);
    assert_eq!(t.read(0xFF07), 0xFD);
}

#[test]
fn overflow_reads_zero_for_four_cycles_then_reloads() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.write(0xFF07, 0x05, &mut if_reg);
    t.tima = 0xFF;
    t.tma = 0xAB;

    t.step(16, &mut if_reg); // overflow on the last cycle
    assert_eq!(t.tima, 0);
    assert_eq!(if_reg, 0);

    t.step(3, &mut if_reg);
    assert_eq!(t.tima, 0);
    assert_eq!(if_reg, 0);

    t.step(1, &mut if_reg);
    assert_eq!(t.tima, 0xAB);
    assert_eq!(if_reg & 0x04, 0x04);
}

#[test]
fn tima_write_during_the_delay_cancels_the_reload() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.write(0xFF07, 0x05, &mut if_reg);
    t.tima = 0xFF;
    t.tma = 0xAB;

    t.step(16, &mut if_reg);
    t.write(0xFF05, 0x12, &mut if_reg);
    t.step(8, &mut if_reg);
    assert_eq!(t.tima, 0x12);
    assert_eq!(if_reg, 0);
}

#[test]
fn tma_write_during_the_delay_updates_the_reload() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.write(0xFF07, 0x05, &mut if_reg);
    t.tima = 0xFF;
    t.tma = 0xAB;

    t.step(16, &mut if_reg);
    t.write(0xFF06, 0x77, &mut if_reg);
    t.step(4, &mut if_reg);
    assert_eq!(t.tima, 0x77);
    assert_eq!(if_reg & 0x04, 0x04);
}

#[test]
fn tma_write_in_the_overflow_cycle_reloads_the_old_value() {
    let mut t = Timer::new();
    let mut if_reg = 0u8;
    t.div = 0x03FF; // bit 9 high, one cycle from falling
    t.write(0xFF07, 0x04, &mut if_reg);
    t.tima = 0xFF;
    t.tma = 0xAA;

    t.write(0xFF06, 0xBB, &mut if_reg);
    t.step(1, &mut if_reg); // overflow
    assert_eq!(t.tima, 0);
    t.step(4, &mut if_reg);
    assert_eq!(t.tma, 0xBB);
    assert_eq!(t.tima, 0xAA); // the pre-write value was latched
    assert_eq!(if_reg & 0x04, 0x04);
}
