use crate::hardware::DmgRevision;
use bincode::{Decode, Encode};

// CPU flag bits as documented in gbdev.io/pandocs/The_CPU_Flags.html
const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half Carry
const FLAG_C: u8 = 0x10; // Carry

// Interrupt vectors (gbdev.io/pandocs/Interrupts.html)
const INTERRUPT_VBLANK: u16 = 0x40;
const INTERRUPT_STAT: u16 = 0x48;
const INTERRUPT_TIMER: u16 = 0x50;
const INTERRUPT_SERIAL: u16 = 0x58;
const INTERRUPT_JOYPAD: u16 = 0x60;

// Post-boot CPU state from gbdev.io/pandocs/Power_Up_State.html
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

#[cfg(feature = "cpu-trace")]
macro_rules! cpu_trace {
    ($($arg:tt)*) => { eprintln!($($arg)*) };
}
#[cfg(not(feature = "cpu-trace"))]
macro_rules! cpu_trace {
    ($($arg:tt)*) => {};
}

/// LR35902 interpreter. Every bus access or internal delay advances the
/// whole machine one cycle at a time through [`Cpu::tick`], so peripheral
/// state observed mid-instruction matches hardware.
#[derive(Encode, Decode)]
pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    /// T-cycles elapsed since power on.
    pub cycles: u64,
    pub ime: bool,
    pub halted: bool,
    /// Set after executing an undefined opcode. Fetch never resumes;
    /// peripherals keep running.
    pub locked: bool,
    halt_bug: bool,
    ime_enable_delay: u8,
    /// PC saved when the halt was entered, used as the return address if an
    /// interrupt dispatches out of the halt.
    halt_pc: Option<u16>,
    /// Interrupts already pending when HALT ran during an EI window.
    halt_pending: u8,
}

impl Cpu {
    pub fn new() -> Self {
        Self::new_with_revision(DmgRevision::default())
    }

    /// Create a CPU initialized to the post-boot register state for the
    /// selected hardware revision.
    pub fn new_with_revision(revision: DmgRevision) -> Self {
        let (a, f, b, c, d, e, h, l) = match revision {
            DmgRevision::Rev0 => (0x01, 0x00, 0xFF, 0x13, 0x00, 0xC1, 0x84, 0x03),
            DmgRevision::RevA | DmgRevision::RevB | DmgRevision::RevC => {
                (0x01, 0xB0, 0x00, 0x13, 0x00, 0xD8, 0x01, 0x4D)
            }
        };
        Self {
            a,
            f,
            b,
            c,
            d,
            e,
            h,
            l,
            pc: BOOT_PC,
            sp: BOOT_SP,
            cycles: 0,
            ime: false,
            halted: false,
            locked: false,
            halt_bug: false,
            ime_enable_delay: 0,
            halt_pc: None,
            halt_pending: 0,
        }
    }

    /// Create a CPU in a neutral power-on state suitable for executing a
    /// boot ROM from address 0. Boot ROMs re-initialize the registers early,
    /// so the critical part is not starting from the post-boot values.
    pub fn new_power_on() -> Self {
        Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            pc: 0x0000,
            sp: 0x0000,
            cycles: 0,
            ime: false,
            halted: false,
            locked: false,
            halt_bug: false,
            ime_enable_delay: 0,
            halt_pc: None,
            halt_pending: 0,
        }
    }

    fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn enter_halt(&mut self, next_pc: u16, buffered: u8) {
        self.halted = true;
        self.halt_pc = Some(next_pc);
        self.halt_pending = buffered;
    }

    fn exit_halt(&mut self) {
        self.halted = false;
        self.halt_pc = None;
        self.halt_pending = 0;
    }

    fn next_interrupt(pending: u8) -> (u8, u16) {
        if pending & 0x01 != 0 {
            (0x01, INTERRUPT_VBLANK)
        } else if pending & 0x02 != 0 {
            (0x02, INTERRUPT_STAT)
        } else if pending & 0x04 != 0 {
            (0x04, INTERRUPT_TIMER)
        } else if pending & 0x08 != 0 {
            (0x08, INTERRUPT_SERIAL)
        } else {
            (0x10, INTERRUPT_JOYPAD)
        }
    }

    /// Advance the rest of the machine by the given number of machine
    /// cycles. One machine cycle is four T-cycles.
    #[inline]
    fn tick(&mut self, mmu: &mut crate::mmu::Mmu, m_cycles: u8) {
        self.cycles += 4 * m_cycles as u64;
        mmu.tick(m_cycles);
    }

    #[inline(always)]
    fn fetch8(&mut self, mmu: &mut crate::mmu::Mmu) -> u8 {
        let val = mmu.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn fetch16(&mut self, mmu: &mut crate::mmu::Mmu) -> u16 {
        let lo = self.fetch8(mmu) as u16;
        let hi = self.fetch8(mmu) as u16;
        (hi << 8) | lo
    }

    #[inline(always)]
    fn read8(&mut self, mmu: &mut crate::mmu::Mmu, addr: u16) -> u8 {
        let val = mmu.read_byte(addr);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn write8(&mut self, mmu: &mut crate::mmu::Mmu, addr: u16, val: u8) {
        mmu.write_byte(addr, val);
        self.tick(mmu, 1);
    }

    fn push_stack(&mut self, mmu: &mut crate::mmu::Mmu, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, val as u8);
    }

    fn pop_stack(&mut self, mmu: &mut crate::mmu::Mmu) -> u16 {
        let lo = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    /// Return a formatted string of the current CPU state for debugging.
    pub fn debug_state(&self) -> String {
        format!(
            "AF:{:04X} BC:{:04X} DE:{:04X} HL:{:04X} PC:{:04X} SP:{:04X} CY:{}",
            ((self.a as u16) << 8) | self.f as u16,
            self.get_bc(),
            self.get_de(),
            self.get_hl(),
            self.pc,
            self.sp,
            self.cycles
        )
    }

    // 8-bit ALU. Each helper leaves the result in A (or returns it) and
    // rebuilds F from scratch per the hardware flag rules.

    fn add8(&mut self, val: u8) {
        let (res, carry) = self.a.overflowing_add(val);
        self.f = if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) + (val & 0x0F) > 0x0F {
                FLAG_H
            } else {
                0
            }
            | if carry { FLAG_C } else { 0 };
        self.a = res;
    }

    fn adc8(&mut self, val: u8) {
        let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
        let (partial, carry1) = self.a.overflowing_add(val);
        let (res, carry2) = partial.overflowing_add(carry_in);
        self.f = if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) + (val & 0x0F) + carry_in > 0x0F {
                FLAG_H
            } else {
                0
            }
            | if carry1 || carry2 { FLAG_C } else { 0 };
        self.a = res;
    }

    fn sub8(&mut self, val: u8) {
        let (res, borrow) = self.a.overflowing_sub(val);
        self.f = FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) < (val & 0x0F) {
                FLAG_H
            } else {
                0
            }
            | if borrow { FLAG_C } else { 0 };
        self.a = res;
    }

    fn sbc8(&mut self, val: u8) {
        let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
        let (partial, borrow1) = self.a.overflowing_sub(val);
        let (res, borrow2) = partial.overflowing_sub(carry_in);
        self.f = FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) < (val & 0x0F) + carry_in {
                FLAG_H
            } else {
                0
            }
            | if borrow1 || borrow2 { FLAG_C } else { 0 };
        self.a = res;
    }

    fn and8(&mut self, val: u8) {
        self.a &= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
    }

    fn xor8(&mut self, val: u8) {
        self.a ^= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 };
    }

    fn or8(&mut self, val: u8) {
        self.a |= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 };
    }

    fn cp8(&mut self, val: u8) {
        let res = self.a.wrapping_sub(val);
        self.f = FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) < (val & 0x0F) {
                FLAG_H
            } else {
                0
            }
            | if self.a < val { FLAG_C } else { 0 };
    }

    fn inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C)
            | if res == 0 { FLAG_Z } else { 0 }
            | if (val & 0x0F) + 1 > 0x0F { FLAG_H } else { 0 };
        res
    }

    fn dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C)
            | FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0 { FLAG_H } else { 0 };
        res
    }

    /// ADD HL,rr. Includes the internal delay cycle.
    fn add_hl(&mut self, mmu: &mut crate::mmu::Mmu, val: u16) {
        let hl = self.get_hl();
        let res = hl.wrapping_add(val);
        self.f = (self.f & FLAG_Z)
            | if ((hl & 0x0FFF) + (val & 0x0FFF)) & 0x1000 != 0 {
                FLAG_H
            } else {
                0
            }
            | if (hl as u32 + val as u32) > 0xFFFF {
                FLAG_C
            } else {
                0
            };
        self.set_hl(res);
        self.tick(mmu, 1);
    }

    /// SP + signed offset, with the byte-wise flag rules shared by
    /// ADD SP,e and LD HL,SP+e.
    fn add_sp_offset(&mut self, offset: u8) -> u16 {
        let val = offset as i8 as i16 as u16;
        let sp = self.sp;
        self.f = if ((sp & 0x0F) + (val & 0x0F)) > 0x0F {
            FLAG_H
        } else {
            0
        } | if ((sp & 0xFF) + (val & 0xFF)) > 0xFF {
            FLAG_C
        } else {
            0
        };
        sp.wrapping_add(val)
    }

    // Rotate/shift helpers backing the CB table. Unlike the A-register
    // rotates in the main table, these set Z.

    fn rlc(&mut self, val: u8) -> u8 {
        let res = val.rotate_left(1);
        self.f = if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
        res
    }

    fn rrc(&mut self, val: u8) -> u8 {
        let res = val.rotate_right(1);
        self.f = if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
        res
    }

    fn rl(&mut self, val: u8) -> u8 {
        let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
        let res = (val << 1) | carry_in;
        self.f = if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
        res
    }

    fn rr(&mut self, val: u8) -> u8 {
        let carry_in: u8 = if self.f & FLAG_C != 0 { 0x80 } else { 0 };
        let res = (val >> 1) | carry_in;
        self.f = if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
        res
    }

    fn sla(&mut self, val: u8) -> u8 {
        let res = val << 1;
        self.f = if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
        res
    }

    fn sra(&mut self, val: u8) -> u8 {
        let res = (val >> 1) | (val & 0x80);
        self.f = if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
        res
    }

    fn swap(&mut self, val: u8) -> u8 {
        let res = val.rotate_left(4);
        self.f = if res == 0 { FLAG_Z } else { 0 };
        res
    }

    fn srl(&mut self, val: u8) -> u8 {
        let res = val >> 1;
        self.f = if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
        res
    }

    /// Read the register selected by the low three opcode bits. Index 6 is
    /// the (HL) memory operand and costs a machine cycle.
    fn read_reg(&mut self, mmu: &mut crate::mmu::Mmu, index: u8) -> u8 {
        match index {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(mmu, self.get_hl()),
            7 => self.a,
            _ => unreachable!(),
        }
    }

    fn write_reg(&mut self, mmu: &mut crate::mmu::Mmu, index: u8, val: u8) {
        match index {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, val);
            }
            7 => self.a = val,
            _ => unreachable!(),
        }
    }

    fn handle_cb(&mut self, opcode: u8, mmu: &mut crate::mmu::Mmu) {
        let r = opcode & 0x07;
        match opcode {
            0x00..=0x07 => {
                let val = self.read_reg(mmu, r);
                let res = self.rlc(val);
                self.write_reg(mmu, r, res);
            }
            0x08..=0x0F => {
                let val = self.read_reg(mmu, r);
                let res = self.rrc(val);
                self.write_reg(mmu, r, res);
            }
            0x10..=0x17 => {
                let val = self.read_reg(mmu, r);
                let res = self.rl(val);
                self.write_reg(mmu, r, res);
            }
            0x18..=0x1F => {
                let val = self.read_reg(mmu, r);
                let res = self.rr(val);
                self.write_reg(mmu, r, res);
            }
            0x20..=0x27 => {
                let val = self.read_reg(mmu, r);
                let res = self.sla(val);
                self.write_reg(mmu, r, res);
            }
            0x28..=0x2F => {
                let val = self.read_reg(mmu, r);
                let res = self.sra(val);
                self.write_reg(mmu, r, res);
            }
            0x30..=0x37 => {
                let val = self.read_reg(mmu, r);
                let res = self.swap(val);
                self.write_reg(mmu, r, res);
            }
            0x38..=0x3F => {
                let val = self.read_reg(mmu, r);
                let res = self.srl(val);
                self.write_reg(mmu, r, res);
            }
            0x40..=0x7F => {
                // BIT only reads; no writeback even for (HL).
                let bit = (opcode - 0x40) >> 3;
                let val = self.read_reg(mmu, r);
                self.f = (self.f & FLAG_C)
                    | FLAG_H
                    | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
            }
            0x80..=0xBF => {
                let bit = (opcode - 0x80) >> 3;
                let val = self.read_reg(mmu, r) & !(1 << bit);
                self.write_reg(mmu, r, val);
            }
            0xC0..=0xFF => {
                let bit = (opcode - 0xC0) >> 3;
                let val = self.read_reg(mmu, r) | (1 << bit);
                self.write_reg(mmu, r, val);
            }
        }
    }

    fn handle_interrupts(&mut self, mmu: &mut crate::mmu::Mmu) {
        let pending = (mmu.if_reg & mmu.ie_reg) & 0x1F;
        if pending == 0 {
            return;
        }

        if self.ime {
            let (initial_bit, _) = Self::next_interrupt(pending);
            let mut return_pc = self.pc;

            if let Some(halt_pc) = self.halt_pc {
                if (self.halt_pending & initial_bit) != 0 {
                    // The interrupt was already pending when HALT ran inside
                    // an EI window; the handler returns to the HALT itself.
                    return_pc = halt_pc.wrapping_sub(1);
                } else if self.halted {
                    return_pc = halt_pc;
                }
            }

            self.ime = false;

            // Interrupt entry pushes the return address onto the stack.
            // If the upper-byte push targets IE (0xFFFF), the write can change
            // which interrupt is dispatched, or cancel dispatch entirely, so
            // IE/IF are re-read between the two pushes as on hardware.

            self.sp = self.sp.wrapping_sub(1);
            self.write8(mmu, self.sp, (return_pc >> 8) as u8);

            let queue = (mmu.ie_reg & mmu.if_reg) & 0x1F;
            if queue == 0 {
                // Dispatch cancelled; the lower-byte push still happens and
                // control falls through to address 0.
                self.sp = self.sp.wrapping_sub(1);
                self.write8(mmu, self.sp, return_pc as u8);

                self.exit_halt();
                self.pc = 0;
                self.tick(mmu, 3);
                return;
            }

            let (bit, vector) = Self::next_interrupt(queue);
            mmu.if_reg &= !bit;

            self.sp = self.sp.wrapping_sub(1);
            self.write8(mmu, self.sp, return_pc as u8);

            if (self.halt_pending & bit) != 0 {
                self.halt_pending &= !bit;
            } else {
                self.exit_halt();
            }

            cpu_trace!("[INT] vector={vector:02X} {}", self.debug_state());
            self.pc = vector;
            self.tick(mmu, 3);
        } else if self.halted {
            self.exit_halt();
        }
    }

    pub fn step(&mut self, mmu: &mut crate::mmu::Mmu) {
        if self.locked {
            // Fetch is permanently suspended; time still passes.
            self.tick(mmu, 1);
            return;
        }

        if self.halted {
            self.tick(mmu, 1);
            self.handle_interrupts(mmu);
            return;
        }

        let enable_after = self.ime_enable_delay == 1;
        let opcode = if self.halt_bug {
            // The program counter fails to advance, so the byte after HALT
            // executes twice.
            self.halt_bug = false;
            self.read8(mmu, self.pc)
        } else {
            self.fetch8(mmu)
        };
        match opcode {
            0x00 => {}
            0x01 => {
                let val = self.fetch16(mmu);
                self.set_bc(val);
            }
            0x02 => {
                let addr = self.get_bc();
                self.write8(mmu, addr, self.a);
            }
            0x03 => {
                let val = self.get_bc().wrapping_add(1);
                self.set_bc(val);
                self.tick(mmu, 1);
            }
            0x04 => self.b = self.inc8(self.b),
            0x05 => self.b = self.dec8(self.b),
            0x06 => {
                let val = self.fetch8(mmu);
                self.b = val;
            }
            0x07 => {
                let carry = (self.a & 0x80) != 0;
                self.a = self.a.rotate_left(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x08 => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, (self.sp & 0xFF) as u8);
                self.write8(mmu, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x09 => {
                let val = self.get_bc();
                self.add_hl(mmu, val);
            }
            0x0A => {
                let addr = self.get_bc();
                self.a = self.read8(mmu, addr);
            }
            0x0B => {
                let val = self.get_bc().wrapping_sub(1);
                self.set_bc(val);
                self.tick(mmu, 1);
            }
            0x0C => self.c = self.inc8(self.c),
            0x0D => self.c = self.dec8(self.c),
            0x0E => {
                let val = self.fetch8(mmu);
                self.c = val;
            }
            0x0F => {
                let carry = (self.a & 0x01) != 0;
                self.a = self.a.rotate_right(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x10 => {
                // STOP. The padding byte is consumed and the divider
                // restarts; the core then waits like HALT until an enabled
                // interrupt arrives.
                let _ = self.fetch8(mmu);
                mmu.reset_div();
                self.enter_halt(self.pc, 0);
            }
            0x11 => {
                let val = self.fetch16(mmu);
                self.set_de(val);
            }
            0x12 => {
                let addr = self.get_de();
                self.write8(mmu, addr, self.a);
            }
            0x13 => {
                let val = self.get_de().wrapping_add(1);
                self.set_de(val);
                self.tick(mmu, 1);
            }
            0x14 => self.d = self.inc8(self.d),
            0x15 => self.d = self.dec8(self.d),
            0x16 => {
                let val = self.fetch8(mmu);
                self.d = val;
            }
            0x17 => {
                let carry = (self.a & 0x80) != 0;
                self.a = (self.a << 1) | if self.f & FLAG_C != 0 { 1 } else { 0 };
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x18 => {
                let offset = self.fetch8(mmu) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
                self.tick(mmu, 1);
            }
            0x19 => {
                let val = self.get_de();
                self.add_hl(mmu, val);
            }
            0x1A => {
                let addr = self.get_de();
                self.a = self.read8(mmu, addr);
            }
            0x1B => {
                let val = self.get_de().wrapping_sub(1);
                self.set_de(val);
                self.tick(mmu, 1);
            }
            0x1C => self.e = self.inc8(self.e),
            0x1D => self.e = self.dec8(self.e),
            0x1E => {
                let val = self.fetch8(mmu);
                self.e = val;
            }
            0x1F => {
                let carry = (self.a & 0x01) != 0;
                self.a = (self.a >> 1) | if self.f & FLAG_C != 0 { 0x80 } else { 0 };
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x20 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_Z == 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x21 => {
                let val = self.fetch16(mmu);
                self.set_hl(val);
            }
            0x22 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, self.a);
                self.set_hl(addr.wrapping_add(1));
            }
            0x23 => {
                let val = self.get_hl().wrapping_add(1);
                self.set_hl(val);
                self.tick(mmu, 1);
            }
            0x24 => self.h = self.inc8(self.h),
            0x25 => self.h = self.dec8(self.h),
            0x26 => {
                let val = self.fetch8(mmu);
                self.h = val;
            }
            0x27 => {
                // DAA: adjust A back to packed BCD after an add or subtract.
                let mut correction = 0u8;
                let mut carry = false;
                if self.f & FLAG_H != 0 || (self.f & FLAG_N == 0 && (self.a & 0x0F) > 9) {
                    correction |= 0x06;
                }
                if self.f & FLAG_C != 0 || (self.f & FLAG_N == 0 && self.a > 0x99) {
                    correction |= 0x60;
                    carry = true;
                }
                if self.f & FLAG_N == 0 {
                    self.a = self.a.wrapping_add(correction);
                } else {
                    self.a = self.a.wrapping_sub(correction);
                }
                self.f = if self.a == 0 { FLAG_Z } else { 0 }
                    | (self.f & FLAG_N)
                    | if carry { FLAG_C } else { 0 };
            }
            0x28 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_Z != 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x29 => {
                let val = self.get_hl();
                self.add_hl(mmu, val);
            }
            0x2A => {
                let addr = self.get_hl();
                self.a = self.read8(mmu, addr);
                self.set_hl(addr.wrapping_add(1));
            }
            0x2B => {
                let val = self.get_hl().wrapping_sub(1);
                self.set_hl(val);
                self.tick(mmu, 1);
            }
            0x2C => self.l = self.inc8(self.l),
            0x2D => self.l = self.dec8(self.l),
            0x2E => {
                let val = self.fetch8(mmu);
                self.l = val;
            }
            0x2F => {
                self.a ^= 0xFF;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            0x30 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_C == 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x31 => {
                self.sp = self.fetch16(mmu);
            }
            0x32 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, self.a);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x33 => {
                self.sp = self.sp.wrapping_add(1);
                self.tick(mmu, 1);
            }
            0x34 => {
                let addr = self.get_hl();
                let old = self.read8(mmu, addr);
                let val = self.inc8(old);
                self.write8(mmu, addr, val);
            }
            0x35 => {
                let addr = self.get_hl();
                let old = self.read8(mmu, addr);
                let val = self.dec8(old);
                self.write8(mmu, addr, val);
            }
            0x36 => {
                let val = self.fetch8(mmu);
                let addr = self.get_hl();
                self.write8(mmu, addr, val);
            }
            0x37 => {
                self.f = (self.f & FLAG_Z) | FLAG_C;
            }
            0x38 => {
                let offset = self.fetch8(mmu) as i8;
                if self.f & FLAG_C != 0 {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x39 => {
                let val = self.sp;
                self.add_hl(mmu, val);
            }
            0x3A => {
                let addr = self.get_hl();
                self.a = self.read8(mmu, addr);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x3B => {
                self.sp = self.sp.wrapping_sub(1);
                self.tick(mmu, 1);
            }
            0x3C => self.a = self.inc8(self.a),
            0x3D => self.a = self.dec8(self.a),
            0x3E => {
                let val = self.fetch8(mmu);
                self.a = val;
            }
            0x3F => {
                self.f = (self.f & FLAG_Z) | if self.f & FLAG_C != 0 { 0 } else { FLAG_C };
            }
            opcode @ 0x40..=0x7F if opcode != 0x76 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.write_reg(mmu, (opcode >> 3) & 0x07, val);
            }
            0x76 => {
                let pending = (mmu.if_reg & mmu.ie_reg) & 0x1F;
                if self.ime || pending == 0 {
                    self.enter_halt(self.pc, 0);
                } else if self.ime_enable_delay > 0 {
                    // HALT in the EI window with something already pending:
                    // the halt is entered, and the buffered sources get the
                    // return-to-HALT dispatch treatment.
                    self.enter_halt(self.pc, pending);
                } else {
                    self.halt_bug = true;
                    self.exit_halt();
                }
            }
            opcode @ 0x80..=0xBF => {
                let val = self.read_reg(mmu, opcode & 0x07);
                match (opcode >> 3) & 0x07 {
                    0 => self.add8(val),
                    1 => self.adc8(val),
                    2 => self.sub8(val),
                    3 => self.sbc8(val),
                    4 => self.and8(val),
                    5 => self.xor8(val),
                    6 => self.or8(val),
                    _ => self.cp8(val),
                }
            }
            0xC0 => {
                self.tick(mmu, 1);
                if self.f & FLAG_Z == 0 {
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                }
            }
            0xC1 => {
                let val = self.pop_stack(mmu);
                self.set_bc(val);
            }
            0xC2 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z == 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xC3 => {
                self.pc = self.fetch16(mmu);
                self.tick(mmu, 1);
            }
            0xC4 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z == 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xC5 => {
                let val = self.get_bc();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xC6 => {
                let val = self.fetch8(mmu);
                self.add8(val);
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let target = (opcode & 0x38) as u16;
                self.tick(mmu, 1);
                self.push_stack(mmu, self.pc);
                self.pc = target;
            }
            0xC8 => {
                self.tick(mmu, 1);
                if self.f & FLAG_Z != 0 {
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                }
            }
            0xC9 => {
                self.pc = self.pop_stack(mmu);
                self.tick(mmu, 1);
            }
            0xCA => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z != 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xCB => {
                let op = self.fetch8(mmu);
                self.handle_cb(op, mmu);
            }
            0xCC => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_Z != 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xCD => {
                let addr = self.fetch16(mmu);
                self.tick(mmu, 1);
                self.push_stack(mmu, self.pc);
                self.pc = addr;
            }
            0xCE => {
                let val = self.fetch8(mmu);
                self.adc8(val);
            }
            0xD0 => {
                self.tick(mmu, 1);
                if self.f & FLAG_C == 0 {
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                }
            }
            0xD1 => {
                let val = self.pop_stack(mmu);
                self.set_de(val);
            }
            0xD2 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C == 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xD4 => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C == 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xD5 => {
                let val = self.get_de();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xD6 => {
                let val = self.fetch8(mmu);
                self.sub8(val);
            }
            0xD8 => {
                self.tick(mmu, 1);
                if self.f & FLAG_C != 0 {
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                }
            }
            0xD9 => {
                // RETI enables IME immediately, without the EI delay.
                self.pc = self.pop_stack(mmu);
                self.ime = true;
                self.tick(mmu, 1);
            }
            0xDA => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C != 0 {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xDC => {
                let addr = self.fetch16(mmu);
                if self.f & FLAG_C != 0 {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            0xDE => {
                let val = self.fetch8(mmu);
                self.sbc8(val);
            }
            0xE0 => {
                let offset = self.fetch8(mmu);
                let addr = 0xFF00u16 | offset as u16;
                self.write8(mmu, addr, self.a);
            }
            0xE1 => {
                let val = self.pop_stack(mmu);
                self.set_hl(val);
            }
            0xE2 => {
                let addr = 0xFF00u16 | self.c as u16;
                self.write8(mmu, addr, self.a);
            }
            0xE5 => {
                let val = self.get_hl();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xE6 => {
                let val = self.fetch8(mmu);
                self.and8(val);
            }
            0xE8 => {
                let offset = self.fetch8(mmu);
                self.sp = self.add_sp_offset(offset);
                self.tick(mmu, 2);
            }
            0xE9 => {
                self.pc = self.get_hl();
            }
            0xEA => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, self.a);
            }
            0xEE => {
                let val = self.fetch8(mmu);
                self.xor8(val);
            }
            0xF0 => {
                let offset = self.fetch8(mmu);
                let addr = 0xFF00u16 | offset as u16;
                self.a = self.read8(mmu, addr);
            }
            0xF1 => {
                let val = self.pop_stack(mmu);
                self.a = (val >> 8) as u8;
                // The low nibble of F does not exist in hardware.
                self.f = (val as u8) & 0xF0;
            }
            0xF2 => {
                let addr = 0xFF00u16 | self.c as u16;
                self.a = self.read8(mmu, addr);
            }
            0xF3 => {
                self.ime = false;
                self.ime_enable_delay = 0;
            }
            0xF5 => {
                let val = ((self.a as u16) << 8) | (self.f as u16 & 0xF0);
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xF6 => {
                let val = self.fetch8(mmu);
                self.or8(val);
            }
            0xF8 => {
                let offset = self.fetch8(mmu);
                let res = self.add_sp_offset(offset);
                self.set_hl(res);
                self.tick(mmu, 1);
            }
            0xF9 => {
                self.sp = self.get_hl();
                self.tick(mmu, 1);
            }
            0xFA => {
                let addr = self.fetch16(mmu);
                self.a = self.read8(mmu, addr);
            }
            0xFB => {
                self.ime_enable_delay = 2;
            }
            0xFE => {
                let val = self.fetch8(mmu);
                self.cp8(val);
            }
            _ => {
                // 0xD3/0xDB/0xDD/0xE3/0xE4/0xEB/0xEC/0xED/0xF4/0xFC/0xFD have
                // no decode; hardware wedges until power cycle.
                log::warn!(
                    "undefined opcode {opcode:02X} at {:04X}, CPU locked",
                    self.pc.wrapping_sub(1)
                );
                cpu_trace!("[LOCK] {}", self.debug_state());
                self.locked = true;
            }
        }

        if enable_after && self.ime_enable_delay > 0 {
            self.ime = true;
        }
        if self.ime_enable_delay > 0 {
            self.ime_enable_delay -= 1;
        }
        self.handle_interrupts(mmu);
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
