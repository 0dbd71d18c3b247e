use std::collections::VecDeque;

use bincode::{Decode, Encode};

const CPU_CLOCK_HZ: u32 = 4_194_304;
const VOLUME_FACTOR: i16 = 64;

// Cap on queued stereo samples before the oldest are discarded. At 48 kHz
// this is roughly a quarter second of backlog.
const MAX_SAMPLES: usize = 1024 * 12;

/// Post-boot contents of 0xFF10-0xFF2F.
const POWER_ON_REGS: [u8; 0x30] = [
    0x80, 0xBF, 0xF3, 0xFF, 0xBF, 0xFF, 0x3F, 0x00, 0xFF, 0xBF, 0x7F, 0xFF, 0x9F, 0xFF, 0xBF, 0xFF,
    0xFF, 0x00, 0x00, 0xBF, 0x77, 0xF3, 0xF1, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// OR masks applied to register reads; write-only bits read back as 1.
const READ_MASKS: [u8; 0x30] = [
    0x80, 0x3F, 0x00, 0xFF, 0xBF, // NR10-NR14
    0xFF, 0x3F, 0x00, 0xFF, 0xBF, // 0xFF15, NR21-NR24
    0x7F, 0xFF, 0x9F, 0xFF, 0xBF, // NR30-NR34
    0xFF, 0xFF, 0x00, 0x00, 0xBF, // 0xFF1F, NR41-NR44
    0x00, 0x00, 0x70, // NR50-NR52
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // 0xFF27-0xFF2F
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // wave RAM
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 1], // 12.5%
    [1, 0, 0, 0, 0, 0, 0, 1], // 25%
    [1, 0, 0, 0, 0, 1, 1, 1], // 50%
    [0, 1, 1, 1, 1, 1, 1, 0], // 75%
];

#[cfg(feature = "apu-trace")]
macro_rules! apu_trace {
    ($($arg:tt)*) => { println!($($arg)*) };
}
#[cfg(not(feature = "apu-trace"))]
macro_rules! apu_trace {
    ($($arg:tt)*) => {};
}

#[derive(Default, Clone, Copy, Encode, Decode)]
struct Envelope {
    initial: u8,
    period: u8,
    add: bool,
    volume: u8,
    timer: u8,
}

impl Envelope {
    fn reset(&mut self, val: u8) {
        self.initial = val >> 4;
        self.add = val & 0x08 != 0;
        self.period = val & 0x07;
        self.volume = self.initial;
        self.timer = if self.period == 0 { 8 } else { self.period };
    }

    /// Runs on sequencer step 7. A zero period keeps the timer cycling but
    /// never moves the volume.
    fn clock(&mut self) {
        if self.timer > 0 {
            self.timer -= 1;
        }
        if self.timer == 0 {
            self.timer = if self.period == 0 { 8 } else { self.period };
            if self.period != 0 {
                if self.add && self.volume < 15 {
                    self.volume += 1;
                } else if !self.add && self.volume > 0 {
                    self.volume -= 1;
                }
            }
        }
    }

    /// Writing NRx2 while the channel runs nudges the live volume instead
    /// of waiting for the next trigger ("zombie mode").
    fn zombie_update(&mut self, old_val: u8, val: u8) {
        if old_val & 0x07 == 0 {
            self.volume = self.volume.wrapping_add(1);
        } else if old_val & 0x08 == 0 {
            self.volume = self.volume.wrapping_add(2);
        }
        if (old_val ^ val) & 0x08 != 0 {
            self.volume = 0x10u8.wrapping_sub(self.volume);
        }
        self.volume &= 0x0F;
        self.initial = val >> 4;
        self.add = val & 0x08 != 0;
        self.period = val & 0x07;
    }
}

#[derive(Default, Clone, Copy, Encode, Decode)]
struct Sweep {
    period: u8,
    negate: bool,
    shift: u8,
    timer: u8,
    enabled: bool,
    shadow: u16,
    /// A negate-mode calculation has run since the last trigger; clearing
    /// the negate bit afterwards kills the channel.
    neg_used: bool,
}

impl Sweep {
    /// Returns true when the write should disable the channel.
    fn set_params(&mut self, val: u8) -> bool {
        let was_negate = self.negate;
        self.period = (val >> 4) & 0x07;
        self.negate = val & 0x08 != 0;
        self.shift = val & 0x07;
        was_negate && !self.negate && self.neg_used
    }

    fn reload(&mut self, frequency: u16) {
        self.shadow = frequency;
        self.timer = if self.period == 0 { 8 } else { self.period };
        self.enabled = self.period != 0 || self.shift != 0;
        self.neg_used = false;
    }

    /// Next frequency from the shadow register. Values above 2047 signal
    /// overflow; the caller disables the channel.
    fn calculate(&mut self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.neg_used = true;
            self.shadow - delta
        } else {
            self.shadow + delta
        }
    }
}

#[derive(Clone, Encode, Decode)]
struct SquareChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u8,
    length_enable: bool,
    duty: u8,
    duty_pos: u8,
    frequency: u16,
    timer: i32,
    envelope: Envelope,
    sweep: Option<Sweep>,
}

impl SquareChannel {
    fn new(with_sweep: bool) -> Self {
        SquareChannel {
            enabled: false,
            dac_enabled: false,
            length: 0,
            length_enable: false,
            duty: 0,
            duty_pos: 0,
            frequency: 0,
            timer: 0,
            envelope: Envelope::default(),
            sweep: with_sweep.then(Sweep::default),
        }
    }

    fn period(&self) -> i32 {
        ((2048 - self.frequency) as i32) * 4
    }

    fn step(&mut self, cycles: i32) {
        if !self.enabled {
            return;
        }
        self.timer -= cycles;
        while self.timer <= 0 {
            self.timer += self.period();
            self.duty_pos = (self.duty_pos + 1) & 7;
        }
    }

    fn output(&self) -> u8 {
        if self.enabled && self.dac_enabled {
            DUTY_TABLE[self.duty as usize][self.duty_pos as usize] * self.envelope.volume
        } else {
            0
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn clock_sweep(&mut self) {
        let Some(sweep) = self.sweep.as_mut() else {
            return;
        };
        if sweep.timer > 0 {
            sweep.timer -= 1;
        }
        if sweep.timer != 0 {
            return;
        }
        sweep.timer = if sweep.period == 0 { 8 } else { sweep.period };
        if !sweep.enabled || sweep.period == 0 {
            return;
        }
        let freq = sweep.calculate();
        if freq > 2047 {
            self.enabled = false;
        } else if sweep.shift != 0 {
            sweep.shadow = freq;
            self.frequency = freq;
            // The overflow check runs again with the written-back value;
            // its result is discarded.
            if sweep.calculate() > 2047 {
                self.enabled = false;
            }
        }
    }
}

#[derive(Clone, Encode, Decode)]
struct WaveChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    volume_code: u8,
    frequency: u16,
    timer: i32,
    position: u8,
    /// Byte latched at the most recent wave RAM fetch.
    last_sample: u8,
}

impl WaveChannel {
    fn new() -> Self {
        WaveChannel {
            enabled: false,
            dac_enabled: false,
            length: 0,
            length_enable: false,
            volume_code: 0,
            frequency: 0,
            timer: 0,
            position: 0,
            last_sample: 0,
        }
    }

    fn period(&self) -> i32 {
        ((2048 - self.frequency) as i32) * 2
    }

    fn step(&mut self, cycles: i32, wave_ram: &[u8; 0x10]) {
        if !self.enabled {
            return;
        }
        self.timer -= cycles;
        while self.timer <= 0 {
            self.timer += self.period();
            self.position = (self.position + 1) & 0x1F;
            self.last_sample = wave_ram[(self.position >> 1) as usize];
        }
    }

    fn output(&self) -> u8 {
        if !(self.enabled && self.dac_enabled) {
            return 0;
        }
        let sample = if self.position & 1 == 0 {
            self.last_sample >> 4
        } else {
            self.last_sample & 0x0F
        };
        match self.volume_code {
            0 => 0,
            1 => sample,
            2 => sample >> 1,
            _ => sample >> 2,
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }
}

#[derive(Clone, Encode, Decode)]
struct NoiseChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u8,
    length_enable: bool,
    clock_shift: u8,
    width_7bit: bool,
    divisor_code: u8,
    lfsr: u16,
    timer: i32,
    envelope: Envelope,
}

impl NoiseChannel {
    fn new() -> Self {
        NoiseChannel {
            enabled: false,
            dac_enabled: false,
            length: 0,
            length_enable: false,
            clock_shift: 0,
            width_7bit: false,
            divisor_code: 0,
            lfsr: 0,
            timer: 0,
            envelope: Envelope::default(),
        }
    }

    fn period(&self) -> i32 {
        let divisor = if self.divisor_code == 0 {
            8
        } else {
            (self.divisor_code as i32) * 16
        };
        divisor << self.clock_shift
    }

    fn step(&mut self, cycles: i32) {
        if !self.enabled {
            return;
        }
        // Shift clocks of 14 and above park the LFSR entirely.
        if self.clock_shift >= 14 {
            return;
        }
        self.timer -= cycles;
        while self.timer <= 0 {
            self.timer += self.period();
            self.clock_lfsr();
        }
    }

    fn clock_lfsr(&mut self) {
        // XNOR of the low two bits feeds bit 14 (and bit 6 in short mode).
        let feedback = !(self.lfsr ^ (self.lfsr >> 1)) & 1;
        self.lfsr = (self.lfsr >> 1) | (feedback << 14);
        if self.width_7bit {
            self.lfsr = (self.lfsr & !0x40) | (feedback << 6);
        }
    }

    fn output(&self) -> u8 {
        if self.enabled && self.dac_enabled && self.lfsr & 1 != 0 {
            self.envelope.volume
        } else {
            0
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }
}

#[derive(Default, Clone, Copy, Encode, Decode)]
struct FrameSequencer {
    /// Step that will run on the next divider edge.
    step: u8,
}

impl FrameSequencer {
    fn advance(&mut self) -> u8 {
        let step = self.step;
        self.step = (step + 1) & 7;
        step
    }
}

/// Four-channel sound unit.
///
/// Channels run on the CPU clock. The length/envelope/sweep sequencer is
/// clocked by falling edges of divider bit 12, so a divider reset can land
/// an early tick. Mixed stereo output is resampled to `sample_rate` and
/// queued until the frontend drains it.
#[derive(Encode, Decode)]
pub struct Apu {
    ch1: SquareChannel,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,
    wave_ram: [u8; 0x10],
    regs: [u8; 0x30],
    nr50: u8,
    nr51: u8,
    power: bool,
    sequencer: FrameSequencer,
    sample_timer: u32,
    sample_rate: u32,
    samples: VecDeque<i16>,
    hp_coef: f32,
    hp_sum_left: f32,
    hp_sum_right: f32,
}

impl Apu {
    pub fn new() -> Self {
        let mut apu = Apu {
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::new(),
            ch4: NoiseChannel::new(),
            wave_ram: [0; 0x10],
            regs: POWER_ON_REGS,
            nr50: 0x77,
            nr51: 0xF3,
            power: true,
            sequencer: FrameSequencer::default(),
            sample_timer: 0,
            sample_rate: 0,
            samples: VecDeque::with_capacity(4096),
            hp_coef: 0.0,
            hp_sum_left: 0.0,
            hp_sum_right: 0.0,
        };
        // The boot ROM leaves channel 1 on, playing the chime tail.
        apu.ch1.enabled = true;
        apu.ch1.dac_enabled = true;
        apu.ch1.duty = 2;
        apu.ch1.frequency = 0x07C1;
        apu.ch1.envelope.reset(0xF3);
        apu.ch1.envelope.volume = 0;
        apu.set_sample_rate(48_000);
        apu
    }

    /// Output rate in Hz; also derives the DC-blocking filter constant.
    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate.max(1);
        self.hp_coef = 0.999958_f32.powf(CPU_CLOCK_HZ as f32 / self.sample_rate as f32);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Drain all queued samples, interleaved left then right.
    pub fn take_samples(&mut self) -> Vec<i16> {
        self.samples.drain(..).collect()
    }

    pub fn pop_sample(&mut self) -> Option<(i16, i16)> {
        let left = self.samples.pop_front()?;
        let right = self.samples.pop_front()?;
        Some((left, right))
    }

    pub fn queued_samples(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF26 => {
                let mut val = 0x70;
                if self.power {
                    val |= 0x80;
                }
                if self.ch1.enabled {
                    val |= 0x01;
                }
                if self.ch2.enabled {
                    val |= 0x02;
                }
                if self.ch3.enabled {
                    val |= 0x04;
                }
                if self.ch4.enabled {
                    val |= 0x08;
                }
                val
            }
            0xFF30..=0xFF3F => {
                // Wave RAM is unreadable while the channel plays.
                if self.ch3.enabled {
                    0xFF
                } else {
                    self.wave_ram[(addr - 0xFF30) as usize]
                }
            }
            0xFF10..=0xFF2F => {
                let idx = (addr - 0xFF10) as usize;
                self.regs[idx] | READ_MASKS[idx]
            }
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        if !self.power && addr != 0xFF26 && !(0xFF30..=0xFF3F).contains(&addr) {
            // Registers are inert while powered off, but length counters
            // still load.
            match addr {
                0xFF11 => self.ch1.length = 64 - (val & 0x3F),
                0xFF16 => self.ch2.length = 64 - (val & 0x3F),
                0xFF1B => self.ch3.length = 256 - val as u16,
                0xFF20 => self.ch4.length = 64 - (val & 0x3F),
                _ => {}
            }
            return;
        }

        let old_val = if (0xFF10..=0xFF2F).contains(&addr) {
            let idx = (addr - 0xFF10) as usize;
            let old = self.regs[idx];
            self.regs[idx] = val;
            old
        } else {
            0
        };

        match addr {
            0xFF10 => {
                if let Some(sweep) = self.ch1.sweep.as_mut()
                    && sweep.set_params(val)
                {
                    self.ch1.enabled = false;
                }
            }
            0xFF11 => {
                self.ch1.duty = val >> 6;
                self.ch1.length = 64 - (val & 0x3F);
            }
            0xFF12 => {
                if self.ch1.enabled {
                    self.ch1.envelope.zombie_update(old_val, val);
                } else {
                    self.ch1.envelope.reset(val);
                }
                self.ch1.dac_enabled = val & 0xF8 != 0;
                if !self.ch1.dac_enabled {
                    self.ch1.enabled = false;
                }
            }
            0xFF13 => {
                self.ch1.frequency = (self.ch1.frequency & 0x0700) | val as u16;
            }
            0xFF14 => {
                self.ch1.frequency = (self.ch1.frequency & 0x00FF) | ((val as u16 & 0x07) << 8);
                let was_enabled = self.ch1.length_enable;
                self.ch1.length_enable = val & 0x40 != 0;
                if !was_enabled && self.ch1.length_enable && self.extra_length_clock() {
                    self.ch1.clock_length();
                }
                if val & 0x80 != 0 {
                    self.trigger_ch1();
                }
            }

            0xFF16 => {
                self.ch2.duty = val >> 6;
                self.ch2.length = 64 - (val & 0x3F);
            }
            0xFF17 => {
                if self.ch2.enabled {
                    self.ch2.envelope.zombie_update(old_val, val);
                } else {
                    self.ch2.envelope.reset(val);
                }
                self.ch2.dac_enabled = val & 0xF8 != 0;
                if !self.ch2.dac_enabled {
                    self.ch2.enabled = false;
                }
            }
            0xFF18 => {
                self.ch2.frequency = (self.ch2.frequency & 0x0700) | val as u16;
            }
            0xFF19 => {
                self.ch2.frequency = (self.ch2.frequency & 0x00FF) | ((val as u16 & 0x07) << 8);
                let was_enabled = self.ch2.length_enable;
                self.ch2.length_enable = val & 0x40 != 0;
                if !was_enabled && self.ch2.length_enable && self.extra_length_clock() {
                    self.ch2.clock_length();
                }
                if val & 0x80 != 0 {
                    self.trigger_ch2();
                }
            }

            0xFF1A => {
                self.ch3.dac_enabled = val & 0x80 != 0;
                if !self.ch3.dac_enabled {
                    self.ch3.enabled = false;
                }
            }
            0xFF1B => {
                self.ch3.length = 256 - val as u16;
            }
            0xFF1C => {
                self.ch3.volume_code = (val >> 5) & 0x03;
            }
            0xFF1D => {
                self.ch3.frequency = (self.ch3.frequency & 0x0700) | val as u16;
            }
            0xFF1E => {
                self.ch3.frequency = (self.ch3.frequency & 0x00FF) | ((val as u16 & 0x07) << 8);
                let was_enabled = self.ch3.length_enable;
                self.ch3.length_enable = val & 0x40 != 0;
                if !was_enabled && self.ch3.length_enable && self.extra_length_clock() {
                    self.ch3.clock_length();
                }
                if val & 0x80 != 0 {
                    self.trigger_ch3();
                }
            }

            0xFF20 => {
                self.ch4.length = 64 - (val & 0x3F);
            }
            0xFF21 => {
                if self.ch4.enabled {
                    self.ch4.envelope.zombie_update(old_val, val);
                } else {
                    self.ch4.envelope.reset(val);
                }
                self.ch4.dac_enabled = val & 0xF8 != 0;
                if !self.ch4.dac_enabled {
                    self.ch4.enabled = false;
                }
            }
            0xFF22 => {
                self.ch4.clock_shift = val >> 4;
                self.ch4.divisor_code = val & 0x07;
                let was_7bit = self.ch4.width_7bit;
                self.ch4.width_7bit = val & 0x08 != 0;
                // Narrowing the LFSR while its low bits are all set locks
                // the XNOR feedback; the channel then holds a constant.
                if !was_7bit && self.ch4.width_7bit && self.ch4.lfsr & 0x7F == 0x7F {
                    self.ch4.lfsr |= 0x7F80;
                }
            }
            0xFF23 => {
                let was_enabled = self.ch4.length_enable;
                self.ch4.length_enable = val & 0x40 != 0;
                if !was_enabled && self.ch4.length_enable && self.extra_length_clock() {
                    self.ch4.clock_length();
                }
                if val & 0x80 != 0 {
                    self.trigger_ch4();
                }
            }

            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            0xFF26 => {
                let was_on = self.power;
                self.power = val & 0x80 != 0;
                if was_on && !self.power {
                    apu_trace!("APU power off");
                    self.power_off();
                } else if !was_on && self.power {
                    apu_trace!("APU power on");
                    self.sequencer.step = 0;
                }
            }
            0xFF30..=0xFF3F => {
                // Writes are dropped while the channel plays.
                if !self.ch3.enabled {
                    self.wave_ram[(addr - 0xFF30) as usize] = val;
                }
            }
            _ => {}
        }
    }

    /// True when an NRx4 length-enable write clocks the counter once
    /// immediately.
    fn extra_length_clock(&self) -> bool {
        !matches!((self.sequencer.step + 1) & 7, 0 | 2 | 4 | 6)
    }

    /// True when a trigger that reloads an expired length counter loads
    /// max - 1 instead of max.
    fn trigger_length_quirk(&self, length_enable: bool) -> bool {
        length_enable && matches!(self.sequencer.step, 0 | 2 | 4 | 6)
    }

    /// Envelope timers start one tick long when the upcoming sequencer
    /// step is the envelope step.
    fn envelope_timer_reload(&self, period: u8) -> u8 {
        let mut timer = if period == 0 { 8 } else { period };
        if (self.sequencer.step + 1) & 7 == 7 {
            timer += 1;
        }
        timer
    }

    fn trigger_ch1(&mut self) {
        apu_trace!("trigger ch1 freq={:04X}", self.ch1.frequency);
        self.ch1.enabled = self.ch1.dac_enabled;
        self.ch1.timer = self.ch1.period();
        self.ch1.envelope.volume = self.ch1.envelope.initial;
        self.ch1.envelope.timer = self.envelope_timer_reload(self.ch1.envelope.period);
        if self.ch1.length == 0 {
            self.ch1.length = 64;
            if self.trigger_length_quirk(self.ch1.length_enable) {
                self.ch1.length = 63;
            }
        }
        let frequency = self.ch1.frequency;
        if let Some(sweep) = self.ch1.sweep.as_mut() {
            sweep.reload(frequency);
            // The first overflow check runs at trigger time without
            // writing the result back.
            if sweep.shift != 0 && sweep.calculate() > 2047 {
                self.ch1.enabled = false;
            }
        }
    }

    fn trigger_ch2(&mut self) {
        apu_trace!("trigger ch2 freq={:04X}", self.ch2.frequency);
        self.ch2.enabled = self.ch2.dac_enabled;
        self.ch2.timer = self.ch2.period();
        self.ch2.envelope.volume = self.ch2.envelope.initial;
        self.ch2.envelope.timer = self.envelope_timer_reload(self.ch2.envelope.period);
        if self.ch2.length == 0 {
            self.ch2.length = 64;
            if self.trigger_length_quirk(self.ch2.length_enable) {
                self.ch2.length = 63;
            }
        }
    }

    fn trigger_ch3(&mut self) {
        apu_trace!("trigger ch3 freq={:04X}", self.ch3.frequency);
        // Retriggering a running wave channel right before a fetch
        // corrupts the start of wave RAM.
        if self.ch3.enabled && self.ch3.timer <= 2 {
            let fetch = (((self.ch3.position + 1) & 0x1F) >> 1) as usize;
            if fetch < 4 {
                self.wave_ram[0] = self.wave_ram[fetch];
            } else {
                let base = fetch & !3;
                let block = [
                    self.wave_ram[base],
                    self.wave_ram[base + 1],
                    self.wave_ram[base + 2],
                    self.wave_ram[base + 3],
                ];
                self.wave_ram[..4].copy_from_slice(&block);
            }
        }
        self.ch3.enabled = self.ch3.dac_enabled;
        self.ch3.position = 0;
        self.ch3.timer = self.ch3.period();
        if self.ch3.length == 0 {
            self.ch3.length = 256;
            if self.trigger_length_quirk(self.ch3.length_enable) {
                self.ch3.length = 255;
            }
        }
    }

    fn trigger_ch4(&mut self) {
        apu_trace!("trigger ch4 shift={}", self.ch4.clock_shift);
        self.ch4.enabled = self.ch4.dac_enabled;
        self.ch4.timer = self.ch4.period();
        // Cleared, not seeded; the XNOR feedback walks it out of zero.
        self.ch4.lfsr = 0;
        self.ch4.envelope.volume = self.ch4.envelope.initial;
        self.ch4.envelope.timer = self.envelope_timer_reload(self.ch4.envelope.period);
        if self.ch4.length == 0 {
            self.ch4.length = 64;
            if self.trigger_length_quirk(self.ch4.length_enable) {
                self.ch4.length = 63;
            }
        }
    }

    fn power_off(&mut self) {
        // Length counters survive a power cycle; everything else clears.
        let lengths = (
            self.ch1.length,
            self.ch2.length,
            self.ch3.length,
            self.ch4.length,
        );
        self.ch1 = SquareChannel::new(true);
        self.ch2 = SquareChannel::new(false);
        self.ch3 = WaveChannel::new();
        self.ch4 = NoiseChannel::new();
        self.ch1.length = lengths.0;
        self.ch2.length = lengths.1;
        self.ch3.length = lengths.2;
        self.ch4.length = lengths.3;
        self.regs = [0; 0x30];
        self.nr50 = 0;
        self.nr51 = 0;
    }

    /// A divider write zeroes the counter; if bit 12 was high the implied
    /// falling edge clocks the sequencer early.
    pub fn notify_div_reset(&mut self, prev_div: u16) {
        if self.power && prev_div & 0x1000 != 0 {
            let step = self.sequencer.advance();
            self.clock_frame_sequencer(step);
        }
    }

    /// Advance `cycles` T-cycles. `prev_div` is the divider counter at the
    /// start of the window; sequencer edges are derived from it rather
    /// than from a free-running period counter.
    pub fn step(&mut self, prev_div: u16, cycles: u32) {
        let cps = CPU_CLOCK_HZ / self.sample_rate;
        for offset in 0..cycles {
            let div = prev_div.wrapping_add(offset as u16);
            let next = div.wrapping_add(1);
            if self.power && div & 0x1000 != 0 && next & 0x1000 == 0 {
                let step = self.sequencer.advance();
                self.clock_frame_sequencer(step);
            }

            self.ch1.step(1);
            self.ch2.step(1);
            self.ch3.step(1, &self.wave_ram);
            self.ch4.step(1);

            self.sample_timer += 1;
            if self.sample_timer >= cps {
                self.sample_timer = 0;
                let (left, right) = self.mix_output();
                self.push_sample(left, right);
            }
        }
    }

    fn clock_frame_sequencer(&mut self, step: u8) {
        if matches!(step, 0 | 2 | 4 | 6) {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if matches!(step, 2 | 6) {
            self.ch1.clock_sweep();
        }
        if step == 7 {
            self.ch1.envelope.clock();
            self.ch2.envelope.clock();
            self.ch4.envelope.clock();
        }
    }

    fn mix_output(&mut self) -> (i16, i16) {
        let outputs = [
            self.ch1.output(),
            self.ch2.output(),
            self.ch3.output(),
            self.ch4.output(),
        ];
        let dacs = [
            self.ch1.dac_enabled,
            self.ch2.dac_enabled,
            self.ch3.dac_enabled,
            self.ch4.dac_enabled,
        ];

        let mut left = 0i16;
        let mut right = 0i16;
        for (idx, (&out, &dac)) in outputs.iter().zip(dacs.iter()).enumerate() {
            if !dac {
                continue;
            }
            // An enabled DAC biases the line even when the channel is
            // silent, hence 8 - out rather than out.
            let signal = 8 - out as i16;
            if self.nr51 & (1 << (idx + 4)) != 0 {
                left += signal;
            }
            if self.nr51 & (1 << idx) != 0 {
                right += signal;
            }
        }

        let left_vol = ((self.nr50 >> 4) & 0x07) as i16 + 1;
        let right_vol = (self.nr50 & 0x07) as i16 + 1;
        self.dc_block(left * left_vol * VOLUME_FACTOR, right * right_vol * VOLUME_FACTOR)
    }

    /// Single-pole high-pass that strips the DAC bias while following
    /// slow drift.
    fn dc_block(&mut self, left: i16, right: i16) -> (i16, i16) {
        if !(self.ch1.dac_enabled
            || self.ch2.dac_enabled
            || self.ch3.dac_enabled
            || self.ch4.dac_enabled)
        {
            self.hp_sum_left = 0.0;
            self.hp_sum_right = 0.0;
            return (0, 0);
        }
        let out_left = left as f32 - self.hp_sum_left;
        let out_right = right as f32 - self.hp_sum_right;
        self.hp_sum_left = left as f32 - out_left * self.hp_coef;
        self.hp_sum_right = right as f32 - out_right * self.hp_coef;
        (out_left as i16, out_right as i16)
    }

    fn push_sample(&mut self, left: i16, right: i16) {
        self.samples.push_back(left);
        self.samples.push_back(right);
        while self.samples.len() > MAX_SAMPLES * 2 {
            self.samples.pop_front();
            self.samples.pop_front();
        }
    }

    /// Current frequency of channel 1, including sweep updates. The
    /// register file masks this off.
    pub fn ch1_frequency(&self) -> u16 {
        self.ch1.frequency
    }

    /// Current envelope volume of channel 1.
    pub fn ch1_volume(&self) -> u8 {
        self.ch1.envelope.volume
    }

    /// Current LFSR state of channel 4.
    pub fn ch4_lfsr(&self) -> u16 {
        self.ch4.lfsr
    }
}

impl Default for Apu {
    fn default() -> Self {
        Apu::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_apu() -> Apu {
        let mut apu = Apu::new();
        apu.write_reg(0xFF12, 0x00);
        apu
    }

    /// Run whole sequencer windows; each one lands exactly one falling
    /// edge of divider bit 12.
    fn run_windows(apu: &mut Apu, div: &mut u16, count: usize) {
        for _ in 0..count {
            apu.step(*div, 8192);
            *div = div.wrapping_add(8192);
        }
    }

    #[test]
    fn power_on_readback_is_masked() {
        let apu = Apu::new();
        assert_eq!(apu.read_reg(0xFF10), 0x80);
        assert_eq!(apu.read_reg(0xFF11), 0xBF);
        assert_eq!(apu.read_reg(0xFF13), 0xFF); // frequency low is write-only
        assert_eq!(apu.read_reg(0xFF24), 0x77);
        assert_eq!(apu.read_reg(0xFF25), 0xF3);
        assert_eq!(apu.read_reg(0xFF26), 0xF1);
    }

    #[test]
    fn length_counter_expires_and_clears_status() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF16, 0x3E); // length = 2
        apu.write_reg(0xFF17, 0xF0);
        // Enabling length clocks once right away (the upcoming step is not
        // a length step), so the first sequencer tick finishes the job.
        apu.write_reg(0xFF19, 0xC0);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x02);
        let mut div = 0u16;
        run_windows(&mut apu, &mut div, 1);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x00);
    }

    #[test]
    fn enabling_length_clocks_immediately() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF16, 0x3F); // length = 1
        apu.write_reg(0xFF17, 0xF0);
        apu.write_reg(0xFF19, 0x80); // trigger, length disabled
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x02);
        // No time passes; the enable write alone expires the counter.
        apu.write_reg(0xFF19, 0x40);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x00);
    }

    #[test]
    fn trigger_reloads_expired_length_to_63() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF17, 0xF0);
        // Length is 0 and the upcoming step clocks lengths, so the reload
        // lands at 63 rather than 64.
        apu.write_reg(0xFF19, 0xC0);
        let mut div = 0u16;
        run_windows(&mut apu, &mut div, 124);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x02);
        run_windows(&mut apu, &mut div, 1);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x00);
    }

    #[test]
    fn trigger_without_dac_leaves_channel_off() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF17, 0x00);
        apu.write_reg(0xFF19, 0x80);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x00);
    }

    #[test]
    fn sweep_overflow_disables_channel_on_trigger() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF10, 0x01); // shift 1, add
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF13, 0xFF);
        apu.write_reg(0xFF14, 0x87); // frequency 0x7FF, trigger
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x00);
    }

    #[test]
    fn sweep_raises_frequency_on_sequencer_steps() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF10, 0x11); // period 1, add, shift 1
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF13, 0x00);
        apu.write_reg(0xFF14, 0x81); // frequency 0x100, trigger
        assert_eq!(apu.ch1_frequency(), 0x100);
        let mut div = 0u16;
        // Sweep runs on steps 2 and 6.
        run_windows(&mut apu, &mut div, 3);
        assert_eq!(apu.ch1_frequency(), 0x180);
        run_windows(&mut apu, &mut div, 4);
        assert_eq!(apu.ch1_frequency(), 0x240);
    }

    #[test]
    fn envelope_decays_once_per_step_seven() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF12, 0xF1); // volume 15, decay, period 1
        apu.write_reg(0xFF13, 0x00);
        apu.write_reg(0xFF14, 0x80);
        assert_eq!(apu.ch1_volume(), 15);
        let mut div = 0u16;
        run_windows(&mut apu, &mut div, 8); // step 7 runs on the 8th window
        assert_eq!(apu.ch1_volume(), 14);
        run_windows(&mut apu, &mut div, 8);
        assert_eq!(apu.ch1_volume(), 13);
    }

    #[test]
    fn zombie_write_bumps_live_volume() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF17, 0x80); // volume 8, no period
        apu.write_reg(0xFF19, 0x80);
        assert_eq!(apu.ch2.envelope.volume, 8);
        apu.write_reg(0xFF17, 0x80);
        assert_eq!(apu.ch2.envelope.volume, 9);
    }

    #[test]
    fn power_off_clears_registers_but_keeps_lengths() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF16, 0x30); // ch2 length = 16
        apu.write_reg(0xFF24, 0x44);
        apu.write_reg(0xFF26, 0x00);
        assert_eq!(apu.read_reg(0xFF24), 0x00);
        assert_eq!(apu.read_reg(0xFF26) & 0x80, 0x00);
        // Writes are inert while off, except length loads.
        apu.write_reg(0xFF24, 0x77);
        assert_eq!(apu.read_reg(0xFF24), 0x00);
        apu.write_reg(0xFF26, 0x80);
        apu.write_reg(0xFF17, 0xF0);
        // Enable clocks 16 -> 15; expiry needs 15 more length steps, which
        // arrive every other window starting with the first.
        apu.write_reg(0xFF19, 0xC0);
        let mut div = 0u16;
        run_windows(&mut apu, &mut div, 28);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x02);
        run_windows(&mut apu, &mut div, 1);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x00);
    }

    #[test]
    fn wave_ram_locked_while_channel_runs() {
        let mut apu = quiet_apu();
        for i in 0..16u16 {
            apu.write_reg(0xFF30 + i, (i as u8) * 0x11);
        }
        assert_eq!(apu.read_reg(0xFF35), 0x55);
        apu.write_reg(0xFF1A, 0x80);
        apu.write_reg(0xFF1E, 0x80);
        assert_eq!(apu.read_reg(0xFF35), 0xFF);
        apu.write_reg(0xFF35, 0xAA); // dropped
        apu.write_reg(0xFF1A, 0x00); // DAC off stops the channel
        assert_eq!(apu.read_reg(0xFF35), 0x55);
    }

    #[test]
    fn lfsr_walks_out_of_zero_after_trigger() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF21, 0xF0);
        apu.write_reg(0xFF22, 0x00); // divisor 8, shift 0
        apu.write_reg(0xFF23, 0x80);
        assert_eq!(apu.ch4_lfsr(), 0);
        apu.step(0, 64);
        assert_ne!(apu.ch4_lfsr(), 0);
    }

    #[test]
    fn div_reset_with_bit12_high_clocks_sequencer() {
        let mut apu = quiet_apu();
        apu.write_reg(0xFF16, 0x3E); // length = 2
        apu.write_reg(0xFF17, 0xF0);
        apu.write_reg(0xFF19, 0xC0); // enable clocks 2 -> 1, then trigger
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x02);
        // Forcing a bit-12 falling edge via a divider reset runs the
        // length step with no elapsed time.
        apu.notify_div_reset(0x1000);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x00);
    }

    #[test]
    fn samples_accumulate_at_the_configured_rate() {
        let mut apu = quiet_apu();
        apu.set_sample_rate(65_536); // one sample every 64 cycles
        apu.step(0, 640);
        assert_eq!(apu.queued_samples(), 10);
        assert_eq!(apu.take_samples().len(), 20);
        assert_eq!(apu.queued_samples(), 0);
    }

    #[test]
    fn dc_filter_removes_constant_offset() {
        let mut apu = Apu::new();
        apu.set_sample_rate(48_000);
        apu.ch1.dac_enabled = true;
        let mut last = 0i16;
        for _ in 0..48_000 {
            let (left, _) = apu.dc_block(1000, 1000);
            last = left;
        }
        assert!(last.abs() < 40, "offset not removed: {last}");
    }

    #[test]
    fn dc_filter_resets_when_all_dacs_off() {
        let mut apu = Apu::new();
        apu.ch1.dac_enabled = true;
        for _ in 0..100 {
            apu.dc_block(1000, 1000);
        }
        apu.ch1.dac_enabled = false;
        apu.ch2.dac_enabled = false;
        apu.ch3.dac_enabled = false;
        apu.ch4.dac_enabled = false;
        assert_eq!(apu.dc_block(1000, 1000), (0, 0));
        assert_eq!(apu.hp_sum_left, 0.0);
    }
}
