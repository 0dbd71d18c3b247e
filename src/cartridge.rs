use bincode::{Decode, Encode};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

/// Mapper family decoded from header byte 0x0147.
///
/// `Unknown` keeps the raw tag so callers can report it; the cartridge still
/// loads and behaves as an unmapped handler (see [`Cartridge::read`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc30,
    Mbc5,
    Unknown(u8),
}

#[derive(Debug, Error)]
pub enum CartridgeError {
    /// The image cannot contain a cartridge header.
    #[error("image of {0} bytes is too small to hold a cartridge header")]
    ImageTooSmall(usize),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Encode, Decode)]
pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub title: String,
    cart_type: u8,
    save_path: Option<PathBuf>,
    rtc_path: Option<PathBuf>,
    mbc_state: MbcState,
}

#[derive(Debug, Encode, Decode)]
enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        mode: u8,
        ram_enable: bool,
        multicart: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_pending: bool,
    },
    Mbc30 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_pending: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
    /// Unrecognized mapper tag: ROM reads come from bank 0, cartridge RAM
    /// reads 0xFF, control writes are ignored.
    Unmapped,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

/// MBC3 real-time clock. Runs off emulated cycles while the machine steps and
/// catches up from the wall clock when battery data is loaded.
#[derive(Debug, Clone, Encode, Decode)]
struct Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    /// Unix timestamp (whole seconds) of the last wall-clock sync.
    last_sync_secs: u64,
    subsecond_cycles: u32,
}

const RTC_CYCLES_PER_SECOND: u32 = 4_194_304;

const RTC_FILE_MAGIC: &[u8; 4] = b"RTCS";
const RTC_FILE_VERSION: u8 = 1;
const RTC_FILE_LEN: usize = 23;

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }
}

impl Rtc {
    fn new(now_secs: u64) -> Self {
        let regs = RtcRegisters::default();
        Self {
            regs,
            latched: regs,
            last_sync_secs: now_secs,
            subsecond_cycles: 0,
        }
    }

    fn latch(&mut self) {
        self.latched = self.regs;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds & 0x3F,
            0x09 => self.latched.minutes & 0x3F,
            0x0A => self.latched.hours & 0x1F,
            0x0B => (self.latched.days & 0x00FF) as u8,
            0x0C => self.latched.control_byte(),
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                // The seconds register shares the divider chain, so writing it
                // also resets the sub-second phase.
                self.subsecond_cycles = 0;
            }
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | value as u16,
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (((value & 0x01) as u16) << 8);
                self.regs.halt = value & 0x40 != 0;
                self.regs.carry = value & 0x80 != 0;
            }
            _ => {}
        }
        self.latch();
    }

    fn step(&mut self, cpu_cycles: u64) {
        if self.regs.halt {
            return;
        }
        self.add_cycles(cpu_cycles);
    }

    /// Catch up from the wall clock after loading persisted RTC data.
    fn sync_wall(&mut self, now_secs: u64) {
        let elapsed = now_secs.saturating_sub(self.last_sync_secs);
        self.last_sync_secs = now_secs;
        if self.regs.halt {
            return;
        }
        self.add_cycles(elapsed.saturating_mul(RTC_CYCLES_PER_SECOND as u64));
    }

    fn mark_persisted(&mut self, now_secs: u64) {
        self.last_sync_secs = now_secs;
    }

    fn add_cycles(&mut self, cycles: u64) {
        debug_assert!(self.subsecond_cycles < RTC_CYCLES_PER_SECOND);

        let mut seconds = cycles / RTC_CYCLES_PER_SECOND as u64;
        let rem = (cycles % RTC_CYCLES_PER_SECOND as u64) as u32;

        let mut sub = self.subsecond_cycles + rem;
        if sub >= RTC_CYCLES_PER_SECOND {
            sub -= RTC_CYCLES_PER_SECOND;
            seconds += 1;
        }
        self.subsecond_cycles = sub;

        if seconds > 0 {
            self.advance_seconds(seconds);
        }
    }

    // The registers are not range-checked by the hardware; out-of-range
    // values written by software tick through the counter's full bit width
    // before wrapping, which games rely on.
    fn advance_seconds(&mut self, mut seconds: u64) {
        while seconds > 0 {
            let until_minute_tick = self.seconds_until_minute_tick();
            if seconds < until_minute_tick {
                self.regs.seconds = ((self.regs.seconds as u64 + seconds) & 0x3F) as u8;
                return;
            }

            seconds -= until_minute_tick;
            self.regs.seconds = 0;
            self.minute_tick();
        }
    }

    fn seconds_until_minute_tick(&self) -> u64 {
        let sec = self.regs.seconds as u64;
        if sec <= 59 { 60 - sec } else { (63 - sec + 1) + 60 }
    }

    fn minute_tick(&mut self) {
        let overflow = self.regs.minutes == 59;
        self.regs.minutes = ((self.regs.minutes as u16 + 1) & 0x3F) as u8;
        if overflow {
            self.regs.minutes = 0;
            self.hour_tick();
        }
    }

    fn hour_tick(&mut self) {
        let overflow = self.regs.hours == 23;
        self.regs.hours = ((self.regs.hours as u16 + 1) & 0x1F) as u8;
        if overflow {
            self.regs.hours = 0;
            self.day_tick();
        }
    }

    fn day_tick(&mut self) {
        if self.regs.days >= 0x01FF {
            self.regs.days = 0;
            self.regs.carry = true;
        } else {
            self.regs.days = (self.regs.days + 1) & 0x01FF;
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(RTC_FILE_LEN);
        data.extend_from_slice(RTC_FILE_MAGIC);
        data.push(RTC_FILE_VERSION);
        data.extend_from_slice(&self.last_sync_secs.to_le_bytes());
        data.extend_from_slice(&self.subsecond_cycles.to_le_bytes());
        data.push(self.regs.seconds & 0x3F);
        data.push(self.regs.minutes & 0x3F);
        data.push(self.regs.hours & 0x1F);
        data.extend_from_slice(&(self.regs.days & 0x01FF).to_le_bytes());

        let mut flags = 0u8;
        if self.regs.halt {
            flags |= 0x01;
        }
        if self.regs.carry {
            flags |= 0x02;
        }
        data.push(flags);

        data
    }

    fn load_from_bytes(&mut self, data: &[u8]) -> bool {
        if data.len() < RTC_FILE_LEN || &data[..4] != RTC_FILE_MAGIC || data[4] != RTC_FILE_VERSION
        {
            return false;
        }

        self.last_sync_secs = u64::from_le_bytes(data[5..13].try_into().unwrap());
        self.subsecond_cycles =
            u32::from_le_bytes(data[13..17].try_into().unwrap()).min(RTC_CYCLES_PER_SECOND - 1);
        self.regs.seconds = data[17] & 0x3F;
        self.regs.minutes = data[18] & 0x3F;
        self.regs.hours = data[19] & 0x1F;
        self.regs.days = u16::from_le_bytes([data[20], data[21]]) & 0x01FF;

        let flags = data[22];
        self.regs.halt = flags & 0x01 != 0;
        self.regs.carry = flags & 0x02 != 0;
        self.latch();
        true
    }
}

impl Cartridge {
    /// Build a cartridge from a raw image.
    ///
    /// The only rejected input is an image too small to hold a header. An
    /// unrecognized mapper tag is not an error: the cartridge loads with an
    /// unmapped handler so a malformed image still boots to a degraded,
    /// non-crashing state.
    pub fn load(mut data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.len() < 0x150 {
            return Err(CartridgeError::ImageTooSmall(data.len()));
        }

        let header = Header::parse(&data);
        let ram_size = header.ram_size();
        let cart_type = header.cart_type();
        let has_rtc = header.has_rtc();
        let mbc = header.mbc_type();
        let title = header.title();
        let declared_len = header.declared_rom_size();
        let now = unix_now_secs();

        if let MbcType::Unknown(tag) = mbc {
            log::warn!("unknown mapper type {tag:#04X}; cartridge RAM and banking disabled");
        }
        if data.len() < declared_len {
            log::debug!(
                "image is {} bytes but the header declares {}; padding with 0xFF",
                data.len(),
                declared_len
            );
            data.resize(declared_len, 0xFF);
        }

        let mbc_state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                mode: 0,
                ram_enable: false,
                multicart: detect_mbc1_multicart(&data),
            },
            MbcType::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc.then(|| Rtc::new(now)),
                latch_pending: false,
            },
            MbcType::Mbc30 => MbcState::Mbc30 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc.then(|| Rtc::new(now)),
                latch_pending: false,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
            MbcType::Unknown(_) => MbcState::Unmapped,
        };

        Ok(Self {
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            title,
            cart_type,
            save_path: None,
            rtc_path: None,
            mbc_state,
        })
    }

    /// Load a cartridge from disk, picking up `.sav` / `.rtc` siblings for
    /// battery-backed variants.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let data = fs::read(&path)?;
        let mut cart = Self::load(data)?;

        if cart.has_battery() {
            let mut save = PathBuf::from(path.as_ref());
            save.set_extension("sav");
            cart.save_path = Some(save.clone());
            if let Ok(bytes) = fs::read(&save) {
                cart.load_battery(&bytes);
            }
        }

        if cart.has_rtc() {
            let mut rtc_path = PathBuf::from(path.as_ref());
            rtc_path.set_extension("rtc");
            cart.rtc_path = Some(rtc_path.clone());
            let now = unix_now_secs();
            if let Some(rtc) = cart.rtc_mut() {
                if let Ok(bytes) = fs::read(&rtc_path)
                    && !rtc.load_from_bytes(&bytes)
                {
                    log::warn!("failed to parse RTC data from {}", rtc_path.display());
                }
                rtc.sync_wall(now);
                rtc.latch();
            }
        }

        log::info!("loaded ROM: {} (mapper {:?})", cart.title, cart.mbc);
        Ok(cart)
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        let rom_bank_count = self.rom_bank_count();
        match (&mut self.mbc_state, addr) {
            // The unmapped handler pins both ROM windows to bank 0.
            (MbcState::Unmapped, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Unmapped, 0x4000..=0x7FFF) => self
                .rom
                .get(addr as usize - 0x4000)
                .copied()
                .unwrap_or(0xFF),
            (MbcState::NoMbc, 0x0000..=0x7FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc2 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc2 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let mut bank = (*rom_bank & 0x0F) as usize;
                if bank == 0 {
                    bank = 1;
                }
                let offset = (bank % rom_bank_count) * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (
                MbcState::Mbc1 {
                    ram_bank,
                    mode,
                    multicart,
                    ..
                },
                0x0000..=0x3FFF,
            ) => {
                // In mode 1 the RAM-bank bits also remap the fixed window.
                let bank = if *mode == 0 {
                    0
                } else if *multicart {
                    (((*ram_bank as usize) & 0x03) << 4) % rom_bank_count
                } else {
                    (((*ram_bank as usize) & 0x03) << 5) % rom_bank_count
                };
                let offset = bank * 0x4000 + addr as usize;
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (
                MbcState::Mbc1 {
                    rom_bank,
                    ram_bank,
                    multicart,
                    ..
                },
                0x4000..=0x7FFF,
            ) => {
                let bank = if *multicart {
                    let high = ((*ram_bank as usize) & 0x03) << 4;
                    let raw = *rom_bank as usize & 0x1F;
                    let low4 = raw & 0x0F;
                    let bit4 = (raw & 0x10) != 0;
                    let low = if low4 == 0 && !bit4 { 1 } else { low4 };
                    (high | low) % rom_bank_count
                } else {
                    let high = ((*ram_bank as usize) & 0x03) << 5;
                    let mut bank = high | (*rom_bank as usize & 0x1F);
                    if bank & 0x1F == 0 {
                        bank += 1;
                    }
                    bank % rom_bank_count
                };
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc3 { .. }, 0x0000..=0x3FFF)
            | (MbcState::Mbc30 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF)
            | (MbcState::Mbc30 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let raw = if *rom_bank == 0 { 1 } else { *rom_bank } as usize;
                let bank = raw % rom_bank_count;
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc5 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                // MBC5 maps bank 0 here when selected; only the wrap applies.
                let bank = (*rom_bank as usize) % rom_bank_count;
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                let idx = self.ram_index(addr);
                self.ram.get(idx).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    // 512x4-bit internal RAM, mirrored across the window;
                    // the upper nibble is open bus.
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    let nibble = self.ram.get(idx).copied().unwrap_or(0x0F) & 0x0F;
                    0xF0 | nibble
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    let idx = self.ram_index(addr);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if !*ram_enable {
                    0xFF
                } else {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            self.ram.get(idx).copied().unwrap_or(0xFF)
                        }
                        0x08..=0x0C => rtc
                            .as_ref()
                            .map(|r| r.read_latched(*ram_bank))
                            .unwrap_or(0xFF),
                        _ => 0xFF,
                    }
                }
            }
            (
                MbcState::Mbc30 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if !*ram_enable {
                    0xFF
                } else {
                    match *ram_bank {
                        0x00..=0x07 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            self.ram.get(idx).copied().unwrap_or(0xFF)
                        }
                        0x08..=0x0C => rtc
                            .as_ref()
                            .map(|r| r.read_latched(*ram_bank))
                            .unwrap_or(0xFF),
                        _ => 0xFF,
                    }
                }
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    let idx = self.ram_index(addr);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match (&mut self.mbc_state, addr) {
            (MbcState::Unmapped, _) => {}
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                let idx = addr as usize - 0xA000;
                if let Some(b) = self.ram.get_mut(idx) {
                    *b = val;
                }
            }
            (
                MbcState::Mbc2 {
                    rom_bank,
                    ram_enable,
                },
                0x0000..=0x3FFF,
            ) => {
                // Address bit 8 selects between RAMG (clear) and ROMB (set)
                // across the whole range.
                if (addr & 0x0100) == 0 {
                    *ram_enable = val & 0x0F == 0x0A;
                } else {
                    *rom_bank = val & 0x0F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
            }
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val & 0x0F;
                    }
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x1F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc1 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    // Small RAM sizes always map the single available bank;
                    // ram_index() handles the wrapping.
                    let idx = self.ram_index(addr);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }
            (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF)
            | (MbcState::Mbc30 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x7F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc30 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc3 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val;
            }
            (MbcState::Mbc30 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            )
            | (
                MbcState::Mbc30 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                // Writing 0x00 then 0x01 latches the live counters.
                if val == 0 {
                    *latch_pending = true;
                } else if val == 1 && *latch_pending {
                    if let Some(rtc) = rtc {
                        rtc.latch();
                    }
                    *latch_pending = false;
                } else {
                    *latch_pending = false;
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_enable {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            if let Some(b) = self.ram.get_mut(idx) {
                                *b = val;
                            }
                        }
                        0x08..=0x0C => {
                            if let Some(rtc) = rtc.as_mut() {
                                rtc.write_register(*ram_bank, val);
                            }
                        }
                        _ => {}
                    }
                }
            }
            (
                MbcState::Mbc30 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_enable {
                    match *ram_bank {
                        0x00..=0x07 => {
                            let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                            if let Some(b) = self.ram.get_mut(idx) {
                                *b = val;
                            }
                        }
                        0x08..=0x0C => {
                            if let Some(rtc) = rtc.as_mut() {
                                rtc.write_register(*ram_bank, val);
                            }
                        }
                        _ => {}
                    }
                }
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | val as u16;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            (
                MbcState::Mbc5 {
                    ram_enable,
                    ram_bank,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_enable {
                    let idx = (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000;
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }
            _ => {}
        }
    }

    /// Advance the RTC (if any) by emulated CPU cycles.
    pub fn step_rtc(&mut self, cpu_cycles: u16) {
        if let Some(rtc) = self.rtc_mut() {
            rtc.step(cpu_cycles as u64);
        }
    }

    fn rom_bank_count(&self) -> usize {
        (self.rom.len() / 0x4000).max(1)
    }

    fn ram_index(&self, addr: u16) -> usize {
        let ram_bank_count = if self.ram.is_empty() {
            0
        } else {
            (self.ram.len().saturating_add(0x1FFF)) / 0x2000
        };
        match &self.mbc_state {
            MbcState::NoMbc | MbcState::Unmapped => addr as usize - 0xA000,
            MbcState::Mbc2 { .. } => (addr as usize - 0xA000) & 0x01FF,
            MbcState::Mbc1 { ram_bank, mode, .. } => {
                if *mode == 0 {
                    addr as usize - 0xA000
                } else {
                    let bank = if ram_bank_count == 0 {
                        0
                    } else {
                        (*ram_bank as usize) % ram_bank_count
                    };
                    bank * 0x2000 + addr as usize - 0xA000
                }
            }
            MbcState::Mbc3 { ram_bank, .. } => {
                ((*ram_bank as usize) & 0x03) * 0x2000 + addr as usize - 0xA000
            }
            MbcState::Mbc30 { ram_bank, .. } => {
                ((*ram_bank as usize) & 0x07) * 0x2000 + addr as usize - 0xA000
            }
            MbcState::Mbc5 { ram_bank, .. } => {
                (*ram_bank as usize) * 0x2000 + addr as usize - 0xA000
            }
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.cart_type,
            0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
        )
    }

    pub fn has_rtc(&self) -> bool {
        matches!(self.cart_type, 0x0F | 0x10 | 0x13)
    }

    fn rtc_mut(&mut self) -> Option<&mut Rtc> {
        match &mut self.mbc_state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } | MbcState::Mbc30 { rtc: Some(rtc), .. } => {
                Some(rtc)
            }
            _ => None,
        }
    }

    /// Battery-backed RAM contents for external persistence. Empty slice when
    /// the cartridge has no battery.
    pub fn battery(&self) -> &[u8] {
        if self.has_battery() { &self.ram } else { &[] }
    }

    /// Restore battery-backed RAM from persisted bytes. Short input fills a
    /// prefix; excess bytes are ignored.
    pub fn load_battery(&mut self, bytes: &[u8]) {
        for (d, s) in self.ram.iter_mut().zip(bytes.iter()) {
            *d = *s;
        }
    }

    /// Serialized RTC counters + timestamp for external persistence, or None
    /// when the cartridge has no clock.
    pub fn rtc_data(&mut self) -> Option<Vec<u8>> {
        let now = unix_now_secs();
        self.rtc_mut().map(|rtc| {
            rtc.mark_persisted(now);
            rtc.serialize()
        })
    }

    /// Restore RTC state from persisted bytes and catch up from the wall
    /// clock. Returns false (leaving the clock untouched) on unrecognized
    /// data.
    pub fn load_rtc_data(&mut self, bytes: &[u8]) -> bool {
        let now = unix_now_secs();
        match self.rtc_mut() {
            Some(rtc) => {
                if !rtc.load_from_bytes(bytes) {
                    return false;
                }
                rtc.sync_wall(now);
                rtc.latch();
                true
            }
            None => false,
        }
    }

    /// Persist battery RAM (and RTC state) to the paths recorded by
    /// [`Cartridge::from_file`]. No-op for cartridges loaded from a buffer.
    pub fn save_ram(&mut self) -> io::Result<()> {
        if let (true, Some(path)) = (self.has_battery(), &self.save_path)
            && !self.ram.is_empty()
        {
            fs::write(path, &self.ram)?;
        }

        let rtc_path = self.rtc_path.clone();
        let now = unix_now_secs();
        if let (Some(path), Some(rtc)) = (rtc_path, self.rtc_mut()) {
            rtc.mark_persisted(now);
            fs::write(path, rtc.serialize())?;
        }
        Ok(())
    }
}

fn detect_mbc1_multicart(rom: &[u8]) -> bool {
    // The multicart wiring can't be identified from the header alone. Use the
    // common heuristic: 8 Mbit image with the header logo repeated in the
    // first banks of each sub-game.
    let bank_count = rom.len() / 0x4000;
    if bank_count != 64 {
        return false;
    }

    let logo0 = match rom.get(0x0104..0x0134) {
        Some(s) if !s.iter().all(|&b| b == 0) => s,
        _ => return false,
    };

    for bank in 1..=2 {
        let start = bank * 0x4000 + 0x0104;
        let end = start + 0x30;
        match rom.get(start..end) {
            Some(s) if s == logo0 => {}
            _ => return false,
        }
    }

    true
}

/// Borrowing view over the cartridge header area.
struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let end = 0x0143.min(self.data.len());
        let mut slice = &self.data[0x0134.min(self.data.len())..end];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn mbc_type(&self) -> MbcType {
        let cart = self.cart_type();
        let ram_code = self.data.get(0x0149).copied().unwrap_or(0);
        match cart {
            0x00 | 0x08 | 0x09 => MbcType::NoMbc,
            0x01..=0x03 => MbcType::Mbc1,
            0x05 | 0x06 => MbcType::Mbc2,
            0x0F..=0x13 => {
                // MBC30 carts report the 64KB RAM code.
                if ram_code == 0x05 {
                    MbcType::Mbc30
                } else {
                    MbcType::Mbc3
                }
            }
            0x19..=0x1E => MbcType::Mbc5,
            other => MbcType::Unknown(other),
        }
    }

    fn cart_type(&self) -> u8 {
        self.data.get(0x0147).copied().unwrap_or(0)
    }

    fn has_rtc(&self) -> bool {
        matches!(self.cart_type(), 0x0F | 0x10 | 0x13)
    }

    fn declared_rom_size(&self) -> usize {
        let code = self.data.get(0x0148).copied().unwrap_or(0);
        // 32KB << n, capped at 8MB (the largest published size).
        0x8000usize << (code & 0x0F).min(9)
    }

    fn ram_size(&self) -> usize {
        // MBC2 carries 512x4-bit internal RAM regardless of the header code.
        if matches!(self.cart_type(), 0x05 | 0x06) {
            return 0x200;
        }

        match self.data.get(0x0149).copied().unwrap_or(0) {
            0x00 => 0,
            0x01 => 0x800,   // 2KB
            0x02 => 0x2000,  // 8KB
            0x03 => 0x8000,  // 32KB (4 banks)
            0x04 => 0x20000, // 128KB (16 banks)
            0x05 => 0x10000, // 64KB (8 banks)
            _ => 0x2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(cart_type: u8, rom_code: u8, ram_code: u8) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000 << rom_code as usize];
        rom[0x0147] = cart_type;
        rom[0x0148] = rom_code;
        rom[0x0149] = ram_code;
        rom
    }

    #[test]
    fn undersized_image_is_rejected() {
        assert!(matches!(
            Cartridge::load(vec![0; 0x100]),
            Err(CartridgeError::ImageTooSmall(0x100))
        ));
    }

    #[test]
    fn unknown_mapper_degrades_to_unmapped() {
        let mut rom = image(0xDD, 1, 0x02);
        rom[0x0000] = 0x11;
        rom[0x4000] = 0x22;
        let mut cart = Cartridge::load(rom).unwrap();

        assert_eq!(cart.mbc, MbcType::Unknown(0xDD));
        // Control writes are ignored and both windows read bank 0.
        cart.write(0x0000, 0x0A);
        cart.write(0x2000, 0x02);
        assert_eq!(cart.read(0x0000), 0x11);
        assert_eq!(cart.read(0x4000), 0x11);
        // Cartridge RAM never opens.
        cart.write(0xA000, 0x55);
        assert_eq!(cart.read(0xA000), 0xFF);
    }

    #[test]
    fn short_image_padded_to_declared_size() {
        let mut rom = image(0x19, 2, 0x00); // declares 128KB
        rom.truncate(0x8000);
        rom[0x0147] = 0x19;
        let mut cart = Cartridge::load(rom).unwrap();

        cart.write(0x2000, 0x05); // bank 5 exists only via padding
        assert_eq!(cart.read(0x4000), 0xFF);
    }

    #[test]
    fn mbc5_rom_bank_wraps_modulo_physical_banks() {
        let mut rom = image(0x19, 2, 0x00); // 8 banks
        for bank in 0..8 {
            rom[bank * 0x4000 + 0x100] = bank as u8;
        }
        let mut cart = Cartridge::load(rom).unwrap();

        cart.write(0x2000, 11); // 11 % 8 == 3
        assert_eq!(cart.read(0x4100), 3);
        cart.write(0x3000, 0x01); // bank 256+11 -> (267 % 8) == 3
        assert_eq!(cart.read(0x4100), 3);
    }

    #[test]
    fn rtc_ticks_through_invalid_values() {
        let mut rtc = Rtc::new(0);

        rtc.regs.seconds = 59;
        rtc.regs.minutes = 60;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 61);

        rtc.regs.seconds = 63;
        rtc.regs.minutes = 5;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 5);

        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 24;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 0);
        assert_eq!(rtc.regs.hours, 25);
    }

    #[test]
    fn rtc_halt_preserves_subseconds() {
        let mut rtc = Rtc::new(0);
        rtc.subsecond_cycles = RTC_CYCLES_PER_SECOND - 10_000;

        rtc.write_register(0x0C, 0x40);
        rtc.step(RTC_CYCLES_PER_SECOND as u64 * 2);
        assert_eq!(rtc.regs.seconds, 0);

        rtc.write_register(0x0C, 0x00);
        rtc.step(9_999);
        assert_eq!(rtc.regs.seconds, 0);
        rtc.step(1);
        assert_eq!(rtc.regs.seconds, 1);
    }

    #[test]
    fn rtc_seconds_write_resets_phase() {
        let mut rtc = Rtc::new(10);
        rtc.subsecond_cycles = RTC_CYCLES_PER_SECOND / 2;

        rtc.write_register(0x09, 0x01);
        assert_eq!(rtc.subsecond_cycles, RTC_CYCLES_PER_SECOND / 2);

        rtc.write_register(0x08, 0x02);
        assert_eq!(rtc.subsecond_cycles, 0);
    }

    #[test]
    fn rtc_day_overflow_sets_carry() {
        let mut rtc = Rtc::new(0);
        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 23;
        rtc.regs.days = 0x01FF;

        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.days, 0);
        assert!(rtc.regs.carry);
    }

    #[test]
    fn rtc_wall_clock_catch_up() {
        let mut rtc = Rtc::new(100);
        rtc.sync_wall(100 + 3661);
        assert_eq!(rtc.regs.hours, 1);
        assert_eq!(rtc.regs.minutes, 1);
        assert_eq!(rtc.regs.seconds, 1);
    }

    #[test]
    fn rtc_serialize_roundtrip() {
        let mut rtc = Rtc::new(42);
        rtc.regs.seconds = 12;
        rtc.regs.minutes = 34;
        rtc.regs.hours = 5;
        rtc.regs.days = 0x0123;
        rtc.regs.carry = true;
        let bytes = rtc.serialize();

        let mut other = Rtc::new(0);
        assert!(other.load_from_bytes(&bytes));
        assert_eq!(other.regs.seconds, 12);
        assert_eq!(other.regs.minutes, 34);
        assert_eq!(other.regs.hours, 5);
        assert_eq!(other.regs.days, 0x0123);
        assert!(other.regs.carry);
        assert_eq!(other.last_sync_secs, 42);

        assert!(!other.load_from_bytes(&bytes[..10]));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(!other.load_from_bytes(&bad));
    }
}
