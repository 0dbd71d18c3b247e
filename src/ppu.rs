use crate::hardware::DmgRevision;
use bincode::{Decode, Encode};

/// Screen resolution of the LCD panel.
pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

/// Length of one full frame, 154 scanlines of 456 dots each.
pub const DOTS_PER_FRAME: u32 = 154 * 456;

/// Suggested 0x00RRGGBB colors for the four DMG shades, matching the
/// green-tinted original panel. The framebuffer itself stores shade indices;
/// hosts that want RGB output map through this table (or their own).
pub const DMG_PALETTE: [u32; 4] = [0x009BBC0F, 0x008BAC0F, 0x00306230, 0x000F380F];

// Timing per LCD mode in dots (one dot = one 4 MHz cycle)
const MODE0_DOTS: u16 = 204; // HBlank
const MODE1_DOTS: u16 = 456; // One line during VBlank
const MODE2_DOTS: u16 = 80; // OAM scan
const MODE3_DOTS: u16 = 172; // Pixel transfer

// Number of lines spent in VBlank
const VBLANK_LINES: u8 = 10;

// Sprite limits
const MAX_SPRITES_PER_LINE: usize = 10;
const TOTAL_SPRITES: usize = 40;

const VRAM_SIZE: usize = 0x2000;
const OAM_SIZE: usize = 0xA0;

// Window X position is clipped if greater than this value
const WINDOW_X_MAX: u8 = 166;

// VRAM layout
const BG_MAP_0_BASE: usize = 0x1800;
const BG_MAP_1_BASE: usize = 0x1C00;
const TILE_DATA_0_BASE: usize = 0x0000;
const TILE_DATA_1_BASE: usize = 0x0800;

// LCD modes used in the `mode` field
const MODE_HBLANK: u8 = 0;
const MODE_VBLANK: u8 = 1;
const MODE_OAM: u8 = 2;
const MODE_TRANSFER: u8 = 3;

const BOOT_HOLD_DOTS: u16 = 8192;

#[derive(Copy, Clone, Default, Encode, Decode)]
struct Sprite {
    x: i16,
    y: i16,
    tile: u8,
    flags: u8,
    oam_index: usize,
}

#[derive(Encode, Decode)]
pub struct Ppu {
    pub vram: [u8; VRAM_SIZE],
    pub oam: [u8; OAM_SIZE],

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    lyc_eq_ly: bool,
    pub dma: u8,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,

    /// Internal window line counter
    win_line_counter: u8,

    mode_clock: u16,
    pub mode: u8,
    boot_hold_dots: u16,

    /// Shade index (0-3) per pixel, row major.
    pub framebuffer: [u8; SCREEN_WIDTH * SCREEN_HEIGHT],
    /// Raw background color id was 0, per pixel of the current line. Sprite
    /// priority tests against this, not the palette-mapped shade.
    line_bg_zero: [bool; SCREEN_WIDTH],
    /// Latched sprites for the current scanline
    line_sprites: [Sprite; MAX_SPRITES_PER_LINE],
    sprite_count: usize,
    /// Indicates a completed frame is available in `framebuffer`
    frame_ready: bool,
    stat_irq_line: bool,
    mode2_vblank_irq_pending: bool,
    frame_counter: u64,
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            vram: [0; VRAM_SIZE],
            oam: [0; OAM_SIZE],
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            lyc_eq_ly: false,
            dma: 0,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            win_line_counter: 0,
            mode_clock: 0,
            mode: MODE_OAM,
            boot_hold_dots: 0,
            framebuffer: [0; SCREEN_WIDTH * SCREEN_HEIGHT],
            line_bg_zero: [false; SCREEN_WIDTH],
            line_sprites: [Sprite::default(); MAX_SPRITES_PER_LINE],
            sprite_count: 0,
            frame_ready: false,
            stat_irq_line: false,
            mode2_vblank_irq_pending: false,
            frame_counter: 0,
        }
    }

    /// Initialize registers to the state expected after the boot ROM has
    /// finished executing.
    pub fn apply_boot_state(&mut self, revision: DmgRevision) {
        self.lcdc = 0x91;
        self.dma = 0xFF;
        self.bgp = 0xFC;
        self.stat = 0x00;
        self.win_line_counter = 0;

        match revision {
            DmgRevision::Rev0 => {
                self.mode = MODE_TRANSFER;
                self.ly = 0x01;
            }
            DmgRevision::RevA | DmgRevision::RevB | DmgRevision::RevC => {
                self.mode = MODE_HBLANK;
                self.ly = 0x0A;
            }
        }
        self.boot_hold_dots = BOOT_HOLD_DOTS;

        self.lyc_eq_ly = self.ly == self.lyc;
        self.stat_irq_line = false;
        self.mode2_vblank_irq_pending = false;
    }

    /// Collect up to 10 sprites visible on the current scanline, ordered by
    /// X position then OAM index.
    fn oam_scan(&mut self) {
        let sprite_height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        self.sprite_count = 0;
        for i in 0..TOTAL_SPRITES {
            if self.sprite_count >= MAX_SPRITES_PER_LINE {
                break;
            }
            let base = i * 4;
            let y = self.oam[base] as i16 - 16;
            if self.ly as i16 >= y && (self.ly as i16) < y + sprite_height {
                self.line_sprites[self.sprite_count] = Sprite {
                    x: self.oam[base + 1] as i16 - 8,
                    y,
                    tile: self.oam[base + 2],
                    flags: self.oam[base + 3],
                    oam_index: i,
                };
                self.sprite_count += 1;
            }
        }
        self.line_sprites[..self.sprite_count].sort_by_key(|s| (s.x, s.oam_index));
    }

    /// Returns true if a full frame has been rendered and is ready to display.
    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    /// Returns the current value of the internal window line counter.
    pub fn window_line_counter(&self) -> u8 {
        self.win_line_counter
    }

    /// Returns the current framebuffer of shade indices. Call `frame_ready()`
    /// to check if a frame is complete. After presenting, call
    /// `clear_frame_flag()`.
    pub fn framebuffer(&self) -> &[u8; SCREEN_WIDTH * SCREEN_HEIGHT] {
        &self.framebuffer
    }

    /// Clears the frame ready flag after a frame has been consumed.
    pub fn clear_frame_flag(&mut self) {
        self.frame_ready = false;
    }

    /// Returns the number of frames that have been completed since power on.
    pub fn frames(&self) -> u64 {
        self.frame_counter
    }

    fn update_lyc_compare(&mut self) {
        if self.lcdc & 0x80 != 0 {
            self.lyc_eq_ly = self.ly == self.lyc;
        }
    }

    /// VRAM is open to the CPU except during pixel transfer.
    pub fn vram_accessible(&self) -> bool {
        self.lcdc & 0x80 == 0 || self.mode != MODE_TRANSFER
    }

    /// OAM is open to the CPU during HBlank and VBlank only.
    pub fn oam_accessible(&self) -> bool {
        self.lcdc & 0x80 == 0 || (self.mode != MODE_OAM && self.mode != MODE_TRANSFER)
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                (self.stat & 0x78)
                    | 0x80
                    | (self.mode & 0x03)
                    | if self.lyc_eq_ly { 0x04 } else { 0 }
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF46 => self.dma,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8, if_reg: &mut u8) {
        match addr {
            0xFF40 => {
                let was_on = self.lcdc & 0x80 != 0;
                self.lcdc = val;
                let now_on = self.lcdc & 0x80 != 0;
                if was_on && !now_on {
                    self.mode = MODE_HBLANK;
                    self.mode_clock = 0;
                    self.win_line_counter = 0;
                    self.ly = 0;
                }
                if !was_on && now_on {
                    // The panel restarts scanning out from line 0.
                    self.mode = MODE_OAM;
                    self.mode_clock = 0;
                    self.update_lyc_compare();
                }
            }
            0xFF41 => {
                // A STAT write briefly drives every enable bit high, firing a
                // spurious interrupt if any condition currently holds.
                if self.lcdc & 0x80 != 0 {
                    let any = self.lyc_eq_ly || self.mode != MODE_TRANSFER;
                    if any {
                        if !self.stat_irq_line {
                            *if_reg |= 0x02;
                        }
                        self.stat_irq_line = true;
                    }
                }
                self.stat = (self.stat & 0x07) | (val & 0xF8);
            }
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {}
            0xFF45 => {
                self.lyc = val;
                self.update_lyc_compare();
            }
            0xFF46 => self.dma = val,
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            _ => {}
        }
    }

    #[inline(always)]
    fn shade(palette: u8, color_id: u8) -> u8 {
        (palette >> (color_id * 2)) & 0x03
    }

    fn tile_addr(&self, tile_index: u8) -> usize {
        if self.lcdc & 0x10 != 0 {
            TILE_DATA_0_BASE + tile_index as usize * 16
        } else {
            TILE_DATA_1_BASE + ((tile_index as i8 as i16 + 128) as usize) * 16
        }
    }

    fn render_scanline(&mut self) {
        if self.lcdc & 0x80 == 0 || self.ly as usize >= SCREEN_HEIGHT {
            return;
        }

        // With the background disabled the panel shows color 0 everywhere
        // and sprites composite as if the line were all zeroes.
        let shade0 = Self::shade(self.bgp, 0);
        let row = self.ly as usize * SCREEN_WIDTH;
        self.framebuffer[row..row + SCREEN_WIDTH].fill(shade0);
        self.line_bg_zero.fill(true);

        if self.lcdc & 0x01 != 0 {
            let tile_map_base = if self.lcdc & 0x08 != 0 {
                BG_MAP_1_BASE
            } else {
                BG_MAP_0_BASE
            };

            let bg_y = (self.ly as u16 + self.scy as u16) & 0xFF;
            let tile_row = (bg_y / 8) as usize;
            let tile_y = (bg_y % 8) as usize;
            for x in 0..SCREEN_WIDTH as u16 {
                let px = x.wrapping_add(self.scx as u16) & 0xFF;
                let tile_col = (px / 8) as usize;
                let tile_index = self.vram[tile_map_base + tile_row * 32 + tile_col];
                let addr = self.tile_addr(tile_index);
                let bit = 7 - (px % 8) as usize;
                let lo = self.vram[addr + tile_y * 2];
                let hi = self.vram[addr + tile_y * 2 + 1];
                let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                self.framebuffer[row + x as usize] = Self::shade(self.bgp, color_id);
                self.line_bg_zero[x as usize] = color_id == 0;
            }

            // window
            if self.lcdc & 0x20 != 0 && self.ly >= self.wy && self.wx <= WINDOW_X_MAX {
                let wx = self.wx.wrapping_sub(7) as u16;
                let window_map_base = if self.lcdc & 0x40 != 0 {
                    BG_MAP_1_BASE
                } else {
                    BG_MAP_0_BASE
                };
                let window_y = self.win_line_counter as usize;
                let tile_row = window_y / 8;
                let tile_y = window_y % 8;
                let mut drawn_any = false;
                for x in wx..SCREEN_WIDTH as u16 {
                    let window_x = (x - wx) as usize;
                    let tile_index =
                        self.vram[window_map_base + tile_row * 32 + window_x / 8];
                    let addr = self.tile_addr(tile_index);
                    let bit = 7 - window_x % 8;
                    let lo = self.vram[addr + tile_y * 2];
                    let hi = self.vram[addr + tile_y * 2 + 1];
                    let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                    self.framebuffer[row + x as usize] = Self::shade(self.bgp, color_id);
                    self.line_bg_zero[x as usize] = color_id == 0;
                    drawn_any = true;
                }
                // The counter only advances on lines where the window
                // actually produced pixels.
                if drawn_any {
                    self.win_line_counter = self.win_line_counter.wrapping_add(1);
                }
            }
        }

        // sprites
        if self.lcdc & 0x02 != 0 {
            let sprite_height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
            let mut drawn = [false; SCREEN_WIDTH];
            for s in &self.line_sprites[..self.sprite_count] {
                let mut tile = s.tile;
                if sprite_height == 16 {
                    tile &= 0xFE;
                }
                let mut line_idx = self.ly as i16 - s.y;
                if s.flags & 0x40 != 0 {
                    line_idx = sprite_height - 1 - line_idx;
                }
                let palette = if s.flags & 0x10 != 0 {
                    self.obp1
                } else {
                    self.obp0
                };
                let addr = (tile + ((line_idx as usize) >> 3) as u8) as usize * 16
                    + (line_idx as usize & 7) * 2;
                let lo = self.vram[addr];
                let hi = self.vram[addr + 1];
                for px in 0..8 {
                    let bit = if s.flags & 0x20 != 0 { px } else { 7 - px };
                    let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                    // Color 0 is transparent for sprites.
                    if color_id == 0 {
                        continue;
                    }
                    let sx = s.x + px as i16;
                    if !(0i16..SCREEN_WIDTH as i16).contains(&sx) || drawn[sx as usize] {
                        continue;
                    }
                    let bg_zero = self.lcdc & 0x01 == 0 || self.line_bg_zero[sx as usize];
                    if s.flags & 0x80 != 0 && !bg_zero {
                        continue;
                    }
                    self.framebuffer[row + sx as usize] = Self::shade(palette, color_id);
                    drawn[sx as usize] = true;
                }
            }
        }
    }

    pub fn step(&mut self, cycles: u16, if_reg: &mut u8) {
        let mut remaining = cycles;
        if self.boot_hold_dots > 0 {
            let consume = remaining.min(self.boot_hold_dots);
            self.boot_hold_dots -= consume;
            remaining -= consume;
            if remaining == 0 {
                return;
            }
        }
        while remaining > 0 {
            let increment = remaining.min(4);
            remaining -= increment;
            if self.lcdc & 0x80 == 0 {
                self.mode = MODE_HBLANK;
                self.ly = 0;
                self.mode_clock = 0;
                self.win_line_counter = 0;
                self.mode2_vblank_irq_pending = false;
                continue;
            }

            self.update_lyc_compare();

            self.mode_clock += increment;

            match self.mode {
                MODE_HBLANK => {
                    if self.mode_clock >= MODE0_DOTS {
                        self.mode_clock -= MODE0_DOTS;
                        self.ly += 1;
                        self.update_lyc_compare();
                        if self.ly == SCREEN_HEIGHT as u8 {
                            self.frame_ready = true;
                            self.mode = MODE_VBLANK;
                            self.mode2_vblank_irq_pending = true;
                            *if_reg |= 0x01;
                        } else {
                            self.mode = MODE_OAM;
                        }
                    }
                }
                MODE_VBLANK => {
                    if self.mode_clock >= MODE1_DOTS {
                        self.mode_clock -= MODE1_DOTS;
                        self.ly += 1;
                        self.update_lyc_compare();
                        if self.ly > SCREEN_HEIGHT as u8 + VBLANK_LINES - 1 {
                            self.ly = 0;
                            self.frame_ready = false;
                            self.win_line_counter = 0;
                            self.frame_counter = self.frame_counter.wrapping_add(1);
                            self.mode = MODE_OAM;
                            self.update_lyc_compare();
                        }
                    }
                }
                MODE_OAM => {
                    if self.mode_clock >= MODE2_DOTS {
                        self.mode_clock -= MODE2_DOTS;
                        self.oam_scan();
                        self.mode = MODE_TRANSFER;
                    }
                }
                MODE_TRANSFER => {
                    if self.mode_clock >= MODE3_DOTS {
                        self.mode_clock -= MODE3_DOTS;
                        self.render_scanline();
                        self.mode = MODE_HBLANK;
                    }
                }
                _ => {}
            }

            self.update_stat_irq(if_reg);
        }
    }

    fn update_stat_irq(&mut self, if_reg: &mut u8) {
        let coincidence = self.lyc_eq_ly && self.stat & 0x40 != 0;
        let mode_signal = match self.mode {
            MODE_HBLANK => self.stat & 0x08 != 0,
            MODE_VBLANK => self.stat & 0x10 != 0,
            MODE_OAM => self.stat & 0x20 != 0,
            _ => false,
        };
        // Entering VBlank also pulses the OAM source for one cycle.
        let glitch = self.mode2_vblank_irq_pending && self.stat & 0x20 != 0;
        self.mode2_vblank_irq_pending = false;
        let current = coincidence || mode_signal;
        if (current && !self.stat_irq_line) || glitch {
            *if_reg |= 0x02;
        }
        self.stat_irq_line = current || glitch;
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}
