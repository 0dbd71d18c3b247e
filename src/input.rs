use bincode::{Decode, Encode};

/// A single joypad key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Button {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl Button {
    #[inline]
    const fn mask(self) -> u8 {
        match self {
            Button::Right => 0x01,
            Button::Left => 0x02,
            Button::Up => 0x04,
            Button::Down => 0x08,
            Button::A => 0x10,
            Button::B => 0x20,
            Button::Select => 0x40,
            Button::Start => 0x80,
        }
    }

    #[inline]
    const fn opposite(self) -> Option<Button> {
        match self {
            Button::Right => Some(Button::Left),
            Button::Left => Some(Button::Right),
            Button::Up => Some(Button::Down),
            Button::Down => Some(Button::Up),
            _ => None,
        }
    }
}

#[derive(Debug, Encode, Decode)]
pub struct Input {
    /// Active-low key state: low nibble directions, high nibble buttons.
    /// 0xFF means nothing is held.
    state: u8,
    /// JOYP bits 4-5 as last written (also active low).
    select: u8,
}

impl Input {
    pub fn new() -> Self {
        Self {
            state: 0xFF,
            select: 0x30,
        }
    }

    /// Compose the JOYP register: bits 6-7 read high, bits 4-5 read back as
    /// written, and the low nibble is the AND of every selected key group.
    pub fn read(&self) -> u8 {
        0xC0 | self.select | self.selected_lines()
    }

    pub fn write(&mut self, val: u8, if_reg: &mut u8) {
        let prev = self.selected_lines();
        self.select = val & 0x30;
        // Re-routing the matrix can expose an already-held key, which pulls
        // a line low just like a fresh press.
        if prev & !self.selected_lines() != 0 {
            *if_reg |= 0x10;
        }
    }

    /// Press or release a single key.
    pub fn set_button(&mut self, button: Button, pressed: bool, if_reg: &mut u8) {
        let mut state = self.state;
        if pressed {
            state &= !button.mask();
            // The D-pad cannot report opposing directions at once; a new
            // press wins over the held opposite.
            if let Some(opp) = button.opposite() {
                state |= opp.mask();
            }
        } else {
            state |= button.mask();
        }
        self.update_state(state, if_reg);
    }

    /// Replace the whole key state at once (active low, same layout as
    /// `state`). Opposing D-pad presses are both suppressed.
    pub fn update_state(&mut self, mut state: u8, if_reg: &mut u8) {
        if state & 0x03 == 0 {
            state |= 0x03;
        }
        if state & 0x0C == 0 {
            state |= 0x0C;
        }

        let prev = self.selected_lines();
        self.state = state;
        // A selected line going low requests the joypad interrupt.
        if prev & !self.selected_lines() != 0 {
            *if_reg |= 0x10;
        }
    }

    fn selected_lines(&self) -> u8 {
        let mut lines = 0x0F;
        if self.select & 0x10 == 0 {
            lines &= self.state & 0x0F;
        }
        if self.select & 0x20 == 0 {
            lines &= (self.state >> 4) & 0x0F;
        }
        lines
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::new()
    }
}
