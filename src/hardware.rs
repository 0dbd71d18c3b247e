use bincode::{Decode, Encode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Encode, Decode)]
/// DMG hardware revision.
///
/// Used to model revision-specific quirks that affect timing and observable
/// behavior.
pub enum DmgRevision {
    Rev0,
    RevA,
    RevB,
    #[default]
    RevC,
}

impl DmgRevision {
    /// Internal divider counter value at the moment the boot ROM jumps to
    /// the cartridge entry point.
    #[inline]
    pub const fn initial_div_counter(self) -> u16 {
        match self {
            DmgRevision::Rev0 => 0x1800,
            _ => 0xABCC,
        }
    }
}
