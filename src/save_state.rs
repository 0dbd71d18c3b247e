//! Whole-machine snapshots.
//!
//! A state blob is a fixed header followed by a bincode payload holding the
//! hardware revision, the CPU, and the bus with every peripheral (cartridge
//! and boot ROM included, so a blob restores on a fresh machine). Restoring
//! decodes the entire payload before touching the live machine; a bad blob
//! leaves it running.

use bincode::config::{self, Configuration};
use thiserror::Error;

use crate::cpu::Cpu;
use crate::gameboy::GameBoy;
use crate::hardware::DmgRevision;
use crate::mmu::Mmu;

const STATE_MAGIC: &[u8; 4] = b"DMGS";
const STATE_VERSION: u8 = 1;
// magic + version + payload length
const HEADER_LEN: usize = 4 + 1 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaveStateError {
    #[error("save state version {found} is not supported (expected {STATE_VERSION})")]
    VersionMismatch { found: u8 },
    #[error("save state data is corrupt")]
    CorruptData,
}

fn bincode_config() -> Configuration {
    config::standard()
}

pub(crate) fn serialize(gb: &GameBoy) -> Vec<u8> {
    let payload = match bincode::encode_to_vec((&gb.revision, &gb.cpu, &gb.mmu), bincode_config())
    {
        Ok(payload) => payload,
        Err(err) => {
            // Encoding plain owned data cannot fail short of allocation
            // failure. Emit an empty payload, which will never restore.
            log::error!("save state encoding failed: {err}");
            Vec::new()
        }
    };

    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.extend_from_slice(STATE_MAGIC);
    blob.push(STATE_VERSION);
    blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    blob.extend_from_slice(&payload);
    blob
}

pub(crate) fn restore(gb: &mut GameBoy, data: &[u8]) -> Result<(), SaveStateError> {
    if data.len() < HEADER_LEN || &data[..4] != STATE_MAGIC {
        return Err(SaveStateError::CorruptData);
    }
    if data[4] != STATE_VERSION {
        return Err(SaveStateError::VersionMismatch { found: data[4] });
    }
    let payload_len = u32::from_le_bytes(data[5..9].try_into().unwrap()) as usize;
    let payload = &data[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(SaveStateError::CorruptData);
    }

    let ((revision, cpu, mmu), consumed): ((DmgRevision, Cpu, Mmu), usize) =
        bincode::decode_from_slice(payload, bincode_config())
            .map_err(|_| SaveStateError::CorruptData)?;
    if consumed != payload_len {
        return Err(SaveStateError::CorruptData);
    }

    gb.revision = revision;
    gb.cpu = cpu;
    gb.mmu = mmu;
    // Samples queued when the snapshot was taken belong to the old timeline.
    let _ = gb.mmu.apu.take_samples();
    Ok(())
}
