//! Media slot management against resolved descriptors.
//!
//! The catalog collaborator hands the core a local path, the expected
//! sha256, and the size; attach verifies all three before anything touches
//! the machine. Floppy hot-swap is allowed while running; ROM and
//! cartridge swaps only while the machine is cold.

use engine_abi::{
    EngineError, ErrorCode, ErrorDetails, LifecycleState, MediaBinding, MediaDescriptor, MediaSlot,
};
use machine_core::fdc::FloppyImage;
use machine_core::Machine;
use sha2::{Digest, Sha256};
use std::fs;
use std::sync::Arc;

/// Validated media payload ready to mount.
#[derive(Debug)]
pub enum MediaPayload {
    Rom(Arc<[u8]>),
    Floppy { drive: usize, image: FloppyImage },
    Cartridge(Arc<[u8]>),
}

/// Bindings currently mounted, persisted into snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaBindings {
    bindings: Vec<MediaBinding>,
}

impl MediaBindings {
    pub fn list(&self) -> &[MediaBinding] {
        &self.bindings
    }

    pub fn record(&mut self, binding: MediaBinding) {
        self.bindings.retain(|b| b.slot != binding.slot);
        self.bindings.push(binding);
    }

    pub fn clear(&mut self, slot: MediaSlot) {
        self.bindings.retain(|b| b.slot != slot);
    }

    pub fn replace_all(&mut self, bindings: Vec<MediaBinding>) {
        self.bindings = bindings;
    }
}

/// Reads and verifies a descriptor, returning the mountable payload.
pub fn resolve(slot: MediaSlot, descriptor: &MediaDescriptor) -> Result<MediaPayload, EngineError> {
    let bytes = fs::read(&descriptor.path).map_err(|e| {
        EngineError::new(
            ErrorCode::MediaFormatInvalid,
            format!("cannot read {}: {e}", descriptor.path.display()),
        )
        .with_details(ErrorDetails::default().with("slot", slot.as_str()))
    })?;
    if bytes.len() as u64 != descriptor.size {
        return Err(EngineError::new(
            ErrorCode::MediaDigestMismatch,
            format!(
                "size mismatch: descriptor says {}, file is {}",
                descriptor.size,
                bytes.len()
            ),
        ));
    }
    let digest = hex::encode(Sha256::digest(&bytes));
    if !digest.eq_ignore_ascii_case(&descriptor.sha256) {
        return Err(EngineError::new(
            ErrorCode::MediaDigestMismatch,
            format!("sha256 mismatch for {}", descriptor.path.display()),
        )
        .with_details(
            ErrorDetails::default()
                .with("expected", &descriptor.sha256)
                .with("actual", digest),
        ));
    }

    let data: Arc<[u8]> = Arc::from(bytes.into_boxed_slice());
    match slot {
        MediaSlot::Rom => {
            if data.len() < 8 {
                return Err(format_invalid(slot, "ROM image shorter than a reset frame"));
            }
            Ok(MediaPayload::Rom(data))
        }
        MediaSlot::Cartridge => {
            if data.len() > 128 * 1024 {
                return Err(format_invalid(slot, "cartridge image exceeds 128 KiB"));
            }
            Ok(MediaPayload::Cartridge(data))
        }
        MediaSlot::FloppyA | MediaSlot::FloppyB => {
            let image = FloppyImage::from_raw(data, false)
                .ok_or_else(|| format_invalid(slot, "not a raw .st image"))?;
            Ok(MediaPayload::Floppy {
                drive: if slot == MediaSlot::FloppyA { 0 } else { 1 },
                image,
            })
        }
    }
}

fn format_invalid(slot: MediaSlot, message: &str) -> EngineError {
    EngineError::new(ErrorCode::MediaFormatInvalid, message)
        .with_details(ErrorDetails::default().with("slot", slot.as_str()))
}

/// Whether the slot may change in the given lifecycle state.
pub fn slot_allows_state(slot: MediaSlot, state: LifecycleState) -> bool {
    match slot {
        // Floppies hot-swap like the real drive door.
        MediaSlot::FloppyA | MediaSlot::FloppyB => matches!(
            state,
            LifecycleState::Running | LifecycleState::Paused | LifecycleState::Stopped
        ),
        MediaSlot::Rom | MediaSlot::Cartridge => {
            matches!(state, LifecycleState::Stopped | LifecycleState::Paused)
        }
    }
}

/// Mounts a validated payload into the machine.
pub fn mount(machine: &mut Machine, payload: MediaPayload) {
    match payload {
        MediaPayload::Rom(data) => machine.bus.load_rom(data),
        MediaPayload::Cartridge(data) => machine.bus.set_cartridge(Some(data)),
        MediaPayload::Floppy { drive, image } => machine.bus.dma.insert_disk(drive, image),
    }
}

/// Unmounts a slot.
pub fn unmount(machine: &mut Machine, slot: MediaSlot) {
    match slot {
        MediaSlot::Rom => machine.bus.load_rom(Arc::from(&[][..])),
        MediaSlot::Cartridge => machine.bus.set_cartridge(None),
        MediaSlot::FloppyA => machine.bus.dma.eject_disk(0),
        MediaSlot::FloppyB => machine.bus.dma.eject_disk(1),
    }
}
