//! Built-in machine profiles and step-order validation.

use engine_abi::{
    ComponentKey, EngineError, ErrorCode, ErrorDetails, ModuleVersions, ProfileManifest, Region,
};
use machine_core::MachineConfig;
use once_cell::sync::Lazy;

/// Scanline rate of an 8 MHz ST: 8_000_000 / 512 cycles per line.
pub const ST_TICK_HZ: u32 = 15_625;

fn modules() -> ModuleVersions {
    ModuleVersions {
        cpu: "m68000/1.0".into(),
        video: "shifter/1.0".into(),
        io: "mfp-acia/1.0".into(),
        audio: "ym2149/1.0".into(),
        storage: "wd1772/1.0".into(),
        machine_profile: "atari_st/1.0".into(),
    }
}

fn full_step_order() -> Vec<ComponentKey> {
    vec![
        ComponentKey::Cpu,
        ComponentKey::Glue,
        ComponentKey::Shifter,
        ComponentKey::Mfp,
        ComponentKey::Psg,
        ComponentKey::Acia,
        ComponentKey::Dma,
    ]
}

static PROFILES: Lazy<Vec<ProfileManifest>> = Lazy::new(|| {
    vec![
        ProfileManifest {
            name: "st_520_pal".into(),
            machine: "atari_st".into(),
            ram_kb: 512,
            region: Region::Pal,
            tick_hz: ST_TICK_HZ,
            step_order: full_step_order(),
            modules: modules(),
            rom_id: Some("rom.tos.1.04.uk".into()),
        },
        ProfileManifest {
            name: "st_520_ntsc".into(),
            machine: "atari_st".into(),
            ram_kb: 512,
            region: Region::Ntsc,
            tick_hz: ST_TICK_HZ,
            step_order: full_step_order(),
            modules: modules(),
            rom_id: Some("rom.tos.1.04.us".into()),
        },
        ProfileManifest {
            name: "st_1040_pal".into(),
            machine: "atari_st".into(),
            ram_kb: 1024,
            region: Region::Pal,
            tick_hz: ST_TICK_HZ,
            step_order: full_step_order(),
            modules: modules(),
            rom_id: Some("rom.tos.1.04.uk".into()),
        },
    ]
});

/// Looks up a built-in profile by machine and name.
pub fn find(machine: &str, profile: &str) -> Result<&'static ProfileManifest, EngineError> {
    PROFILES
        .iter()
        .find(|p| p.machine == machine && p.name == profile)
        .ok_or_else(|| {
            EngineError::new(
                ErrorCode::MachineProfileNotFound,
                format!("no profile {profile} for machine {machine}"),
            )
            .with_details(
                ErrorDetails::guard("G-START-02", "/api/v2/session/start")
                    .with("machine", machine)
                    .with("profile", profile),
            )
        })
}

pub fn all() -> &'static [ProfileManifest] {
    &PROFILES
}

/// Validates a step order: the CPU leads, every key appears exactly once.
pub fn validate_step_order(order: &[ComponentKey]) -> Result<(), EngineError> {
    if order.first() != Some(&ComponentKey::Cpu) {
        return Err(EngineError::internal(
            "scheduler step order must begin with the cpu",
        ));
    }
    for (i, key) in order.iter().enumerate() {
        if order[i + 1..].contains(key) {
            return Err(EngineError::internal(format!(
                "scheduler step order lists {} twice",
                key.as_str()
            )));
        }
    }
    Ok(())
}

/// Lowers a manifest into machine-core construction parameters.
pub fn machine_config(manifest: &ProfileManifest, sample_rate: u32) -> MachineConfig {
    MachineConfig {
        ram_bytes: manifest.ram_kb as usize * 1024,
        region: manifest.region,
        sample_rate,
        step_order: manifest.step_order.clone(),
        ..MachineConfig::default()
    }
}
