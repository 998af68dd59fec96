//! Snapshot engine: versioned, length-prefixed, component-ordered binary
//! records with a trailing checksum, plus the JSON index beside them.
//!
//! Layout: magic `STSN`, schema version, a JSON header (identity and ABI
//! fields), then one length-prefixed block per component in step order,
//! RAM as a raw block, the scheduler counters, and the media binding list.
//! The sha256 over everything before the trailer closes the record. Save
//! goes through `.staging/<id>.part` and an atomic rename; the index is
//! rewritten the same way, so a crash leaves either the old record set or
//! the new one, never a torn file.

use engine_abi::{EngineError, ErrorCode, ErrorDetails, MediaBinding, ProfileManifest, ENGINE_ABI, SCHEMA_VERSION};
use machine_core::MachineState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

const MAGIC: &[u8; 4] = b"STSN";

/// Scheduler counters persisted alongside component state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerCounters {
    pub tick_counter: u64,
    pub cycle_counter: u64,
    pub mode_transition_seq: u64,
}

/// Snapshot identity and compatibility header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub name: String,
    pub schema_version: u32,
    pub profile: String,
    pub engine_abi: String,
    pub modules: BTreeMap<String, String>,
    pub sha256: String,
    pub saved_at_us: u64,
}

/// A fully loaded snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRecord {
    pub meta: SnapshotMeta,
    pub state: MachineState,
    pub counters: SchedulerCounters,
    pub media: Vec<MediaBinding>,
}

/// ACIA sub-blocks are persisted as one component block.
#[derive(Serialize, Deserialize)]
struct AciaBlock {
    keyboard: machine_core::acia::AciaState,
    midi: machine_core::acia::AciaState,
    ikbd: machine_core::acia::IkbdState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SnapshotIndex {
    snapshots: Vec<SnapshotMeta>,
}

pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> SnapshotStore {
        SnapshotStore { root: root.into() }
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(format!("{id}.bin"))
    }

    fn index_path(&self) -> PathBuf {
        self.snapshots_dir().join("index.json")
    }

    /// Serializes and persists a record; returns the completed header.
    pub fn save(
        &self,
        id: &str,
        name: &str,
        profile: &ProfileManifest,
        state: &MachineState,
        counters: SchedulerCounters,
        media: &[MediaBinding],
        saved_at_us: u64,
    ) -> Result<SnapshotMeta, EngineError> {
        let mut meta = SnapshotMeta {
            snapshot_id: id.to_owned(),
            name: name.to_owned(),
            schema_version: SCHEMA_VERSION,
            profile: profile.name.clone(),
            engine_abi: ENGINE_ABI.to_owned(),
            modules: profile.modules.as_map(),
            sha256: String::new(),
            saved_at_us,
        };

        let mut body = Vec::with_capacity(state.ram.len() + 64 * 1024);
        body.extend_from_slice(MAGIC);
        body.extend_from_slice(&SCHEMA_VERSION.to_be_bytes());
        let header = serde_json::to_vec(&meta).map_err(ser_error)?;
        push_block(&mut body, "header", &header);
        for (block_name, bytes) in component_blocks(state)? {
            push_block(&mut body, block_name, &bytes);
        }
        push_block(&mut body, "ram", &state.ram);
        push_block(
            &mut body,
            "scheduler",
            &serde_json::to_vec(&counters).map_err(ser_error)?,
        );
        push_block(
            &mut body,
            "media",
            &serde_json::to_vec(media).map_err(ser_error)?,
        );
        let digest = Sha256::digest(&body);
        meta.sha256 = hex::encode(digest);
        body.extend_from_slice(&digest);

        // Stage, fsync, rename.
        let staging_dir = self.root.join(".staging");
        fs::create_dir_all(&staging_dir).map_err(save_io)?;
        fs::create_dir_all(self.snapshots_dir()).map_err(save_io)?;
        let staging = staging_dir.join(format!("{id}.part"));
        let mut file = fs::File::create(&staging).map_err(save_io)?;
        file.write_all(&body).map_err(save_io)?;
        file.sync_all().map_err(save_io)?;
        drop(file);
        fs::rename(&staging, self.record_path(id)).map_err(save_io)?;

        self.update_index(|index| {
            index.snapshots.retain(|m| m.snapshot_id != meta.snapshot_id);
            index.snapshots.push(meta.clone());
        })?;
        Ok(meta)
    }

    /// Enumerates persisted snapshots from the index alone.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>, EngineError> {
        Ok(self.read_index()?.snapshots)
    }

    /// Loads and checksums a record.
    pub fn load(&self, id: &str) -> Result<SnapshotRecord, EngineError> {
        let path = self.record_path(id);
        let body = fs::read(&path).map_err(|_| {
            EngineError::new(
                ErrorCode::SnapshotNotFound,
                format!("snapshot {id} is not in the store"),
            )
            .with_details(ErrorDetails::default().with("snapshot_id", id))
        })?;
        if body.len() < MAGIC.len() + 4 + 32 || &body[..4] != MAGIC {
            return Err(restore_failed(id, "bad magic"));
        }
        let (payload, trailer) = body.split_at(body.len() - 32);
        let digest = Sha256::digest(payload);
        if digest.as_slice() != trailer {
            return Err(restore_failed(id, "checksum mismatch"));
        }

        let mut cursor = &payload[8..];
        let mut blocks: Vec<(String, Vec<u8>)> = Vec::new();
        while !cursor.is_empty() {
            let (name, bytes, rest) =
                pop_block(cursor).ok_or_else(|| restore_failed(id, "truncated block"))?;
            blocks.push((name, bytes));
            cursor = rest;
        }
        let meta: SnapshotMeta = serde_json::from_slice(take_block(&blocks, "header", id)?)
            .map_err(|e| restore_failed(id, &format!("header: {e}")))?;
        let state = decode_state(&blocks, id)?;
        let counters: SchedulerCounters =
            serde_json::from_slice(take_block(&blocks, "scheduler", id)?)
                .map_err(|e| restore_failed(id, &format!("scheduler: {e}")))?;
        let media: Vec<MediaBinding> = serde_json::from_slice(take_block(&blocks, "media", id)?)
            .map_err(|e| restore_failed(id, &format!("media: {e}")))?;
        Ok(SnapshotRecord {
            meta: SnapshotMeta {
                sha256: hex::encode(digest),
                ..meta
            },
            state,
            counters,
            media,
        })
    }

    fn read_index(&self) -> Result<SnapshotIndex, EngineError> {
        match fs::read(self.index_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::internal(format!("snapshot index unreadable: {e}"))),
            Err(_) => Ok(SnapshotIndex::default()),
        }
    }

    fn update_index(&self, apply: impl FnOnce(&mut SnapshotIndex)) -> Result<(), EngineError> {
        let mut index = self.read_index()?;
        apply(&mut index);
        let bytes = serde_json::to_vec_pretty(&index).map_err(ser_error)?;
        let staging = self.index_path().with_extension("json.part");
        let mut file = fs::File::create(&staging).map_err(save_io)?;
        file.write_all(&bytes).map_err(save_io)?;
        file.sync_all().map_err(save_io)?;
        drop(file);
        fs::rename(&staging, self.index_path()).map_err(save_io)?;
        Ok(())
    }
}

/// Compatibility pipeline; the first failing rule short-circuits.
pub fn validate_compat(
    meta: &SnapshotMeta,
    profile: &ProfileManifest,
) -> Result<(), EngineError> {
    if meta.schema_version != SCHEMA_VERSION {
        return Err(incompatible(
            "RCOMP-01",
            format!(
                "schema {} does not match engine schema {}",
                meta.schema_version, SCHEMA_VERSION
            ),
        ));
    }
    if meta.profile != profile.name {
        return Err(incompatible(
            "RCOMP-02",
            format!(
                "snapshot profile {} does not match session profile {}",
                meta.profile, profile.name
            ),
        ));
    }
    if meta.engine_abi != ENGINE_ABI {
        return Err(incompatible(
            "RCOMP-03",
            format!("engine abi {} does not match {}", meta.engine_abi, ENGINE_ABI),
        ));
    }
    // Module ABI is an exact-equality check, by rule.
    if meta.modules != profile.modules.as_map() {
        return Err(incompatible(
            "RCOMP-04",
            "module abi map does not match the active profile".to_owned(),
        ));
    }
    Ok(())
}

fn incompatible(rule_id: &'static str, message: String) -> EngineError {
    EngineError::new(ErrorCode::SnapshotIncompatible, message)
        .with_details(ErrorDetails::rule(rule_id))
}

fn restore_failed(id: &str, message: &str) -> EngineError {
    EngineError::new(
        ErrorCode::SnapshotRestoreFailed,
        format!("snapshot {id}: {message}"),
    )
    .with_details(ErrorDetails::default().with("snapshot_id", id))
}

fn ser_error(err: serde_json::Error) -> EngineError {
    EngineError::new(ErrorCode::SnapshotSaveFailed, format!("serialize: {err}"))
}

fn save_io(err: std::io::Error) -> EngineError {
    EngineError::new(ErrorCode::SnapshotSaveFailed, format!("io: {err}"))
}

fn push_block(out: &mut Vec<u8>, name: &str, bytes: &[u8]) {
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn pop_block(cursor: &[u8]) -> Option<(String, Vec<u8>, &[u8])> {
    if cursor.len() < 2 {
        return None;
    }
    let name_len = u16::from_be_bytes([cursor[0], cursor[1]]) as usize;
    let cursor = &cursor[2..];
    if cursor.len() < name_len + 4 {
        return None;
    }
    let name = String::from_utf8(cursor[..name_len].to_vec()).ok()?;
    let cursor = &cursor[name_len..];
    let len = u32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
    let cursor = &cursor[4..];
    if cursor.len() < len {
        return None;
    }
    Some((name, cursor[..len].to_vec(), &cursor[len..]))
}

fn take_block<'b>(
    blocks: &'b [(String, Vec<u8>)],
    name: &str,
    id: &str,
) -> Result<&'b [u8], EngineError> {
    blocks
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, bytes)| bytes.as_slice())
        .ok_or_else(|| restore_failed(id, &format!("missing {name} block")))
}

/// Per-component JSON blocks in step order.
fn component_blocks(state: &MachineState) -> Result<Vec<(&'static str, Vec<u8>)>, EngineError> {
    let acia = AciaBlock {
        keyboard: state.acia_keyboard.clone(),
        midi: state.acia_midi.clone(),
        ikbd: state.ikbd.clone(),
    };
    Ok(vec![
        ("cpu", serde_json::to_vec(&state.cpu).map_err(ser_error)?),
        ("glue", serde_json::to_vec(&state.glue).map_err(ser_error)?),
        (
            "shifter",
            serde_json::to_vec(&state.shifter).map_err(ser_error)?,
        ),
        ("mfp", serde_json::to_vec(&state.mfp).map_err(ser_error)?),
        ("psg", serde_json::to_vec(&state.psg).map_err(ser_error)?),
        ("acia", serde_json::to_vec(&acia).map_err(ser_error)?),
        ("dma", serde_json::to_vec(&state.dma).map_err(ser_error)?),
    ])
}

fn decode_state(blocks: &[(String, Vec<u8>)], id: &str) -> Result<MachineState, EngineError> {
    let parse_err = |name: &str, e: serde_json::Error| restore_failed(id, &format!("{name}: {e}"));
    let acia: AciaBlock = serde_json::from_slice(take_block(blocks, "acia", id)?)
        .map_err(|e| parse_err("acia", e))?;
    Ok(MachineState {
        cpu: serde_json::from_slice(take_block(blocks, "cpu", id)?)
            .map_err(|e| parse_err("cpu", e))?,
        glue: serde_json::from_slice(take_block(blocks, "glue", id)?)
            .map_err(|e| parse_err("glue", e))?,
        shifter: serde_json::from_slice(take_block(blocks, "shifter", id)?)
            .map_err(|e| parse_err("shifter", e))?,
        mfp: serde_json::from_slice(take_block(blocks, "mfp", id)?)
            .map_err(|e| parse_err("mfp", e))?,
        psg: serde_json::from_slice(take_block(blocks, "psg", id)?)
            .map_err(|e| parse_err("psg", e))?,
        acia_keyboard: acia.keyboard,
        acia_midi: acia.midi,
        ikbd: acia.ikbd,
        dma: serde_json::from_slice(take_block(blocks, "dma", id)?)
            .map_err(|e| parse_err("dma", e))?,
        ram: take_block(blocks, "ram", id)?.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile;
    use machine_core::{Machine, MachineConfig};
    use pretty_assertions::assert_eq;

    fn sample_state() -> MachineState {
        let mut machine = Machine::new(MachineConfig::default());
        machine.reset();
        for tick in 0..5 {
            machine.bus.write_word(machine.cpu.pc, 0x4E71);
            machine.run_tick(tick, tick * 512).expect("tick");
        }
        machine.state()
    }

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn save_load_round_trip_is_byte_identical() {
        let (_dir, store) = store();
        let manifest = profile::find("atari_st", "st_520_pal").expect("profile");
        let state = sample_state();
        let counters = SchedulerCounters {
            tick_counter: 5,
            cycle_counter: 2560,
            mode_transition_seq: 0,
        };
        let meta = store
            .save("snap-1", "t1", manifest, &state, counters, &[], 42)
            .expect("save");
        assert_eq!(meta.sha256.len(), 64);

        let record = store.load("snap-1").expect("load");
        assert_eq!(record.meta.sha256, meta.sha256);
        assert_eq!(record.counters, counters);
        // Component blocks re-serialize identically after the round trip.
        let before = component_blocks(&state).expect("blocks");
        let after = component_blocks(&record.state).expect("blocks");
        assert_eq!(before, after);
        assert_eq!(record.state.ram, state.ram);
    }

    #[test]
    fn index_lists_snapshots_without_opening_records() {
        let (_dir, store) = store();
        let manifest = profile::find("atari_st", "st_520_pal").expect("profile");
        let state = sample_state();
        store
            .save("snap-a", "a", manifest, &state, SchedulerCounters::default(), &[], 1)
            .expect("save a");
        store
            .save("snap-b", "b", manifest, &state, SchedulerCounters::default(), &[], 2)
            .expect("save b");
        let listing = store.list().expect("list");
        assert_eq!(listing.len(), 2);
        assert!(listing.iter().any(|m| m.snapshot_id == "snap-a"));
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let (_dir, store) = store();
        let err = store.load("ghost").expect_err("missing");
        assert_eq!(err.code, ErrorCode::SnapshotNotFound);
    }

    #[test]
    fn corrupted_record_fails_restore() {
        let (_dir, store) = store();
        let manifest = profile::find("atari_st", "st_520_pal").expect("profile");
        let state = sample_state();
        store
            .save("snap-x", "x", manifest, &state, SchedulerCounters::default(), &[], 1)
            .expect("save");
        let path = store.record_path("snap-x");
        let mut bytes = fs::read(&path).expect("read");
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, bytes).expect("rewrite");
        let err = store.load("snap-x").expect_err("corrupt");
        assert_eq!(err.code, ErrorCode::SnapshotRestoreFailed);
    }

    #[test]
    fn compat_pipeline_short_circuits_in_order() {
        let manifest = profile::find("atari_st", "st_520_pal").expect("profile");
        let good = SnapshotMeta {
            snapshot_id: "s".into(),
            name: "s".into(),
            schema_version: SCHEMA_VERSION,
            profile: manifest.name.clone(),
            engine_abi: ENGINE_ABI.into(),
            modules: manifest.modules.as_map(),
            sha256: String::new(),
            saved_at_us: 0,
        };
        validate_compat(&good, manifest).expect("compatible");

        let bad_schema = SnapshotMeta {
            schema_version: 99,
            profile: "other".into(),
            ..good.clone()
        };
        let err = validate_compat(&bad_schema, manifest).expect_err("schema first");
        assert_eq!(err.details.rule_id, Some("RCOMP-01"));

        let bad_profile = SnapshotMeta {
            profile: "st_1040_pal".into(),
            ..good.clone()
        };
        let err = validate_compat(&bad_profile, manifest).expect_err("profile");
        assert_eq!(err.details.rule_id, Some("RCOMP-02"));

        let bad_abi = SnapshotMeta {
            engine_abi: "stx-engine/0".into(),
            ..good.clone()
        };
        let err = validate_compat(&bad_abi, manifest).expect_err("abi");
        assert_eq!(err.details.rule_id, Some("RCOMP-03"));

        let mut bad_modules = good.clone();
        bad_modules
            .modules
            .insert("cpu".into(), "m68010/1.0".into());
        let err = validate_compat(&bad_modules, manifest).expect_err("modules");
        assert_eq!(err.details.rule_id, Some("RCOMP-04"));
        assert_eq!(err.code, ErrorCode::SnapshotIncompatible);
    }
}
