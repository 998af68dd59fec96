//! Mapping profile store and the cutover-atomic active reference.

use arc_swap::ArcSwapOption;
use engine_abi::{EngineError, ErrorCode, ErrorDetails, MappingEntry, MappingProfile, SCHEMA_VERSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

/// Persistent store of mapping profiles keyed by `(machine, id)`.
///
/// Writes go through a staging file and an atomic rename; the revision
/// counter bumps only when the effective entry list actually changes.
pub struct MappingStore {
    root: PathBuf,
    profiles: Mutex<HashMap<(String, String), Arc<MappingProfile>>>,
}

impl MappingStore {
    pub fn new(root: impl Into<PathBuf>) -> MappingStore {
        MappingStore {
            root: root.into(),
            profiles: Mutex::new(HashMap::new()),
        }
    }

    fn profile_path(&self, machine: &str, id: &str) -> PathBuf {
        self.root
            .join("input")
            .join("mappings")
            .join(machine)
            .join(format!("{id}.json"))
    }

    /// Loads every persisted profile for `machine` into the cache.
    pub fn load_machine(&self, machine: &str) -> Result<usize, EngineError> {
        let dir = self.root.join("input").join("mappings").join(machine);
        let mut loaded = 0;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        let mut profiles = self.profiles.lock();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(io_error)?;
            let profile: MappingProfile = serde_json::from_slice(&bytes).map_err(|e| {
                EngineError::new(
                    ErrorCode::MalformedRequest,
                    format!("unreadable mapping profile {}: {e}", path.display()),
                )
            })?;
            profiles.insert(
                (profile.machine.clone(), profile.mapping_profile_id.clone()),
                Arc::new(profile),
            );
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, machine: &str, id: &str) -> Option<Arc<MappingProfile>> {
        self.profiles
            .lock()
            .get(&(machine.to_owned(), id.to_owned()))
            .cloned()
    }

    pub fn list(&self, machine: &str) -> Vec<Arc<MappingProfile>> {
        let mut out: Vec<_> = self
            .profiles
            .lock()
            .iter()
            .filter(|((m, _), _)| m == machine)
            .map(|(_, profile)| Arc::clone(profile))
            .collect();
        out.sort_by(|a, b| a.mapping_profile_id.cmp(&b.mapping_profile_id));
        out
    }

    /// Creates a profile at revision 1 and persists it.
    pub fn create(
        &self,
        machine: &str,
        st_profile: &str,
        id: &str,
        entries: Vec<MappingEntry>,
        now_us: u64,
    ) -> Result<Arc<MappingProfile>, EngineError> {
        let profile = Arc::new(MappingProfile {
            mapping_profile_id: id.to_owned(),
            schema_version: SCHEMA_VERSION,
            machine: machine.to_owned(),
            profile: st_profile.to_owned(),
            revision: 1,
            updated_at_us: now_us,
            entries,
        });
        self.persist(&profile)?;
        self.profiles.lock().insert(
            (machine.to_owned(), id.to_owned()),
            Arc::clone(&profile),
        );
        Ok(profile)
    }

    /// Replaces the entry list; the revision bumps only on effective change.
    pub fn update(
        &self,
        machine: &str,
        id: &str,
        entries: Vec<MappingEntry>,
        now_us: u64,
    ) -> Result<Arc<MappingProfile>, EngineError> {
        let current = self.get(machine, id).ok_or_else(|| not_found(machine, id))?;
        if current.entries == entries {
            return Ok(current);
        }
        let updated = Arc::new(MappingProfile {
            revision: current.revision + 1,
            updated_at_us: now_us,
            entries,
            ..(*current).clone()
        });
        self.persist(&updated)?;
        self.profiles.lock().insert(
            (machine.to_owned(), id.to_owned()),
            Arc::clone(&updated),
        );
        Ok(updated)
    }

    pub fn delete(&self, machine: &str, id: &str) -> Result<(), EngineError> {
        let removed = self
            .profiles
            .lock()
            .remove(&(machine.to_owned(), id.to_owned()));
        if removed.is_none() {
            return Err(not_found(machine, id));
        }
        let path = self.profile_path(machine, id);
        if path.exists() {
            fs::remove_file(path).map_err(io_error)?;
        }
        Ok(())
    }

    /// Stage-and-rename persistence so a crash never leaves a torn document.
    fn persist(&self, profile: &MappingProfile) -> Result<(), EngineError> {
        let path = self.profile_path(&profile.machine, &profile.mapping_profile_id);
        let parent = path.parent().expect("profile paths have parents");
        fs::create_dir_all(parent).map_err(io_error)?;
        let staging = path.with_extension("json.part");
        let bytes = serde_json::to_vec_pretty(profile)
            .map_err(|e| EngineError::internal(format!("serialize mapping profile: {e}")))?;
        let mut file = fs::File::create(&staging).map_err(io_error)?;
        file.write_all(&bytes).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        fs::rename(&staging, &path).map_err(io_error)?;
        log::debug!(
            "persisted mapping profile {}/{} at revision {}",
            profile.machine,
            profile.mapping_profile_id,
            profile.revision
        );
        Ok(())
    }
}

fn io_error(err: std::io::Error) -> EngineError {
    EngineError::internal(format!("mapping store io: {err}"))
}

fn not_found(machine: &str, id: &str) -> EngineError {
    EngineError::new(
        ErrorCode::MappingNotFound,
        format!("mapping profile {machine}/{id} does not exist"),
    )
}

/// Result of an apply request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyResult {
    Applied,
    NoOp,
}

/// Response payload for an accepted apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub result: ApplyResult,
    pub revision: u64,
    /// First tick at which the new mapping is observable.
    pub cutover_tick: u64,
}

/// Snapshot of an active mapping reference.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveProfile {
    pub profile: Arc<MappingProfile>,
    pub cutover_tick: u64,
}

/// Copy-on-write active mapping per `(session, browser_session)`.
///
/// Readers load an immutable snapshot and keep using it until the next
/// cutover; the swap itself is atomic.
pub struct ActiveMappings {
    active: Mutex<HashMap<(String, String), Arc<ArcSwapOption<ActiveProfile>>>>,
}

impl ActiveMappings {
    pub fn new() -> ActiveMappings {
        ActiveMappings {
            active: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, session: &str, browser: &str) -> Arc<ArcSwapOption<ActiveProfile>> {
        let mut map = self.active.lock();
        Arc::clone(
            map.entry((session.to_owned(), browser.to_owned()))
                .or_insert_with(|| Arc::new(ArcSwapOption::from(None))),
        )
    }

    /// Current snapshot; `None` until the first apply.
    pub fn current(&self, session: &str, browser: &str) -> Option<Arc<ActiveProfile>> {
        self.slot(session, browser).load_full()
    }

    /// Applies `profile` with optimistic concurrency on its revision.
    ///
    /// The cutover becomes observable at `current_tick + 1`; events already
    /// translated this tick keep the prior mapping.
    pub fn apply(
        &self,
        session: &str,
        browser: &str,
        profile: Arc<MappingProfile>,
        expected_revision: u64,
        current_tick: u64,
    ) -> Result<ApplyOutcome, EngineError> {
        if profile.revision != expected_revision {
            return Err(EngineError::new(
                ErrorCode::Conflict,
                format!(
                    "expected revision {expected_revision}, profile {} is at {}",
                    profile.mapping_profile_id, profile.revision
                ),
            )
            .with_details(
                ErrorDetails::default()
                    .with("expected_revision", expected_revision)
                    .with("active_revision", profile.revision),
            ));
        }
        let slot = self.slot(session, browser);
        if let Some(active) = slot.load_full() {
            if active.profile.mapping_profile_id == profile.mapping_profile_id
                && active.profile.revision == profile.revision
            {
                return Ok(ApplyOutcome {
                    result: ApplyResult::NoOp,
                    revision: profile.revision,
                    cutover_tick: active.cutover_tick,
                });
            }
        }
        let cutover_tick = current_tick + 1;
        let revision = profile.revision;
        slot.store(Some(Arc::new(ActiveProfile {
            profile,
            cutover_tick,
        })));
        Ok(ApplyOutcome {
            result: ApplyResult::Applied,
            revision,
            cutover_tick,
        })
    }
}

impl Default for ActiveMappings {
    fn default() -> Self {
        Self::new()
    }
}
