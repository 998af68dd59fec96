#![deny(unsafe_op_in_unsafe_fn)]
#![allow(missing_docs)]

//! The emulation engine: lifecycle, scheduler, snapshots, and the command
//! surface the transport layer talks to.
//!
//! [`Engine::new`] spawns the emulation task on its own thread; every
//! method here is a thin envelope that enqueues a command and waits for
//! the reply the task sends back from a tick boundary. Mapping profile
//! CRUD and snapshot listing run on the caller's thread against the
//! persistent stores; everything that touches live machine state goes
//! through the task.

mod clock;
mod lifecycle;
pub mod media;
pub mod profile;
mod scheduler;
pub mod snapshot;

pub use scheduler::{
    ClockReply, InjectOutcome, InspectReply, LifecycleOutcome, MediaOutcome, SloEvent,
    AUDIO_SAMPLE_RATE,
};
pub use snapshot::{SchedulerCounters, SnapshotMeta};
pub use stream_fabric::{AudioChunk, Subscription, VideoFrame};

use crossbeam_channel::{bounded, Sender};
use engine_abi::{
    BusTraceEvent, BusTraceFilter, CaptureMode, ClockCmd, ClockMode, DiffMode, EngineError,
    EngineResult, EngineStatusEvent, ErrorCode, HostEvent, InputTranslatedEvent, InspectCmd,
    LifecycleCmd, MappingEntry, MappingProfile, MediaDescriptor, MediaSlot, MemoryTraceEvent,
    MemoryTraceFilter, ModeChangeOutcome, PolicyChangeEvent, PolicyHook, RegisterDiffEvent,
    RegisterSelector, SessionInfo, SloConfig, SloMetric, StepOutcome,
};
use input_bridge::{ActiveMappings, ApplyOutcome, MappingStore, TranslatorDiagnostics};
use scheduler::{Command, EmuTask};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Construction parameters for the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root of the persistent state tree (snapshots, mapping profiles).
    pub data_root: PathBuf,
}

/// Handle to a running emulation engine.
pub struct Engine {
    cmd_tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    mappings: MappingStore,
    snapshots: snapshot::SnapshotStore,
}

impl Engine {
    /// Spawns the emulation task and returns the command handle.
    pub fn new(config: EngineConfig) -> Engine {
        let (cmd_tx, cmd_rx) = bounded(256);
        let active_mappings = Arc::new(ActiveMappings::new());
        let task = EmuTask::new(cmd_rx, config.data_root.clone(), Arc::clone(&active_mappings));
        let thread = std::thread::Builder::new()
            .name("emu-task".into())
            .spawn(move || task.run())
            .expect("spawn emulation task");
        Engine {
            cmd_tx,
            thread: Some(thread),
            mappings: MappingStore::new(&config.data_root),
            snapshots: snapshot::SnapshotStore::new(&config.data_root),
        }
    }

    fn request<T>(&self, build: impl FnOnce(scheduler::Reply<T>) -> Command) -> EngineResult<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx.send(build(reply_tx)).map_err(|_| {
            EngineError::new(
                ErrorCode::EngineSubsystemUnavailable,
                "emulation task is gone",
            )
        })?;
        reply_rx.recv().map_err(|_| {
            EngineError::new(
                ErrorCode::EngineSubsystemUnavailable,
                "emulation task dropped the reply",
            )
        })?
    }

    // --- lifecycle ---

    pub fn lifecycle(&self, cmd: LifecycleCmd) -> EngineResult<LifecycleOutcome> {
        self.request(|reply| Command::Lifecycle(cmd, reply))
    }

    pub fn start(
        &self,
        machine: &str,
        profile: &str,
        rom_id: Option<&str>,
    ) -> EngineResult<LifecycleOutcome> {
        self.lifecycle(LifecycleCmd::Start {
            machine: machine.to_owned(),
            profile: profile.to_owned(),
            rom_id: rom_id.map(str::to_owned),
        })
    }

    pub fn stop(&self) -> EngineResult<LifecycleOutcome> {
        self.lifecycle(LifecycleCmd::Stop)
    }

    pub fn session_info(&self) -> EngineResult<SessionInfo> {
        self.request(Command::SessionInfo)
    }

    // --- debug clock ---

    pub fn set_clock_mode(&self, mode: ClockMode) -> EngineResult<ModeChangeOutcome> {
        match self.request(|reply| Command::Clock(ClockCmd::SetMode { mode }, reply))? {
            ClockReply::Mode(outcome) => Ok(outcome),
            ClockReply::Step(_) => Err(EngineError::internal("mode change answered with a step")),
        }
    }

    pub fn step(&self, steps: u32) -> EngineResult<StepOutcome> {
        match self.request(|reply| Command::Clock(ClockCmd::Step { steps }, reply))? {
            ClockReply::Step(outcome) => Ok(outcome),
            ClockReply::Mode(_) => Err(EngineError::internal("step answered with a mode change")),
        }
    }

    // --- media ---

    pub fn attach_media(
        &self,
        slot: MediaSlot,
        descriptor: MediaDescriptor,
    ) -> EngineResult<MediaOutcome> {
        self.request(|reply| Command::Media(engine_abi::MediaCmd::Attach { slot, descriptor }, reply))
    }

    pub fn eject_media(&self, slot: MediaSlot) -> EngineResult<MediaOutcome> {
        self.request(|reply| Command::Media(engine_abi::MediaCmd::Eject { slot }, reply))
    }

    // --- inspection ---

    pub fn inspect(&self, cmd: InspectCmd) -> EngineResult<InspectReply> {
        self.request(|reply| Command::Inspect(cmd, reply))
    }

    // --- streams ---

    pub fn subscribe_video(&self) -> EngineResult<Subscription<VideoFrame>> {
        self.subscribe_video_with_capacity(stream_fabric::DEFAULT_QUEUE_CAPACITY)
    }

    /// Subscription with an explicit queue bound, for constrained clients.
    pub fn subscribe_video_with_capacity(
        &self,
        capacity: usize,
    ) -> EngineResult<Subscription<VideoFrame>> {
        self.request(|reply| Command::SubscribeVideo(capacity, reply))
    }

    pub fn subscribe_audio(&self) -> EngineResult<Subscription<AudioChunk>> {
        self.request(Command::SubscribeAudio)
    }

    pub fn subscribe_status(&self) -> EngineResult<Subscription<EngineStatusEvent>> {
        self.request(Command::SubscribeStatus)
    }

    pub fn subscribe_register_diffs(
        &self,
        selector: RegisterSelector,
        mode: DiffMode,
    ) -> EngineResult<Subscription<RegisterDiffEvent>> {
        self.request(|reply| Command::SubscribeRegisterDiffs(selector, mode, reply))
    }

    pub fn subscribe_bus_trace(
        &self,
        filter: BusTraceFilter,
    ) -> EngineResult<Subscription<BusTraceEvent>> {
        self.request(|reply| Command::SubscribeBusTrace(filter, reply))
    }

    pub fn subscribe_memory_trace(
        &self,
        filter: MemoryTraceFilter,
    ) -> EngineResult<Subscription<MemoryTraceEvent>> {
        self.request(|reply| Command::SubscribeMemoryTrace(filter, reply))
    }

    pub fn subscribe_input_events(&self) -> EngineResult<Subscription<InputTranslatedEvent>> {
        self.request(Command::SubscribeInput)
    }

    pub fn subscribe_policy_events(&self) -> EngineResult<Subscription<PolicyChangeEvent>> {
        self.request(Command::SubscribePolicy)
    }

    pub fn subscribe_slo(&self) -> EngineResult<Subscription<SloEvent>> {
        self.request(Command::SubscribeSlo)
    }

    // --- SLO ---

    pub fn configure_slo(&self, config: SloConfig) -> EngineResult<SloConfig> {
        self.request(|reply| Command::ConfigureSlo(config, reply))
    }

    pub fn set_slo_threshold(&self, metric: SloMetric, threshold: f64) -> EngineResult<f64> {
        self.request(|reply| Command::SetSloThreshold(metric, threshold, reply))
    }

    // --- input ---

    pub fn inject_host_event(
        &self,
        browser_session: &str,
        event: HostEvent,
    ) -> EngineResult<InjectOutcome> {
        let browser_session = browser_session.to_owned();
        let enqueued_at = Instant::now();
        self.request(|reply| Command::InjectInput {
            browser_session,
            event,
            enqueued_at,
            reply,
        })
    }

    pub fn policy_set_enabled(
        &self,
        browser_session: &str,
        enabled: bool,
    ) -> EngineResult<PolicyChangeEvent> {
        let browser_session = browser_session.to_owned();
        self.request(|reply| Command::PolicySetEnabled {
            browser_session,
            enabled,
            reply,
        })
    }

    pub fn policy_set_mode(
        &self,
        browser_session: &str,
        mode: CaptureMode,
    ) -> EngineResult<PolicyChangeEvent> {
        let browser_session = browser_session.to_owned();
        self.request(|reply| Command::PolicySetMode {
            browser_session,
            mode,
            reply,
        })
    }

    pub fn policy_hook(
        &self,
        browser_session: &str,
        hook: PolicyHook,
    ) -> EngineResult<PolicyChangeEvent> {
        let browser_session = browser_session.to_owned();
        self.request(|reply| Command::PolicyHookCmd {
            browser_session,
            hook,
            reply,
        })
    }

    pub fn input_diagnostics(&self) -> EngineResult<TranslatorDiagnostics> {
        self.request(Command::InputDiagnostics)
    }

    // --- mapping profiles (store CRUD on the caller thread) ---

    pub fn mapping_load_machine(&self, machine: &str) -> EngineResult<usize> {
        self.mappings.load_machine(machine)
    }

    pub fn mapping_create(
        &self,
        machine: &str,
        st_profile: &str,
        id: &str,
        entries: Vec<MappingEntry>,
    ) -> EngineResult<Arc<MappingProfile>> {
        self.mappings
            .create(machine, st_profile, id, entries, wall_clock_us())
    }

    pub fn mapping_update(
        &self,
        machine: &str,
        id: &str,
        entries: Vec<MappingEntry>,
    ) -> EngineResult<Arc<MappingProfile>> {
        self.mappings.update(machine, id, entries, wall_clock_us())
    }

    pub fn mapping_get(&self, machine: &str, id: &str) -> Option<Arc<MappingProfile>> {
        self.mappings.get(machine, id)
    }

    pub fn mapping_list(&self, machine: &str) -> Vec<Arc<MappingProfile>> {
        self.mappings.list(machine)
    }

    pub fn mapping_delete(&self, machine: &str, id: &str) -> EngineResult<()> {
        self.mappings.delete(machine, id)
    }

    /// Applies a stored profile to the (session, browser session) pair,
    /// cutting over at the next tick boundary.
    pub fn mapping_apply(
        &self,
        browser_session: &str,
        machine: &str,
        id: &str,
        expected_revision: u64,
    ) -> EngineResult<ApplyOutcome> {
        let profile = self.mappings.get(machine, id).ok_or_else(|| {
            EngineError::new(
                ErrorCode::MappingNotFound,
                format!("mapping profile {machine}/{id} does not exist"),
            )
        })?;
        let browser_session = browser_session.to_owned();
        self.request(|reply| Command::ApplyMapping {
            browser_session,
            profile,
            expected_revision,
            reply,
        })
    }

    // --- snapshots ---

    pub fn snapshots_list(&self) -> EngineResult<Vec<SnapshotMeta>> {
        self.snapshots.list()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
