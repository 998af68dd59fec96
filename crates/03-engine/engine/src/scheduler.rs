//! The emulation task: a single thread owning the machine, the counters,
//! and every publisher's write side.
//!
//! Commands arrive over a bounded channel and commit only between ticks;
//! nothing on the hot path blocks on subscribers, disk, or callers. In
//! continuous modes the loop paces against the wall clock scaled by the
//! effective ratio; in `paused` and `single_step` it sleeps in short
//! increments waiting for commands.

use crate::clock::DebugClock;
use crate::lifecycle::{self, TransitionEffect};
use crate::media::{self, MediaBindings, MediaPayload};
use crate::profile;
use crate::snapshot::{validate_compat, SchedulerCounters, SnapshotStore};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use engine_abi::{
    ArbStats, AudioFormat, BusTraceEvent, BusTraceFilter, CaptureMode, CapturePayload, ClockCmd,
    ClockMode, ComponentKey, DiffMode, EngineError, EngineResult, EngineStatusEvent, ErrorCode,
    EventStamp, HostEvent, InputTranslatedEvent, InspectCmd, LifecycleCmd, LifecycleState,
    MappingProfile, MediaBinding, MediaCmd, MemoryTraceEvent, MemoryTraceFilter,
    ModeChangeOutcome, Phase, PixelFormat, PolicyChangeEvent, PolicyHook, PolicySource,
    ProfileManifest, RegisterDiffEvent, RegisterSelector, Region, SessionInfo, SloAlarm,
    SloConfig, SloMetric, SloSample, StepOutcome, ValueEncoding, VirtualTarget,
};
use input_bridge::{
    ActiveMappings, ApplyOutcome, CapturePolicy, PolicyConfig, PolicyRegistry, SequenceChecker,
    Translator, TranslatorDiagnostics,
};
use machine_core::cpu::CpuState;
use machine_core::{Machine, TickReport};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_fabric::{
    AudioChunk, AudioPublisher, BusTracePublisher, MemoryTracePublisher, PublishOutcome,
    Publisher, RegisterDiffPublisher, SloSampler, StatusPublisher, Subscription, VideoFrame,
    VideoPublisher, DEFAULT_QUEUE_CAPACITY,
};

/// Output sample rate for the audio stream.
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Maximum single-step batch.
const MAX_STEPS: u32 = 1024;

/// Maximum inspection window.
const MAX_INSPECT_BYTES: u32 = 64 * 1024;

pub type Reply<T> = Sender<EngineResult<T>>;

/// Lifecycle command response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LifecycleOutcome {
    pub state: LifecycleState,
    pub session_id: Option<String>,
    pub snapshot_id: Option<String>,
}

/// Media command response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MediaOutcome {
    pub slot: String,
    pub attached: bool,
}

/// Inspection responses.
#[derive(Clone, Debug, PartialEq)]
pub enum InspectReply {
    Cpu(CpuState),
    Chip { component: String, bytes: Vec<u8> },
    Memory { base: u32, bytes: Vec<u8> },
    Bus {
        bus_errors: u64,
        last_bus_error: Option<engine_abi::BusErrorRecord>,
    },
}

/// Input injection response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct InjectOutcome {
    pub translated: u32,
    pub capture_active: bool,
}

/// SLO stream payloads.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum SloEvent {
    Sample(SloSample),
    Alarm(SloAlarm),
}

/// Clock command responses share a reply type.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ClockReply {
    Mode(ModeChangeOutcome),
    Step(StepOutcome),
}

pub(crate) enum Command {
    Lifecycle(LifecycleCmd, Reply<LifecycleOutcome>),
    Clock(ClockCmd, Reply<ClockReply>),
    Media(MediaCmd, Reply<MediaOutcome>),
    Inspect(InspectCmd, Reply<InspectReply>),
    SessionInfo(Reply<SessionInfo>),
    ApplyMapping {
        browser_session: String,
        profile: Arc<MappingProfile>,
        expected_revision: u64,
        reply: Reply<ApplyOutcome>,
    },
    InjectInput {
        browser_session: String,
        event: HostEvent,
        enqueued_at: Instant,
        reply: Reply<InjectOutcome>,
    },
    PolicySetEnabled {
        browser_session: String,
        enabled: bool,
        reply: Reply<PolicyChangeEvent>,
    },
    PolicySetMode {
        browser_session: String,
        mode: CaptureMode,
        reply: Reply<PolicyChangeEvent>,
    },
    PolicyHookCmd {
        browser_session: String,
        hook: PolicyHook,
        reply: Reply<PolicyChangeEvent>,
    },
    SubscribeVideo(usize, Reply<Subscription<VideoFrame>>),
    SubscribeAudio(Reply<Subscription<AudioChunk>>),
    SubscribeStatus(Reply<Subscription<EngineStatusEvent>>),
    SubscribeRegisterDiffs(
        RegisterSelector,
        DiffMode,
        Reply<Subscription<RegisterDiffEvent>>,
    ),
    SubscribeBusTrace(BusTraceFilter, Reply<Subscription<BusTraceEvent>>),
    SubscribeMemoryTrace(MemoryTraceFilter, Reply<Subscription<MemoryTraceEvent>>),
    SubscribeInput(Reply<Subscription<InputTranslatedEvent>>),
    SubscribePolicy(Reply<Subscription<PolicyChangeEvent>>),
    SubscribeSlo(Reply<Subscription<SloEvent>>),
    ConfigureSlo(SloConfig, Reply<SloConfig>),
    SetSloThreshold(SloMetric, f64, Reply<f64>),
    InputDiagnostics(Reply<TranslatorDiagnostics>),
    Shutdown,
}

struct Publishers {
    video: Vec<VideoPublisher>,
    audio: Vec<AudioPublisher>,
    status: Vec<StatusPublisher>,
    regdiff: Vec<RegisterDiffPublisher>,
    bus_trace: Vec<BusTracePublisher>,
    mem_trace: Vec<MemoryTracePublisher>,
    input: Vec<(Publisher<InputTranslatedEvent>, SequenceChecker)>,
    policy: Vec<Publisher<PolicyChangeEvent>>,
    slo: Vec<Publisher<SloEvent>>,
}

impl Publishers {
    fn new() -> Publishers {
        Publishers {
            video: Vec::new(),
            audio: Vec::new(),
            status: Vec::new(),
            regdiff: Vec::new(),
            bus_trace: Vec::new(),
            mem_trace: Vec::new(),
            input: Vec::new(),
            policy: Vec::new(),
            slo: Vec::new(),
        }
    }

    fn wants_bus_trace(&self) -> bool {
        !self.bus_trace.is_empty() || !self.mem_trace.is_empty()
    }

    fn wants_diffs(&self) -> bool {
        !self.regdiff.is_empty()
    }
}

struct SessionState {
    session_id: String,
    manifest: ProfileManifest,
    machine: Machine,
    lifecycle: LifecycleState,
    counters: SchedulerCounters,
    media: MediaBindings,
    started_at: Instant,
    last_transition_at_us: u64,
    last_error: Option<String>,
    frame_front: Vec<u16>,
    frame_back: Vec<u16>,
    next_tick_deadline: Instant,
    last_frame_at: Option<Instant>,
    joystick_state: u8,
}

pub(crate) struct EmuTask {
    cmd_rx: Receiver<Command>,
    snapshots: SnapshotStore,
    /// The snapshot gate: save/restore serialize against it while the
    /// loop is parked between ticks.
    snapshot_gate: Arc<parking_lot::Mutex<()>>,
    policies: PolicyRegistry,
    active_mappings: Arc<ActiveMappings>,
    translator: Translator,
    clock: DebugClock,
    session: Option<SessionState>,
    publishers: Publishers,
    slo: SloSampler,
    snapshot_seq: u64,
    session_seq: u64,
    cold_media: Vec<(MediaPayload, MediaBinding)>,
    trace_scratch: Vec<machine_core::AccessRecord>,
    diff_scratch: Vec<machine_core::RegDiffRecord>,
    gpio_scratch: Vec<machine_core::psg::GpioTransition>,
}

impl EmuTask {
    pub(crate) fn new(
        cmd_rx: Receiver<Command>,
        data_root: PathBuf,
        active_mappings: Arc<ActiveMappings>,
    ) -> EmuTask {
        EmuTask {
            cmd_rx,
            snapshots: SnapshotStore::new(&data_root),
            snapshot_gate: Arc::new(parking_lot::Mutex::new(())),
            policies: PolicyRegistry::new(PolicyConfig::default()),
            active_mappings,
            translator: Translator::new(),
            clock: DebugClock::new(),
            session: None,
            publishers: Publishers::new(),
            slo: SloSampler::new(SloConfig::default()).expect("default SLO config is in bounds"),
            snapshot_seq: 0,
            session_seq: 0,
            cold_media: Vec::new(),
            trace_scratch: Vec::new(),
            diff_scratch: Vec::new(),
            gpio_scratch: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let advancing = self
                .session
                .as_ref()
                .map(|s| s.lifecycle == LifecycleState::Running)
                .unwrap_or(false)
                && self.clock.is_continuous();
            if advancing {
                // Drain commands at the tick boundary, then commit a tick.
                while let Ok(cmd) = self.cmd_rx.try_recv() {
                    if self.handle(cmd) {
                        return;
                    }
                }
                self.run_one_tick();
            } else {
                match self.cmd_rx.recv_timeout(Duration::from_millis(5)) {
                    Ok(cmd) => {
                        if self.handle(cmd) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }

    fn lifecycle_state(&self) -> LifecycleState {
        self.session
            .as_ref()
            .map(|s| s.lifecycle)
            .unwrap_or(LifecycleState::Stopped)
    }

    fn now_us(&self) -> u64 {
        self.clock.wall_us()
    }

    // --- the committed tick ---

    /// Commits one tick and returns its report, or faults the session on
    /// an internal invariant violation.
    fn commit_tick(&mut self) -> Option<TickReport> {
        let (tick_before, cycle_before) = {
            let session = self.session.as_ref()?;
            (
                session.counters.tick_counter,
                session.counters.cycle_counter,
            )
        };
        let result = {
            let session = self.session.as_mut()?;
            session.machine.run_tick(tick_before, cycle_before)
        };
        match result {
            Ok(report) => {
                let session = self.session.as_mut()?;
                session.counters.tick_counter = tick_before + 1;
                session.counters.cycle_counter = cycle_before + report.cycles as u64;
                Some(report)
            }
            Err(violation) => {
                self.fault(format!(
                    "arbitration hook order violated at slot {} ({:?})",
                    violation.expected_slot, violation.got
                ));
                None
            }
        }
    }

    fn run_one_tick(&mut self) {
        let Some(report) = self.commit_tick() else {
            return;
        };
        let stamp = self.current_stamp();
        self.pump_observations(stamp);
        if report.frame_ready {
            self.publish_frame(stamp);
            // Interval-mode diff subscriptions coalesce per frame.
            for publisher in &mut self.publishers.regdiff {
                publisher.flush_interval(stamp);
            }
        }
        self.pump_slo(stamp);
        self.pace(report.cycles);
    }

    /// Drains bus traces, register diffs, and PSG GPIO transitions into
    /// their publishers. The machine-side queues are drained even with no
    /// subscribers so they stay bounded.
    fn pump_observations(&mut self, stamp: EventStamp) {
        {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            session.machine.bus.drain_trace(&mut self.trace_scratch);
            session.machine.bus.drain_diffs(&mut self.diff_scratch);
            session
                .machine
                .bus
                .psg
                .drain_gpio_transitions(&mut self.gpio_scratch);
        }

        for record in self.trace_scratch.drain(..) {
            let event = BusTraceEvent {
                addr: record.addr,
                access: record.access,
                size_bytes: record.size_bytes,
                value: record.value,
                component: record.master,
                level: 0,
                tick: stamp.tick,
                cycle: stamp.cycle,
            };
            for publisher in &mut self.publishers.bus_trace {
                publisher.offer(stamp, event.clone());
            }
            let memory_event = MemoryTraceEvent {
                addr: event.addr,
                access: event.access,
                size_bytes: event.size_bytes,
                value: event.value,
                component: event.component,
                level: event.level,
                region: record.region.to_owned(),
                mapped_target: record.region.to_owned(),
                tick: stamp.tick,
                cycle: stamp.cycle,
            };
            for publisher in &mut self.publishers.mem_trace {
                publisher.offer(stamp, memory_event.clone());
            }
        }

        for record in self.diff_scratch.drain(..) {
            let event = RegisterDiffEvent {
                component: record.component,
                register: record.register.to_owned(),
                old_value: record.old_value as u32,
                new_value: record.new_value as u32,
                value_encoding: ValueEncoding::Hex,
                value_bits: 8,
                tick: stamp.tick,
                cycle: stamp.cycle,
            };
            for publisher in &mut self.publishers.regdiff {
                publisher.offer(stamp, event.clone());
            }
        }

        for transition in self.gpio_scratch.drain(..) {
            let event = RegisterDiffEvent {
                component: ComponentKey::Psg,
                register: if transition.port == 14 {
                    "port_a".to_owned()
                } else {
                    "port_b".to_owned()
                },
                old_value: transition.old_value as u32,
                new_value: transition.new_value as u32,
                value_encoding: ValueEncoding::Hex,
                value_bits: 8,
                tick: stamp.tick,
                cycle: stamp.cycle,
            };
            for publisher in &mut self.publishers.regdiff {
                publisher.offer(stamp, event.clone());
            }
        }
    }

    /// Renders into the back buffer, swaps, and hands the frame plus one
    /// frame's worth of audio to the publishers.
    fn publish_frame(&mut self, stamp: EventStamp) {
        let (width, height, frame_hz) = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let (width, height) = session.machine.bus.shifter.mode().dimensions();
            let pixels = width as usize * height as usize;
            session.frame_back.resize(pixels, 0);
            session.machine.render_frame(&mut session.frame_back);
            std::mem::swap(&mut session.frame_front, &mut session.frame_back);
            let frame_hz = match session.manifest.region {
                Region::Pal => 50u32,
                Region::Ntsc => 60,
            };
            (width, height, frame_hz)
        };

        let data: Arc<[u8]> = {
            let session = self.session.as_ref().expect("session exists");
            let mut bytes = Vec::with_capacity(session.frame_front.len() * 2);
            for px in &session.frame_front {
                bytes.extend_from_slice(&px.to_le_bytes());
            }
            Arc::from(bytes.into_boxed_slice())
        };

        let mut fatal = None;
        let mut dropped_frame = false;
        for publisher in &mut self.publishers.video {
            match publisher.publish_frame(stamp, width, height, PixelFormat::Rgb565, Arc::clone(&data))
            {
                Ok(PublishOutcome::DeliveredAfterDrop { .. }) => dropped_frame = true,
                Ok(PublishOutcome::Delivered) => {}
                Err(err) => {
                    fatal = Some(err.message);
                    break;
                }
            }
        }
        if let Some(message) = fatal {
            self.fault(message);
            return;
        }

        // One video frame's worth of audio per chunk.
        let frames = AUDIO_SAMPLE_RATE / frame_hz;
        let channels = 2usize;
        let audio: Arc<[u8]> = {
            let session = self.session.as_mut().expect("session exists");
            let mut samples = vec![0i16; frames as usize * channels];
            session
                .machine
                .bus
                .psg
                .render_audio_chunk(frames as usize, channels, &mut samples);
            let mut bytes = Vec::with_capacity(samples.len() * 2);
            for sample in &samples {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            Arc::from(bytes.into_boxed_slice())
        };
        let mut fatal = None;
        for publisher in &mut self.publishers.audio {
            if let Err(err) = publisher.publish_chunk(
                stamp,
                AUDIO_SAMPLE_RATE,
                channels as u8,
                AudioFormat::PcmS16le,
                frames,
                Arc::clone(&audio),
            ) {
                fatal = Some(err.message);
                break;
            }
        }
        if let Some(message) = fatal {
            self.fault(message);
            return;
        }

        // Frame pacing metrics feed the SLO sampler.
        let now = Instant::now();
        let expected_ms = 1_000.0 / frame_hz as f64 / self.clock.effective_ratio();
        let last_frame_at = self
            .session
            .as_mut()
            .map(|s| std::mem::replace(&mut s.last_frame_at, Some(now)))
            .unwrap_or(None);
        if let Some(last) = last_frame_at {
            let actual_ms = now.duration_since(last).as_secs_f64() * 1_000.0;
            self.slo.record(
                SloMetric::JitterMs,
                (actual_ms - expected_ms).abs(),
                stamp.timestamp_us,
            );
        }
        self.slo.record(
            SloMetric::DroppedFramePct,
            if dropped_frame { 100.0 } else { 0.0 },
            stamp.timestamp_us,
        );
    }

    fn pump_slo(&mut self, stamp: EventStamp) {
        let out = self.slo.tick(stamp.timestamp_us);
        if out.samples.is_empty() && out.alarms.is_empty() {
            return;
        }
        for publisher in &mut self.publishers.slo {
            for sample in &out.samples {
                publisher.publish(stamp, SloEvent::Sample(*sample));
            }
            for alarm in &out.alarms {
                publisher.publish(stamp, SloEvent::Alarm(*alarm));
            }
        }
    }

    /// Sleeps off the difference between emulated and wall time.
    fn pace(&mut self, cycles: u32) {
        let duration = Duration::from_micros(self.clock.tick_duration_us(cycles));
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.next_tick_deadline += duration;
        let now = Instant::now();
        if let Some(ahead) = session.next_tick_deadline.checked_duration_since(now) {
            if ahead > Duration::from_micros(200) {
                std::thread::sleep(ahead);
            }
        } else if now.duration_since(session.next_tick_deadline) > Duration::from_millis(100) {
            // Fell far behind; resync instead of spiralling.
            session.next_tick_deadline = now;
        }
    }

    /// Fail-fast internal error: the session faults and only stop remains.
    fn fault(&mut self, message: String) {
        log::error!("engine faulted: {message}");
        let stamp = self.current_stamp();
        if let Some(session) = self.session.as_mut() {
            session.lifecycle = LifecycleState::Faulted;
            session.last_error = Some(message.clone());
            session.last_transition_at_us = stamp.timestamp_us;
        }
        for publisher in &mut self.publishers.status {
            publisher.publish_status(
                stamp,
                "degraded",
                "error",
                Some(ErrorCode::InternalError.as_str().to_owned()),
            );
        }
    }

    fn current_stamp(&mut self) -> EventStamp {
        let (tick, cycle) = self
            .session
            .as_ref()
            .map(|s| (s.counters.tick_counter, s.counters.cycle_counter))
            .unwrap_or((0, 0));
        self.clock.stamp(tick, cycle)
    }

    // --- command handling (always at a tick boundary) ---

    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Shutdown => return true,
            Command::Lifecycle(cmd, reply) => {
                let result = self.handle_lifecycle(cmd);
                let _ = reply.send(result);
            }
            Command::Clock(cmd, reply) => {
                let result = self.handle_clock(cmd);
                let _ = reply.send(result);
            }
            Command::Media(cmd, reply) => {
                let result = self.handle_media(cmd);
                let _ = reply.send(result);
            }
            Command::Inspect(cmd, reply) => {
                let result = self.handle_inspect(cmd);
                let _ = reply.send(result);
            }
            Command::SessionInfo(reply) => {
                let result = self.session_info();
                let _ = reply.send(result);
            }
            Command::ApplyMapping {
                browser_session,
                profile,
                expected_revision,
                reply,
            } => {
                let result =
                    self.handle_apply_mapping(&browser_session, profile, expected_revision);
                let _ = reply.send(result);
            }
            Command::InjectInput {
                browser_session,
                event,
                enqueued_at,
                reply,
            } => {
                let result = self.handle_inject(&browser_session, event, enqueued_at);
                let _ = reply.send(result);
            }
            Command::PolicySetEnabled {
                browser_session,
                enabled,
                reply,
            } => {
                let result = self.handle_policy(&browser_session, |policy, now| {
                    Ok(policy.set_enabled(enabled, PolicySource::UserRequest, now))
                });
                let _ = reply.send(result);
            }
            Command::PolicySetMode {
                browser_session,
                mode,
                reply,
            } => {
                let result = self.handle_policy(&browser_session, |policy, now| {
                    Ok(policy.set_mode(mode, PolicySource::UserRequest, now))
                });
                let _ = reply.send(result);
            }
            Command::PolicyHookCmd {
                browser_session,
                hook,
                reply,
            } => {
                let result =
                    self.handle_policy(&browser_session, |policy, now| policy.hook(hook, now));
                let _ = reply.send(result);
            }
            Command::SubscribeVideo(capacity, reply) => {
                let (publisher, subscription) = VideoPublisher::with_capacity(capacity);
                self.publishers.video.push(publisher);
                let _ = reply.send(Ok(subscription));
            }
            Command::SubscribeAudio(reply) => {
                let (publisher, subscription) =
                    AudioPublisher::with_capacity(DEFAULT_QUEUE_CAPACITY);
                self.publishers.audio.push(publisher);
                let _ = reply.send(Ok(subscription));
            }
            Command::SubscribeStatus(reply) => {
                let (publisher, subscription) = StatusPublisher::channel();
                self.publishers.status.push(publisher);
                let _ = reply.send(Ok(subscription));
            }
            Command::SubscribeRegisterDiffs(selector, mode, reply) => {
                let (publisher, subscription) = RegisterDiffPublisher::channel(selector, mode);
                self.publishers.regdiff.push(publisher);
                self.sync_observation_taps();
                let _ = reply.send(Ok(subscription));
            }
            Command::SubscribeBusTrace(filter, reply) => {
                let result = BusTracePublisher::channel(filter).map(|(publisher, subscription)| {
                    self.publishers.bus_trace.push(publisher);
                    self.sync_observation_taps();
                    subscription
                });
                let _ = reply.send(result);
            }
            Command::SubscribeMemoryTrace(filter, reply) => {
                let result =
                    MemoryTracePublisher::channel(filter).map(|(publisher, subscription)| {
                        self.publishers.mem_trace.push(publisher);
                        self.sync_observation_taps();
                        subscription
                    });
                let _ = reply.send(result);
            }
            Command::SubscribeInput(reply) => {
                let (publisher, subscription) = Publisher::channel(DEFAULT_QUEUE_CAPACITY);
                self.publishers
                    .input
                    .push((publisher, SequenceChecker::new()));
                let _ = reply.send(Ok(subscription));
            }
            Command::SubscribePolicy(reply) => {
                let (publisher, subscription) = Publisher::channel(DEFAULT_QUEUE_CAPACITY);
                self.publishers.policy.push(publisher);
                let _ = reply.send(Ok(subscription));
            }
            Command::SubscribeSlo(reply) => {
                let (publisher, subscription) = Publisher::channel(DEFAULT_QUEUE_CAPACITY);
                self.publishers.slo.push(publisher);
                let _ = reply.send(Ok(subscription));
            }
            Command::ConfigureSlo(config, reply) => {
                let result = SloSampler::new(config).map(|sampler| {
                    self.slo = sampler;
                    config
                });
                let _ = reply.send(result);
            }
            Command::SetSloThreshold(metric, threshold, reply) => {
                self.slo.set_threshold(metric, threshold);
                let _ = reply.send(Ok(threshold));
            }
            Command::InputDiagnostics(reply) => {
                let _ = reply.send(Ok(self.translator.diagnostics()));
            }
        }
        false
    }

    /// Enables bus taps only while someone is listening.
    fn sync_observation_taps(&mut self) {
        let wants_trace = self.publishers.wants_bus_trace();
        let wants_diffs = self.publishers.wants_diffs();
        if let Some(session) = self.session.as_mut() {
            session.machine.bus.set_trace_enabled(wants_trace);
            session.machine.bus.set_diff_enabled(wants_diffs);
        }
    }

    fn handle_lifecycle(&mut self, cmd: LifecycleCmd) -> EngineResult<LifecycleOutcome> {
        let state = self.lifecycle_state();
        let transition = lifecycle::evaluate(state, self.session.is_some(), &cmd)?;
        let mut snapshot_id = None;
        match transition.effect {
            TransitionEffect::StartMachine => {
                let LifecycleCmd::Start {
                    machine: machine_name,
                    profile: profile_name,
                    ..
                } = &cmd
                else {
                    unreachable!("start effect only from start");
                };
                let manifest = profile::find(machine_name, profile_name)?.clone();
                profile::validate_step_order(&manifest.step_order)?;
                let config = profile::machine_config(&manifest, AUDIO_SAMPLE_RATE);
                let mut machine = Machine::new(config);
                // Cold-attached media mounts before reset so the ROM
                // participates in the reset-vector bootstrap.
                let mut media = MediaBindings::default();
                for (payload, binding) in self.cold_media.drain(..) {
                    media.record(binding);
                    media::mount(&mut machine, payload);
                }
                machine.reset();
                self.session_seq += 1;
                let now_us = self.now_us();
                self.session = Some(SessionState {
                    session_id: format!("sess-{:04}", self.session_seq),
                    manifest,
                    machine,
                    lifecycle: LifecycleState::Running,
                    counters: SchedulerCounters::default(),
                    media,
                    started_at: Instant::now(),
                    last_transition_at_us: now_us,
                    last_error: None,
                    frame_front: Vec::new(),
                    frame_back: Vec::new(),
                    next_tick_deadline: Instant::now(),
                    last_frame_at: None,
                    joystick_state: 0,
                });
                self.sync_observation_taps();
                self.publish_lifecycle_status("running");
            }
            TransitionEffect::None => {
                self.commit_state(transition.to);
            }
            TransitionEffect::ResetMachine => {
                if let Some(session) = self.session.as_mut() {
                    session.machine.reset();
                }
                self.commit_state(LifecycleState::Running);
            }
            TransitionEffect::SaveSnapshot { name } => {
                // Snapshot commit precedes the state commit; a failed save
                // leaves the session running and untouched.
                snapshot_id = Some(self.save_snapshot(&name)?);
                self.commit_state(LifecycleState::Suspended);
            }
            TransitionEffect::RestoreSnapshot { snapshot_id: id } => {
                self.restore_snapshot(&id)?;
                self.commit_state(transition.to);
            }
            TransitionEffect::StopMachine => {
                let now_us = self.now_us();
                if let Some(session) = self.session.take() {
                    self.policies.disable_session(&session.session_id, now_us);
                }
                self.publish_lifecycle_status("stopped");
                return Ok(LifecycleOutcome {
                    state: LifecycleState::Stopped,
                    session_id: None,
                    snapshot_id: None,
                });
            }
        }
        Ok(LifecycleOutcome {
            state: self.lifecycle_state(),
            session_id: self.session.as_ref().map(|s| s.session_id.clone()),
            snapshot_id,
        })
    }

    fn commit_state(&mut self, to: LifecycleState) {
        let now_us = self.now_us();
        if let Some(session) = self.session.as_mut() {
            session.lifecycle = to;
            session.last_transition_at_us = now_us;
            // Resuming restarts wall-clock pacing from here.
            session.next_tick_deadline = Instant::now();
            session.last_frame_at = None;
        }
        self.publish_lifecycle_status(to.as_str());
    }

    fn publish_lifecycle_status(&mut self, state: &str) {
        let stamp = self.current_stamp();
        for publisher in &mut self.publishers.status {
            publisher.publish_status(stamp, state, "info", None);
        }
    }

    /// Save path: serialize, stage, rename; the runtime is never mutated.
    fn save_snapshot(&mut self, name: &str) -> EngineResult<String> {
        let gate = Arc::clone(&self.snapshot_gate);
        let _gate = gate.lock();
        let saved_at_us = self.now_us();
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| EngineError::new(ErrorCode::EngineNotRunning, "no active session"))?;
        self.snapshot_seq += 1;
        let id = format!("snap-{:04}", self.snapshot_seq);
        let state = session.machine.state();
        let meta = self.snapshots.save(
            &id,
            name,
            &session.manifest,
            &state,
            session.counters,
            session.media.list(),
            saved_at_us,
        )?;
        Ok(meta.snapshot_id)
    }

    /// Restore path: compat pipeline, rehydrate, remount media.
    fn restore_snapshot(&mut self, id: &str) -> EngineResult<()> {
        let gate = Arc::clone(&self.snapshot_gate);
        let _gate = gate.lock();
        let record = self.snapshots.load(id)?;
        {
            let session = self.session.as_ref().ok_or_else(|| {
                EngineError::new(ErrorCode::EngineNotRunning, "no active session")
            })?;
            validate_compat(&record.meta, &session.manifest)?;
        }
        let media_bindings = record.media.clone();
        let mut payloads = Vec::new();
        for binding in &media_bindings {
            payloads.push(media::resolve(binding.slot, &binding.descriptor)?);
        }
        let restore_result = {
            let session = self.session.as_mut().expect("session checked above");
            session.machine.restore(record.state)
        };
        if let Err(message) = restore_result {
            // Rehydration failed mid-flight; prior counters stay intact.
            let message = format!("snapshot {id}: {message}");
            self.fault(message.clone());
            return Err(EngineError::new(ErrorCode::SnapshotRestoreFailed, message)
                .with_details(engine_abi::ErrorDetails::default().with("snapshot_id", id)));
        }
        let session = self.session.as_mut().expect("session checked above");
        session.counters = record.counters;
        session.media.replace_all(media_bindings);
        for payload in payloads {
            media::mount(&mut session.machine, payload);
        }
        Ok(())
    }

    fn handle_clock(&mut self, cmd: ClockCmd) -> EngineResult<ClockReply> {
        if self.session.is_none() {
            return Err(EngineError::new(
                ErrorCode::EngineNotRunning,
                "debug clock requires an active session",
            ));
        }
        match cmd {
            ClockCmd::SetMode { mode } => {
                let outcome = self.clock.set_mode(mode)?;
                Ok(ClockReply::Mode(outcome))
            }
            ClockCmd::Step { steps } => {
                if !matches!(self.clock.mode(), ClockMode::SingleStep) {
                    return Err(EngineError::new(
                        ErrorCode::DebugClockInvalid,
                        "step requests require single_step mode",
                    ));
                }
                if steps == 0 || steps > MAX_STEPS {
                    return Err(EngineError::new(
                        ErrorCode::DebugStepInvalid,
                        format!("steps {steps} outside 1..={MAX_STEPS}"),
                    ));
                }
                self.run_steps(steps)
            }
        }
    }

    /// Commits exactly `steps` ticks through the same fabric as the
    /// continuous path and aggregates the response.
    fn run_steps(&mut self, steps: u32) -> EngineResult<ClockReply> {
        let (tick_before, cycle_before) = {
            let session = self.session.as_ref().expect("session checked");
            if session.lifecycle != LifecycleState::Running {
                return Err(EngineError::new(
                    ErrorCode::InvalidSessionState,
                    format!("step rejected in state {}", session.lifecycle.as_str()),
                ));
            }
            (
                session.counters.tick_counter,
                session.counters.cycle_counter,
            )
        };
        let mut captures = Vec::with_capacity(steps as usize);
        let mut arb = ArbStats::default();
        for _ in 0..steps {
            let Some(report) = self.commit_tick() else {
                return Err(EngineError::internal(
                    "step aborted by an internal fault",
                ));
            };
            let (tick_now, cycle_now, hook_stats) = {
                let session = self.session.as_ref().expect("session exists");
                let hooks = session.machine.fabric.hooks();
                (
                    session.counters.tick_counter,
                    session.counters.cycle_counter,
                    (
                        hooks.len() as u64,
                        hooks.iter().map(|h| h.wait_cycles as u64).sum::<u64>(),
                    ),
                )
            };
            arb.rounds += 1;
            arb.slots += hook_stats.0;
            arb.wait_cycles += hook_stats.1;
            captures.push(CapturePayload {
                tick: tick_now,
                cycle: cycle_now,
                pc: report.pc_before,
                opcode: report.last_opcode,
                bus_error: report.bus_error,
            });
            let stamp = self.clock.stamp(tick_now, cycle_now);
            self.pump_observations(stamp);
            if report.frame_ready {
                self.publish_frame(stamp);
            }
        }
        let session = self.session.as_ref().expect("session exists");
        Ok(ClockReply::Step(StepOutcome {
            tick_before,
            tick_after: session.counters.tick_counter,
            cycle_before,
            cycle_after: session.counters.cycle_counter,
            arb,
            capture_payloads: captures,
        }))
    }

    fn handle_media(&mut self, cmd: MediaCmd) -> EngineResult<MediaOutcome> {
        let state = self.lifecycle_state();
        match cmd {
            MediaCmd::Attach { slot, descriptor } => {
                if !media::slot_allows_state(slot, state) {
                    return Err(EngineError::new(
                        ErrorCode::MediaSlotBusy,
                        format!(
                            "slot {} cannot change in state {}",
                            slot.as_str(),
                            state.as_str()
                        ),
                    ));
                }
                let payload = media::resolve(slot, &descriptor)?;
                let binding = MediaBinding { slot, descriptor };
                match self.session.as_mut() {
                    Some(session) => {
                        session.media.record(binding);
                        media::mount(&mut session.machine, payload);
                    }
                    None => {
                        self.cold_media.retain(|(_, b)| b.slot != slot);
                        self.cold_media.push((payload, binding));
                    }
                }
                Ok(MediaOutcome {
                    slot: slot.as_str().to_owned(),
                    attached: true,
                })
            }
            MediaCmd::Eject { slot } => {
                if !media::slot_allows_state(slot, state) {
                    return Err(EngineError::new(
                        ErrorCode::MediaSlotBusy,
                        format!(
                            "slot {} cannot change in state {}",
                            slot.as_str(),
                            state.as_str()
                        ),
                    ));
                }
                match self.session.as_mut() {
                    Some(session) => {
                        session.media.clear(slot);
                        media::unmount(&mut session.machine, slot);
                    }
                    None => self.cold_media.retain(|(_, b)| b.slot != slot),
                }
                Ok(MediaOutcome {
                    slot: slot.as_str().to_owned(),
                    attached: false,
                })
            }
        }
    }

    fn handle_inspect(&mut self, cmd: InspectCmd) -> EngineResult<InspectReply> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| EngineError::new(ErrorCode::EngineNotRunning, "no active session"))?;
        match cmd {
            InspectCmd::CpuRegisters => Ok(InspectReply::Cpu(session.machine.cpu.state())),
            InspectCmd::ChipRegisters { component } => {
                let window = match component.as_str() {
                    "mfp" => (0xFF_FA00u32, 0x30u32),
                    "psg" => (0xFF_8800, 0x04),
                    "shifter" | "video" => (0xFF_8200, 0x70),
                    "dma" | "fdc" => (0xFF_8600, 0x10),
                    "acia" => (0xFF_FC00, 0x08),
                    _ => {
                        return Err(EngineError::new(
                            ErrorCode::MalformedRequest,
                            format!("unknown component {component}"),
                        ));
                    }
                };
                let bytes = (0..window.1)
                    .map(|i| session.machine.bus.peek_byte(window.0 + i))
                    .collect();
                Ok(InspectReply::Chip { component, bytes })
            }
            InspectCmd::MemoryWindow { base, len } => {
                if len == 0 || len > MAX_INSPECT_BYTES {
                    return Err(EngineError::new(
                        ErrorCode::MalformedRequest,
                        format!("window length {len} outside 1..={MAX_INSPECT_BYTES}"),
                    ));
                }
                let bytes = (0..len)
                    .map(|i| session.machine.bus.peek_byte(base.wrapping_add(i)))
                    .collect();
                Ok(InspectReply::Memory { base, bytes })
            }
            InspectCmd::BusStatus => Ok(InspectReply::Bus {
                bus_errors: session.machine.bus.bus_errors(),
                last_bus_error: session.machine.bus.last_bus_error().map(|fault| {
                    engine_abi::BusErrorRecord {
                        addr: fault.addr,
                        is_write: fault.is_write,
                    }
                }),
            }),
        }
    }

    fn session_info(&mut self) -> EngineResult<SessionInfo> {
        let mode = self.clock.mode();
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| EngineError::new(ErrorCode::EngineNotRunning, "no active session"))?;
        let run_mode = if session.lifecycle == LifecycleState::Paused {
            "paused".to_owned()
        } else {
            mode.as_str().to_owned()
        };
        Ok(SessionInfo {
            session_id: session.session_id.clone(),
            machine: session.manifest.machine.clone(),
            profile: session.manifest.name.clone(),
            lifecycle_state: session.lifecycle,
            run_mode,
            uptime_ms: session.started_at.elapsed().as_millis() as u64,
            tick_counter: session.counters.tick_counter,
            cycle_counter: session.counters.cycle_counter,
            last_transition_at_us: session.last_transition_at_us,
            last_error: session.last_error.clone(),
        })
    }

    fn handle_apply_mapping(
        &mut self,
        browser_session: &str,
        profile: Arc<MappingProfile>,
        expected_revision: u64,
    ) -> EngineResult<ApplyOutcome> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| EngineError::new(ErrorCode::EngineNotRunning, "no active session"))?;
        self.active_mappings.apply(
            &session.session_id,
            browser_session,
            profile,
            expected_revision,
            session.counters.tick_counter,
        )
    }

    fn handle_policy(
        &mut self,
        browser_session: &str,
        f: impl FnOnce(&mut CapturePolicy, u64) -> EngineResult<PolicyChangeEvent>,
    ) -> EngineResult<PolicyChangeEvent> {
        let now_us = self.now_us();
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| EngineError::new(ErrorCode::EngineNotRunning, "no active session"))?;
        let event = self
            .policies
            .with_policy(&session_id, browser_session, |policy| f(policy, now_us))?;
        let stamp = self.current_stamp();
        for publisher in &mut self.publishers.policy {
            publisher.publish(stamp, event.clone());
        }
        Ok(event)
    }

    /// Eligibility, translation, virtual-device injection, and publication
    /// for one normalized host event.
    fn handle_inject(
        &mut self,
        browser_session: &str,
        event: HostEvent,
        enqueued_at: Instant,
    ) -> EngineResult<InjectOutcome> {
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| EngineError::new(ErrorCode::EngineNotRunning, "no active session"))?;
        let capture_active = self
            .policies
            .with_policy(&session_id, browser_session, |policy| {
                policy.capture_active()
            });
        if !capture_active {
            return Ok(InjectOutcome {
                translated: 0,
                capture_active: false,
            });
        }
        let Some(active) = self.active_mappings.current(&session_id, browser_session) else {
            self.translator.note_dropped(1);
            return Ok(InjectOutcome {
                translated: 0,
                capture_active: true,
            });
        };
        let translated = self.translator.translate(&event, &active.profile);
        let count = translated.len() as u32;

        // Inject into the virtual device pipelines.
        let mut mouse_dx = 0i32;
        let mut mouse_dy = 0i32;
        {
            let session = self.session.as_mut().expect("session exists");
            for event in &translated {
                match event.target {
                    VirtualTarget::IkbdKey(scancode) => {
                        session
                            .machine
                            .bus
                            .acia
                            .inject_key(scancode, event.phase == Phase::Down);
                    }
                    VirtualTarget::MouseAxis(axis) => {
                        if axis == 0 {
                            mouse_dx += event.value;
                        } else {
                            mouse_dy += event.value;
                        }
                    }
                    VirtualTarget::MouseButton(bit) => {
                        session
                            .machine
                            .bus
                            .acia
                            .inject_mouse_button(bit, event.phase == Phase::Down);
                    }
                    VirtualTarget::JoystickDirection(bit) => {
                        if event.phase == Phase::Down {
                            session.joystick_state |= 1 << bit;
                        } else {
                            session.joystick_state &= !(1 << bit);
                        }
                        let state = session.joystick_state;
                        session.machine.bus.acia.inject_joystick(state);
                    }
                    VirtualTarget::JoystickFire => {
                        if event.phase == Phase::Down {
                            session.joystick_state |= 0x80;
                        } else {
                            session.joystick_state &= !0x80;
                        }
                        let state = session.joystick_state;
                        session.machine.bus.acia.inject_joystick(state);
                    }
                }
            }
            if mouse_dx != 0 || mouse_dy != 0 {
                session.machine.bus.acia.inject_mouse_move(
                    mouse_dx.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                    mouse_dy.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                );
            }
        }

        // Publish the translated events with per-connection seq checks.
        let stamp = self.current_stamp();
        let mut violations = 0u64;
        for event in translated {
            for (publisher, checker) in &mut self.publishers.input {
                let seq = publisher.next_seq();
                publisher.publish(stamp, event.clone());
                violations += checker.check(seq, stamp.timestamp_us, stamp.tick, stamp.cycle);
            }
        }
        if violations > 0 {
            self.translator.note_sequencing_violations(violations);
        }

        // Input latency feeds the SLO sampler.
        let latency_ms = enqueued_at.elapsed().as_secs_f64() * 1_000.0;
        self.slo
            .record(SloMetric::InputLatencyMs, latency_ms, stamp.timestamp_us);

        Ok(InjectOutcome {
            translated: count,
            capture_active: true,
        })
    }
}
