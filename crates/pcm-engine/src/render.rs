//! Render thread.
//!
//! Owns the PCM bytes and the sound device. Transport commands arrive over a channel
//! and are acknowledged once applied; between commands the loop wakes every time
//! resolution to refill the device and publish the audible position.

use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::device::{self, DeviceError, SinkOptions, SoundDevice};
use crate::error::{AudioError, ErrorChannel, ErrorKind, ErrorLevel};
use crate::format::PcmFormat;
use crate::status::{self, PlayerState, TransportState};
use crate::timebase::TimeBase;

/// Transport actions understood by the render thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Play,
    Pause,
    Stop,
    /// Target in milliseconds from the start of the data.
    Jump(u64),
    Shutdown,
}

/// Result of one command, sent back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Ack {
    pub accepted: bool,
    pub error: AudioError,
}

impl Ack {
    fn ok() -> Self {
        Self::with(true, AudioError::none())
    }

    fn with(accepted: bool, error: AudioError) -> Self {
        Self { accepted, error }
    }
}

pub(crate) struct Command {
    /// Switch to this sink before applying `action`.
    redirect: Option<String>,
    action: Action,
    reply: Sender<Ack>,
}

/// Everything the render thread takes ownership of.
pub(crate) struct RenderSetup {
    pub player: u64,
    pub pcm: Vec<u8>,
    pub data: Range<usize>,
    pub format: PcmFormat,
    pub device_name: String,
    pub sink: SinkOptions,
    pub period: Duration,
    pub transport: Arc<Mutex<TransportState>>,
    pub errors: Arc<ErrorChannel>,
}

/// Control side of a running render thread.
pub(crate) struct RenderHandle {
    cmd_tx: Sender<Command>,
    join: Option<JoinHandle<()>>,
}

impl RenderHandle {
    /// Spawn the render thread and wait until it has opened the sink.
    pub(crate) fn spawn(setup: RenderSetup) -> Result<Self, AudioError> {
        let player = setup.player;
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), DeviceError>>(1);

        let join = thread::Builder::new()
            .name(format!("pcm-render-{player}"))
            .spawn(move || {
                let sink = match device::open(&setup.device_name, setup.format, &setup.sink) {
                    Ok(sink) => sink,
                    Err(e) => {
                        ready_tx.send(Err(e)).ok();
                        return;
                    }
                };
                let render = RenderLoop::new(setup, sink);
                ready_tx.send(Ok(())).ok();
                render.run(cmd_rx);
            })
            .map_err(|e| {
                tracing::error!(player, error = %e, "failed to spawn render thread");
                AudioError::error(ErrorKind::ThreadSpawn)
            })?;

        let opened = ready_rx.recv();
        match opened {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                join.join().ok();
                tracing::error!(player, error = %e, "sound device open failed");
                Err(AudioError::device(ErrorKind::DeviceOpen, ErrorLevel::Error, e.code))
            }
            Err(_) => {
                join.join().ok();
                Err(AudioError::error(ErrorKind::RenderLoopGone))
            }
        }
    }

    /// Send `action` and block until the render thread has applied it.
    pub(crate) fn request(&self, redirect: Option<&str>, action: Action) -> Ack {
        let (reply, reply_rx) = crossbeam_channel::bounded(1);
        let cmd = Command {
            redirect: redirect.map(str::to_string),
            action,
            reply,
        };
        if self.cmd_tx.send(cmd).is_err() {
            return Ack::with(false, AudioError::error(ErrorKind::RenderLoopGone));
        }
        reply_rx
            .recv()
            .unwrap_or_else(|_| Ack::with(false, AudioError::error(ErrorKind::RenderLoopGone)))
    }

    /// Stop the render thread and wait for it. Safe to call more than once.
    pub(crate) fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.request(None, Action::Shutdown);
        if join.join().is_err() {
            tracing::error!("render thread panicked");
        }
    }
}

struct RenderLoop {
    player: u64,
    pcm: Vec<u8>,
    data: Range<usize>,
    timebase: TimeBase,
    total_frames: u64,
    format: PcmFormat,
    sink: Box<dyn SoundDevice>,
    /// Name the current sink was requested by.
    sink_name: String,
    sink_opts: SinkOptions,
    period: Duration,
    state: PlayerState,
    /// Next frame to hand to the sink.
    cursor: u64,
    /// Audible frame while not playing; where `play` resumes.
    position: u64,
    flushed: bool,
    /// Fatal device error; `play` is refused until a new sink is opened.
    fault: Option<AudioError>,
    /// Device error raised while the current command was being applied.
    raised: Option<AudioError>,
    underruns: u64,
    transport: Arc<Mutex<TransportState>>,
    errors: Arc<ErrorChannel>,
}

impl RenderLoop {
    fn new(setup: RenderSetup, sink: Box<dyn SoundDevice>) -> Self {
        let timebase = TimeBase::new(setup.format);
        let total_frames = timebase.bytes_to_frames(setup.data.len() as u64);
        let render = Self {
            player: setup.player,
            pcm: setup.pcm,
            data: setup.data,
            timebase,
            total_frames,
            format: setup.format,
            sink,
            sink_name: setup.device_name,
            sink_opts: setup.sink,
            period: setup.period,
            state: PlayerState::Ready,
            cursor: 0,
            position: 0,
            flushed: false,
            fault: None,
            raised: None,
            underruns: 0,
            transport: setup.transport,
            errors: setup.errors,
        };
        render.publish(0);
        render
    }

    fn run(mut self, cmd_rx: Receiver<Command>) {
        tracing::debug!(player = self.player, "render thread started");
        let mut next_tick = Instant::now() + self.period;
        loop {
            let received = if self.state == PlayerState::Playing {
                match cmd_rx.recv_deadline(next_tick) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match cmd_rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                }
            };

            let Some(cmd) = received else {
                self.tick();
                next_tick += self.period;
                let now = Instant::now();
                if next_tick <= now {
                    next_tick = now + self.period;
                }
                continue;
            };

            let was_playing = self.state == PlayerState::Playing;
            let shutdown = cmd.action == Action::Shutdown;
            let ack = self.handle(cmd.redirect.as_deref(), cmd.action);
            cmd.reply.send(ack).ok();
            if shutdown {
                break;
            }
            if !was_playing && self.state == PlayerState::Playing {
                next_tick = Instant::now() + self.period;
            }
        }
        self.sink.drop_pending();
        self.sink.close();
        tracing::debug!(player = self.player, "render thread stopped");
    }

    /// Apply one command. Device errors raised on the way override a successful ack,
    /// so the caller's error slot never hides them.
    fn handle(&mut self, redirect: Option<&str>, action: Action) -> Ack {
        self.raised = None;
        let ack = self.apply(redirect, action);
        match self.raised.take() {
            Some(err) if err.level == ErrorLevel::Error => Ack::with(false, err),
            Some(err) if ack.error.is_ok() => Ack::with(ack.accepted, err),
            _ => ack,
        }
    }

    fn apply(&mut self, redirect: Option<&str>, action: Action) -> Ack {
        let redirected = match redirect {
            Some(name) if action != Action::Shutdown => self.redirect(name),
            _ => Ok(()),
        };
        if let Err(err) = redirected {
            if action == Action::Stop {
                self.stop();
            }
            return Ack::with(false, err);
        }

        match action {
            Action::Play => self.play(),
            Action::Pause => self.pause(),
            Action::Stop => {
                self.stop();
                Ack::ok()
            }
            Action::Jump(millis) => self.jump(millis),
            Action::Shutdown => {
                self.stop();
                Ack::ok()
            }
        }
    }

    fn play(&mut self) -> Ack {
        if let Some(fault) = self.fault {
            return Ack::with(false, fault);
        }
        if self.state == PlayerState::Playing {
            return Ack::with(true, AudioError::info(ErrorKind::AlreadyPlaying));
        }
        self.sink.drop_pending();
        self.cursor = self.position;
        self.flushed = false;
        self.sink.set_paused(false);
        self.state = PlayerState::Playing;
        tracing::info!(
            player = self.player,
            position_ms = self.timebase.frames_to_millis(self.position),
            "playing"
        );
        self.tick();
        Ack::ok()
    }

    fn pause(&mut self) -> Ack {
        match self.state {
            PlayerState::Playing => {
                self.position = self.audible_frame();
                self.halt();
                self.state = PlayerState::Paused;
                self.publish(self.position);
                tracing::info!(
                    player = self.player,
                    position_ms = self.timebase.frames_to_millis(self.position),
                    "paused"
                );
                Ack::ok()
            }
            PlayerState::Paused => Ack::with(false, AudioError::warning(ErrorKind::AlreadyPaused)),
            PlayerState::Ready | PlayerState::Stopped => {
                Ack::with(false, AudioError::warning(ErrorKind::NotPlaying))
            }
        }
    }

    fn stop(&mut self) {
        self.halt();
        self.position = 0;
        self.cursor = 0;
        if self.state != PlayerState::Stopped {
            tracing::info!(player = self.player, "stopped");
        }
        self.state = PlayerState::Stopped;
        self.publish(0);
    }

    fn jump(&mut self, millis: u64) -> Ack {
        let wanted = self.timebase.millis_to_frames(millis);
        let target = wanted.min(self.total_frames);
        let ack = if wanted > self.total_frames {
            tracing::warn!(
                player = self.player,
                target_ms = millis,
                duration_ms = self.timebase.frames_to_millis(self.total_frames),
                "jump beyond end, clamped"
            );
            Ack::with(true, AudioError::warning(ErrorKind::JumpedBeyondEnd))
        } else {
            Ack::ok()
        };

        self.position = target;
        if self.state == PlayerState::Playing {
            self.sink.drop_pending();
            self.cursor = target;
            self.flushed = false;
            self.tick();
        } else {
            self.publish(target);
        }
        tracing::debug!(player = self.player, position_ms = self.timebase.frames_to_millis(target), "jumped");
        ack
    }

    /// Replace the sink with the one called `name`, keeping the current one on failure.
    fn redirect(&mut self, name: &str) -> Result<(), AudioError> {
        if device::same_device(name, &self.sink_name) {
            return Ok(());
        }
        let sink = device::open(name, self.format, &self.sink_opts).map_err(|e| {
            tracing::warn!(player = self.player, device = name, error = %e, "device switch failed");
            AudioError::device(ErrorKind::DeviceOpen, ErrorLevel::Warning, e.code)
        })?;

        let resume_at = if self.state == PlayerState::Playing {
            self.audible_frame()
        } else {
            self.position
        };
        self.sink.set_paused(true);
        self.sink.drop_pending();
        self.sink.close();
        self.sink = sink;
        self.sink_name = name.to_string();
        self.fault = None;
        tracing::info!(player = self.player, device = %self.sink.name(), "switched output device");

        self.position = resume_at;
        if self.state == PlayerState::Playing {
            self.cursor = resume_at;
            self.flushed = false;
            self.sink.set_paused(false);
            self.tick();
        } else {
            self.publish(resume_at);
        }
        Ok(())
    }

    /// Refill the sink and publish the position. Only called while playing.
    fn tick(&mut self) {
        let remaining = self.total_frames.saturating_sub(self.cursor);
        if remaining == 0 {
            if !self.flushed {
                self.sink.flush();
                self.flushed = true;
            }
            if self.sink.delay_frames() == 0 {
                self.end_of_stream();
                return;
            }
        } else {
            let free = self.sink.available_frames();
            let half = self.sink.capacity_frames() / 2;
            if free > 0 && (free >= half || free >= remaining) {
                self.write(free.min(remaining));
                if self.state != PlayerState::Playing {
                    return;
                }
            }
        }
        let audible = self.audible_frame();
        self.publish(audible);
    }

    fn write(&mut self, frames: u64) {
        let start = self.data.start + self.timebase.frames_to_bytes(self.cursor) as usize;
        let end = start + self.timebase.frames_to_bytes(frames) as usize;
        match self.sink.write(&self.pcm[start..end.min(self.data.end)]) {
            Ok(written) => self.cursor += written,
            Err(e) if !e.fatal => {
                self.underruns += 1;
                tracing::warn!(player = self.player, code = e.code, error = %e, "device write degraded");
                let warning = AudioError::device(ErrorKind::DeviceWrite, ErrorLevel::Warning, e.code);
                self.errors.record(warning);
                self.raised = Some(warning);
            }
            Err(e) => self.device_lost(e),
        }
    }

    fn device_lost(&mut self, e: DeviceError) {
        tracing::error!(player = self.player, code = e.code, error = %e, "sound device failed");
        let fault = AudioError::device(ErrorKind::DeviceWrite, ErrorLevel::Error, e.code);
        self.errors.record(fault);
        self.fault = Some(fault);
        self.raised = Some(fault);
        self.halt();
        self.position = 0;
        self.cursor = 0;
        self.state = PlayerState::Stopped;
        self.publish(0);
    }

    fn end_of_stream(&mut self) {
        tracing::info!(player = self.player, "end of stream");
        self.halt();
        self.position = 0;
        self.cursor = 0;
        self.state = PlayerState::Stopped;
        self.publish(0);
    }

    fn halt(&mut self) {
        self.sink.set_paused(true);
        self.sink.drop_pending();
        self.flushed = false;
    }

    fn audible_frame(&self) -> u64 {
        self.cursor.saturating_sub(self.sink.delay_frames())
    }

    fn publish(&self, position_frames: u64) {
        let mut t = status::lock(&self.transport);
        t.state = self.state;
        t.position_frames = position_frames;
        t.underruns = self.underruns;
        t.faulted = self.fault.is_some();
        if t.device != self.sink.name() {
            t.device = self.sink.name().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::error::device_code;
    use crate::wav;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::atomic::AtomicU8;

    fn setup(format: PcmFormat, millis: u64, device_name: &str) -> RenderSetup {
        let tb = TimeBase::new(format);
        let data = vec![0u8; tb.millis_to_bytes(millis) as usize];
        let len = data.len();
        RenderSetup {
            player: 0,
            pcm: data,
            data: 0..len,
            format,
            device_name: device_name.to_string(),
            sink: SinkOptions {
                capacity_frames: tb.millis_to_frames(80),
                volume_percent: Arc::new(AtomicU8::new(100)),
                tuning: SinkConfig::default(),
            },
            period: Duration::from_millis(10),
            transport: TransportState::shared(),
            errors: Arc::new(ErrorChannel::new()),
        }
    }

    /// Sink that never drains and fails writes as scripted.
    struct ScriptedSink {
        capacity: u64,
        queued: u64,
        /// `None` accepts the write; `Some` fails it. Writes past the script are accepted.
        script: VecDeque<Option<DeviceError>>,
        drops: Rc<Cell<u32>>,
    }

    impl ScriptedSink {
        fn new(capacity: u64, script: Vec<Option<DeviceError>>) -> (Self, Rc<Cell<u32>>) {
            let drops = Rc::new(Cell::new(0));
            let sink = Self {
                capacity,
                queued: 0,
                script: script.into(),
                drops: drops.clone(),
            };
            (sink, drops)
        }
    }

    impl SoundDevice for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        fn format(&self) -> PcmFormat {
            PcmFormat::new(8_000, 1, 16)
        }

        fn capacity_frames(&self) -> u64 {
            self.capacity
        }

        fn delay_frames(&self) -> u64 {
            self.queued
        }

        fn write(&mut self, bytes: &[u8]) -> Result<u64, DeviceError> {
            if let Some(Some(err)) = self.script.pop_front() {
                return Err(err);
            }
            let frames = (bytes.len() as u64 / 2).min(self.capacity - self.queued);
            self.queued += frames;
            Ok(frames)
        }

        fn set_paused(&mut self, _paused: bool) {}

        fn drop_pending(&mut self) {
            self.queued = 0;
            self.drops.set(self.drops.get() + 1);
        }

        fn close(&mut self) {}
    }

    fn scripted_loop(script: Vec<Option<DeviceError>>) -> (RenderLoop, Rc<Cell<u32>>) {
        let format = PcmFormat::new(8_000, 1, 16);
        let (sink, drops) = ScriptedSink::new(400, script);
        (RenderLoop::new(setup(format, 1_000, "scripted"), Box::new(sink)), drops)
    }

    fn state_of(transport: &Mutex<TransportState>) -> PlayerState {
        status::lock(transport).state
    }

    #[test]
    fn spawn_reports_device_open_failure() {
        let format = PcmFormat::new(8_000, 1, 8);
        let mut s = setup(format, 100, "null");
        s.device_name = "no-such-device-anywhere".into();
        // Without any hardware the lookup fails; with hardware the name does not match.
        let err = RenderHandle::spawn(s).err().unwrap();
        assert_eq!(err.kind, ErrorKind::DeviceOpen);
        assert_eq!(err.level, ErrorLevel::Error);
    }

    #[test]
    fn short_clip_stops_by_itself() {
        let format = PcmFormat::new(8_000, 1, 8);
        let s = setup(format, 60, "null");
        let transport = s.transport.clone();
        let mut handle = RenderHandle::spawn(s).unwrap();

        assert!(handle.request(None, Action::Play).accepted);
        assert_eq!(state_of(&transport), PlayerState::Playing);

        let deadline = Instant::now() + Duration::from_secs(2);
        while state_of(&transport) == PlayerState::Playing && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(state_of(&transport), PlayerState::Stopped);
        assert_eq!(status::lock(&transport).position_frames, 0);
        handle.shutdown();
    }

    #[test]
    fn redirect_failure_keeps_sink_but_still_stops() {
        let format = PcmFormat::new(8_000, 2, 16);
        let s = setup(format, 500, "null");
        let transport = s.transport.clone();
        let mut handle = RenderHandle::spawn(s).unwrap();

        handle.request(None, Action::Play);
        let ack = handle.request(Some("no-such-device-anywhere"), Action::Stop);
        assert!(!ack.accepted);
        assert_eq!(ack.error.kind, ErrorKind::DeviceOpen);
        assert_eq!(state_of(&transport), PlayerState::Stopped);
        assert_eq!(status::lock(&transport).device, "null");

        // Same sink under another spelling is not a switch.
        assert!(handle.request(Some("NULL"), Action::Play).accepted);
        handle.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let format = PcmFormat::new(44_100, 2, 16);
        let mut handle = RenderHandle::spawn(setup(format, 100, "null")).unwrap();
        handle.shutdown();
        handle.shutdown();
        let ack = handle.request(None, Action::Play);
        assert!(!ack.accepted);
        assert_eq!(ack.error.kind, ErrorKind::RenderLoopGone);
    }

    #[test]
    fn jump_is_measured_from_the_data_chunk() {
        let format = PcmFormat::new(8_000, 1, 8);
        let bytes = wav::encode(format, &[128u8; 800]);
        let layout = wav::parse(&bytes).unwrap();
        let mut s = setup(format, 0, "null");
        s.pcm = bytes;
        s.data = layout.data;
        let transport = s.transport.clone();
        let mut handle = RenderHandle::spawn(s).unwrap();

        assert!(handle.request(None, Action::Jump(50)).accepted);
        assert_eq!(status::lock(&transport).position_frames, 400);
        let ack = handle.request(None, Action::Jump(5_000));
        assert!(ack.accepted);
        assert_eq!(ack.error.kind, ErrorKind::JumpedBeyondEnd);
        assert_eq!(status::lock(&transport).position_frames, 800);
        handle.shutdown();
    }

    #[test]
    fn device_loss_during_play_is_reported_and_sticky() {
        let (mut render, drops) = scripted_loop(vec![Some(DeviceError::lost("unplugged"))]);
        let errors = render.errors.clone();
        let transport = render.transport.clone();

        let ack = render.handle(None, Action::Play);
        assert!(!ack.accepted);
        assert_eq!(ack.error.kind, ErrorKind::DeviceWrite);
        assert_eq!(ack.error.level, ErrorLevel::Error);
        assert_eq!(ack.error.device_code, device_code::NO_DEVICE);
        assert_eq!(errors.get(), ack.error);
        assert!(drops.get() > 0);
        {
            let t = status::lock(&transport);
            assert_eq!(t.state, PlayerState::Stopped);
            assert_eq!(t.position_frames, 0);
            assert!(t.faulted);
        }

        // Refused until another sink is opened; stop is still accepted.
        assert_eq!(render.handle(None, Action::Play), Ack::with(false, ack.error));
        assert!(render.handle(None, Action::Stop).accepted);
        assert!(!render.handle(None, Action::Play).accepted);

        let ack = render.handle(Some("null"), Action::Play);
        assert!(ack.accepted);
        assert!(ack.error.is_ok());
        assert_eq!(state_of(&transport), PlayerState::Playing);
        assert!(!status::lock(&transport).faulted);
        render.handle(None, Action::Shutdown);
    }

    #[test]
    fn device_loss_during_jump_is_reported() {
        let (mut render, _) = scripted_loop(vec![None, Some(DeviceError::lost("unplugged"))]);
        assert!(render.handle(None, Action::Play).accepted);

        let ack = render.handle(None, Action::Jump(100));
        assert!(!ack.accepted);
        assert_eq!(ack.error.level, ErrorLevel::Error);
        assert_eq!(render.state, PlayerState::Stopped);
        assert!(render.fault.is_some());
    }

    #[test]
    fn underrun_during_command_surfaces_as_warning() {
        let (mut render, _) = scripted_loop(vec![None, Some(DeviceError::underrun())]);
        assert!(render.handle(None, Action::Play).accepted);

        let ack = render.handle(None, Action::Jump(0));
        assert!(ack.accepted);
        assert_eq!(ack.error.kind, ErrorKind::DeviceWrite);
        assert_eq!(ack.error.level, ErrorLevel::Warning);
        assert_eq!(ack.error.device_code, device_code::UNDERRUN);
        assert_eq!(render.errors.get(), ack.error);
        assert_eq!(render.state, PlayerState::Playing);
        assert_eq!(status::lock(&render.transport).underruns, 1);

        // The next refill recovers without a new warning.
        assert!(render.handle(None, Action::Jump(0)).error.is_ok());
    }
}
