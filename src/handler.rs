//! Deferred policy work
//!
//! Everything the policy does later (long-press timers, chord timers, the
//! lock timeout, asynchronous service calls) is a [`PolicyMessage`] handed
//! to a [`PolicyScheduler`]. Delayed messages are keyed by [`TimerKey`]:
//! posting a delayed message replaces any pending one with the same key, so
//! timers are never additive. Immediate posts run in FIFO order.
//!
//! Two schedulers exist: [`HandlerThread`] runs a calloop event loop on its
//! own thread, [`ManualScheduler`] keeps a virtual clock for tests and
//! replays.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use calloop::channel::{self, Channel, Sender};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, LoopHandle, RegistrationToken};
use tracing::{debug, error, trace, warn};

use crate::error::{PolicyError, Result};
use crate::input::actions::KeyFamily;
use crate::input::keys::{KeyCode, KeyEvent};

/// A unit of deferred policy work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyMessage {
    PowerLongPress,
    ScreenshotChord,
    /// Long-press threshold reached for the press identified by `press_id`
    KeyLongPress { family: KeyFamily, press_id: u64 },
    /// Volume key held long enough to skip tracks
    VolumeMusicLongPress { code: KeyCode, press_id: u64 },
    KillForegroundApp,
    DispatchMediaKey(KeyEvent),
    DispatchMediaKeyRepeat { event: KeyEvent, seq: u64 },
    ScreenLockTimeout,
    ClearForcedNavigation,
    CollapsePanels,
    UpdateSystemUiVisibility,
    KeyguardDone,
    KeyguardDismiss,
    UpdateSettings,
}

/// Identity of a delayed action; one outstanding timer per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    PowerLongPress,
    ScreenshotChord,
    KeyLongPress(KeyFamily),
    VolumeMusic,
    KillForegroundApp,
    MediaKey,
    MediaKeyRepeat,
    ScreenLock,
    ClearForcedNavigation,
    CollapsePanels,
    SystemUiVisibility,
    KeyguardDone,
    KeyguardDismiss,
    Settings,
}

impl PolicyMessage {
    pub fn key(&self) -> TimerKey {
        match self {
            PolicyMessage::PowerLongPress => TimerKey::PowerLongPress,
            PolicyMessage::ScreenshotChord => TimerKey::ScreenshotChord,
            PolicyMessage::KeyLongPress { family, .. } => TimerKey::KeyLongPress(*family),
            PolicyMessage::VolumeMusicLongPress { .. } => TimerKey::VolumeMusic,
            PolicyMessage::KillForegroundApp => TimerKey::KillForegroundApp,
            PolicyMessage::DispatchMediaKey(_) => TimerKey::MediaKey,
            PolicyMessage::DispatchMediaKeyRepeat { .. } => TimerKey::MediaKeyRepeat,
            PolicyMessage::ScreenLockTimeout => TimerKey::ScreenLock,
            PolicyMessage::ClearForcedNavigation => TimerKey::ClearForcedNavigation,
            PolicyMessage::CollapsePanels => TimerKey::CollapsePanels,
            PolicyMessage::UpdateSystemUiVisibility => TimerKey::SystemUiVisibility,
            PolicyMessage::KeyguardDone => TimerKey::KeyguardDone,
            PolicyMessage::KeyguardDismiss => TimerKey::KeyguardDismiss,
            PolicyMessage::UpdateSettings => TimerKey::Settings,
        }
    }
}

/// Receives messages when they come due
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: PolicyMessage);
}

/// Serialized queue for deferred work
pub trait PolicyScheduler: Send + Sync {
    /// Run as soon as possible, after everything already queued
    fn post(&self, message: PolicyMessage);
    /// Run after `delay`, replacing any pending message with the same key
    fn post_delayed(&self, message: PolicyMessage, delay: Duration);
    /// Drop the pending delayed message for `key`, if any
    fn cancel(&self, key: TimerKey);
}

/// Monotonic time in milliseconds since an arbitrary origin
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

type Target = Arc<Mutex<Option<Weak<dyn MessageHandler>>>>;

fn deliver(target: &Target, message: PolicyMessage) {
    let handler = {
        let guard = target.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(Weak::upgrade)
    };
    match handler {
        Some(handler) => handler.handle_message(message),
        None => debug!(?message, "Dropping message, no handler attached"),
    }
}

enum Command {
    Post(PolicyMessage),
    Schedule { message: PolicyMessage, delay: Duration },
    Cancel(TimerKey),
    Shutdown,
}

struct LoopState {
    timers: HashMap<TimerKey, RegistrationToken>,
    target: Target,
    running: bool,
}

/// Dedicated policy thread driving a calloop event loop
pub struct HandlerThread {
    sender: Mutex<Sender<Command>>,
    target: Target,
    started: Instant,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl HandlerThread {
    /// Start the loop thread; attach a handler before posting
    pub fn spawn() -> Result<Self> {
        let (sender, channel) = channel::channel::<Command>();
        let target: Target = Arc::new(Mutex::new(None));
        let loop_target = Arc::clone(&target);

        let join = thread::Builder::new()
            .name("policy-handler".into())
            .spawn(move || {
                if let Err(e) = run_loop(channel, loop_target) {
                    error!("Policy handler loop failed: {}", e);
                }
            })
            .map_err(|e| PolicyError::HandlerLoop(e.to_string()))?;

        Ok(Self {
            sender: Mutex::new(sender),
            target,
            started: Instant::now(),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn attach(&self, handler: Weak<dyn MessageHandler>) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn send(&self, command: Command) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if sender.send(command).is_err() {
            warn!("Policy handler thread is gone, dropping command");
        }
    }

    /// Stop the loop and wait for the thread
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            if join.thread().id() != thread::current().id() && join.join().is_err() {
                error!("Policy handler thread panicked");
            }
        }
    }
}

impl Drop for HandlerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PolicyScheduler for HandlerThread {
    fn post(&self, message: PolicyMessage) {
        self.send(Command::Post(message));
    }

    fn post_delayed(&self, message: PolicyMessage, delay: Duration) {
        self.send(Command::Schedule { message, delay });
    }

    fn cancel(&self, key: TimerKey) {
        self.send(Command::Cancel(key));
    }
}

impl Clock for HandlerThread {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

fn schedule(handle: &LoopHandle<'static, LoopState>, state: &mut LoopState, message: PolicyMessage, delay: Duration) {
    let key = message.key();
    if let Some(token) = state.timers.remove(&key) {
        handle.remove(token);
    }
    let timer = Timer::from_duration(delay);
    let inserted = handle.insert_source(timer, move |_, _, state: &mut LoopState| {
        state.timers.remove(&key);
        deliver(&state.target, message.clone());
        TimeoutAction::Drop
    });
    match inserted {
        Ok(token) => {
            state.timers.insert(key, token);
        }
        Err(e) => error!(?key, "Failed to insert policy timer: {:?}", e.error),
    }
}

fn run_loop(channel: Channel<Command>, target: Target) -> Result<()> {
    let mut event_loop: EventLoop<'static, LoopState> =
        EventLoop::try_new().map_err(|e| PolicyError::HandlerLoop(e.to_string()))?;
    let handle = event_loop.handle();
    let inner = handle.clone();

    handle
        .insert_source(channel, move |event, _, state: &mut LoopState| match event {
            channel::Event::Msg(Command::Post(message)) => deliver(&state.target, message),
            channel::Event::Msg(Command::Schedule { message, delay }) => {
                trace!(?message, ?delay, "Scheduling policy timer");
                schedule(&inner, state, message, delay);
            }
            channel::Event::Msg(Command::Cancel(key)) => {
                if let Some(token) = state.timers.remove(&key) {
                    inner.remove(token);
                }
            }
            channel::Event::Msg(Command::Shutdown) | channel::Event::Closed => state.running = false,
        })
        .map_err(|e| PolicyError::HandlerLoop(format!("{:?}", e.error)))?;

    let mut state = LoopState { timers: HashMap::new(), target, running: true };
    debug!("Policy handler loop running");
    while state.running {
        event_loop
            .dispatch(None, &mut state)
            .map_err(|e| PolicyError::HandlerLoop(e.to_string()))?;
    }
    debug!("Policy handler loop stopped");
    Ok(())
}

#[derive(Debug)]
struct Pending {
    deadline: u64,
    seq: u64,
    message: PolicyMessage,
    /// Delayed messages replace each other by key; posts never do
    keyed: bool,
}

#[derive(Debug, Default)]
struct ManualInner {
    now: u64,
    seq: u64,
    pending: Vec<Pending>,
}

/// Virtual-time scheduler
///
/// Nothing runs until [`ManualScheduler::advance`] is called.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    inner: Mutex<ManualInner>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, message: PolicyMessage, delay: u64, keyed: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if keyed {
            let key = message.key();
            inner.pending.retain(|p| !(p.keyed && p.message.key() == key));
        }
        inner.seq += 1;
        let pending = Pending { deadline: inner.now + delay, seq: inner.seq, message, keyed };
        inner.pending.push(pending);
    }

    /// Move time forward by `ms`, delivering everything that comes due in
    /// deadline order. Messages posted by the handler are picked up too.
    pub fn advance(&self, ms: u64, handler: &dyn MessageHandler) {
        let target = self.inner.lock().unwrap_or_else(|e| e.into_inner()).now + ms;
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let due = inner
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.deadline <= target)
                    .min_by_key(|(_, p)| (p.deadline, p.seq))
                    .map(|(i, _)| i);
                due.map(|i| {
                    let pending = inner.pending.remove(i);
                    inner.now = inner.now.max(pending.deadline);
                    pending.message
                })
            };
            match next {
                Some(message) => handler.handle_message(message),
                None => break,
            }
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.now = inner.now.max(target);
    }

    /// Deliver what is already due without moving time
    pub fn run_pending(&self, handler: &dyn MessageHandler) {
        self.advance(0, handler);
    }

    pub fn is_pending(&self, key: TimerKey) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.iter().any(|p| p.message.key() == key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }

    /// Messages still waiting, soonest first
    pub fn pending_messages(&self) -> Vec<PolicyMessage> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<_> = inner.pending.iter().collect();
        pending.sort_by_key(|p| (p.deadline, p.seq));
        pending.into_iter().map(|p| p.message.clone()).collect()
    }
}

impl PolicyScheduler for ManualScheduler {
    fn post(&self, message: PolicyMessage) {
        self.push(message, 0, false);
    }

    fn post_delayed(&self, message: PolicyMessage, delay: Duration) {
        self.push(message, delay.as_millis() as u64, true);
    }

    fn cancel(&self, key: TimerKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.retain(|p| !(p.keyed && p.message.key() == key));
    }
}

impl Clock for ManualScheduler {
    fn now_ms(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).now
    }
}
