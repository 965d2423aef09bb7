//! Instruction streams: messages, plans and stream mutators.
//!
//! A scan is described as an ordered stream of [`Msg`] records
//! (`open_run`, `set`, `wait`, `read`, `save`, ...). Plans produce the
//! stream, the [`RunEngine`](crate::engine::RunEngine) consumes it, and
//! preprocessors sit in between as stream → stream transforms.
//!
//! # Architecture
//!
//! ```text
//! Plan ──▶ PlanStream ──▶ MutatedStream<_, M> ──▶ ... ──▶ RunEngine
//!            (sync)         (async, may read          (executes)
//!                            signals live)
//! ```
//!
//! [`MutatedStream`] is the generic splice mechanism: for each message
//! pulled from the inner stream it asks a [`MessageMutator`] for messages to
//! insert ahead of it, emits those, then emits the original unchanged.
//! Because messages are pulled one at a time, a mutator sees device state
//! as it is at the moment the message is about to run, not when the plan
//! was built.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;

use crate::error::ScanResult;
use crate::signal::{same_signal, SignalRef};

// =============================================================================
// Msg
// =============================================================================

/// Instruction kinds understood by the run engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Begin a run. Metadata travels in [`Msg::metadata`].
    OpenRun,
    /// End the current run.
    CloseRun,
    /// Write `args[0]` to the target signal.
    Set,
    /// Read the target signal into the current event.
    Read,
    /// Wait for every `set` in `group` to complete.
    Wait,
    /// Sleep for `args[0]` seconds.
    Sleep,
    /// Mark a point where the plan could be resumed.
    Checkpoint,
    /// Emit the current event.
    Save,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::OpenRun => "open_run",
            Command::CloseRun => "close_run",
            Command::Set => "set",
            Command::Read => "read",
            Command::Wait => "wait",
            Command::Sleep => "sleep",
            Command::Checkpoint => "checkpoint",
            Command::Save => "save",
        };
        write!(f, "{name}")
    }
}

/// One instruction in a plan.
#[derive(Clone)]
pub struct Msg {
    /// What to do.
    pub command: Command,
    /// Signal the instruction applies to, if any.
    pub target: Option<SignalRef>,
    /// Positional arguments (the value for `set`, seconds for `sleep`).
    pub args: Vec<f64>,
    /// Completion group shared by `set` and `wait` messages.
    pub group: Option<String>,
    /// Run the message belongs to.
    pub run: Option<String>,
    /// Free-form metadata (used by `open_run`).
    pub metadata: Map<String, Value>,
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("command", &self.command)
            .field("target", &self.target.as_ref().map(|t| t.name().to_string()))
            .field("args", &self.args)
            .field("group", &self.group)
            .field("run", &self.run)
            .finish()
    }
}

impl Msg {
    fn new(command: Command) -> Self {
        Self {
            command,
            target: None,
            args: Vec::new(),
            group: None,
            run: None,
            metadata: Map::new(),
        }
    }

    /// `set` a signal to `value`.
    pub fn set(target: SignalRef, value: f64) -> Self {
        Self {
            target: Some(target),
            args: vec![value],
            ..Self::new(Command::Set)
        }
    }

    /// `read` a signal.
    pub fn read(target: SignalRef) -> Self {
        Self {
            target: Some(target),
            ..Self::new(Command::Read)
        }
    }

    /// `wait` for a completion group.
    pub fn wait(group: impl Into<String>) -> Self {
        Self::new(Command::Wait).with_group(group)
    }

    /// `sleep` for a number of seconds.
    pub fn sleep(seconds: f64) -> Self {
        Self {
            args: vec![seconds],
            ..Self::new(Command::Sleep)
        }
    }

    /// `open_run` with metadata.
    pub fn open_run(metadata: Map<String, Value>) -> Self {
        Self {
            metadata,
            ..Self::new(Command::OpenRun)
        }
    }

    /// `close_run`.
    pub fn close_run() -> Self {
        Self::new(Command::CloseRun)
    }

    /// `checkpoint`.
    pub fn checkpoint() -> Self {
        Self::new(Command::Checkpoint)
    }

    /// `save` the current event.
    pub fn save() -> Self {
        Self::new(Command::Save)
    }

    /// Attach a completion group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Attach a run key.
    pub fn with_run(mut self, run: Option<String>) -> Self {
        self.run = run;
        self
    }

    /// First positional argument.
    pub fn value(&self) -> Option<f64> {
        self.args.first().copied()
    }

    /// Whether this is a `set` on exactly `signal`.
    pub fn is_set_of(&self, signal: &SignalRef) -> bool {
        self.command == Command::Set
            && self
                .target
                .as_ref()
                .is_some_and(|target| same_signal(target, signal))
    }
}

// =============================================================================
// Streams
// =============================================================================

/// A pull-based, async source of messages.
#[async_trait]
pub trait MessageStream: Send {
    /// Next message, `Ok(None)` once the stream is exhausted.
    async fn next_message(&mut self) -> ScanResult<Option<Msg>>;
}

#[async_trait]
impl MessageStream for VecDeque<Msg> {
    async fn next_message(&mut self) -> ScanResult<Option<Msg>> {
        Ok(self.pop_front())
    }
}

#[async_trait]
impl MessageStream for Box<dyn MessageStream> {
    async fn next_message(&mut self) -> ScanResult<Option<Msg>> {
        self.as_mut().next_message().await
    }
}

/// Drain a stream into a vector.
pub async fn collect_messages<S: MessageStream + ?Sized>(stream: &mut S) -> ScanResult<Vec<Msg>> {
    let mut messages = Vec::new();
    while let Some(msg) = stream.next_message().await? {
        messages.push(msg);
    }
    Ok(messages)
}

/// A scan plan that yields messages one at a time.
///
/// Plans hold precomputed schedules and do no I/O; anything that needs live
/// device state belongs in a [`MessageMutator`].
pub trait Plan: Send {
    /// Name recorded in run metadata.
    fn plan_name(&self) -> &str;

    /// Next message, `None` when the plan is complete.
    fn next_message(&mut self) -> Option<Msg>;
}

/// Adapts a [`Plan`] into a [`MessageStream`].
pub struct PlanStream<P> {
    plan: P,
}

impl<P: Plan> PlanStream<P> {
    /// Wrap a plan.
    pub fn new(plan: P) -> Self {
        Self { plan }
    }

    /// Wrapped plan.
    pub fn plan(&self) -> &P {
        &self.plan
    }
}

#[async_trait]
impl<P: Plan> MessageStream for PlanStream<P> {
    async fn next_message(&mut self) -> ScanResult<Option<Msg>> {
        Ok(self.plan.next_message())
    }
}

// =============================================================================
// Mutators
// =============================================================================

/// Decides what to splice in front of each message of a stream.
#[async_trait]
pub trait MessageMutator: Send {
    /// Messages to emit immediately before `msg`. An empty vector leaves the
    /// stream untouched at this point.
    async fn insert_before(&mut self, msg: &Msg) -> ScanResult<Vec<Msg>>;
}

/// A stream with a [`MessageMutator`] applied to every message.
///
/// Once the mutator or the inner stream fails, the error is returned and the
/// stream yields nothing more.
pub struct MutatedStream<S, M> {
    inner: S,
    mutator: M,
    pending: VecDeque<Msg>,
    failed: bool,
}

impl<S, M> MutatedStream<S, M>
where
    S: MessageStream,
    M: MessageMutator,
{
    /// Apply `mutator` to `inner`.
    pub fn new(inner: S, mutator: M) -> Self {
        Self {
            inner,
            mutator,
            pending: VecDeque::new(),
            failed: false,
        }
    }

    /// The wrapped mutator.
    pub fn mutator(&self) -> &M {
        &self.mutator
    }
}

#[async_trait]
impl<S, M> MessageStream for MutatedStream<S, M>
where
    S: MessageStream,
    M: MessageMutator,
{
    async fn next_message(&mut self) -> ScanResult<Option<Msg>> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        if self.failed {
            return Ok(None);
        }
        let msg = match self.inner.next_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.failed = true;
                return Err(err);
            }
        };
        match self.mutator.insert_before(&msg).await {
            Ok(inserted) => {
                self.pending.extend(inserted);
                self.pending.push_back(msg);
                Ok(self.pending.pop_front())
            }
            Err(err) => {
                self.failed = true;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use crate::signal::SoftSignal;

    struct Countdown {
        signal: SignalRef,
        remaining: u32,
    }

    impl Plan for Countdown {
        fn plan_name(&self) -> &str {
            "countdown"
        }

        fn next_message(&mut self) -> Option<Msg> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(Msg::set(self.signal.clone(), f64::from(self.remaining)))
        }
    }

    /// Inserts a sleep before every set.
    struct SleepBeforeSet;

    #[async_trait]
    impl MessageMutator for SleepBeforeSet {
        async fn insert_before(&mut self, msg: &Msg) -> ScanResult<Vec<Msg>> {
            if msg.command == Command::Set {
                Ok(vec![Msg::sleep(0.0).with_run(msg.run.clone())])
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct FailOnWait;

    #[async_trait]
    impl MessageMutator for FailOnWait {
        async fn insert_before(&mut self, msg: &Msg) -> ScanResult<Vec<Msg>> {
            match msg.command {
                Command::Wait => Err(ScanError::Disconnected("mono".into())),
                _ => Ok(Vec::new()),
            }
        }
    }

    #[tokio::test]
    async fn test_plan_stream() {
        let signal = SoftSignal::new("x", 0.0).handle();
        let mut stream = PlanStream::new(Countdown {
            signal,
            remaining: 3,
        });
        let messages = collect_messages(&mut stream).await.unwrap();
        let values: Vec<f64> = messages.iter().filter_map(Msg::value).collect();
        assert_eq!(values, vec![2.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_mutated_stream_inserts_in_order() {
        let signal = SoftSignal::new("x", 0.0).handle();
        let input: VecDeque<Msg> = vec![
            Msg::set(signal.clone(), 1.0).with_group("g1"),
            Msg::wait("g1"),
        ]
        .into();
        let mut stream = MutatedStream::new(input, SleepBeforeSet);
        let messages = collect_messages(&mut stream).await.unwrap();
        let commands: Vec<Command> = messages.iter().map(|m| m.command).collect();
        assert_eq!(commands, vec![Command::Sleep, Command::Set, Command::Wait]);
        assert_eq!(messages[1].group.as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn test_mutated_stream_stops_after_error() {
        let signal = SoftSignal::new("x", 0.0).handle();
        let input: VecDeque<Msg> = vec![
            Msg::set(signal.clone(), 1.0),
            Msg::wait("g1"),
            Msg::set(signal, 2.0),
        ]
        .into();
        let mut stream = MutatedStream::new(input, FailOnWait);
        assert!(stream.next_message().await.unwrap().is_some());
        assert!(matches!(
            stream.next_message().await,
            Err(ScanError::Disconnected(_))
        ));
        assert!(stream.next_message().await.unwrap().is_none());
    }

    #[test]
    fn test_is_set_of_uses_identity() {
        let soft = SoftSignal::new("bragg", 0.0);
        let bragg = soft.handle();
        let other = soft.handle();
        let msg = Msg::set(bragg.clone(), 1.0);
        assert!(msg.is_set_of(&bragg));
        assert!(!msg.is_set_of(&other));
        assert!(!Msg::read(bragg.clone()).is_set_of(&bragg));
    }
}
