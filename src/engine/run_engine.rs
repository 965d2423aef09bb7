//! Executes message streams against signals.
//!
//! The engine pulls one message at a time from a [`MessageStream`] and acts
//! on it:
//!
//! | Command      | Effect                                                    |
//! |--------------|-----------------------------------------------------------|
//! | `open_run`   | emit a `StartDoc` carrying the message metadata           |
//! | `set`        | write the target; deferred until `wait` if grouped        |
//! | `wait`       | complete every pending `set` in the group, concurrently   |
//! | `read`       | read the target into the current event                    |
//! | `save`       | emit an `EventDoc` (and the `DescriptorDoc` on first use) |
//! | `sleep`      | sleep for `args[0]` seconds                               |
//! | `checkpoint` | no-op marker                                              |
//! | `close_run`  | emit a `StopDoc`                                          |
//!
//! Documents are returned in the [`RunSummary`] and broadcast to
//! subscribers as they are produced.

use chrono::{DateTime, Utc};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::engine::document::{
    DataKey, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc,
};
use crate::error::{ScanError, ScanResult};
use crate::plan::{Command, MessageStream, Msg};
use crate::signal::SignalRef;

/// Capacity of the document broadcast channel
const DOCUMENT_CHANNEL_CAPACITY: usize = 1024;

/// Stream name used for every descriptor
const PRIMARY_STREAM: &str = "primary";

/// Everything a finished stream produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// UIDs of the runs opened, in order
    pub run_uids: Vec<String>,
    /// Every document, in emission order
    pub documents: Vec<Document>,
    /// Number of messages executed
    pub messages: usize,
}

impl RunSummary {
    /// Event documents, in order.
    pub fn events(&self) -> impl Iterator<Item = &EventDoc> {
        self.documents.iter().filter_map(Document::as_event)
    }

    /// Start documents, in order.
    pub fn starts(&self) -> impl Iterator<Item = &StartDoc> {
        self.documents.iter().filter_map(Document::as_start)
    }
}

struct Reading {
    value: f64,
    units: Option<String>,
    time: DateTime<Utc>,
}

struct OpenRun {
    uid: String,
    descriptor: Option<DescriptorDoc>,
    num_events: u32,
}

/// Mutable state for one stream execution.
#[derive(Default)]
struct Execution {
    run: Option<OpenRun>,
    groups: HashMap<String, Vec<BoxFuture<'static, ScanResult<()>>>>,
    readings: BTreeMap<String, Reading>,
    summary: RunSummary,
}

/// Executes message streams.
#[derive(Debug, Clone)]
pub struct RunEngine {
    documents: broadcast::Sender<Document>,
}

impl Default for RunEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunEngine {
    /// Create an engine.
    pub fn new() -> Self {
        let (documents, _) = broadcast::channel(DOCUMENT_CHANNEL_CAPACITY);
        Self { documents }
    }

    /// Receive documents as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.documents.subscribe()
    }

    /// Run a stream to completion.
    ///
    /// On error, pending grouped sets are dropped, an open run is closed with
    /// a `fail` stop document, and the error is returned.
    pub async fn run<S>(&self, stream: &mut S) -> ScanResult<RunSummary>
    where
        S: MessageStream + ?Sized,
    {
        let mut exec = Execution::default();
        match self.drive(stream, &mut exec).await {
            Ok(()) => {
                if let Some(run) = exec.run.take() {
                    warn!(run = %run.uid, "stream ended with the run still open");
                    self.emit(
                        &mut exec,
                        Document::Stop(StopDoc::abort(
                            &run.uid,
                            "stream ended without close_run",
                            run.num_events,
                        )),
                    );
                }
                Ok(exec.summary)
            }
            Err(err) => {
                error!(error = %err, "stream execution failed");
                exec.groups.clear();
                if let Some(run) = exec.run.take() {
                    self.emit(
                        &mut exec,
                        Document::Stop(StopDoc::fail(&run.uid, &err.to_string(), run.num_events)),
                    );
                }
                Err(err)
            }
        }
    }

    async fn drive<S>(&self, stream: &mut S, exec: &mut Execution) -> ScanResult<()>
    where
        S: MessageStream + ?Sized,
    {
        while let Some(msg) = stream.next_message().await? {
            debug!(?msg, "executing");
            exec.summary.messages += 1;
            self.execute(msg, exec).await?;
        }
        let pending: Vec<_> = exec.groups.drain().flat_map(|(_, sets)| sets).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "completing sets left pending at end of stream");
            try_join_all(pending).await?;
        }
        Ok(())
    }

    async fn execute(&self, msg: Msg, exec: &mut Execution) -> ScanResult<()> {
        match msg.command {
            Command::OpenRun => {
                if let Some(run) = &exec.run {
                    return Err(invalid(&msg, format!("run {} is already open", run.uid)));
                }
                let start = StartDoc::new(msg.metadata);
                info!(run = %start.uid, plan = ?start.plan_name, "run opened");
                exec.run = Some(OpenRun {
                    uid: start.uid.clone(),
                    descriptor: None,
                    num_events: 0,
                });
                exec.summary.run_uids.push(start.uid.clone());
                self.emit(exec, Document::Start(start));
            }
            Command::CloseRun => {
                let run = exec
                    .run
                    .take()
                    .ok_or_else(|| invalid(&msg, "no run is open"))?;
                info!(run = %run.uid, events = run.num_events, "run closed");
                self.emit(exec, Document::Stop(StopDoc::success(&run.uid, run.num_events)));
            }
            Command::Set => {
                let target = target(&msg)?;
                let value = msg
                    .value()
                    .ok_or_else(|| invalid(&msg, "set needs a value"))?;
                let write = async move { target.set(value).await }.boxed();
                match msg.group {
                    Some(group) => exec.groups.entry(group).or_default().push(write),
                    None => write.await?,
                }
            }
            Command::Wait => {
                let group = msg
                    .group
                    .as_deref()
                    .ok_or_else(|| invalid(&msg, "wait needs a group"))?;
                if let Some(sets) = exec.groups.remove(group) {
                    debug!(group, count = sets.len(), "waiting for group");
                    try_join_all(sets).await?;
                }
            }
            Command::Read => {
                let target = target(&msg)?;
                let value = target.get_value().await?;
                exec.readings.insert(
                    target.name().to_string(),
                    Reading {
                        value,
                        units: target.units().map(str::to_string),
                        time: Utc::now(),
                    },
                );
            }
            Command::Save => self.save(&msg, exec)?,
            Command::Sleep => {
                let seconds = msg
                    .value()
                    .ok_or_else(|| invalid(&msg, "sleep needs a duration"))?;
                let duration = Duration::try_from_secs_f64(seconds)
                    .map_err(|e| invalid(&msg, format!("bad duration {seconds}: {e}")))?;
                tokio::time::sleep(duration).await;
            }
            Command::Checkpoint => debug!("checkpoint"),
        }
        Ok(())
    }

    fn save(&self, msg: &Msg, exec: &mut Execution) -> ScanResult<()> {
        let readings = std::mem::take(&mut exec.readings);
        let run = exec
            .run
            .as_mut()
            .ok_or_else(|| invalid(msg, "no run is open"))?;

        let mut new_descriptor = None;
        let descriptor_uid = match &run.descriptor {
            Some(descriptor) => descriptor.uid.clone(),
            None => {
                let descriptor = readings.iter().fold(
                    DescriptorDoc::new(&run.uid, PRIMARY_STREAM),
                    |desc, (name, reading)| {
                        desc.with_data_key(name, DataKey::scalar(name, reading.units.as_deref()))
                    },
                );
                let uid = descriptor.uid.clone();
                new_descriptor = Some(descriptor.clone());
                run.descriptor = Some(descriptor);
                uid
            }
        };

        run.num_events += 1;
        let event = readings.iter().fold(
            EventDoc::new(&run.uid, &descriptor_uid, run.num_events),
            |event, (name, reading)| event.with_datum(name, reading.value, reading.time),
        );
        if let Some(descriptor) = new_descriptor {
            self.emit(exec, Document::Descriptor(descriptor));
        }
        self.emit(exec, Document::Event(event));
        Ok(())
    }

    fn emit(&self, exec: &mut Execution, doc: Document) {
        // No subscribers is fine
        let _ = self.documents.send(doc.clone());
        exec.summary.documents.push(doc);
    }
}

fn invalid(msg: &Msg, reason: impl Into<String>) -> ScanError {
    ScanError::InvalidMessage {
        command: msg.command.to_string(),
        reason: reason.into(),
    }
}

fn target(msg: &Msg) -> ScanResult<SignalRef> {
    msg.target
        .clone()
        .ok_or_else(|| invalid(msg, "message has no target"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SoftSignal;
    use serde_json::{json, Map};
    use std::collections::VecDeque;

    fn metadata() -> Map<String, serde_json::Value> {
        let mut metadata = Map::new();
        metadata.insert("plan_name".into(), json!("test_plan"));
        metadata
    }

    #[tokio::test]
    async fn test_runs_a_simple_scan() {
        let motor = SoftSignal::new("motor", 0.0).with_units("eV");
        let detector = SoftSignal::new("I0", 1.5).with_units("V");
        let mut stream: VecDeque<Msg> = VecDeque::from(vec![
            Msg::open_run(metadata()),
            Msg::set(motor.handle(), 7000.0).with_group("move"),
            Msg::wait("move"),
            Msg::read(motor.handle()),
            Msg::read(detector.handle()),
            Msg::save(),
            Msg::checkpoint(),
            Msg::close_run(),
        ]);

        let engine = RunEngine::new();
        let mut docs = engine.subscribe();
        let summary = engine.run(&mut stream).await.unwrap();

        assert_eq!(summary.messages, 8);
        assert_eq!(summary.run_uids.len(), 1);
        assert_eq!(summary.documents.len(), 4);
        let event = summary.events().next().unwrap();
        assert_eq!(event.data["motor"], 7000.0);
        assert_eq!(event.data["I0"], 1.5);
        assert_eq!(
            summary.starts().next().unwrap().plan_name.as_deref(),
            Some("test_plan")
        );
        assert!(matches!(docs.recv().await.unwrap(), Document::Start(_)));
        let stop = summary.documents.last().unwrap().as_stop().unwrap();
        assert_eq!(stop.num_events, 1);
    }

    #[tokio::test]
    async fn test_grouped_sets_complete_at_wait() {
        let a = SoftSignal::new("a", 0.0);
        let b = SoftSignal::new("b", 0.0);
        let mut stream: VecDeque<Msg> = VecDeque::from(vec![
            Msg::set(a.handle(), 1.0).with_group("g"),
            Msg::set(b.handle(), 2.0).with_group("g"),
            Msg::wait("g"),
            Msg::set(a.handle(), 3.0).with_group("late"),
        ]);
        RunEngine::new().run(&mut stream).await.unwrap();
        assert_eq!(b.put_history(), vec![2.0]);
        // Sets never waited on still complete before the engine returns
        assert_eq!(a.put_history(), vec![1.0, 3.0]);
    }

    #[tokio::test]
    async fn test_failure_closes_run() {
        let detector = SoftSignal::new("I0", 0.0);
        detector.set_connected(false);
        let mut stream: VecDeque<Msg> = VecDeque::from(vec![
            Msg::open_run(Map::new()),
            Msg::read(detector.handle()),
            Msg::save(),
            Msg::close_run(),
        ]);
        let engine = RunEngine::new();
        let mut docs = engine.subscribe();
        let result = engine.run(&mut stream).await;
        assert!(matches!(result, Err(ScanError::Disconnected(_))));

        assert!(matches!(docs.recv().await.unwrap(), Document::Start(_)));
        let Document::Stop(stop) = docs.recv().await.unwrap() else {
            panic!("expected a stop document");
        };
        assert_eq!(stop.exit_status, crate::engine::document::ExitStatus::Fail);
    }

    #[tokio::test]
    async fn test_out_of_order_messages() {
        let mut stream: VecDeque<Msg> = VecDeque::from(vec![Msg::save()]);
        assert!(matches!(
            RunEngine::new().run(&mut stream).await,
            Err(ScanError::InvalidMessage { .. })
        ));

        let mut stream: VecDeque<Msg> =
            VecDeque::from(vec![Msg::open_run(Map::new()), Msg::open_run(Map::new())]);
        assert!(RunEngine::new().run(&mut stream).await.is_err());

        let mut stream: VecDeque<Msg> = VecDeque::from(vec![Msg::sleep(-1.0)]);
        assert!(RunEngine::new().run(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_unclosed_run_is_aborted() {
        let mut stream: VecDeque<Msg> = VecDeque::from(vec![Msg::open_run(Map::new())]);
        let summary = RunEngine::new().run(&mut stream).await.unwrap();
        let stop = summary.documents.last().unwrap().as_stop().unwrap();
        assert_eq!(stop.exit_status, crate::engine::document::ExitStatus::Abort);
    }
}
