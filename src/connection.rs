//! `Connection`: the public facade. Wires `TcpChannel` → `StreamParser` →
//! `EventDispatcher` together, owns worker-task lifecycle and teardown
//! ordering, and exposes the caller-facing request API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::action::Action;
use crate::channel::TcpChannel;
use crate::config::ConnectionConfig;
use crate::dispatcher::{EventDispatcher, WaiterOutcome};
use crate::error::{AmiError, Result};
use crate::parser::StreamParser;
use crate::reaction::Reaction;
use crate::record::KeyValRecord;

type SubscriberFn = Arc<dyn Fn(&KeyValRecord) + Send + Sync>;

/// Fan out `record` to a snapshot of `subscribers`, taken and released
/// before any callback runs. This is what makes reentrant `subscribe`/
/// `unsubscribe` calls from inside a callback safe: a mutation made mid
/// fanout simply takes effect starting with the next round, rather than
/// deadlocking on a lock the fanout itself is still holding.
fn fanout(subscribers: &Mutex<HashMap<String, SubscriberFn>>, record: &KeyValRecord) {
    let snapshot: Vec<SubscriberFn> = subscribers.lock().unwrap().values().cloned().collect();
    for callback in snapshot {
        callback(record);
    }
}

/// The public facade over the AMI message-exchange engine.
///
/// Construction dials the socket and spawns three worker tasks (reader,
/// parser, dispatcher); [`Connection::close`] tears them down in reverse
/// assembly order.
pub struct Connection {
    channel: Arc<TcpChannel>,
    parser: Arc<StreamParser>,
    dispatcher: Arc<EventDispatcher>,
    subscribers: Arc<Mutex<HashMap<String, SubscriberFn>>>,
    version: Arc<RwLock<String>>,
    reader_running: Arc<AtomicBool>,
    reader_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Dial `config.host:config.port` and stand up the parsing/dispatch
    /// pipeline.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let channel = Arc::new(TcpChannel::connect(&config).await?);
        tracing::info!(host = %config.host, port = config.port, "ami connection established");

        let version: Arc<RwLock<String>> = Arc::new(RwLock::new(String::new()));
        let subscribers: Arc<Mutex<HashMap<String, SubscriberFn>>> = Arc::new(Mutex::new(HashMap::new()));

        let fanout_subscribers = subscribers.clone();
        let dispatcher = Arc::new(EventDispatcher::spawn(move |record| {
            fanout(&fanout_subscribers, &record);
        }));

        let version_for_parser = version.clone();
        let dispatcher_for_parser = dispatcher.clone();
        let parser = Arc::new(StreamParser::spawn(
            move |v| {
                tracing::info!(version = %v, "ami greeting received");
                *version_for_parser.write().unwrap() = v;
            },
            move |msg| dispatcher_for_parser.ingest(msg),
        ));

        let reader_running = Arc::new(AtomicBool::new(true));
        let reader_task = {
            let running = reader_running.clone();
            let channel = channel.clone();
            let parser = parser.clone();
            let chunk_size = config.read_chunk_size;
            let read_timeout = config.read_timeout;
            tokio::spawn(
                async move {
                    while running.load(Ordering::Acquire) {
                        match channel.read(chunk_size, read_timeout).await {
                            Ok(bytes) if !bytes.is_empty() => parser.feed(bytes),
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "ami reader io error, stopping");
                                break;
                            }
                        }
                    }
                }
                .instrument(tracing::info_span!("ami_reader")),
            )
        };

        Ok(Self {
            channel,
            parser,
            dispatcher,
            subscribers,
            version,
            reader_running,
            reader_task: tokio::sync::Mutex::new(Some(reader_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Register a waiter, write `action`, and await its reaction.
    pub async fn invoke(&self, action: &Action) -> Result<Reaction> {
        let rx = self.dispatcher.open_waiter(action.action_id())?;
        if let Err(e) = self.channel.write(action.to_wire().as_bytes()).await {
            self.dispatcher.fail_waiter(action.action_id(), WaiterOutcome::Closed);
            return Err(e);
        }
        Self::observe(rx.await)
    }

    /// Same as [`Connection::invoke`], but deposits a timeout error into
    /// the very same waiter if it is not otherwise fulfilled within
    /// `timeout`, then observes that waiter — guaranteeing exactly one
    /// delivery path regardless of which side wins the race.
    pub async fn invoke_with_timeout(&self, action: &Action, timeout: Duration) -> Result<Reaction> {
        let mut rx = self.dispatcher.open_waiter(action.action_id())?;
        if let Err(e) = self.channel.write(action.to_wire().as_bytes()).await {
            self.dispatcher.fail_waiter(action.action_id(), WaiterOutcome::Closed);
            return Err(e);
        }

        tokio::select! {
            biased;
            res = &mut rx => Self::observe(res),
            () = tokio::time::sleep(timeout) => {
                self.dispatcher.fail_waiter(action.action_id(), WaiterOutcome::Timeout(timeout));
                Self::observe(rx.await)
            }
        }
    }

    /// Write `action` without registering a waiter. Any response flows
    /// through the subscriber fanout; the caller must match ActionID
    /// itself.
    pub async fn async_invoke(&self, action: &Action) -> Result<()> {
        self.channel.write(action.to_wire().as_bytes()).await
    }

    /// Register a callback for unsolicited events. Returns an opaque key
    /// usable with [`Connection::unsubscribe`].
    pub fn subscribe<F>(&self, callback: F) -> String
    where
        F: Fn(&KeyValRecord) + Send + Sync + 'static,
    {
        let key = Uuid::new_v4().to_string();
        self.subscribers.lock().unwrap().insert(key.clone(), Arc::new(callback));
        key
    }

    pub fn unsubscribe(&self, key: &str) {
        self.subscribers.lock().unwrap().remove(key);
    }

    /// The server's greeting version string, empty until observed.
    pub fn ami_version(&self) -> String {
        self.version.read().unwrap().clone()
    }

    /// Tear the pipeline down in reverse assembly order: stop the reader
    /// (no new bytes), then the parser (no new messages), then the
    /// dispatcher (closes remaining waiters), then the socket.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reader_running.store(false, Ordering::Release);
        if let Some(task) = self.reader_task.lock().await.take() {
            let _ = task.await;
        }
        self.parser.shutdown().await;
        self.dispatcher.shutdown().await;
        self.channel.shutdown().await;
        tracing::info!("ami connection closed");
    }

    fn observe(res: std::result::Result<WaiterOutcome, oneshot::error::RecvError>) -> Result<Reaction> {
        match res {
            Ok(WaiterOutcome::Reaction(reaction)) => Ok(reaction),
            Ok(WaiterOutcome::Closed) => Err(AmiError::Closed),
            Ok(WaiterOutcome::Timeout(d)) => Err(AmiError::Timeout(d)),
            Err(_recv_error) => Err(AmiError::Closed),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::warn!("ami Connection dropped without calling close(); worker tasks were left running");
        }
        self.reader_running.store(false, Ordering::Release);
    }
}
