//! Policy trigger for garbage collection.
//!
//! The scheduler counts mutations reported by the metadata store and runs a
//! collection pass when thresholds are crossed or a caller asks for one. It
//! keeps the share of wall time spent collecting below `pause_threshold` by
//! waiting after each pass in proportion to how long passes take. The wait
//! is capped at [`MAX_PAUSE`] and only holds back threshold triggers; an
//! explicit [`GcScheduler::schedule_now`] is not delayed by it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::{MetadataError, Result};
use crate::gc::{Collector, GcStats};

/// Longest wait imposed between passes by the pause budget.
pub const MAX_PAUSE: Duration = Duration::from_secs(3600);

/// Scheduler settings, read from the plugin's config table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Largest share of time spent collecting, between 0 and 0.5.
    pub pause_threshold: f64,
    /// Deletions that trigger a pass; 0 disables the trigger.
    pub deletion_threshold: u64,
    /// Mutations that trigger a pass; 0 disables the trigger.
    pub mutation_threshold: u64,
    /// Delay between a trigger and the pass it schedules.
    #[serde(with = "duration_serde")]
    pub schedule_delay: Duration,
    /// Delay before the first pass after startup; 0 skips it.
    #[serde(with = "duration_serde")]
    pub startup_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pause_threshold: 0.02,
            deletion_threshold: 0,
            mutation_threshold: 100,
            schedule_delay: Duration::ZERO,
            startup_delay: Duration::from_millis(100),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=0.5).contains(&self.pause_threshold) {
            return Err(MetadataError::InvalidArgument(format!(
                "pause_threshold must be between 0 and 0.5, got {}",
                self.pause_threshold
            )));
        }
        Ok(())
    }
}

type Reply = oneshot::Sender<Result<GcStats>>;

enum Message {
    Mutation { dirty: bool },
    Trigger(Reply),
}

/// Handle to the background scheduling task. Dropping it stops the task.
pub struct GcScheduler {
    tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl GcScheduler {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn start(collector: Arc<dyn Collector>, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let handle = Handle::try_current()
            .map_err(|_| MetadataError::Gc("no tokio runtime to run the scheduler on".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        info!(?config, "starting gc scheduler");
        let task = handle.spawn(run(collector, config, rx));
        Ok(Self { tx, task })
    }

    /// Observer to register with the metadata store.
    pub fn mutation_callback(&self) -> impl Fn(bool) + Send + Sync + 'static {
        let tx = self.tx.clone();
        move |dirty| {
            let _ = tx.send(Message::Mutation { dirty });
        }
    }

    /// Schedule a pass and wait for its result.
    pub async fn schedule_now(&self) -> Result<GcStats> {
        let (reply, wait) = oneshot::channel();
        self.tx
            .send(Message::Trigger(reply))
            .map_err(|_| MetadataError::Gc("scheduler stopped".into()))?;
        wait.await
            .map_err(|_| MetadataError::Gc("scheduler stopped".into()))?
    }
}

impl Drop for GcScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for GcScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcScheduler")
            .field("running", &!self.task.is_finished())
            .finish()
    }
}

#[derive(Default)]
struct State {
    deletions: u64,
    mutations: u64,
    triggered: bool,
    waiters: Vec<Reply>,
    collected: bool,
    gc_time: Duration,
    gc_count: u32,
}

impl State {
    fn wants_pass(&self, config: &SchedulerConfig) -> bool {
        self.triggered
            || (config.deletion_threshold > 0 && self.deletions >= config.deletion_threshold)
            || (config.mutation_threshold > 0 && self.mutations >= config.mutation_threshold)
    }

    /// Share of time spent collecting stays at `pause_threshold`.
    fn pause(&self, config: &SchedulerConfig) -> Duration {
        if config.pause_threshold <= 0.0 || self.gc_count == 0 {
            return Duration::ZERO;
        }
        let avg = self.gc_time / self.gc_count;
        let secs = avg.as_secs_f64() * (1.0 / config.pause_threshold - 1.0);
        Duration::try_from_secs_f64(secs).map_or(MAX_PAUSE, |d| d.min(MAX_PAUSE))
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run(
    collector: Arc<dyn Collector>,
    config: SchedulerConfig,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let mut state = State::default();
    let mut not_before = Instant::now();
    let mut next = (!config.startup_delay.is_zero()).then(|| Instant::now() + config.startup_delay);

    loop {
        tokio::select! {
            _ = wait_until(next) => {}
            msg = rx.recv() => {
                match msg {
                    None => return,
                    Some(Message::Mutation { dirty }) => {
                        state.mutations += 1;
                        if dirty {
                            state.deletions += 1;
                        }
                    }
                    Some(Message::Trigger(reply)) => {
                        state.triggered = true;
                        state.waiters.push(reply);
                    }
                }
                if state.wants_pass(&config) {
                    let mut at = Instant::now() + config.schedule_delay;
                    if !state.triggered {
                        at = at.max(not_before);
                    }
                    if next.map_or(true, |n| n > at) {
                        next = Some(at);
                    }
                }
                continue;
            }
        }

        next = None;
        if state.collected && !state.wants_pass(&config) && state.deletions == 0 {
            continue;
        }

        let c = Arc::clone(&collector);
        let started = Instant::now();
        let res = match tokio::task::spawn_blocking(move || c.garbage_collect()).await {
            Ok(res) => res,
            Err(e) => Err(MetadataError::Gc(e.to_string())),
        };
        let took = started.elapsed();
        state.deletions = 0;
        state.mutations = 0;
        state.triggered = false;
        state.collected = true;

        match res {
            Ok(stats) => {
                state.gc_time += took;
                state.gc_count += 1;
                let pause = state.pause(&config);
                not_before = Instant::now() + pause;
                debug!(?took, ?pause, "gc pass finished");
                for reply in state.waiters.drain(..) {
                    let _ = reply.send(Ok(stats.clone()));
                }
            }
            Err(e) => {
                warn!(error = %e, "garbage collection failed, retrying in 1s");
                for reply in state.waiters.drain(..) {
                    let _ = reply.send(Err(MetadataError::Gc(e.to_string())));
                }
                state.triggered = true;
                next = Some(Instant::now() + Duration::from_secs(1));
            }
        }
    }
}

/// Durations as strings such as `100ms`, `1s`, `2m` or `1h`.
mod duration_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = d.as_millis();
        if ms % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", ms / 1000))
        } else {
            serializer.serialize_str(&format!("{ms}ms"))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("invalid duration {s:?}: expected a unit of ms, s, m or h")),
    }
}
