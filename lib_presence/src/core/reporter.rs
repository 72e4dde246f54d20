//! # Outbound Reporter
//!
//! Publishes the local actor's own state (position, typing bit) to one row of
//! the persistence service, keyed by the actor id.
//!
//! ## Producers:
//!
//! - **Push**: a `DeviceSensor` watch delivering every available sample.
//!   Errors are surfaced as `ReporterStatus::SourceFailed(kind)` and do not
//!   stop anything else.
//! - **Poll**: a periodic `current_sample()` read, kept running regardless of
//!   the push source's health.
//! - **Manual**: `report(sample)` for producers without a sensor.
//!
//! All producers feed one publisher task through an unbounded channel. The
//! publisher throttles with a trailing edge: a sample is written immediately
//! when the minimum interval has elapsed since the previous write; otherwise
//! it replaces the pending sample, which is written once the interval is up.
//!
//! `go_offline` stops every producer, waits for the publisher to finish its
//! current write, then publishes one final copy of the newest sample (the
//! pending one if the interval had not elapsed yet) with the live flag
//! cleared. A sample is therefore never dropped entirely.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::collab::{DeviceSensor, Persistence};
use crate::core::entity::EntityPayload;
use crate::core::now_millis;
use crate::core::store::EntitySnapshotStore;
use crate::error::{SourceError, SyncError};

/// Publisher pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReporterOptions {
    /// Minimum gap between two writes.
    pub min_interval: Duration,
    /// Period of the fallback poll.
    pub poll_interval: Duration,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1_000),
            poll_interval: Duration::from_millis(10_000),
        }
    }
}

/// What the reporter is currently doing, as shown to the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterStatus {
    /// Started, nothing received yet.
    Idle,
    /// Receiving samples.
    Reporting,
    /// The push source reported an error. The poll keeps going.
    SourceFailed(SourceError),
    /// `go_offline` ran. Terminal.
    Offline,
}

/// Trailing-edge throttle over the latest sample.
#[derive(Debug)]
struct Coalescer<P> {
    interval: Duration,
    last_publish: Option<Instant>,
    pending: Option<P>,
}

impl<P> Coalescer<P> {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_publish: None,
            pending: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_publish {
            None => true,
            Some(last) => now >= last + self.interval,
        }
    }

    /// Returns the sample if it may be written right now, else keeps it as
    /// the pending one.
    fn offer(&mut self, sample: P, now: Instant) -> Option<P> {
        if self.is_due(now) {
            self.pending = None;
            self.last_publish = Some(now);
            Some(sample)
        } else {
            self.pending = Some(sample);
            None
        }
    }

    /// When the pending sample becomes writable.
    fn deadline(&self) -> Option<Instant> {
        match (&self.pending, self.last_publish) {
            (Some(_), Some(last)) => Some(last + self.interval),
            (Some(_), None) => Some(Instant::now()),
            (None, _) => None,
        }
    }

    fn take_due(&mut self, now: Instant) -> Option<P> {
        if self.pending.is_some() && self.is_due(now) {
            self.last_publish = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    fn into_pending(self) -> Option<P> {
        self.pending
    }
}

/// What the publisher had not written yet when it stopped.
struct Unpublished<P> {
    pending: Option<P>,
    queue: mpsc::UnboundedReceiver<P>,
}

impl<P> Unpublished<P> {
    /// Newest unwritten sample, draining whatever is still queued.
    fn newest(mut self) -> Option<P> {
        let mut newest = self.pending;
        while let Ok(sample) = self.queue.try_recv() {
            newest = Some(sample);
        }
        newest
    }
}

/// The single logical writer of the actor's row.
struct Publisher<P> {
    actor_id: String,
    table: String,
    persistence: Arc<dyn Persistence>,
    local: Option<Arc<EntitySnapshotStore<P>>>,
    last_published: Mutex<Option<P>>,
}

impl<P: EntityPayload + Serialize> Publisher<P> {
    fn last(&self) -> MutexGuard<'_, Option<P>> {
        self.last_published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Upserts the actor's row. The local mirror and `last_published` only
    /// move once the remote write is accepted.
    async fn write(&self, payload: P) -> Result<(), SyncError> {
        let body = serde_json::to_value(&payload)?;
        self.persistence
            .upsert(&self.table, &self.actor_id, body)
            .await?;
        if let Some(store) = &self.local {
            store.apply(&self.actor_id, payload.clone(), now_millis());
        }
        *self.last() = Some(payload);
        Ok(())
    }

    async fn publish(&self, payload: P) {
        match self.write(payload).await {
            Ok(()) => tracing::trace!(actor = %self.actor_id, table = %self.table, "published"),
            Err(e) => {
                tracing::warn!(actor = %self.actor_id, table = %self.table, error = %e, "publish failed, dropping sample");
            }
        }
    }
}

struct SensorHandle<P> {
    sensor: Arc<dyn DeviceSensor<P>>,
    watch_id: u64,
}

/// Coalescing, rate-limited publisher for the local actor's state.
pub struct OutboundReporter<P> {
    publisher: Arc<Publisher<P>>,
    options: ReporterOptions,
    samples: mpsc::UnboundedSender<P>,
    status: Arc<watch::Sender<ReporterStatus>>,
    cancel: CancellationToken,
    publisher_task: Mutex<Option<JoinHandle<Unpublished<P>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sensor: Mutex<Option<SensorHandle<P>>>,
}

impl<P: EntityPayload + Serialize> OutboundReporter<P> {
    /// Starts the publisher task for `actor_id`'s row in `table`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(
        actor_id: impl Into<String>,
        table: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        options: ReporterOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self::start_with_store(actor_id, table, persistence, None, options, cancel)
    }

    /// Like `start`, also mirroring every write into `local`.
    pub fn start_with_store(
        actor_id: impl Into<String>,
        table: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        local: Option<Arc<EntitySnapshotStore<P>>>,
        options: ReporterOptions,
        cancel: CancellationToken,
    ) -> Self {
        let publisher = Arc::new(Publisher {
            actor_id: actor_id.into(),
            table: table.into(),
            persistence,
            local,
            last_published: Mutex::new(None),
        });
        let (samples, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ReporterStatus::Idle);

        let handle = tokio::spawn(Self::publish_loop(
            Arc::clone(&publisher),
            rx,
            options.min_interval,
            cancel.clone(),
        ));
        tracing::info!(actor = %publisher.actor_id, table = %publisher.table, "outbound reporter started");

        Self {
            publisher,
            options,
            samples,
            status: Arc::new(status),
            cancel,
            publisher_task: Mutex::new(Some(handle)),
            tasks: Mutex::new(Vec::new()),
            sensor: Mutex::new(None),
        }
    }

    async fn publish_loop(
        publisher: Arc<Publisher<P>>,
        mut rx: mpsc::UnboundedReceiver<P>,
        min_interval: Duration,
        cancel: CancellationToken,
    ) -> Unpublished<P> {
        let mut coalescer = Coalescer::new(min_interval);
        loop {
            let deadline = coalescer.deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(sample) = coalescer.take_due(Instant::now()) {
                        publisher.publish(sample).await;
                    }
                }
                received = rx.recv() => match received {
                    Some(sample) => {
                        if let Some(sample) = coalescer.offer(sample, Instant::now()) {
                            publisher.publish(sample).await;
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(actor = %publisher.actor_id, "publisher stopped");
        Unpublished {
            pending: coalescer.into_pending(),
            queue: rx,
        }
    }

    /// Attaches a device sensor: starts its push watch and the fallback poll.
    pub fn attach_sensor(&self, sensor: Arc<dyn DeviceSensor<P>>) {
        let mut watch = sensor.watch();
        let watch_id = watch.id;

        let push = {
            let tx = self.samples.clone();
            let status = Arc::clone(&self.status);
            let cancel = self.cancel.clone();
            let actor = self.publisher.actor_id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = watch.next() => match next {
                            Some(Ok(sample)) => {
                                status.send_replace(ReporterStatus::Reporting);
                                let _ = tx.send(sample);
                            }
                            Some(Err(kind)) => {
                                tracing::warn!(%actor, error = %kind, "push source failed");
                                status.send_replace(ReporterStatus::SourceFailed(kind));
                            }
                            None => {
                                tracing::info!(%actor, "push source ended, poll continues");
                                break;
                            }
                        },
                    }
                }
            })
        };

        let poll = {
            let tx = self.samples.clone();
            let sensor = Arc::clone(&sensor);
            let cancel = self.cancel.clone();
            let period = self.options.poll_interval;
            let actor = self.publisher.actor_id.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => match sensor.current_sample().await {
                            Ok(sample) => {
                                let _ = tx.send(sample);
                            }
                            Err(kind) => tracing::debug!(%actor, error = %kind, "poll read failed"),
                        },
                    }
                }
            })
        };

        self.lock_tasks().extend([push, poll]);
        *self.sensor.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(SensorHandle { sensor, watch_id });
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one sample by hand. Ignored once offline.
    pub fn report(&self, sample: P) {
        if self.cancel.is_cancelled() {
            return;
        }
        if *self.status.borrow() == ReporterStatus::Idle {
            self.status.send_replace(ReporterStatus::Reporting);
        }
        let _ = self.samples.send(sample);
    }

    /// Watch on the reporter status.
    pub fn status(&self) -> watch::Receiver<ReporterStatus> {
        self.status.subscribe()
    }

    /// The payload most recently handed to the persistence service.
    pub fn last_published(&self) -> Option<P> {
        self.publisher.last().clone()
    }

    /// The actor this reporter writes for.
    pub fn actor_id(&self) -> &str {
        &self.publisher.actor_id
    }

    /// Stops every producer and publishes a final offline copy of the newest
    /// sample, published or still pending. Teardown happens even when that
    /// write fails; the error is returned for display. Nothing is written if
    /// no sample ever arrived.
    pub async fn go_offline(&self) -> Result<(), SyncError> {
        let already_offline = *self.status.borrow() == ReporterStatus::Offline;
        if already_offline {
            return Ok(());
        }
        self.cancel.cancel();

        // Producers first, so nothing is sent after the queue is drained.
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(actor = %self.publisher.actor_id, error = %e, "reporter task ended abnormally");
            }
        }
        let publisher_task = self
            .publisher_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let unpublished = match publisher_task {
            Some(task) => match task.await {
                Ok(unpublished) => unpublished.newest(),
                Err(e) => {
                    tracing::warn!(actor = %self.publisher.actor_id, error = %e, "publisher task ended abnormally");
                    None
                }
            },
            None => None,
        };
        let sensor = self
            .sensor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sensor {
            handle.sensor.cancel_watch(handle.watch_id);
        }
        self.status.send_replace(ReporterStatus::Offline);

        let last = unpublished.or_else(|| self.publisher.last().clone());
        let Some(mut payload) = last else {
            tracing::info!(actor = %self.publisher.actor_id, "offline before first publish");
            return Ok(());
        };
        payload.set_live_flag(false);
        match self.publisher.write(payload).await {
            Ok(()) => {
                tracing::info!(actor = %self.publisher.actor_id, "published offline state");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(actor = %self.publisher.actor_id, error = %e, "offline publish failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryBackend, ScriptedSensor};
    use serde_json::{json, Value};

    const TABLE: &str = "rider_locations";

    fn fast() -> ReporterOptions {
        ReporterOptions {
            min_interval: Duration::from_millis(1_000),
            poll_interval: Duration::from_millis(10_000),
        }
    }

    fn sample(n: i64) -> Value {
        json!({ "n": n, "live_flag": true })
    }

    #[test]
    fn test_coalescer_keeps_latest_pending() {
        let start = Instant::now();
        let mut c = Coalescer::new(Duration::from_millis(1_000));

        assert_eq!(c.offer(1, start), Some(1));
        assert_eq!(c.offer(2, start + Duration::from_millis(100)), None);
        assert_eq!(c.offer(3, start + Duration::from_millis(200)), None);
        assert_eq!(c.deadline(), Some(start + Duration::from_millis(1_000)));
        assert_eq!(c.take_due(start + Duration::from_millis(999)), None);
        assert_eq!(c.take_due(start + Duration::from_millis(1_000)), Some(3));
        assert_eq!(c.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_publishes_first_and_trailing_only() {
        let backend = Arc::new(MemoryBackend::new());
        let reporter =
            OutboundReporter::start("me", TABLE, backend.clone(), fast(), CancellationToken::new());

        for n in 0..4 {
            reporter.report(sample(n));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        let writes = backend.writes(TABLE);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].payload["n"], 0);
        assert_eq!(writes[1].payload["n"], 3);
        assert!(writes[1].at - writes[0].at >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_never_closer_than_interval() {
        let backend = Arc::new(MemoryBackend::new());
        let reporter =
            OutboundReporter::start("me", TABLE, backend.clone(), fast(), CancellationToken::new());

        for n in 0..40 {
            reporter.report(sample(n));
            tokio::time::sleep(Duration::from_millis(130)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        let writes = backend.writes(TABLE);
        assert!(writes.len() >= 5);
        for pair in writes.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(1_000));
        }
        assert_eq!(writes.last().map(|w| w.payload["n"].clone()), Some(json!(39)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_error_surfaces_and_poll_continues() {
        let backend = Arc::new(MemoryBackend::new());
        let sensor = Arc::new(ScriptedSensor::new());
        let reporter =
            OutboundReporter::start("me", TABLE, backend.clone(), fast(), CancellationToken::new());
        reporter.attach_sensor(sensor.clone());
        let mut status = reporter.status();

        sensor.push(Err(SourceError::PermissionDenied));
        status
            .wait_for(|s| *s == ReporterStatus::SourceFailed(SourceError::PermissionDenied))
            .await
            .expect("status channel open");

        sensor.set_current(Ok(sample(7)));
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let writes = backend.writes(TABLE);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].payload["n"], 7);
        assert_eq!(writes[0].payload["live_flag"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_offline_publishes_final_offline_row() {
        let backend = Arc::new(MemoryBackend::new());
        let sensor = Arc::new(ScriptedSensor::new());
        let local = Arc::new(EntitySnapshotStore::<Value>::new("me"));
        let reporter = OutboundReporter::start_with_store(
            "me",
            TABLE,
            backend.clone(),
            Some(local.clone()),
            fast(),
            CancellationToken::new(),
        );
        reporter.attach_sensor(sensor.clone());

        sensor.push(Ok(sample(1)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(local.get("me").is_some());

        reporter.go_offline().await.expect("offline write accepted");

        let writes = backend.writes(TABLE);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].payload["live_flag"], false);
        assert_eq!(writes[1].payload["n"], 1);
        assert_eq!(*reporter.status().borrow(), ReporterStatus::Offline);
        assert_eq!(sensor.cancelled_watches(), 1);
        assert_eq!(sensor.watcher_count(), 0);
        assert!(local.get("me").is_none());
        assert!(local.retained("me").is_some());

        reporter.report(sample(2));
        sensor.push(Ok(sample(3)));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.writes(TABLE).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_publish_failure_still_tears_down() {
        let backend = Arc::new(MemoryBackend::new());
        let reporter =
            OutboundReporter::start("me", TABLE, backend.clone(), fast(), CancellationToken::new());
        reporter.report(sample(1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        backend.fail_next_writes(1);
        let result = reporter.go_offline().await;

        assert!(matches!(result, Err(SyncError::WriteFailed(_))));
        assert_eq!(*reporter.status().borrow(), ReporterStatus::Offline);
        assert!(reporter.go_offline().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_offline_carries_pending_trailing_sample() {
        let backend = Arc::new(MemoryBackend::new());
        let reporter =
            OutboundReporter::start("me", TABLE, backend.clone(), fast(), CancellationToken::new());

        reporter.report(sample(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        reporter.report(sample(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        reporter.go_offline().await.expect("offline write accepted");

        let writes = backend.writes(TABLE);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].payload, json!({ "n": 1, "live_flag": true }));
        assert_eq!(writes[1].payload, json!({ "n": 2, "live_flag": false }));
        assert_eq!(reporter.last_published(), Some(json!({ "n": 2, "live_flag": false })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_offline_drains_queued_samples() {
        let backend = Arc::new(MemoryBackend::new());
        let reporter =
            OutboundReporter::start("me", TABLE, backend.clone(), fast(), CancellationToken::new());

        reporter.report(sample(1));
        reporter.report(sample(2));
        reporter.go_offline().await.expect("offline write accepted");

        let writes = backend.writes(TABLE);
        assert_eq!(writes.last().map(|w| w.payload.clone()), Some(json!({ "n": 2, "live_flag": false })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_leaves_mirror_unchanged() {
        let backend = Arc::new(MemoryBackend::new());
        let local = Arc::new(EntitySnapshotStore::<Value>::new("me"));
        let reporter = OutboundReporter::start_with_store(
            "me",
            TABLE,
            backend.clone(),
            Some(local.clone()),
            fast(),
            CancellationToken::new(),
        );

        backend.fail_next_writes(1);
        reporter.report(sample(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(local.get("me").is_none());
        assert_eq!(reporter.last_published(), None);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        reporter.report(sample(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(local.get("me").map(|e| e.payload), Some(sample(2)));
        assert_eq!(reporter.last_published(), Some(sample(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_offline_without_publish_writes_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let reporter: OutboundReporter<Value> =
            OutboundReporter::start("me", TABLE, backend.clone(), fast(), CancellationToken::new());

        reporter.go_offline().await.expect("nothing to write");
        assert!(backend.writes(TABLE).is_empty());
    }
}
