//! Trigger engine
//!
//! Decides when observations are worth signing and drives them through a
//! pool of signer workers into time-windowed batches. Three independent
//! event sources feed one decision loop: raw update arrivals, Clock ticks
//! (periodic full refresh) and Delta ticks (threshold-exceeding change).
//!
//! Baselines move synchronously at selection time, before the asynchronous
//! sign completes, so a slow signature never re-triggers the same movement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::signer::Signer;
use crate::types::{
    AssetId, OracleId, PriceUpdate, SignedPriceUpdate, SignedPriceUpdateBatch,
    TriggeredPriceUpdate, TriggerType,
};

/// Capacity of the fan-in event queue and both pipeline-stage queues.
const EVENT_QUEUE_CAPACITY: usize = 4096;
const SIGN_QUEUE_CAPACITY: usize = 4096;
const SIGNED_QUEUE_CAPACITY: usize = 4096;

/// Window over which signed per-asset updates coalesce into one message.
const BATCH_FLUSH_PERIOD: Duration = Duration::from_millis(1);

/// Minimum spacing between drop warnings, per queue.
pub(crate) const FULL_QUEUE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Rate limiter for drop warnings so sustained overload cannot log-storm.
pub(crate) struct DropLogLimiter {
    last: Option<Instant>,
}

impl DropLogLimiter {
    pub(crate) fn new() -> Self {
        Self { last: None }
    }

    pub(crate) fn should_log(&mut self) -> bool {
        match self.last {
            Some(at) if at.elapsed() < FULL_QUEUE_LOG_INTERVAL => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}

enum EngineEvent {
    Update(PriceUpdate),
    ClockTick,
    DeltaTick,
    IngressClosed,
}

/// Per-asset trigger state plus the knobs that drive selection.
pub struct PriceUpdateProcessor {
    signer: Arc<Signer>,
    oracle_id: OracleId,
    num_runners: usize,
    clock_period: Duration,
    delta_check_period: Duration,
    change_threshold_proportion: f64,
    sign_every_update: bool,
    latest: HashMap<AssetId, PriceUpdate>,
    baseline: HashMap<AssetId, f64>,
}

impl PriceUpdateProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<Signer>,
        oracle_id: OracleId,
        num_runners: usize,
        clock_period: Duration,
        delta_check_period: Duration,
        change_threshold_proportion: f64,
        sign_every_update: bool,
    ) -> Self {
        Self {
            signer,
            oracle_id,
            num_runners,
            clock_period,
            delta_check_period,
            change_threshold_proportion,
            sign_every_update,
            latest: HashMap::new(),
            baseline: HashMap::new(),
        }
    }

    /// Clock tick: select every known asset, restamped to now. This is the
    /// only timer path that establishes a baseline for a new asset.
    fn clock_selections(&self, now_ns: i64) -> Vec<TriggeredPriceUpdate> {
        self.latest
            .values()
            .map(|update| TriggeredPriceUpdate {
                update: PriceUpdate {
                    publish_timestamp: now_ns,
                    asset: update.asset.clone(),
                    price: update.price,
                },
                trigger: TriggerType::Clock,
            })
            .collect()
    }

    /// Delta tick: select assets whose relative change against the baseline
    /// strictly exceeds the threshold. Assets without a baseline are never
    /// selected here; they must first be surfaced by a Clock tick (or the
    /// sign-every-update path). Intentional: see DESIGN.md.
    fn delta_selections(&self) -> Vec<TriggeredPriceUpdate> {
        let mut selections = Vec::new();
        for (asset, update) in &self.latest {
            let Some(baseline) = self.baseline.get(asset) else {
                continue;
            };
            let relative_change = ((update.price - baseline) / baseline).abs();
            if relative_change > self.change_threshold_proportion {
                selections.push(TriggeredPriceUpdate {
                    update: update.clone(),
                    trigger: TriggerType::Delta,
                });
            }
        }
        selections
    }

    /// Run the engine until the ingress channel closes, then stop the timer
    /// sources, drain the workers and flush the aggregator.
    pub async fn run(
        mut self,
        updates_rx: mpsc::Receiver<PriceUpdate>,
        batch_tx: mpsc::Sender<SignedPriceUpdateBatch>,
    ) {
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let mut source_tasks: Vec<JoinHandle<()>> = Vec::new();

        // ingress forwarder
        {
            let event_tx = event_tx.clone();
            let mut updates_rx = updates_rx;
            source_tasks.push(tokio::spawn(async move {
                while let Some(update) = updates_rx.recv().await {
                    if event_tx.send(EngineEvent::Update(update)).await.is_err() {
                        return;
                    }
                }
                let _ = event_tx.send(EngineEvent::IngressClosed).await;
            }));
        }

        // clock source, disabled entirely when the period is zero
        if !self.clock_period.is_zero() {
            let event_tx = event_tx.clone();
            let period = self.clock_period;
            source_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    if event_tx.send(EngineEvent::ClockTick).await.is_err() {
                        return;
                    }
                }
            }));
        }

        // delta source, only when not signing every update
        if !self.sign_every_update && !self.delta_check_period.is_zero() {
            let event_tx = event_tx.clone();
            let period = self.delta_check_period;
            source_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if event_tx.send(EngineEvent::DeltaTick).await.is_err() {
                        return;
                    }
                }
            }));
        }
        drop(event_tx);

        let (sign_tx, sign_rx) = mpsc::channel::<TriggeredPriceUpdate>(SIGN_QUEUE_CAPACITY);
        let (signed_tx, signed_rx) = mpsc::channel::<SignedPriceUpdate>(SIGNED_QUEUE_CAPACITY);
        let sign_rx = Arc::new(Mutex::new(sign_rx));

        let num_workers = signer_worker_count(self.num_runners);
        debug!(num_workers, "starting signer workers");
        let mut worker_tasks = Vec::with_capacity(num_workers);
        for worker in 0..num_workers {
            worker_tasks.push(spawn_signer_worker(
                worker,
                Arc::clone(&self.signer),
                self.oracle_id.clone(),
                Arc::clone(&sign_rx),
                signed_tx.clone(),
            ));
        }
        drop(signed_tx);

        let aggregator = tokio::spawn(run_aggregator(signed_rx, batch_tx));

        let mut drop_log = DropLogLimiter::new();
        while let Some(event) = event_rx.recv().await {
            let selections = match event {
                EngineEvent::Update(update) => {
                    let mut selections = Vec::new();
                    if self.sign_every_update {
                        selections.push(TriggeredPriceUpdate {
                            update: update.clone(),
                            trigger: TriggerType::Unspecified,
                        });
                    }
                    self.latest.insert(update.asset.clone(), update);
                    selections
                }
                EngineEvent::ClockTick => self.clock_selections(now_ns()),
                EngineEvent::DeltaTick => self.delta_selections(),
                EngineEvent::IngressClosed => break,
            };

            for selection in selections {
                self.baseline
                    .insert(selection.update.asset.clone(), selection.update.price);
                if sign_tx.try_send(selection).is_err() && drop_log.should_log() {
                    warn!("dropped update selected for signing - sign queue full");
                }
            }
        }

        // shutdown: stop the timer sources, let the workers drain, then
        // wait for the aggregator's final flush
        for task in source_tasks {
            task.abort();
        }
        drop(sign_tx);
        for task in worker_tasks {
            let _ = task.await;
        }
        let _ = aggregator.await;
        debug!("trigger engine stopped");
    }
}

/// Signer pool size: available cores split across runners, at least one.
pub fn signer_worker_count(num_runners: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / num_runners.max(1)).max(1)
}

fn spawn_signer_worker(
    worker: usize,
    signer: Arc<Signer>,
    oracle_id: OracleId,
    sign_rx: Arc<Mutex<mpsc::Receiver<TriggeredPriceUpdate>>>,
    signed_tx: mpsc::Sender<SignedPriceUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut drop_log = DropLogLimiter::new();
        loop {
            // the mutex is a work-queue handoff: held only while idle-waiting
            let item = {
                let mut rx = sign_rx.lock().await;
                rx.recv().await
            };
            let Some(item) = item else {
                return;
            };

            let started = Instant::now();
            match signer.sign(&oracle_id, &item.update, item.trigger) {
                Ok(signed) => {
                    if signed_tx.try_send(signed).is_err() && drop_log.should_log() {
                        warn!("dropped signed update - aggregation queue full");
                    }
                    debug!(
                        worker,
                        asset = %item.update.asset,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "signed update"
                    );
                }
                Err(e) => {
                    // invariant violation on a structurally valid input:
                    // skip the item, keep the pipeline live (DESIGN.md)
                    error!(asset = %item.update.asset, error = %e, "failed to sign update");
                }
            }
        }
    })
}

/// Drain signed updates into a per-asset map and flush it on a short timer.
/// Insertion overwrites, so the last completed signature for an asset wins
/// within the window.
async fn run_aggregator(
    mut signed_rx: mpsc::Receiver<SignedPriceUpdate>,
    batch_tx: mpsc::Sender<SignedPriceUpdateBatch>,
) {
    let mut flush = tokio::time::interval(BATCH_FLUSH_PERIOD);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut batch = SignedPriceUpdateBatch::new();

    loop {
        tokio::select! {
            maybe = signed_rx.recv() => {
                match maybe {
                    Some(signed) => {
                        batch.insert(signed.asset_id.clone(), signed);
                    }
                    None => break,
                }
            }
            _ = flush.tick() => {
                if !batch.is_empty() {
                    let out = std::mem::take(&mut batch);
                    if batch_tx.send(out).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    if !batch.is_empty() {
        let _ = batch_tx.send(batch).await;
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
