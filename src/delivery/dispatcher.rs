use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::delivery::processor::Processor;

/// Periodically runs every registered processor on a single background task.
///
/// Processors run one after another in registration order, so the
/// dispatcher never has more than one delivery in flight.
pub struct Dispatcher {
    processors: Vec<Arc<dyn Processor>>,
    interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Dispatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            processors: Vec::new(),
            interval: interval.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Spawns the loop; the first tick runs immediately. No-op when running.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running.is_some() {
            debug!("dispatcher already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.processors.clone(),
            self.interval,
            shutdown_rx,
        ));
        *running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });

        info!(
            interval_secs = self.interval.as_secs_f64(),
            processors = self.processors.len(),
            "dispatcher started"
        );
    }

    /// Signals the loop and waits for the tick in progress to finish.
    ///
    /// In-flight HTTP calls are not cancelled; they complete or time out.
    pub async fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(err) = running.handle.await {
            error!(error = %err, "dispatcher loop ended abnormally");
        }
        info!("dispatcher stopped");
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_loop(
    processors: Vec<Arc<dyn Processor>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => run_tick(&processors).await,
        }
    }
}

async fn run_tick(processors: &[Arc<dyn Processor>]) {
    for processor in processors {
        match processor.process_batch().await {
            Ok(report) if report.fetched > 0 => info!(
                processor = processor.name(),
                fetched = report.fetched,
                delivered = report.delivered,
                retrying = report.retrying,
                failed = report.failed,
                errored = report.errored,
                "delivery batch processed"
            ),
            Ok(_) => debug!(processor = processor.name(), "no due events"),
            Err(err) => error!(
                processor = processor.name(),
                error = %err,
                "delivery batch failed"
            ),
        }
    }
}
