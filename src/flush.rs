//! Flush scheduler with exponential backoff
//!
//! Runs an opaque [`FlushCallback`] on a timer. The callback reports whether
//! there is anything left to send; the scheduler knows nothing else about
//! what it is flushing.
//!
//! - Only one callback invocation runs at a time. A run requested while
//!   another is in flight is rescheduled, never dropped or run concurrently.
//! - Success resets the delay to `initial_delay`. Failure doubles it (capped
//!   at `max_delay`) and retries after the delay that was in effect when the
//!   failure happened.
//! - While backing off, `try_flush` does nothing; the armed retry timer is
//!   the only way back to running.
//! - `stop` freezes all timer activity until `start`. Explicit drains
//!   (`flush_immediately`, `flush_until_drain`) ignore the stop gate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::FlushConfig;
use crate::errors::EventsResult;

/// Per-run options handed to the callback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOptions {
    /// Run is part of shutdown; the transport should not wait long
    pub teardown: bool,
}

impl FlushOptions {
    pub fn teardown() -> Self {
        Self { teardown: true }
    }
}

/// Operation driven by the scheduler
#[async_trait]
pub trait FlushCallback: Send + Sync {
    /// Send what is pending. `Ok(true)` means nothing is left.
    async fn flush(&self, options: FlushOptions) -> EventsResult<bool>;
}

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    BackingOff,
    Stopped,
}

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

struct BackoffState {
    current_delay: Duration,
    stopped: bool,
    timer: Option<Timer>,
    next_timer_id: u64,
}

impl BackoffState {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

struct Inner {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    callback: Arc<dyn FlushCallback>,
    state: Mutex<BackoffState>,
    run_lock: Arc<AsyncMutex<()>>,
}

/// Timer-driven runner for a [`FlushCallback`]
#[derive(Clone)]
pub struct FlushScheduler {
    inner: Arc<Inner>,
}

impl FlushScheduler {
    pub fn new(config: &FlushConfig, callback: Arc<dyn FlushCallback>) -> Self {
        Self::with_delays(
            config.initial_delay(),
            config.max_delay(),
            config.jitter,
            callback,
        )
    }

    pub fn with_delays(
        initial_delay: Duration,
        max_delay: Duration,
        jitter: f64,
        callback: Arc<dyn FlushCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                initial_delay,
                max_delay: max_delay.max(initial_delay),
                jitter: jitter.clamp(0.0, 1.0),
                callback,
                state: Mutex::new(BackoffState {
                    current_delay: initial_delay,
                    stopped: false,
                    timer: None,
                    next_timer_id: 0,
                }),
                run_lock: Arc::new(AsyncMutex::new(())),
            }),
        }
    }

    /// Run the callback now unless stopped or backing off
    pub fn try_flush(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                debug!("Scheduler stopped, not flushing");
                return;
            }
            if state.current_delay > self.inner.initial_delay {
                debug!("Backing off, not flushing");
                return;
            }
            state.clear_timer();
        }

        debug!("Flushing immediately");
        let inner = Arc::clone(&self.inner);
        spawn(async move { inner.execute().await });
    }

    /// Arm a one-shot run after `delay` (default: the current delay), jittered
    pub fn schedule(&self, delay: Option<Duration>) {
        self.inner.schedule(delay);
    }

    /// Run the callback once, even while stopped. Backoff state is untouched.
    pub async fn flush_immediately(&self, options: FlushOptions) -> EventsResult<bool> {
        self.inner.state.lock().clear_timer();
        let _running = self.inner.run_lock.lock().await;
        self.inner.callback.flush(options).await
    }

    /// Wait for any in-flight run, then run the callback until it reports
    /// nothing left or fails, then resume normal scheduling. A scheduler that
    /// was already stopped stays stopped and arms no retry.
    pub async fn flush_until_drain(&self, options: FlushOptions) {
        // Runs spawned just before the drain claim the run lock first
        tokio::task::yield_now().await;
        let running = Arc::clone(&self.inner.run_lock).lock_owned().await;
        let was_stopped = self.inner.state.lock().stopped;
        self.stop();

        let mut rounds: u32 = 0;
        let failed = loop {
            rounds += 1;
            match self.inner.callback.flush(options).await {
                Ok(true) => break false,
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        operation = "flush_until_drain",
                        attempt = rounds,
                        error = %e,
                        "Drain interrupted by failed flush"
                    );
                    break true;
                }
            }
        };
        drop(running);

        debug!(rounds, failed, "Drain finished");
        if was_stopped {
            return;
        }
        self.start();
        if failed {
            self.inner.back_off();
        }
    }

    /// Reset backoff and allow timer activity again
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        state.current_delay = self.inner.initial_delay;
        state.stopped = false;
    }

    /// Cancel any armed timer and block `try_flush`/`schedule` until `start`
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        state.clear_timer();
    }

    pub fn state(&self) -> SchedulerState {
        let state = self.inner.state.lock();
        if state.stopped {
            SchedulerState::Stopped
        } else if self.inner.run_lock.try_lock().is_err() {
            SchedulerState::Running
        } else if state.current_delay > self.inner.initial_delay {
            SchedulerState::BackingOff
        } else {
            SchedulerState::Idle
        }
    }

    /// Delay the next failure will be retried after
    pub fn current_delay(&self) -> Duration {
        self.inner.state.lock().current_delay
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("initial_delay", &self.inner.initial_delay)
            .field("max_delay", &self.inner.max_delay)
            .field("current_delay", &self.current_delay())
            .finish()
    }
}

impl Inner {
    async fn execute(self: Arc<Self>) {
        let Ok(_running) = Arc::clone(&self.run_lock).try_lock_owned() else {
            debug!("Callback already running, rescheduling");
            self.schedule(None);
            return;
        };

        match self.callback.flush(FlushOptions::default()).await {
            Ok(is_empty) => {
                self.reset();
                if !is_empty {
                    self.schedule(None);
                }
            }
            Err(e) => {
                debug!(error = %e, retryable = e.is_retryable(), "Flush failed");
                self.back_off();
            }
        }
    }

    fn schedule(self: &Arc<Self>, delay: Option<Duration>) {
        let mut state = self.state.lock();
        if state.stopped {
            debug!("Scheduler stopped, not scheduling");
            return;
        }
        if state.timer.is_some() {
            debug!("Already scheduled");
            return;
        }

        let delay = self.jittered(delay.unwrap_or(state.current_delay));
        state.next_timer_id += 1;
        let id = state.next_timer_id;

        debug!(delay_ms = delay.as_millis() as u64, "Scheduling flush");
        let inner = Arc::clone(self);
        let handle = spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.state.lock();
                // Superseded or cancelled while sleeping
                match &state.timer {
                    Some(timer) if timer.id == id => state.timer = None,
                    _ => return,
                }
                if state.stopped {
                    return;
                }
            }
            debug!(delay_ms = delay.as_millis() as u64, "Executing scheduled flush");
            inner.execute().await;
        });

        if let Some(handle) = handle {
            state.timer = Some(Timer { id, handle });
        }
    }

    fn back_off(self: &Arc<Self>) {
        let retry_in = {
            let mut state = self.state.lock();
            let delay = state.current_delay;
            state.current_delay = (delay * 2).min(self.max_delay);
            state.clear_timer();
            debug!(
                retry_in_ms = delay.as_millis() as u64,
                next_delay_ms = state.current_delay.as_millis() as u64,
                "Backing off"
            );
            delay
        };
        self.schedule(Some(retry_in));
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        if state.current_delay != self.initial_delay {
            debug!(
                initial_delay_ms = self.initial_delay.as_millis() as u64,
                "Resetting to initial delay"
            );
            state.clear_timer();
            state.current_delay = self.initial_delay;
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + (fastrand::f64() * 2.0 - 1.0) * self.jitter;
        delay.mul_f64(factor.max(0.0))
    }
}

fn spawn<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            warn!("No tokio runtime available, flush not started");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EventsError;
    use std::collections::VecDeque;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    struct ScriptedCallback {
        script: Mutex<VecDeque<EventsResult<bool>>>,
        calls: Mutex<Vec<(Instant, FlushOptions)>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedCallback {
        fn new(script: Vec<EventsResult<bool>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn offsets_ms(&self, start: Instant) -> Vec<u64> {
            self.calls
                .lock()
                .iter()
                .map(|(at, _)| at.duration_since(start).as_millis() as u64)
                .collect()
        }
    }

    #[async_trait]
    impl FlushCallback for ScriptedCallback {
        async fn flush(&self, options: FlushOptions) -> EventsResult<bool> {
            let first = {
                let mut calls = self.calls.lock();
                calls.push((Instant::now(), options));
                calls.len() == 1
            };
            if let (Some(gate), true) = (&self.gate, first) {
                gate.notified().await;
            }
            self.script.lock().pop_front().unwrap_or(Ok(true))
        }
    }

    fn failure() -> EventsResult<bool> {
        Err(EventsError::UnexpectedStatus {
            endpoint: "http://localhost/v1/events".to_string(),
            status: 500,
        })
    }

    fn scheduler(callback: Arc<ScriptedCallback>, max_ms: u64) -> FlushScheduler {
        FlushScheduler::with_delays(
            Duration::from_millis(1_000),
            Duration::from_millis(max_ms),
            0.0,
            callback,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_up_to_max() {
        let callback = ScriptedCallback::new((0..10).map(|_| failure()).collect());
        let scheduler = scheduler(callback.clone(), 4_000);
        let start = Instant::now();

        scheduler.try_flush();
        tokio::time::sleep(Duration::from_millis(12_000)).await;

        assert_eq!(callback.offsets_ms(start), vec![0, 1_000, 3_000, 7_000, 11_000]);
        assert_eq!(scheduler.current_delay(), Duration::from_millis(4_000));
        assert_eq!(scheduler.state(), SchedulerState::BackingOff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let callback = ScriptedCallback::new(vec![failure(), failure(), Ok(true)]);
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.try_flush();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(callback.call_count(), 3);
        assert_eq!(scheduler.current_delay(), Duration::from_millis(1_000));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!scheduler.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_flush_is_ignored_while_backing_off() {
        let callback = ScriptedCallback::new(vec![failure()]);
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.try_flush();
        settle().await;
        scheduler.try_flush();
        settle().await;

        assert_eq!(callback.call_count(), 1);
        assert!(scheduler.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_empty_result_schedules_followup() {
        let callback = ScriptedCallback::new(vec![Ok(false), Ok(true)]);
        let scheduler = scheduler(callback.clone(), 60_000);
        let start = Instant::now();

        scheduler.try_flush();
        tokio::time::sleep(Duration::from_millis(5_000)).await;

        assert_eq!(callback.offsets_ms(start), vec![0, 1_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_request_is_rescheduled() {
        let gate = Arc::new(Notify::new());
        let callback = ScriptedCallback::gated(gate.clone());
        let scheduler = scheduler(callback.clone(), 60_000);
        let start = Instant::now();

        scheduler.try_flush();
        settle().await;
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.try_flush();
        settle().await;
        assert_eq!(callback.call_count(), 1);
        assert!(scheduler.is_scheduled());

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(callback.offsets_ms(start), vec![0, 1_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_not_rearmed() {
        let callback = ScriptedCallback::new(vec![]);
        let scheduler = scheduler(callback.clone(), 60_000);
        let start = Instant::now();

        scheduler.schedule(Some(Duration::from_millis(500)));
        scheduler.schedule(Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        assert_eq!(callback.offsets_ms(start), vec![500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_blocks_timers_until_start() {
        let callback = ScriptedCallback::new(vec![]);
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.schedule(None);
        scheduler.stop();
        scheduler.try_flush();
        scheduler.schedule(None);
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(callback.call_count(), 0);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        scheduler.start();
        scheduler.try_flush();
        settle().await;
        assert_eq!(callback.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_immediately_ignores_stop() {
        let callback = ScriptedCallback::new(vec![Ok(false)]);
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.stop();
        let result = scheduler.flush_immediately(FlushOptions::teardown()).await;

        assert_eq!(result, Ok(false));
        assert_eq!(callback.call_count(), 1);
        assert!(callback.calls.lock()[0].1.teardown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_runs_until_empty() {
        let callback = ScriptedCallback::new(vec![Ok(false), Ok(false), Ok(true)]);
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.flush_until_drain(FlushOptions::default()).await;

        assert_eq!(callback.call_count(), 3);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_on_failure_and_backs_off() {
        let callback = ScriptedCallback::new(vec![Ok(false), failure()]);
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.flush_until_drain(FlushOptions::default()).await;

        assert_eq!(callback.call_count(), 2);
        assert_eq!(scheduler.current_delay(), Duration::from_millis(2_000));
        assert!(scheduler.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_of_stopped_scheduler_stays_stopped() {
        let callback = ScriptedCallback::new(vec![failure(), failure()]);
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.stop();
        scheduler.flush_until_drain(FlushOptions::default()).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(callback.call_count(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.is_scheduled());
        assert_eq!(scheduler.current_delay(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_run() {
        let gate = Arc::new(Notify::new());
        let callback = ScriptedCallback::gated(gate.clone());
        let scheduler = scheduler(callback.clone(), 60_000);

        scheduler.try_flush();
        settle().await;

        let drain = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.flush_until_drain(FlushOptions::default()).await })
        };
        settle().await;
        assert_eq!(callback.call_count(), 1);
        assert!(!drain.is_finished());

        gate.notify_one();
        drain.await.unwrap();
        assert_eq!(callback.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_bounds() {
        let callback = ScriptedCallback::new(vec![]);
        let scheduler = FlushScheduler::with_delays(
            Duration::from_millis(1_000),
            Duration::from_millis(60_000),
            0.1,
            callback,
        );

        for _ in 0..100 {
            let delay = scheduler.inner.jittered(Duration::from_millis(1_000));
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1_100));
        }
    }
}
