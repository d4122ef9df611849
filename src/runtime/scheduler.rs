/// Recurring Execution Scheduler
///
/// One lightweight task per scheduled widget instance. Each task sleeps until
/// its next fire, re-reads the widget from the store, runs it through the pool
/// and waits for the awaiter's verdict before arming the next fire, so the same
/// widget never runs twice at once.
///
/// Handles live in a `DashMap` keyed by widget instance id. Replacing a handle
/// cancels the old one; a finishing task only removes the handle carrying its
/// own generation.

use crate::runtime::awaiter::{AwaitVerdict, ResultAwaiter};
use crate::runtime::pool::ExecutionPool;
use crate::store::WidgetStore;
use crate::widget::ExecutionDescriptor;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Scheduling operations the presence registry drives
pub trait ExecutionScheduling: Send + Sync {
    /// Schedule every widget of a dashboard; returns how many recur
    fn schedule_bulk(&self, descriptors: &[ExecutionDescriptor], is_initial_connect: bool) -> usize;

    /// Cancel every handle of a dashboard; returns how many were live
    fn cancel_all_for_project(&self, project_id: i64) -> usize;
}

#[derive(Debug)]
struct ScheduledHandle {
    project_id: i64,
    token: CancellationToken,
    generation: u64,
}

struct SchedulerInner {
    handles: DashMap<i64, ScheduledHandle>,
    store: Arc<dyn WidgetStore>,
    pool: Arc<ExecutionPool>,
    awaiter: Arc<ResultAwaiter>,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

/// Per-widget recurring scheduler (cheap to clone)
#[derive(Clone)]
pub struct WidgetScheduler {
    inner: Arc<SchedulerInner>,
}

impl WidgetScheduler {
    pub fn new(
        store: Arc<dyn WidgetStore>,
        pool: Arc<ExecutionPool>,
        awaiter: Arc<ResultAwaiter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                handles: DashMap::new(),
                store,
                pool,
                awaiter,
                shutdown,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Create or replace the handle for a widget instance
    ///
    /// No-op for widgets that do not recur. The first fire is immediate or one
    /// delay away.
    pub fn schedule(&self, descriptor: &ExecutionDescriptor, immediate: bool) -> bool {
        let id = descriptor.widget_instance_id;
        if !descriptor.recurs() {
            tracing::debug!("⏭️ Widget instance {} does not recur (delay {})", id, descriptor.delay_seconds);
            return false;
        }
        if self.inner.shutdown.is_cancelled() {
            tracing::debug!("🛑 Scheduler is shut down, ignoring widget instance {}", id);
            return false;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.inner.shutdown.child_token();
        let handle = ScheduledHandle {
            project_id: descriptor.project_id,
            token: token.clone(),
            generation,
        };

        if let Some(previous) = self.inner.handles.insert(id, handle) {
            previous.token.cancel();
            tracing::debug!("🔄 Replaced schedule of widget instance {}", id);
        }

        let delay = descriptor.delay();
        let first_fire = if immediate { Instant::now() } else { Instant::now() + delay };
        tracing::info!(
            "⏰ Scheduled widget instance {} every {:?}{}",
            id,
            delay,
            if immediate { " (firing now)" } else { "" }
        );

        tokio::spawn(drive(Arc::clone(&self.inner), id, delay, first_fire, token, generation));
        true
    }

    /// Replace a widget's schedule after its configuration changed
    pub fn cancel_and_reschedule(&self, descriptor: &ExecutionDescriptor) -> bool {
        self.cancel(descriptor.widget_instance_id);
        self.schedule(descriptor, true)
    }

    pub fn schedule_bulk(&self, descriptors: &[ExecutionDescriptor], is_initial_connect: bool) -> usize {
        let scheduled = descriptors
            .iter()
            .filter(|descriptor| self.schedule(descriptor, is_initial_connect))
            .count();
        tracing::info!("📊 Scheduled {} of {} widget instances", scheduled, descriptors.len());
        scheduled
    }

    pub fn cancel(&self, widget_instance_id: i64) -> bool {
        match self.inner.handles.remove(&widget_instance_id) {
            Some((_, handle)) => {
                handle.token.cancel();
                tracing::debug!("🛑 Cancelled widget instance {}", widget_instance_id);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_for_project(&self, project_id: i64) -> usize {
        let ids: Vec<i64> = self
            .inner
            .handles
            .iter()
            .filter(|entry| entry.project_id == project_id)
            .map(|entry| *entry.key())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if let Some((_, handle)) = self
                .inner
                .handles
                .remove_if(&id, |_, handle| handle.project_id == project_id)
            {
                handle.token.cancel();
                cancelled += 1;
            }
        }

        tracing::info!("🗑️ Cancelled {} scheduled widgets of project {}", cancelled, project_id);
        cancelled
    }

    pub fn is_scheduled(&self, widget_instance_id: i64) -> bool {
        self.inner.handles.contains_key(&widget_instance_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.handles.len()
    }

    /// Cancel everything; later `schedule` calls are ignored
    pub fn shutdown(&self) {
        tracing::info!("⏹️ Stopping widget scheduler ({} handles)", self.scheduled_count());
        self.inner.shutdown.cancel();
        self.inner.handles.clear();
    }
}

impl ExecutionScheduling for WidgetScheduler {
    fn schedule_bulk(&self, descriptors: &[ExecutionDescriptor], is_initial_connect: bool) -> usize {
        WidgetScheduler::schedule_bulk(self, descriptors, is_initial_connect)
    }

    fn cancel_all_for_project(&self, project_id: i64) -> usize {
        WidgetScheduler::cancel_all_for_project(self, project_id)
    }
}

/// Fire loop of one widget instance
async fn drive(
    inner: Arc<SchedulerInner>,
    id: i64,
    mut delay: Duration,
    first_fire: Instant,
    token: CancellationToken,
    generation: u64,
) {
    let mut next_fire = first_fire;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(next_fire) => {}
        }

        let fire_start = Instant::now();
        let descriptor = match inner.store.execution_descriptor(id).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                tracing::info!("🗑️ Widget instance {} no longer exists, dropping its schedule", id);
                break;
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not load widget instance {}: {}", id, e);
                next_fire = fire_start + delay;
                continue;
            }
        };

        if !descriptor.recurs() {
            tracing::info!("⏭️ Widget instance {} stopped recurring", id);
            break;
        }
        delay = descriptor.delay();

        if token.is_cancelled() {
            break;
        }

        tracing::debug!("🔔 Firing widget instance {}", id);
        let pending = inner.pool.submit(descriptor.clone(), token.child_token());
        let verdict = inner.awaiter.await_outcome(&descriptor, pending).await;

        // A cancelled handle never arms another fire
        if token.is_cancelled() {
            break;
        }

        next_fire = match verdict {
            AwaitVerdict::RescheduleNow => Instant::now(),
            AwaitVerdict::Interrupted => break,
            AwaitVerdict::Completed | AwaitVerdict::Cancelled => fire_start + delay,
        };
    }

    inner
        .handles
        .remove_if(&id, |_, handle| handle.generation == generation);
    tracing::debug!("🏁 Schedule loop of widget instance {} ended", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::outcome::OutcomeHandling;
    use crate::sandbox::{PassthroughCodec, SandboxCapabilities, SandboxRunner};
    use crate::store::InMemoryWidgetStore;
    use crate::widget::{
        ExecutionOutcome, FailureKind, ProjectRecord, WidgetDefinition, WidgetInstanceRecord,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Records outcomes; fails `process` while `failing` is set
    #[derive(Default)]
    struct CountingOutcomes {
        processed: Mutex<Vec<ExecutionOutcome>>,
        calls: AtomicU32,
        failing: bool,
    }

    #[async_trait]
    impl OutcomeHandling for CountingOutcomes {
        async fn process(&self, outcome: &ExecutionOutcome) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                anyhow::bail!("store unavailable");
            }
            self.processed.lock().unwrap().push(outcome.clone());
            Ok(())
        }

        async fn report_no_result(&self, _message: &str, _project_id: i64, _widget_instance_id: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn store(delay_seconds: i64) -> Arc<InMemoryWidgetStore> {
        let store = Arc::new(InMemoryWidgetStore::new());
        store.insert_project(ProjectRecord { id: 1, token: "ops".into(), name: "Ops".into() });
        store.insert_widget(WidgetDefinition {
            id: 1,
            category_id: None,
            name: "Counter".into(),
            script: "function run() return { n = WIDGET_INSTANCE_ID } end".into(),
            params: Vec::new(),
            delay_seconds,
            timeout_seconds: None,
        });
        for id in [10, 11] {
            store.insert_instance(WidgetInstanceRecord::new(id, 1, 1, ""));
        }
        store
    }

    fn scheduler(store: Arc<InMemoryWidgetStore>, outcomes: Arc<CountingOutcomes>, max_attempts: u32) -> WidgetScheduler {
        let shutdown = CancellationToken::new();
        let runner = SandboxRunner::new(Arc::new(PassthroughCodec), SandboxCapabilities::offline());
        let pool = Arc::new(ExecutionPool::new(Arc::new(runner), 2));
        let awaiter = Arc::new(ResultAwaiter::new(outcomes, Duration::from_secs(60), max_attempts, shutdown.clone()));
        WidgetScheduler::new(store, pool, awaiter, shutdown)
    }

    async fn descriptor(store: &InMemoryWidgetStore, id: i64) -> ExecutionDescriptor {
        store.execution_descriptor(id).await.unwrap().unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn non_recurring_widgets_are_ignored() {
        let store = store(0);
        let outcomes = Arc::new(CountingOutcomes::default());
        let scheduler = scheduler(store.clone(), Arc::clone(&outcomes), 10);

        assert!(!scheduler.schedule(&descriptor(&store, 10).await, true));
        assert!(!scheduler.is_scheduled(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(outcomes.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn immediate_schedule_fires_and_keeps_one_handle() {
        let store = store(3600);
        let outcomes = Arc::new(CountingOutcomes::default());
        let scheduler = scheduler(store.clone(), Arc::clone(&outcomes), 10);
        let d = descriptor(&store, 10).await;

        assert!(scheduler.schedule(&d, false));
        assert!(scheduler.schedule(&d, true));
        assert_eq!(scheduler.scheduled_count(), 1);

        wait_until(|| outcomes.calls.load(Ordering::SeqCst) >= 1).await;
        let processed = outcomes.processed.lock().unwrap().clone();
        assert_eq!(processed[0].failure_kind, FailureKind::None);
        assert_eq!(processed[0].data.as_deref(), Some("{\"n\":10}"));
        assert!(scheduler.is_scheduled(10));
    }

    #[tokio::test]
    async fn bulk_schedule_and_project_cancel() {
        let store = store(3600);
        let outcomes = Arc::new(CountingOutcomes::default());
        let scheduler = scheduler(store.clone(), Arc::clone(&outcomes), 10);
        let descriptors = store.execution_descriptors_for_project(1).await.unwrap();

        assert_eq!(ExecutionScheduling::schedule_bulk(&scheduler, &descriptors, false), 2);
        assert_eq!(scheduler.scheduled_count(), 2);
        assert_eq!(scheduler.cancel_all_for_project(2), 0);
        assert_eq!(scheduler.cancel_all_for_project(1), 2);
        assert_eq!(scheduler.scheduled_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(outcomes.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_handles_never_fire_again() {
        let store = store(1);
        let outcomes = Arc::new(CountingOutcomes::default());
        let scheduler = scheduler(store.clone(), Arc::clone(&outcomes), 10);

        scheduler.schedule(&descriptor(&store, 10).await, true);
        wait_until(|| outcomes.calls.load(Ordering::SeqCst) >= 1).await;
        assert!(scheduler.cancel(10));

        let seen = outcomes.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(outcomes.calls.load(Ordering::SeqCst), seen);
        assert!(!scheduler.is_scheduled(10));
    }

    #[tokio::test]
    async fn processing_failures_fire_again_immediately() {
        let store = store(3600);
        let outcomes = Arc::new(CountingOutcomes {
            failing: true,
            ..Default::default()
        });
        let scheduler = scheduler(store.clone(), Arc::clone(&outcomes), 2);

        scheduler.schedule(&descriptor(&store, 10).await, true);
        // Two attempts per fire: a fourth call means a second fire happened
        wait_until(|| outcomes.calls.load(Ordering::SeqCst) >= 4).await;
        scheduler.cancel(10);
    }

    #[tokio::test]
    async fn deleted_widgets_drop_their_handle() {
        let store = store(3600);
        let outcomes = Arc::new(CountingOutcomes::default());
        let scheduler = scheduler(store.clone(), Arc::clone(&outcomes), 10);
        let d = descriptor(&store, 11).await;
        store.remove_instance(11);

        assert!(scheduler.schedule(&d, true));
        wait_until(|| !scheduler.is_scheduled(11)).await;
        assert_eq!(outcomes.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reschedule_replaces_and_shutdown_clears() {
        let store = store(3600);
        let outcomes = Arc::new(CountingOutcomes::default());
        let scheduler = scheduler(store.clone(), Arc::clone(&outcomes), 10);
        let d = descriptor(&store, 10).await;

        scheduler.schedule(&d, false);
        assert!(scheduler.cancel_and_reschedule(&d));
        wait_until(|| outcomes.calls.load(Ordering::SeqCst) >= 1).await;
        assert_eq!(scheduler.scheduled_count(), 1);

        scheduler.shutdown();
        assert_eq!(scheduler.scheduled_count(), 0);
        assert!(!scheduler.schedule(&d, true));
    }
}
