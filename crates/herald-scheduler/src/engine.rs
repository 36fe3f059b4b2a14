use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use herald_channels::{DeliveryManager, DeliveryRequest, RenderedMessage};
use herald_core::{Delivery, DeliveryStatus, Schedule, SchedulerConfig, TriggerSource};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    content::{ContentResolver, TemplateRenderer},
    cron::calculate_next_run,
    error::{Result, SchedulerError},
    store::{DeliveryRepository, NextRun, ScheduleRepository, TemplateRepository},
};

/// Longest time a timed-out execution gets to wind down after its token is
/// cancelled before it is abandoned.
const MAX_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Observable lifecycle of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

enum RunState {
    Idle,
    Running {
        stop: CancellationToken,
        done: watch::Receiver<bool>,
    },
    Stopping {
        done: watch::Receiver<bool>,
    },
}

/// The repositories a [`Scheduler`] reads and writes.
#[derive(Clone)]
pub struct Repositories {
    pub schedules: Arc<dyn ScheduleRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub deliveries: Arc<dyn DeliveryRepository>,
}

impl Repositories {
    /// All three contracts served by one store (e.g. [`SqliteStore`](crate::SqliteStore)).
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ScheduleRepository + TemplateRepository + DeliveryRepository + 'static,
    {
        Self {
            schedules: store.clone(),
            templates: store.clone(),
            deliveries: store,
        }
    }
}

/// Polls for due schedules and executes them.
///
/// Each pass runs due schedules concurrently, at most
/// `max_concurrent_deliveries` at a time, each bounded by
/// `execution_timeout`. Every execution produces one [`Delivery`] record and
/// advances the schedule's `next_run_at`, whether or not it succeeded.
///
/// Cheap to clone; clones drive the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    repos: Repositories,
    manager: Arc<DeliveryManager>,
    resolver: Arc<dyn ContentResolver>,
    renderer: Arc<dyn TemplateRenderer>,
    state: Mutex<RunState>,
    in_flight: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        repos: Repositories,
        manager: Arc<DeliveryManager>,
        resolver: Arc<dyn ContentResolver>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                repos,
                manager,
                resolver,
                renderer,
                state: Mutex::new(RunState::Idle),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Spawn the polling loop.
    ///
    /// The first pass runs immediately, then one per `check_interval`. The
    /// loop ends on [`stop`](Self::stop) or when `parent` is cancelled. A
    /// disabled scheduler starts and stops normally but never polls.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(*state, RunState::Idle) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let stop = parent.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        *state = RunState::Running {
            stop: stop.clone(),
            done: done_rx,
        };
        drop(state);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _exit = LoopExit {
                inner: Arc::clone(&inner),
                done: done_tx,
            };
            inner.run_loop(stop).await;
        });

        info!(
            enabled = self.inner.config.enabled,
            interval_ms = self.inner.config.check_interval().as_millis() as u64,
            max_concurrent = self.inner.config.max_concurrent_deliveries(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the loop and wait until it has exited.
    ///
    /// In-flight executions are cancelled and finish recording their outcome
    /// before this returns. Calling it when not running is a no-op.
    pub async fn stop(&self) {
        let mut done = {
            let mut state = self.inner.state.lock().unwrap();
            match std::mem::replace(&mut *state, RunState::Idle) {
                RunState::Idle => return,
                RunState::Running { stop, done } => {
                    info!("scheduler stopping");
                    stop.cancel();
                    *state = RunState::Stopping { done: done.clone() };
                    done
                }
                RunState::Stopping { done } => {
                    *state = RunState::Stopping { done: done.clone() };
                    done
                }
            }
        };
        // Err means the loop task is gone, which is just as final.
        let _ = done.wait_for(|exited| *exited).await;
    }

    pub fn state(&self) -> SchedulerState {
        match *self.inner.state.lock().unwrap() {
            RunState::Idle => SchedulerState::Idle,
            RunState::Running { .. } => SchedulerState::Running,
            RunState::Stopping { .. } => SchedulerState::Stopping,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Run one polling pass now and wait for its executions.
    ///
    /// Returns the number of schedules dispatched.
    pub async fn check_and_execute(&self) -> usize {
        let parent = self.inner.execution_parent();
        self.inner.check_and_execute(&parent).await
    }

    /// Execute one schedule immediately, outside its cron cadence.
    ///
    /// Updates the schedule's run status but keeps its `next_run_at`.
    pub async fn trigger(&self, schedule_id: &str) -> Result<Delivery> {
        let schedule = self.inner.repos.schedules.get_schedule(schedule_id).await?;
        let _guard = InFlightGuard::claim(&self.inner, &schedule.id).ok_or_else(|| {
            SchedulerError::AlreadyExecuting {
                id: schedule.id.clone(),
            }
        })?;
        info!(schedule_id = %schedule.id, "manual trigger");
        let parent = self.inner.execution_parent();
        self.inner
            .execute_schedule(&schedule, TriggerSource::Manual, parent)
            .await
    }
}

/// Resets the state to `Idle` and signals `done` when the loop task ends,
/// including by panic.
struct LoopExit {
    inner: Arc<Inner>,
    done: watch::Sender<bool>,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = RunState::Idle;
        let _ = self.done.send(true);
        info!("scheduler stopped");
    }
}

/// Marks a schedule as executing for as long as it is held.
struct InFlightGuard {
    inner: Arc<Inner>,
    id: String,
}

impl InFlightGuard {
    fn claim(inner: &Arc<Inner>, id: &str) -> Option<Self> {
        if !inner.in_flight.lock().unwrap().insert(id.to_string()) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A failed execution step, rendered as the delivery's error message.
#[derive(Debug, Error)]
#[error("{context}: {source}")]
struct StepFailure {
    context: &'static str,
    source: SchedulerError,
}

fn step(context: &'static str) -> impl FnOnce(SchedulerError) -> StepFailure {
    move |source| StepFailure { context, source }
}

enum Outcome {
    Finished(std::thread::Result<std::result::Result<(), StepFailure>>),
    Abandoned,
}

impl Inner {
    async fn run_loop(self: &Arc<Self>, stop: CancellationToken) {
        if !self.config.enabled {
            info!("scheduler disabled, waiting for stop");
            stop.cancelled().await;
            return;
        }

        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    self.check_and_execute(&stop).await;
                }
            }
        }
    }

    fn execution_parent(&self) -> CancellationToken {
        match &*self.state.lock().unwrap() {
            RunState::Running { stop, .. } => stop.child_token(),
            _ => CancellationToken::new(),
        }
    }

    async fn check_and_execute(self: &Arc<Self>, cancel: &CancellationToken) -> usize {
        if cancel.is_cancelled() {
            return 0;
        }
        let due = match self.repos.schedules.due_schedules(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load due schedules");
                return 0;
            }
        };
        if due.is_empty() {
            debug!("no schedules due");
            return 0;
        }
        info!(count = due.len(), "executing due schedules");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries()));
        let mut tasks = JoinSet::new();
        for schedule in due {
            let Some(guard) = InFlightGuard::claim(self, &schedule.id) else {
                debug!(schedule_id = %schedule.id, "schedule already executing, skipping");
                continue;
            };
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                break;
            };

            let inner = Arc::clone(self);
            let token = cancel.child_token();
            tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                if let Err(e) = inner
                    .execute_schedule(&schedule, TriggerSource::Schedule, token)
                    .await
                {
                    error!(schedule_id = %schedule.id, error = %e, "schedule execution failed");
                }
            });
        }

        let dispatched = tasks.len();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "schedule execution task aborted");
            }
        }
        dispatched
    }

    /// Run one schedule end to end and return its final delivery record.
    async fn execute_schedule(
        &self,
        schedule: &Schedule,
        trigger: TriggerSource,
        cancel: CancellationToken,
    ) -> Result<Delivery> {
        let mut delivery = Delivery::pending(schedule, trigger);
        if let Err(e) = self.repos.deliveries.create_delivery(&delivery).await {
            error!(schedule_id = %schedule.id, error = %e, "failed to create delivery record");
            self.finish_schedule(schedule, DeliveryStatus::Failed, trigger)
                .await;
            return Err(e);
        }
        debug!(schedule_id = %schedule.id, delivery_id = %delivery.id, %trigger, "execution started");

        let timeout = self.config.execution_timeout();
        let mut timed_out = false;
        let outcome = {
            let run = AssertUnwindSafe(self.run_steps(schedule, &mut delivery, &cancel)).catch_unwind();
            tokio::pin!(run);
            tokio::select! {
                finished = &mut run => Outcome::Finished(finished),
                _ = tokio::time::sleep(timeout) => {
                    timed_out = true;
                    warn!(schedule_id = %schedule.id, timeout_ms = timeout.as_millis() as u64, "execution timed out, cancelling");
                    cancel.cancel();
                    match tokio::time::timeout(timeout.min(MAX_CANCEL_GRACE), &mut run).await {
                        Ok(finished) => Outcome::Finished(finished),
                        Err(_) => Outcome::Abandoned,
                    }
                }
            }
        };

        let timeout_message = SchedulerError::Timeout {
            ms: timeout.as_millis() as u64,
        }
        .to_string();
        match outcome {
            Outcome::Finished(Ok(Ok(()))) => {
                if timed_out && delivery.status != DeliveryStatus::Delivered {
                    delivery.error_message = Some(timeout_message);
                }
            }
            Outcome::Finished(Ok(Err(failure))) => {
                warn!(schedule_id = %schedule.id, delivery_id = %delivery.id, error = %failure, "execution failed");
                delivery.mark_failed(failure.to_string());
            }
            Outcome::Finished(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(schedule_id = %schedule.id, delivery_id = %delivery.id, panic = %message, "execution panicked");
                delivery.mark_failed(format!("execution panicked: {message}"));
            }
            Outcome::Abandoned => {
                error!(schedule_id = %schedule.id, delivery_id = %delivery.id, "execution abandoned after timeout");
                delivery.mark_failed(timeout_message);
            }
        }

        if let Err(e) = self.repos.deliveries.update_delivery(&delivery).await {
            error!(delivery_id = %delivery.id, error = %e, "failed to persist delivery outcome");
        }
        self.finish_schedule(schedule, delivery.status, trigger).await;

        info!(
            schedule_id = %schedule.id,
            delivery_id = %delivery.id,
            status = %delivery.status,
            delivered = delivery.recipients_delivered,
            failed = delivery.recipients_failed,
            duration_ms = delivery.duration_ms.unwrap_or_default(),
            "schedule executed"
        );
        Ok(delivery)
    }

    /// Template, content, render, deliver. Leaves `delivery` completed on
    /// success; the caller marks it failed otherwise.
    async fn run_steps(
        &self,
        schedule: &Schedule,
        delivery: &mut Delivery,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), StepFailure> {
        let template = self
            .repos
            .templates
            .get_template(&schedule.template_id)
            .await
            .map_err(step("Failed to fetch template"))?;

        let content = self
            .resolver
            .resolve(&template, schedule, Utc::now())
            .await
            .map_err(step("Failed to resolve content"))?;

        let subject = self
            .renderer
            .render_text(&template.subject, &content)
            .map_err(step("Failed to render subject"))?;
        let html = self
            .renderer
            .render_html(&template.body_html, &content)
            .map_err(step("Failed to render HTML"))?;
        let text = self
            .renderer
            .render_text(&template.body_text, &content)
            .map_err(step("Failed to render text"))?;

        delivery.mark_sending(&subject);
        if let Err(e) = self.repos.deliveries.update_delivery(delivery).await {
            warn!(delivery_id = %delivery.id, error = %e, "failed to record sending state");
        }

        let request = DeliveryRequest {
            delivery_id: delivery.id.clone(),
            schedule_id: Some(schedule.id.clone()),
            recipients: schedule.recipients.clone(),
            channels: schedule.channels.clone(),
            channel_configs: schedule.channel_configs.clone(),
            message: RenderedMessage::new(subject, html, text),
        };
        let report = self
            .manager
            .deliver(cancel, request)
            .await
            .map_err(|e| step("Delivery failed")(e.into()))?;

        delivery.mark_completed(
            report.status,
            report.successful_deliveries as u32,
            report.failed_deliveries as u32,
        );
        Ok(())
    }

    /// Persist the run status. Scheduled runs always move `next_run_at`
    /// forward from now; a schedule whose next run cannot be computed is
    /// cleared so it stops firing.
    async fn finish_schedule(&self, schedule: &Schedule, status: DeliveryStatus, trigger: TriggerSource) {
        let now = Utc::now();
        let next = match trigger {
            TriggerSource::Manual => NextRun::Keep,
            TriggerSource::Schedule => {
                match calculate_next_run(&schedule.cron_expression, now, &schedule.timezone) {
                    Ok(at) => NextRun::Set(at),
                    Err(e) => {
                        error!(schedule_id = %schedule.id, error = %e, "cannot compute next run, clearing it");
                        NextRun::Clear
                    }
                }
            }
        };
        if let Err(e) = self
            .repos
            .schedules
            .update_run_status(&schedule.id, status, now, next)
            .await
        {
            error!(schedule_id = %schedule.id, error = %e, "failed to update schedule run status");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
