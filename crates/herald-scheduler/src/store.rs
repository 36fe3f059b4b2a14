//! Repository contracts the scheduler runs against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{ContentTemplate, Delivery, DeliveryStatus, Schedule};

use crate::error::Result;

/// What to do with a schedule's `next_run_at` after an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// Leave the stored value untouched (manual triggers).
    Keep,
    Set(DateTime<Utc>),
    /// No future run could be computed; the schedule stops being due.
    Clear,
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Enabled schedules whose `next_run_at` is at or before `now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    async fn get_schedule(&self, id: &str) -> Result<Schedule>;

    /// Record the outcome of a run: last status and time, counters, next run.
    async fn update_run_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        ran_at: DateTime<Utc>,
        next_run: NextRun,
    ) -> Result<()>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<ContentTemplate>;
}

#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn create_delivery(&self, delivery: &Delivery) -> Result<()>;

    /// Overwrite the mutable fields of an existing record.
    async fn update_delivery(&self, delivery: &Delivery) -> Result<()>;

    async fn get_delivery(&self, id: &str) -> Result<Delivery>;
}
