//! `herald-scheduler` — cron-driven execution of delivery schedules.
//!
//! # Overview
//!
//! Schedules live in a repository (SQLite via [`db::SqliteStore`]). The
//! [`engine::Scheduler`] polls for schedules whose `next_run_at` has arrived,
//! resolves and renders their content, hands the message to the
//! [`DeliveryManager`](herald_channels::DeliveryManager) and records the
//! outcome as a [`Delivery`](herald_core::Delivery). The next run is always
//! recomputed from the schedule's cron expression, success or not.
//!
//! # Cron syntax
//!
//! | Token   | Meaning                          |
//! |---------|----------------------------------|
//! | `*`     | every value of the field         |
//! | `n`     | a single value                   |
//! | `a,b,c` | union of the listed parts        |
//! | `a-b`   | inclusive range                  |
//! | `*/n`   | every n-th value from the minimum |
//! | `a-b/n` | every n-th value inside a range  |

pub mod content;
pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod store;

pub use content::{
    ContentResolver, ContentSection, SectionRequest, SectionResolver, TemplateRenderer,
    TeraRenderer,
};
pub use cron::{calculate_next_run, parse_timezone, CronExpression};
pub use db::SqliteStore;
pub use engine::{Repositories, Scheduler, SchedulerState};
pub use error::{CronError, Result, SchedulerError};
pub use store::{DeliveryRepository, NextRun, ScheduleRepository, TemplateRepository};
