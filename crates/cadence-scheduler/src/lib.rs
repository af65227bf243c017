//! `cadence-scheduler`: time-based and reactive job scheduling with SQLite
//! persistence.
//!
//! # Overview
//!
//! Jobs are persisted to a SQLite `jobs` table by the [`registry::JobRegistry`].
//! The [`engine::SchedulerEngine`] polls it every tick and fires any job whose
//! `next_run` has arrived. Every completion, whatever started it, is fed to the
//! [`evaluator::DependencyEvaluator`], which runs reactive jobs whose
//! conditions now hold. Each execution is appended to the `job_runs` table by
//! the [`history::RunHistory`].
//!
//! # Schedule types
//!
//! | Input                        | Trigger     | Behaviour                              |
//! |------------------------------|-------------|----------------------------------------|
//! | `date` / `once`              | `OneShotAt` | Single fire at an absolute instant     |
//! | `date` / `daily`             | `Cron`      | Fire at HH:MM UTC every day            |
//! | `date` / `weekly`            | `Cron`      | Fire at HH:MM UTC on one weekday       |
//! | `date` / `monthly`           | `Cron`      | Fire at HH:MM UTC on one day of month  |
//! | `date` / `every_x_days`      | `Periodic`  | Repeat every N days from registration  |
//! | `interval`                   | `Periodic`  | Repeat every N seconds                 |
//! | `cron`                       | `Cron`      | 5- or 6-field cron expression          |
//! | `trigger`                    | `Reactive`  | Fire when other jobs' outcomes match   |

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod history;
pub mod kernel;
pub mod normalize;
pub mod registry;
pub mod schedule;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use kernel::{ManualRun, SchedulerKernel};
pub use types::{Job, JobPatch, JobSpec, JobView, RunRecord, TriggerSpec};
