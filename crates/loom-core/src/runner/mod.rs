//! Worker-side execution: predicates, templates, task and job runners.

pub mod exec;
pub mod expr;
pub mod filter;
pub mod job_runner;
pub mod task_runner;
pub mod template;

pub use exec::{ExecError, ExecOutcome};
pub use expr::{Expr, ExprError, Operator};
pub use filter::{ExprFilter, FilterResult};
pub use job_runner::{JobReport, JobRunner, ProgressSender};
pub use task_runner::{TaskNotice, TaskRunner};
pub use template::{TemplateError, render};
