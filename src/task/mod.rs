//! Task definitions, defaulting and sanitization.

mod defaults;
mod duration;
#[allow(clippy::module_inception)]
mod task;

pub use defaults::{
    estimate_timeout, expand_home, fill_defaults, is_within, sanitize_prompt, validate_dirs,
    DEFAULT_TIMEOUT,
};
pub(crate) use defaults::word_regex;
pub use duration::{format_duration, parse_duration};
pub(crate) use task::preview;
pub use task::{DispatchResult, Task, TaskResult, TaskRuntime, TaskStatus};
