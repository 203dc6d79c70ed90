//! Core domain models: buyers, addresses, tasks and portable task specs.

pub mod buyer;
pub mod spec;
pub mod task;

pub use buyer::{is_masked, Address, Buyer, ResolvedContact, MASK_CHAR};
pub use spec::{format_start_time, parse_start_time, TaskSpec};
pub use task::{
    AttemptMode, ContactMode, ExecuteOptions, Selection, Task, TaskDraft, TaskStatus,
};
