pub mod diagnostics;
pub mod idle;
pub mod launcher;
pub mod registry;
pub mod signal;

pub use idle::{IdleRunOptions, IdleRunOutcome, Termination};
pub use launcher::{new_run_id, resolve_executable, Launcher};
pub use registry::Registry;
