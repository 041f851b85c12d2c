//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                   |
//! |-------------|----------------------------------------------------|
//! | `workspace` | `Init`, `Import`, `Export`, `Workspaces`, `Exec`   |
//! | `task`      | `Plan`, `Edit`, `Fix`                              |
//! | `memory`    | `Memory`                                           |
//! | `config`    | `Config`                                           |
//!
//! `session` wires the subsystems together and `progress` renders bus events.

pub mod config;
pub mod memory;
pub mod progress;
pub mod session;
pub mod task;
pub mod workspace;

pub use config::cmd_config;
pub use memory::cmd_memory;
pub use task::{cmd_edit, cmd_fix, cmd_plan};
pub use workspace::{cmd_exec, cmd_export, cmd_import, cmd_init, cmd_workspaces};
