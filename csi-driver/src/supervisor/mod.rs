//! Child process supervision.
//!
//! - [`Reaper`]: collects every exited child of the driver
//! - [`CommandRunner`]: one-shot commands (mount, umount) with a timeout
//! - [`Watchdog`]: keeps the long-running tunnel helper alive

pub mod command;
pub mod reaper;
pub mod watchdog;

pub use command::{CommandError, CommandOutput, CommandRunner};
pub use reaper::{ExitStatus, Reaper};
pub use watchdog::{ProcessState, Watchdog, WatchdogConfig, WatchdogError, WatchdogStatus};
