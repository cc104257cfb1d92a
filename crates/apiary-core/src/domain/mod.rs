//! Domain model: ids, task record, state machine, key layout, errors, events.

pub mod errors;
pub mod events;
pub mod ids;
pub mod key;
pub mod priority;
pub mod retry;
pub mod status;
pub mod task;
pub mod transition;

pub use self::errors::{CoordError, ErrorKind};
pub use self::events::{EventKind, WatchEvent};
pub use self::ids::{IdParseError, TaskId, WorkerId};
pub use self::key::{KeyParseError, TaskKey, band_prefix, status_prefix};
pub use self::priority::{ParsePriorityError, Priority};
pub use self::retry::RetryPolicy;
pub use self::status::{ParseStatusError, TaskStatus};
pub use self::task::{NewTask, Task};
pub use self::transition::{Actor, GuardViolation};
