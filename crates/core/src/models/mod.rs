pub mod exec_state;
pub mod rpc;
pub mod run_log;
pub mod schedule;

pub use exec_state::{ExecState, ExecType};
pub use rpc::{Reply, TaskPayload};
pub use run_log::{JobRunLog, ScheduleRunLog, TaskRunLog};
pub use schedule::{Job, Schedule, Task, TaskType};
