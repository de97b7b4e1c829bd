pub mod command;
pub mod config;
pub mod feeding;
pub mod motion;
pub mod readings;
pub mod retry;
pub mod rules;
pub mod schedule;
pub mod snapshot;
pub mod tank;

pub use command::{
    ActionCode, ActionLogEntry, CommandRecord, CommandRequestError, CommandStatus, CommandUpdate,
    NewActionLog, NewCommand, ParseActionError, QueueCommandRequest,
};
pub use config::{
    DispatcherConfig, GatewayConfig, PollSource, PollerConfig, ProxyConfig, SchedulerConfig,
};
pub use feeding::{FeedingEvent, NewFeedingEvent};
pub use motion::{motion_stats, MotionEvent, MotionStats, NewMotionEvent};
pub use readings::{
    latest_per_metric, readings_from_snapshot, IngestError, IngestPayload, NewReading,
    SensorReading,
};
pub use retry::RetryPolicy;
pub use rules::{
    default_rules, AutomationMode, Bound, MissingReading, Rule, RuleEngine, Trigger,
};
pub use schedule::{
    DayOfWeek, ScheduleError, ScheduleFields, ScheduleRun, ScheduleType, ScheduleUpdate,
    WateringSchedule,
};
pub use snapshot::{
    fallback_snapshot, parse_sensor_text, render_sensor_text, Metric, SensorSnapshot,
    SnapshotSource,
};
pub use tank::{tank_report, TankInfo, TankReport, TankStatus};
