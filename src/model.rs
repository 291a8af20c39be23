//! Vendor-neutral description of a mower and of the events streamed about it.
//!
//! Both backends are normalized into these types before they reach the policy or the accessory
//! layer.

use jiff::civil::Weekday;

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Activity {
    NotApplicable,
    Mowing,
    GoingHome,
    Charging,
    Leaving,
    ParkedInCs,
    StoppedInGarden,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum State {
    NotApplicable,
    Paused,
    InOperation,
    WaitUpdating,
    WaitPowerUp,
    Restricted,
    Off,
    Stopped,
    Error,
    FatalError,
    ErrorAtPowerUp,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Mode {
    MainArea,
    SecondaryArea,
    Home,
    Demo,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum OverrideAction {
    ForcePark,
    ForceMow,
    #[default]
    #[serde(other)]
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum RestrictedReason {
    WeekSchedule,
    ParkOverride,
    Sensor,
    DailyLimit,
    Fota,
    Frost,
    AllWorkAreasCompleted,
    External,
    NotApplicable,
    #[default]
    #[serde(other)]
    None,
}

macro_rules! wire_names {
    ($ty:ident { $($variant:ident => $name:literal,)* }) => {
        impl $ty {
            /// The name the backend uses for this value.
            pub(crate) fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)*
                }
            }
        }
    };
}

wire_names!(Activity {
    Unknown => "UNKNOWN",
    NotApplicable => "NOT_APPLICABLE",
    Mowing => "MOWING",
    GoingHome => "GOING_HOME",
    Charging => "CHARGING",
    Leaving => "LEAVING",
    ParkedInCs => "PARKED_IN_CS",
    StoppedInGarden => "STOPPED_IN_GARDEN",
});

wire_names!(State {
    Unknown => "UNKNOWN",
    NotApplicable => "NOT_APPLICABLE",
    Paused => "PAUSED",
    InOperation => "IN_OPERATION",
    WaitUpdating => "WAIT_UPDATING",
    WaitPowerUp => "WAIT_POWER_UP",
    Restricted => "RESTRICTED",
    Off => "OFF",
    Stopped => "STOPPED",
    Error => "ERROR",
    FatalError => "FATAL_ERROR",
    ErrorAtPowerUp => "ERROR_AT_POWER_UP",
});

wire_names!(Mode {
    Unknown => "UNKNOWN",
    MainArea => "MAIN_AREA",
    SecondaryArea => "SECONDARY_AREA",
    Home => "HOME",
    Demo => "DEMO",
});

wire_names!(OverrideAction {
    NotActive => "NOT_ACTIVE",
    ForcePark => "FORCE_PARK",
    ForceMow => "FORCE_MOW",
});

wire_names!(RestrictedReason {
    None => "NONE",
    WeekSchedule => "WEEK_SCHEDULE",
    ParkOverride => "PARK_OVERRIDE",
    Sensor => "SENSOR",
    DailyLimit => "DAILY_LIMIT",
    Fota => "FOTA",
    Frost => "FROST",
    AllWorkAreasCompleted => "ALL_WORK_AREAS_COMPLETED",
    External => "EXTERNAL",
    NotApplicable => "NOT_APPLICABLE",
});

/// Snapshot of what the mower is doing. Never merged field by field: a newer snapshot replaces
/// the previous one entirely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct MowerState {
    pub(crate) activity: Activity,
    pub(crate) state: State,
    pub(crate) mode: Mode,
    pub(crate) error_code: u16,
    pub(crate) error_code_timestamp: u64,
}

impl MowerState {
    pub(crate) fn is_in_operation(&self) -> bool {
        self.state == State::InOperation
    }

    pub(crate) fn is_mowing(&self) -> bool {
        self.state == State::InOperation
            && matches!(self.activity, Activity::Mowing | Activity::Leaving)
    }

    pub(crate) fn is_faulted(&self) -> bool {
        matches!(
            self.state,
            State::Error | State::FatalError | State::ErrorAtPowerUp
        )
    }

    pub(crate) fn is_parked(&self) -> bool {
        matches!(self.activity, Activity::ParkedInCs | Activity::Charging)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CalendarTask {
    /// Minutes after midnight.
    pub(crate) start: u16,
    /// Minutes.
    pub(crate) duration: u16,
    #[serde(default)]
    pub(crate) monday: bool,
    #[serde(default)]
    pub(crate) tuesday: bool,
    #[serde(default)]
    pub(crate) wednesday: bool,
    #[serde(default)]
    pub(crate) thursday: bool,
    #[serde(default)]
    pub(crate) friday: bool,
    #[serde(default)]
    pub(crate) saturday: bool,
    #[serde(default)]
    pub(crate) sunday: bool,
}

impl CalendarTask {
    pub(crate) fn is_scheduled_on(&self, day: Weekday) -> bool {
        match day {
            Weekday::Monday => self.monday,
            Weekday::Tuesday => self.tuesday,
            Weekday::Wednesday => self.wednesday,
            Weekday::Thursday => self.thursday,
            Weekday::Friday => self.friday,
            Weekday::Saturday => self.saturday,
            Weekday::Sunday => self.sunday,
        }
    }

    /// Whether `[start, start + duration)` covers `minute` of `day`.
    ///
    /// A task running past midnight continues into the following day.
    pub(crate) fn covers(&self, day: Weekday, minute: u32) -> bool {
        let start = u32::from(self.start);
        let end = start + u32::from(self.duration);
        if self.is_scheduled_on(day) && start <= minute && minute < end.min(MINUTES_PER_DAY) {
            return true;
        }
        end > MINUTES_PER_DAY
            && self.is_scheduled_on(day.previous())
            && minute < end - MINUTES_PER_DAY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
pub(crate) struct Calendar {
    #[serde(default)]
    pub(crate) tasks: Vec<CalendarTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Planner {
    /// Milliseconds since the epoch in mower local time, zero when nothing is planned.
    pub(crate) next_start_timestamp: u64,
    pub(crate) override_action: OverrideAction,
    pub(crate) restricted_reason: RestrictedReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct SystemInfo {
    pub(crate) manufacturer: String,
    pub(crate) model: String,
    pub(crate) name: String,
    pub(crate) serial_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct Position {
    pub(crate) latitude: f64,
    pub(crate) longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Settings {
    pub(crate) cutting_height: Option<u8>,
    pub(crate) headlight_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Mower {
    pub(crate) id: String,
    pub(crate) battery_percent: u8,
    pub(crate) connected: bool,
    pub(crate) system: SystemInfo,
    pub(crate) state: MowerState,
    pub(crate) calendar: Option<Calendar>,
    pub(crate) planner: Option<Planner>,
    pub(crate) positions: Vec<Position>,
    pub(crate) settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct StatusEvent {
    pub(crate) mower_id: String,
    pub(crate) battery_percent: Option<u8>,
    pub(crate) connected: Option<bool>,
    pub(crate) state: Option<MowerState>,
    pub(crate) planner: Option<Planner>,
    pub(crate) calendar: Option<Calendar>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct SettingsEvent {
    pub(crate) mower_id: String,
    pub(crate) calendar: Option<Calendar>,
    pub(crate) cutting_height: Option<u8>,
    pub(crate) headlight_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct PositionsEvent {
    pub(crate) mower_id: String,
    pub(crate) positions: Vec<Position>,
}

/// An event pushed by the backend, consumed once by the stream service.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Status(StatusEvent),
    Positions(PositionsEvent),
    Settings(SettingsEvent),
    Unknown { id: Option<String>, kind: String },
}
