//! Decides whether the on-board schedule of a mower should be presented as enabled.

use crate::error::Error;
use crate::model::{Calendar, MowerState, OverrideAction, Planner, RestrictedReason};

#[derive(Debug, Clone, Default)]
pub(crate) struct ScheduleEnabledPolicy {
    calendar: Option<Calendar>,
    planner: Option<Planner>,
    mower_state: Option<MowerState>,
}

impl ScheduleEnabledPolicy {
    pub(crate) fn set_calendar(&mut self, calendar: Calendar) {
        self.calendar = Some(calendar);
    }

    pub(crate) fn set_planner(&mut self, planner: Planner) {
        self.planner = Some(planner);
    }

    pub(crate) fn set_mower_state(&mut self, state: MowerState) {
        self.mower_state = Some(state);
    }

    /// Whether [`Self::apply`] has enough to go on and may be consulted right now.
    ///
    /// While the mower is in operation the switch is left alone so a running session is not
    /// disturbed.
    pub(crate) fn should_apply(&self) -> bool {
        if self.calendar.is_none() || self.planner.is_none() {
            return false;
        }
        !self
            .mower_state
            .as_ref()
            .is_some_and(MowerState::is_in_operation)
    }

    /// Evaluate the policy at `now`, a reading of the local wall clock.
    pub(crate) fn apply(&self, now: jiff::civil::DateTime) -> Result<bool, Error> {
        let (Some(calendar), Some(planner)) = (&self.calendar, &self.planner) else {
            return Err(Error::InvalidState(
                "the schedule policy needs both a calendar and a planner",
            ));
        };
        if planner.override_action == OverrideAction::ForcePark {
            return Ok(false);
        }
        if planner.restricted_reason == RestrictedReason::ParkOverride {
            return Ok(false);
        }
        // The backend has already decided the schedule is running.
        if planner.restricted_reason == RestrictedReason::WeekSchedule
            && planner.next_start_timestamp != 0
        {
            return Ok(true);
        }
        let day = now.weekday();
        let minute =
            u32::from(now.hour().unsigned_abs()) * 60 + u32::from(now.minute().unsigned_abs());
        Ok(calendar.tasks.iter().any(|task| task.covers(day, minute)))
    }
}
