//! Every mower is presented as a Homie child device of the bridge.

use crate::error::Error;
use crate::model::{Activity, Mower, SettingsEvent, StatusEvent};
use crate::mqtt::MqttClientExt as _;
use crate::policy::ScheduleEnabledPolicy;
use crate::vendor::MowerControl;
use homie5::HOMIE_UNIT_PERCENT;
use homie5::HomieDataType;
use homie5::device_description::DeviceDescriptionBuilder;
use homie5::device_description::HomieDeviceDescription;
use homie5::device_description::NodeDescriptionBuilder;
use homie5::device_description::PropertyDescriptionBuilder;
use homie5::{Homie5DeviceProtocol, HomieDeviceStatus, HomieID};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

static BATTERY_NODE_ID: HomieID = HomieID::new_const("battery");
static BATTERY_LEVEL_PROP_ID: HomieID = HomieID::new_const("level");
static BATTERY_CHARGING_PROP_ID: HomieID = HomieID::new_const("charging");
static BATTERY_LOW_PROP_ID: HomieID = HomieID::new_const("low");
static MOWER_NODE_ID: HomieID = HomieID::new_const("mower");
static MOWER_MODE_PROP_ID: HomieID = HomieID::new_const("mode");
static MOWER_ACTIVITY_PROP_ID: HomieID = HomieID::new_const("activity");
static MOWER_STATE_PROP_ID: HomieID = HomieID::new_const("state");
static MOWER_ERROR_CODE_PROP_ID: HomieID = HomieID::new_const("error-code");
static MOWER_MOTION_PROP_ID: HomieID = HomieID::new_const("motion");
static MOWER_FAULT_PROP_ID: HomieID = HomieID::new_const("fault");
static MOWER_PARKED_PROP_ID: HomieID = HomieID::new_const("parked");
static PLANNER_NODE_ID: HomieID = HomieID::new_const("planner");
static PLANNER_NEXT_START_PROP_ID: HomieID = HomieID::new_const("next-start");
static PLANNER_OVERRIDE_PROP_ID: HomieID = HomieID::new_const("override-action");
static PLANNER_RESTRICTED_REASON_PROP_ID: HomieID = HomieID::new_const("restricted-reason");
static SETTINGS_NODE_ID: HomieID = HomieID::new_const("settings");
static SETTINGS_CUTTING_HEIGHT_PROP_ID: HomieID = HomieID::new_const("cutting-height");
static SETTINGS_HEADLIGHT_PROP_ID: HomieID = HomieID::new_const("headlight-mode");
static SCHEDULE_NODE_ID: HomieID = HomieID::new_const("schedule");
static SCHEDULE_ENABLED_PROP_ID: HomieID = HomieID::new_const("enabled");
static MOWING_NODE_ID: HomieID = HomieID::new_const("mowing");
static MOWING_ON_PROP_ID: HomieID = HomieID::new_const("on");

const LOW_BATTERY_PERCENT: u8 = 20;

pub(crate) type PropertyValue = (&'static HomieID, &'static HomieID, String);

/// The local wall clock.
pub(crate) type Clock = Arc<dyn Fn() -> jiff::Zoned + Send + Sync>;

/// What is currently known about a mower.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    mower: Mower,
    policy: ScheduleEnabledPolicy,
    /// Kept as is while the policy does not apply.
    schedule_enabled: bool,
}

impl Snapshot {
    pub(crate) fn new(mower: Mower) -> Self {
        let mut policy = ScheduleEnabledPolicy::default();
        if let Some(calendar) = &mower.calendar {
            policy.set_calendar(calendar.clone());
        }
        if let Some(planner) = &mower.planner {
            policy.set_planner(planner.clone());
        }
        policy.set_mower_state(mower.state.clone());
        Self {
            mower,
            policy,
            schedule_enabled: false,
        }
    }

    pub(crate) fn apply_status(&mut self, event: StatusEvent) {
        if let Some(battery) = event.battery_percent {
            self.mower.battery_percent = battery;
        }
        if let Some(connected) = event.connected {
            self.mower.connected = connected;
        }
        if let Some(state) = event.state {
            self.policy.set_mower_state(state.clone());
            self.mower.state = state;
        }
        if let Some(planner) = event.planner {
            self.policy.set_planner(planner.clone());
            self.mower.planner = Some(planner);
        }
        if let Some(calendar) = event.calendar {
            self.policy.set_calendar(calendar.clone());
            self.mower.calendar = Some(calendar);
        }
    }

    pub(crate) fn apply_settings(&mut self, event: SettingsEvent) {
        if let Some(calendar) = event.calendar {
            self.policy.set_calendar(calendar.clone());
            self.mower.calendar = Some(calendar);
        }
        if let Some(height) = event.cutting_height {
            self.mower.settings.cutting_height = Some(height);
        }
        if let Some(mode) = event.headlight_mode {
            self.mower.settings.headlight_mode = Some(mode);
        }
    }

    /// Re-evaluate the schedule switch against the wall clock reading `now`.
    pub(crate) fn settle(&mut self, now: jiff::civil::DateTime) {
        if !self.policy.should_apply() {
            return;
        }
        match self.policy.apply(now) {
            Ok(enabled) => self.schedule_enabled = enabled,
            Err(e) => warn!(
                id = %self.mower.id,
                error = &e as &dyn std::error::Error,
                "could not evaluate the schedule policy"
            ),
        }
    }

    pub(crate) fn homie_status(&self) -> HomieDeviceStatus {
        if self.mower.connected {
            HomieDeviceStatus::Ready
        } else {
            HomieDeviceStatus::Disconnected
        }
    }
}

/// The Homie property values describing `snapshot`.
pub(crate) fn property_values(snapshot: &Snapshot, now: jiff::Timestamp) -> Vec<PropertyValue> {
    let mower = &snapshot.mower;
    let state = &mower.state;
    let mut values = vec![
        (&BATTERY_NODE_ID, &BATTERY_LEVEL_PROP_ID, mower.battery_percent.to_string()),
        (
            &BATTERY_NODE_ID,
            &BATTERY_CHARGING_PROP_ID,
            (state.activity == Activity::Charging).to_string(),
        ),
        (
            &BATTERY_NODE_ID,
            &BATTERY_LOW_PROP_ID,
            (mower.battery_percent < LOW_BATTERY_PERCENT).to_string(),
        ),
        (&MOWER_NODE_ID, &MOWER_MODE_PROP_ID, state.mode.as_str().into()),
        (&MOWER_NODE_ID, &MOWER_ACTIVITY_PROP_ID, state.activity.as_str().into()),
        (&MOWER_NODE_ID, &MOWER_STATE_PROP_ID, state.state.as_str().into()),
        (&MOWER_NODE_ID, &MOWER_ERROR_CODE_PROP_ID, state.error_code.to_string()),
        (&MOWER_NODE_ID, &MOWER_MOTION_PROP_ID, state.is_mowing().to_string()),
        (&MOWER_NODE_ID, &MOWER_FAULT_PROP_ID, state.is_faulted().to_string()),
        (&MOWER_NODE_ID, &MOWER_PARKED_PROP_ID, state.is_parked().to_string()),
        (
            &SCHEDULE_NODE_ID,
            &SCHEDULE_ENABLED_PROP_ID,
            snapshot.schedule_enabled.to_string(),
        ),
        (&MOWING_NODE_ID, &MOWING_ON_PROP_ID, state.is_mowing().to_string()),
    ];
    if let Some(planner) = &mower.planner {
        let next_start = match planner.next_start_timestamp {
            0 => Some(now.to_string()),
            t => mower_datetime(t).map(|dt| dt.to_string()),
        };
        if let Some(next_start) = next_start {
            values.push((&PLANNER_NODE_ID, &PLANNER_NEXT_START_PROP_ID, next_start));
        }
        values.push((
            &PLANNER_NODE_ID,
            &PLANNER_OVERRIDE_PROP_ID,
            planner.override_action.as_str().into(),
        ));
        values.push((
            &PLANNER_NODE_ID,
            &PLANNER_RESTRICTED_REASON_PROP_ID,
            planner.restricted_reason.as_str().into(),
        ));
    }
    if let Some(height) = mower.settings.cutting_height {
        values.push((&SETTINGS_NODE_ID, &SETTINGS_CUTTING_HEIGHT_PROP_ID, height.to_string()));
    }
    if let Some(mode) = &mower.settings.headlight_mode {
        values.push((&SETTINGS_NODE_ID, &SETTINGS_HEADLIGHT_PROP_ID, mode.clone()));
    }
    values
}

/// Mowers report wall clock time of their own location as if it were UTC.
fn mower_datetime(since_mower_epoch: u64) -> Option<jiff::civil::DateTime> {
    const EPOCH: jiff::civil::DateTime = jiff::civil::DateTime::constant(1970, 1, 1, 0, 0, 0, 0);
    let duration = std::time::Duration::from_millis(since_mower_epoch);
    EPOCH.checked_add(duration).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Pause,
    ResumeSchedule,
    ParkUntilFurtherNotice,
}

/// Which command a `set` of `node/property` to `value` asks for.
pub(crate) fn command_for(node: &HomieID, property: &HomieID, value: &str) -> Option<Command> {
    let on = match value {
        "true" => true,
        "false" => false,
        _ => return None,
    };
    if *node == SCHEDULE_NODE_ID && *property == SCHEDULE_ENABLED_PROP_ID {
        Some(if on {
            Command::ResumeSchedule
        } else {
            Command::ParkUntilFurtherNotice
        })
    } else if *node == MOWING_NODE_ID && *property == MOWING_ON_PROP_ID {
        Some(if on { Command::Start } else { Command::Pause })
    } else {
        None
    }
}

struct Published {
    status: HomieDeviceStatus,
    values: BTreeMap<String, String>,
}

struct AccessoryState {
    snapshot: Snapshot,
    published: Option<Published>,
}

pub(crate) struct MowerAccessory {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    description: HomieDeviceDescription,
    control: Arc<dyn MowerControl>,
    api_id: String,
    clock: Clock,
    state: Mutex<AccessoryState>,
}

impl MowerAccessory {
    /// The child device id for the backend's mower id. Characters Homie does not allow in an id
    /// are replaced.
    pub(crate) fn id_to_key(id: &str, root_protocol: &Homie5DeviceProtocol) -> String {
        let root_id = root_protocol.device_ref().device_id();
        let id = id
            .chars()
            .map(|c| match c.to_ascii_lowercase() {
                c @ ('a'..='z' | '0'..='9') => c,
                _ => '-',
            })
            .collect::<String>();
        format!("{}-{}", root_id, id.trim_matches('-'))
    }

    pub(crate) fn new(
        mower: Mower,
        mqtt: rumqttc::v5::AsyncClient,
        root_protocol: &Homie5DeviceProtocol,
        control: Arc<dyn MowerControl>,
    ) -> Option<Self> {
        let root_id = root_protocol.device_ref().device_id();
        let child_device_id = HomieID::try_from(Self::id_to_key(&mower.id, root_protocol)).ok()?;
        let protocol = root_protocol.clone_for_child(child_device_id);
        let description = describe(&mower, root_id);
        Some(Self {
            mqtt,
            protocol,
            description,
            control,
            api_id: mower.id.clone(),
            clock: Arc::new(jiff::Zoned::now),
            state: Mutex::new(AccessoryState {
                snapshot: Snapshot::new(mower),
                published: None,
            }),
        })
    }

    pub(crate) fn device_id(&self) -> &HomieID {
        self.protocol.device_ref().device_id()
    }

    fn is_retained(&self, node_id: &HomieID, prop_id: &HomieID) -> bool {
        self.description
            .nodes
            .get(node_id)
            .and_then(|node| node.properties.get(prop_id))
            .is_none_or(|prop| prop.retained)
    }

    /// Replace everything known about the mower.
    pub(crate) async fn refresh(&self, mower: Mower) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let schedule_enabled = state.snapshot.schedule_enabled;
        state.snapshot = Snapshot::new(mower);
        state.snapshot.schedule_enabled = schedule_enabled;
        state.published = None;
        self.publish_changes(&mut state).await
    }

    pub(crate) async fn on_status_event(&self, event: StatusEvent) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.snapshot.apply_status(event);
        self.publish_changes(&mut state).await
    }

    /// Calendar windows open and close without the backend saying so.
    pub(crate) async fn reevaluate_schedule(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.published.is_none() {
            return Ok(());
        }
        self.publish_changes(&mut state).await
    }

    pub(crate) async fn on_settings_event(&self, event: SettingsEvent) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.snapshot.apply_settings(event);
        self.publish_changes(&mut state).await
    }

    /// Carry out a `set` request for one of the switches.
    pub(crate) async fn on_property_set(
        &self,
        node: &HomieID,
        property: &HomieID,
        value: &str,
    ) -> Result<(), Error> {
        let Some(command) = command_for(node, property, value) else {
            warn!(%node, %property, value, "ignoring an unsupported property set request");
            return Ok(());
        };
        info!(id = %self.api_id, ?command, "sending a command to the mower");
        match command {
            Command::Start => self.control.start(&self.api_id).await?,
            Command::Pause => self.control.pause(&self.api_id).await?,
            Command::ResumeSchedule => self.control.resume_schedule(&self.api_id).await?,
            Command::ParkUntilFurtherNotice => {
                self.control.park_until_further_notice(&self.api_id).await?
            }
        }
        if let Command::ResumeSchedule | Command::ParkUntilFurtherNotice = command {
            let mut state = self.state.lock().await;
            state.snapshot.schedule_enabled = command == Command::ResumeSchedule;
            self.publish_changes(&mut state).await?;
        }
        Ok(())
    }

    /// Publish the full device, as on every (re)connection to the broker.
    pub(crate) async fn publish_device(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.publish_all(&mut state).await
    }

    async fn publish_all(&self, state: &mut AccessoryState) -> Result<(), Error> {
        state.published = None;
        let status = state.snapshot.homie_status();
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    let p = self.protocol.publish_state(HomieDeviceStatus::Init);
                    self.mqtt
                        .homie_publish(p)
                        .await
                        .map_err(Error::PublishInitState)?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(Error::GenerateDescription)?;
                    self.mqtt
                        .homie_publish(p)
                        .await
                        .map_err(Error::PublishDescription)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    self.publish_values(state).await?;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    let p = self
                        .protocol
                        .subscribe_props(&self.description)
                        .map_err(Error::GenerateSubscriptions)?;
                    self.mqtt
                        .homie_subscribe(p)
                        .await
                        .map_err(Error::Subscribe)?;
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    self.publish_status(state, status).await?;
                }
            }
        }
        Ok(())
    }

    async fn publish_status(
        &self,
        state: &mut AccessoryState,
        status: HomieDeviceStatus,
    ) -> Result<(), Error> {
        let p = self.protocol.publish_state(status);
        self.mqtt
            .homie_publish(p)
            .await
            .map_err(|e| Error::PublishDeviceState(e, status))?;
        if let Some(published) = &mut state.published {
            published.status = status;
        }
        Ok(())
    }

    /// Publish the values that differ from what was published last.
    async fn publish_values(&self, state: &mut AccessoryState) -> Result<(), Error> {
        let now = (self.clock)();
        state.snapshot.settle(now.datetime());
        let published = state.published.get_or_insert_with(|| Published {
            status: HomieDeviceStatus::Init,
            values: BTreeMap::new(),
        });
        for (node_id, prop_id, value) in property_values(&state.snapshot, now.timestamp()) {
            let key = format!("{node_id}/{prop_id}");
            if published.values.get(&key) == Some(&value) {
                continue;
            }
            let retained = self.is_retained(node_id, prop_id);
            let p = self
                .protocol
                .publish_value(node_id, prop_id, value.clone(), retained);
            self.mqtt
                .homie_publish(p)
                .await
                .map_err(|e| Error::PublishValue(e, node_id, prop_id))?;
            published.values.insert(key, value);
        }
        Ok(())
    }

    async fn publish_changes(&self, state: &mut AccessoryState) -> Result<(), Error> {
        if state.published.is_none() {
            debug!(id = %self.api_id, "device not published yet, publishing all of it");
            return self.publish_all(state).await;
        }
        self.publish_values(state).await?;
        let status = state.snapshot.homie_status();
        if state.published.as_ref().is_some_and(|p| p.status != status) {
            info!(id = %self.api_id, ?status, "mower connectivity changed");
            self.publish_status(state, status).await?;
        }
        Ok(())
    }
}

fn describe(mower: &Mower, root_id: &HomieID) -> HomieDeviceDescription {
    let description = DeviceDescriptionBuilder::new()
        .name(mower.system.name.clone())
        .root(root_id.clone())
        .parent(root_id.clone());
    let battery_level_prop = PropertyDescriptionBuilder::new(HomieDataType::Integer)
        .unit(HOMIE_UNIT_PERCENT)
        .format(0..=100)
        .build();
    let boolean = || PropertyDescriptionBuilder::new(HomieDataType::Boolean).build();
    let battery_node = NodeDescriptionBuilder::new()
        .add_property(BATTERY_LEVEL_PROP_ID.clone(), battery_level_prop)
        .add_property(BATTERY_CHARGING_PROP_ID.clone(), boolean())
        .add_property(BATTERY_LOW_PROP_ID.clone(), boolean())
        .build();
    let mode_prop = PropertyDescriptionBuilder::new(HomieDataType::Enum).build();
    let activity_prop = PropertyDescriptionBuilder::new(HomieDataType::Enum).build();
    let state_prop = PropertyDescriptionBuilder::new(HomieDataType::Enum).build();
    let error_code_prop = PropertyDescriptionBuilder::new(HomieDataType::Integer)
        .format(0..=724)
        .build();
    let mower_node = NodeDescriptionBuilder::new()
        .add_property(MOWER_MODE_PROP_ID.clone(), mode_prop)
        .add_property(MOWER_ACTIVITY_PROP_ID.clone(), activity_prop)
        .add_property(MOWER_STATE_PROP_ID.clone(), state_prop)
        .add_property(MOWER_ERROR_CODE_PROP_ID.clone(), error_code_prop)
        .add_property(MOWER_MOTION_PROP_ID.clone(), boolean())
        .add_property(MOWER_FAULT_PROP_ID.clone(), boolean())
        .add_property(MOWER_PARKED_PROP_ID.clone(), boolean())
        .build();
    let restricted_reason_prop = PropertyDescriptionBuilder::new(HomieDataType::Enum).build();
    let override_prop = PropertyDescriptionBuilder::new(HomieDataType::Enum).build();
    let next_start_prop = PropertyDescriptionBuilder::new(HomieDataType::Datetime).build();
    let planner_node = NodeDescriptionBuilder::new()
        .add_property(PLANNER_OVERRIDE_PROP_ID.clone(), override_prop)
        .add_property(PLANNER_NEXT_START_PROP_ID.clone(), next_start_prop)
        .add_property(
            PLANNER_RESTRICTED_REASON_PROP_ID.clone(),
            restricted_reason_prop,
        )
        .build();
    let cutting_height_prop = PropertyDescriptionBuilder::new(HomieDataType::Integer)
        .format(0..=9)
        .build();
    let headlight_mode_prop = PropertyDescriptionBuilder::new(HomieDataType::Enum).build();
    let settings_node = NodeDescriptionBuilder::new()
        .add_property(SETTINGS_HEADLIGHT_PROP_ID.clone(), headlight_mode_prop)
        .add_property(SETTINGS_CUTTING_HEIGHT_PROP_ID.clone(), cutting_height_prop)
        .build();
    let switch = || {
        PropertyDescriptionBuilder::new(HomieDataType::Boolean)
            .settable(true)
            .build()
    };
    let schedule_node = NodeDescriptionBuilder::new()
        .add_property(SCHEDULE_ENABLED_PROP_ID.clone(), switch())
        .build();
    let mowing_node = NodeDescriptionBuilder::new()
        .add_property(MOWING_ON_PROP_ID.clone(), switch())
        .build();
    description
        .add_node(BATTERY_NODE_ID.clone(), battery_node)
        .add_node(MOWER_NODE_ID.clone(), mower_node)
        .add_node(PLANNER_NODE_ID.clone(), planner_node)
        .add_node(SETTINGS_NODE_ID.clone(), settings_node)
        .add_node(SCHEDULE_NODE_ID.clone(), schedule_node)
        .add_node(MOWING_NODE_ID.clone(), mowing_node)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Calendar, CalendarTask, MowerState, OverrideAction, Planner, RestrictedReason, Settings,
        State, SystemInfo,
    };
    use rstest::rstest;

    fn mower() -> Mower {
        Mower {
            id: "C0FFEE:1".into(),
            battery_percent: 55,
            connected: true,
            system: SystemInfo {
                manufacturer: "Husqvarna".into(),
                model: "AUTOMOWER 430X".into(),
                name: "Lawnie".into(),
                serial_number: "1234".into(),
            },
            state: MowerState {
                activity: Activity::ParkedInCs,
                state: State::Restricted,
                ..Default::default()
            },
            calendar: Some(Calendar {
                tasks: vec![CalendarTask {
                    start: 1,
                    duration: 1,
                    sunday: true,
                    ..Default::default()
                }],
            }),
            planner: Some(Planner::default()),
            positions: Vec::new(),
            settings: Settings::default(),
        }
    }

    fn value_of(values: &[PropertyValue], node: &HomieID, prop: &HomieID) -> Option<String> {
        values
            .iter()
            .find(|(n, p, _)| *n == node && *p == prop)
            .map(|(_, _, v)| v.clone())
    }

    /// 2024-06-02 is a Sunday.
    fn sunday_at(hour: i8, minute: i8) -> jiff::civil::DateTime {
        jiff::civil::date(2024, 6, 2).at(hour, minute, 0, 0)
    }

    #[test]
    fn values_describe_the_snapshot() {
        let mut mower = mower();
        mower.battery_percent = 19;
        mower.state.activity = Activity::Charging;
        mower.settings.cutting_height = Some(4);
        let values = property_values(&Snapshot::new(mower), jiff::Timestamp::UNIX_EPOCH);
        let get = |node, prop| value_of(&values, node, prop);
        assert_eq!(get(&BATTERY_NODE_ID, &BATTERY_LEVEL_PROP_ID).as_deref(), Some("19"));
        assert_eq!(get(&BATTERY_NODE_ID, &BATTERY_LOW_PROP_ID).as_deref(), Some("true"));
        assert_eq!(get(&BATTERY_NODE_ID, &BATTERY_CHARGING_PROP_ID).as_deref(), Some("true"));
        assert_eq!(get(&MOWER_NODE_ID, &MOWER_ACTIVITY_PROP_ID).as_deref(), Some("CHARGING"));
        assert_eq!(get(&MOWER_NODE_ID, &MOWER_STATE_PROP_ID).as_deref(), Some("RESTRICTED"));
        assert_eq!(get(&MOWER_NODE_ID, &MOWER_MOTION_PROP_ID).as_deref(), Some("false"));
        assert_eq!(get(&MOWER_NODE_ID, &MOWER_FAULT_PROP_ID).as_deref(), Some("false"));
        assert_eq!(get(&MOWING_NODE_ID, &MOWING_ON_PROP_ID).as_deref(), Some("false"));
        assert_eq!(
            get(&SETTINGS_NODE_ID, &SETTINGS_CUTTING_HEIGHT_PROP_ID).as_deref(),
            Some("4")
        );
        assert_eq!(get(&SETTINGS_NODE_ID, &SETTINGS_HEADLIGHT_PROP_ID), None);
        assert_eq!(
            get(&PLANNER_NODE_ID, &PLANNER_NEXT_START_PROP_ID).as_deref(),
            Some("1970-01-01T00:00:00Z")
        );
    }

    #[test]
    fn next_start_is_mower_local_time() {
        let mut mower = mower();
        mower.planner = Some(Planner {
            next_start_timestamp: 1653984000000,
            override_action: OverrideAction::ForcePark,
            restricted_reason: RestrictedReason::WeekSchedule,
        });
        let values = property_values(&Snapshot::new(mower), jiff::Timestamp::UNIX_EPOCH);
        let get = |node, prop| value_of(&values, node, prop);
        assert_eq!(
            get(&PLANNER_NODE_ID, &PLANNER_NEXT_START_PROP_ID).as_deref(),
            Some("2022-05-31T08:00:00")
        );
        assert_eq!(
            get(&PLANNER_NODE_ID, &PLANNER_OVERRIDE_PROP_ID).as_deref(),
            Some("FORCE_PARK")
        );
    }

    #[test]
    fn planner_values_need_a_planner() {
        let mut mower = mower();
        mower.planner = None;
        let values = property_values(&Snapshot::new(mower), jiff::Timestamp::UNIX_EPOCH);
        assert!(values.iter().all(|(node, _, _)| **node != PLANNER_NODE_ID));
    }

    #[test]
    fn schedule_follows_the_policy() {
        let mut snapshot = Snapshot::new(mower());
        snapshot.settle(sunday_at(0, 1));
        assert!(snapshot.schedule_enabled);
        snapshot.settle(sunday_at(0, 2));
        assert!(!snapshot.schedule_enabled);
    }

    #[test]
    fn schedule_is_kept_while_mowing() {
        let mut snapshot = Snapshot::new(mower());
        snapshot.settle(sunday_at(0, 1));
        snapshot.apply_status(StatusEvent {
            state: Some(MowerState {
                activity: Activity::Mowing,
                state: State::InOperation,
                ..Default::default()
            }),
            ..Default::default()
        });
        snapshot.settle(sunday_at(12, 0));
        assert!(snapshot.schedule_enabled);
    }

    #[test]
    fn schedule_without_a_planner_is_kept() {
        let mut mower = mower();
        mower.planner = None;
        let mut snapshot = Snapshot::new(mower);
        snapshot.settle(sunday_at(0, 1));
        assert!(!snapshot.schedule_enabled);
    }

    #[test]
    fn events_replace_present_components_only() {
        let mut snapshot = Snapshot::new(mower());
        snapshot.apply_status(StatusEvent {
            battery_percent: Some(90),
            connected: Some(false),
            planner: Some(Planner {
                restricted_reason: RestrictedReason::ParkOverride,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(snapshot.mower.battery_percent, 90);
        assert_eq!(snapshot.homie_status(), HomieDeviceStatus::Disconnected);
        assert_eq!(snapshot.mower.state.activity, Activity::ParkedInCs);
        assert!(snapshot.mower.calendar.is_some());

        snapshot.apply_settings(SettingsEvent {
            calendar: Some(Calendar::default()),
            headlight_mode: Some("ALWAYS_OFF".into()),
            ..Default::default()
        });
        assert_eq!(snapshot.mower.calendar, Some(Calendar::default()));
        assert_eq!(snapshot.mower.settings.headlight_mode.as_deref(), Some("ALWAYS_OFF"));
        assert_eq!(snapshot.mower.settings.cutting_height, None);
    }

    #[rstest]
    #[case(&SCHEDULE_NODE_ID, &SCHEDULE_ENABLED_PROP_ID, "true", Some(Command::ResumeSchedule))]
    #[case(
        &SCHEDULE_NODE_ID,
        &SCHEDULE_ENABLED_PROP_ID,
        "false",
        Some(Command::ParkUntilFurtherNotice)
    )]
    #[case(&MOWING_NODE_ID, &MOWING_ON_PROP_ID, "true", Some(Command::Start))]
    #[case(&MOWING_NODE_ID, &MOWING_ON_PROP_ID, "false", Some(Command::Pause))]
    #[case(&MOWING_NODE_ID, &MOWING_ON_PROP_ID, "on", None)]
    #[case(&BATTERY_NODE_ID, &BATTERY_LEVEL_PROP_ID, "true", None)]
    fn switches_map_to_commands(
        #[case] node: &HomieID,
        #[case] prop: &HomieID,
        #[case] value: &str,
        #[case] expected: Option<Command>,
    ) {
        assert_eq!(command_for(node, prop, value), expected);
    }

    #[derive(Default)]
    struct RecordingControl {
        calls: parking_lot::Mutex<Vec<(&'static str, String)>>,
        fail: bool,
    }

    impl RecordingControl {
        fn record(&self, call: &'static str, id: &str) -> Result<(), Error> {
            self.calls.lock().push((call, id.to_owned()));
            if self.fail {
                return Err(Error::NotAuthorized("POST /mowers/{id}/actions"));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MowerControl for RecordingControl {
        async fn start(&self, mower_id: &str) -> Result<(), Error> {
            self.record("start", mower_id)
        }

        async fn pause(&self, mower_id: &str) -> Result<(), Error> {
            self.record("pause", mower_id)
        }

        async fn resume_schedule(&self, mower_id: &str) -> Result<(), Error> {
            self.record("resume_schedule", mower_id)
        }

        async fn park_until_further_notice(&self, mower_id: &str) -> Result<(), Error> {
            self.record("park_until_further_notice", mower_id)
        }
    }

    fn root() -> Homie5DeviceProtocol {
        let id = HomieID::try_from("automower-bridge".to_owned()).unwrap();
        Homie5DeviceProtocol::new(id, homie5::HomieDomain::Default).0
    }

    fn accessory(
        mower: Mower,
        control: Arc<RecordingControl>,
    ) -> (MowerAccessory, rumqttc::v5::EventLoop) {
        accessory_at(mower, control, Arc::new(jiff::Zoned::now))
    }

    fn accessory_at(
        mower: Mower,
        control: Arc<RecordingControl>,
        clock: Clock,
    ) -> (MowerAccessory, rumqttc::v5::EventLoop) {
        let options = rumqttc::v5::MqttOptions::new("test", "localhost", 1883);
        let (mqtt, eventloop) = rumqttc::v5::AsyncClient::new(options, 64);
        let mut accessory = MowerAccessory::new(mower, mqtt, &root(), control).unwrap();
        accessory.clock = clock;
        (accessory, eventloop)
    }

    #[test]
    fn keys_are_valid_homie_ids() {
        let key = MowerAccessory::id_to_key("C0FFEE:1", &root());
        assert_eq!(key, "automower-bridge-c0ffee-1");
        assert!(HomieID::try_from(key).is_ok());
    }

    #[tokio::test]
    async fn switches_send_commands() {
        let control = Arc::new(RecordingControl::default());
        let (accessory, _eventloop) = accessory(mower(), Arc::clone(&control));
        assert_eq!(accessory.device_id().to_string(), "automower-bridge-c0ffee-1");
        accessory
            .on_property_set(&MOWING_NODE_ID, &MOWING_ON_PROP_ID, "true")
            .await
            .unwrap();
        accessory
            .on_property_set(&SCHEDULE_NODE_ID, &SCHEDULE_ENABLED_PROP_ID, "false")
            .await
            .unwrap();
        accessory
            .on_property_set(&BATTERY_NODE_ID, &BATTERY_LEVEL_PROP_ID, "12")
            .await
            .unwrap();
        assert_eq!(
            *control.calls.lock(),
            [
                ("start", "C0FFEE:1".to_owned()),
                ("park_until_further_notice", "C0FFEE:1".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_commands_are_reported() {
        let control = Arc::new(RecordingControl {
            fail: true,
            ..Default::default()
        });
        let (accessory, _eventloop) = accessory(mower(), Arc::clone(&control));
        let result = accessory
            .on_property_set(&SCHEDULE_NODE_ID, &SCHEDULE_ENABLED_PROP_ID, "true")
            .await;
        assert!(result.unwrap_err().is_not_authorized());
        assert_eq!(control.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn schedule_is_reevaluated_as_time_passes() {
        let now = Arc::new(parking_lot::Mutex::new(sunday_at(0, 1)));
        let reading = Arc::clone(&now);
        let clock: Clock = Arc::new(move || {
            reading
                .lock()
                .to_zoned(jiff::tz::TimeZone::UTC)
                .expect("a valid UTC time")
        });
        let control = Arc::new(RecordingControl::default());
        let (accessory, _eventloop) = accessory_at(mower(), control, clock);
        let schedule = |accessory: &MowerAccessory| {
            let state = accessory.state.try_lock().unwrap();
            let published = state.published.as_ref().unwrap();
            published.values.get("schedule/enabled").cloned()
        };

        accessory.reevaluate_schedule().await.unwrap();
        accessory.publish_device().await.unwrap();
        assert_eq!(schedule(&accessory).as_deref(), Some("true"));

        *now.lock() = sunday_at(0, 2);
        accessory.reevaluate_schedule().await.unwrap();
        assert_eq!(schedule(&accessory).as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn refresh_replaces_the_snapshot_but_keeps_the_schedule() {
        let control = Arc::new(RecordingControl::default());
        let mut unplanned = mower();
        unplanned.planner = None;
        let (accessory, _eventloop) = accessory(unplanned, Arc::clone(&control));
        accessory
            .on_property_set(&SCHEDULE_NODE_ID, &SCHEDULE_ENABLED_PROP_ID, "true")
            .await
            .unwrap();
        let mut refreshed = mower();
        refreshed.battery_percent = 10;
        refreshed.connected = false;
        refreshed.planner = None;
        accessory.refresh(refreshed).await.unwrap();
        let state = accessory.state.lock().await;
        assert_eq!(state.snapshot.mower.battery_percent, 10);
        assert!(state.snapshot.schedule_enabled);
        assert_eq!(state.snapshot.homie_status(), HomieDeviceStatus::Disconnected);
        let published = state.published.as_ref().unwrap();
        assert_eq!(published.status, HomieDeviceStatus::Disconnected);
        assert_eq!(published.values.get("battery/level").map(String::as_str), Some("10"));
    }
}
