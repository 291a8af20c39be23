pub(crate) mod oauth {
    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct TokenResponse {
        pub(crate) access_token: String,
        pub(crate) expires_in: f32,
        pub(crate) provider: Option<String>,
    }
}

pub(crate) mod automower {
    use crate::model::{Activity, Calendar, Mode, OverrideAction, RestrictedReason, State};

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct JsonApiDataListDocument {
        pub(crate) data: Vec<JsonApiData>,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct JsonApiData {
        pub(crate) r#type: String,
        pub(crate) id: String,
        pub(crate) attributes: MowerData,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct MowerData {
        pub(crate) system: System,
        pub(crate) battery: Battery,
        pub(crate) mower: MowerApp,
        pub(crate) planner: Option<Planner>,
        pub(crate) metadata: Metadata,
        pub(crate) calendar: Option<Calendar>,
        pub(crate) positions: Option<Vec<Position>>,
        pub(crate) settings: Option<Settings>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct System {
        pub(crate) name: String,
        pub(crate) model: String,
        pub(crate) serial_number: u64,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Battery {
        pub(crate) battery_percent: u8,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct MowerApp {
        #[serde(default)]
        pub(crate) mode: Mode,
        #[serde(default)]
        pub(crate) activity: Activity,
        #[serde(default)]
        pub(crate) state: State,
        pub(crate) error_code: Option<u16>,
        pub(crate) error_code_timestamp: Option<u64>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Planner {
        #[serde(default)]
        pub(crate) next_start_timestamp: u64,
        pub(crate) r#override: Option<PlannerOverride>,
        #[serde(default)]
        pub(crate) restricted_reason: RestrictedReason,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct PlannerOverride {
        #[serde(default)]
        pub(crate) action: OverrideAction,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Metadata {
        pub(crate) connected: bool,
    }

    #[derive(Debug, serde::Deserialize, Clone)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Position {
        pub(crate) latitude: Option<f64>,
        pub(crate) longitude: Option<f64>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Settings {
        pub(crate) cutting_height: Option<u8>,
        pub(crate) headlight: Option<Headlight>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Headlight {
        pub(crate) mode: String,
    }

    #[derive(Debug, serde::Serialize)]
    pub(crate) struct ActionDocument {
        pub(crate) data: Action,
    }

    #[derive(Debug, serde::Serialize)]
    #[serde(tag = "type")]
    pub(crate) enum Action {
        Start { attributes: StartAttributes },
        Pause,
        ResumeSchedule,
        ParkUntilFurtherNotice,
    }

    #[derive(Debug, serde::Serialize)]
    pub(crate) struct StartAttributes {
        /// Minutes.
        pub(crate) duration: u32,
    }
}

pub(crate) mod websocket {
    use super::automower::*;
    use crate::model::Calendar;

    /// Everything a frame on the Automower Connect stream may carry. Handshake frames only have
    /// `connectionId` and `ready`, event frames only `id`/`type`/`attributes`.
    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Envelope {
        pub(crate) connection_id: Option<String>,
        pub(crate) id: Option<String>,
        pub(crate) r#type: Option<String>,
        #[serde(default)]
        pub(crate) attributes: serde_json::Value,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct StatusAttributes {
        pub(crate) battery: Option<Battery>,
        pub(crate) mower: Option<MowerApp>,
        pub(crate) planner: Option<Planner>,
        pub(crate) metadata: Option<Metadata>,
        pub(crate) calendar: Option<Calendar>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct SettingsAttributes {
        pub(crate) calendar: Option<Calendar>,
        pub(crate) cutting_height: Option<u8>,
        pub(crate) headlight: Option<Headlight>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct PositionsAttributes {
        #[serde(default)]
        pub(crate) positions: Vec<Position>,
    }
}

pub(crate) mod gardena {
    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct Value<T> {
        pub(crate) value: T,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct LocationList {
        pub(crate) data: Vec<Resource>,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct LocationDocument {
        #[serde(default)]
        pub(crate) included: Vec<Resource>,
    }

    /// A JSON:API resource; the same shape is used for REST payloads and websocket frames.
    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct Resource {
        pub(crate) id: String,
        pub(crate) r#type: String,
        #[serde(default)]
        pub(crate) attributes: serde_json::Value,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct MowerAttributes {
        pub(crate) activity: Option<Value<String>>,
        pub(crate) state: Option<Value<String>>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct CommonAttributes {
        pub(crate) name: Option<Value<String>>,
        pub(crate) battery_level: Option<Value<u8>>,
        pub(crate) rf_link_state: Option<Value<String>>,
        pub(crate) serial: Option<Value<String>>,
        pub(crate) model_type: Option<Value<String>>,
    }

    #[derive(Debug, serde::Serialize)]
    pub(crate) struct Request<A> {
        pub(crate) data: RequestData<A>,
    }

    #[derive(Debug, serde::Serialize)]
    pub(crate) struct RequestData<A> {
        pub(crate) id: String,
        pub(crate) r#type: &'static str,
        pub(crate) attributes: A,
    }

    #[derive(Debug, serde::Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct WebsocketRequest {
        pub(crate) location_id: String,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct WebsocketResponse {
        pub(crate) data: WebsocketResponseData,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct WebsocketResponseData {
        pub(crate) attributes: WebsocketResponseAttributes,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct WebsocketResponseAttributes {
        pub(crate) url: String,
    }

    #[derive(Debug, serde::Serialize)]
    pub(crate) struct MowerControl {
        pub(crate) command: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub(crate) seconds: Option<u32>,
    }
}
