use homie5::HomieID;
use tokio_tungstenite::tungstenite;

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("could not parse the `--mqtt-broker` argument")]
    ParseMqttBroker(#[source] rumqttc::v5::OptionError),
    #[error("mqtt connection error")]
    MqttConnection(#[source] rumqttc::v5::ConnectionError),
    #[error("could not publish init value to the state topic")]
    PublishInitState(#[source] rumqttc::v5::ClientError),
    #[error("could not construct device description message")]
    GenerateDescription(#[source] homie5::Homie5ProtocolError),
    #[error("could not publish the device description")]
    PublishDescription(#[source] rumqttc::v5::ClientError),
    #[error("could not publish ready value to the state topic")]
    PublishReadyState(#[source] rumqttc::v5::ClientError),
    #[error("could not publish `{1:?}` to the state topic")]
    PublishDeviceState(
        #[source] rumqttc::v5::ClientError,
        homie5::HomieDeviceStatus,
    ),
    #[error("could not construct the mqtt subscription message")]
    GenerateSubscriptions(#[source] homie5::Homie5ProtocolError),
    #[error("could not subscribe to the homie properties")]
    Subscribe(#[source] rumqttc::v5::ClientError),
    #[error("could not publish value to `{1}/{2}`")]
    PublishValue(
        #[source] rumqttc::v5::ClientError,
        &'static HomieID,
        &'static HomieID,
    ),
    #[error("disconnected from the MQTT server")]
    MqttDisconnect,
    #[error("could not build the async runtime")]
    BuildRuntime(#[source] std::io::Error),
    #[error("could not build the HTTP client")]
    BuildHttpClient(#[source] reqwest::Error),
    #[error("either `--app-secret` or `--username` and `--password` are required")]
    MissingCredentials,

    #[error("could not request an access token")]
    Login(#[source] reqwest::Error),
    #[error("could not read the access token response")]
    ReadToken(#[source] reqwest::Error),
    #[error("access token lifetime of {0:?} is not representable")]
    TokenLifetime(std::time::Duration),
    #[error("could not release the access token")]
    Logout(#[source] reqwest::Error),
    #[error("the backend rejected the credentials for `{0}`")]
    NotAuthorized(&'static str),

    #[error("could not make a request to the `{1}` API endpoint")]
    Api(#[source] reqwest_middleware::Error, &'static str),
    #[error("could not read the API response for `{1}`")]
    ReadResponse(#[source] reqwest::Error, &'static str),
    #[error("the `{1}` API endpoint responded with {0}")]
    ApiStatus(reqwest::StatusCode, &'static str),
    #[error("could not encode the request body for `{1}`")]
    EncodeRequest(#[source] serde_json::Error, &'static str),
    #[error("no location is available to stream events for")]
    NoLocation,

    #[error("could not construct the websocket request")]
    WebsocketRequest(#[source] tungstenite::Error),
    #[error("could not use `{1}` as a header value")]
    InvalidHeader(
        #[source] tungstenite::http::header::InvalidHeaderValue,
        &'static str,
    ),
    #[error("could not connect to the event stream")]
    WebsocketConnect(#[source] tungstenite::Error),
    #[error("an error in websocket")]
    Websocket(#[source] tungstenite::Error),
    #[error("the event stream keep-alive task panicked")]
    KeepAlivePanic,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("the mower task ended unexpectedly")]
    StartupJoin(#[source] tokio::task::JoinError),
}

impl Error {
    /// Whether the backend refused the access token, in which case the cached token should be
    /// flagged as invalid before the next attempt.
    pub(crate) fn is_not_authorized(&self) -> bool {
        match self {
            Error::NotAuthorized(_) => true,
            Error::WebsocketConnect(tungstenite::Error::Http(response)) => {
                response.status() == tungstenite::http::StatusCode::UNAUTHORIZED
            }
            _ => false,
        }
    }
}

/// Failure reported by an event or property handler. Handlers run inside background tasks, so
/// these are logged and never propagated.
pub(crate) type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_authorized_is_detected() {
        assert!(Error::NotAuthorized("GET /mowers").is_not_authorized());
        assert!(!Error::NoLocation.is_not_authorized());
        let status = Error::ApiStatus(reqwest::StatusCode::BAD_GATEWAY, "GET /mowers");
        assert!(!status.is_not_authorized());
    }
}
