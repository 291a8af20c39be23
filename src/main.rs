use accessory::MowerAccessory;
use auth::{AccessTokenManager, Credentials, HusqvarnaAuthenticator};
use clap::Parser as _;
use error::{Error, HandlerError};
use homie5::device_description::DeviceDescriptionBuilder;
use homie5::device_description::HomieDeviceDescription;
use homie5::{Homie5DeviceProtocol, HomieDeviceStatus, HomieID};
use model::{SettingsEvent, StatusEvent};
use mqtt::MqttClientExt as _;
use rumqttc::v5::MqttOptions;
use rumqttc::v5::mqttbytes::v5::LastWill;
use std::collections::BTreeMap;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use stream::{EventStreamService, StreamEndpoint, WebSocketClient};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use vendor::gardena::GardenaService;
use vendor::husqvarna::{HusqvarnaEndpoint, HusqvarnaService};
use vendor::{ApiClient, MowerControl, MowerDiscovery};

mod accessory;
mod auth;
mod error;
mod model;
mod mqtt;
mod policy;
mod schemas;
mod stream;
mod vendor;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::new(3, 0);
const API_REQUEST_TIMEOUT: Duration = Duration::new(10, 0);
const API_MAX_RETRIES: u32 = 3;
const SCHEDULE_CHECK_INTERVAL: Duration = Duration::new(60, 0);

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Backend {
    /// Husqvarna Automower Connect.
    Husqvarna,
    /// Gardena Smart System.
    Gardena,
}

/// Bridge robotic lawn mowers from the vendor cloud to Homie devices on an MQTT broker.
#[derive(clap::Parser)]
struct Args {
    /// How to connect to the MQTT broker.
    ///
    /// The value is expected to be provided as an URL, such as:
    /// `mqtt://location:1883?client_id=hostname` for plain text connection or
    /// `mqtts://location:1883?client_id=hostname` for TLS protected connection.
    #[clap(short = 'm', long)]
    mqtt_broker: String,

    /// To be provided together with `--mqtt-password` to use password based authentication
    /// with the broker.
    #[clap(short = 'u', long, requires = "mqtt_password")]
    mqtt_user: Option<String>,

    /// To be provided together with `--mqtt-user` to use password based authentication with
    /// the broker.
    #[clap(short = 'p', long, requires = "mqtt_user")]
    mqtt_password: Option<String>,

    #[clap(long, default_value = "automower-bridge")]
    device_name: HomieID,

    #[clap(long, default_value = "info", env = "AUTOMOWER_BRIDGE_LOG")]
    log_filter: tracing_subscriber::filter::targets::Targets,

    /// Which cloud the mowers are registered with.
    #[clap(long, value_enum, default_value = "husqvarna", env = "AUTOMOWER_BACKEND")]
    backend: Backend,

    /// Application key credential from your application in Husqvarna Developer API portal.
    #[clap(short = 'k', long, env = "AUTOMOWER_APP_KEY")]
    app_key: String,

    /// Application secret credential from your application in Husqvarna Developer API portal.
    #[clap(short = 's', long, env = "AUTOMOWER_APP_SECRET", required_unless_present = "username")]
    app_secret: Option<String>,

    /// Log in with an account instead of the application secret.
    #[clap(long, env = "AUTOMOWER_USERNAME", requires = "password")]
    username: Option<String>,

    #[clap(long, env = "AUTOMOWER_PASSWORD", requires = "username")]
    password: Option<String>,

    /// Gardena location to bridge. The first location of the account when not specified.
    #[clap(long, env = "GARDENA_LOCATION_ID")]
    location_id: Option<String>,

    /// Seconds between event stream health checks. A stream silent for longer is reopened.
    #[clap(long, default_value = "3600")]
    reconnect_interval: u64,

    /// Minutes to mow for when mowing is switched on.
    #[clap(long, default_value = "180")]
    mowing_duration: u32,
}

fn main() {
    let args = Args::parse();
    std::process::exit(match setup_and_run(args) {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn setup_and_run(args: Args) -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(args.log_filter.clone())
        .init();
    tracing::debug!(filter = ?args.log_filter, message = "logging initiated");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::BuildRuntime)?;
    let client = reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .referer(false)
        .connect_timeout(CONNECT_TIMEOUT)
        .connection_verbose(true)
        .timeout(API_REQUEST_TIMEOUT)
        .https_only(true)
        .build()
        .map_err(Error::BuildHttpClient)?;
    let retry_policy = reqwest_retry::policies::ExponentialBackoff::builder()
        .build_with_max_retries(API_MAX_RETRIES);
    let api_client = reqwest_middleware::ClientBuilder::new(client.clone())
        .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(
            retry_policy,
        ))
        .build();

    let credentials = match (args.username, args.password, args.app_secret) {
        (Some(username), Some(password), _) => Credentials::Password { username, password },
        (_, _, Some(app_secret)) => Credentials::ClientCredentials { app_secret },
        _ => return Err(Error::MissingCredentials),
    };
    let authenticator = HusqvarnaAuthenticator::new(client, args.app_key.clone(), credentials);
    let tokens = Arc::new(AccessTokenManager::new(Arc::new(authenticator)));
    let api = ApiClient::new(api_client, args.app_key.clone(), Arc::clone(&tokens));
    let discovery: Arc<dyn MowerDiscovery>;
    let control: Arc<dyn MowerControl>;
    let endpoint: Arc<dyn StreamEndpoint>;
    match args.backend {
        Backend::Husqvarna => {
            let service = Arc::new(HusqvarnaService::new(api, args.mowing_duration));
            discovery = service.clone();
            control = service;
            endpoint = Arc::new(HusqvarnaEndpoint::new(args.app_key));
        }
        Backend::Gardena => {
            let service = Arc::new(GardenaService::new(
                api,
                args.location_id,
                args.mowing_duration,
            ));
            discovery = service.clone();
            control = service.clone();
            endpoint = service;
        }
    }
    let events = Arc::new(EventStreamService::new(
        Arc::new(WebSocketClient::new(endpoint)),
        Arc::clone(&tokens),
        Duration::from_secs(args.reconnect_interval),
    ));

    let (protocol, lw) = Homie5DeviceProtocol::new(args.device_name, homie5::HomieDomain::Default);
    let mut mqtt_options =
        MqttOptions::parse_url(&args.mqtt_broker).map_err(Error::ParseMqttBroker)?;
    if let (Some(u), Some(p)) = (args.mqtt_user.as_ref(), args.mqtt_password.as_ref()) {
        mqtt_options.set_credentials(u, p);
    }
    let lw = LastWill::new(lw.topic, lw.message, mqtt::convert_qos(lw.qos), lw.retain, None);
    mqtt_options.set_last_will(lw);
    let (mqtt, mqtt_loop) = rumqttc::v5::AsyncClient::new(mqtt_options, 100);
    let context = Arc::new(Context {
        state: Mutex::new(State::default()),
        protocol,
        mqtt,
        discovery,
        control,
        events,
        tokens,
    });
    runtime.block_on(context.run(mqtt_loop))
}

/// Something the event stream reported about a mower.
#[derive(Debug)]
enum Update {
    Status(StatusEvent),
    Settings(SettingsEvent),
}

impl Update {
    fn mower_id(&self) -> &str {
        match self {
            Update::Status(e) => &e.mower_id,
            Update::Settings(e) => &e.mower_id,
        }
    }
}

#[derive(Default)]
struct State {
    root_description: Option<HomieDeviceDescription>,
    /// Keyed by the child device id.
    mowers: BTreeMap<String, Arc<MowerAccessory>>,
}

struct Context {
    state: Mutex<State>,
    protocol: Homie5DeviceProtocol,
    mqtt: rumqttc::v5::AsyncClient,
    discovery: Arc<dyn MowerDiscovery>,
    control: Arc<dyn MowerControl>,
    events: Arc<EventStreamService>,
    tokens: Arc<AccessTokenManager>,
}

impl Context {
    async fn discover_mowers(&self) -> Result<(), Error> {
        let mowers = self.discovery.get_mowers().await?;
        info!(count = mowers.len(), "discovered mowers");
        let mut root_description = DeviceDescriptionBuilder::new().name("Robotic lawn mowers");
        let mut state = self.state.lock().await;
        for mower in mowers {
            let id = mower.id.clone();
            let Some(accessory) = MowerAccessory::new(
                mower,
                self.mqtt.clone(),
                &self.protocol,
                Arc::clone(&self.control),
            ) else {
                warn!(id = %id, "mower id cannot be used as a device id, skipping it");
                continue;
            };
            let device_id = accessory.device_id().clone();
            root_description = root_description.add_child(device_id.clone());
            state
                .mowers
                .insert(device_id.to_string(), Arc::new(accessory));
        }
        state.root_description = Some(root_description.build());
        Ok(())
    }

    async fn publish_root_device(&self) -> Result<(), Error> {
        let Some(root_description) = self.state.lock().await.root_description.clone() else {
            return Ok(());
        };
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
                        .publish_description(&root_description)
                        .map_err(Error::GenerateDescription)?;
                    self.mqtt
                        .homie_publish(p)
                        .await
                        .map_err(Error::PublishDescription)?;
                }
                homie5::DevicePublishStep::PropertyValues => {}
                homie5::DevicePublishStep::SubscribeProperties => {}
                homie5::DevicePublishStep::DeviceStateReady => {
                    let p = self.protocol.publish_state(HomieDeviceStatus::Ready);
                    self.mqtt
                        .homie_publish(p)
                        .await
                        .map_err(Error::PublishReadyState)?;
                }
            }
        }
        Ok(())
    }

    async fn publish_devices(&self) -> Result<(), Error> {
        self.publish_root_device().await?;
        let mowers = self
            .state
            .lock()
            .await
            .mowers
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for mower in mowers {
            mower.publish_device().await?;
        }
        Ok(())
    }

    /// Re-read the mowers from the backend and republish every device with what was found.
    async fn refresh_mowers(&self) -> Result<(), Error> {
        let mowers = match self.discovery.get_mowers().await {
            Ok(mowers) => mowers,
            Err(e) => {
                warn!(
                    error = &e as &dyn std::error::Error,
                    "could not refresh the mowers, republishing what is known"
                );
                return self.publish_devices().await;
            }
        };
        self.publish_root_device().await?;
        let mut stale = self.state.lock().await.mowers.clone();
        for mower in mowers {
            let key = MowerAccessory::id_to_key(&mower.id, &self.protocol);
            match stale.remove(&key) {
                Some(accessory) => accessory.refresh(mower).await?,
                None => debug!(id = %mower.id, "ignoring a mower that appeared after startup"),
            }
        }
        for mower in stale.values() {
            mower.publish_device().await?;
        }
        Ok(())
    }

    async fn accessory(&self, device_id: &str) -> Option<Arc<MowerAccessory>> {
        self.state.lock().await.mowers.get(device_id).cloned()
    }

    /// Discover the mowers, publish them and keep them up to date from the event stream.
    async fn serve(self: Arc<Self>) -> Result<(), Error> {
        self.discover_mowers().await?;
        self.publish_devices().await?;
        let (updates, mut incoming) = mpsc::unbounded_channel();
        let status_updates = updates.clone();
        self.events.on_status_event_received(Arc::new(
            move |event: StatusEvent| -> Result<(), HandlerError> {
                Ok(status_updates.send(Update::Status(event))?)
            },
        ));
        self.events.on_settings_event_received(Arc::new(
            move |event: SettingsEvent| -> Result<(), HandlerError> {
                Ok(updates.send(Update::Settings(event))?)
            },
        ));
        self.events.start().await;
        let mut schedule_check = tokio::time::interval(SCHEDULE_CHECK_INTERVAL);
        schedule_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                update = incoming.recv() => match update {
                    Some(update) => self.on_update(update).await,
                    None => return Ok(()),
                },
                _ = schedule_check.tick() => self.reevaluate_schedules().await,
            }
        }
    }

    async fn on_update(&self, update: Update) {
        let key = MowerAccessory::id_to_key(update.mower_id(), &self.protocol);
        let Some(mower) = self.accessory(&key).await else {
            debug!(id = update.mower_id(), "received an event for an unknown mower");
            return;
        };
        let result = match update {
            Update::Status(event) => mower.on_status_event(event).await,
            Update::Settings(event) => mower.on_settings_event(event).await,
        };
        if let Err(e) = result {
            error!(
                error = &e as &dyn std::error::Error,
                "could not publish the mower state"
            );
        }
    }

    async fn reevaluate_schedules(&self) {
        let mowers = self
            .state
            .lock()
            .await
            .mowers
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for mower in mowers {
            if let Err(e) = mower.reevaluate_schedule().await {
                error!(
                    error = &e as &dyn std::error::Error,
                    id = %mower.device_id(),
                    "could not publish the schedule state"
                );
            }
        }
    }

    async fn on_property_set(self: Arc<Self>, set: mqtt::PropertySet) {
        let Some(mower) = self.accessory(&set.device.to_string()).await else {
            debug!(device = %set.device, "property set for an unknown device");
            return;
        };
        if let Err(e) = mower
            .on_property_set(&set.node, &set.property, &set.value)
            .await
        {
            error!(
                error = &e as &dyn std::error::Error,
                device = %set.device,
                node = %set.node,
                property = %set.property,
                "could not carry out the property set request"
            );
        }
    }

    async fn shutdown(&self) {
        info!("shutting down");
        self.events.stop().await;
        if let Err(e) = self.tokens.logout().await {
            warn!(error = &e as &dyn std::error::Error, "could not log out");
        }
    }

    async fn run(self: Arc<Self>, mut mqtt_loop: rumqttc::v5::EventLoop) -> Result<(), Error> {
        let mut handle: Option<tokio::task::JoinHandle<Result<(), Error>>> = None;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            use rumqttc::Outgoing;
            use rumqttc::v5::Event;
            use rumqttc::v5::mqttbytes::v5::Packet;

            let result = tokio::select! {
                r = mqtt_loop.poll() => r,
                join_result = async {
                    match handle.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.shutdown().await;
                    return match join_result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(error)) => Err(error),
                        Err(join_error) => Err(Error::StartupJoin(join_error)),
                    };
                }
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        warn!(error = &e as &dyn std::error::Error, "could not listen for ctrl-c");
                    }
                    self.shutdown().await;
                    return Ok(());
                }
            };
            match result.map_err(Error::MqttConnection)? {
                Event::Incoming(Packet::ConnAck(_)) => {
                    tracing::debug!("connected to mqtt");
                    let this = Arc::clone(&self);
                    if handle.is_none() {
                        handle = Some(tokio::spawn(this.serve()));
                    } else {
                        tokio::spawn(async move {
                            if let Err(e) = this.refresh_mowers().await {
                                error!(
                                    error = &e as &dyn std::error::Error,
                                    "could not republish the devices"
                                );
                            }
                        });
                    }
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    if let Some(set) = mqtt::parse_property_set(&publish.topic, &publish.payload)
                    {
                        tokio::spawn(Arc::clone(&self).on_property_set(set));
                    }
                }
                Event::Outgoing(Outgoing::Disconnect) => {
                    return Err(Error::MqttDisconnect);
                }
                event @ Event::Incoming(_) | event @ Event::Outgoing(_) => {
                    tracing::trace!(?event, "not handled in any way");
                }
            }
        }
    }
}
