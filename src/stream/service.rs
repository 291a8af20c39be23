use super::client::StreamClient;
use super::invoke_guarded;
use crate::auth::AccessTokenManager;
use crate::error::{Error, HandlerError};
use crate::model::{Event, SettingsEvent, StatusEvent};
use futures::FutureExt as _;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) type StatusCallback = Arc<dyn Fn(StatusEvent) -> Result<(), HandlerError> + Send + Sync>;
pub(crate) type SettingsCallback =
    Arc<dyn Fn(SettingsEvent) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectReason {
    Disconnected,
    /// Connected, but not a single event arrived within the reconnect interval.
    NoEventSinceStart,
    /// Events used to arrive but stopped for longer than the reconnect interval.
    EventsStalled,
}

/// What a keep-alive tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepAlive {
    Pinged,
    Reconnected(ReconnectReason),
}

#[derive(Default)]
struct Markers {
    started: Option<Instant>,
    last_event_received_at: Option<Instant>,
}

#[derive(Default)]
struct Handlers {
    status: Option<StatusCallback>,
    settings: Option<SettingsCallback>,
}

/// Keeps the event stream alive indefinitely and fans events out to the registered handlers.
pub(crate) struct EventStreamService {
    client: Arc<dyn StreamClient>,
    tokens: Arc<AccessTokenManager>,
    reconnect_interval: Duration,
    markers: parking_lot::Mutex<Markers>,
    handlers: parking_lot::Mutex<Handlers>,
    /// Present while the keep-alive timer is armed.
    timer: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

impl EventStreamService {
    pub(crate) fn new(
        client: Arc<dyn StreamClient>,
        tokens: Arc<AccessTokenManager>,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            client,
            tokens,
            reconnect_interval,
            markers: Default::default(),
            handlers: Default::default(),
            timer: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn on_status_event_received(&self, callback: StatusCallback) {
        self.handlers.lock().status = Some(callback);
    }

    pub(crate) fn on_settings_event_received(&self, callback: SettingsCallback) {
        self.handlers.lock().settings = Some(callback);
    }

    /// Connect and arm the keep-alive timer.
    ///
    /// A failed initial connection is only logged, the first tick tries again.
    pub(crate) async fn start(self: &Arc<Self>) {
        let stop = {
            let mut timer = self.timer.lock();
            if timer.is_some() {
                debug!("event stream service is already running");
                return;
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            *timer = Some(stop_tx);
            stop_rx
        };
        self.register_client_callbacks();
        if let Err(e) = self.connect().await {
            error!(
                error = &e as &dyn std::error::Error,
                "could not connect to the event stream, retrying on the next tick"
            );
        }
        if *stop.borrow() {
            debug!("event stream service stopped while connecting");
            self.close_if_stopped().await;
            return;
        }
        tokio::spawn(Arc::clone(self).run_timer(stop));
    }

    /// Disarm the timer and close the connection. A tick already running is allowed to finish.
    pub(crate) async fn stop(&self) {
        let Some(timer) = self.timer.lock().take() else {
            return;
        };
        timer.send_replace(true);
        if let Err(e) = self.client.close().await {
            warn!(error = &e as &dyn std::error::Error, "could not close the event stream");
        }
        info!("event stream service stopped");
    }

    fn register_client_callbacks(self: &Arc<Self>) {
        let this: Weak<Self> = Arc::downgrade(self);
        self.client.set_on_event_callback(Arc::new(move |event: Event| -> Result<(), HandlerError> {
            if let Some(this) = this.upgrade() {
                this.on_event_received(event);
            }
            Ok(())
        }));
        self.client.set_on_connected_callback(Arc::new(|| -> Result<(), HandlerError> {
            debug!("event stream reports connected");
            Ok(())
        }));
        self.client.set_on_disconnected_callback(Arc::new(|| -> Result<(), HandlerError> {
            warn!("event stream reports disconnected, reconnecting on the next tick");
            Ok(())
        }));
        self.client.set_on_error_callback(Arc::new(|e: &Error| -> Result<(), HandlerError> {
            debug!(error = e as &dyn std::error::Error, "event stream reports an error");
            Ok(())
        }));
    }

    /// Close the client unless the service was started again, in which case the client belongs to
    /// the newer run.
    async fn close_if_stopped(&self) {
        if self.timer.lock().is_some() {
            return;
        }
        if let Err(e) = self.client.close().await {
            warn!(error = &e as &dyn std::error::Error, "could not close the event stream");
        }
    }

    /// Rearm after every tick, whatever the tick did, until stopped. `stop` belongs to this run
    /// alone.
    async fn run_timer(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {},
                _ = stop.changed() => {
                    self.close_if_stopped().await;
                    return;
                }
            }
            let outcome = AssertUnwindSafe(self.keep_alive())
                .catch_unwind()
                .await
                .unwrap_or(Err(Error::KeepAlivePanic));
            match outcome {
                Ok(outcome) => debug!(?outcome, "keep-alive tick"),
                Err(e) => error!(
                    error = &e as &dyn std::error::Error,
                    "event stream keep-alive failed, retrying on the next tick"
                ),
            }
            if *stop.borrow() {
                // `stop` raced with this tick and may have closed the client before it reopened.
                self.close_if_stopped().await;
                return;
            }
        }
    }

    /// One keep-alive tick: reconnect when the stream looks dead, ping it otherwise.
    pub(crate) async fn keep_alive(&self) -> Result<KeepAlive, Error> {
        match self.reconnect_reason(Instant::now()) {
            None => {
                self.client.ping().await;
                Ok(KeepAlive::Pinged)
            }
            Some(reason) => {
                info!(?reason, "reconnecting to the event stream");
                self.connect().await?;
                Ok(KeepAlive::Reconnected(reason))
            }
        }
    }

    fn reconnect_reason(&self, now: Instant) -> Option<ReconnectReason> {
        if !self.client.is_connected() {
            return Some(ReconnectReason::Disconnected);
        }
        let markers = self.markers.lock();
        let elapsed_since = |instant: Instant| now.saturating_duration_since(instant);
        match markers.last_event_received_at {
            None if markers
                .started
                .is_none_or(|started| elapsed_since(started) > self.reconnect_interval) =>
            {
                Some(ReconnectReason::NoEventSinceStart)
            }
            Some(last) if elapsed_since(last) > self.reconnect_interval => {
                Some(ReconnectReason::EventsStalled)
            }
            _ => None,
        }
    }

    async fn connect(&self) -> Result<(), Error> {
        {
            let mut markers = self.markers.lock();
            markers.started = Some(Instant::now());
            markers.last_event_received_at = None;
        }
        let token = self.tokens.current_token().await?;
        if let Err(e) = self.client.close().await {
            warn!(error = &e as &dyn std::error::Error, "could not close the event stream");
        }
        if let Err(e) = self.client.open(&token).await {
            if e.is_not_authorized() {
                self.tokens.flag_as_invalid().await;
            }
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn on_event_received(&self, event: Event) {
        self.markers.lock().last_event_received_at = Some(Instant::now());
        match event {
            Event::Status(event) => {
                let callback = self.handlers.lock().status.clone();
                if let Some(callback) = callback {
                    invoke_guarded("status", || callback(event));
                }
            }
            Event::Settings(event) => {
                let callback = self.handlers.lock().settings.clone();
                if let Some(callback) = callback {
                    invoke_guarded("settings", || callback(event));
                }
            }
            // Not consumed by anything yet.
            Event::Positions(_) => {}
            Event::Unknown { id, kind } => {
                warn!(?id, %kind, "received an event of an unknown type");
            }
        }
    }
}
