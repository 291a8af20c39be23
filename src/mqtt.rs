use homie5::HomieID;
use homie5::client::Publish as HomiePublish;
use homie5::client::Subscription;

pub(crate) trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: HomiePublish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: HomiePublish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload)
            .await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        let subs = subs
            .map(|sub| rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos)))
            .collect::<Vec<_>>();
        if subs.is_empty() {
            return Ok(());
        }
        self.subscribe_many(subs).await
    }
}

pub(crate) fn convert_qos(homie: homie5::client::QoS) -> rumqttc::v5::mqttbytes::QoS {
    use homie5::client::QoS::*;
    match homie {
        AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

/// Somebody asked for a property to take a new value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PropertySet {
    pub(crate) device: HomieID,
    pub(crate) node: HomieID,
    pub(crate) property: HomieID,
    pub(crate) value: String,
}

/// Pick the property `set` requests out of the incoming publishes; everything else is ignored.
pub(crate) fn parse_property_set(topic: &[u8], payload: &[u8]) -> Option<PropertySet> {
    let Ok(topic) = std::str::from_utf8(topic) else {
        tracing::debug!("ignoring a publish with a non utf-8 topic");
        return None;
    };
    match homie5::parse_mqtt_message(topic, payload) {
        Ok(homie5::Homie5Message::PropertySet {
            property,
            set_value,
        }) => Some(PropertySet {
            device: property.device_id().clone(),
            node: property.node_id().clone(),
            property: property.prop_id().clone(),
            value: set_value,
        }),
        Ok(_) => {
            tracing::trace!(topic, "not a property set request");
            None
        }
        Err(e) => {
            tracing::debug!(
                topic,
                error = &e as &dyn std::error::Error,
                "could not parse an incoming publish"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_requests_are_recognized() {
        let set = parse_property_set(b"homie/5/automower-bridge-c0ffee/mowing/on/set", b"true");
        assert_eq!(
            set,
            Some(PropertySet {
                device: HomieID::try_from("automower-bridge-c0ffee".to_owned()).unwrap(),
                node: HomieID::try_from("mowing".to_owned()).unwrap(),
                property: HomieID::try_from("on".to_owned()).unwrap(),
                value: "true".into(),
            })
        );
    }

    #[test]
    fn other_publishes_are_ignored() {
        assert_eq!(parse_property_set(b"homie/5/automower-bridge/$state", b"ready"), None);
        assert_eq!(parse_property_set(b"unrelated/topic", b"true"), None);
        assert_eq!(parse_property_set(b"\xff\xfe", b"true"), None);
    }
}
