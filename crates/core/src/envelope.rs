//! Change envelopes and the topic naming convention.

use serde::{Deserialize, Serialize};

use crate::{KdashResult, ResourceKind};

/// Topic carrying cluster registration announcements.
pub const CLUSTER_REGISTERED: &str = "cluster_registered";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "added" => Some(EventType::Added),
            "updated" => Some(EventType::Updated),
            "deleted" => Some(EventType::Deleted),
            _ => None,
        }
    }
}

/// `<kind>_<event>`, e.g. `pod_added`.
pub fn topic(kind: ResourceKind, event: EventType) -> String {
    format!("{}_{}", kind.topic_prefix(), event.as_str())
}

/// Inverse of [`topic`]. Returns `None` for non-resource topics such as `cluster_registered`.
pub fn parse_topic(topic: &str) -> Option<(ResourceKind, EventType)> {
    let (prefix, suffix) = topic.rsplit_once('_')?;
    Some((ResourceKind::from_topic_prefix(prefix)?, EventType::from_suffix(suffix)?))
}

/// Immutable change notification: what happened, where, and the full resource at that moment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    event_type: EventType,
    #[serde(rename = "clusterID")]
    cluster_id: String,
    resource: T,
}

impl<T> Envelope<T> {
    pub fn new(event_type: EventType, cluster_id: impl Into<String>, resource: T) -> Self {
        Self { event_type, cluster_id: cluster_id.into(), resource }
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn resource(&self) -> &T {
        &self.resource
    }

    pub fn into_resource(self) -> T {
        self.resource
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> KdashResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: serde::de::DeserializeOwned> Envelope<T> {
    pub fn from_json(payload: &str) -> KdashResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Payload of [`CLUSTER_REGISTERED`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterAnnouncement {
    #[serde(rename = "clusterName")]
    pub cluster_name: String,
    #[serde(rename = "apiURL")]
    pub api_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_kind_event_convention() {
        assert_eq!(topic(ResourceKind::Pod, EventType::Added), "pod_added");
        assert_eq!(topic(ResourceKind::ConfigMap, EventType::Deleted), "configmap_deleted");
        assert_eq!(parse_topic("namespace_updated"), Some((ResourceKind::Namespace, EventType::Updated)));
        assert_eq!(parse_topic(CLUSTER_REGISTERED), None);
        assert_eq!(parse_topic("deployment_added"), None);
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(EventType::Updated, "c1", serde_json::json!({"metadata": {"name": "web-1"}}));
        let v: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(v["eventType"], "updated");
        assert_eq!(v["clusterID"], "c1");
        assert_eq!(v["resource"]["metadata"]["name"], "web-1");

        let back: Envelope<serde_json::Value> = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn announcement_wire_shape() {
        let a = ClusterAnnouncement { cluster_name: "c1".into(), api_url: "https://10.0.0.1:6443".into() };
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["clusterName"], "c1");
        assert_eq!(v["apiURL"], "https://10.0.0.1:6443");
    }
}
