use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::broker::Delivery;
use crate::error::{BridgeError, Result};

/// Header carrying a propagated deadline as epoch milliseconds
pub const DEADLINE_HEADER: &str = "x-deadline-ms";

/// Opaque token matching a reply to the call that issued it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Absolute wall-clock deadline shared along a chain of nested calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(DateTime<Utc>);

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        Self(
            Utc::now()
                .checked_add_signed(chrono::Duration::milliseconds(millis))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    pub fn from_epoch_millis(millis: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(Self)
    }

    pub fn epoch_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Time left, zero once passed
    pub fn remaining(&self) -> Duration {
        (self.0 - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        self.0 <= Utc::now()
    }

    /// The tighter of a deadline and a local timeout budget
    pub fn cap(self, timeout: Duration) -> Self {
        self.min(Self::after(timeout))
    }

    pub(crate) fn from_header(value: &str) -> Option<Self> {
        value.parse().ok().and_then(Self::from_epoch_millis)
    }
}

/// A request as seen by a handler
#[derive(Debug, Clone)]
pub struct Request {
    /// Operation queue the request arrived on
    pub queue: String,
    /// Decoded JSON body
    pub payload: Value,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    /// Deadline propagated by the caller, if it opted in
    pub deadline: Option<Deadline>,
    pub redelivered: bool,
}

impl Request {
    /// Decode a delivery. Fails if the body is not JSON.
    pub fn from_delivery(queue: &str, delivery: &Delivery) -> Result<Self> {
        let payload = serde_json::from_slice(&delivery.data)?;
        Ok(Self {
            queue: queue.to_string(),
            payload,
            correlation_id: delivery
                .properties
                .correlation_id
                .clone()
                .map(CorrelationId::from),
            reply_to: delivery.properties.reply_to.clone(),
            deadline: delivery
                .properties
                .header(DEADLINE_HEADER)
                .and_then(Deadline::from_header),
            redelivered: delivery.redelivered,
        })
    }

    /// Deserialize payload to specific type
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Field lookup on an object payload
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Why a handler produced no result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub reason: String,
}

impl HandlerFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<&BridgeError> for HandlerFailure {
    fn from(err: &BridgeError) -> Self {
        Self::new(err.to_string())
    }
}

/// Result of running a handler, before it is put on the wire
pub type HandlerOutcome = std::result::Result<Value, HandlerFailure>;

/// How handler failures are encoded in replies.
///
/// Either way the request is acknowledged exactly once; only the reply body
/// differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyFormat {
    /// Literal JSON `null`, understood by every existing caller
    #[default]
    Sentinel,
    /// `{"ok": false, "reason": "..."}`
    Tagged,
}

impl ReplyFormat {
    pub fn encode(&self, outcome: &HandlerOutcome) -> Result<Vec<u8>> {
        let body = match (outcome, self) {
            (Ok(value), _) => serde_json::to_vec(value)?,
            (Err(_), Self::Sentinel) => serde_json::to_vec(&Value::Null)?,
            (Err(failure), Self::Tagged) => serde_json::to_vec(&serde_json::json!({
                "ok": false,
                "reason": failure.reason,
            }))?,
        };
        Ok(body)
    }
}

/// A decoded reply.
///
/// A `null` body means the handler failed *or* that it legitimately returned
/// nothing; the wire format cannot tell these apart, so callers must treat
/// `null` as "dependency unavailable or not found" and check before use.
///
/// [`Reply::is_failure`] also recognises the tagged `{"ok": false, "reason"}`
/// shape without knowing which [`ReplyFormat`] the server used. A successful
/// result with exactly those two fields reads as a failure as well.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    body: Value,
}

impl Reply {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(serde_json::from_slice(bytes)?))
    }

    /// `null` sentinel or a tagged `{"ok": false, "reason": ...}` body
    pub fn is_failure(&self) -> bool {
        self.body.is_null() || self.tagged_failure().is_some()
    }

    /// Reason carried by a tagged failure
    pub fn failure_reason(&self) -> Option<&str> {
        self.tagged_failure()
    }

    fn tagged_failure(&self) -> Option<&str> {
        let object = self.body.as_object()?;
        if object.len() != 2 || object.get("ok") != Some(&Value::Bool(false)) {
            return None;
        }
        object.get("reason")?.as_str()
    }

    pub fn value(&self) -> &Value {
        &self.body
    }

    pub fn into_value(self) -> Value {
        self.body
    }

    /// Deserialize a successful reply; `None` for failures
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.is_failure() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(self.body.clone())?))
    }
}

/// Body of a published domain event: `{ event, occurredAt, ...payload }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event: String,
    #[serde(rename = "occurredAt", with = "iso_millis")]
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl DomainEvent {
    /// Build an event stamped with the current time.
    ///
    /// Object payloads are spread into the event body; any other payload is
    /// carried under `data`.
    pub fn new(routing_key: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };

        let mut event = Self {
            event: routing_key.into(),
            occurred_at: Utc::now(),
            payload,
        };
        // The envelope fields win over payload fields of the same name
        event.payload.remove("event");
        event.payload.remove("occurredAt");
        Ok(event)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// ISO-8601 timestamps with millisecond precision and a `Z` suffix
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, MessageProperties};
    use serde_json::json;

    fn delivery(data: &[u8], properties: MessageProperties) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "doctor.check_schedule".into(),
            redelivered: false,
            data: data.to_vec(),
            properties,
            acker: Acker::none(),
        }
    }

    #[test]
    fn test_request_from_delivery() {
        let deadline = Deadline::after(Duration::from_secs(3));
        let props = MessageProperties::json()
            .with_correlation_id("c-42")
            .with_reply_to("amq.gen-abc")
            .with_header(DEADLINE_HEADER, deadline.epoch_millis().to_string());

        let request = Request::from_delivery(
            "doctor.check_schedule",
            &delivery(br#"{"scheduleId":"S1"}"#, props),
        )
        .unwrap();

        assert_eq!(request.payload, json!({ "scheduleId": "S1" }));
        assert_eq!(request.queue, "doctor.check_schedule");
        assert!(!request.redelivered);
        assert_eq!(request.correlation_id, Some(CorrelationId::from("c-42")));
        assert_eq!(request.reply_to.as_deref(), Some("amq.gen-abc"));
        assert_eq!(request.field("scheduleId"), Some(&json!("S1")));
        assert_eq!(
            request.deadline.map(|d| d.epoch_millis()),
            Some(deadline.epoch_millis())
        );

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CheckSchedule {
            schedule_id: String,
        }
        let typed: CheckSchedule = request.deserialize_payload().unwrap();
        assert_eq!(typed.schedule_id, "S1");
    }

    #[test]
    fn test_request_rejects_non_json() {
        let result = Request::from_delivery(
            "doctor.check_schedule",
            &delivery(b"not json", MessageProperties::default()),
        );
        assert!(matches!(result, Err(BridgeError::Serialization(_))));
    }

    #[test]
    fn test_reply_failure_detection() {
        assert!(Reply::new(Value::Null).is_failure());
        assert_eq!(Reply::new(Value::Null).decode::<Value>().unwrap(), None);

        let tagged = Reply::new(json!({"ok": false, "reason": "doctor not found"}));
        assert!(tagged.is_failure());
        assert_eq!(tagged.failure_reason(), Some("doctor not found"));

        // A result that merely has an `ok` field is not a failure
        let result = Reply::new(json!({"ok": false, "reason": "x", "doctorId": "D1"}));
        assert!(!result.is_failure());

        let schedule = Reply::new(json!({"schedule": {"id": "S1", "isAvailable": true}}));
        assert!(!schedule.is_failure());
        assert_eq!(schedule.failure_reason(), None);
    }

    #[test]
    fn test_sentinel_success_shaped_like_tagged_failure() {
        let result: HandlerOutcome = Ok(json!({"ok": false, "reason": "slot taken"}));
        let body = ReplyFormat::Sentinel.encode(&result).unwrap();

        let reply = Reply::from_bytes(&body).unwrap();
        assert!(reply.is_failure());
        assert_eq!(reply.failure_reason(), Some("slot taken"));
    }

    #[test]
    fn test_reply_format_encoding() {
        let failure: HandlerOutcome = Err(HandlerFailure::new("doctor missing"));
        assert_eq!(ReplyFormat::Sentinel.encode(&failure).unwrap(), b"null");

        let tagged = ReplyFormat::Tagged.encode(&failure).unwrap();
        let tagged: Value = serde_json::from_slice(&tagged).unwrap();
        assert_eq!(tagged, json!({"ok": false, "reason": "doctor missing"}));

        let success: HandlerOutcome = Ok(json!({"valid": true}));
        assert_eq!(
            ReplyFormat::Tagged.encode(&success).unwrap(),
            ReplyFormat::Sentinel.encode(&success).unwrap()
        );
    }

    #[test]
    fn test_domain_event_shape() {
        let event = DomainEvent::new(
            "doctor.registered",
            json!({"doctorId": "D1", "event": "spoofed"}),
        )
        .unwrap();
        let body: Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();

        assert_eq!(body["event"], "doctor.registered");
        assert_eq!(body["doctorId"], "D1");
        let occurred_at = body["occurredAt"].as_str().unwrap();
        assert!(occurred_at.ends_with('Z'));
        assert_eq!(occurred_at.len(), "2024-01-01T00:00:00.000Z".len());

        let scalar = DomainEvent::new("rating.added", 5).unwrap();
        assert_eq!(scalar.payload.get("data"), Some(&json!(5)));
    }

    #[test]
    fn test_deadline_arithmetic() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() > Duration::from_secs(9));

        let capped = deadline.cap(Duration::from_millis(100));
        assert!(capped < deadline);
        assert!(capped.remaining() <= Duration::from_millis(100));

        let past = Deadline::from_epoch_millis(0).unwrap();
        assert!(past.is_expired());
        assert_eq!(past.remaining(), Duration::ZERO);
        assert_eq!(Deadline::from_header("garbage"), None);
    }
}
