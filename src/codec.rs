use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Topic prefix carrying moderator-action streams.
const MOD_ACTION_PREFIX: &str = "chat_moderator_actions";

/// A fully-qualified pubsub topic: `chat_moderator_actions.<mod_id>.<channel_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Build the moderator-action topic for a channel.
    pub fn new(moderator_id: &str, channel_id: &str) -> Self {
        Topic(format!("{MOD_ACTION_PREFIX}.{moderator_id}.{channel_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The channel id segment, empty if the topic is not fully qualified.
    pub fn channel_id(&self) -> &str {
        channel_segment(&self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn channel_segment(topic: &str) -> &str {
    topic.splitn(3, '.').nth(2).unwrap_or("")
}

/// Failure to interpret an inbound frame. Never fatal: callers log these at
/// debug level and keep the connection alive.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The outer frame was not valid JSON or lacked the expected shape.
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    /// The nested moderation payload inside `data.message` failed to parse.
    #[error("malformed moderation payload: {0}")]
    Payload(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(tag = "type")]
enum Request<'a> {
    #[serde(rename = "LISTEN")]
    Listen { nonce: &'a str, data: ListenData<'a> },
    #[serde(rename = "PING")]
    Ping,
}

#[derive(Serialize)]
struct ListenData<'a> {
    topics: &'a [Topic],
    auth_token: &'a str,
}

/// Serialize a `LISTEN` request carrying the full topic set for a shard.
pub(crate) fn listen_request(
    nonce: &str,
    topics: &[Topic],
    auth_token: &str,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Request::Listen {
        nonce,
        data: ListenData { topics, auth_token },
    })
}

/// Serialize a heartbeat `PING`.
pub(crate) fn ping_request() -> Result<String, serde_json::Error> {
    serde_json::to_string(&Request::Ping)
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// Acknowledgment of a `LISTEN` request. An empty `error` means accepted.
#[derive(Debug, Clone)]
pub(crate) struct ListenAck {
    pub nonce: Option<String>,
    pub error: String,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Cheap single-purpose parse used on the connection side to capture `LISTEN`
/// acknowledgments for pending add-topic tickets. Anything that is not a
/// well-formed `RESPONSE` yields `None`.
pub(crate) fn parse_response(raw: &str) -> Option<ListenAck> {
    let env: ResponseEnvelope = serde_json::from_str(raw).ok()?;
    (env.kind == "RESPONSE").then(|| ListenAck {
        nonce: env.nonce,
        error: env.error.unwrap_or_default(),
    })
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum DecodedMessage {
    /// Acknowledgment of a subscribe request; `error` is empty on success.
    Response { nonce: Option<String>, error: String },
    /// Heartbeat acknowledgment.
    Pong,
    /// A recognized moderation action.
    Moderation(ModerationEvent),
    /// Any other frame, forwarded so nothing is silently dropped.
    Other(serde_json::Value),
}

#[derive(Deserialize)]
struct TopicPayload {
    topic: String,
    message: String,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    data: ActionRecord,
}

#[derive(Deserialize)]
struct ActionRecord {
    moderation_action: String,
    #[serde(default)]
    created_by: String,
    #[serde(default)]
    created_by_user_id: String,
    #[serde(default)]
    target_user_id: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
}

/// Decode a raw text frame into a typed message.
///
/// `RESPONSE` and `PONG` frames are structural; frames whose `data.topic`
/// carries the moderator-action prefix have their nested `data.message`
/// envelope parsed again into a [`ModerationEvent`]. Everything else comes
/// back as [`DecodedMessage::Other`].
pub fn decode(raw: &str) -> Result<DecodedMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(DecodeError::Envelope)?;

    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("RESPONSE") => Ok(DecodedMessage::Response {
            nonce: value
                .get("nonce")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned),
            error: value
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }),
        Some("PONG") => Ok(DecodedMessage::Pong),
        _ => decode_data(value),
    }
}

fn decode_data(value: serde_json::Value) -> Result<DecodedMessage, DecodeError> {
    let payload = value
        .get("data")
        .and_then(|data| TopicPayload::deserialize(data).ok())
        .filter(|p| p.topic.starts_with(MOD_ACTION_PREFIX));
    let Some(payload) = payload else {
        return Ok(DecodedMessage::Other(value));
    };

    let inner: ActionEnvelope =
        serde_json::from_str(&payload.message).map_err(DecodeError::Payload)?;
    let record = inner.data;

    match ModAction::from_raw(&record.moderation_action) {
        Some(action) => Ok(DecodedMessage::Moderation(build_event(
            &payload.topic,
            action,
            record,
        ))),
        // Unknown action vocabulary: decoded, but forwarded verbatim.
        None => Ok(DecodedMessage::Other(value)),
    }
}

fn build_event(topic: &str, action: ModAction, record: ActionRecord) -> ModerationEvent {
    let args = record.args.unwrap_or_default();
    let arg = |i: usize| args.get(i).filter(|s| !s.is_empty()).cloned();
    let seconds = |i: usize| {
        args.get(i)
            .and_then(|s| s.parse::<u64>().ok())
            .map(ActionDuration::Seconds)
            .unwrap_or(ActionDuration::None)
    };

    let target = action.is_target_directed().then(|| UserRef {
        id: record.target_user_id.unwrap_or_default(),
        name: arg(0).unwrap_or_default(),
    });

    let (reason, duration) = match action.family() {
        ActionFamily::Ban => (arg(1), ActionDuration::Permanent),
        ActionFamily::Timeout => (arg(2), seconds(1)),
        ActionFamily::RoomToggle => (None, seconds(0)),
        ActionFamily::ModToggle => (None, ActionDuration::None),
    };

    ModerationEvent {
        channel_id: channel_segment(topic).to_owned(),
        action,
        raw_action: record.moderation_action,
        moderator: UserRef {
            id: record.created_by_user_id,
            name: record.created_by,
        },
        target,
        reason,
        duration,
        created_at: now_ms(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

/// A moderator or the user a moderation action is directed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRef {
    pub id: String,
    pub name: String,
}

/// How long a moderation action lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionDuration {
    Permanent,
    Seconds(u64),
    None,
}

impl Serialize for ActionDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ActionDuration::Permanent => serializer.serialize_str("permanent"),
            ActionDuration::Seconds(s) => serializer.serialize_u64(*s),
            ActionDuration::None => serializer.serialize_none(),
        }
    }
}

/// A single moderator action on a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModerationEvent {
    pub channel_id: String,
    pub action: ModAction,
    /// The action name exactly as the upstream sent it (e.g. `r9kbeta`).
    pub raw_action: String,
    pub moderator: UserRef,
    /// Present only for target-directed actions (bans, timeouts, mod grants).
    pub target: Option<UserRef>,
    pub reason: Option<String>,
    pub duration: ActionDuration,
    /// Unix milliseconds, stamped at decode time; the upstream does not
    /// supply a timestamp at this layer.
    pub created_at: u64,
}

/// The recognized moderation action vocabulary.
///
/// The `r9kbeta`/`r9kbetaoff` upstream names are exposed with the `beta`
/// marker stripped, matching the event names consumers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModAction {
    Ban,
    Unban,
    Timeout,
    Subscribers,
    SubscribersOff,
    R9k,
    R9kOff,
    Clear,
    EmoteOnly,
    EmoteOnlyOff,
    Followers,
    FollowersOff,
    Slow,
    SlowOff,
    Mod,
    Unmod,
}

enum ActionFamily {
    Ban,
    Timeout,
    RoomToggle,
    ModToggle,
}

impl ModAction {
    /// Case-insensitive parse of an upstream action name.
    fn from_raw(raw: &str) -> Option<Self> {
        Some(match raw.to_ascii_lowercase().as_str() {
            "ban" => ModAction::Ban,
            "unban" => ModAction::Unban,
            "timeout" => ModAction::Timeout,
            "subscribers" => ModAction::Subscribers,
            "subscribersoff" => ModAction::SubscribersOff,
            "r9kbeta" => ModAction::R9k,
            "r9kbetaoff" => ModAction::R9kOff,
            "clear" => ModAction::Clear,
            "emoteonly" => ModAction::EmoteOnly,
            "emoteonlyoff" => ModAction::EmoteOnlyOff,
            "followers" => ModAction::Followers,
            "followersoff" => ModAction::FollowersOff,
            "slow" => ModAction::Slow,
            "slowoff" => ModAction::SlowOff,
            "mod" => ModAction::Mod,
            "unmod" => ModAction::Unmod,
            _ => return None,
        })
    }

    /// The consumer-facing event name.
    pub fn name(&self) -> &'static str {
        match self {
            ModAction::Ban => "ban",
            ModAction::Unban => "unban",
            ModAction::Timeout => "timeout",
            ModAction::Subscribers => "subscribers",
            ModAction::SubscribersOff => "subscribersoff",
            ModAction::R9k => "r9k",
            ModAction::R9kOff => "r9koff",
            ModAction::Clear => "clear",
            ModAction::EmoteOnly => "emoteonly",
            ModAction::EmoteOnlyOff => "emoteonlyoff",
            ModAction::Followers => "followers",
            ModAction::FollowersOff => "followersoff",
            ModAction::Slow => "slow",
            ModAction::SlowOff => "slowoff",
            ModAction::Mod => "mod",
            ModAction::Unmod => "unmod",
        }
    }

    fn is_target_directed(&self) -> bool {
        matches!(
            self.family(),
            ActionFamily::Ban | ActionFamily::Timeout | ActionFamily::ModToggle
        )
    }

    fn family(&self) -> ActionFamily {
        match self {
            ModAction::Ban | ModAction::Unban => ActionFamily::Ban,
            ModAction::Timeout => ActionFamily::Timeout,
            ModAction::Mod | ModAction::Unmod => ActionFamily::ModToggle,
            _ => ActionFamily::RoomToggle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action_frame(topic: &str, action: &str, target: Option<&str>, args: &[&str]) -> String {
        let inner = json!({
            "type": "moderation_action",
            "data": {
                "moderation_action": action,
                "created_by": "streamer",
                "created_by_user_id": "1000",
                "target_user_id": target,
                "args": args,
            }
        });
        json!({
            "type": "MESSAGE",
            "data": { "topic": topic, "message": inner.to_string() }
        })
        .to_string()
    }

    #[test]
    fn test_topic_normalization() {
        let topic = Topic::new("1000", "4242");
        assert_eq!(topic.as_str(), "chat_moderator_actions.1000.4242");
        assert_eq!(topic.channel_id(), "4242");
    }

    #[test]
    fn test_listen_request_shape() {
        let topics = vec![Topic::new("1", "2")];
        let raw = listen_request("abcDEFghi", &topics, "secret").unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["type"], "LISTEN");
        assert_eq!(value["nonce"], "abcDEFghi");
        assert_eq!(value["data"]["auth_token"], "secret");
        assert_eq!(value["data"]["topics"][0], "chat_moderator_actions.1.2");
    }

    #[test]
    fn test_ping_request_shape() {
        assert_eq!(ping_request().unwrap(), r#"{"type":"PING"}"#);
    }

    #[test]
    fn test_parse_response() {
        let ack = parse_response(r#"{"type":"RESPONSE","nonce":"n1","error":""}"#).unwrap();
        assert_eq!(ack.nonce.as_deref(), Some("n1"));
        assert!(ack.error.is_empty());

        assert!(parse_response(r#"{"type":"PONG"}"#).is_none());
        assert!(parse_response("not json").is_none());
    }

    #[test]
    fn test_decode_pong() {
        assert!(matches!(
            decode(r#"{"type":"PONG"}"#).unwrap(),
            DecodedMessage::Pong
        ));
    }

    #[test]
    fn test_decode_response_error() {
        let decoded = decode(r#"{"type":"RESPONSE","error":"ERR_BADAUTH"}"#).unwrap();
        match decoded {
            DecodedMessage::Response { error, .. } => assert_eq!(error, "ERR_BADAUTH"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decode_ban() {
        let raw = action_frame(
            "chat_moderator_actions.1000.4242",
            "ban",
            Some("2001"),
            &["baduser", "spam"],
        );
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };

        assert_eq!(event.action, ModAction::Ban);
        assert_eq!(event.channel_id, "4242");
        assert_eq!(event.moderator.id, "1000");
        assert_eq!(event.moderator.name, "streamer");
        let target = event.target.unwrap();
        assert_eq!(target.id, "2001");
        assert_eq!(target.name, "baduser");
        assert_eq!(event.reason.as_deref(), Some("spam"));
        assert_eq!(event.duration, ActionDuration::Permanent);
        assert!(event.created_at > 0);
    }

    #[test]
    fn test_decode_unban_without_reason() {
        let raw = action_frame(
            "chat_moderator_actions.1000.4242",
            "unban",
            Some("2001"),
            &["baduser"],
        );
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.action, ModAction::Unban);
        assert_eq!(event.reason, None);
        assert_eq!(event.duration, ActionDuration::Permanent);
    }

    #[test]
    fn test_decode_timeout() {
        let raw = action_frame(
            "chat_moderator_actions.1000.4242",
            "timeout",
            Some("2001"),
            &["baduser", "120", "spamming"],
        );
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.action, ModAction::Timeout);
        assert_eq!(event.duration, ActionDuration::Seconds(120));
        assert_eq!(event.reason.as_deref(), Some("spamming"));
        assert_eq!(event.target.unwrap().name, "baduser");
    }

    #[test]
    fn test_decode_case_insensitive_action() {
        let raw = action_frame(
            "chat_moderator_actions.1000.4242",
            "BAN",
            Some("2001"),
            &["baduser"],
        );
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.action, ModAction::Ban);
        assert_eq!(event.raw_action, "BAN");
    }

    #[test]
    fn test_decode_slow_toggle_with_duration() {
        let raw = action_frame("chat_moderator_actions.1000.4242", "slow", None, &["30"]);
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.action, ModAction::Slow);
        assert_eq!(event.duration, ActionDuration::Seconds(30));
        assert!(event.target.is_none());
        assert!(event.reason.is_none());
    }

    #[test]
    fn test_decode_toggle_without_args() {
        let raw = action_frame("chat_moderator_actions.1000.4242", "clear", None, &[]);
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.action, ModAction::Clear);
        assert_eq!(event.duration, ActionDuration::None);
    }

    #[test]
    fn test_decode_strips_beta_marker() {
        let raw = action_frame("chat_moderator_actions.1000.4242", "r9kbeta", None, &[]);
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.action, ModAction::R9k);
        assert_eq!(event.action.name(), "r9k");
        assert_eq!(event.raw_action, "r9kbeta");
    }

    #[test]
    fn test_decode_mod_grant() {
        let raw = action_frame(
            "chat_moderator_actions.1000.4242",
            "mod",
            Some("2001"),
            &["newmod"],
        );
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.action, ModAction::Mod);
        assert_eq!(event.target.unwrap().name, "newmod");
        assert_eq!(event.duration, ActionDuration::None);
    }

    #[test]
    fn test_unknown_action_forwarded_as_other() {
        let raw = action_frame(
            "chat_moderator_actions.1000.4242",
            "vip",
            Some("2001"),
            &["someone"],
        );
        assert!(matches!(
            decode(&raw).unwrap(),
            DecodedMessage::Other(_)
        ));
    }

    #[test]
    fn test_foreign_topic_forwarded_as_other() {
        let raw = json!({
            "type": "MESSAGE",
            "data": { "topic": "channel-points.1.2", "message": "{}" }
        })
        .to_string();
        assert!(matches!(decode(&raw).unwrap(), DecodedMessage::Other(_)));
    }

    #[test]
    fn test_frame_without_data_forwarded_as_other() {
        assert!(matches!(
            decode(r#"{"type":"RECONNECT"}"#).unwrap(),
            DecodedMessage::Other(_)
        ));
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(matches!(
            decode("definitely not json"),
            Err(DecodeError::Envelope(_))
        ));
    }

    #[test]
    fn test_malformed_nested_payload() {
        let raw = json!({
            "type": "MESSAGE",
            "data": {
                "topic": "chat_moderator_actions.1.2",
                "message": "not json either"
            }
        })
        .to_string();
        assert!(matches!(decode(&raw), Err(DecodeError::Payload(_))));
    }

    #[test]
    fn test_unparseable_timeout_duration_decodes_as_none() {
        let raw = action_frame(
            "chat_moderator_actions.1000.4242",
            "timeout",
            Some("2001"),
            &["baduser", "soon"],
        );
        let event = match decode(&raw).unwrap() {
            DecodedMessage::Moderation(ev) => ev,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(event.duration, ActionDuration::None);
    }

    #[test]
    fn test_duration_serialization() {
        assert_eq!(
            serde_json::to_string(&ActionDuration::Permanent).unwrap(),
            r#""permanent""#
        );
        assert_eq!(
            serde_json::to_string(&ActionDuration::Seconds(120)).unwrap(),
            "120"
        );
        assert_eq!(serde_json::to_string(&ActionDuration::None).unwrap(), "null");
    }
}
