//! The control-protocol envelope.
//!
//! Every message exchanged between daemons is a JSON object carrying a
//! three-part command path (`Section1/Section2/Section3`), logical addressing
//! (`From`/`To`), a `SendState` and a correlation `Token`. Any other key is
//! payload and is preserved verbatim.
//!
//! A response reuses the request's `Token` and swaps `From`/`To`; see
//! [`Envelope::toggle_status`] and [`Envelope::reply`].

use crate::error::EnvelopeError;
use chrono::Local;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// `ResultCode` value daemons use to report success.
pub const RESULT_OK: i64 = 1000;

/// Keys with a dedicated field on [`Envelope`]; everything else is payload.
pub const RESERVED_KEYS: [&str; 7] = [
    "Section1",
    "Section2",
    "Section3",
    "From",
    "To",
    "SendState",
    "Token",
];

// ---------------------------------------------------------------------------
// SendState
// ---------------------------------------------------------------------------

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendState {
    /// Expects a response carrying the same token.
    Request,
    /// Answers a request.
    Response,
    /// One-way; no response expected.
    Notify,
}

impl SendState {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Notify => "notify",
        }
    }

    /// Request and response swap; notify stays notify.
    pub fn toggled(self) -> Self {
        match self {
            Self::Request => Self::Response,
            Self::Response => Self::Request,
            Self::Notify => Self::Notify,
        }
    }
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendState {
    type Err = EnvelopeError;

    /// Case-insensitive: older senders write `"Request"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "request" => Ok(Self::Request),
            "response" => Ok(Self::Response),
            "notify" => Ok(Self::Notify),
            _ => Err(EnvelopeError::UnknownSendState(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for SendState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A blank or absent `SendState` decodes as `None` so validation can report it.
fn de_send_state<'de, D>(deserializer: D) -> Result<Option<SendState>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Opaque correlation id pairing a request with its response.
///
/// Used only for causal pairing, never for authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Timestamp (to the millisecond) plus four random letters.
    pub fn generate() -> Self {
        const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..4)
            .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
            .collect();
        Self(format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S%3f"),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// CommandPath
// ---------------------------------------------------------------------------

/// The `(Section1, Section2, Section3)` routing triple.
///
/// Segments may be empty strings; only their presence is mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandPath {
    pub section1: String,
    pub section2: String,
    pub section3: String,
}

impl CommandPath {
    pub fn new(
        section1: impl Into<String>,
        section2: impl Into<String>,
        section3: impl Into<String>,
    ) -> Self {
        Self {
            section1: section1.into(),
            section2: section2.into(),
            section3: section3.into(),
        }
    }
}

impl fmt::Display for CommandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.section1, self.section2, self.section3)
    }
}

impl FromStr for CommandPath {
    type Err = EnvelopeError;

    /// Parses `"Camera/Information/Status"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [a, b, c] => Ok(Self::new(*a, *b, *c)),
            _ => Err(EnvelopeError::InvalidCommandPath(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A control message.
///
/// Decoding is lenient (missing keys become `None`/empty) so that
/// [`Envelope::validate`] can say precisely what is wrong; decoding never
/// implies validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Section1", default, skip_serializing_if = "Option::is_none")]
    pub section1: Option<String>,
    #[serde(rename = "Section2", default, skip_serializing_if = "Option::is_none")]
    pub section2: Option<String>,
    #[serde(rename = "Section3", default, skip_serializing_if = "Option::is_none")]
    pub section3: Option<String>,
    /// Logical id of the sending daemon (not an address).
    #[serde(rename = "From", default)]
    pub from: String,
    /// Logical id of the receiving daemon.
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(
        rename = "SendState",
        default,
        deserialize_with = "de_send_state",
        skip_serializing_if = "Option::is_none"
    )]
    pub send_state: Option<SendState>,
    #[serde(rename = "Token", default)]
    pub token: Token,
    /// Every other key (`Action`, `ResultCode`, `ErrorMsg`, domain data).
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope with a fresh token.
    pub fn new(
        path: CommandPath,
        from: impl Into<String>,
        to: impl Into<String>,
        state: SendState,
    ) -> Self {
        Self {
            section1: Some(path.section1),
            section2: Some(path.section2),
            section3: Some(path.section3),
            from: from.into(),
            to: to.into(),
            send_state: Some(state),
            token: Token::generate(),
            payload: Map::new(),
        }
    }

    pub fn request(path: CommandPath, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(path, from, to, SendState::Request)
    }

    pub fn notify(path: CommandPath, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(path, from, to, SendState::Notify)
    }

    /// Decode a JSON object. Does not validate.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check the structural invariants.
    ///
    /// All three `Section*` keys must exist (values may be empty); `From`,
    /// `To`, `SendState` and `Token` must be non-blank.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.section1.is_none() {
            return Err(EnvelopeError::MissingField("Section1"));
        }
        if self.section2.is_none() {
            return Err(EnvelopeError::MissingField("Section2"));
        }
        if self.section3.is_none() {
            return Err(EnvelopeError::MissingField("Section3"));
        }
        if self.from.trim().is_empty() {
            return Err(EnvelopeError::BlankField("From"));
        }
        if self.to.trim().is_empty() {
            return Err(EnvelopeError::BlankField("To"));
        }
        if self.send_state.is_none() {
            return Err(EnvelopeError::BlankField("SendState"));
        }
        if self.token.is_blank() {
            return Err(EnvelopeError::BlankField("Token"));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// The routing triple, if all three sections are present.
    pub fn path(&self) -> Option<CommandPath> {
        Some(CommandPath {
            section1: self.section1.clone()?,
            section2: self.section2.clone()?,
            section3: self.section3.clone()?,
        })
    }

    /// Swap request/response and swap `From`/`To`, in place.
    ///
    /// Turns a received request into the skeleton of its reply. Applying it
    /// twice restores the original envelope.
    pub fn toggle_status(&mut self) {
        self.send_state = self.send_state.map(SendState::toggled);
        std::mem::swap(&mut self.from, &mut self.to);
    }

    /// A copy of this envelope with status toggled; same token and payload.
    pub fn reply(&self) -> Self {
        let mut reply = self.clone();
        reply.toggle_status();
        reply
    }

    /// Set a key. Reserved keys update their dedicated field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        let text = || value.as_str().map(str::to_string);
        match key.as_str() {
            "Section1" => self.section1 = text(),
            "Section2" => self.section2 = text(),
            "Section3" => self.section3 = text(),
            "From" => self.from = text().unwrap_or_default(),
            "To" => self.to = text().unwrap_or_default(),
            "SendState" => self.send_state = value.as_str().and_then(|s| s.parse().ok()),
            "Token" => self.token = Token(text().unwrap_or_default()),
            _ => {
                self.payload.insert(key, value);
            }
        }
        self
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Payload lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// `ResultCode`, accepting either a number or a numeric string.
    pub fn result_code(&self) -> Option<i64> {
        match self.payload.get("ResultCode")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set_result(&mut self, code: i64, message: impl Into<String>) -> &mut Self {
        self.payload.insert("ResultCode".into(), Value::from(code));
        self.payload
            .insert("ErrorMsg".into(), Value::from(message.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::request(CommandPath::new("Camera", "Information", "Status"), "OMs", "CCd")
            .with("Action", "get")
    }

    #[test]
    fn test_request_is_valid() {
        let env = sample();
        assert!(env.is_valid());
        assert_eq!(env.send_state, Some(SendState::Request));
        assert!(!env.token.is_blank());
    }

    #[test]
    fn test_toggle_twice_restores() {
        for state in [SendState::Request, SendState::Response, SendState::Notify] {
            let original = Envelope::new(
                CommandPath::new("AI", "Operation", "Calibration"),
                "AId",
                "4DPD",
                state,
            );
            let mut env = original.clone();
            env.toggle_status();
            assert_eq!(env.from, "4DPD");
            assert_eq!(env.to, "AId");
            env.toggle_status();
            assert_eq!(env, original);
        }
    }

    #[test]
    fn test_reply_keeps_token_and_swaps_addresses() {
        let req = sample();
        let reply = req.reply();
        assert_eq!(reply.token, req.token);
        assert_eq!(reply.send_state, Some(SendState::Response));
        assert_eq!(reply.from, "CCd");
        assert_eq!(reply.to, "OMs");
        assert_eq!(reply.get_str("Action"), Some("get"));
    }

    #[test]
    fn test_notify_toggle_keeps_state() {
        let mut env = Envelope::notify(CommandPath::new("a", "b", "c"), "x", "y");
        env.toggle_status();
        assert_eq!(env.send_state, Some(SendState::Notify));
    }

    #[test]
    fn test_missing_section_is_invalid() {
        for missing in ["Section1", "Section2", "Section3"] {
            let mut obj = serde_json::json!({
                "Section1": "a", "Section2": "b", "Section3": "c",
                "From": "x", "To": "y", "SendState": "request", "Token": "t"
            });
            obj.as_object_mut().unwrap().remove(missing);
            let env = Envelope::from_json(&obj.to_string()).unwrap();
            match env.validate() {
                Err(EnvelopeError::MissingField(name)) => assert_eq!(name, missing),
                other => panic!("expected MissingField({missing}), got {other:?}"),
            }
        }
    }

    #[test]
    fn test_blank_addressing_is_invalid() {
        for key in ["From", "To", "SendState", "Token"] {
            for blank in ["", "   "] {
                let mut obj = serde_json::json!({
                    "Section1": "a", "Section2": "b", "Section3": "c",
                    "From": "x", "To": "y", "SendState": "request", "Token": "t"
                });
                obj[key] = Value::from(blank);
                let env = Envelope::from_json(&obj.to_string()).unwrap();
                assert!(!env.is_valid(), "{key}={blank:?} should be invalid");
            }

            let mut obj = serde_json::json!({
                "Section1": "a", "Section2": "b", "Section3": "c",
                "From": "x", "To": "y", "SendState": "request", "Token": "t"
            });
            obj.as_object_mut().unwrap().remove(key);
            let env = Envelope::from_json(&obj.to_string()).unwrap();
            assert!(!env.is_valid(), "missing {key} should be invalid");
        }
    }

    #[test]
    fn test_empty_sections_are_valid() {
        let text = r#"{"Section1":"","Section2":"","Section3":"","From":"a","To":"b","SendState":"notify","Token":"t"}"#;
        let env = Envelope::from_json(text).unwrap();
        assert!(env.is_valid());
        assert_eq!(env.path(), Some(CommandPath::new("", "", "")));
    }

    #[test]
    fn test_send_state_case_insensitive() {
        let text = r#"{"Section1":"WebSocket","Section2":"x","Section3":"y","From":"AId","To":"4DPD","SendState":"Request","Token":"t"}"#;
        let env = Envelope::from_json(text).unwrap();
        assert_eq!(env.send_state, Some(SendState::Request));
        assert!(env.to_json().unwrap().contains(r#""SendState":"request""#));
    }

    #[test]
    fn test_unknown_send_state_is_decode_error() {
        let text = r#"{"Section1":"a","Section2":"b","Section3":"c","From":"x","To":"y","SendState":"bogus","Token":"t"}"#;
        assert!(Envelope::from_json(text).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            Envelope::from_json("[1,2,3]"),
            Err(EnvelopeError::NotAnObject)
        ));
        assert!(matches!(
            Envelope::from_json("{not json"),
            Err(EnvelopeError::Json(_))
        ));
    }

    #[test]
    fn test_payload_preserved_through_json() {
        let mut env = sample();
        env.insert("cameras", serde_json::json!(["10.1.1.1", "10.1.1.2"]));
        env.set_result(RESULT_OK, "");
        let decoded = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.result_code(), Some(RESULT_OK));
        assert_eq!(decoded.get("cameras").unwrap()[1], "10.1.1.2");
    }

    #[test]
    fn test_insert_reserved_key_updates_field() {
        let mut env = sample();
        env.insert("Section3", "Version");
        env.insert("To", "AId");
        assert_eq!(env.section3.as_deref(), Some("Version"));
        assert_eq!(env.to, "AId");
        assert!(env.payload.get("Section3").is_none());
    }

    #[test]
    fn test_result_code_from_string() {
        let env = sample().with("ResultCode", "1000");
        assert_eq!(env.result_code(), Some(1000));
    }

    #[test]
    fn test_command_path_parse() {
        let path: CommandPath = "Daemon/Information/Version".parse().unwrap();
        assert_eq!(path, CommandPath::new("Daemon", "Information", "Version"));
        assert_eq!(path.to_string(), "Daemon/Information/Version");
        assert!("a/b".parse::<CommandPath>().is_err());
        assert!("a/b/c/d".parse::<CommandPath>().is_err());
    }

    #[test]
    fn test_tokens_differ() {
        let a = Token::generate();
        let b = Token::generate();
        assert_ne!(a, b);
        assert!(a.as_str().len() > 20);
    }
}
