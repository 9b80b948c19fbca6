//! Token data model
//!
//! Claims carried inside the signed access token, the authorization level, the
//! session retention flow and the token pair returned to callers.

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Coarse authorization tier carried in claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[display("admin")]
    Admin,
    #[display("user")]
    User,
    #[display("anonymous")]
    Anonymous,
}

/// Session retention policy chosen at login
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowType {
    /// Short-lived records, dropped when the browser session ends
    #[default]
    #[display("websiteSession")]
    WebsiteSession,
    /// Long-lived records
    #[display("rememberMe")]
    RememberMe,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown flow type: {0}")]
pub struct UnknownFlow(pub String);

impl FromStr for FlowType {
    type Err = UnknownFlow;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websiteSession" => Ok(FlowType::WebsiteSession),
            "rememberMe" => Ok(FlowType::RememberMe),
            other => Err(UnknownFlow(other.to_string())),
        }
    }
}

/// JWT claims structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username, or generated id for anonymous principals)
    pub sub: String,
    /// Authorization level
    pub level: Level,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Issuer
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// JWT ID (unique identifier for this token)
    pub jti: String,
}

impl Claims {
    /// Claims for `subject`; timestamps, issuer and id are stamped at minting
    pub fn new(subject: impl Into<String>, level: Level, name: Option<String>) -> Self {
        Self {
            sub: subject.into(),
            level,
            name,
            iss: String::new(),
            iat: 0,
            exp: 0,
            jti: String::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.level == Level::Anonymous
    }

    /// Join key of the session's refresh and flow records: `<sub>-<iat>`
    pub fn session_key(&self) -> String {
        session_key(&self.sub, self.iat)
    }
}

/// Build the session key for `subject` issued at `issued_at` (Unix seconds)
pub fn session_key(subject: &str, issued_at: i64) -> String {
    format!("{subject}-{issued_at}")
}

/// Token pair returned by issuance and rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(
        rename = "refreshToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(rename = "accessTokenExpiration")]
    pub access_token_expires_in: u64,
    /// Lifetime of the server-side session records in seconds
    #[serde(
        rename = "refreshTokenExpiration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token_expires_in: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_serialization() {
        assert_eq!(serde_json::to_string(&Level::Admin).unwrap(), r#""admin""#);
        assert_eq!(serde_json::to_string(&Level::User).unwrap(), r#""user""#);
        assert_eq!(
            serde_json::to_string(&Level::Anonymous).unwrap(),
            r#""anonymous""#
        );
        let level: Level = serde_json::from_str(r#""user""#).unwrap();
        assert_eq!(level, Level::User);
        assert!(serde_json::from_str::<Level>(r#""root""#).is_err());
    }

    #[test]
    fn test_flow_type_round_trips_through_str() {
        for flow in [FlowType::WebsiteSession, FlowType::RememberMe] {
            assert_eq!(flow.to_string().parse::<FlowType>().unwrap(), flow);
        }
        assert_eq!(
            "forever".parse::<FlowType>(),
            Err(UnknownFlow("forever".to_string()))
        );
    }

    #[test]
    fn test_flow_type_json_names() {
        assert_eq!(
            serde_json::to_string(&FlowType::RememberMe).unwrap(),
            r#""rememberMe""#
        );
        assert_eq!(FlowType::default(), FlowType::WebsiteSession);
    }

    #[test]
    fn test_session_key_format() {
        let mut claims = Claims::new("alice", Level::User, None);
        claims.iat = 1_700_000_000;
        assert_eq!(claims.session_key(), "alice-1700000000");
        assert_eq!(session_key("bob", 5), "bob-5");
    }

    #[test]
    fn test_claims_omit_missing_name() {
        let claims = Claims::new("anon-1", Level::Anonymous, None);
        let json = serde_json::to_value(&claims).unwrap();
        assert!(json.get("name").is_none());
        assert_eq!(json["level"], "anonymous");
        assert!(claims.is_anonymous());
    }

    #[test]
    fn test_tokens_wire_shape() {
        let tokens = Tokens {
            access_token: "a".to_string(),
            refresh_token: Some("r".to_string()),
            access_token_expires_in: 900,
            refresh_token_expires_in: Some(86400),
        };
        let json = serde_json::to_value(&tokens).unwrap();
        assert_eq!(json["accessToken"], "a");
        assert_eq!(json["refreshToken"], "r");
        assert_eq!(json["accessTokenExpiration"], 900);
        assert_eq!(json["refreshTokenExpiration"], 86400);
    }

    #[test]
    fn test_anonymous_tokens_omit_refresh_fields() {
        let tokens = Tokens {
            access_token: "a".to_string(),
            refresh_token: None,
            access_token_expires_in: 60,
            refresh_token_expires_in: None,
        };
        let json = serde_json::to_string(&tokens).unwrap();
        assert!(!json.contains("refreshToken"));
        assert!(!json.contains("refreshTokenExpiration"));

        let parsed: Tokens = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tokens);
    }
}
