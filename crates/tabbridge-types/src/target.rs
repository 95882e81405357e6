//! Routing targets and agent kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of recipient a [`Target`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// The broker itself.
    Server,
    /// A registered agent.
    Agent,
}

/// Addresses a recipient for routing.
///
/// For agent targets `name` is the agent kind. When `identifier` is set only
/// the agent registered under that identifier matches; otherwise any live
/// agent of the named kind does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl Target {
    /// Target the broker itself.
    pub fn server() -> Self {
        Self {
            target_type: TargetType::Server,
            name: "server".to_string(),
            identifier: None,
        }
    }

    /// Target an agent by kind and optional identifier.
    pub fn agent(kind: AgentKind, identifier: Option<&str>) -> Self {
        Self {
            target_type: TargetType::Agent,
            name: kind.as_str().to_string(),
            identifier: normalize_identifier(identifier.map(str::to_string)),
        }
    }

    /// The same target with its identifier normalized, as received off the wire.
    pub fn normalized(mut self) -> Self {
        self.identifier = normalize_identifier(self.identifier.take());
        self
    }

    /// Whether this target routes to a live agent with the given identity.
    pub fn matches_agent(&self, kind: AgentKind, identifier: Option<&str>) -> bool {
        if self.target_type != TargetType::Agent {
            return false;
        }
        match self.identifier.as_deref() {
            Some(wanted) => identifier == Some(wanted),
            None => self.name.eq_ignore_ascii_case(kind.as_str()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.target_type, &self.identifier) {
            (TargetType::Server, _) => write!(f, "server"),
            (TargetType::Agent, Some(id)) => write!(f, "{}:{}", self.name, id),
            (TargetType::Agent, None) => write!(f, "{}:*", self.name),
        }
    }
}

/// Normalize an agent identifier: surrounding whitespace is trimmed and an
/// empty string is the same as no identifier.
pub fn normalize_identifier(identifier: Option<String>) -> Option<String> {
    identifier
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// The enumeration of agent kinds a broker can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Chrome,
    Firefox,
    Edge,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Chrome, AgentKind::Firefox, AgentKind::Edge];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Chrome => "chrome",
            AgentKind::Firefox => "firefox",
            AgentKind::Edge => "edge",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chrome" => Ok(AgentKind::Chrome),
            "firefox" => Ok(AgentKind::Firefox),
            "edge" => Ok(AgentKind::Edge),
            other => Err(format!("unsupported agent kind '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_target_matches_only_that_agent() {
        let target = Target::agent(AgentKind::Chrome, Some("work"));
        assert!(target.matches_agent(AgentKind::Chrome, Some("work")));
        assert!(target.matches_agent(AgentKind::Firefox, Some("work")));
        assert!(!target.matches_agent(AgentKind::Chrome, Some("home")));
        assert!(!target.matches_agent(AgentKind::Chrome, None));
    }

    #[test]
    fn test_kind_target_matches_any_agent_of_kind() {
        let target = Target::agent(AgentKind::Chrome, None);
        assert!(target.matches_agent(AgentKind::Chrome, Some("work")));
        assert!(target.matches_agent(AgentKind::Chrome, None));
        assert!(!target.matches_agent(AgentKind::Firefox, None));
    }

    #[test]
    fn test_server_target_never_matches_agent() {
        assert!(!Target::server().matches_agent(AgentKind::Chrome, None));
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier(Some("  ".to_string())), None);
        assert_eq!(normalize_identifier(Some(" a ".to_string())), Some("a".to_string()));
        assert_eq!(normalize_identifier(None), None);
    }

    #[test]
    fn test_normalized_target_drops_blank_identifier() {
        let parsed: Target =
            serde_json::from_str(r#"{"type":"agent","name":"chrome","identifier":""}"#).unwrap();
        let target = parsed.normalized();
        assert_eq!(target.identifier, None);
        assert!(target.matches_agent(AgentKind::Chrome, Some("work")));

        let padded: Target =
            serde_json::from_str(r#"{"type":"agent","name":"chrome","identifier":" work "}"#).unwrap();
        assert_eq!(padded.normalized(), Target::agent(AgentKind::Chrome, Some("work")));
    }

    #[test]
    fn test_target_wire_format() {
        let json = serde_json::to_value(Target::agent(AgentKind::Firefox, Some("x"))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "agent", "name": "firefox", "identifier": "x"})
        );
        let parsed: Target = serde_json::from_str(r#"{"type":"server"}"#).unwrap();
        assert_eq!(parsed.target_type, TargetType::Server);
    }

    #[test]
    fn test_agent_kind_parse() {
        assert_eq!("Chrome".parse::<AgentKind>(), Ok(AgentKind::Chrome));
        assert!("safari".parse::<AgentKind>().is_err());
    }
}
