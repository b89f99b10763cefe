use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::ids::SessionId;
use crate::proxy::ProxyConfig;

pub const NAME_MIN_LEN: usize = 3;
pub const NAME_MAX_LEN: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Durable binding between a name and one messaging account.
///
/// Fields are public so repositories can hydrate rows, but every change of
/// state should go through the methods below: they keep `updated_at` current
/// and enforce the transition rules (`connect` is the only way into
/// `Connected`, and it requires a non-empty external id).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    /// Network-assigned account id. Empty until the first authentication and
    /// retained across disconnects so a new process can resume.
    pub external_id: String,
    /// Pairing payload; empty unless authentication is in progress.
    pub qr_code: String,
    pub proxy: Option<ProxyConfig>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// New sessions start `Disconnected`, inactive and unauthenticated.
    pub fn new(name: &str) -> Result<Self, SessionError> {
        let name = validate_name(name)?;
        let now = Utc::now();
        Ok(Self {
            id: SessionId::new(),
            name,
            status: SessionStatus::Disconnected,
            external_id: String::new(),
            qr_code: String::new(),
            proxy: None,
            is_active: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn connect(&mut self, external_id: &str) -> Result<(), SessionError> {
        if self.status == SessionStatus::Connected {
            return Err(SessionError::AlreadyConnected);
        }
        if external_id.trim().is_empty() {
            return Err(SessionError::InvalidExternalId);
        }
        self.status = SessionStatus::Connected;
        self.external_id = external_id.to_string();
        self.is_active = true;
        self.touch();
        Ok(())
    }

    /// Leaves `is_active` untouched: a previously active session that starts a
    /// reconnect attempt stays active while it is in flight.
    pub fn set_connecting(&mut self) {
        self.status = SessionStatus::Connecting;
        self.touch();
    }

    /// Keeps `external_id` and `qr_code`; clear the QR explicitly if needed.
    pub fn disconnect(&mut self) {
        self.status = SessionStatus::Disconnected;
        self.is_active = false;
        self.touch();
    }

    pub fn set_qr_code(&mut self, qr_code: &str) {
        self.qr_code = qr_code.to_string();
        self.touch();
    }

    pub fn clear_qr_code(&mut self) {
        self.qr_code.clear();
        self.touch();
    }

    /// Replaces the external id without changing status, used when the
    /// network reports a different account id on reconnect.
    pub fn update_external_id(&mut self, external_id: &str) -> Result<(), SessionError> {
        if external_id.trim().is_empty() {
            return Err(SessionError::InvalidExternalId);
        }
        self.external_id = external_id.to_string();
        self.touch();
        Ok(())
    }

    /// `None` or a blank string clears the proxy.
    pub fn set_proxy_url(&mut self, proxy_url: Option<&str>) -> Result<(), SessionError> {
        self.proxy = match proxy_url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(raw) => Some(ProxyConfig::parse(raw)?),
            None => None,
        };
        self.touch();
        Ok(())
    }

    pub fn can_connect(&self) -> bool {
        self.status != SessionStatus::Connected
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected && self.is_active
    }

    pub fn has_qr_code(&self) -> bool {
        !self.qr_code.is_empty()
    }

    pub fn is_authenticated(&self) -> bool {
        !self.external_id.is_empty()
    }

    /// Previously authenticated, marked active, and either connected or mid-flight.
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(self.status, SessionStatus::Connected | SessionStatus::Connecting)
            && self.is_authenticated()
            && self.is_active
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.proxy.as_ref().map(ProxyConfig::to_url)
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // Keep updated_at strictly increasing even when the clock has coarse resolution.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }
}

/// Trim and length-check a session name (counted in characters).
pub fn validate_name(name: &str) -> Result<String, SessionError> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if len < NAME_MIN_LEN {
        return Err(SessionError::InvalidName(format!(
            "'{trimmed}' is shorter than {NAME_MIN_LEN} characters"
        )));
    }
    if len > NAME_MAX_LEN {
        return Err(SessionError::InvalidName(format!(
            "name is longer than {NAME_MAX_LEN} characters ({len})"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("bot-1").unwrap()
    }

    #[test]
    fn new_session_defaults() {
        let s = session();
        assert_eq!(s.name, "bot-1");
        assert_eq!(s.status, SessionStatus::Disconnected);
        assert!(!s.is_active);
        assert!(s.external_id.is_empty());
        assert!(s.qr_code.is_empty());
        assert!(s.proxy.is_none());
        assert_eq!(s.created_at, s.updated_at);
    }

    #[test]
    fn name_length_bounds() {
        assert!(Session::new("ab").is_err());
        assert!(Session::new("abc").is_ok());
        assert!(Session::new(&"x".repeat(50)).is_ok());
        assert!(Session::new(&"x".repeat(51)).is_err());
        assert!(Session::new("   ab   ").is_err());
        assert_eq!(Session::new("  padded  ").unwrap().name, "padded");
    }

    #[test]
    fn connect_sets_active_and_external_id() {
        let mut s = session();
        s.connect("5511@net").unwrap();
        assert_eq!(s.status, SessionStatus::Connected);
        assert_eq!(s.external_id, "5511@net");
        assert!(s.is_active);
        assert!(s.is_connected());
    }

    #[test]
    fn connect_twice_fails() {
        let mut s = session();
        s.connect("5511@net").unwrap();
        assert_eq!(s.connect("other@net"), Err(SessionError::AlreadyConnected));
        assert_eq!(s.external_id, "5511@net");
    }

    #[test]
    fn connect_requires_external_id() {
        let mut s = session();
        assert_eq!(s.connect(""), Err(SessionError::InvalidExternalId));
        assert_eq!(s.connect("   "), Err(SessionError::InvalidExternalId));
        assert_eq!(s.status, SessionStatus::Disconnected);
    }

    #[test]
    fn set_connecting_preserves_active_flag() {
        let mut s = session();
        s.set_connecting();
        assert_eq!(s.status, SessionStatus::Connecting);
        assert!(!s.is_active);

        let mut s = session();
        s.connect("5511@net").unwrap();
        s.set_connecting();
        assert_eq!(s.status, SessionStatus::Connecting);
        assert!(s.is_active);
        assert!(!s.is_connected());
    }

    #[test]
    fn disconnect_keeps_external_id_and_qr() {
        let mut s = session();
        s.set_qr_code("ABC123");
        s.connect("5511@net").unwrap();
        s.disconnect();
        assert_eq!(s.status, SessionStatus::Disconnected);
        assert!(!s.is_active);
        assert_eq!(s.external_id, "5511@net");
        assert_eq!(s.qr_code, "ABC123");
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut s = session();
        s.connect("5511@net").unwrap();
        s.disconnect();
        let first = (s.status, s.is_active, s.external_id.clone());
        s.disconnect();
        assert_eq!((s.status, s.is_active, s.external_id.clone()), first);
    }

    #[test]
    fn can_connect_iff_not_connected() {
        let mut s = session();
        assert!(s.can_connect());
        s.set_connecting();
        assert!(s.can_connect());
        s.connect("5511@net").unwrap();
        assert!(!s.can_connect());
        s.disconnect();
        assert!(s.can_connect());
    }

    #[test]
    fn qr_code_is_independent_of_status() {
        let mut s = session();
        s.connect("5511@net").unwrap();
        s.set_qr_code("XYZ");
        assert_eq!(s.status, SessionStatus::Connected);
        assert!(s.has_qr_code());
        s.clear_qr_code();
        assert!(!s.has_qr_code());
        assert_eq!(s.status, SessionStatus::Connected);
    }

    #[test]
    fn every_mutator_bumps_updated_at() {
        let mut s = session();
        let mut last = s.updated_at;
        let mut check = |s: &Session| {
            assert!(s.updated_at > last, "updated_at did not advance");
            last = s.updated_at;
        };

        s.set_connecting();
        check(&s);
        s.set_qr_code("QR");
        check(&s);
        s.clear_qr_code();
        check(&s);
        s.connect("5511@net").unwrap();
        check(&s);
        s.update_external_id("5512@net").unwrap();
        check(&s);
        s.set_proxy_url(Some("http://proxy:3128")).unwrap();
        check(&s);
        s.disconnect();
        check(&s);
    }

    #[test]
    fn failed_connect_does_not_touch() {
        let mut s = session();
        let before = s.updated_at;
        let _ = s.connect("");
        assert_eq!(s.updated_at, before);
    }

    #[test]
    fn proxy_set_and_clear() {
        let mut s = session();
        s.set_proxy_url(Some("socks5://u:p@1.2.3.4:1080")).unwrap();
        assert_eq!(s.proxy_url().as_deref(), Some("socks5://u:p@1.2.3.4:1080"));
        s.set_proxy_url(Some("  ")).unwrap();
        assert!(s.proxy.is_none());
        s.set_proxy_url(Some("http://proxy:3128")).unwrap();
        s.set_proxy_url(None).unwrap();
        assert!(s.proxy.is_none());
    }

    #[test]
    fn invalid_proxy_leaves_previous_value() {
        let mut s = session();
        s.set_proxy_url(Some("http://proxy:3128")).unwrap();
        assert!(s.set_proxy_url(Some("gopher://x:1")).is_err());
        assert_eq!(s.proxy_url().as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn reconnect_eligibility() {
        let mut s = session();
        assert!(!s.is_reconnect_eligible());

        s.set_connecting();
        assert!(!s.is_reconnect_eligible(), "never authenticated");

        s.connect("5511@net").unwrap();
        assert!(s.is_reconnect_eligible());

        s.set_connecting();
        assert!(s.is_reconnect_eligible(), "active reconnect in flight");

        s.disconnect();
        assert!(!s.is_reconnect_eligible());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            SessionStatus::Disconnected,
            SessionStatus::Connecting,
            SessionStatus::Connected,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }
}
