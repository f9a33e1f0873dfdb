//! Relay credential model.
//!
//! A relay is one outbound mail path. Every relay shares the same envelope
//! (identity, sender identity, quota, health) and carries exactly one
//! provider-specific [`RelayEndpoint`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, stable identifier for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(pub Uuid);

impl RelayId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RelayId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RelayId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Security/encryption mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// No encryption.
    None,
    /// Implicit TLS (connect directly with TLS).
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    #[default]
    StartTls,
}

impl Security {
    /// Get display name for the security mode.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::None => "None (insecure)",
            Self::Tls => "SSL/TLS",
            Self::StartTls => "STARTTLS",
        }
    }

    /// Conventional submission port for the security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None => 25,
            Self::StartTls => 587,
            Self::Tls => 465,
        }
    }
}

/// Consumer mail hosts with a well-known submission server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebmailProvider {
    /// Google Mail.
    Gmail,
    /// Outlook.com / Hotmail / Live.
    Outlook,
    /// Yahoo Mail.
    Yahoo,
    /// AOL Mail.
    Aol,
    /// Proton Mail (via Bridge or business SMTP).
    ProtonMail,
    /// Zoho Mail.
    Zoho,
    /// Yandex Mail.
    Yandex,
    /// Mail.com.
    MailCom,
    /// iCloud Mail.
    ICloud,
    /// GMX.
    Gmx,
    /// Hostinger hosted mail.
    Hostinger,
}

impl WebmailProvider {
    /// Human-readable provider name.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Gmail => "Gmail",
            Self::Outlook => "Outlook",
            Self::Yahoo => "Yahoo",
            Self::Aol => "AOL",
            Self::ProtonMail => "Proton Mail",
            Self::Zoho => "Zoho",
            Self::Yandex => "Yandex",
            Self::MailCom => "Mail.com",
            Self::ICloud => "iCloud",
            Self::Gmx => "GMX",
            Self::Hostinger => "Hostinger",
        }
    }

    /// Submission host of the provider.
    #[must_use]
    pub const fn smtp_host(self) -> &'static str {
        match self {
            Self::Gmail => "smtp.gmail.com",
            Self::Outlook => "smtp-mail.outlook.com",
            Self::Yahoo => "smtp.mail.yahoo.com",
            Self::Aol => "smtp.aol.com",
            Self::ProtonMail => "smtp.protonmail.ch",
            Self::Zoho => "smtp.zoho.com",
            Self::Yandex => "smtp.yandex.com",
            Self::MailCom => "smtp.mail.com",
            Self::ICloud => "smtp.mail.me.com",
            Self::Gmx => "mail.gmx.com",
            Self::Hostinger => "smtp.hostinger.com",
        }
    }
}

/// Transactional email APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiProvider {
    /// Twilio `SendGrid`.
    SendGrid,
    /// Mailgun.
    Mailgun,
    /// Postmark.
    Postmark,
    /// Resend.
    Resend,
}

impl ApiProvider {
    /// Human-readable provider name.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::SendGrid => "SendGrid",
            Self::Mailgun => "Mailgun",
            Self::Postmark => "Postmark",
            Self::Resend => "Resend",
        }
    }
}

/// Coarse relay category, derived from the endpoint variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Generic SMTP server.
    Smtp,
    /// Consumer mail host.
    Webmail,
    /// Transactional email API.
    Api,
}

/// Generic SMTP server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpDetails {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    #[serde(default)]
    pub security: Security,
    /// Host was derived from the address domain rather than known or given.
    #[serde(default)]
    pub host_guessed: bool,
}

/// Well-known consumer mail host endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebmailDetails {
    /// Which provider.
    pub provider: WebmailProvider,
    /// Submission host.
    pub host: String,
    /// Submission port.
    pub port: u16,
    /// Security mode.
    #[serde(default)]
    pub security: Security,
}

/// Transactional API endpoint; the API key is the relay's secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDetails {
    /// Which API.
    pub provider: ApiProvider,
    /// Provider region, e.g. `eu` for Mailgun's EU cluster.
    #[serde(default)]
    pub region: Option<String>,
    /// Sending domain, required by Mailgun.
    #[serde(default)]
    pub domain: Option<String>,
}

/// Provider-specific half of a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "providerKind", rename_all = "lowercase")]
pub enum RelayEndpoint {
    /// Generic SMTP.
    Smtp(SmtpDetails),
    /// Consumer mail host.
    Webmail(WebmailDetails),
    /// Transactional API.
    Api(ApiDetails),
}

impl RelayEndpoint {
    /// Category of this endpoint.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Smtp(_) => ProviderKind::Smtp,
            Self::Webmail(_) => ProviderKind::Webmail,
            Self::Api(_) => ProviderKind::Api,
        }
    }

    /// Host, port and security for SMTP-speaking endpoints.
    #[must_use]
    pub fn smtp_target(&self) -> Option<(&str, u16, Security)> {
        match self {
            Self::Smtp(d) => Some((&d.host, d.port, d.security)),
            Self::Webmail(d) => Some((&d.host, d.port, d.security)),
            Self::Api(_) => None,
        }
    }
}

/// Outcome of the most recent validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RelayHealth {
    /// Never validated; must not be used for dispatch.
    #[default]
    Unvalidated,
    /// Handshake and authentication succeeded.
    Valid,
    /// Validation or sending showed the relay is unusable.
    Invalid {
        /// Human-readable cause.
        reason: String,
    },
}

/// One outbound mail path owned by the relay store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RelayRecord", try_from = "RelayRecord")]
pub struct RelayCredential {
    /// Stable identifier.
    pub id: RelayId,
    /// Login name (an email address for SMTP relays).
    pub username: String,
    /// Password or API key.
    pub secret: String,
    /// Envelope and header sender.
    pub from_email: String,
    /// Display name of the sender.
    pub from_name: String,
    /// Sends allowed per UTC day; `None` disables enforcement.
    pub daily_quota: Option<u32>,
    /// Sends counted on `quota_day`.
    pub sent_today: u32,
    /// Day `sent_today` belongs to.
    pub quota_day: Option<NaiveDate>,
    /// Validation state.
    pub health: RelayHealth,
    /// When the relay was last validated.
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Provider-specific connection data.
    pub endpoint: RelayEndpoint,
}

impl RelayCredential {
    /// Creates an unvalidated relay sending as `username`.
    #[must_use]
    pub fn new(username: impl Into<String>, secret: impl Into<String>, endpoint: RelayEndpoint) -> Self {
        let username = username.into();
        let from_name = username
            .split_once('@')
            .map_or_else(|| username.clone(), |(local, _)| local.to_string());

        Self {
            id: RelayId::new(),
            from_email: username.clone(),
            from_name,
            username,
            secret: secret.into(),
            daily_quota: None,
            sent_today: 0,
            quota_day: None,
            health: RelayHealth::Unvalidated,
            last_validated_at: None,
            endpoint,
        }
    }

    /// Sets the daily quota.
    #[must_use]
    pub const fn with_daily_quota(mut self, quota: Option<u32>) -> Self {
        self.daily_quota = quota;
        self
    }

    /// Category of this relay.
    #[must_use]
    pub const fn provider_kind(&self) -> ProviderKind {
        self.endpoint.kind()
    }

    /// Whether the relay passed its last validation.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self.health, RelayHealth::Valid)
    }

    /// Why the relay is invalid, if it is.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        match &self.health {
            RelayHealth::Invalid { reason } => Some(reason),
            _ => None,
        }
    }

    /// Whether SMTP connections use implicit TLS.
    #[must_use]
    pub fn use_implicit_tls(&self) -> bool {
        self.endpoint
            .smtp_target()
            .is_some_and(|(_, _, security)| security == Security::Tls)
    }

    /// Sends still allowed on `day`; `u32::MAX` when unlimited.
    #[must_use]
    pub fn remaining_quota(&self, day: NaiveDate) -> u32 {
        let used = if self.quota_day == Some(day) { self.sent_today } else { 0 };
        self.daily_quota
            .map_or(u32::MAX, |quota| quota.saturating_sub(used))
    }

    /// Short description for logs and error messages.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.endpoint {
            RelayEndpoint::Smtp(d) => format!("{} via {}:{}", self.username, d.host, d.port),
            RelayEndpoint::Webmail(d) => {
                format!("{} via {} ({}:{})", self.username, d.provider.display_name(), d.host, d.port)
            }
            RelayEndpoint::Api(d) => format!("{} via {} API", self.from_email, d.provider.display_name()),
        }
    }

    pub(crate) fn mark_valid(&mut self, at: DateTime<Utc>) {
        self.health = RelayHealth::Valid;
        self.last_validated_at = Some(at);
    }

    pub(crate) fn mark_invalid(&mut self, reason: impl Into<String>) {
        let mut reason = reason.into();
        if reason.trim().is_empty() {
            reason = "unknown failure".to_string();
        }
        self.health = RelayHealth::Invalid { reason };
    }
}

impl std::fmt::Debug for RelayCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCredential")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("from_email", &self.from_email)
            .field("daily_quota", &self.daily_quota)
            .field("sent_today", &self.sent_today)
            .field("health", &self.health)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Flat JSON shape exchanged with callers.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayRecord {
    #[serde(default)]
    id: Option<RelayId>,
    username: String,
    #[serde(alias = "password", alias = "apiKey")]
    secret: String,
    #[serde(default)]
    from_email: String,
    #[serde(default)]
    from_name: String,
    #[serde(default)]
    daily_quota: Option<u32>,
    #[serde(default)]
    sent_today: u32,
    #[serde(default)]
    quota_day: Option<NaiveDate>,
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    last_validated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    endpoint: RelayEndpoint,
}

impl From<RelayCredential> for RelayRecord {
    fn from(relay: RelayCredential) -> Self {
        let (is_valid, last_error) = match relay.health {
            RelayHealth::Unvalidated => (false, None),
            RelayHealth::Valid => (true, None),
            RelayHealth::Invalid { reason } => (false, Some(reason)),
        };
        Self {
            id: Some(relay.id),
            username: relay.username,
            secret: relay.secret,
            from_email: relay.from_email,
            from_name: relay.from_name,
            daily_quota: relay.daily_quota,
            sent_today: relay.sent_today,
            quota_day: relay.quota_day,
            is_valid,
            last_error,
            last_validated_at: relay.last_validated_at,
            endpoint: relay.endpoint,
        }
    }
}

impl TryFrom<RelayRecord> for RelayCredential {
    type Error = String;

    fn try_from(record: RelayRecord) -> Result<Self, Self::Error> {
        if record.secret.trim().is_empty() {
            return Err("relay secret must not be empty".to_string());
        }
        if let Some((host, port, _)) = record.endpoint.smtp_target()
            && (host.trim().is_empty() || port == 0)
        {
            return Err("SMTP relays need a host and a non-zero port".to_string());
        }

        let health = match (record.is_valid, record.last_error) {
            (true, _) => RelayHealth::Valid,
            (false, Some(reason)) if !reason.trim().is_empty() => RelayHealth::Invalid { reason },
            (false, _) => RelayHealth::Unvalidated,
        };

        let mut relay = Self::new(record.username, record.secret, record.endpoint);
        if let Some(id) = record.id {
            relay.id = id;
        }
        if !record.from_email.is_empty() {
            relay.from_email = record.from_email;
        }
        if !record.from_name.is_empty() {
            relay.from_name = record.from_name;
        }
        relay.daily_quota = record.daily_quota;
        relay.sent_today = record.sent_today;
        relay.quota_day = record.quota_day;
        relay.health = health;
        relay.last_validated_at = record.last_validated_at;
        Ok(relay)
    }
}
