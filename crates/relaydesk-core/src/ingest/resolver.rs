//! Maps an email username to a submission endpoint.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::parser::ProvisionalCredential;
use crate::relay::{RelayCredential, RelayEndpoint, Security, SmtpDetails, WebmailDetails, WebmailProvider};

/// Port used when nothing explicit was given.
pub const DEFAULT_SUBMISSION_PORT: u16 = 587;

const KNOWN_DOMAINS: &[(&str, WebmailProvider)] = &[
    ("gmail.com", WebmailProvider::Gmail),
    ("googlemail.com", WebmailProvider::Gmail),
    ("outlook.com", WebmailProvider::Outlook),
    ("hotmail.com", WebmailProvider::Outlook),
    ("live.com", WebmailProvider::Outlook),
    ("msn.com", WebmailProvider::Outlook),
    ("yahoo.com", WebmailProvider::Yahoo),
    ("ymail.com", WebmailProvider::Yahoo),
    ("aol.com", WebmailProvider::Aol),
    ("protonmail.com", WebmailProvider::ProtonMail),
    ("proton.me", WebmailProvider::ProtonMail),
    ("zoho.com", WebmailProvider::Zoho),
    ("yandex.com", WebmailProvider::Yandex),
    ("yandex.ru", WebmailProvider::Yandex),
    ("mail.com", WebmailProvider::MailCom),
    ("icloud.com", WebmailProvider::ICloud),
    ("me.com", WebmailProvider::ICloud),
    ("gmx.com", WebmailProvider::Gmx),
    ("hostinger.com", WebmailProvider::Hostinger),
];

/// The resolver had to guess the host of an unrecognised domain.
///
/// Not an error: the relay is still produced, but it must pass validation
/// before anything is sent through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionAmbiguity {
    /// Domain of the username.
    pub domain: String,
    /// Host that was guessed for it.
    pub guessed_host: String,
}

impl fmt::Display for ResolutionAmbiguity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "guessed SMTP host {} for unrecognized domain {}",
            self.guessed_host, self.domain
        )
    }
}

/// Why a provisional credential could not be turned into a relay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Port 0 was given explicitly.
    #[error("port 0 is not a valid submission port")]
    InvalidPort,
    /// The username has no domain part.
    #[error("username {0} has no domain")]
    MissingDomain(String),
}

/// A resolved, still unvalidated relay.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The relay, health `Unvalidated`.
    pub credential: RelayCredential,
    /// Set when the host was guessed.
    pub ambiguity: Option<ResolutionAmbiguity>,
}

/// Fills in provider, host, port and security for parsed credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderResolver;

impl ProviderResolver {
    /// Creates a resolver over the built-in domain table.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Looks up a webmail provider by email domain.
    #[must_use]
    pub fn known_provider(domain: &str) -> Option<WebmailProvider> {
        let domain = domain.trim().to_ascii_lowercase();
        KNOWN_DOMAINS
            .iter()
            .find(|(known, _)| *known == domain)
            .map(|(_, provider)| *provider)
    }

    /// Resolves a provisional credential.
    ///
    /// Explicit host, port and security always win over the table. A known
    /// domain without an explicit host becomes a webmail relay; anything
    /// else is a generic SMTP relay.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] for an explicit port 0 or a username without
    /// a domain.
    pub fn resolve(&self, provisional: ProvisionalCredential) -> Result<Resolution, ResolveError> {
        if provisional.port == Some(0) {
            return Err(ResolveError::InvalidPort);
        }
        let domain = provisional
            .username
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| ResolveError::MissingDomain(provisional.username.clone()))?;

        let security = provisional.security.unwrap_or_default();
        let port = provisional.port.unwrap_or(DEFAULT_SUBMISSION_PORT);
        let known = Self::known_provider(&domain);

        let mut ambiguity = None;
        let endpoint = match (known, provisional.host) {
            (Some(provider), None) => RelayEndpoint::Webmail(WebmailDetails {
                provider,
                host: provider.smtp_host().to_string(),
                port,
                security,
            }),
            (Some(provider), Some(host)) if host.eq_ignore_ascii_case(provider.smtp_host()) => {
                RelayEndpoint::Webmail(WebmailDetails {
                    provider,
                    host,
                    port,
                    security,
                })
            }
            (_, Some(host)) => RelayEndpoint::Smtp(SmtpDetails {
                host,
                port,
                security,
                host_guessed: false,
            }),
            (None, None) => {
                let host = guess_host(&domain);
                debug!(%domain, %host, "Guessed SMTP host for unknown domain");
                ambiguity = Some(ResolutionAmbiguity {
                    domain,
                    guessed_host: host.clone(),
                });
                RelayEndpoint::Smtp(SmtpDetails {
                    host,
                    port,
                    security: Security::StartTls,
                    host_guessed: true,
                })
            }
        };

        Ok(Resolution {
            credential: RelayCredential::new(provisional.username, provisional.secret, endpoint),
            ambiguity,
        })
    }
}

/// `smtp.<second-level label>.com`, right or wrong.
fn guess_host(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    let sld = match labels.len() {
        0 => domain,
        1 => labels[0],
        n => labels[n - 2],
    };
    format!("smtp.{sld}.com")
}
