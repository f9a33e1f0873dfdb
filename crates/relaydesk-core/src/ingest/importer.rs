//! Bulk credential import.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::parser::{ProvisionalCredential, parse_columns, parse_line};
use super::resolver::ProviderResolver;
use super::source::{FormatHint, Record, read_records};
use crate::config::CoreConfig;
use crate::relay::{RelayCredential, RelayId, Security};
use crate::validate::RelayValidator;

/// File-level import failures. Bad lines never end up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    /// The file is over the size ceiling; nothing was parsed.
    #[error("file is {size} bytes, over the {limit}-byte import limit")]
    TooLarge {
        /// Size of the upload.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// The bytes could not be decoded.
    #[error("file could not be read: {0}")]
    Unreadable(String),
    /// A workbook without any sheet.
    #[error("workbook has no sheets")]
    EmptyWorkbook,
}

/// Pipeline step an outcome reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStage {
    /// Grammar matching.
    Parse,
    /// Endpoint resolution.
    Resolve,
    /// Live handshake.
    Validate,
}

/// What happened to one non-blank record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    /// 1-based line or row number.
    pub line: usize,
    /// The record as read.
    pub raw_line: String,
    /// Credential produced, present for successes and validation failures.
    pub parsed: Option<RelayCredential>,
    /// Why the record failed.
    pub error: Option<String>,
    /// Last stage reached.
    pub stage: ImportStage,
    /// Non-fatal note, e.g. a guessed host.
    pub warning: Option<String>,
}

impl ImportOutcome {
    fn failed(record: Record, stage: ImportStage, error: String) -> Self {
        Self {
            line: record.line_no,
            raw_line: record.raw,
            parsed: None,
            error: Some(error),
            stage,
            warning: None,
        }
    }

    /// Whether the record produced a usable credential.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none() && self.parsed.is_some()
    }
}

/// Aggregate result of one import.
///
/// `total == success + failed`, and `total` is the number of non-blank
/// records examined.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBatchResult {
    /// Records examined.
    pub total: usize,
    /// Records that produced a credential.
    pub success: usize,
    /// Records that did not.
    pub failed: usize,
    /// Human-readable failures, bounded.
    pub errors: Vec<String>,
    /// Credentials produced, in file order.
    pub configs: Vec<RelayCredential>,
    /// Per-record detail.
    #[serde(skip)]
    pub outcomes: Vec<ImportOutcome>,
}

impl ImportBatchResult {
    fn from_outcomes(outcomes: Vec<ImportOutcome>, max_errors: usize) -> Self {
        let mut errors = Vec::new();
        let mut overflow = 0usize;
        let mut configs = Vec::new();

        for outcome in &outcomes {
            match (&outcome.error, &outcome.parsed) {
                (Some(error), _) if errors.len() < max_errors => {
                    errors.push(format!("line {}: {error}", outcome.line));
                }
                (Some(_), _) => overflow += 1,
                (None, Some(credential)) => configs.push(credential.clone()),
                (None, None) => {}
            }
        }
        if overflow > 0 {
            errors.push(format!("… and {overflow} more errors"));
        }

        let total = outcomes.len();
        let success = configs.len();
        Self {
            total,
            success,
            failed: total - success,
            errors,
            configs,
            outcomes,
        }
    }
}

/// Reads uploaded files into unvalidated relays.
#[derive(Debug, Clone)]
pub struct BatchImporter {
    resolver: ProviderResolver,
    max_bytes: usize,
    max_errors: usize,
    default_quota: Option<u32>,
    delimiter: Option<u8>,
}

impl BatchImporter {
    /// Creates an importer using the limits in `config`.
    #[must_use]
    pub const fn new(config: &CoreConfig) -> Self {
        Self {
            resolver: ProviderResolver::new(),
            max_bytes: config.max_import_bytes,
            max_errors: config.max_reported_errors,
            default_quota: config.default_daily_quota,
            delimiter: None,
        }
    }

    /// Splits CSV input on `delimiter` instead of detecting it.
    #[must_use]
    pub const fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    /// Parses and resolves every non-blank record of a file.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] only for oversized or unreadable files.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub fn import(&self, bytes: &[u8], hint: FormatHint) -> Result<ImportBatchResult, ImportError> {
        if bytes.len() > self.max_bytes {
            return Err(ImportError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }

        let records = read_records(bytes, hint, self.delimiter)?;
        let outcomes = records.into_iter().map(|r| self.import_record(r)).collect();
        let result = ImportBatchResult::from_outcomes(outcomes, self.max_errors);
        info!(
            total = result.total,
            success = result.success,
            failed = result.failed,
            "Imported credentials"
        );
        Ok(result)
    }

    /// Imports a file, then validates every credential it produced.
    ///
    /// Credentials that fail the handshake move to the failed side with
    /// stage `validate`.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] only for oversized or unreadable files.
    pub async fn import_and_validate(
        &self,
        bytes: &[u8],
        hint: FormatHint,
        validator: &RelayValidator,
    ) -> Result<ImportBatchResult, ImportError> {
        let imported = self.import(bytes, hint)?;
        let report = validator.validate_all(imported.configs).await;

        let mut verdicts: HashMap<RelayId, (RelayCredential, Option<String>)> = report
            .valid_configs
            .into_iter()
            .map(|c| (c.id, (c, None)))
            .chain(
                report
                    .invalid_configs
                    .into_iter()
                    .map(|i| (i.config.id, (i.config, Some(i.error)))),
            )
            .collect();

        let outcomes = imported
            .outcomes
            .into_iter()
            .map(|mut outcome| {
                if outcome.error.is_none()
                    && let Some(id) = outcome.parsed.as_ref().map(|c| c.id)
                    && let Some((checked, error)) = verdicts.remove(&id)
                {
                    outcome.stage = ImportStage::Validate;
                    outcome.error = error.map(|e| format!("validation failed: {e}"));
                    outcome.parsed = Some(checked);
                }
                outcome
            })
            .collect();

        Ok(ImportBatchResult::from_outcomes(outcomes, self.max_errors))
    }

    fn import_record(&self, record: Record) -> ImportOutcome {
        let parsed = match &record.fields {
            Some(fields) => parse_columns(&fields.username, &fields.secret),
            None => parse_line(&record.raw),
        };
        let mut provisional = match parsed {
            Ok(p) => p,
            Err(e) => {
                debug!(line = record.line_no, "Unparseable record");
                return ImportOutcome::failed(record, ImportStage::Parse, e.to_string());
            }
        };

        if let Err(e) = apply_columns(&record, &mut provisional) {
            return ImportOutcome::failed(record, ImportStage::Resolve, e);
        }

        match self.resolver.resolve(provisional) {
            Ok(resolution) => {
                let mut credential = resolution.credential.with_daily_quota(self.default_quota);
                if let Some(name) = record.fields.as_ref().and_then(|f| f.from_name.clone()) {
                    credential.from_name = name;
                }
                ImportOutcome {
                    line: record.line_no,
                    raw_line: record.raw,
                    parsed: Some(credential),
                    error: None,
                    stage: ImportStage::Resolve,
                    warning: resolution.ambiguity.map(|a| a.to_string()),
                }
            }
            Err(e) => ImportOutcome::failed(record, ImportStage::Resolve, e.to_string()),
        }
    }
}

/// Copies explicit host and port columns onto the provisional credential.
fn apply_columns(record: &Record, provisional: &mut ProvisionalCredential) -> Result<(), String> {
    let Some(fields) = &record.fields else {
        return Ok(());
    };
    if let Some(host) = &fields.host {
        provisional.host = Some(host.to_ascii_lowercase());
    }
    if let Some(port) = &fields.port {
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port '{port}'"))?;
        if port == Security::Tls.default_port() {
            provisional.security = Some(Security::Tls);
        }
        provisional.port = Some(port);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::ProviderKind;

    fn importer() -> BatchImporter {
        BatchImporter::new(&CoreConfig::default())
    }

    #[test]
    fn mixed_file_counts_every_non_blank_line() {
        let text = "alice@gmail.com:Secret123\n\nnot-an-email\n   \nbob@unknownhost.biz|Pass!456\n";
        let result = importer().import(text.as_bytes(), FormatHint::Txt).unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.success, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("not-an-email"));
        assert_eq!(result.configs[0].provider_kind(), ProviderKind::Webmail);
        assert_eq!(result.configs[0].daily_quota, Some(500));
        assert!(result.outcomes[2].warning.is_some());
    }

    #[test]
    fn oversized_file_is_rejected_before_parsing() {
        let config = CoreConfig {
            max_import_bytes: 10,
            ..CoreConfig::default()
        };
        let err = BatchImporter::new(&config)
            .import(b"alice@gmail.com:Secret123", FormatHint::Txt)
            .unwrap_err();
        assert_eq!(err, ImportError::TooLarge { size: 25, limit: 10 });
    }

    #[test]
    fn errors_are_bounded_with_summary() {
        let config = CoreConfig {
            max_reported_errors: 2,
            ..CoreConfig::default()
        };
        let text = "bad1\nbad2\nbad3\nbad4\nbad5\n";
        let result = BatchImporter::new(&config).import(text.as_bytes(), FormatHint::Txt).unwrap();
        assert_eq!(result.failed, 5);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(result.errors[2], "… and 3 more errors");
    }

    #[test]
    fn csv_columns_override_host_and_port() {
        let csv = "email;password;host;port;from_name\nalice@gmail.com;pw;relay.corp.io;465;Alice A.\nbob@corp.io;pw;;abc;\n";
        let result = importer().import(csv.as_bytes(), FormatHint::Csv).unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.success, 1);
        let alice = &result.configs[0];
        assert_eq!(alice.provider_kind(), ProviderKind::Smtp);
        assert!(alice.use_implicit_tls());
        assert_eq!(alice.from_name, "Alice A.");
        assert_eq!(result.outcomes[1].stage, ImportStage::Resolve);
        assert!(result.errors[0].contains("invalid port"));
    }

    #[test]
    fn declared_delimiter_keeps_commas_in_secrets() {
        let csv = "alice@gmail.com|pa,ss,wo,rd\nbob@corp.io|x\n";
        let detected = importer().import(csv.as_bytes(), FormatHint::Csv).unwrap();
        assert_eq!(detected.success, 2);
        assert_ne!(detected.configs[0].secret, "pa,ss,wo,rd");

        let declared = importer()
            .with_delimiter(b'|')
            .import(csv.as_bytes(), FormatHint::Csv)
            .unwrap();
        assert_eq!(declared.total, 2);
        assert_eq!(declared.success, 2);
        assert_eq!(declared.configs[0].secret, "pa,ss,wo,rd");
        assert_eq!(declared.configs[1].username, "bob@corp.io");
    }

    #[test]
    fn serializes_import_contract() {
        let result = importer().import(b"a@gmail.com:pw\n", FormatHint::Auto).unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["success"], 1);
        assert!(json.get("outcomes").is_none());
        assert_eq!(json["configs"][0]["isValid"], false);
    }
}
