use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::config::UploadTarget;
use crate::error::UploadError;
use crate::logging::Log;

/// Delivers a JSON body to an HTTP endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// POST `body` to `url`, returning the HTTP status code.
    ///
    /// # Errors
    ///
    /// Returns a message when the request could not be delivered at all.
    fn post_json(&self, url: &str, body: &str) -> Result<u16, String>;
}

/// [`Transport`] backed by a blocking `ureq` agent.
#[derive(Debug)]
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    /// A transport with a global timeout per request.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Transport for HttpTransport {
    fn post_json(&self, url: &str, body: &str) -> Result<u16, String> {
        self.agent
            .post(url)
            .header("Content-Type", "application/json")
            .send(body)
            .map(|response| response.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    format: &'static str,
    report: String,
}

/// Per-destination upload results.
#[derive(Debug, Default)]
pub struct UploadReport {
    /// Destinations that accepted the report.
    pub delivered: Vec<String>,
    /// Best-effort destinations that failed, with the reason.
    pub skipped: Vec<(String, UploadError)>,
}

/// Send the LCOV report to every destination.
///
/// Every destination is attempted, whatever happened to the ones before it.
/// Best-effort failures are logged as warnings and listed in the report.
///
/// # Errors
///
/// Returns the first failure of a destination marked `required`, including
/// a token variable that is not set, once all destinations were tried.
pub fn upload_all(
    targets: &[UploadTarget],
    lcov: &str,
    transport: &dyn Transport,
    vars: &BTreeMap<String, String>,
    log: &dyn Log,
) -> Result<UploadReport, UploadError> {
    let encoded = STANDARD.encode(lcov);
    let mut report = UploadReport::default();
    let mut required_failure = None;

    for target in targets {
        log.stage(&format!("Uploading coverage to {}", target.name));
        match upload_one(target, &encoded, transport, vars) {
            Ok(()) => {
                log.info(&format!("{}: delivered", target.name));
                report.delivered.push(target.name.clone());
            }
            Err(e) if target.required => {
                log.error(&e.to_string());
                required_failure.get_or_insert(e);
            }
            Err(e) => {
                log.warn(&format!("{e} (best effort, continuing)"));
                report.skipped.push((target.name.clone(), e));
            }
        }
    }
    required_failure.map_or(Ok(report), Err)
}

fn upload_one(
    target: &UploadTarget,
    encoded: &str,
    transport: &dyn Transport,
    vars: &BTreeMap<String, String>,
) -> Result<(), UploadError> {
    let token = target
        .token_env
        .as_ref()
        .map(|var| {
            vars.get(var)
                .filter(|t| !t.is_empty())
                .map(String::as_str)
                .ok_or_else(|| UploadError::MissingToken {
                    destination: target.name.clone(),
                    var: var.clone(),
                })
        })
        .transpose()?;
    let envelope = Envelope {
        name: &target.name,
        token,
        format: "lcov",
        report: encoded.to_string(),
    };
    let body = serde_json::to_string(&envelope).map_err(|e| UploadError::Transport {
        destination: target.name.clone(),
        message: e.to_string(),
    })?;

    let status = transport
        .post_json(&target.url, &body)
        .map_err(|message| UploadError::Transport {
            destination: target.name.clone(),
            message,
        })?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(UploadError::Rejected {
            destination: target.name.clone(),
            status,
        })
    }
}
