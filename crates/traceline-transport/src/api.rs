// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the report backend: batch uploads, session refresh and
//! the self-observability metrics report.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

use traceline_core::Config;

use crate::error::TransportError;
use crate::session::SessionResponse;

pub const REPORT_CONTENT_TYPE: &str = "application/x-traceline-report";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ReportClient {
    http: Client,
    report_url: String,
    session_url: String,
    metrics_url: String,
    auth_token: Option<String>,
}

impl ReportClient {
    pub fn new(config: &Config) -> Result<ReportClient, TransportError> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(ReportClient {
            http,
            report_url: config.report_url(),
            session_url: config.session_url(),
            metrics_url: config.metrics_url(),
            auth_token: config.auth_token.clone(),
        })
    }

    /// Exchange the long-lived agent credential for a session token.
    pub fn fetch_session(&self) -> Result<SessionResponse, TransportError> {
        let auth_token = self
            .auth_token
            .as_deref()
            .ok_or_else(|| TransportError::Rejected(401))?;

        let response = self
            .http
            .get(&self.session_url)
            .header(AUTHORIZATION, auth_token)
            .send()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        triage(response.status())?;
        response
            .json::<SessionResponse>()
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    /// Upload one serialized batch, authorized by a session token.
    pub fn post_report(&self, session_token: &str, body: Vec<u8>) -> Result<(), TransportError> {
        debug!(bytes = body.len(), "posting batch report");

        let response = self
            .http
            .post(&self.report_url)
            .header(AUTHORIZATION, session_token)
            .header(CONTENT_TYPE, REPORT_CONTENT_TYPE)
            .body(body)
            .send()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        triage(response.status())
    }

    /// Post the flat self-metrics report, authorized by the agent token.
    pub fn post_metrics(&self, report: &serde_json::Value) -> Result<(), TransportError> {
        let auth_token = self
            .auth_token
            .as_deref()
            .ok_or_else(|| TransportError::Rejected(401))?;

        let response = self
            .http
            .post(&self.metrics_url)
            .header(AUTHORIZATION, auth_token)
            .json(report)
            .send()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        triage(response.status())
    }
}

/// 2xx is success, 4xx a permanent rejection, anything else transient.
fn triage(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        Err(TransportError::Rejected(status.as_u16()))
    } else {
        Err(TransportError::Unavailable(status.as_u16()))
    }
}
