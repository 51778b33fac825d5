//! Blocking client for the instance metadata service.
//!
//! Used for the on-instance precondition probe and for instance identity
//! (id, type, availability zone) that the cloud adapter needs to scope its
//! API calls. Speaks IMDSv2 when the token endpoint answers and falls back
//! to v1 otherwise.

use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};

const IMDS_BASE: &str = "http://169.254.169.254/latest";
const TOKEN_TTL_SECONDS: &str = "60";
const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

pub struct ImdsClient {
    http: reqwest::blocking::Client,
    base: String,
}

impl ImdsClient {
    pub fn new() -> Result<Self> {
        Self::with_base(IMDS_BASE)
    }

    pub fn with_base(base: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::Cloud(format!("metadata client: {e}")))?;
        Ok(ImdsClient {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn token(&self) -> Option<String> {
        self.http
            .put(format!("{}/api/token", self.base))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .ok()
            .filter(|resp| resp.status().is_success())
            .and_then(|resp| resp.text().ok())
    }

    /// Fetch one metadata path, e.g. `instance-id`.
    pub fn get(&self, path: &str) -> Result<String> {
        let url = format!("{}/meta-data/{}", self.base, path);
        let mut request = self.http.get(&url);
        if let Some(token) = self.token() {
            request = request.header("X-aws-ec2-metadata-token", token);
        }
        let resp = request
            .send()
            .map_err(|e| Error::Cloud(format!("metadata service: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Cloud(format!(
                "metadata service returned {} for {path}",
                resp.status()
            )));
        }
        resp.text()
            .map(|body| body.trim().to_string())
            .map_err(|e| Error::Cloud(format!("metadata service: {e}")))
    }

    /// Cheap liveness probe: can the metadata service be reached at all?
    pub fn available(&self) -> bool {
        let ok = self.get("instance-id").is_ok();
        debug!("metadata service probe: available={ok}");
        ok
    }

    pub fn identity(&self) -> Result<InstanceIdentity> {
        Ok(InstanceIdentity {
            instance_id: self.get("instance-id")?,
            instance_type: self.get("instance-type")?,
            availability_zone: self.get("placement/availability-zone")?,
        })
    }

    /// VPC of the instance's primary interface.
    pub fn vpc_id(&self) -> Result<String> {
        let mac = self.get("mac")?;
        self.get(&format!("network/interfaces/macs/{mac}/vpc-id"))
    }
}

#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub instance_type: String,
    pub availability_zone: String,
}

impl InstanceIdentity {
    /// Region is the availability zone minus its trailing zone letters.
    pub fn region(&self) -> &str {
        self.availability_zone
            .trim_end_matches(|c: char| c.is_ascii_alphabetic())
    }
}
