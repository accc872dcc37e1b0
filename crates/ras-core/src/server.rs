//! Server identity and version checks.
//!
//! The store root answers `GET /` with a welcome document such as
//! `{"couchdb": "Welcome", "version": "3.3.3"}`. A store that does not
//! identify itself as the expected product, or reports a version below the
//! configured minimum, is rejected before any run document is written.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{RasError, Result};

/// Field of the root document that carries the product identity.
pub const PRODUCT_FIELD: &str = "couchdb";

/// A `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ServerVersion {
    type Err = RasError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RasError::Validation(format!("unparsable server version '{}'", s));
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the store root reported about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub product: String,
    pub version: ServerVersion,
}

/// What a server must report to be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequirements {
    pub product: String,
    pub min_version: ServerVersion,
}

impl Default for ServerRequirements {
    fn default() -> Self {
        Self {
            product: "Welcome".to_string(),
            min_version: ServerVersion::new(3, 3, 0),
        }
    }
}

impl ServerRequirements {
    /// Check a root document against these requirements.
    pub fn validate(&self, body: &Value) -> Result<ServerInfo> {
        let product = body
            .get(PRODUCT_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RasError::Validation(format!("root document has no '{}' field", PRODUCT_FIELD))
            })?;
        if product != self.product {
            return Err(RasError::Validation(format!(
                "expected product '{}' but server reported '{}'",
                self.product, product
            )));
        }

        let version: ServerVersion = body
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| RasError::Validation("root document has no version".to_string()))?
            .parse()?;
        if version < self.min_version {
            return Err(RasError::Validation(format!(
                "server version {} is below the minimum {}",
                version, self.min_version
            )));
        }

        Ok(ServerInfo {
            product: product.to_string(),
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_expected_product_and_version() {
        let info = ServerRequirements::default()
            .validate(&json!({"couchdb": "Welcome", "version": "3.3.3"}))
            .unwrap();
        assert_eq!(info.version, ServerVersion::new(3, 3, 3));
    }

    #[test]
    fn test_rejects_wrong_product() {
        let err = ServerRequirements::default()
            .validate(&json!({"couchdb": "Hello", "version": "3.3.3"}))
            .unwrap_err();
        assert!(matches!(err, RasError::Validation(_)));
    }

    #[test]
    fn test_rejects_missing_product() {
        let err = ServerRequirements::default()
            .validate(&json!({"version": "3.3.3"}))
            .unwrap_err();
        assert!(matches!(err, RasError::Validation(_)));
    }

    #[test]
    fn test_rejects_unparsable_version() {
        for bad in ["1.2..3", "3.3", "3.x.1", "", "3.3.3.3"] {
            let err = ServerRequirements::default()
                .validate(&json!({"couchdb": "Welcome", "version": bad}))
                .unwrap_err();
            assert!(matches!(err, RasError::Validation(_)), "{}", bad);
        }
    }

    #[test]
    fn test_rejects_old_version() {
        let err = ServerRequirements::default()
            .validate(&json!({"couchdb": "Welcome", "version": "2.3.1"}))
            .unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[test]
    fn test_version_ordering() {
        let v: ServerVersion = "3.10.0".parse().unwrap();
        assert!(v > ServerVersion::new(3, 9, 9));
        assert_eq!(v.to_string(), "3.10.0");
    }
}
