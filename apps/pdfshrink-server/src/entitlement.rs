//! Entitlement lookup
//!
//! The pipeline only sees a boolean; this module decides it from the
//! caller's e-mail address.

use std::collections::HashSet;

use crate::config::EntitlementConfig;

/// Source of truth for premium access.
pub trait EntitlementSource: Send + Sync {
    fn is_entitled(&self, email: Option<&str>) -> bool;
}

/// Premium addresses listed in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    premium: HashSet<String>,
    default_entitled: bool,
}

impl StaticEntitlements {
    pub fn from_config(config: &EntitlementConfig) -> Self {
        Self {
            premium: config
                .premium_emails
                .iter()
                .filter_map(|email| normalize_email(email))
                .collect(),
            default_entitled: config.default_entitled,
        }
    }
}

impl EntitlementSource for StaticEntitlements {
    fn is_entitled(&self, email: Option<&str>) -> bool {
        match email.and_then(normalize_email) {
            Some(email) if self.premium.contains(&email) => true,
            _ => self.default_entitled,
        }
    }
}

/// Trimmed, lowercased address, or `None` if blank.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim();
    if email.is_empty() {
        None
    } else {
        Some(email.to_lowercase())
    }
}
