//! License policy seam. Verification internals live outside this repo; the
//! server only consults expiration and seat checks and forwards their
//! messages.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::errors::FriendlyError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LicenseType {
    Customer,
    Trial,
}

#[derive(Clone, Debug)]
pub struct LicenseTerms {
    pub customer: String,
    pub license_type: LicenseType,
    pub seats: usize,
    pub expiry_time: DateTime<Utc>,
}

pub trait LicensePolicy: Send + Sync {
    fn terms(&self) -> LicenseTerms;

    /// Warnings to surface to the user; an error means the license is
    /// expired and the request must be refused.
    fn check_expiration(&self) -> Result<Vec<String>>;

    /// Warnings to surface given the number of seats that would be in use;
    /// an error refuses the workspace.
    fn check_seats(&self, seats_in_use: usize) -> Result<Vec<String>>;
}

/// Policy backed by fixed terms, loaded from settings. Customers over their
/// seat count get a grace warning; trials are cut off.
pub struct StaticLicense {
    terms: LicenseTerms,
}

const EXPIRY_WARNING_WINDOW_DAYS: i64 = 7;

impl StaticLicense {
    pub fn new(terms: LicenseTerms) -> Self {
        Self { terms }
    }

    /// A license that never refuses anything; used when no license is
    /// configured.
    pub fn permissive() -> Self {
        Self {
            terms: LicenseTerms {
                customer: "unlicensed".to_string(),
                license_type: LicenseType::Trial,
                seats: usize::MAX,
                expiry_time: Utc::now() + Duration::days(365 * 100),
            },
        }
    }
}

impl LicensePolicy for StaticLicense {
    fn terms(&self) -> LicenseTerms {
        self.terms.clone()
    }

    fn check_expiration(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        if now > self.terms.expiry_time {
            return Err(FriendlyError::new(format!(
                "The license for {} expired on {}. Please contact your Kelda administrator.",
                self.terms.customer,
                self.terms.expiry_time.format("%Y-%m-%d")
            ))
            .into());
        }
        let remaining = self.terms.expiry_time - now;
        if remaining < Duration::days(EXPIRY_WARNING_WINDOW_DAYS) {
            return Ok(vec![format!(
                "The license for {} expires in {} day(s).",
                self.terms.customer,
                remaining.num_days().max(0) + 1
            )]);
        }
        Ok(vec![])
    }

    fn check_seats(&self, seats_in_use: usize) -> Result<Vec<String>> {
        if seats_in_use <= self.terms.seats {
            return Ok(vec![]);
        }
        match self.terms.license_type {
            LicenseType::Trial => Err(FriendlyError::new(format!(
                "The trial license for {} allows {} seat(s), and {} are in use. \
                 Please contact Kelda to upgrade.",
                self.terms.customer, self.terms.seats, seats_in_use
            ))
            .into()),
            LicenseType::Customer => Ok(vec![format!(
                "{} seat(s) are licensed but {} are in use. Please contact your \
                 Kelda administrator to add seats.",
                self.terms.seats, seats_in_use
            )]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(license_type: LicenseType, seats: usize, expires_in: Duration) -> LicenseTerms {
        LicenseTerms {
            customer: "acme".to_string(),
            license_type,
            seats,
            expiry_time: Utc::now() + expires_in,
        }
    }

    #[test]
    fn valid_license_passes_silently() {
        let license = StaticLicense::new(terms(LicenseType::Customer, 5, Duration::days(30)));
        assert!(license.check_expiration().unwrap().is_empty());
        assert!(license.check_seats(5).unwrap().is_empty());
    }

    #[test]
    fn expiring_license_warns() {
        let license = StaticLicense::new(terms(LicenseType::Customer, 5, Duration::days(2)));
        let messages = license.check_expiration().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("expires in"));
    }

    #[test]
    fn expired_license_refuses() {
        let license = StaticLicense::new(terms(LicenseType::Customer, 5, Duration::days(-1)));
        let err = license.check_expiration().unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn customer_over_seats_gets_a_grace_warning() {
        let license = StaticLicense::new(terms(LicenseType::Customer, 2, Duration::days(30)));
        let messages = license.check_seats(3).unwrap();
        assert!(messages[0].contains("2 seat(s) are licensed"));
    }

    #[test]
    fn trial_over_seats_is_refused() {
        let license = StaticLicense::new(terms(LicenseType::Trial, 2, Duration::days(30)));
        assert!(license.check_seats(3).is_err());
    }
}
