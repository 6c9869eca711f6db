//! Session admission.
//!
//! A process session opens only against the date-derived session secret
//! `myfs-YYYYMMDD` (local date). The secret is an access gate, not a
//! cryptographic key: it is never stored and never derived from. Volume
//! operations demand a [`Session`] value so authority is always passed
//! explicitly rather than held in process-wide state.

use chrono::{Local, NaiveDate};
use subtle::ConstantTimeEq;

use crate::error::{MyfsError, MyfsResult};

/// Proof that the caller passed the session gate.
#[derive(Debug, Clone)]
pub struct Session {
    opened_on: NaiveDate,
}

impl Session {
    /// Opens a session for today's local date.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::AuthFailed`] if the supplied secret does not
    /// match today's expected value.
    pub fn open(session_secret: &str) -> MyfsResult<Self> {
        Self::open_for_date(session_secret, Local::now().date_naive())
    }

    /// Opens a session for an explicit date. Exposed for callers that pin
    /// the clock (and for tests).
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::AuthFailed`] on mismatch.
    pub fn open_for_date(session_secret: &str, date: NaiveDate) -> MyfsResult<Self> {
        let expected = expected_secret(date);
        let supplied = session_secret.as_bytes();
        if supplied.len() != expected.len() {
            return Err(MyfsError::AuthFailed);
        }
        if bool::from(supplied.ct_eq(expected.as_bytes())) {
            Ok(Self { opened_on: date })
        } else {
            Err(MyfsError::AuthFailed)
        }
    }

    /// The local date this session was admitted for.
    #[must_use]
    pub const fn opened_on(&self) -> NaiveDate {
        self.opened_on
    }
}

/// The session secret expected on a given date.
#[must_use]
pub fn expected_secret(date: NaiveDate) -> String {
    format!("myfs-{}", date.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_expected_secret_format() {
        assert_eq!(expected_secret(date(2024, 3, 7)), "myfs-20240307");
    }

    #[test]
    fn test_correct_secret_admits() {
        let session = Session::open_for_date("myfs-20240307", date(2024, 3, 7)).unwrap();
        assert_eq!(session.opened_on(), date(2024, 3, 7));
    }

    #[test]
    fn test_wrong_date_rejected() {
        assert!(matches!(
            Session::open_for_date("myfs-20240306", date(2024, 3, 7)),
            Err(MyfsError::AuthFailed)
        ));
    }

    #[test]
    fn test_malformed_secret_rejected() {
        for secret in ["", "myfs-", "myfs20240307", "MYFS-20240307", "myfs-2024030"] {
            assert!(matches!(
                Session::open_for_date(secret, date(2024, 3, 7)),
                Err(MyfsError::AuthFailed)
            ));
        }
    }

    #[test]
    fn test_today_round_trips() {
        let today = Local::now().date_naive();
        let session = Session::open(&expected_secret(today)).unwrap();
        assert_eq!(session.opened_on(), today);
    }
}
