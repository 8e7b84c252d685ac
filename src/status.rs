//! Runtime status surfaced on the dashboard.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::qr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    /// The client finished pairing and can send.
    pub ready: bool,
    pub last_error: Option<String>,
    pub last_qr: Option<String>,
    pub last_qr_at: Option<DateTime<Utc>>,
    /// `last_qr` rendered for the browser. `None` if rendering failed.
    pub qr_data_url: Option<String>,
}

impl Status {
    pub fn set_qr(&mut self, code: &str) {
        self.last_qr = Some(code.to_string());
        self.last_qr_at = Some(Utc::now());
        self.qr_data_url = match qr::to_data_url(code) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Failed to render QR code: {e}");
                None
            }
        };
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    pub fn set_disconnected(&mut self, reason: &str) {
        self.ready = false;
        self.record_error(format!("disconnected: {reason}").trim().to_string());
    }

    pub fn set_auth_failure(&mut self, message: &str) {
        self.record_error(format!("auth_failure: {message}").trim().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_is_rendered() {
        let mut status = Status::default();
        status.set_qr("2@pairing-code");
        assert_eq!(status.last_qr.as_deref(), Some("2@pairing-code"));
        assert!(status.last_qr_at.is_some());
        assert!(status.qr_data_url.unwrap().starts_with("data:image/svg+xml;base64,"));
    }

    #[test]
    fn test_disconnect_clears_ready() {
        let mut status = Status::default();
        status.set_ready();
        status.set_disconnected("NAVIGATION");
        assert!(!status.ready);
        assert_eq!(status.last_error.as_deref(), Some("disconnected: NAVIGATION"));
    }

    #[test]
    fn test_empty_reasons_are_trimmed() {
        let mut status = Status::default();
        status.set_auth_failure("");
        assert_eq!(status.last_error.as_deref(), Some("auth_failure:"));
    }
}
