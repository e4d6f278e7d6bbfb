//! Shared mocks for parser and channel tests.

use crate::scan::{AtCallbacks, ScanDecision};

/// Callback set that classifies lines starting with a fixed prefix as URCs
/// and records everything dispatched to it.
pub struct UrcRecorder {
    prefix: &'static [u8],
    urcs: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl UrcRecorder {
    pub fn recognizing(prefix: &'static [u8]) -> Self {
        Self {
            prefix,
            urcs: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn urcs(&self) -> Vec<Vec<u8>> {
        self.urcs.lock().unwrap().clone()
    }
}

impl AtCallbacks for UrcRecorder {
    fn scan_line(&self, line: &[u8]) -> ScanDecision {
        if line.starts_with(self.prefix) {
            ScanDecision::Urc
        } else {
            ScanDecision::Unknown
        }
    }

    fn handle_urc(&self, line: &[u8]) {
        self.urcs.lock().unwrap().push(line.to_vec());
    }
}
