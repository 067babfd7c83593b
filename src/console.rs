//! Boot progress output
//!
//! One line per service action on the console:
//!
//! ```text
//! Starting OSPF daemon ...................... [ OK ]
//! Stopping Legacy service ................... [FAIL]
//! Killing Unresponsive daemon ............... [WARN]
//! ```
//!
//! Progress is suppressed for records without a description and in
//! single-user mode; log lines carry the same information either way.

use std::io::Write;

const WIDTH: usize = 60;

/// Console progress printer
#[derive(Debug)]
pub struct Console {
    enabled: bool,
}

impl Console {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Begin a progress line, e.g. `desc("Starting ", "SSH daemon")`
    pub fn desc(&self, action: &str, desc: &str) {
        if !self.enabled || desc.is_empty() {
            return;
        }
        let label = format!("{}{} ", action, desc);
        let dots = ".".repeat(WIDTH.saturating_sub(label.len()));
        print!("{}{} ", label, dots);
        let _ = std::io::stdout().flush();
    }

    /// Finish a progress line: 0 prints `[ OK ]`, anything else `[FAIL]`
    pub fn result(&self, rc: i32) {
        if !self.enabled {
            return;
        }
        if rc == 0 {
            println!("[ OK ]");
        } else {
            println!("[FAIL]");
        }
    }

    /// Finish a progress line with `[WARN]`, used for SIGKILL escalation
    pub fn warn(&self) {
        if !self.enabled {
            return;
        }
        println!("[WARN]");
    }
}
