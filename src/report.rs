//! Progress reporting.
//!
//! The engine never prints directly; runners and the scheduler talk to a
//! [`Reporter`]. The default [`ConsoleReporter`] renders one line per action
//! the way the CLI expects; [`NullReporter`] keeps tests quiet.

use std::{fmt, io::Write, sync::Mutex};
use yansi::Paint;

/// How an action ended, for reporting purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionDisposition {
    Success,
    TestPassed,
    TestFailed,
    Failed,
    Cancelled,
}

/// Receiver for build progress events. Implementations must tolerate calls
/// from multiple worker threads.
pub trait Reporter: fmt::Debug + Send + Sync {
    /// An action started executing: `verb: name`.
    fn action_started(&self, verb: &str, name: &str);

    /// A short status note attached to a running action (e.g. the value an
    /// environment lookup resolved to).
    fn action_status(&self, name: &str, text: &str);

    /// An action finished; `log` carries its buffered diagnostics, emitted
    /// here in one piece so parallel actions never interleave.
    fn action_finished(&self, verb: &str, name: &str, disposition: ActionDisposition, log: &[u8]);

    /// The caching runner proved the action unchanged and skipped it.
    fn no_changes(&self, verb: &str, name: &str);
}

/// Reporter that writes colored lines to stderr.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    // One lock around the stream keeps each line atomic.
    sink: Mutex<()>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&self, text: String) {
        let _guard = self.sink.lock().unwrap();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{text}");
    }
}

impl Reporter for ConsoleReporter {
    fn action_started(&self, verb: &str, name: &str) {
        self.line(format!("{} {name}", Paint::blue(format!("{verb}:"))));
    }

    fn action_status(&self, name: &str, text: &str) {
        self.line(format!("  {name}: {}", Paint::blue(text)));
    }

    fn action_finished(&self, verb: &str, name: &str, disposition: ActionDisposition, log: &[u8]) {
        let prefix = match disposition {
            ActionDisposition::Success => None,
            ActionDisposition::TestPassed => Some(Paint::green("PASS: ").bold()),
            ActionDisposition::TestFailed => Some(Paint::red("FAIL: ").bold()),
            ActionDisposition::Failed => Some(Paint::red("ERROR: ").bold()),
            ActionDisposition::Cancelled => Some(Paint::red("CANCEL: ").bold()),
        };
        let mut text = match prefix {
            Some(prefix) => format!("{prefix}{verb}: {name}"),
            None if log.is_empty() => return,
            None => format!("{verb}: {name}"),
        };
        if !log.is_empty() {
            let tail = String::from_utf8_lossy(log);
            text.push_str("\n  ");
            text.push_str(&tail.trim_end().replace('\n', "\n  "));
        }
        self.line(text);
    }

    fn no_changes(&self, verb: &str, name: &str) {
        self.line(format!("{} {verb}: {name}", Paint::blue("no changes:")));
    }
}

/// Reporter that drops everything.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn action_started(&self, _verb: &str, _name: &str) {}
    fn action_status(&self, _name: &str, _text: &str) {}
    fn action_finished(
        &self,
        _verb: &str,
        _name: &str,
        _disposition: ActionDisposition,
        _log: &[u8],
    ) {
    }
    fn no_changes(&self, _verb: &str, _name: &str) {}
}
