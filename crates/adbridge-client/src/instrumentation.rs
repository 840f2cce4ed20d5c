//! Parsing of `am instrument -r` output
//!
//! With `-r` the instrumentation prints raw result bundles:
//!
//! ```text
//! INSTRUMENTATION_STATUS: class=com.example.FooTest
//! INSTRUMENTATION_STATUS: test=testBar
//! INSTRUMENTATION_STATUS: numtests=3
//! INSTRUMENTATION_STATUS_CODE: 1
//! ```
//!
//! Each `INSTRUMENTATION_STATUS_CODE` closes one bundle. A value may run
//! over several lines; lines without a known prefix continue the previous
//! value. [`InstrumentationResultParser`] turns the stream into
//! [`TestRunListener`] callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adbridge_core::prelude::*;

use crate::shell::ShellOutputReceiver;

const STATUS_PREFIX: &str = "INSTRUMENTATION_STATUS: ";
const STATUS_CODE_PREFIX: &str = "INSTRUMENTATION_STATUS_CODE: ";
const RESULT_PREFIX: &str = "INSTRUMENTATION_RESULT: ";
const CODE_PREFIX: &str = "INSTRUMENTATION_CODE: ";
const FAILED_PREFIX: &str = "INSTRUMENTATION_FAILED: ";
const TIME_PREFIX: &str = "Time: ";

const KEY_TEST: &str = "test";
const KEY_CLASS: &str = "class";
const KEY_STACK: &str = "stack";
const KEY_NUMTESTS: &str = "numtests";
const KEY_ERROR: &str = "Error";
const KEY_SHORTMSG: &str = "shortMsg";

const CODE_START: i32 = 1;
const CODE_IN_PROGRESS: i32 = 2;
const CODE_OK: i32 = 0;
const CODE_ERROR: i32 = -1;
const CODE_FAILURE: i32 = -2;

/// Reported when the command printed nothing the parser recognised.
pub const NO_TEST_RESULTS_MSG: &str = "No test results";

/// One test method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestIdentifier {
    pub class_name: String,
    pub test_name: String,
}

impl TestIdentifier {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }
}

impl std::fmt::Display for TestIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// How a test failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFailure {
    /// An assertion failed.
    Failure,
    /// The test threw, or never finished.
    Error,
}

/// Receives the progress of one instrumentation run.
///
/// Callbacks arrive in run order: `test_run_started`, then per test
/// `test_started`, an optional `test_failed` and `test_ended`, and finally
/// `test_run_ended` (or `test_run_stopped` when cancelled).
/// `test_run_failed` may arrive at any point before the end.
pub trait TestRunListener: Send {
    fn test_run_started(&mut self, _test_count: u32) {}

    fn test_started(&mut self, _test: &TestIdentifier) {}

    fn test_failed(&mut self, _status: TestFailure, _test: &TestIdentifier, _trace: &str) {}

    fn test_ended(&mut self, _test: &TestIdentifier) {}

    fn test_run_failed(&mut self, _message: &str) {}

    fn test_run_stopped(&mut self, _elapsed: Duration) {}

    fn test_run_ended(&mut self, _elapsed: Duration) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Status,
    Result,
}

/// Fields collected for the bundle that the next status code closes.
#[derive(Debug, Default)]
struct Bundle {
    test_name: Option<String>,
    class_name: Option<String>,
    stack: Option<String>,
    num_tests: Option<u32>,
}

/// Shell receiver that reports `am instrument -r` output to a listener.
pub struct InstrumentationResultParser<'a> {
    listener: &'a mut dyn TestRunListener,
    cancelled: Arc<AtomicBool>,

    current_key: Option<(Section, String)>,
    current_value: String,
    bundle: Bundle,

    saw_output: bool,
    run_started: bool,
    run_failed: bool,
    finished: bool,
    tests_expected: u32,
    tests_run: u32,
    current_test: Option<TestIdentifier>,
    elapsed: Duration,
}

impl<'a> InstrumentationResultParser<'a> {
    pub fn new(listener: &'a mut dyn TestRunListener) -> Self {
        Self::with_cancel_flag(listener, Arc::new(AtomicBool::new(false)))
    }

    /// Parser that stops the command once `cancelled` is set.
    pub fn with_cancel_flag(
        listener: &'a mut dyn TestRunListener,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            listener,
            cancelled,
            current_key: None,
            current_value: String::new(),
            bundle: Bundle::default(),
            saw_output: false,
            run_started: false,
            run_failed: false,
            finished: false,
            tests_expected: 0,
            tests_run: 0,
            current_test: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Tests that reached `test_ended`.
    pub fn tests_run(&self) -> u32 {
        self.tests_run
    }

    /// Report the run as stopped after a cancelled command.
    pub fn finish_cancelled(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.submit_current_key();
        self.listener.test_run_stopped(self.elapsed);
    }

    fn process_line(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix(STATUS_CODE_PREFIX) {
            self.submit_current_key();
            self.saw_output = true;
            self.status_code(rest.trim());
        } else if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
            self.submit_current_key();
            self.saw_output = true;
            self.start_key(Section::Status, rest);
        } else if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
            self.submit_current_key();
            self.saw_output = true;
            self.start_key(Section::Result, rest);
        } else if line.starts_with(CODE_PREFIX) || line.starts_with(FAILED_PREFIX) {
            self.submit_current_key();
            self.saw_output = true;
        } else if let Some(rest) = line.strip_prefix(TIME_PREFIX) {
            self.submit_current_key();
            self.parse_time(rest.trim());
        } else if self.current_key.is_some() {
            self.current_value.push_str("\r\n");
            self.current_value.push_str(line);
        } else {
            trace!("Ignoring instrumentation output: {}", line);
        }
    }

    fn start_key(&mut self, section: Section, rest: &str) {
        match rest.split_once('=') {
            Some((key, value)) => {
                self.current_key = Some((section, key.to_string()));
                self.current_value = value.to_string();
            }
            None => debug!("Malformed instrumentation line: {}", rest),
        }
    }

    fn submit_current_key(&mut self) {
        let Some((section, key)) = self.current_key.take() else {
            return;
        };
        let value = std::mem::take(&mut self.current_value);
        match (section, key.as_str()) {
            (Section::Status, KEY_TEST) => self.bundle.test_name = Some(value),
            (Section::Status, KEY_CLASS) => self.bundle.class_name = Some(value),
            (Section::Status, KEY_STACK) => self.bundle.stack = Some(value),
            (Section::Status, KEY_NUMTESTS) => match value.trim().parse() {
                Ok(count) => self.bundle.num_tests = Some(count),
                Err(_) => debug!("Unparseable test count: {}", value),
            },
            (_, KEY_ERROR) | (_, KEY_SHORTMSG) => self.report_run_failed(value.trim()),
            _ => {}
        }
    }

    fn status_code(&mut self, raw: &str) {
        let bundle = std::mem::take(&mut self.bundle);
        let code: i32 = match raw.parse() {
            Ok(code) => code,
            Err(_) => {
                debug!("Unparseable instrumentation status code: {}", raw);
                return;
            }
        };

        if !self.run_started {
            if let Some(count) = bundle.num_tests {
                self.run_started = true;
                self.tests_expected = count;
                self.listener.test_run_started(count);
            }
        }

        let (Some(class_name), Some(test_name)) = (bundle.class_name, bundle.test_name) else {
            return;
        };
        let test = TestIdentifier::new(class_name, test_name);
        let trace = bundle.stack.unwrap_or_default();

        match code {
            CODE_START => {
                self.listener.test_started(&test);
                self.current_test = Some(test);
            }
            CODE_IN_PROGRESS => {}
            CODE_OK => self.end_test(&test),
            CODE_FAILURE => {
                self.listener.test_failed(TestFailure::Failure, &test, &trace);
                self.end_test(&test);
            }
            CODE_ERROR => {
                self.listener.test_failed(TestFailure::Error, &test, &trace);
                self.end_test(&test);
            }
            other => debug!("Unknown instrumentation status code {} for {}", other, test),
        }
    }

    fn end_test(&mut self, test: &TestIdentifier) {
        self.listener.test_ended(test);
        self.tests_run += 1;
        self.current_test = None;
    }

    /// `Time: 4.9` is the run's wall time in seconds.
    fn parse_time(&mut self, raw: &str) {
        match raw.replace(',', "").parse::<f64>() {
            Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                self.saw_output = true;
                self.elapsed = Duration::from_millis((seconds * 1000.0).round() as u64);
            }
            _ => debug!("Unparseable instrumentation time: {}", raw),
        }
    }

    fn report_run_failed(&mut self, message: &str) {
        if self.run_failed {
            return;
        }
        self.run_failed = true;
        info!("Instrumentation run failed: {}", message);
        self.listener.test_run_failed(message);
    }

    /// Report a run that ended because the command itself failed.
    ///
    /// A test that started but never ended is failed with `message` as the
    /// reason before the run is closed.
    pub fn handle_run_failed(&mut self, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.submit_current_key();
        if let Some(test) = self.current_test.take() {
            let trace = format!("Test failed to run to completion. Reason: '{message}'");
            self.listener.test_failed(TestFailure::Error, &test, &trace);
            self.end_test(&test);
        }
        self.start_run_if_unreported();
        self.report_run_failed(message);
        self.listener.test_run_ended(self.elapsed);
    }

    fn start_run_if_unreported(&mut self) {
        if !self.run_started {
            self.run_started = true;
            self.listener.test_run_started(0);
        }
    }

    fn done(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.submit_current_key();
        self.start_run_if_unreported();

        if !self.saw_output {
            self.report_run_failed(NO_TEST_RESULTS_MSG);
        } else if self.current_test.is_some() || self.tests_run < self.tests_expected {
            let message = format!(
                "Test run incomplete. Expected {} tests, received {}",
                self.tests_expected, self.tests_run
            );
            if let Some(test) = self.current_test.take() {
                let trace = format!("Test failed to run to completion. Reason: '{message}'");
                self.listener.test_failed(TestFailure::Error, &test, &trace);
                self.end_test(&test);
            }
            self.report_run_failed(&message);
        }
        self.listener.test_run_ended(self.elapsed);
    }
}

impl ShellOutputReceiver for InstrumentationResultParser<'_> {
    fn process_new_lines(&mut self, lines: &[String]) {
        for line in lines {
            self.process_line(line);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn flush(&mut self) {
        self.done();
    }
}
