//! Instrumentation test runs
//!
//! [`RemoteTestRunner`] builds an `am instrument -w -r` command for one
//! test package and reports its output through an
//! [`InstrumentationResultParser`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adbridge_client::{InstrumentationResultParser, TestRunListener};
use adbridge_core::prelude::*;

use crate::device::Device;

pub const DEFAULT_RUNNER_NAME: &str = "android.test.InstrumentationTestRunner";

const CLASS_ARG: &str = "class";
const PACKAGE_ARG: &str = "package";
const LOG_ARG: &str = "log";
const DEBUG_ARG: &str = "debug";
const COVERAGE_ARG: &str = "coverage";
const SIZE_ARG: &str = "size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSize {
    Small,
    Medium,
    Large,
}

impl TestSize {
    pub fn as_arg(&self) -> &'static str {
        match self {
            TestSize::Small => "small",
            TestSize::Medium => "medium",
            TestSize::Large => "large",
        }
    }
}

/// One configured instrumentation run.
#[derive(Debug)]
pub struct RemoteTestRunner {
    package_name: String,
    runner_name: Option<String>,
    args: BTreeMap<String, String>,
    max_inactivity: Duration,
    cancelled: Arc<AtomicBool>,
}

impl RemoteTestRunner {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            runner_name: None,
            args: BTreeMap::new(),
            max_inactivity: Duration::ZERO,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_runner(package_name: impl Into<String>, runner_name: impl Into<String>) -> Self {
        let mut runner = Self::new(package_name);
        runner.runner_name = Some(runner_name.into());
        runner
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn runner_name(&self) -> &str {
        self.runner_name.as_deref().unwrap_or(DEFAULT_RUNNER_NAME)
    }

    pub fn set_class_name(&mut self, class_name: &str) {
        self.add_instrumentation_arg(CLASS_ARG, class_name);
    }

    pub fn set_class_names(&mut self, class_names: &[&str]) {
        self.add_instrumentation_arg(CLASS_ARG, &class_names.join(","));
    }

    /// Run a single method, `class#method`.
    pub fn set_method_name(&mut self, class_name: &str, method_name: &str) {
        self.add_instrumentation_arg(CLASS_ARG, &format!("{class_name}#{method_name}"));
    }

    pub fn set_test_package_name(&mut self, package_name: &str) {
        self.add_instrumentation_arg(PACKAGE_ARG, package_name);
    }

    pub fn add_instrumentation_arg(&mut self, name: &str, value: &str) {
        self.args.insert(name.to_string(), value.to_string());
    }

    pub fn remove_instrumentation_arg(&mut self, name: &str) {
        self.args.remove(name);
    }

    pub fn add_boolean_arg(&mut self, name: &str, value: bool) {
        self.add_instrumentation_arg(name, if value { "true" } else { "false" });
    }

    /// List the tests without running them.
    pub fn set_log_only(&mut self, log_only: bool) {
        self.add_boolean_arg(LOG_ARG, log_only);
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.add_boolean_arg(DEBUG_ARG, debug);
    }

    pub fn set_coverage(&mut self, coverage: bool) {
        self.add_boolean_arg(COVERAGE_ARG, coverage);
    }

    pub fn set_test_size(&mut self, size: TestSize) {
        self.add_instrumentation_arg(SIZE_ARG, size.as_arg());
    }

    /// Fail the run if the device prints nothing for `max_inactivity`
    /// (zero waits forever).
    pub fn set_max_time_to_output_response(&mut self, max_inactivity: Duration) {
        self.max_inactivity = max_inactivity;
    }

    /// Stop the run at the next batch of output.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn command(&self) -> String {
        let mut command = String::from("am instrument -w -r");
        for (name, value) in &self.args {
            command.push_str(&format!(" -e {name} {value}"));
        }
        command.push_str(&format!(" {}/{}", self.package_name, self.runner_name()));
        command
    }

    /// Run the tests on `device`, reporting progress to `listener`.
    ///
    /// A failed command is also reported as a failed run before the error is
    /// returned.
    #[instrument(skip_all, fields(serial = device.serial(), package = %self.package_name))]
    pub async fn run(&self, device: &Device, listener: &mut dyn TestRunListener) -> Result<()> {
        let command = self.command();
        info!("Running {} on {}", command, device.serial());

        let mut parser =
            InstrumentationResultParser::with_cancel_flag(listener, self.cancelled.clone());
        let result = device
            .execute_shell_command(&command, &mut parser, self.max_inactivity)
            .await;

        match &result {
            Err(e) => {
                warn!("Instrumentation run on {} failed: {}", device.serial(), e);
                parser.handle_run_failed(&e.to_string());
            }
            Ok(()) if self.cancelled.load(Ordering::SeqCst) => parser.finish_cancelled(),
            Ok(()) => {}
        }
        result
    }
}
