//! Turning raw test output into a [`TestResult`].

use crate::errors::FrameworkError;
use crate::types::{BROKEN_RETURNCODE, SKIPPED_RETURNCODE, Test, TestResult};
use regex::Regex;
use std::time::Duration;
use tracing::warn;

/// Interprets the output of a finished test.
pub trait ResultReader: Send + Sync {
    fn read_result(
        &self,
        test: &Test,
        stdout: &str,
        returncode: i32,
        exec_time: Duration,
    ) -> Result<TestResult, FrameworkError>;
}

/// Reader for tests that print an LTP style `Summary:` block or
/// `TPASS`/`TFAIL`/`TSKIP`/`TBROK`/`TWARN` markers.
///
/// Lookup order:
/// 1. the summary block,
/// 2. marker counts, also used when the summary counters don't fit,
/// 3. the return code (0 pass, 4 warning, 32 skip, anything else fail),
///    only when neither of the above reported anything.
///
/// A return code of -1 means no usable data came back and always marks the
/// result as broken.
#[derive(Debug, Clone)]
pub struct SummaryReader {
    ansi: Regex,
    summary: Regex,
}

impl SummaryReader {
    pub fn new() -> Result<Self, FrameworkError> {
        Ok(Self {
            ansi: Regex::new(r"\x1b\[[0-9;]+[a-zA-Z]")?,
            summary: Regex::new(concat!(
                r"Summary:\n",
                r"passed\s*(?P<passed>\d+)\n",
                r"failed\s*(?P<failed>\d+)\n",
                r"broken\s*(?P<broken>\d+)\n",
                r"skipped\s*(?P<skipped>\d+)\n",
                r"warnings\s*(?P<warnings>\d+)\n",
            ))?,
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Counters {
    passed: u32,
    failed: u32,
    broken: u32,
    skipped: u32,
    warnings: u32,
}

impl Counters {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ResultReader for SummaryReader {
    fn read_result(
        &self,
        test: &Test,
        stdout: &str,
        returncode: i32,
        exec_time: Duration,
    ) -> Result<TestResult, FrameworkError> {
        let stdout = self.ansi.replace_all(stdout, "").into_owned();
        let broken_run = returncode == BROKEN_RETURNCODE;

        let summary = self.summary.captures(&stdout).and_then(|caps| {
            let field = |name: &str| caps[name].parse::<u32>().ok();
            let counters = Counters {
                passed: field("passed")?,
                failed: field("failed")?,
                broken: field("broken")?,
                skipped: field("skipped")?,
                warnings: field("warnings")?,
            };
            Some(counters)
        });

        let mut counters = match summary {
            Some(counters) => counters,
            None => {
                if self.summary.is_match(&stdout) {
                    warn!(test = %test.name, "Summary counters out of range, counting markers");
                }
                let mut counters = count_markers(&stdout);
                if counters.is_empty() {
                    // old style tests only report through the exit status
                    match returncode {
                        0 => counters.passed = 1,
                        4 => counters.warnings = 1,
                        SKIPPED_RETURNCODE => counters.skipped = 1,
                        _ if !broken_run => counters.failed = 1,
                        _ => {}
                    }
                }
                counters
            }
        };

        if broken_run {
            counters.broken = 1;
        }

        Ok(TestResult {
            test: test.clone(),
            passed: counters.passed,
            failed: counters.failed,
            broken: counters.broken,
            skipped: counters.skipped,
            warnings: counters.warnings,
            returncode,
            stdout,
            exec_time,
        })
    }
}

fn count_markers(stdout: &str) -> Counters {
    let count = |marker: &str| stdout.matches(marker).count() as u32;
    Counters {
        passed: count("TPASS"),
        failed: count("TFAIL"),
        broken: count("TBROK"),
        skipped: count("TSKIP"),
        warnings: count("TWARN"),
    }
}
