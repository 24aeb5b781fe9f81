//! Retrying of invocations and rendering of external commands.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay between two attempts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same time after each failure.
    Fixed { millis: u64 },
    /// Double the wait time after each failure, up to `max_millis`.
    Exponential { initial_millis: u64, max_millis: u64 },
}

impl Backoff {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { millis } => Duration::from_millis(millis),
            Backoff::Exponential {
                initial_millis,
                max_millis,
            } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(initial_millis.saturating_mul(factor).min(max_millis))
            }
        }
    }
}

/// Default number of attempts per job.
pub fn default_max_attempts() -> u32 {
    30
}

/// How often and how patiently to retry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximal number of attempts, at least one attempt is always made.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::None,
        }
    }
}

/// Result of `RetryPolicy::run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded {
        attempts: u32,
        value: T,
    },
    Exhausted {
        attempts: u32,
        /// Value of the last attempt if it returned one.
        last_value: Option<T>,
        /// Error of the last attempt if it failed to run.
        last_error: Option<String>,
    },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

impl RetryPolicy {
    /// Call `invoke` with the attempt number until `is_success` holds for its
    /// value or the attempts are used up.
    ///
    /// An `Err` from `invoke` counts as a failed attempt.
    pub fn run<T, F, S>(&self, mut invoke: F, is_success: S) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Result<T, anyhow::Error>,
        S: Fn(&T) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_value = None;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match invoke(attempt) {
                Ok(value) if is_success(&value) => {
                    return RetryOutcome::Succeeded {
                        attempts: attempt,
                        value,
                    }
                }
                Ok(value) => {
                    tracing::debug!("attempt {}/{} unsuccessful", attempt, max_attempts);
                    last_value = Some(value);
                    last_error = None;
                }
                Err(e) => {
                    tracing::warn!("attempt {}/{} failed: {}", attempt, max_attempts, e);
                    last_value = None;
                    last_error = Some(e.to_string());
                }
            }

            if attempt < max_attempts {
                let delay = self.backoff.delay(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }

        RetryOutcome::Exhausted {
            attempts: max_attempts,
            last_value,
            last_error,
        }
    }
}

/// Program and arguments with `{name}` placeholders.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A command with all placeholders filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl std::fmt::Display for RenderedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn render_str(template: &str, values: &HashMap<&str, String>) -> Result<String, anyhow::Error> {
    let re = regex::Regex::new(r"\{([a-z_]+)\}")?;
    let mut missing = None;
    let rendered = re.replace_all(template, |caps: &regex::Captures| match values.get(&caps[1]) {
        Some(value) => value.clone(),
        None => {
            missing = Some(caps[1].to_string());
            caps[0].to_string()
        }
    });
    match missing {
        Some(name) => anyhow::bail!("unknown placeholder {{{}}} in {:?}", name, template),
        None => Ok(rendered.into_owned()),
    }
}

impl CommandTemplate {
    /// Replace the placeholders by `values`; unknown placeholders are an error.
    pub fn render(&self, values: &HashMap<&str, String>) -> Result<RenderedCommand, anyhow::Error> {
        Ok(RenderedCommand {
            program: render_str(&self.program, values)?,
            args: self
                .args
                .iter()
                .map(|arg| render_str(arg, values))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

impl RenderedCommand {
    /// Run the command to completion with stdout and stderr appended to `log_path`.
    pub fn run(&self, log_path: &Path) -> Result<std::process::ExitStatus, anyhow::Error> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| anyhow::anyhow!("could not open log file {:?}: {}", log_path, e))?;
        let log_err = log.try_clone()?;

        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .map_err(|e| anyhow::anyhow!("could not run `{}`: {}", self, e))
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn succeeds_after_failures() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::None,
        };
        let calls = Cell::new(0);

        let outcome = policy.run(
            |attempt| {
                calls.set(calls.get() + 1);
                Ok(if attempt < 3 { 1 } else { 0 })
            },
            |code| *code == 0,
        );

        assert_eq!(
            outcome,
            RetryOutcome::Succeeded {
                attempts: 3,
                value: 0
            }
        );
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhausted_keeps_last_value() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Backoff::None,
        };
        let calls = Cell::new(0);

        let outcome = policy.run(
            |attempt| {
                calls.set(calls.get() + 1);
                Ok(attempt)
            },
            |_| false,
        );

        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 4,
                last_value: Some(4),
                last_error: None,
            }
        );
        assert_eq!(calls.get(), 4);
    }

    #[test]
    #[tracing_test::traced_test]
    fn errors_count_as_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::None,
        };

        let outcome = policy.run(
            |attempt| -> Result<i32, anyhow::Error> { anyhow::bail!("boom {}", attempt) },
            |_| true,
        );

        assert_eq!(outcome.attempts(), 2);
        assert!(!outcome.is_success());
        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted { last_error: Some(ref e), .. } if e == "boom 2"
        ));
        assert!(logs_contain("attempt 1/2 failed: boom 1"));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Backoff::None,
        };

        let outcome = policy.run(|_| Ok(()), |_| true);

        assert_eq!(outcome.attempts(), 1);
        assert!(outcome.is_success());
    }

    #[rstest::rstest]
    #[case(Backoff::None, 3, 0)]
    #[case(Backoff::Fixed { millis: 250 }, 1, 250)]
    #[case(Backoff::Fixed { millis: 250 }, 7, 250)]
    #[case(Backoff::Exponential { initial_millis: 100, max_millis: 1_000 }, 1, 100)]
    #[case(Backoff::Exponential { initial_millis: 100, max_millis: 1_000 }, 3, 400)]
    #[case(Backoff::Exponential { initial_millis: 100, max_millis: 1_000 }, 5, 1_000)]
    #[case(Backoff::Exponential { initial_millis: 100, max_millis: 1_000 }, 100, 1_000)]
    fn backoff_delay(#[case] backoff: Backoff, #[case] attempt: u32, #[case] millis: u64) {
        assert_eq!(backoff.delay(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn parse_policy_yaml() -> Result<(), anyhow::Error> {
        let policy: RetryPolicy = serde_yaml::from_str(
            "max_attempts: 3\nbackoff:\n  kind: exponential\n  initial_millis: 10\n  max_millis: 50\n",
        )?;
        assert_eq!(
            policy,
            RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Exponential {
                    initial_millis: 10,
                    max_millis: 50
                },
            }
        );

        let policy: RetryPolicy = serde_yaml::from_str("{}")?;
        assert_eq!(policy, RetryPolicy::default());

        Ok(())
    }

    fn values() -> HashMap<&'static str, String> {
        HashMap::from([
            ("job_id", "NLP_fp40".to_string()),
            ("vcf_file", "s3://mybucket/MAN_0001-01.hg19.vcf".to_string()),
        ])
    }

    #[test]
    fn render_template() -> Result<(), anyhow::Error> {
        let template = CommandTemplate {
            program: "worker".to_string(),
            args: vec![
                "--job-id={job_id}".to_string(),
                "{vcf_file}".to_string(),
                "plain".to_string(),
            ],
        };

        let rendered = template.render(&values())?;

        assert_eq!(
            rendered.to_string(),
            "worker --job-id=NLP_fp40 s3://mybucket/MAN_0001-01.hg19.vcf plain"
        );

        Ok(())
    }

    #[test]
    fn render_unknown_placeholder() {
        let template = CommandTemplate {
            program: "worker".to_string(),
            args: vec!["{nope}".to_string()],
        };

        let err = template.render(&values()).expect_err("must fail");
        assert!(err.to_string().contains("{nope}"), "{}", err);
    }

    #[test]
    fn run_writes_log_and_status() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let log_path = tmp_dir.join("job.log");
        let template = CommandTemplate {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo {job_id}; exit 3".to_string()],
        };

        let status = template.render(&values())?.run(&log_path)?;

        assert_eq!(status.code(), Some(3));
        assert_eq!(std::fs::read_to_string(&log_path)?, "NLP_fp40\n");

        Ok(())
    }
}
