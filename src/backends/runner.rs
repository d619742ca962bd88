// Bounded execution of gateway commands (optionally inside a container)

use crate::error::{EnforcementError, EnforcementErrorKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Executes commands against the gateway's network namespace
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Human-readable description of where commands run
    fn target(&self) -> String;

    /// Run a command. A non-zero exit is returned as output, not as an error;
    /// only spawn failures and timeouts are errors.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, EnforcementError>;

    /// Run a command and treat a non-zero exit as `CommandFailed`
    async fn run_checked(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, EnforcementError> {
        let output = self.run(program, args).await?;
        if !output.success {
            let detail = match output.stderr.trim() {
                "" => output.stdout.trim(),
                stderr => stderr,
            };
            return Err(EnforcementError::new(
                EnforcementErrorKind::CommandFailed,
                format!(
                    "{} {} exited with {:?}: {}",
                    program,
                    args.join(" "),
                    output.code,
                    detail
                ),
            ));
        }
        Ok(output)
    }
}

/// Runs commands via `docker exec <container>`, or directly on the host when
/// no container is configured
pub struct ContainerRunner {
    container: Option<String>,
    timeout: Duration,
}

impl ContainerRunner {
    pub fn new(container: Option<String>, timeout: Duration) -> Self {
        Self { container, timeout }
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = match &self.container {
            Some(container) => {
                let mut cmd = Command::new("docker");
                cmd.arg("exec").arg(container).arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.args(args).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ContainerRunner {
    fn target(&self) -> String {
        match &self.container {
            Some(container) => format!("container '{container}'"),
            None => "host".to_string(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, EnforcementError> {
        log::debug!("[{}] {} {}", self.target(), program, args.join(" "));

        let output = tokio::time::timeout(self.timeout, self.command(program, args).output())
            .await
            .map_err(|_| {
                EnforcementError::new(
                    EnforcementErrorKind::Timeout,
                    format!("{} timed out after {:?}", program, self.timeout),
                )
            })?
            .map_err(|e| {
                EnforcementError::new(
                    EnforcementErrorKind::Spawn,
                    format!("failed to execute {}: {}", program, e),
                )
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an owned argument list from string literals and formatted values
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
pub mod fake {
    //! In-memory gateway that understands the iptables/tc invocations the
    //! backends issue, so tests can inspect the resulting rule table.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Gateway {
        /// iptables rules as their argument strings, e.g. "FORWARD -s 10.8.0.2 -j DROP"
        rules: Vec<String>,
        /// tc objects as "class <id>" / "filter <prio>"
        tc: Vec<String>,
        qdisc: bool,
        calls: Vec<String>,
    }

    #[derive(Default)]
    pub struct FakeRunner {
        gateway: Mutex<Gateway>,
        failing: Mutex<Vec<String>>,
        unreachable: Mutex<bool>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every invocation of `program` exit non-zero
        pub fn fail_program(&self, program: &str) {
            self.failing.lock().unwrap().push(program.to_string());
        }

        /// Make every command fail to start, as if the container were gone
        pub fn set_unreachable(&self) {
            *self.unreachable.lock().unwrap() = true;
        }

        pub fn heal(&self) {
            self.failing.lock().unwrap().clear();
            *self.unreachable.lock().unwrap() = false;
        }

        pub fn rules(&self) -> Vec<String> {
            self.gateway.lock().unwrap().rules.clone()
        }

        pub fn tc_objects(&self) -> Vec<String> {
            self.gateway.lock().unwrap().tc.clone()
        }

        pub fn calls(&self) -> Vec<String> {
            self.gateway.lock().unwrap().calls.clone()
        }

        pub fn insert_rule(&self, rule: &str) {
            self.gateway.lock().unwrap().rules.push(rule.to_string());
        }
    }

    fn exit(success: bool) -> CommandOutput {
        CommandOutput {
            success,
            code: Some(if success { 0 } else { 1 }),
            ..Default::default()
        }
    }

    fn value_after<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == key)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        fn target(&self) -> String {
            "fake".to_string()
        }

        async fn run(
            &self,
            program: &str,
            args: &[String],
        ) -> Result<CommandOutput, EnforcementError> {
            let mut gw = self.gateway.lock().unwrap();
            gw.calls.push(format!("{} {}", program, args.join(" ")));

            if *self.unreachable.lock().unwrap() {
                return Err(EnforcementError::new(
                    EnforcementErrorKind::Spawn,
                    "container is not running",
                ));
            }

            if self.failing.lock().unwrap().iter().any(|p| p == program) {
                return Ok(exit(false));
            }

            match (program, args.first().map(String::as_str)) {
                ("iptables" | "ip6tables", Some("-I")) => {
                    gw.rules.push(args[1..].join(" "));
                    Ok(exit(true))
                }
                ("iptables" | "ip6tables", Some("-D")) => {
                    let rule = args[1..].join(" ");
                    match gw.rules.iter().position(|r| *r == rule) {
                        Some(idx) => {
                            gw.rules.remove(idx);
                            Ok(exit(true))
                        }
                        None => Ok(exit(false)),
                    }
                }
                ("tc", Some("qdisc")) => {
                    if args.get(1).map(String::as_str) == Some("show") {
                        let stdout = if gw.qdisc {
                            "qdisc htb 1: root".to_string()
                        } else {
                            "qdisc noqueue 0: root".to_string()
                        };
                        return Ok(CommandOutput {
                            stdout,
                            ..exit(true)
                        });
                    }
                    gw.qdisc = args.get(1).map(String::as_str) == Some("add");
                    Ok(exit(true))
                }
                ("tc", Some(kind @ ("class" | "filter"))) => {
                    let id = match kind {
                        "class" => value_after(args, "classid"),
                        _ => value_after(args, "prio"),
                    }
                    .unwrap_or_default();
                    let object = format!("{kind} {id}");
                    match args.get(1).map(String::as_str) {
                        Some("add") => {
                            if gw.tc.contains(&object) {
                                return Ok(exit(false));
                            }
                            gw.tc.push(object);
                            Ok(exit(true))
                        }
                        Some("del") => match gw.tc.iter().position(|o| *o == object) {
                            Some(idx) => {
                                gw.tc.remove(idx);
                                Ok(exit(true))
                            }
                            None => Ok(exit(false)),
                        },
                        _ => Ok(exit(true)),
                    }
                }
                _ => Ok(exit(true)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_command_success_and_failure() {
        let runner = ContainerRunner::new(None, Duration::from_secs(5));

        let ok = runner.run("true", &[]).await.unwrap();
        assert!(ok.success);

        let failed = runner.run("false", &[]).await.unwrap();
        assert!(!failed.success);

        let err = runner.run_checked("false", &[]).await.unwrap_err();
        assert_eq!(err.kind, EnforcementErrorKind::CommandFailed);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ContainerRunner::new(None, Duration::from_secs(5));
        let err = runner
            .run("definitely-not-a-real-binary-wgq", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, EnforcementErrorKind::Spawn);
    }

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let runner = ContainerRunner::new(None, Duration::from_millis(100));
        let err = runner.run("sleep", &args(["5"])).await.unwrap_err();
        assert_eq!(err.kind, EnforcementErrorKind::Timeout);
    }

    #[test]
    fn test_container_target_description() {
        let runner = ContainerRunner::new(Some("wg-easy".to_string()), Duration::from_secs(1));
        assert_eq!(runner.target(), "container 'wg-easy'");
    }
}
