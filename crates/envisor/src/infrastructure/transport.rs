use std::process::Stdio;
use std::time::Duration;

use api_types::Environment;
use api_types::HostSnapshot;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;

use crate::domain::fleet::FleetError;
use crate::domain::fleet::FleetReply;
use crate::domain::fleet::FleetRequest;
use crate::domain::fleet::RemoteTransport;

/// ssh exits with this status when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshTransport {
    /// Login name, the local user when unset
    pub user: Option<String>,
    pub connect_timeout: Duration,
    /// Command starting this binary on the remote hosts
    pub remote_command: String,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            user: None,
            connect_timeout: Duration::from_secs(5),
            remote_command: "envisor".to_string(),
        }
    }
}

impl SshTransport {
    /// Arguments of the `ssh` invocation for `host`.
    ///
    /// ssh hands the remote command to a shell as one string, so every word
    /// after `remote_command` is quoted for that shell.
    pub fn command_args(
        &self,
        host: &str,
        request: &FleetRequest,
    ) -> Result<Vec<String>, Report<FleetError>> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(user) = &self.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push(host.to_string());

        let mut words = Vec::new();
        match request {
            FleetRequest::Snapshot => words.push("snapshot".to_string()),
            FleetRequest::Environments(filter) => {
                words.push("environments".to_string());
                if let Some(uid) = filter.uid {
                    words.push(format!("--uid={uid}"));
                }
                if let Some(username) = &filter.username {
                    words.push(format!("--username={username}"));
                }
                if let Some(name) = &filter.name {
                    words.push(format!("--name={name}"));
                }
                for eid in filter.eids.iter().flatten() {
                    words.push(format!("--eid={eid}"));
                }
            }
        }

        let mut remote = self.remote_command.clone();
        for word in &words {
            let quoted = shlex::try_quote(word).change_context_lazy(|| FleetError::RemoteFailure {
                host: host.to_string(),
                reason: format!("argument `{}` cannot be passed to a shell", word.escape_debug()),
            })?;
            remote.push(' ');
            remote.push_str(&quoted);
        }
        args.push(remote);
        Ok(args)
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn execute(
        &self,
        host: &str,
        request: &FleetRequest,
    ) -> Result<FleetReply, Report<FleetError>> {
        let output = Command::new("ssh")
            .args(self.command_args(host, request)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .change_context_lazy(|| FleetError::RemoteHostUnreachable {
                host: host.to_string(),
                reason: "failed to run ssh".to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => {}
            Some(SSH_CONNECTION_FAILURE) => {
                return Err(Report::new(FleetError::RemoteHostUnreachable {
                    host: host.to_string(),
                    reason: stderr,
                }))
            }
            _ => {
                return Err(Report::new(FleetError::RemoteFailure {
                    host: host.to_string(),
                    reason: format!("{}: {stderr}", output.status),
                }))
            }
        }

        let invalid = || FleetError::InvalidResponse {
            host: host.to_string(),
            reason: "reply is not valid JSON for the request".to_string(),
        };
        match request {
            FleetRequest::Snapshot => serde_json::from_slice::<HostSnapshot>(&output.stdout)
                .map(FleetReply::Snapshot)
                .change_context_lazy(invalid),
            FleetRequest::Environments(_) => {
                serde_json::from_slice::<Vec<Environment>>(&output.stdout)
                    .map(FleetReply::Environments)
                    .change_context_lazy(invalid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use api_types::Eid;
    use api_types::EnvironmentFilter;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn snapshot_command_line() {
        let transport = SshTransport {
            user: Some("ops".to_string()),
            connect_timeout: Duration::from_secs(3),
            remote_command: "/usr/local/bin/envisor".to_string(),
        };

        assert_eq!(
            transport
                .command_args("gpu-01", &FleetRequest::Snapshot)
                .unwrap(),
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=3",
                "-l",
                "ops",
                "gpu-01",
                "/usr/local/bin/envisor snapshot",
            ]
        );
    }

    #[test]
    fn environment_filter_becomes_flags() {
        let transport = SshTransport::default();
        let filter = EnvironmentFilter {
            uid: Some(1000),
            name: Some("train".to_string()),
            eids: Some(vec![Eid::from("abc"), Eid::from("def")]),
            ..Default::default()
        };

        let args = transport
            .command_args("gpu-02", &FleetRequest::Environments(filter))
            .unwrap();

        assert_eq!(args.len(), 6);
        assert_eq!(args[4], "gpu-02");
        assert_eq!(
            shlex::split(&args[5]).unwrap(),
            vec![
                "envisor",
                "environments",
                "--uid=1000",
                "--name=train",
                "--eid=abc",
                "--eid=def",
            ]
        );
    }

    #[test]
    fn names_reach_the_remote_shell_as_one_word() {
        let transport = SshTransport::default();
        let filter = EnvironmentFilter {
            name: Some("my env; touch /tmp/owned $(id)".to_string()),
            ..Default::default()
        };

        let args = transport
            .command_args("gpu-03", &FleetRequest::Environments(filter))
            .unwrap();

        assert_eq!(
            shlex::split(&args[5]).unwrap(),
            vec![
                "envisor",
                "environments",
                "--name=my env; touch /tmp/owned $(id)",
            ]
        );
    }

    #[test]
    fn unquotable_argument_is_rejected() {
        let filter = EnvironmentFilter {
            username: Some("a\0b".to_string()),
            ..Default::default()
        };

        let err = SshTransport::default()
            .command_args("gpu-04", &FleetRequest::Environments(filter))
            .unwrap_err();
        assert!(!err.current_context().is_transient());
    }
}
