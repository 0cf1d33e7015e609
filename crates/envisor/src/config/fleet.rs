use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use api_types::Eid;
use api_types::EnvironmentFilter;
use clap::Args;
use clap::Subcommand;
use clap::ValueEnum;
use serde::Deserialize;

use crate::domain::fleet::FleetOptions;
use crate::domain::fleet::FleetRequest;
use crate::infrastructure::transport::SshTransport;

/// Hosts file layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostsFile {
    /// ssh login name for every host
    pub user: Option<String>,
    pub hosts: Vec<String>,
}

impl HostsFile {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hosts file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid hosts file {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

#[derive(Args, Debug, Clone)]
pub struct FleetArgs {
    #[arg(
        long,
        env = "ENVISOR_HOSTS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file listing the hosts to query"
    )]
    pub hosts_file: Option<PathBuf>,

    #[arg(long = "host", help = "Additional host to query (repeatable)")]
    pub hosts: Vec<String>,

    #[arg(long, help = "ssh login name, overriding the hosts file")]
    pub user: Option<String>,

    #[arg(long, default_value = "10000", help = "Per-host attempt timeout, in milliseconds")]
    pub timeout_ms: u64,

    #[arg(long, default_value = "1", help = "Retries after a transient host failure")]
    pub retries: u32,

    #[arg(long, help = "Overall deadline of the query, in milliseconds")]
    pub deadline_ms: Option<u64>,

    #[arg(
        long,
        default_value = "envisor",
        help = "Command starting envisor on the remote hosts"
    )]
    pub remote_command: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub request: FleetCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum FleetCommand {
    /// Host snapshots of every host
    Snapshot,
    /// Environments of every host
    Environments {
        #[arg(long)]
        uid: Option<u32>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "eid")]
        eids: Vec<String>,
    },
}

impl FleetArgs {
    /// Hosts to query and the ssh login name
    pub fn targets(&self) -> Result<(Vec<String>, Option<String>)> {
        let file = match &self.hosts_file {
            Some(path) => HostsFile::load(path)?,
            None => HostsFile::default(),
        };
        let mut hosts = file.hosts;
        hosts.extend(self.hosts.iter().cloned());
        if hosts.is_empty() {
            anyhow::bail!("no hosts given; use --hosts-file or --host");
        }
        Ok((hosts, self.user.clone().or(file.user)))
    }

    pub fn request(&self) -> FleetRequest {
        match &self.request {
            FleetCommand::Snapshot => FleetRequest::Snapshot,
            FleetCommand::Environments {
                uid,
                username,
                name,
                eids,
            } => FleetRequest::Environments(EnvironmentFilter {
                uid: *uid,
                username: username.clone(),
                name: name.clone(),
                eids: (!eids.is_empty())
                    .then(|| eids.iter().map(|eid| Eid::from(eid.as_str())).collect()),
            }),
        }
    }

    pub fn options(&self) -> FleetOptions {
        FleetOptions {
            host_timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
            deadline: self.deadline_ms.map(Duration::from_millis),
            ..Default::default()
        }
    }

    pub fn transport(&self, user: Option<String>) -> SshTransport {
        SshTransport {
            user,
            remote_command: self.remote_command.clone(),
            ..Default::default()
        }
    }
}
