use api_types::Eid;
use api_types::EnvironmentFilter;
use clap::Args;

use crate::config::storage::RegistryArgs;

#[derive(Args, Debug, Clone)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,
}

#[derive(Args, Debug, Clone)]
pub struct EnvironmentsArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    #[arg(long, help = "Only environments owned by this uid")]
    pub uid: Option<u32>,

    #[arg(long, help = "Only environments owned by this user")]
    pub username: Option<String>,

    #[arg(long, help = "Only environments with this name")]
    pub name: Option<String>,

    #[arg(long = "eid", help = "Only these environments (repeatable)")]
    pub eids: Vec<String>,
}

impl EnvironmentsArgs {
    pub fn filter(&self) -> EnvironmentFilter {
        EnvironmentFilter {
            uid: self.uid,
            username: self.username.clone(),
            name: self.name.clone(),
            eids: (!self.eids.is_empty())
                .then(|| self.eids.iter().map(|eid| Eid::from(eid.as_str())).collect()),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DiscardArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Environment id of the quarantined record
    pub eid: String,
}
