use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::debug;
use tracing::warn;

use super::FleetError;
use super::FleetRequest;
use super::HostOutcome;
use super::RemoteTransport;

#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Bound on a single attempt against one host
    pub host_timeout: Duration,
    /// Extra attempts after a transient failure
    pub retries: u32,
    /// Wait before the first retry, doubled for each further one
    pub retry_backoff: Duration,
    /// Bound on the whole query; hosts still outstanding are cancelled
    pub deadline: Option<Duration>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            host_timeout: Duration::from_secs(10),
            retries: 1,
            retry_backoff: Duration::from_millis(500),
            deadline: None,
        }
    }
}

pub struct FleetAggregator<T: ?Sized> {
    transport: Arc<T>,
    options: FleetOptions,
}

impl<T: RemoteTransport + ?Sized> FleetAggregator<T> {
    pub fn new(transport: Arc<T>, options: FleetOptions) -> Self {
        Self { transport, options }
    }

    /// Issues `request` to every host concurrently.
    ///
    /// The returned map has one entry per distinct host, successful or not.
    #[tracing::instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn query(
        &self,
        hosts: &[String],
        request: &FleetRequest,
    ) -> BTreeMap<String, HostOutcome> {
        let hosts: BTreeSet<&String> = hosts.iter().collect();
        let mut pending: FuturesUnordered<_> = hosts
            .iter()
            .map(|host| async move { ((*host).clone(), self.query_host(host, request).await) })
            .collect();

        let deadline = async {
            match self.options.deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut results = BTreeMap::new();
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((host, outcome)) => {
                        results.insert(host, outcome);
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(outstanding = pending.len(), "fleet query deadline reached");
                    break;
                }
            }
        }
        // dropping the remaining futures cancels their remote calls
        drop(pending);

        for host in hosts {
            results.entry(host.clone()).or_insert_with(|| HostOutcome {
                fetched_at: Utc::now(),
                result: Err(FleetError::Cancelled { host: host.clone() }),
            });
        }
        results
    }

    async fn query_host(&self, host: &str, request: &FleetRequest) -> HostOutcome {
        let mut backoff = self.options.retry_backoff;
        let mut attempt = 0;

        loop {
            let error = match tokio::time::timeout(
                self.options.host_timeout,
                self.transport.execute(host, request),
            )
            .await
            {
                Ok(Ok(reply)) => {
                    debug!(host, attempt, "host answered");
                    return HostOutcome {
                        fetched_at: Utc::now(),
                        result: Ok(reply),
                    };
                }
                Ok(Err(report)) => {
                    warn!(host, attempt, "host query failed: {report:?}");
                    report.current_context().clone()
                }
                Err(_) => FleetError::Timeout {
                    host: host.to_string(),
                    after: self.options.host_timeout,
                },
            };

            if !error.is_transient() || attempt >= self.options.retries {
                return HostOutcome {
                    fetched_at: Utc::now(),
                    result: Err(error),
                };
            }

            attempt += 1;
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use api_types::HostSnapshot;
    use async_trait::async_trait;
    use error_stack::Report;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::super::FleetReply;
    use super::*;

    enum Script {
        Answer,
        Unreachable,
        Hang,
        FailOnce(AtomicU32),
        Broken,
    }

    struct ScriptedTransport(HashMap<String, Script>);

    fn snapshot(host: &str) -> FleetReply {
        FleetReply::Snapshot(HostSnapshot {
            hostname: Some(host.to_string()),
            taken_at: Utc::now(),
            devices: vec![],
            environments: vec![],
            quarantined: vec![],
        })
    }

    #[async_trait]
    impl RemoteTransport for ScriptedTransport {
        async fn execute(
            &self,
            host: &str,
            _request: &FleetRequest,
        ) -> Result<FleetReply, Report<FleetError>> {
            let unreachable = || {
                Report::new(FleetError::RemoteHostUnreachable {
                    host: host.to_string(),
                    reason: "connection refused".to_string(),
                })
            };
            match self.0.get(host) {
                Some(Script::Answer) => Ok(snapshot(host)),
                Some(Script::Unreachable) | None => Err(unreachable()),
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(snapshot(host))
                }
                Some(Script::FailOnce(calls)) => {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(unreachable())
                    } else {
                        Ok(snapshot(host))
                    }
                }
                Some(Script::Broken) => Err(Report::new(FleetError::RemoteFailure {
                    host: host.to_string(),
                    reason: "exit status 1".to_string(),
                })),
            }
        }
    }

    fn aggregator(scripts: Vec<(&str, Script)>, options: FleetOptions) -> FleetAggregator<ScriptedTransport> {
        let scripts = scripts
            .into_iter()
            .map(|(host, script)| (host.to_string(), script))
            .collect();
        FleetAggregator::new(Arc::new(ScriptedTransport(scripts)), options)
    }

    fn fast() -> FleetOptions {
        FleetOptions {
            host_timeout: Duration::from_millis(200),
            retries: 1,
            retry_backoff: Duration::from_millis(10),
            deadline: None,
        }
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|h| h.to_string()).collect()
    }

    #[test(tokio::test)]
    async fn one_unreachable_host_does_not_affect_others() {
        let aggregator = aggregator(
            vec![
                ("a", Script::Answer),
                ("b", Script::Unreachable),
                ("c", Script::Answer),
            ],
            fast(),
        );

        let results = aggregator
            .query(&hosts(&["a", "b", "c"]), &FleetRequest::Snapshot)
            .await;

        assert_eq!(results.len(), 3);
        assert!(results["a"].result.is_ok());
        assert!(results["c"].result.is_ok());
        assert!(matches!(
            results["b"].result,
            Err(FleetError::RemoteHostUnreachable { .. })
        ));
    }

    #[test(tokio::test)]
    async fn transient_failure_is_retried() {
        let aggregator = aggregator(vec![("a", Script::FailOnce(AtomicU32::new(0)))], fast());

        let results = aggregator.query(&hosts(&["a"]), &FleetRequest::Snapshot).await;

        assert!(results["a"].result.is_ok(), "{:?}", results["a"]);
    }

    #[test(tokio::test)]
    async fn remote_failure_is_not_retried() {
        let aggregator = aggregator(vec![("a", Script::Broken)], fast());

        let results = aggregator.query(&hosts(&["a"]), &FleetRequest::Snapshot).await;

        assert!(matches!(
            results["a"].result,
            Err(FleetError::RemoteFailure { .. })
        ));
    }

    #[test(tokio::test)]
    async fn slow_host_times_out() {
        let mut options = fast();
        options.retries = 0;
        let aggregator = aggregator(vec![("slow", Script::Hang), ("a", Script::Answer)], options);

        let results = aggregator
            .query(&hosts(&["slow", "a"]), &FleetRequest::Snapshot)
            .await;

        assert!(matches!(results["slow"].result, Err(FleetError::Timeout { .. })));
        assert!(results["a"].result.is_ok());
    }

    #[test(tokio::test)]
    async fn deadline_cancels_only_outstanding_hosts() {
        let options = FleetOptions {
            host_timeout: Duration::from_secs(30),
            deadline: Some(Duration::from_millis(100)),
            ..fast()
        };
        let aggregator = aggregator(vec![("slow", Script::Hang), ("a", Script::Answer)], options);

        let results = aggregator
            .query(&hosts(&["slow", "a", "a"]), &FleetRequest::Snapshot)
            .await;

        assert_eq!(results.len(), 2);
        assert!(results["a"].result.is_ok());
        assert_eq!(
            results["slow"].result,
            Err(FleetError::Cancelled {
                host: "slow".to_string()
            })
        );
    }
}
