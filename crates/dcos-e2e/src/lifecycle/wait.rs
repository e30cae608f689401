//! Readiness polling.
//!
//! Readiness is a sequence of checks: node-local process health on every
//! node, then (only when the nodes are network-routable) an HTTP probe of
//! each master. A round passes when every check passes; failed rounds are
//! retried under a [`PollPolicy`] until the attempt budget or the timeout
//! runs out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::transport::{RemoteCommand, RunOptions, Transport};

/// Node-local health command.
pub const NODE_POSTSTART_COMMAND: [&str; 3] =
    ["/opt/mesosphere/bin/dcos-check-runner", "check", "node-poststart"];

/// Default path probed on masters.
pub const DEFAULT_HEALTH_PATH: &str = "/dcos-metadata/dcos-version.json";

/// Bounded retry policy for readiness polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Maximum number of check rounds.
    pub max_attempts: u32,
    /// Delay after the first failed round.
    pub interval: Duration,
    /// Growth factor of the delay; `1.0` polls at a fixed interval.
    pub backoff_multiplier: f64,
    /// Upper bound on the delay.
    pub max_interval: Duration,
    /// Overall limit across all rounds.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 720,
            interval: Duration::from_secs(5),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl PollPolicy {
    /// Delay after the given zero-based failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.max(1.0).powi(exp);
        let delay_secs = self.interval.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_interval.as_secs_f64()))
    }

    /// Whether another round may follow `attempts` completed rounds.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// One failed check, on one node if it is node-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailure {
    pub check: String,
    pub node: Option<String>,
    pub detail: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} on {node}: {}", self.check, self.detail),
            None => write!(f, "{}: {}", self.check, self.detail),
        }
    }
}

/// The cluster did not pass its health checks in time.
#[derive(Debug, Clone)]
pub struct NotReadyError {
    pub cluster_id: String,
    /// Rounds that ran.
    pub attempts: u32,
    pub elapsed: Duration,
    /// Failures of the last round that ran.
    pub last_failures: Vec<CheckFailure>,
}

impl fmt::Display for NotReadyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cluster \"{}\" was not ready after {} attempt(s) in {:.0?}",
            self.cluster_id, self.attempts, self.elapsed
        )?;
        for failure in &self.last_failures {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for NotReadyError {}

/// What a check can see.
pub struct CheckContext<'a> {
    pub cluster: &'a Cluster,
    pub transport: &'a dyn Transport,
    pub deadline: Option<Instant>,
}

/// A readiness check. An empty result means the check passed.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, ctx: &CheckContext<'_>) -> Vec<CheckFailure>;
}

/// Runs the node-local post-start health command on every node.
#[derive(Debug, Clone)]
pub struct NodePoststartCheck {
    concurrency: usize,
}

impl NodePoststartCheck {
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    async fn check_node(&self, node: &Node, ctx: &CheckContext<'_>) -> Option<CheckFailure> {
        let opts = RunOptions::new().deadline(ctx.deadline);
        let sudo = opts.user_for(node) != "root";
        let opts = opts.sudo(sudo);
        let failure = |detail: String| CheckFailure {
            check: self.name().to_string(),
            node: Some(node.to_string()),
            detail,
        };

        match ctx
            .transport
            .run(node, &RemoteCommand::argv(NODE_POSTSTART_COMMAND), &opts)
            .await
        {
            Ok(output) if output.success() => None,
            Ok(output) => {
                let text = if output.stderr.trim().is_empty() {
                    output.stdout.trim()
                } else {
                    output.stderr.trim()
                };
                Some(failure(format!("exit code {}: {text}", output.exit_code)))
            }
            Err(e) => Some(failure(e.to_string())),
        }
    }
}

#[async_trait]
impl ReadinessCheck for NodePoststartCheck {
    fn name(&self) -> &str {
        "node-poststart"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> Vec<CheckFailure> {
        let pending: Vec<BoxFuture<'_, Option<CheckFailure>>> = ctx
            .cluster
            .all_nodes()
            .map(|(_, node)| self.check_node(node, ctx).boxed())
            .collect();
        let results: Vec<Option<CheckFailure>> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.into_iter().flatten().collect()
    }
}

/// Probes each master's HTTP endpoint; 200 means healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpHealthCheck {
    /// Probe `http://<master>:<port><path>` with a 10 second timeout,
    /// bypassing any proxy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(port: u16, path: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .no_proxy()
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP health check client: {e}")))?;
        Ok(Self {
            client,
            port,
            path: path.into(),
        })
    }

    fn url(&self, node: &Node) -> String {
        let host = match node.public_ip() {
            std::net::IpAddr::V4(v4) => v4.to_string(),
            std::net::IpAddr::V6(v6) => format!("[{v6}]"),
        };
        format!("http://{host}:{}{}", self.port, self.path)
    }

    async fn check_master(&self, node: &Node) -> Option<CheckFailure> {
        let url = self.url(node);
        let failure = |detail: String| CheckFailure {
            check: self.name().to_string(),
            node: Some(node.to_string()),
            detail,
        };
        match self.client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => None,
            Ok(response) => Some(failure(format!("GET {url} returned {}", response.status()))),
            Err(e) => Some(failure(format!("GET {url} failed: {e}"))),
        }
    }
}

#[async_trait]
impl ReadinessCheck for HttpHealthCheck {
    fn name(&self) -> &str {
        "http-health"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> Vec<CheckFailure> {
        let requests = ctx.cluster.masters().iter().map(|node| self.check_master(node));
        futures::future::join_all(requests)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Run one round: checks in order, stopping at the first that fails.
async fn run_round(checks: &[Arc<dyn ReadinessCheck>], ctx: &CheckContext<'_>) -> Vec<CheckFailure> {
    for check in checks {
        let failures = check.check(ctx).await;
        if !failures.is_empty() {
            debug!(check = check.name(), failures = failures.len(), "Check failed");
            return failures;
        }
    }
    Vec::new()
}

fn deadline_failure() -> CheckFailure {
    CheckFailure {
        check: "deadline".to_string(),
        node: None,
        detail: "the deadline passed before a check round completed".to_string(),
    }
}

/// Poll `checks` until one round passes.
///
/// Never returns success unless a full round passed.
///
/// # Errors
///
/// Returns [`NotReadyError`] with the last round's failures once the
/// attempt budget, the policy timeout or `ctx.deadline` is exhausted.
pub async fn wait_for_checks(
    cluster_id: &str,
    checks: &[Arc<dyn ReadinessCheck>],
    cluster: &Cluster,
    transport: &dyn Transport,
    policy: &PollPolicy,
    deadline: Option<Instant>,
) -> Result<u32, NotReadyError> {
    let started = Instant::now();
    let overall = match deadline {
        Some(deadline) => deadline.min(started + policy.timeout),
        None => started + policy.timeout,
    };
    let ctx = CheckContext {
        cluster,
        transport,
        deadline: Some(overall),
    };

    let mut attempts = 0;
    let mut last_failures = Vec::new();
    let not_ready = |attempts, mut last_failures: Vec<CheckFailure>| {
        if last_failures.is_empty() {
            last_failures.push(deadline_failure());
        }
        NotReadyError {
            cluster_id: cluster_id.to_string(),
            attempts,
            elapsed: started.elapsed(),
            last_failures,
        }
    };

    while policy.should_retry(attempts) {
        attempts += 1;
        let Ok(failures) = tokio::time::timeout_at(overall, run_round(checks, &ctx)).await else {
            warn!(cluster_id, attempts, "Readiness deadline passed during a check round");
            return Err(not_ready(attempts, last_failures));
        };

        if failures.is_empty() {
            info!(cluster_id, attempts, elapsed = ?started.elapsed(), "Cluster is ready");
            return Ok(attempts);
        }
        last_failures = failures;

        if !policy.should_retry(attempts) {
            break;
        }
        let delay = policy.delay_for_attempt(attempts - 1);
        if Instant::now() + delay >= overall {
            break;
        }
        debug!(cluster_id, attempts, delay = ?delay, "Cluster not ready yet");
        tokio::time::sleep(delay).await;
    }

    warn!(cluster_id, attempts, "Cluster did not become ready");
    Err(not_ready(attempts, last_failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::transport::{CommandOutput, TransportError, TransportKind};
    use std::path::Path;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Ssh
        }

        async fn run(
            &self,
            node: &Node,
            _command: &RemoteCommand,
            _opts: &RunOptions,
        ) -> Result<CommandOutput, TransportError> {
            Err(TransportError::Unreachable {
                node: node.to_string(),
                transport: TransportKind::Ssh,
                detail: "not used".to_string(),
            })
        }

        async fn copy(
            &self,
            _node: &Node,
            _local: &Path,
            _remote: &Path,
            _opts: &RunOptions,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Fails every command and records how many ran at once.
    #[derive(Default)]
    struct CountingTransport {
        running: AtomicU32,
        peak: AtomicU32,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::DockerExec
        }

        async fn run(
            &self,
            _node: &Node,
            _command: &RemoteCommand,
            _opts: &RunOptions,
        ) -> Result<CommandOutput, TransportError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "unhealthy\n".to_string(),
            })
        }

        async fn copy(
            &self,
            _node: &Node,
            _local: &Path,
            _remote: &Path,
            _opts: &RunOptions,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Fails a fixed number of times, then passes.
    struct Flaky {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ReadinessCheck for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn check(&self, _ctx: &CheckContext<'_>) -> Vec<CheckFailure> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left == 0 {
                return Vec::new();
            }
            self.failures_left.store(left - 1, Ordering::SeqCst);
            vec![CheckFailure {
                check: "flaky".to_string(),
                node: Some("10.0.0.1".to_string()),
                detail: format!("{left} failures left"),
            }]
        }
    }

    fn cluster(ip: &str) -> Cluster {
        let ip = ip.parse().unwrap();
        Cluster::new(
            BTreeSet::from([Node::new(ip, ip, "root")]),
            BTreeSet::new(),
            BTreeSet::new(),
        )
        .unwrap()
    }

    fn fast_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            max_attempts,
            interval: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_poll_policy_backoff() {
        let policy = PollPolicy {
            interval: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            ..PollPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));

        let fixed = PollPolicy::default();
        assert_eq!(fixed.delay_for_attempt(7), fixed.interval);
        assert!(fixed.should_retry(719));
        assert!(!fixed.should_retry(720));
    }

    #[tokio::test]
    async fn test_budget_above_failures_succeeds() {
        let checks: Vec<Arc<dyn ReadinessCheck>> = vec![Arc::new(Flaky {
            failures_left: AtomicU32::new(3),
        })];
        let attempts = wait_for_checks("c", &checks, &cluster("10.0.0.1"), &NoTransport, &fast_policy(4), None)
            .await
            .unwrap();
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn test_budget_below_failures_reports_last_snapshot() {
        let checks: Vec<Arc<dyn ReadinessCheck>> = vec![Arc::new(Flaky {
            failures_left: AtomicU32::new(3),
        })];
        let err = wait_for_checks("c", &checks, &cluster("10.0.0.1"), &NoTransport, &fast_policy(3), None)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_failures.len(), 1);
        assert_eq!(err.last_failures[0].detail, "1 failures left");
        assert!(err.to_string().contains("flaky on 10.0.0.1"));
    }

    #[tokio::test]
    async fn test_past_deadline_never_succeeds_silently() {
        let checks: Vec<Arc<dyn ReadinessCheck>> = vec![Arc::new(Flaky {
            failures_left: AtomicU32::new(1_000),
        })];
        let policy = PollPolicy {
            max_attempts: u32::MAX,
            interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            ..PollPolicy::default()
        };
        let err = wait_for_checks("c", &checks, &cluster("10.0.0.1"), &NoTransport, &policy, None)
            .await
            .unwrap_err();
        assert!(err.attempts >= 1);
        assert!(!err.last_failures.is_empty());
    }

    #[tokio::test]
    async fn test_poststart_check_reports_transport_errors_per_node() {
        let check = NodePoststartCheck::new(4);
        let cluster = cluster("10.0.0.1");
        let ctx = CheckContext {
            cluster: &cluster,
            transport: &NoTransport,
            deadline: None,
        };
        let failures = check.check(&ctx).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].check, "node-poststart");
        assert_eq!(failures[0].node.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_poststart_check_covers_every_node_with_bounded_concurrency() {
        let node = |ip: &str| {
            let ip = ip.parse().unwrap();
            Node::new(ip, ip, "root")
        };
        let cluster = Cluster::new(
            BTreeSet::from([node("10.0.0.1")]),
            BTreeSet::from([node("10.0.0.2"), node("10.0.0.3"), node("10.0.0.4")]),
            BTreeSet::from([node("10.0.0.5")]),
        )
        .unwrap();
        let transport = CountingTransport::default();
        let ctx = CheckContext {
            cluster: &cluster,
            transport: &transport,
            deadline: None,
        };

        let failures = NodePoststartCheck::new(2).check(&ctx).await;

        let mut nodes: Vec<_> = failures.iter().filter_map(|f| f.node.clone()).collect();
        nodes.sort();
        assert_eq!(
            nodes,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]
        );
        assert!(failures.iter().all(|f| f.detail == "exit code 1: unhealthy"));
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_http_check_against_master() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEFAULT_HEALTH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"version\": \"1.12\"}"))
            .mount(&server)
            .await;

        let check = HttpHealthCheck::new(server.address().port(), DEFAULT_HEALTH_PATH).unwrap();
        let cluster = cluster("127.0.0.1");
        let ctx = CheckContext {
            cluster: &cluster,
            transport: &NoTransport,
            deadline: None,
        };
        assert!(check.check(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_http_check_non_200_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let check = HttpHealthCheck::new(server.address().port(), DEFAULT_HEALTH_PATH).unwrap();
        let cluster = cluster("127.0.0.1");
        let ctx = CheckContext {
            cluster: &cluster,
            transport: &NoTransport,
            deadline: None,
        };
        let failures = check.check(&ctx).await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].detail.contains("503"));
    }
}
