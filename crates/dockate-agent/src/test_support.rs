use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use common::api::{
    ClusterSnapshot, ContainerSpec, EndpointPort, NodeDescription, NodeStatus, RawNode,
    RawService, ServiceEndpoint, ServiceEntry, ServiceSpec, TaskTemplate, VirtualIp,
};
use tempfile::TempDir;

use crate::{
    build_client, config,
    consumer::{ConfigConsumer, ConsumerError},
    orchestrator::{
        DESIRED_RUNNING, Orchestrator, OrchestratorError, TaskRow,
        ssh::{SshOptions, SshTarget},
    },
};

pub(crate) static ENV_LOCK: StdMutex<()> = StdMutex::new(());

pub(crate) fn base_config() -> config::AppConfig {
    config::AppConfig {
        swarm_host: "manager.local".into(),
        swarm_port_http: 2375,
        swarm_port_ssh: 22,
        swarm_username: Some("deploy".into()),
        ssh_binary: PathBuf::from("ssh"),
        ssh_identity_file: None,
        ssh_host_key_checking: config::SshHostKeyChecking::AcceptNew,
        ssh_connect_timeout_secs: 2,
        ssh_command_timeout_secs: 5,
        http_timeout_secs: 5,
        cycle_timeout_secs: 5,
        interval_between_check_services_ms: 0,
        consumer: "log".into(),
        consumer_settings: HashMap::new(),
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
        serve_metrics: false,
    }
}

pub(crate) struct EnvVarGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvVarGuard {
    pub(crate) fn set(key: &'static str, value: impl Into<String>) -> Self {
        let prev = env::var(key).ok();
        // SAFETY: Tests hold ENV_LOCK to serialize env mutations.
        unsafe {
            env::set_var(key, value.into());
        }
        Self { key, prev }
    }

    pub(crate) fn unset(key: &'static str) -> Self {
        let prev = env::var(key).ok();
        // SAFETY: Tests hold ENV_LOCK to serialize env mutations.
        unsafe {
            env::remove_var(key);
        }
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // SAFETY: Tests hold ENV_LOCK to serialize env mutations.
        unsafe {
            match &self.prev {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("set perms");
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

/// Master body that reports ready and stays up until killed.
pub(crate) const READY_MASTER: &str = "touch \"$root/master.ready\"; exec sleep 30";

/// Writes a fake `ssh` into a tempdir. Every invocation is appended to
/// `calls.log` as `master|control|exec <args>`. Control requests succeed
/// once the master body has created `master.ready`. Bodies can refer to
/// the tempdir as `$root`.
pub(crate) fn fake_ssh(master: &str, exec: &str) -> (TempDir, SshTarget) {
    let dir = tempfile::tempdir().expect("tempdir");
    let program = dir.path().join("ssh");
    let script = format!(
        r#"#!/bin/sh
root='{root}'
mode=exec
for arg in "$@"; do
  case "$arg" in
    -M) mode=master ;;
    -O) mode=control ;;
  esac
done
echo "$mode $*" >> "$root/calls.log"
case "$mode" in
  master)
    {master}
    ;;
  control)
    [ -f "$root/master.ready" ] || exit 255
    exit 0
    ;;
  exec)
    {exec}
    ;;
esac
"#,
        root = dir.path().display(),
    );
    fs::write(&program, script).expect("write fake ssh");
    make_executable(&program);

    let target = SshTarget {
        program,
        host: "manager.local".into(),
        user: Some("deploy".into()),
        port: 2222,
        identity_file: Some(PathBuf::from("/keys/id_ed25519")),
        options: SshOptions {
            connect_timeout_secs: 2,
            command_timeout: Duration::from_secs(5),
            ..SshOptions::default()
        },
    };
    (dir, target)
}

pub(crate) fn fake_ssh_calls(dir: &TempDir) -> String {
    fs::read_to_string(dir.path().join("calls.log")).unwrap_or_default()
}

pub(crate) fn sample_node(id: &str, hostname: &str, addr: &str) -> RawNode {
    RawNode {
        id: id.into(),
        description: NodeDescription {
            hostname: hostname.into(),
        },
        status: NodeStatus {
            state: Some("ready".into()),
            addr: addr.into(),
        },
        ..RawNode::default()
    }
}

pub(crate) fn sample_service(
    name: &str,
    labels: &[(&str, &str)],
    ports: &[(u16, Option<u16>)],
    vips: &[&str],
) -> RawService {
    RawService {
        id: format!("svc-{name}"),
        spec: ServiceSpec {
            name: name.into(),
            labels: HashMap::new(),
            task_template: TaskTemplate {
                container_spec: ContainerSpec {
                    image: Some(format!("example/{name}:latest")),
                    labels: labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                },
            },
        },
        endpoint: ServiceEndpoint {
            ports: ports
                .iter()
                .map(|(target, published)| EndpointPort {
                    protocol: Some("tcp".into()),
                    target_port: *target,
                    published_port: *published,
                    publish_mode: Some("ingress".into()),
                })
                .collect(),
            virtual_ips: vips
                .iter()
                .map(|addr| VirtualIp {
                    network_id: "ingress".into(),
                    addr: addr.to_string(),
                })
                .collect(),
        },
    }
}

pub(crate) fn task(name: &str, desired: &str) -> TaskRow {
    TaskRow {
        id: format!("id-{name}"),
        name: name.into(),
        image: "example/app:latest".into(),
        node: "swarm-1".into(),
        desired_state: desired.into(),
        current_state: format!("{desired} 2 minutes ago"),
        ..TaskRow::default()
    }
}

pub(crate) fn running_task(name: &str) -> TaskRow {
    task(name, DESIRED_RUNNING)
}

/// Snapshot holding only service names and virtual IPs.
pub(crate) fn snapshot_with(services: &[(&str, &[&str])]) -> ClusterSnapshot {
    ClusterSnapshot {
        nodes: Vec::new(),
        services: services
            .iter()
            .map(|(name, vips)| {
                (
                    name.to_string(),
                    ServiceEntry {
                        name: name.to_string(),
                        ports: BTreeMap::new(),
                        constraints: Vec::new(),
                        virtual_ips: vips.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>(),
                        nodes: Vec::new(),
                    },
                )
            })
            .collect(),
    }
}

#[derive(Default)]
struct FakeCluster {
    nodes: Vec<RawNode>,
    services: Vec<RawService>,
    tasks: HashMap<String, Vec<TaskRow>>,
    services_error: Option<String>,
    tasks_error: Option<String>,
    nodes_delay: Option<Duration>,
    calls: HashMap<&'static str, usize>,
}

/// In-memory orchestrator with per-operation call counters.
#[derive(Default)]
pub(crate) struct FakeOrchestrator {
    inner: StdMutex<FakeCluster>,
}

impl FakeOrchestrator {
    pub(crate) fn with_cluster(
        nodes: Vec<RawNode>,
        services: Vec<RawService>,
        tasks: Vec<(&str, Vec<TaskRow>)>,
    ) -> Self {
        Self {
            inner: StdMutex::new(FakeCluster {
                nodes,
                services,
                tasks: tasks
                    .into_iter()
                    .map(|(node, rows)| (node.to_string(), rows))
                    .collect(),
                ..FakeCluster::default()
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeCluster) -> R) -> R {
        let mut guard = self.inner.lock().expect("fake orchestrator lock");
        f(&mut guard)
    }

    pub(crate) fn set_services(&self, services: Vec<RawService>) {
        self.with_state(|state| state.services = services);
    }

    pub(crate) fn fail_services(&self, message: &str) {
        self.with_state(|state| state.services_error = Some(message.to_string()));
    }

    pub(crate) fn fail_tasks(&self, message: &str) {
        self.with_state(|state| state.tasks_error = Some(message.to_string()));
    }

    pub(crate) fn clear_failures(&self) {
        self.with_state(|state| {
            state.services_error = None;
            state.tasks_error = None;
        });
    }

    pub(crate) fn delay_nodes(&self, delay: Duration) {
        self.with_state(|state| state.nodes_delay = Some(delay));
    }

    pub(crate) fn calls(&self, operation: &str) -> usize {
        self.with_state(|state| state.calls.get(operation).copied().unwrap_or(0))
    }

    fn record(&self, operation: &'static str) {
        self.with_state(|state| *state.calls.entry(operation).or_default() += 1);
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_nodes(&self) -> Result<Vec<RawNode>, OrchestratorError> {
        self.record("list_nodes");
        if let Some(delay) = self.with_state(|state| state.nodes_delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(self.with_state(|state| state.nodes.clone()))
    }

    async fn list_services(&self) -> Result<Vec<RawService>, OrchestratorError> {
        self.record("list_services");
        self.with_state(|state| match &state.services_error {
            Some(message) => Err(OrchestratorError::Response {
                url: "http://manager.local:2375/services".into(),
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: message.clone(),
            }),
            None => Ok(state.services.clone()),
        })
    }

    async fn list_tasks(&self, node_id: &str) -> Result<Vec<TaskRow>, OrchestratorError> {
        self.record("list_tasks");
        self.with_state(|state| match &state.tasks_error {
            Some(message) => Err(OrchestratorError::Session {
                destination: "deploy@manager.local".into(),
                message: message.clone(),
            }),
            None => Ok(state.tasks.get(node_id).cloned().unwrap_or_default()),
        })
    }

    async fn stop(&self) -> Result<(), OrchestratorError> {
        self.record("stop");
        Ok(())
    }
}

#[derive(Default)]
struct Recorded {
    snapshots: Vec<ClusterSnapshot>,
    stops: usize,
    failure: Option<String>,
}

/// Consumer that keeps every snapshot it receives.
#[derive(Default)]
pub(crate) struct RecordingConsumer {
    inner: StdMutex<Recorded>,
}

impl RecordingConsumer {
    pub(crate) fn snapshots(&self) -> Vec<ClusterSnapshot> {
        self.inner.lock().expect("consumer lock").snapshots.clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.inner.lock().expect("consumer lock").stops
    }

    pub(crate) fn fail_with(&self, message: &str) {
        self.inner.lock().expect("consumer lock").failure = Some(message.to_string());
    }
}

#[async_trait]
impl ConfigConsumer for RecordingConsumer {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn required_config_keys(&self) -> &'static [&'static str] {
        &[]
    }

    async fn update_conf(&self, snapshot: &ClusterSnapshot) -> Result<(), ConsumerError> {
        let mut inner = self.inner.lock().expect("consumer lock");
        if let Some(message) = &inner.failure {
            return Err(ConsumerError::Io {
                path: PathBuf::from("/var/lib/dockate/routes.json"),
                source: std::io::Error::other(message.clone()),
            });
        }
        inner.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        self.inner.lock().expect("consumer lock").stops += 1;
        Ok(())
    }
}

#[tokio::test]
async fn build_client_sets_agent_headers() {
    let cfg = base_config();
    let client = build_client(&cfg).expect("client");
    let server = httpmock::MockServer::start_async().await;

    let mock = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/check")
                .header(crate::AGENT_VERSION_HEADER, crate::VERSION)
                .header("user-agent", format!("dockate-agent/{}", crate::VERSION));
            then.status(200);
        })
        .await;

    client
        .get(server.url("/check"))
        .send()
        .await
        .expect("request");
    mock.assert_async().await;
}
