//! End-to-end happy path test.
//!
//! Three peers over loopback: a resource authority, a leader agent and a
//! worker agent. The test validates:
//!
//! 1. Leader joins through the authority and requests resources
//! 2. Worker joins through the leader and learns the authority
//! 3. Both agents stage and apply their deployments
//! 4. Peers answer state queries
//! 5. Stopping the agents disconnects them from the authority
//!
//! ## Running
//!
//! ```bash
//! cargo test -p swarm-e2e --test happy_path
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use swarm_agent::messages::{self, MSG_GETSTATE, MSG_RESOURCE_REQUEST, MSG_STATE};
use swarm_agent::{Agent, AgentConfig, JoinResult, MockOrchestrator, Stage};
use swarm_overlay::{Body, MessageSink, Overlay, OverlayHandle, PeerConfig};
use tracing::info;

const TOPOLOGY: &str = r#"
tosca_definitions_version: tosca_simple_yaml_1_3
topology_template:
  node_templates:
    Storefront:
      type: tosca.nodes.Container.Application
      properties:
        image: shop/storefront:1.4
        replicas: 2
        ports: [8080]
        config:
          CATALOG_URL: http://catalog:5432
    Catalog:
      type: tosca.nodes.Container.Application
      properties:
        image: postgres:16-alpine
        volumes:
          - name: data
            mount_path: /var/lib/postgresql/data
            size: 1Gi
"#;

type Inbox = Arc<Mutex<Vec<(String, String, Body)>>>;

struct AuthoritySink {
    handle: OverlayHandle,
    inbox: Inbox,
}

impl MessageSink for AuthoritySink {
    fn deliver(&self, from: &str, tag: &str, body: &Body) {
        self.inbox
            .lock()
            .unwrap()
            .push((from.to_string(), tag.to_string(), body.clone()));
        if tag == MSG_RESOURCE_REQUEST {
            let _ = self.handle.post(
                from,
                messages::MSG_RESOURCE_RESPONSE,
                messages::resource_response("shop"),
            );
        }
    }
}

fn received(inbox: &Inbox, from: &str, tag: &str) -> Vec<Body> {
    inbox
        .lock()
        .unwrap()
        .iter()
        .filter(|(f, t, _)| f == from && t == tag)
        .map(|(_, _, body)| body.clone())
        .collect()
}

fn agent_config(id: &str, role: &str, bootstrap_port: u16) -> AgentConfig {
    AgentConfig::from_yaml_str(&format!(
        r#"
SA_id: {id}
password: e2e-password
universe_id: uni-e2e
api_ip: 127.0.0.1
api_port: 8080
p2p_public_ip: 127.0.0.1
p2p_public_port: 0
p2p_listen_ip: 127.0.0.1
p2p_listen_port: 0
app_id: shop
resource_id: res-e2e
SA_role: {role}
authority_id: authority
bootstrap_ip: 127.0.0.1
bootstrap_port: {bootstrap_port}
join_timeout_secs: 5
namespace: shop
"#
    ))
    .unwrap()
}

fn start_agent(
    config: AgentConfig,
    topology: &Path,
    staging: &Path,
    orchestrator: Arc<MockOrchestrator>,
) -> Arc<Agent> {
    Arc::new(
        Agent::new(config, topology)
            .with_staging_dir(staging)
            .with_orchestrator(orchestrator),
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn e2e_happy_path_authority_leader_worker() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,swarm_overlay=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let workdir = tempfile::tempdir().unwrap();
    let topology = workdir.path().join("tosca.yaml");
    std::fs::write(&topology, TOPOLOGY).unwrap();

    // Authority.
    let overlay =
        Overlay::new(PeerConfig::new("authority", "127.0.0.1", 0, "127.0.0.1", 0)).unwrap();
    let authority = overlay.handle();
    let authority_port = overlay.local_addr().port();
    let inbox: Inbox = Arc::default();
    overlay
        .spawn(Arc::new(AuthoritySink {
            handle: authority.clone(),
            inbox: inbox.clone(),
        }))
        .unwrap();
    info!(port = authority_port, "Authority listening");

    // Leader joins through the authority.
    let leader_orchestrator = Arc::new(MockOrchestrator::new());
    let leader = start_agent(
        agent_config("lsa", "leader", authority_port),
        &topology,
        &workdir.path().join("lsa"),
        leader_orchestrator.clone(),
    );
    leader.start().await.unwrap();

    assert_eq!(leader.stage(), Stage::Running);
    assert_eq!(leader.join_result(), Some(JoinResult::Success));
    wait_for("resource request", || {
        !received(&inbox, "lsa", MSG_RESOURCE_REQUEST).is_empty()
    })
    .await;
    assert_eq!(
        serde_json::Value::Object(received(&inbox, "lsa", MSG_RESOURCE_REQUEST)[0].clone()),
        json!({"cpu": "2"})
    );

    // Worker joins through the leader's overlay listener.
    let leader_port = leader.overlay_addr().unwrap().port();
    let worker_orchestrator = Arc::new(MockOrchestrator::new());
    let worker = start_agent(
        agent_config("sa-1", "worker", leader_port),
        &topology,
        &workdir.path().join("sa-1"),
        worker_orchestrator.clone(),
    );
    worker.start().await.unwrap();

    assert_eq!(worker.join_result(), Some(JoinResult::Success));
    assert!(!worker.history().contains(&Stage::RequestingResources));
    wait_for("worker to learn the authority", || {
        worker.connected_peers().contains("authority")
    })
    .await;
    wait_for("authority to see both agents", || {
        let peers = authority.connected_peers();
        peers.contains("lsa") && peers.contains("sa-1")
    })
    .await;

    // Both agents staged and applied the same deployments.
    for orchestrator in [&leader_orchestrator, &worker_orchestrator] {
        let applied: Vec<String> = orchestrator
            .applied()
            .iter()
            .map(|a| a.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            applied,
            ["Deployment-catalog.yaml", "Deployment-storefront.yaml"]
        );
        assert!(orchestrator.applied().iter().all(|a| a.namespace == "shop"));
    }
    assert!(workdir.path().join("sa-1/Deployment-storefront.yaml").exists());

    // State queries are answered by each agent.
    for peer in ["lsa", "sa-1"] {
        authority
            .send(peer, MSG_GETSTATE, messages::get_state("shop"))
            .await
            .unwrap();
    }
    wait_for("state replies", || {
        !received(&inbox, "lsa", MSG_STATE).is_empty()
            && !received(&inbox, "sa-1", MSG_STATE).is_empty()
    })
    .await;
    assert_eq!(
        serde_json::Value::Object(received(&inbox, "sa-1", MSG_STATE)[0].clone()),
        json!({"appid": "shop", "state": "running"})
    );

    // Stopping disconnects the agents.
    worker.stop();
    leader.stop();
    assert!(!worker.is_running());
    assert!(!leader.is_running());
    wait_for("agents to disconnect", || authority.connected_peers().is_empty()).await;

    authority.shutdown();
}
