//! Lifecycle tests against the in-memory runtime

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use kube::config::Kubeconfig;

use k3d_lifecycle::{
    config::Config,
    error::AppError,
    k3d::{resources::ImageDefaults, ClusterManager, ImageLoader, KubeconfigExporter, NodeManager, RegistryManager},
    models::{
        Action, ClusterTopology, ConnectionState, ImageLoadRequest, NodeBatch, ProxyConfig,
        RegistryQuery, RegistryRequest, Target,
    },
    runtime::{Fault, LabelSelector, MemoryRuntime, NodeRole, Runtime},
};

struct Harness {
    runtime: Arc<MemoryRuntime>,
    clusters: ClusterManager,
    nodes: NodeManager,
    registries: RegistryManager,
    kubeconfig: KubeconfigExporter,
    images: ImageLoader,
}

fn setup() -> Harness {
    let runtime = Arc::new(MemoryRuntime::new());
    let shared: Arc<dyn Runtime> = runtime.clone();
    let images = ImageDefaults::from_config(&Config::default());
    Harness {
        clusters: ClusterManager::new(shared.clone(), images.clone(), None),
        nodes: NodeManager::new(shared.clone(), images.clone()),
        registries: RegistryManager::new(shared.clone(), images),
        kubeconfig: KubeconfigExporter::new(shared.clone(), None),
        images: ImageLoader::new(shared),
        runtime,
    }
}

fn topology(name: &str, servers: u32, agents: u32) -> ClusterTopology {
    ClusterTopology {
        name: name.to_string(),
        servers,
        agents,
        ..Default::default()
    }
}

fn batch(cluster: &str, name: &str, count: u32) -> NodeBatch {
    NodeBatch {
        name: name.to_string(),
        cluster: cluster.to_string(),
        role: NodeRole::Agent,
        count,
        start_from: 0,
        image: None,
        memory: None,
        wait: false,
        timeout_secs: None,
        batch: Some("batch-1".to_string()),
    }
}

fn registry(name: &str) -> RegistryRequest {
    RegistryRequest {
        name: name.to_string(),
        protocol: "http".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_double_create_yields_one_cluster() {
    let h = setup();
    let cluster = h.clusters.create(&topology("dev", 1, 1)).await.unwrap();
    assert_eq!(cluster.servers_count, 1);
    assert_eq!(cluster.agents_count, 1);
    assert!(cluster.has_loadbalancer);
    assert_eq!(cluster.network, "k3d-dev");

    let err = h.clusters.create(&topology("dev", 1, 1)).await.unwrap_err();
    assert!(err.is_already_exists());

    let all = h.clusters.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(h.runtime.container_names().await.len(), 3);
}

#[tokio::test]
async fn test_failed_cluster_create_is_rolled_back() {
    let h = setup();
    h.runtime.inject(Fault::CreateContainers { after: 1 }).await;

    let err = h.clusters.create(&topology("dev", 1, 2)).await.unwrap_err();
    match err {
        AppError::PartialCreate { rollback, .. } => assert!(rollback.is_none()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.runtime.container_names().await.is_empty());
    assert!(!h.runtime.network_exists("k3d-dev").await);
    assert!(!h.runtime.volume_exists("k3d-dev-images").await);
    assert!(h.clusters.get("dev").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failed_node_batch_leaves_no_batch_nodes() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.runtime.inject(Fault::CreateContainers { after: 2 }).await;

    let err = h.nodes.create_batch(&batch("dev", "extra", 3)).await.unwrap_err();
    assert!(matches!(err, AppError::PartialCreate { .. }));

    let leftovers = h
        .nodes
        .by_labels(&LabelSelector::cluster("dev").with_batch("batch-1"))
        .await
        .unwrap();
    assert!(leftovers.is_empty());
    assert_eq!(h.clusters.get("dev").await.unwrap().servers_count, 1);
}

#[tokio::test]
async fn test_name_clash_rollback_keeps_existing_node() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 1)).await.unwrap();

    // the first synthesized name is the existing agent's
    let err = h
        .nodes
        .create_batch(&batch("dev", "k3d-dev-agent", 2))
        .await
        .unwrap_err();
    match err {
        AppError::PartialCreate { cause, .. } => assert!(cause.is_already_exists()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.nodes.get("k3d-dev-agent-0").await.is_ok());
}

#[tokio::test]
async fn test_node_batch_names_and_lifecycle() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();

    let mut request = batch("dev", "extra", 3);
    request.start_from = 1;
    let nodes = h.nodes.create_batch(&request).await.unwrap();
    let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["extra-1", "extra-2"]);
    assert!(nodes.iter().all(|n| n.batch.as_deref() == Some("batch-1")));

    let stopped = h
        .nodes
        .start_stop("dev", &Target::Names(vec!["extra-1".to_string()]), Action::Stop)
        .await
        .unwrap();
    assert_eq!(stopped.len(), 1);
    assert!(!stopped[0].running);

    h.nodes.delete("dev", &["extra-1".to_string(), "extra-2".to_string()]).await.unwrap();
    assert!(h.nodes.filter("dev", &["extra-2".to_string()]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_filtered_get_requires_every_name() {
    let h = setup();
    h.clusters.create(&topology("a", 1, 0)).await.unwrap();

    let err = h
        .clusters
        .get_filtered(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("b"));

    let found = h.clusters.get_filtered(&["a".to_string()]).await.unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_connect_then_disconnect_is_idempotent() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.registries.create(&registry("mirror")).await.unwrap();
    let names = vec!["mirror".to_string()];

    let connected = h.registries.connect(&names, "dev").await.unwrap();
    assert_eq!(connected[0].state, ConnectionState::Connected);
    // connecting twice is not an error
    h.registries.connect(&names, "dev").await.unwrap();

    let disconnected = h.registries.disconnect(&names, "dev").await.unwrap();
    assert_eq!(disconnected[0].state, ConnectionState::Disconnected);
    let again = h.registries.disconnect(&names, "dev").await.unwrap();
    assert_eq!(again[0].state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_kubeconfig_export_round_trip() {
    let h = setup();
    h.clusters.create(&topology("c1", 1, 0)).await.unwrap();
    let target = Target::Names(vec!["c1".to_string()]);

    let plain = h.kubeconfig.export(&target, true).await.unwrap();
    assert_eq!(plain.len(), 1);
    let parsed = Kubeconfig::from_yaml(&plain[0].kubeconfig).unwrap();
    assert!(parsed.contexts.iter().any(|c| c.name == "k3d-c1"));

    let encoded = h.kubeconfig.export(&target, false).await.unwrap();
    let decoded = STANDARD.decode(&encoded[0].kubeconfig).unwrap();
    assert_eq!(String::from_utf8(decoded).unwrap(), plain[0].kubeconfig);
}

#[tokio::test]
async fn test_kubeconfig_export_aborts_on_first_failure() {
    let h = setup();
    h.clusters.create(&topology("c1", 1, 0)).await.unwrap();
    h.runtime.inject(Fault::Kubeconfig("c1".to_string())).await;

    assert!(h.kubeconfig.export(&Target::All, true).await.is_err());
}

#[tokio::test]
async fn test_create_delete_get_default_cluster() {
    let h = setup();
    h.clusters.create(&topology("k3s-default", 1, 0)).await.unwrap();
    h.clusters.delete("k3s-default").await.unwrap();

    let err = h.clusters.get("k3s-default").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!h.runtime.network_exists("k3d-k3s-default").await);
    assert!(!h.runtime.volume_exists("k3d-k3s-default-images").await);

    // deleting again is a no-op
    h.clusters.delete("k3s-default").await.unwrap();
}

#[tokio::test]
async fn test_delete_detaches_shared_registry() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.registries.create(&registry("mirror")).await.unwrap();
    h.registries.connect(&["mirror".to_string()], "dev").await.unwrap();

    h.clusters.delete("dev").await.unwrap();
    let left = h.registries.get(&RegistryQuery { all: true, ..Default::default() }).await.unwrap();
    assert_eq!(left.len(), 1);
    assert!(!left[0].networks.iter().any(|n| n == "k3d-dev"));
}

#[tokio::test]
async fn test_incomplete_proxy_not_applied() {
    let h = setup();
    let mut request = registry("mirror");
    request.use_proxy = true;
    request.proxy = Some(ProxyConfig {
        remote_url: "https://registry-1.docker.io".to_string(),
        username: "user".to_string(),
        password: String::new(),
    });

    let created = h.registries.create(&request).await.unwrap();
    assert!(created.proxy.is_none());
}

#[tokio::test]
async fn test_cluster_stop_and_start() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 2)).await.unwrap();
    let target = Target::Names(vec!["dev".to_string()]);

    let stopped = h.clusters.start_stop(&target, Action::Stop).await.unwrap();
    assert_eq!(stopped[0].servers_running, 0);
    assert_eq!(stopped[0].agents_running, 0);

    let started = h.clusters.start_stop(&target, Action::Start).await.unwrap();
    assert_eq!(started[0].servers_running, 1);
    assert_eq!(started[0].agents_running, 2);
}

#[tokio::test]
async fn test_image_load_targets_cluster_nodes() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 1)).await.unwrap();

    let loaded = h
        .images
        .load(&ImageLoadRequest {
            images: vec!["nginx:1.25".to_string()],
            target: Target::All,
            keep_tarball: false,
        })
        .await
        .unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(h.runtime.images_on("k3d-dev-server-0").await, vec!["nginx:1.25".to_string()]);
    assert!(h.runtime.images_on("k3d-dev-serverlb").await.is_empty());
}

#[tokio::test]
async fn test_reused_batch_label_keeps_earlier_nodes() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.nodes.create_batch(&batch("dev", "extra", 2)).await.unwrap();

    // same label, names overlapping the first batch
    let err = h.nodes.create_batch(&batch("dev", "extra", 3)).await.unwrap_err();
    match err {
        AppError::PartialCreate { cause, rollback, .. } => {
            assert!(cause.is_already_exists());
            assert!(rollback.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.nodes.get("extra-0").await.is_ok());
    assert!(h.nodes.get("extra-1").await.is_ok());

    // a later batch under the same label only reports its own nodes
    let added = h.nodes.create_batch(&batch("dev", "more", 1)).await.unwrap();
    let names: Vec<&str> = added.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["more-0"]);
}

#[tokio::test]
async fn test_cluster_rollback_continues_past_failed_delete() {
    let h = setup();
    h.runtime.inject(Fault::CreateContainers { after: 2 }).await;
    h.runtime
        .inject(Fault::DeleteContainer("k3d-dev-server-0".to_string()))
        .await;

    let err = h.clusters.create(&topology("dev", 1, 2)).await.unwrap_err();
    match &err {
        AppError::PartialCreate { rollback, .. } => {
            assert!(matches!(rollback.as_deref(), Some(AppError::Aggregate { .. })));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("k3d-dev-server-0"));

    // everything but the stuck server is gone
    assert_eq!(h.runtime.container_names().await, vec!["k3d-dev-server-0".to_string()]);
    assert!(!h.runtime.volume_exists("k3d-dev-images").await);
}

#[tokio::test]
async fn test_node_rollback_continues_past_failed_delete() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.runtime.inject(Fault::CreateContainers { after: 2 }).await;
    h.runtime.inject(Fault::DeleteContainer("extra-0".to_string())).await;

    let err = h.nodes.create_batch(&batch("dev", "extra", 3)).await.unwrap_err();
    match err {
        AppError::PartialCreate { rollback, .. } => {
            assert!(matches!(rollback.as_deref(), Some(AppError::Aggregate { .. })));
        }
        other => panic!("unexpected error: {other}"),
    }

    let names = h.runtime.container_names().await;
    assert!(names.contains(&"extra-0".to_string()));
    assert!(!names.contains(&"extra-1".to_string()));
}

#[tokio::test]
async fn test_cluster_stop_aborts_at_first_failure() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 2)).await.unwrap();
    h.runtime
        .inject(Fault::StopContainer("k3d-dev-agent-1".to_string()))
        .await;

    // stop order: load balancer, agent-1, agent-0, server-0
    let target = Target::Names(vec!["dev".to_string()]);
    assert!(h.clusters.start_stop(&target, Action::Stop).await.is_err());

    assert!(!h.nodes.get("k3d-dev-serverlb").await.unwrap().running);
    assert!(h.nodes.get("k3d-dev-agent-1").await.unwrap().running);
    assert!(h.nodes.get("k3d-dev-agent-0").await.unwrap().running);
    assert!(h.nodes.get("k3d-dev-server-0").await.unwrap().running);
}

#[tokio::test]
async fn test_node_start_aborts_at_first_failure() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.nodes.create_batch(&batch("dev", "extra", 2)).await.unwrap();
    h.nodes.start_stop("dev", &Target::All, Action::Stop).await.unwrap();
    h.runtime.inject(Fault::StartContainer("extra-0".to_string())).await;

    assert!(h.nodes.start_stop("dev", &Target::All, Action::Start).await.is_err());
    assert!(!h.nodes.get("extra-1").await.unwrap().running);
}

#[tokio::test]
async fn test_failed_attach_leaves_registry_disconnected() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.registries.create(&registry("mirror")).await.unwrap();
    let names = vec!["mirror".to_string()];
    h.runtime.inject(Fault::AttachNetwork("mirror".to_string())).await;

    assert!(h.registries.connect(&names, "dev").await.is_err());
    let status = h.registries.status(&names, "dev").await.unwrap();
    assert_eq!(status[0].state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_failed_attach_on_create_removes_registry() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.runtime.inject(Fault::AttachNetwork("mirror".to_string())).await;

    let mut request = registry("mirror");
    request.cluster = Some("dev".to_string());
    let err = h.registries.create(&request).await.unwrap_err();
    assert!(matches!(err, AppError::PartialCreate { rollback: None, .. }));
    assert!(!h.runtime.container_names().await.contains(&"mirror".to_string()));
}

#[tokio::test]
async fn test_failed_registry_run_creates_nothing() {
    let h = setup();
    h.runtime.inject(Fault::RunRegistry).await;

    assert!(h.registries.create(&registry("mirror")).await.is_err());
    assert!(h.runtime.container_names().await.is_empty());
}

#[tokio::test]
async fn test_cluster_delete_aggregates_detach_and_network_failures() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.registries.create(&registry("mirror")).await.unwrap();
    h.registries.connect(&["mirror".to_string()], "dev").await.unwrap();
    h.runtime.inject(Fault::DetachNetwork("mirror".to_string())).await;

    let err = h.clusters.delete("dev").await.unwrap_err();
    assert!(matches!(err, AppError::Aggregate { .. }));
    // nodes and volume are removed regardless
    assert!(h.clusters.get("dev").await.unwrap_err().is_not_found());
    assert!(!h.runtime.volume_exists("k3d-dev-images").await);
    // the registry still holds an endpoint in the network
    assert!(h.runtime.network_exists("k3d-dev").await);
}

#[tokio::test]
async fn test_cluster_delete_reports_network_failure() {
    let h = setup();
    h.clusters.create(&topology("dev", 1, 0)).await.unwrap();
    h.runtime.inject(Fault::DeleteNetwork).await;

    let err = h.clusters.delete("dev").await.unwrap_err();
    assert!(matches!(err, AppError::Aggregate { .. }));
    assert!(h.runtime.container_names().await.is_empty());
    assert!(h.runtime.network_exists("k3d-dev").await);
}

#[tokio::test]
async fn test_image_load_attempts_every_cluster() {
    let h = setup();
    h.clusters.create(&topology("a", 1, 0)).await.unwrap();
    h.clusters.create(&topology("b", 1, 0)).await.unwrap();
    h.runtime.inject(Fault::ImportImages).await;

    let err = h
        .images
        .load(&ImageLoadRequest {
            images: vec!["nginx:1.25".to_string()],
            target: Target::All,
            keep_tarball: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Aggregate { .. }));
    assert!(h.runtime.images_on("k3d-a-server-0").await.is_empty());
    assert_eq!(h.runtime.images_on("k3d-b-server-0").await, vec!["nginx:1.25".to_string()]);
}
