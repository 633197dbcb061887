//! Performance benchmarks for the lifecycle backend
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use k3d_lifecycle::{
    config::Config,
    k3d::{
        projection::{group_clusters, retain_named},
        resources::{plan_cluster, ImageDefaults},
        ClusterManager,
    },
    models::{ClusterTopology, PortWithFilters},
    runtime::{LabelSelector, MemoryRuntime, Runtime},
};

fn topology(name: &str, servers: u32, agents: u32) -> ClusterTopology {
    ClusterTopology {
        name: name.to_string(),
        servers,
        agents,
        ports: vec![PortWithFilters {
            port: "8080:80".to_string(),
            node_filters: vec!["loadbalancer".to_string()],
        }],
        ..Default::default()
    }
}

/// Benchmark planning the containers of a cluster
fn bench_plan_cluster(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_cluster");
    let images = ImageDefaults::from_config(&Config::default());

    for agents in [0u32, 10, 100].iter() {
        let topo = topology("bench", 3, *agents);
        group.throughput(Throughput::Elements(u64::from(3 + *agents)));
        group.bench_with_input(BenchmarkId::new("agents", agents), &topo, |b, topo| {
            b.iter(|| plan_cluster(black_box(topo), &images).unwrap());
        });
    }

    group.finish();
}

/// Benchmark deriving clusters from a runtime listing
fn bench_group_clusters(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_clusters");
    let images = ImageDefaults::from_config(&Config::default());

    for clusters in [1usize, 10, 50].iter() {
        let runtime = Arc::new(MemoryRuntime::new());
        let shared: Arc<dyn Runtime> = runtime.clone();
        let manager = ClusterManager::new(shared, images.clone(), None);
        let containers = tokio_test::block_on(async {
            for i in 0..*clusters {
                manager
                    .create(&topology(&format!("c{}", i), 1, 2))
                    .await
                    .unwrap();
            }
            runtime.list_containers(&LabelSelector::any()).await.unwrap()
        });

        group.throughput(Throughput::Elements(containers.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("group", clusters),
            &containers,
            |b, containers| {
                b.iter(|| group_clusters(black_box(containers)));
            },
        );

        let names: Vec<String> = (0..*clusters).step_by(2).map(|i| format!("c{}", i)).collect();
        let grouped = group_clusters(&containers);
        group.bench_with_input(
            BenchmarkId::new("retain_named", clusters),
            &grouped,
            |b, grouped| {
                b.iter(|| retain_named(black_box(grouped.clone()), &names, |c| c.name.as_str()));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_plan_cluster, bench_group_clusters);
criterion_main!(benches);
