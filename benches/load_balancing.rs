use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use replipool::core::{Endpoint, Node, NodeRole};
use replipool::routing::balancer::{create_balancer, LoadBalancingStrategy};

fn replicas(count: usize) -> Vec<Node> {
    (0..count)
        .map(|i| {
            let mut node = Node::new(
                format!("replica-{}", i),
                Endpoint::new("127.0.0.1", 5433 + i as u16),
                NodeRole::Replica,
            );
            node.connections = (i * 7) % 13;
            node.lag_ms = ((i * 37) % 101) as u64;
            node
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_node");

    for strategy in [
        LoadBalancingStrategy::RoundRobin,
        LoadBalancingStrategy::LeastConnections,
        LoadBalancingStrategy::LeastLag,
        LoadBalancingStrategy::Random,
    ] {
        let balancer = create_balancer(strategy);
        for count in [3, 16, 128].iter() {
            let nodes = replicas(*count);
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), count),
                &nodes,
                |b, nodes| {
                    b.iter(|| black_box(balancer.select_node(black_box(nodes))));
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
