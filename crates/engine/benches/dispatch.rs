use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use std::sync::Arc;

use async_trait::async_trait;
use paybridge_core::{Capability, CapabilitySet, Connector, ConnectorId};
use paybridge_engine::{check_capability, ConnectorRegistry, Dispatcher, Operation, Plugin, PluginFactory};

/// Plugin answering every call with its default.
struct NullPlugin;

#[async_trait]
impl Plugin for NullPlugin {}

fn null_factory() -> PluginFactory {
    Arc::new(|_id: &ConnectorId, _config: &serde_json::Value| {
        let plugin: Arc<dyn Plugin> = Arc::new(NullPlugin);
        Ok(plugin)
    })
}

const OPERATIONS: [Operation; 11] = [
    Operation::CreateTransfer,
    Operation::CreatePayout,
    Operation::ReverseTransfer,
    Operation::ReversePayout,
    Operation::CreateBankAccount,
    Operation::CreateUser,
    Operation::CreateUserLink,
    Operation::UpdateUserLink,
    Operation::CompleteUserLink,
    Operation::DeleteUser,
    Operation::DeleteUserConnection,
];

fn connector(capabilities: CapabilitySet) -> Connector {
    Connector::new(ConnectorId::new("psp-1"), "psp-1", serde_json::json!({}), capabilities)
}

fn bench_check_capability(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_capability");

    let all = Capability::ALL
        .iter()
        .fold(CapabilitySet::empty(), |set, cap| set.with(*cap));
    let transfers_only = CapabilitySet::empty().with(Capability::CreateTransfer);

    for (name, caps) in [("all", all), ("transfers_only", transfers_only), ("none", CapabilitySet::empty())] {
        let connector = connector(caps);
        group.bench_with_input(BenchmarkId::from_parameter(name), &connector, |b, connector| {
            b.iter(|| {
                for operation in OPERATIONS {
                    let _ = black_box(check_capability(black_box(connector), operation));
                }
            })
        });
    }

    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let caps = CapabilitySet::empty().with(Capability::CreateTransfer);

    let mut group = c.benchmark_group("dispatcher_resolve");
    for installed in [1usize, 100, 1_000] {
        let registry = ConnectorRegistry::new().with_provider("psp-1", caps, null_factory());
        let mut ids = Vec::with_capacity(installed);
        rt.block_on(async {
            for _ in 0..installed {
                let connector = connector(caps);
                ids.push(connector.id.clone());
                registry.load(connector).await.expect("load connector");
            }
        });
        let dispatcher = Dispatcher::new(Arc::new(registry));
        let target = ids[installed / 2].clone();

        group.bench_with_input(BenchmarkId::from_parameter(installed), &target, |b, target| {
            b.iter(|| {
                rt.block_on(async {
                    let _ = black_box(dispatcher.resolve(target, Operation::CreateTransfer).await);
                    let _ = black_box(dispatcher.resolve(target, Operation::CreatePayout).await);
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_check_capability, bench_resolve);
criterion_main!(benches);
