use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;
use stormledger::subsystems::baseline::BaselineSnapshot;
use stormledger::subsystems::cascade::{CascadeEngine, cascade};
use stormledger::subsystems::catalog::RuleSnapshot;
use stormledger::subsystems::model::{BaselineLoad, Direction, Scope, SourceControlRule};
use stormledger::subsystems::pipeline::{CancelFlag, compute_direction};

fn rules(subbasins: usize, per_scope: usize) -> Vec<SourceControlRule> {
    let mut out = Vec::with_capacity(subbasins * per_scope);
    let mut id = 0;
    for s in 0..subbasins {
        for r in 0..per_scope {
            id += 1;
            let order = if r % 7 == 6 { None } else { Some(r as i64) };
            out.push(SourceControlRule::new(
                id,
                Direction::Downstream,
                &format!("S{s}"),
                "TSS",
                &format!("activity-{r}"),
                order,
                (r % 40) as f64 + 0.5,
            ));
        }
    }
    out
}

fn loads(nodes: usize, subbasins: usize) -> Vec<BaselineLoad> {
    (0..nodes)
        .map(|n| BaselineLoad {
            node_id: format!("N{n:05}"),
            subbasin: format!("S{}", n % subbasins),
            basinname: None,
            epoch: "1980s".to_string(),
            variable: "TSS".to_string(),
            value: 1000.0 + n as f64,
            units: "lbs".to_string(),
        })
        .collect()
}

fn bench_single_scope(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_scope");
    let scope = Scope::new("N00000", "S0", "TSS", Direction::Downstream, "1980s");
    let base = loads(1, 1).remove(0);

    for per_scope in [1, 8, 64] {
        let chain = rules(1, per_scope);
        group.bench_with_input(BenchmarkId::new("cascade", per_scope), &chain, |b, chain| {
            b.iter(|| black_box(cascade(&scope, &base, chain).unwrap()));
        });
    }

    let engine = CascadeEngine::new(
        RuleSnapshot::from_rules(rules(1, 8)),
        BaselineSnapshot::from_loads(Direction::Downstream, loads(1, 1)),
    );
    group.bench_function("engine_compute_8_rules", |b| {
        b.iter(|| black_box(engine.compute(&scope).unwrap()));
    });
    group.finish();
}

fn bench_direction(c: &mut Criterion) {
    let mut group = c.benchmark_group("direction");
    group.measurement_time(Duration::from_secs(10));

    for nodes in [1_000, 10_000] {
        let catalog = RuleSnapshot::from_rules(rules(50, 6));
        let baselines = BaselineSnapshot::from_loads(Direction::Downstream, loads(nodes, 50));
        let cancel = CancelFlag::new();
        group.bench_with_input(BenchmarkId::new("compute", nodes), &nodes, |b, _| {
            b.iter(|| {
                black_box(
                    compute_direction(Direction::Downstream, &catalog, &baselines, &cancel).unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_scope, bench_direction);
criterion_main!(benches);
