use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use sparse_halo::algs::communicator::{Communicator, NoComm, RayonComm};
use sparse_halo::distributor::{CombineMode, Distributor, Import};
use sparse_halo::map::IndexMap;

/// Every rank of a `size`-rank world runs `f` on its own thread.
fn on_world<F: Fn(&RayonComm) + Sync>(size: usize, f: F) {
    let world = RayonComm::world(size);
    std::thread::scope(|s| {
        for comm in &world {
            let f = &f;
            s.spawn(move || f(comm));
        }
    });
}

fn bench_plans(c: &mut Criterion) {
    let mut group = c.benchmark_group("plans");
    group.sample_size(20);

    for &n in &[10_000u64, 100_000] {
        let mut gids: Vec<u64> = (0..n).collect();
        gids.shuffle(&mut SmallRng::seed_from_u64(11));

        group.bench_with_input(BenchmarkId::new("serial_import", n), &n, |b, &n| {
            let source = Arc::new(IndexMap::uniform(n, 0, &NoComm).expect("map"));
            let target = Arc::new(IndexMap::from_gids(Some(n), &gids, 0, &NoComm).expect("map"));
            b.iter(|| {
                let imp = Import::new(Arc::clone(&source), Arc::clone(&target), &NoComm)
                    .expect("import");
                black_box(imp.num_permute());
            })
        });

        group.bench_with_input(BenchmarkId::new("halo_import_4_ranks", n), &n, |b, &n| {
            b.iter(|| {
                on_world(4, |comm| {
                    let source = Arc::new(IndexMap::uniform(n, 0, comm).expect("map"));
                    let lo = source.min_my_gid().unwrap_or(0);
                    let hi = source.max_my_gid().unwrap_or(0);
                    let mut mine: Vec<u64> = source.my_gids().to_vec();
                    mine.push((hi + 1) % n);
                    mine.push((lo + n - 1) % n);
                    let target =
                        Arc::new(IndexMap::from_gids(None, &mine, 0, comm).expect("map"));
                    let imp = Import::new(Arc::clone(&source), Arc::clone(&target), comm)
                        .expect("import");
                    let src: Vec<f64> = source.my_gids().iter().map(|&g| g as f64).collect();
                    let mut dst = vec![0.0; target.num_my()];
                    imp.transfer(&src, &mut dst, 1, CombineMode::Insert, comm)
                        .expect("transfer");
                    black_box(dst[0]);
                });
            })
        });
    }

    group.bench_function("distributor_all_to_all_4_ranks", |b| {
        b.iter(|| {
            on_world(4, |comm| {
                let ranks: Vec<usize> = (0..1024).map(|i| i % comm.size()).collect();
                let plan = Distributor::create_from_sends(&ranks, comm).expect("plan");
                let exports: Vec<u64> = (0..1024).collect();
                let imports = plan.do_posts_and_waits(&exports, 1, comm).expect("exchange");
                black_box(imports.len());
            });
        })
    });
    group.finish();
}

criterion_group!(benches, bench_plans);
criterion_main!(benches);
