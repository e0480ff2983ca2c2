//! CPU-only pipeline tests: classification, planning, and the host
//! reference packer working together.

use aniso_core::{CompressedNeighborList, FormCode, ParticleRole};
use aniso_gpu::{
    classify_boundary, pack_host, unpack_host, PackedNeighbors, PartitionPlan,
};

/// Deterministic LCG so test data never depends on an RNG crate.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(1664525).wrapping_add(1013904223);
        self.0 >> 16
    }
}

fn random_adjacency(n: usize, max_deg: usize, seed: u64) -> Vec<Vec<i32>> {
    let mut rng = Lcg(seed);
    (0..n)
        .map(|i| {
            let deg = (rng.next() as usize) % (max_deg + 1);
            (0..deg)
                .map(|_| {
                    let mut j = (rng.next() as usize) % n;
                    if j == i {
                        j = (j + 1) % n;
                    }
                    j as i32
                })
                .collect()
        })
        .collect()
}

#[test]
fn test_no_extended_bodies_matches_single_form_packing() {
    // With an empty extended prefix, the planned point-point group covers
    // the full owner range and its packed input (the plain unpack) equals
    // an accept-all filtered pack — i.e. classification changes nothing.
    let n = 64;
    let adjacency = random_adjacency(n, 12, 42);
    let list = CompressedNeighborList::from_adjacency(&adjacency);
    let types = vec![0i32; n];
    let form = vec![FormCode::SphereSphere as i32];

    let mut plain = PackedNeighbors::new(n, 16);
    unpack_host(&list, &mut plain).unwrap();

    let mut filtered = PackedNeighbors::new(n, 16);
    pack_host(
        &list,
        &types,
        &form,
        1,
        FormCode::SphereSphere,
        FormCode::EllipseEllipse,
        0,
        n,
        &mut filtered,
    )
    .unwrap();

    assert_eq!(plain.raw(), filtered.raw());

    let plan = PartitionPlan::new(n, 0, true).unwrap();
    let groups = plan.groups(64, 1, false);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].span.count(), n);
}

#[test]
fn test_form_partitions_cover_each_owner_exactly_once() {
    // Filtered packs for the four form groups must partition every
    // owner's neighborhood: each neighbor word lands in exactly one group.
    let n = 32;
    let last_ellipse = 12;
    let adjacency = random_adjacency(n, 10, 7);
    let list = CompressedNeighborList::from_adjacency(&adjacency);

    let roles: Vec<ParticleRole> = (0..n)
        .map(|i| {
            if i < last_ellipse {
                ParticleRole::Extended
            } else {
                ParticleRole::Point
            }
        })
        .collect();
    assert_eq!(classify_boundary(&roles).unwrap(), last_ellipse);

    // Two types mirroring the roles, with the canonical 2x2 form table.
    let types: Vec<i32> = (0..n).map(|i| (i >= last_ellipse) as i32).collect();
    let form = vec![
        FormCode::EllipseEllipse as i32,
        FormCode::EllipseSphere as i32,
        FormCode::SphereEllipse as i32,
        FormCode::SphereSphere as i32,
    ];

    let forms = [
        FormCode::SphereSphere,
        FormCode::SphereEllipse,
        FormCode::EllipseSphere,
        FormCode::EllipseEllipse,
    ];
    let mut per_owner_total = vec![0usize; n];
    for f in forms {
        let mut packed = PackedNeighbors::new(n, 16);
        pack_host(&list, &types, &form, 2, f, f, 0, n, &mut packed).unwrap();
        for (i, total) in per_owner_total.iter_mut().enumerate() {
            *total += packed.count(i);
        }
    }
    for i in 0..n {
        assert_eq!(
            per_owner_total[i],
            list.payload(i).len(),
            "owner {i}: form groups must partition the neighborhood"
        );
    }
}

#[test]
fn test_large_neighborhood_survives_packing() {
    let adjacency = vec![(0..1000).map(|j| j as i32 + 1).collect(), vec![]];
    let mut list_adj = adjacency;
    list_adj.extend((0..1000).map(|_| vec![]));
    let list = CompressedNeighborList::from_adjacency(&list_adj);

    let mut packed = PackedNeighbors::new(list.owners(), 1000);
    unpack_host(&list, &mut packed).unwrap();
    assert_eq!(packed.count(0), 1000);
    assert_eq!(packed.neighbor(0, 999), 1000);
}
