//! End-to-end runs of the tile pipeline against the host reference loop.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tsm_engine::transfer::Injection;
use tsm_engine::{
    BLayout, EngineConfig, EngineError, FarBuffer, FarOperands, ImmediateDma, LocalAllocator,
    Offload, Operand, Pipeline, Scratchpad, ThreadedDma, TileGeometry, TransferEngine,
    ELEMENT_SIZE,
};
use tsm_tensor::{CpuBackend, MatmulBackend, Matrix, Shape};

fn random_vec(len: usize, seed: u64) -> Vec<u32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn reference(a: &[u32], b: &[u32], width: usize, height: usize) -> Vec<u32> {
    CpuBackend::new().matmul(a, b, height, width, height).unwrap()
}

fn run_with<E: TransferEngine>(
    engine: &E,
    config: EngineConfig,
    a: &[u32],
    b: &[u32],
    geometry: &TileGeometry,
) -> tsm_engine::Result<Vec<u32>> {
    let pipeline = Pipeline::new(config)?;
    let pad = Scratchpad::new(1 << 20);
    let far = FarOperands::new(
        FarBuffer::from_slice(a),
        FarBuffer::from_slice(b),
        FarBuffer::zeroed(geometry.c_len()),
    );
    let result = pipeline.run(engine, &pad, &far, geometry);
    assert_eq!(pad.in_use(), 0, "scratchpad leaked after run");
    result.map(|_| far.c.to_vec())
}

#[test]
fn test_planned_sizes_match_reference() {
    let offload = Offload::new(EngineConfig::default()).unwrap();
    for (seed, n) in [32usize, 64, 128, 256].into_iter().enumerate() {
        let g = offload.plan(n).unwrap();
        assert_eq!(g.height(), n);
        assert!(g.n_stripes() >= 2);

        let a = random_vec(n * n, seed as u64);
        let b = random_vec(n * n, 100 + seed as u64);
        let mut c = vec![0; n * n];
        let report = offload
            .run_tiled_matmul(&a, &b, &mut c, n, n, g.stripe_height())
            .unwrap();
        assert_eq!(report.tiles, g.tile_count());
        assert_eq!(c, reference(&a, &b, n, n), "mismatch for n={n}");
    }
}

#[test]
fn test_scaled_identity_scenario() {
    let n = 128;
    let a = Matrix::from_fn(Shape::square(n), |i, j| (i * n + j) as u32);
    let b = Matrix::scaled_identity(n, 2);
    let mut c = vec![0; n * n];

    let report = tsm_engine::run_tiled_matmul(a.data(), b.data(), &mut c, n, n, 64).unwrap();
    assert_eq!(report.geometry.n_stripes(), 2);

    let got = Matrix::new(c, Shape::square(n));
    assert_eq!(got.first_mismatch(&a.scale(2)), None);
}

#[test]
fn test_rerun_with_cleared_output_is_identical() {
    let offload = Offload::new(EngineConfig::default().with_compute_workers(3)).unwrap();
    let a = random_vec(48 * 48, 7);
    let b = random_vec(48 * 48, 8);
    let mut first = vec![0; 48 * 48];
    offload.run_tiled_matmul(&a, &b, &mut first, 48, 48, 12).unwrap();

    let mut second = first.clone();
    second.fill(0);
    offload.run_tiled_matmul(&a, &b, &mut second, 48, 48, 12).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_single_row_stripes() {
    let n = 16;
    let g = TileGeometry::from_parts(n, n, 1).unwrap();
    let a = random_vec(n * n, 21);
    let b = random_vec(n * n, 22);
    let c = run_with(&ImmediateDma::new(), EngineConfig::default(), &a, &b, &g).unwrap();
    assert_eq!(c, reference(&a, &b, n, n));
}

#[test]
fn test_boundary_stripe_counts() {
    let sh = 4;
    for n_stripes in 1..=3 {
        let n = n_stripes * sh;
        let g = TileGeometry::from_parts(n, n, sh).unwrap();
        let a = random_vec(n * n, n as u64);
        let b = random_vec(n * n, 50 + n as u64);

        let pipeline = Pipeline::new(EngineConfig::default().with_compute_workers(2)).unwrap();
        let pad = Scratchpad::new(g.pool_bytes(ELEMENT_SIZE));
        let far = FarOperands::new(
            FarBuffer::from_slice(&a),
            FarBuffer::from_slice(&b),
            FarBuffer::zeroed(n * n),
        );
        let dma = ImmediateDma::new();
        let report = pipeline.run(&dma, &pad, &far, &g).unwrap();

        assert_eq!(far.c.to_vec(), reference(&a, &b, n, n), "n_stripes={n_stripes}");
        assert_eq!(report.tiles, n_stripes * n_stripes);
        assert_eq!(report.a_fetches, n_stripes);
        assert_eq!(report.b_fetches, n_stripes * n_stripes);
        assert_eq!(report.c_writebacks, n_stripes);
        assert_eq!(dma.issued() as usize, report.transfers());
        assert_eq!(pad.in_use(), 0);
    }
}

#[test]
fn test_rectangular_operands() {
    let (width, height) = (40, 24);
    let g = TileGeometry::from_parts(width, height, 6).unwrap();
    let a = random_vec(height * width, 31);
    let b = random_vec(width * height, 32);
    let dma = ThreadedDma::new().unwrap();
    let c = run_with(&dma, EngineConfig::default(), &a, &b, &g).unwrap();
    assert_eq!(c, reference(&a, &b, width, height));
}

#[test]
fn test_transposed_b_layout() {
    let n = 24;
    let g = TileGeometry::from_parts(n, n, 6).unwrap();
    let a = random_vec(n * n, 41);
    let b = Matrix::new(random_vec(n * n, 42), Shape::square(n));
    let stored = b.transpose();

    let config = EngineConfig::default().with_b_layout(BLayout::Transposed);
    let c = run_with(&ImmediateDma::new(), config, &a, stored.data(), &g).unwrap();
    assert_eq!(c, reference(&a, b.data(), n, n));
}

#[test]
fn test_result_independent_of_transfer_timing() {
    let n = 24;
    let g = TileGeometry::from_parts(n, n, 6).unwrap();
    let a = random_vec(n * n, 61);
    let b = random_vec(n * n, 62);
    let expected = reference(&a, &b, n, n);
    let jitter = Duration::from_micros(300);

    for seed in 0..4 {
        let config = EngineConfig::default().with_compute_workers(2);
        let immediate = ImmediateDma::with_injection(Injection::default().with_jitter(jitter, seed));
        let c = run_with(&immediate, config.clone(), &a, &b, &g).unwrap();
        assert_eq!(c, expected, "immediate engine, seed {seed}");

        let threaded =
            ThreadedDma::with_injection(Injection::default().with_jitter(jitter, seed)).unwrap();
        let c = run_with(&threaded, config, &a, &b, &g).unwrap();
        assert_eq!(c, expected, "threaded engine, seed {seed}");
    }
}

#[test]
fn test_failed_transfer_propagates() {
    let n = 16;
    let g = TileGeometry::from_parts(n, n, 4).unwrap();
    let a = random_vec(n * n, 71);
    let b = random_vec(n * n, 72);
    // 4 A fetches, 16 B fetches and 4 C writebacks.
    for job in [0u64, 1, 9, 23] {
        let dma = ThreadedDma::with_injection(Injection::default().with_failed_job(job)).unwrap();
        let err = run_with(&dma, EngineConfig::default(), &a, &b, &g).unwrap_err();
        assert!(
            matches!(err, EngineError::Transfer { job: failed, .. } if failed == job),
            "job {job}: {err}"
        );
        assert_eq!(err.status(), -5);
    }
}

#[test]
fn test_out_of_local_memory_issues_nothing() {
    let n = 32;
    let g = TileGeometry::from_parts(n, n, 8).unwrap();
    let pipeline = Pipeline::new(EngineConfig::default()).unwrap();
    // Room for A and B pairs but not both C slots.
    let pad = Scratchpad::new(g.pool_bytes(ELEMENT_SIZE) - 1);
    let far = FarOperands::new(
        FarBuffer::zeroed(n * n),
        FarBuffer::zeroed(n * n),
        FarBuffer::zeroed(n * n),
    );
    let dma = ImmediateDma::new();

    let err = pipeline.run(&dma, &pad, &far, &g).unwrap_err();
    assert!(matches!(
        err,
        EngineError::OutOfLocalMemory {
            operand: Operand::C,
            ..
        }
    ));
    assert_eq!(err.status(), -12);
    assert_eq!(dma.issued(), 0);
    assert_eq!(pad.in_use(), 0);
}

#[test]
fn test_entry_point_rejects_bad_geometry() {
    let mut c = vec![0; 36];
    let err = tsm_engine::run_tiled_matmul(&[0; 36], &[0; 36], &mut c, 6, 6, 4).unwrap_err();
    assert!(matches!(err, EngineError::InvalidGeometry(_)));
    assert_eq!(err.status(), -22);
}
