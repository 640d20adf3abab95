use mdbox::{
    BoxControllerConfig, BoxTree, DetectorInfo, Extents, FnConverter, MdBox, RowContext, Spectrum,
    Workspace2D,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tempfile::TempDir;

/// Tolerance for comparing summed signals
pub const EPSILON: f64 = 1e-6;

/// The 2-D tree of the single-split scenario: `[-10, 10]^2`, threshold 4,
/// split factor 2, max depth 5.
pub fn scenario_tree() -> BoxTree {
    BoxTree::new(
        BoxControllerConfig::new(2)
            .with_split_threshold(4)
            .with_split_into(2)
            .with_max_depth(5),
        Extents::new([(-10.0, 10.0), (-10.0, 10.0)]).unwrap(),
    )
    .unwrap()
}

/// A 3-D tree over the unit cube.
pub fn unit_cube_tree(threshold: usize) -> BoxTree {
    BoxTree::new(
        BoxControllerConfig::new(3)
            .with_split_threshold(threshold)
            .with_max_depth(6),
        Extents::new([(0.0, 1.0), (0.0, 1.0), (0.0, 1.0)]).unwrap(),
    )
    .unwrap()
}

/// Describes a generated table.
#[derive(Debug, Clone, Default)]
pub struct TableSummary {
    /// Signal over all samples that the pipeline should keep
    pub valid_signal: f64,
    pub valid_samples: u64,
    pub nan_samples: u64,
    pub invalid_row_samples: u64,
}

/// Random histogram table for [`unit_cube_converter`].
///
/// Every tenth row has no detector, every seventh detector is masked and
/// roughly one sample in fifty has a NaN signal.
pub fn random_table(rows: usize, bins: usize, seed: u64) -> (Workspace2D, TableSummary) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut summary = TableSummary::default();
    let x: Vec<f64> = (0..=bins).map(|b| b as f64 / bins as f64).collect();

    let table = (0..rows)
        .map(|row| {
            let y: Vec<f64> = (0..bins)
                .map(|_| {
                    if rng.gen_ratio(1, 50) {
                        f64::NAN
                    } else {
                        rng.gen_range(0.0..10.0)
                    }
                })
                .collect();
            let e: Vec<f64> = y.iter().map(|s| if s.is_nan() { 0.0 } else { s.sqrt() }).collect();
            let position = [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), 1.0];

            let mut spectrum = Spectrum::new(x.clone(), y.clone(), e);
            let usable = if row % 10 == 9 {
                false
            } else {
                let mut detector = DetectorInfo::new(row as i64, position);
                if row % 7 == 6 {
                    detector = detector.masked();
                }
                let usable = detector.is_usable();
                spectrum = spectrum.with_detector(detector);
                usable
            };

            if usable {
                for s in &y {
                    if s.is_nan() {
                        summary.nan_samples += 1;
                    } else {
                        summary.valid_samples += 1;
                        summary.valid_signal += s;
                    }
                }
            } else {
                summary.invalid_row_samples += bins as u64;
            }
            spectrum
        })
        .collect();

    (table, summary)
}

/// Maps a bin centre and a detector position into the unit cube.
pub fn unit_cube_converter(
) -> FnConverter<impl Fn(&RowContext<'_>, f64, &mut [f64]) -> bool + Send + Sync> {
    FnConverter::new(3, |row: &RowContext<'_>, value: f64, out: &mut [f64]| {
        out[0] = value;
        out[1] = row.detector.position[0];
        out[2] = row.detector.position[1];
        true
    })
}

/// Asserts `actual` equals `expected` up to a relative tolerance.
pub fn assert_close(actual: f64, expected: f64) {
    let tolerance = EPSILON * expected.abs().max(1.0) * 1e-3;
    assert!(
        (actual - expected).abs() <= tolerance,
        "{} differs from {}",
        actual,
        expected
    );
}

/// Sum of the leaves' own event signals, independent of cached totals.
pub fn leaf_event_signal(tree: &BoxTree) -> f64 {
    tree.leaves()
        .filter_map(MdBox::as_leaf)
        .flat_map(|leaf| leaf.events())
        .map(|event| event.signal)
        .sum()
}

/// Asserts that two trees have the same shape, extents and totals.
pub fn assert_same_structure(a: &BoxTree, b: &BoxTree) {
    assert_eq!(a.len(), b.len(), "box count");
    assert_eq!(a.event_count(), b.event_count(), "event count");
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.box_type(), y.box_type(), "type of box {}", x.id());
        assert_eq!(x.depth(), y.depth(), "depth of box {}", x.id());
        assert_eq!(x.extents(), y.extents(), "extents of box {}", x.id());
        assert_eq!(x.children(), y.children(), "children of box {}", x.id());
        assert!((x.signal() - y.signal()).abs() < EPSILON, "signal of box {}", x.id());
        assert!(
            (x.error_squared() - y.error_squared()).abs() < EPSILON,
            "error of box {}",
            x.id()
        );
        assert_eq!(x.leaf_event_count(), y.leaf_event_count(), "events of box {}", x.id());
    }
}

/// A temporary directory and a container path inside it. Keep the
/// directory alive for as long as the file is used.
pub fn temp_container_path(name: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}
