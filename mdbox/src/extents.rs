use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::{BoxError, BoxResult};

/// Inline capacity for per-dimension data. Most workspaces have four or
/// fewer dimensions (Q3D + energy).
pub const INLINE_DIMS: usize = 4;

/// A point in the N-dimensional event space.
pub type Coordinate = SmallVec<[f64; INLINE_DIMS]>;

/// Closed interval covered by a box along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimExtent {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

impl DimExtent {
    pub fn new(min: f64, max: f64) -> Self {
        DimExtent { min, max }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Upper boundary of the `k`-th of `parts` equal slices. The last slice
    /// ends exactly at `max` so the slices cover the interval with no gap.
    fn slice_upper(&self, k: usize, parts: usize) -> f64 {
        if k + 1 >= parts {
            self.max
        } else {
            self.min + self.width() * (k + 1) as f64 / parts as f64
        }
    }

    fn slice_lower(&self, k: usize, parts: usize) -> f64 {
        if k == 0 {
            self.min
        } else {
            self.min + self.width() * k as f64 / parts as f64
        }
    }

    /// Index of the slice holding `value`. A value sitting exactly on a
    /// shared boundary belongs to the lower slice.
    fn slice_index(&self, value: f64, parts: usize) -> usize {
        for k in 0..parts {
            if value <= self.slice_upper(k, parts) {
                return k;
            }
        }
        parts - 1
    }
}

/// Axis-aligned N-dimensional extents of a box.
///
/// Extents are closed on both ends. Children produced by [`Extents::child`]
/// share their boundaries with their siblings; point resolution through
/// [`Extents::child_index`] breaks ties towards the lower-indexed child.
///
/// # Examples
///
/// ```rust
/// use mdbox::Extents;
///
/// let extents = Extents::new([(-10.0, 10.0), (-10.0, 10.0)]).unwrap();
/// assert_eq!(extents.ndim(), 2);
/// assert!(extents.contains_point(&[0.0, 5.0]));
/// assert_eq!(extents.volume(), 400.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extents {
    dims: SmallVec<[DimExtent; INLINE_DIMS]>,
}

impl Extents {
    /// Creates extents from `(min, max)` pairs, one per dimension.
    ///
    /// # Errors
    ///
    /// Returns [`BoxError::InvalidConfiguration`] if no dimension is given,
    /// a bound is not finite, or `min >= max` in any dimension.
    pub fn new<I>(bounds: I) -> BoxResult<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let dims: SmallVec<[DimExtent; INLINE_DIMS]> = bounds
            .into_iter()
            .map(|(min, max)| DimExtent::new(min, max))
            .collect();

        if dims.is_empty() {
            return Err(BoxError::InvalidConfiguration(
                "extents need at least one dimension".into(),
            ));
        }
        for (d, dim) in dims.iter().enumerate() {
            if !dim.min.is_finite() || !dim.max.is_finite() || dim.min >= dim.max {
                return Err(BoxError::InvalidConfiguration(format!(
                    "dimension {} has invalid extents ({}, {})",
                    d, dim.min, dim.max
                )));
            }
        }
        Ok(Extents { dims })
    }

    /// Rebuilds extents from the flat `min0, max0, min1, max1, ...` layout
    /// used by the persisted `extents` array. No validation is done here;
    /// the flat codec checks the values itself.
    pub fn from_flat(values: &[f64]) -> Self {
        Extents {
            dims: values
                .chunks_exact(2)
                .map(|pair| DimExtent::new(pair[0], pair[1]))
                .collect(),
        }
    }

    /// Appends `min0, max0, min1, max1, ...` to `out`.
    pub fn write_flat(&self, out: &mut Vec<f64>) {
        for dim in &self.dims {
            out.push(dim.min);
            out.push(dim.max);
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, d: usize) -> &DimExtent {
        &self.dims[d]
    }

    pub fn dims(&self) -> &[DimExtent] {
        &self.dims
    }

    /// Checks whether the point lies inside (boundaries included).
    pub fn contains_point(&self, point: &[f64]) -> bool {
        point.len() == self.dims.len()
            && self.dims.iter().zip(point).all(|(dim, &v)| dim.contains(v))
    }

    /// Checks whether `other` lies entirely inside these extents.
    pub fn contains(&self, other: &Extents) -> bool {
        self.ndim() == other.ndim()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(a, b)| a.min <= b.min && a.max >= b.max)
    }

    /// Checks whether the interiors of two extents overlap. Boxes that only
    /// share a face do not overlap.
    pub fn overlaps(&self, other: &Extents) -> bool {
        self.ndim() == other.ndim()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(a, b)| a.min < b.max && b.min < a.max)
    }

    pub fn volume(&self) -> f64 {
        self.dims.iter().map(DimExtent::width).product()
    }

    /// Inverse of the volume, cached per box for signal normalization.
    /// Degenerate extents yield zero rather than infinity.
    pub fn inverse_volume(&self) -> f64 {
        let volume = self.volume();
        if volume > 0.0 {
            1.0 / volume
        } else {
            0.0
        }
    }

    /// Linear index of the child holding `point` when these extents are
    /// split `split_into[d]` times along each dimension. Dimension 0 varies
    /// fastest. Coordinates outside the extents are clipped to the nearest
    /// boundary child.
    pub fn child_index(&self, point: &[f64], split_into: &[usize]) -> usize {
        let mut index = 0;
        let mut stride = 1;
        for (d, dim) in self.dims.iter().enumerate() {
            let parts = split_into[d];
            index += dim.slice_index(point[d], parts) * stride;
            stride *= parts;
        }
        index
    }

    /// Extents of the child with linear index `index` under `split_into`.
    pub fn child(&self, index: usize, split_into: &[usize]) -> Extents {
        let mut remainder = index;
        let dims = self
            .dims
            .iter()
            .enumerate()
            .map(|(d, dim)| {
                let parts = split_into[d];
                let k = remainder % parts;
                remainder /= parts;
                DimExtent::new(dim.slice_lower(k, parts), dim.slice_upper(k, parts))
            })
            .collect();
        Extents { dims }
    }
}

impl std::fmt::Display for Extents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Extents(")?;
        for (d, dim) in self.dims.iter().enumerate() {
            if d > 0 {
                write!(f, " x ")?;
            }
            write!(f, "[{}, {}]", dim.min, dim.max)?;
        }
        write!(f, ")")
    }
}
