use std::fmt;
use std::ops::AddAssign;

/// Samples dropped during population, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    /// Signal was NaN or infinite
    pub nan_signal: u64,
    /// The converter reported the sample out of range
    pub out_of_range: u64,
    /// Every sample of rows without a usable detector, or whose index does
    /// not fit an origin id
    pub invalid_row: u64,
    /// Converted coordinate fell outside the tree extents
    pub rejected_by_tree: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.nan_signal + self.out_of_range + self.invalid_row + self.rejected_by_tree
    }
}

impl AddAssign for DropCounts {
    fn add_assign(&mut self, other: Self) {
        self.nan_signal += other.nan_signal;
        self.out_of_range += other.out_of_range;
        self.invalid_row += other.invalid_row;
        self.rejected_by_tree += other.rejected_by_tree;
    }
}

impl fmt::Display for DropCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nan signal {}, out of range {}, invalid rows {}, rejected by tree {}",
            self.nan_signal, self.out_of_range, self.invalid_row, self.rejected_by_tree
        )
    }
}

/// Outcome of a population run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulationReport {
    pub rows_total: usize,
    pub rows_processed: usize,
    pub samples_added: u64,
    pub dropped: DropCounts,
    /// Restructuring passes run, including the final ones
    pub split_passes: usize,
    /// False when cancellation stopped dispatch before the last row
    pub complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_counts_accumulate() {
        let mut counts = DropCounts {
            nan_signal: 1,
            ..DropCounts::default()
        };
        counts += DropCounts {
            nan_signal: 2,
            out_of_range: 3,
            invalid_row: 4,
            rejected_by_tree: 5,
        };
        assert_eq!(counts.nan_signal, 3);
        assert_eq!(counts.total(), 15);
        assert_eq!(
            counts.to_string(),
            "nan signal 3, out of range 3, invalid rows 4, rejected by tree 5"
        );
    }
}
