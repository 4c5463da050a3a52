//! Sector boundary model

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::layout::SessionLayout;

/// Fractions at or above this are always attributed to the last sector.
const WRAP_GUARD: f64 = 0.99;

/// Start of one sector along the lap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectorBoundary {
    /// 0-based sector index
    pub index: usize,
    /// Lap fraction at which the sector starts, in [0, 1]
    pub start_fraction: f64,
}

/// Validated, ordered sector starts for one layout.
///
/// Never empty; start fractions are strictly increasing. Replaced wholesale
/// when the layout changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorBoundaries {
    sectors: Vec<SectorBoundary>,
}

impl SectorBoundaries {
    /// Validate a list of start fractions.
    pub fn new(starts: &[f64]) -> Result<Self, LayoutError> {
        if starts.is_empty() {
            return Err(LayoutError::MissingSectors);
        }

        let mut sectors = Vec::with_capacity(starts.len());
        for (index, &start) in starts.iter().enumerate() {
            if !(0.0..=1.0).contains(&start) {
                return Err(LayoutError::OutOfRange { index, start });
            }
            if let Some(previous) = sectors.last().map(|s: &SectorBoundary| s.start_fraction) {
                if start <= previous {
                    return Err(LayoutError::NotIncreasing { index, start, previous });
                }
            }
            sectors.push(SectorBoundary { index, start_fraction: start });
        }

        Ok(Self { sectors })
    }

    /// Read `SplitTimeInfo.Sectors` from a parsed layout.
    ///
    /// Entries are taken in `SectorNum` order; an entry without a start
    /// fraction makes the whole list malformed.
    pub fn from_layout(layout: &SessionLayout) -> Result<Self, LayoutError> {
        let mut entries = layout
            .split_time_info
            .as_ref()
            .and_then(|info| info.sectors.clone())
            .filter(|sectors| !sectors.is_empty())
            .ok_or(LayoutError::MissingSectors)?;

        entries.sort_by_key(|sector| sector.sector_num.unwrap_or(i32::MAX));

        let starts = entries
            .iter()
            .enumerate()
            .map(|(index, sector)| {
                sector.sector_start_pct.ok_or_else(|| LayoutError::Malformed {
                    details: format!("sector {index} has no SectorStartPct"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(&starts)
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectorBoundary> {
        self.sectors.iter()
    }

    pub fn starts(&self) -> Vec<f64> {
        self.sectors.iter().map(|s| s.start_fraction).collect()
    }

    /// Sector containing `fraction`.
    ///
    /// Intervals are half-open `[start_i, start_{i+1})`, the last closing at
    /// 1.0. Fractions at or above 0.99 map to the last sector; fractions no
    /// interval covers (before the first start) map to sector 0.
    pub fn sector_for(&self, fraction: f64) -> usize {
        let last = self.sectors.len() - 1;
        if fraction >= WRAP_GUARD {
            return last;
        }

        for (i, sector) in self.sectors.iter().enumerate() {
            let end = if i == last { 1.0 } else { self.sectors[i + 1].start_fraction };
            if sector.start_fraction <= fraction && fraction < end {
                return i;
            }
        }

        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn three_sector_lookup() {
        let b = SectorBoundaries::new(&[0.0, 0.33, 0.66]).unwrap();
        assert_eq!(b.sector_for(0.0), 0);
        assert_eq!(b.sector_for(0.3299), 0);
        assert_eq!(b.sector_for(0.33), 1);
        assert_eq!(b.sector_for(0.66), 2);
        assert_eq!(b.sector_for(0.985), 2);
        assert_eq!(b.sector_for(1.0), 2);
    }

    #[test]
    fn wrap_guard_forces_last_sector() {
        let b = SectorBoundaries::new(&[0.0, 0.995]).unwrap();
        assert_eq!(b.sector_for(0.991), 1);
        assert_eq!(b.sector_for(0.98), 0);
    }

    #[test]
    fn uncovered_prefix_falls_back_to_first() {
        let b = SectorBoundaries::new(&[0.1, 0.5]).unwrap();
        assert_eq!(b.sector_for(0.05), 0);
    }

    #[test]
    fn rejects_invalid_lists() {
        assert_eq!(SectorBoundaries::new(&[]), Err(LayoutError::MissingSectors));
        assert_eq!(
            SectorBoundaries::new(&[0.0, 1.2]),
            Err(LayoutError::OutOfRange { index: 1, start: 1.2 })
        );
        assert_eq!(
            SectorBoundaries::new(&[0.0, 0.5, 0.5]),
            Err(LayoutError::NotIncreasing { index: 2, start: 0.5, previous: 0.5 })
        );
    }

    #[test]
    fn layout_sectors_are_ordered_by_number() {
        use crate::layout::{Sector, SplitTimeInfo};

        let layout = SessionLayout {
            split_time_info: Some(SplitTimeInfo {
                sectors: Some(vec![
                    Sector { sector_num: Some(1), sector_start_pct: Some(0.5) },
                    Sector { sector_num: Some(0), sector_start_pct: Some(0.0) },
                ]),
            }),
            ..SessionLayout::default()
        };
        let b = SectorBoundaries::from_layout(&layout).unwrap();
        assert_eq!(b.starts(), vec![0.0, 0.5]);
    }

    #[test]
    fn layout_without_sectors_is_rejected() {
        assert_eq!(
            SectorBoundaries::from_layout(&SessionLayout::default()),
            Err(LayoutError::MissingSectors)
        );
    }

    fn increasing_starts() -> impl Strategy<Value = Vec<f64>> {
        prop::collection::btree_set(1u32..990, 0..12).prop_map(|set| {
            std::iter::once(0.0).chain(set.into_iter().map(|v| v as f64 / 1000.0)).collect()
        })
    }

    proptest! {
        #[test]
        fn lookup_lands_in_containing_interval(
            starts in increasing_starts(),
            fraction in 0.0f64..1.0,
        ) {
            let b = SectorBoundaries::new(&starts).unwrap();
            let idx = b.sector_for(fraction);
            prop_assert!(idx < b.len());
            if fraction < WRAP_GUARD {
                prop_assert!(starts[idx] <= fraction);
                if idx + 1 < starts.len() {
                    prop_assert!(fraction < starts[idx + 1]);
                }
            } else {
                prop_assert_eq!(idx, b.len() - 1);
            }
        }
    }
}
