//! How rows sharing a sort key are combined during a merge.

use crate::merge_tree::types::Row;
use crate::settings::MergeMode;

/// Combines one run of equal-key rows, given in input-part order.
pub trait RowMergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge_run(&self, run: &[Row], out: &mut Vec<Row>);
}

pub fn strategy_for(mode: MergeMode) -> Box<dyn RowMergeStrategy> {
    match mode {
        MergeMode::Ordinary => Box::new(OrdinaryMerge),
        MergeMode::Collapsing => Box::new(CollapsingMerge),
        MergeMode::Summing => Box::new(SummingMerge),
    }
}

/// Keeps every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrdinaryMerge;

impl RowMergeStrategy for OrdinaryMerge {
    fn name(&self) -> &'static str {
        "ordinary"
    }

    fn merge_run(&self, run: &[Row], out: &mut Vec<Row>) {
        out.extend_from_slice(run);
    }
}

/// Cancels `sign = 1` rows against `sign = -1` rows.
///
/// More positives: the last positive row survives. More negatives: the
/// first negative row survives. Balanced: nothing survives.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollapsingMerge;

impl RowMergeStrategy for CollapsingMerge {
    fn name(&self) -> &'static str {
        "collapsing"
    }

    fn merge_run(&self, run: &[Row], out: &mut Vec<Row>) {
        let net: i64 = run.iter().map(|r| i64::from(r.sign.signum())).sum();
        let survivor = if net > 0 {
            run.iter().rev().find(|r| r.sign > 0)
        } else if net < 0 {
            run.iter().find(|r| r.sign < 0)
        } else {
            None
        };
        if let Some(row) = survivor {
            out.push(row.clone());
        }
    }
}

/// Collapses the run into its first row with `value` summed. Zero sums
/// are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SummingMerge;

impl RowMergeStrategy for SummingMerge {
    fn name(&self) -> &'static str {
        "summing"
    }

    fn merge_run(&self, run: &[Row], out: &mut Vec<Row>) {
        let Some(first) = run.first() else {
            return;
        };
        let sum = run.iter().fold(0i64, |acc, r| acc.wrapping_add(r.value));
        if sum != 0 {
            out.push(Row {
                value: sum,
                ..first.clone()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_of(rows: &[(i8, i64)]) -> Vec<Row> {
        rows.iter()
            .map(|&(sign, value)| Row::new(7, value).with_sign(sign))
            .collect()
    }

    #[test]
    fn test_ordinary_keeps_everything() {
        let mut out = Vec::new();
        OrdinaryMerge.merge_run(&run_of(&[(1, 1), (1, 2)]), &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_collapsing() {
        let mut out = Vec::new();
        CollapsingMerge.merge_run(&run_of(&[(1, 10), (-1, 10), (1, 20)]), &mut out);
        assert_eq!(out, vec![Row::new(7, 20)]);

        out.clear();
        CollapsingMerge.merge_run(&run_of(&[(-1, 5), (-1, 6), (1, 7)]), &mut out);
        assert_eq!(out, vec![Row::new(7, 5).with_sign(-1)]);

        out.clear();
        CollapsingMerge.merge_run(&run_of(&[(1, 10), (-1, 10)]), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_summing() {
        let mut out = Vec::new();
        SummingMerge.merge_run(&run_of(&[(1, 3), (1, 4)]), &mut out);
        assert_eq!(out, vec![Row::new(7, 7)]);

        out.clear();
        SummingMerge.merge_run(&run_of(&[(1, 3), (1, -3)]), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_strategy_for_mode() {
        assert_eq!(strategy_for(MergeMode::Summing).name(), "summing");
        assert_eq!(strategy_for(MergeMode::Collapsing).name(), "collapsing");
    }
}
