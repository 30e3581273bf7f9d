//! RateTable and the greedy + unbounded-knapsack-DP planner (§4.2).

use vendo_database::RateRow;

/// One price-table line, detached from its storage row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLine {
    pub amount: i64,
    pub minutes: i64,
    pub up_kbps: i64,
    pub down_kbps: i64,
}

impl From<&RateRow> for RateLine {
    fn from(row: &RateRow) -> Self {
        Self {
            amount: row.amount,
            minutes: row.minutes,
            up_kbps: row.rate_up_kbps,
            down_kbps: row.rate_down_kbps,
        }
    }
}

/// The result of planning a credit for a given amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Plan {
    pub minutes: i64,
    pub up_kbps: i64,
    pub down_kbps: i64,
}

impl Plan {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.minutes == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct DpCell {
    minutes: i64,
    line_count: i64,
    up_kbps: i64,
    down_kbps: i64,
}

/// Compute the maximum-minutes plan for `amount` pesos against `lines`.
///
/// `lines` should already be narrowed to whatever subset is visible to the
/// calling source; an empty slice always fails closed.
pub fn plan(lines: &[RateLine], amount: i64) -> Plan {
    if amount <= 0 || lines.is_empty() {
        return Plan::zero();
    }

    let greedy = greedy_plan(lines, amount);
    let dp = dp_plan(lines, amount);

    let exact = match (greedy, dp) {
        (Some(g), Some(d)) => Some(if d.minutes >= g.minutes { d } else { g }),
        (Some(g), None) => Some(g),
        (None, Some(d)) => Some(d),
        (None, None) => None,
    };

    if let Some(plan) = exact {
        return plan;
    }

    // Fallback: scale the amount=1 base rate linearly.
    if let Some(base) = lines.iter().find(|l| l.amount == 1) {
        return Plan {
            minutes: amount * base.minutes,
            up_kbps: base.up_kbps,
            down_kbps: base.down_kbps,
        };
    }

    Plan::zero()
}

/// Greedy pass: largest amount first, most minutes first on ties. Only
/// returns a plan if the full amount is spent exactly.
fn greedy_plan(lines: &[RateLine], amount: i64) -> Option<Plan> {
    let mut sorted: Vec<&RateLine> = lines.iter().filter(|l| l.amount > 0).collect();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount).then(b.minutes.cmp(&a.minutes)));

    let mut remaining = amount;
    let mut minutes = 0i64;
    let mut up_kbps = 0i64;
    let mut down_kbps = 0i64;

    for line in sorted {
        if remaining == 0 {
            break;
        }
        let count = remaining / line.amount;
        if count > 0 {
            remaining -= count * line.amount;
            minutes += count * line.minutes;
            up_kbps = up_kbps.max(line.up_kbps);
            down_kbps = down_kbps.max(line.down_kbps);
        }
    }

    if remaining == 0 {
        Some(Plan { minutes, up_kbps, down_kbps })
    } else {
        None
    }
}

/// Unbounded-knapsack DP maximizing minutes for spending exactly `amount`,
/// preferring fewer lines used on ties.
fn dp_plan(lines: &[RateLine], amount: i64) -> Option<Plan> {
    let amount = amount as usize;
    let mut dp: Vec<Option<DpCell>> = vec![None; amount + 1];
    dp[0] = Some(DpCell { minutes: 0, line_count: 0, up_kbps: 0, down_kbps: 0 });

    for x in 1..=amount {
        let mut best: Option<DpCell> = None;
        for line in lines.iter().filter(|l| l.amount > 0 && (l.amount as usize) <= x) {
            let prev_index = x - line.amount as usize;
            let Some(prev) = dp[prev_index] else { continue };
            let candidate = DpCell {
                minutes: prev.minutes + line.minutes,
                line_count: prev.line_count + 1,
                up_kbps: prev.up_kbps.max(line.up_kbps),
                down_kbps: prev.down_kbps.max(line.down_kbps),
            };
            let better = match best {
                None => true,
                Some(b) => {
                    candidate.minutes > b.minutes
                        || (candidate.minutes == b.minutes && candidate.line_count < b.line_count)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        dp[x] = best;
    }

    dp[amount].map(|cell| Plan {
        minutes: cell.minutes,
        up_kbps: cell.up_kbps,
        down_kbps: cell.down_kbps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(amount: i64, minutes: i64) -> RateLine {
        RateLine { amount, minutes, up_kbps: 512, down_kbps: 1024 }
    }

    #[test]
    fn plan_zero_amount_is_zero() {
        let lines = [line(1, 1), line(5, 7), line(10, 15)];
        assert_eq!(plan(&lines, 0), Plan::zero());
    }

    #[test]
    fn plan_with_only_base_rate() {
        let lines = [line(1, 1)];
        assert_eq!(plan(&lines, 1).minutes, 1);
        assert_eq!(plan(&lines, 7).minutes, 7);
    }

    #[test]
    fn dp_refinement_beats_pure_greedy() {
        // Greedy sorts 4,3,1 descending: floor(6/4)=1 leaves remainder 2,
        // fills with two 1's: minutes = 5 + 2 = 7.
        // The DP refinement finds two 3-lines instead: minutes = 4 + 4 = 8.
        let lines = [line(1, 1), line(3, 4), line(4, 5)];
        let result = plan(&lines, 6);
        assert_eq!(result.minutes, 8);
    }

    #[test]
    fn exact_combination_preferred_over_greedy_remainder() {
        let lines = [line(1, 1), line(5, 7), line(10, 15)];
        // Greedy: 10 + 1 + 1 + 1 = 18 minutes, remainder 0 (already exact).
        // The DP pass cannot beat this combination for these denominations,
        // so the optimal plan for amount=13 is 18 minutes.
        let result = plan(&lines, 13);
        assert_eq!(result.minutes, 18);
    }

    #[test]
    fn falls_back_to_base_rate_when_no_exact_combination_exists() {
        // No amount=1 line and no exact combination for 7 using only a
        // 3-unit line: falls closed since there's no base rate either.
        let lines = [line(3, 4)];
        assert_eq!(plan(&lines, 7), Plan::zero());
    }

    #[test]
    fn fails_closed_without_any_base_rate_or_exact_fit() {
        let lines = [line(5, 7), line(10, 15)];
        assert_eq!(plan(&lines, 3), Plan::zero());
    }

    #[test]
    fn empty_table_fails_closed() {
        assert_eq!(plan(&[], 10), Plan::zero());
    }

    #[test]
    fn speeds_reflect_max_across_lines_used() {
        let lines = [
            RateLine { amount: 1, minutes: 1, up_kbps: 128, down_kbps: 256 },
            RateLine { amount: 5, minutes: 7, up_kbps: 512, down_kbps: 1024 },
        ];
        let result = plan(&lines, 6);
        assert_eq!(result.up_kbps, 512);
        assert_eq!(result.down_kbps, 1024);
    }
}
