use crate::models::DailyStats;
use serde::Serialize;

/// One member's input to a team rollup.
///
/// `active` lets presence or session data override the counter-based
/// activity check.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub user_id: String,
    pub stats: DailyStats,
    pub active: Option<bool>,
}

impl MemberRecord {
    pub fn new(user_id: impl Into<String>, stats: DailyStats) -> Self {
        Self {
            user_id: user_id.into(),
            stats,
            active: None,
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    fn is_active(&self) -> bool {
        self.active.unwrap_or_else(|| self.stats.is_active())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub user_id: String,
    pub stats: DailyStats,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamStats {
    pub total_knocks: u64,
    pub total_interactions: u64,
    pub total_rgus: u64,
    pub average_conversion: f64,
    pub active_members: usize,
    pub per_member: Vec<TeamMember>,
}

/// `rgus / knocks * 100` rounded to 2 decimals, or 0 without knocks.
pub fn conversion_rate(rgus: u64, knocks: u64) -> f64 {
    if knocks == 0 {
        return 0.0;
    }
    round2(rgus as f64 / knocks as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Rolls per-member records for one date up into team totals.
///
/// `average_conversion` is the ratio of the totals, not the mean of the
/// members' rates. Members keep their input order.
pub fn aggregate(records: &[MemberRecord]) -> TeamStats {
    let mut team = TeamStats {
        per_member: Vec::with_capacity(records.len()),
        ..TeamStats::default()
    };

    for record in records {
        let is_active = record.is_active();
        team.total_knocks = team.total_knocks.saturating_add(record.stats.knocks);
        team.total_interactions = team
            .total_interactions
            .saturating_add(record.stats.effective_interactions);
        team.total_rgus = team.total_rgus.saturating_add(record.stats.rgus);
        if is_active {
            team.active_members += 1;
        }
        team.per_member.push(TeamMember {
            user_id: record.user_id.clone(),
            stats: record.stats,
            is_active,
        });
    }

    team.average_conversion = conversion_rate(team.total_rgus, team.total_knocks);
    team
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_team() -> Vec<MemberRecord> {
        vec![
            MemberRecord::new("john", DailyStats::new(15, 12, 4)),
            MemberRecord::new("sarah", DailyStats::new(18, 11, 5)),
            MemberRecord::new("mike", DailyStats::new(12, 9, 3)),
        ]
    }

    #[test]
    fn aggregate_empty_is_all_zero() {
        let team = aggregate(&[]);
        assert_eq!(team.total_knocks, 0);
        assert_eq!(team.total_interactions, 0);
        assert_eq!(team.total_rgus, 0);
        assert_eq!(team.average_conversion, 0.0);
        assert_eq!(team.active_members, 0);
        assert!(team.per_member.is_empty());
    }

    #[test]
    fn aggregate_sums_members() {
        let team = aggregate(&sample_team());
        assert_eq!(team.total_knocks, 45);
        assert_eq!(team.total_interactions, 32);
        assert_eq!(team.total_rgus, 12);
        assert_eq!(team.average_conversion, 26.67);
        assert_eq!(team.active_members, 3);
    }

    #[test]
    fn average_is_ratio_of_totals_not_mean_of_rates() {
        let records = vec![
            MemberRecord::new("a", DailyStats::new(1, 1, 1)),
            MemberRecord::new("b", DailyStats::new(99, 10, 0)),
        ];
        let team = aggregate(&records);
        // The mean of the rates would be 50.
        assert_eq!(team.average_conversion, 1.0);
    }

    #[test]
    fn per_member_keeps_input_order() {
        let records = vec![
            MemberRecord::new("low", DailyStats::new(1, 0, 0)),
            MemberRecord::new("high", DailyStats::new(50, 20, 10)),
            MemberRecord::new("zero", DailyStats::default()),
            MemberRecord::new("mid", DailyStats::new(10, 5, 1)),
        ];
        let team = aggregate(&records);
        let order: Vec<&str> = team.per_member.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(order, vec!["low", "high", "zero", "mid"]);
    }

    #[test]
    fn activity_defaults_to_nonzero_counters() {
        let records = vec![
            MemberRecord::new("idle", DailyStats::default()),
            MemberRecord::new("talker", DailyStats::new(0, 1, 0)),
        ];
        let team = aggregate(&records);
        assert_eq!(team.active_members, 1);
        assert!(!team.per_member[0].is_active);
        assert!(team.per_member[1].is_active);
    }

    #[test]
    fn active_flag_overrides_counters() {
        let mut records = sample_team();
        records[2] = records[2].clone().with_active(false);
        records.push(MemberRecord::new("online", DailyStats::default()).with_active(true));

        let team = aggregate(&records);
        assert_eq!(team.active_members, 3);
        assert!(!team.per_member[2].is_active);
        assert!(team.per_member[3].is_active);
        assert_eq!(team.total_knocks, 45);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let records = sample_team();
        assert_eq!(aggregate(&records), aggregate(&records));
    }
}
