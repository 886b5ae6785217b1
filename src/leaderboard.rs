use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::info;

use crate::db::Database;
use crate::error::LedgerError;
use crate::models::{LeaderboardEntry, UserRank};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Descending XP, then accuracy, then questions answered; ascending user id last.
pub fn compare_standing(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.total_xp
        .cmp(&a.total_xp)
        .then_with(|| b.average_score.cmp(&a.average_score))
        .then_with(|| b.total_questions.cmp(&a.total_questions))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Sorts and assigns contiguous ranks starting at 1.
pub fn assign_ranks(mut entries: Vec<LeaderboardEntry>) -> Vec<LeaderboardEntry> {
    entries.sort_by(compare_standing);
    for (position, entry) in entries.iter_mut().enumerate() {
        entry.rank = position as i64 + 1;
    }
    entries
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub ranked_users: usize,
    pub category_boards: usize,
}

pub struct LeaderboardRanker<'a> {
    db: &'a Database,
}

impl<'a> LeaderboardRanker<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Rewrites the global board, every category board and the rank cache.
    pub fn refresh(&self) -> Result<RefreshSummary, LedgerError> {
        let tx = self.db.begin_immediate()?;
        self.db.clear_leaderboard()?;

        let global = assign_ranks(self.db.global_standings()?);
        for entry in &global {
            self.db.insert_leaderboard_entry(entry)?;
        }

        let mut boards: BTreeMap<String, Vec<LeaderboardEntry>> = BTreeMap::new();
        for entry in self.db.category_standings()? {
            let key = entry.category.clone().unwrap_or_default();
            boards.entry(key).or_default().push(entry);
        }
        for entries in boards.values() {
            for entry in assign_ranks(entries.clone()) {
                self.db.insert_leaderboard_entry(&entry)?;
            }
        }

        tx.commit()?;

        info!(
            "Leaderboard refreshed: {} ranked users, {} category boards",
            global.len(),
            boards.len()
        );
        Ok(RefreshSummary {
            ranked_users: global.len(),
            category_boards: boards.len(),
        })
    }

    pub fn get_page(&self, limit: Option<i64>, category: Option<&str>) -> Result<Vec<LeaderboardEntry>, LedgerError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit < 1 {
            return Err(LedgerError::validation("limit", "must be at least 1"));
        }
        let category = category.map(str::trim).filter(|c| !c.is_empty());
        Ok(self.db.leaderboard_page(category, limit.min(MAX_PAGE_SIZE))?)
    }

    /// Live position on the global board, computed without a refresh.
    pub fn get_user_rank(&self, user_id: &str) -> Result<UserRank, LedgerError> {
        if self.db.get_user(user_id)?.is_none() {
            return Err(LedgerError::not_found(format!("User '{user_id}'")));
        }

        let Some(stats) = self.db.get_user_stats(user_id)? else {
            return Ok(UserRank {
                user_id: user_id.to_string(),
                rank: None,
                total_xp: 0,
                average_accuracy: 0,
            });
        };

        let rank = if stats.total_xp > 0 {
            Some(self.db.count_ranked_ahead(&stats)? + 1)
        } else {
            None
        };

        Ok(UserRank {
            user_id: user_id.to_string(),
            rank,
            total_xp: stats.total_xp,
            average_accuracy: stats.average_score,
        })
    }
}
