use chrono::Utc;
use tracing::info;

use crate::db::Database;
use crate::error::LedgerError;
use crate::models::{
    AwardOutcome, Badge, BadgeOverview, BadgeProgress, BadgeTier, QuizCounters, RequirementType,
    UserBadge, UserStats,
};
use crate::progression::ProgressionEngine;

pub const HIGH_ACCURACY_PERCENT: i64 = 90;
pub const FAST_COMPLETION_SECS: i64 = 120;

#[derive(Debug, Clone)]
pub struct BadgeDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub tier: BadgeTier,
    pub requirement_type: RequirementType,
    pub requirement: i64,
    pub xp_reward: i64,
}

const fn def(
    name: &'static str,
    description: &'static str,
    tier: BadgeTier,
    requirement_type: RequirementType,
    requirement: i64,
    xp_reward: i64,
) -> BadgeDefinition {
    BadgeDefinition {
        name,
        description,
        tier,
        requirement_type,
        requirement,
        xp_reward,
    }
}

/// Catalog seeded on `init`. Existing rows (matched by name) are left alone.
pub fn default_catalog() -> Vec<BadgeDefinition> {
    use BadgeTier::*;
    use RequirementType::*;

    vec![
        def("First Steps", "Complete your first quiz", Bronze, QuizzesCompleted, 1, 50),
        def("Quiz Enthusiast", "Complete 10 quizzes", Silver, QuizzesCompleted, 10, 150),
        def("Quiz Master", "Complete 50 quizzes", Gold, QuizzesCompleted, 50, 500),
        def("Sharp Mind", "Score 90% or higher on 5 quizzes", Silver, HighAccuracyQuizzes, 5, 200),
        def("Perfectionist", "Score 100% on a quiz", Gold, PerfectScores, 1, 250),
        def("Flawless Run", "Score 100% on 10 quizzes", Platinum, PerfectScores, 10, 1000),
        def("Speed Demon", "Finish 3 quizzes in under two minutes", Silver, FastCompletions, 3, 150),
        def("Dedicated Learner", "Study 7 days in a row", Gold, ConsecutiveDays, 7, 300),
        def("Century", "Answer 100 questions", Silver, QuestionsAnswered, 100, 200),
        def("On Fire", "Answer 10 questions correctly in a row", Bronze, Streak, 10, 100),
        def("Unstoppable", "Answer 50 questions correctly in a row", Gold, Streak, 50, 500),
        def("Rising Star", "Earn 1000 XP from questions", Silver, Xp, 1000, 200),
    ]
}

/// Current progress toward a requirement, or None when it can't be measured.
///
/// XP progress excludes badge rewards so awards never feed further awards.
pub fn progress_for(
    requirement: RequirementType,
    quizzes: &QuizCounters,
    stats: &UserStats,
    badge_xp: i64,
) -> Option<i64> {
    match requirement {
        RequirementType::QuizzesCompleted => Some(quizzes.completed),
        RequirementType::HighAccuracyQuizzes => Some(quizzes.high_accuracy),
        RequirementType::PerfectScores => Some(quizzes.perfect),
        RequirementType::FastCompletions => Some(quizzes.fast),
        RequirementType::ConsecutiveDays => None,
        RequirementType::QuestionsAnswered => Some(stats.total_questions),
        RequirementType::Streak => Some(stats.longest_streak),
        RequirementType::Xp => Some((stats.total_xp - badge_xp).max(0)),
    }
}

pub struct BadgeEvaluator<'a> {
    db: &'a Database,
}

impl<'a> BadgeEvaluator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Awards every badge whose threshold is met, as one transaction.
    pub fn check_and_award(&self, user_id: &str) -> Result<Vec<UserBadge>, LedgerError> {
        if self.db.get_user(user_id)?.is_none() {
            return Err(LedgerError::not_found(format!("User '{user_id}'")));
        }

        let tx = self.db.begin_immediate()?;
        let awarded = self.evaluate(user_id)?;
        tx.commit()?;
        Ok(awarded)
    }

    /// Evaluation without a transaction of its own.
    pub fn evaluate(&self, user_id: &str) -> Result<Vec<UserBadge>, LedgerError> {
        let quizzes = self.db.quiz_counters(user_id)?;
        let stats = self
            .db
            .get_user_stats(user_id)?
            .unwrap_or_else(|| UserStats::empty(user_id));
        let badge_xp = self.db.badge_xp_total(user_id)?;
        let earned: Vec<i64> = self
            .db
            .list_user_badges(user_id)?
            .iter()
            .map(|b| b.badge_id)
            .collect();

        let mut awarded = Vec::new();
        for badge in self.db.list_badges()? {
            if earned.contains(&badge.id) || !badge.requirement_type.is_supported() {
                continue;
            }
            let Some(progress) = progress_for(badge.requirement_type, &quizzes, &stats, badge_xp)
            else {
                continue;
            };
            if progress < badge.requirement {
                continue;
            }
            if let AwardOutcome::Awarded(award) = self.award(user_id, &badge, progress)? {
                awarded.push(award);
            }
        }

        Ok(awarded)
    }

    /// Inserts the award and grants its XP. A second award is a no-op.
    pub fn award(&self, user_id: &str, badge: &Badge, progress: i64) -> Result<AwardOutcome, LedgerError> {
        let award = UserBadge {
            user_id: user_id.to_string(),
            badge_id: badge.id,
            name: badge.name.clone(),
            earned_at: Utc::now().to_rfc3339(),
            progress,
            xp_reward: badge.xp_reward,
        };

        if !self.db.insert_user_badge(&award)? {
            return Ok(AwardOutcome::AlreadyEarned);
        }

        if badge.xp_reward > 0 {
            ProgressionEngine::new(self.db).grant_bonus_xp(user_id, badge.xp_reward)?;
        }

        info!(
            "Awarded '{}' ({}) to {} (+{} XP)",
            badge.name,
            badge.tier.as_str(),
            user_id,
            badge.xp_reward
        );
        Ok(AwardOutcome::Awarded(award))
    }

    pub fn overview(&self, user_id: &str) -> Result<BadgeOverview, LedgerError> {
        if self.db.get_user(user_id)?.is_none() {
            return Err(LedgerError::not_found(format!("User '{user_id}'")));
        }

        let quizzes = self.db.quiz_counters(user_id)?;
        let stats = self
            .db
            .get_user_stats(user_id)?
            .unwrap_or_else(|| UserStats::empty(user_id));
        let badge_xp = self.db.badge_xp_total(user_id)?;
        let earned = self.db.list_user_badges(user_id)?;

        let available = self
            .db
            .list_badges()?
            .into_iter()
            .filter(|b| !earned.iter().any(|e| e.badge_id == b.id))
            .map(|badge| BadgeProgress {
                progress: progress_for(badge.requirement_type, &quizzes, &stats, badge_xp)
                    .map(|p| p.min(badge.requirement)),
                badge,
            })
            .collect();

        Ok(BadgeOverview { earned, available })
    }
}
