use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::badges::BadgeEvaluator;
use crate::db::Database;
use crate::error::LedgerError;
use crate::models::{
    Attempt, AttemptInput, CategoryStats, DailyStats, Difficulty, NewAttempt, UserBadge, UserStats,
};

pub const XP_PER_LEVEL: i64 = 1000;
pub const SLOW_ANSWER_SECS: i64 = 30;
pub const SLOW_ANSWER_PENALTY: i64 = 10;

const BASE_XP_CORRECT: i64 = 10;
const BASE_XP_INCORRECT: i64 = 2;

pub fn level_for_xp(total_xp: i64) -> i64 {
    total_xp.max(0) / XP_PER_LEVEL + 1
}

/// `round(part / whole * 100)`, rounding halves up. Zero when `whole` is zero.
pub fn percentage(part: i64, whole: i64) -> i64 {
    if whole <= 0 {
        return 0;
    }
    (part * 200 + whole) / (whole * 2)
}

pub fn study_minutes(seconds: i64) -> i64 {
    (seconds.max(0) + 30) / 60
}

pub fn default_xp(is_correct: bool, difficulty: Difficulty) -> i64 {
    let base = if is_correct {
        BASE_XP_CORRECT
    } else {
        BASE_XP_INCORRECT
    };
    base * difficulty.xp_multiplier() / 100
}

pub fn mastery(average_score: i64, average_time: i64) -> i64 {
    let penalty = if average_time > SLOW_ANSWER_SECS {
        SLOW_ANSWER_PENALTY
    } else {
        0
    };
    (average_score - penalty).clamp(0, 100)
}

pub fn answers_match(selected: &str, correct: &str) -> bool {
    selected.trim().to_lowercase() == correct.trim().to_lowercase()
}

/// UTC calendar day (YYYY-MM-DD) of an RFC3339 timestamp.
pub fn day_of(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(t) => t.with_timezone(&Utc).format("%Y-%m-%d").to_string(),
        Err(_) => timestamp.chars().take(10).collect(),
    }
}

pub fn validate_attempt(input: &AttemptInput) -> Result<NewAttempt, LedgerError> {
    let user_id = input.user_id.trim();
    if user_id.is_empty() {
        return Err(LedgerError::validation("userId", "must not be empty"));
    }

    let category = input.category.trim();
    if category.is_empty() {
        return Err(LedgerError::validation("category", "must not be empty"));
    }

    let difficulty = match input.difficulty.as_deref().map(str::trim) {
        None | Some("") => Difficulty::default(),
        Some(raw) => Difficulty::from_str(raw).ok_or_else(|| {
            LedgerError::validation("difficulty", "must be one of easy, medium, hard")
        })?,
    };

    let is_correct = match input.is_correct {
        Some(flag) => flag,
        None if input.correct_answer.trim().is_empty() => {
            return Err(LedgerError::validation(
                "correctAnswer",
                "required when isCorrect is omitted",
            ));
        }
        None => answers_match(&input.selected_answer, &input.correct_answer),
    };

    let xp_earned = match input.xp_earned {
        Some(xp) if xp < 0 => {
            return Err(LedgerError::validation("xpEarned", "must not be negative"));
        }
        Some(xp) => xp,
        None => default_xp(is_correct, difficulty),
    };

    let idempotency_key = input
        .idempotency_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from);

    Ok(NewAttempt {
        user_id: user_id.to_string(),
        category: category.to_string(),
        selected_answer: input.selected_answer.clone(),
        correct_answer: input.correct_answer.clone(),
        is_correct,
        time_spent_seconds: input.time_spent_seconds.unwrap_or(0).max(0),
        difficulty,
        xp_earned,
        idempotency_key,
    })
}

// Fold functions shared by the incremental path and replay

pub fn fold_user(stats: &UserStats, attempt: &Attempt) -> UserStats {
    let total_questions = stats.total_questions + 1;
    let correct_answers = stats.correct_answers + i64::from(attempt.is_correct);
    let current_streak = if attempt.is_correct {
        stats.current_streak + 1
    } else {
        0
    };
    let total_xp = stats.total_xp + attempt.xp_earned;

    UserStats {
        user_id: stats.user_id.clone(),
        total_questions,
        correct_answers,
        average_score: percentage(correct_answers, total_questions),
        current_streak,
        longest_streak: stats.longest_streak.max(current_streak),
        total_xp,
        current_level: level_for_xp(total_xp),
        total_study_time: stats.total_study_time + study_minutes(attempt.time_spent_seconds),
        rank: stats.rank,
        updated_at: attempt.attempted_at.clone(),
    }
}

/// Zero-question delta: only XP and the derived level move.
pub fn fold_bonus_xp(stats: &UserStats, xp: i64, at: &str) -> UserStats {
    let total_xp = stats.total_xp + xp.max(0);
    UserStats {
        total_xp,
        current_level: level_for_xp(total_xp),
        updated_at: at.to_string(),
        ..stats.clone()
    }
}

pub fn fold_category(prev: Option<&CategoryStats>, attempt: &Attempt) -> CategoryStats {
    let (count, correct, average_time, xp) = prev
        .map(|c| (c.questions_attempted, c.correct_answers, c.average_time, c.xp_earned))
        .unwrap_or((0, 0, 0, 0));

    let questions_attempted = count + 1;
    let correct_answers = correct + i64::from(attempt.is_correct);
    let average_score = percentage(correct_answers, questions_attempted);
    let total_time = average_time * count + attempt.time_spent_seconds;
    let average_time = (total_time as f64 / questions_attempted as f64).round() as i64;

    CategoryStats {
        user_id: attempt.user_id.clone(),
        category: attempt.category.clone(),
        questions_attempted,
        correct_answers,
        average_score,
        average_time,
        xp_earned: xp + attempt.xp_earned,
        mastery: mastery(average_score, average_time),
        last_attempted: attempt.attempted_at.clone(),
    }
}

pub fn fold_daily(prev: Option<&DailyStats>, attempt: &Attempt) -> DailyStats {
    let mut daily = prev.cloned().unwrap_or_else(|| DailyStats {
        user_id: attempt.user_id.clone(),
        date: day_of(&attempt.attempted_at),
        questions_answered: 0,
        correct_answers: 0,
        xp_earned: 0,
        study_time: 0,
        categories_studied: vec![],
    });

    daily.questions_answered += 1;
    daily.correct_answers += i64::from(attempt.is_correct);
    daily.xp_earned += attempt.xp_earned;
    daily.study_time += study_minutes(attempt.time_spent_seconds);
    if !daily.categories_studied.contains(&attempt.category) {
        daily.categories_studied.push(attempt.category.clone());
    }
    daily
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedAttempt {
    pub attempt: Attempt,
    pub stats: UserStats,
    pub new_badges: Vec<UserBadge>,
    // True when an earlier attempt with the same idempotency key was found
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub user_id: String,
    pub attempts_replayed: usize,
    pub badge_xp: i64,
    pub drifted: bool,
    pub previous: Option<UserStats>,
    pub stats: UserStats,
    pub categories: Vec<CategoryStats>,
    pub days: usize,
}

pub struct ProgressionEngine<'a> {
    db: &'a Database,
}

impl<'a> ProgressionEngine<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Validates and records one attempt as a single transaction.
    pub fn record_attempt(&self, input: &AttemptInput) -> Result<RecordedAttempt, LedgerError> {
        self.record(input, false)
    }

    /// Like [`record_attempt`](Self::record_attempt), but badges unlocked by the
    /// attempt are awarded before commit. A failed award rolls the attempt back.
    pub fn record_attempt_with_badges(&self, input: &AttemptInput) -> Result<RecordedAttempt, LedgerError> {
        self.record(input, true)
    }

    fn record(&self, input: &AttemptInput, award_badges: bool) -> Result<RecordedAttempt, LedgerError> {
        let attempt = validate_attempt(input)?;
        let tx = self.db.begin_immediate()?;

        if let Some(key) = &attempt.idempotency_key {
            if let Some(existing) = self.db.find_attempt_by_key(&attempt.user_id, key)? {
                let stats = self
                    .db
                    .get_user_stats(&attempt.user_id)?
                    .unwrap_or_else(|| UserStats::empty(&attempt.user_id));
                tx.commit()?;
                info!(
                    "Attempt for {} with key {} already recorded as #{}",
                    attempt.user_id, key, existing.id
                );
                return Ok(RecordedAttempt {
                    attempt: existing,
                    stats,
                    new_badges: Vec::new(),
                    duplicate: true,
                });
            }
        }

        let (recorded, mut stats) = self.apply_attempt(&attempt, Utc::now())?;
        let new_badges = if award_badges {
            BadgeEvaluator::new(self.db).evaluate(&recorded.user_id)?
        } else {
            Vec::new()
        };
        if !new_badges.is_empty() {
            stats = self.db.get_user_stats(&recorded.user_id)?.unwrap_or(stats);
        }
        tx.commit()?;

        info!(
            "Recorded attempt #{} for {} in {} (correct: {}, xp: {}, level: {})",
            recorded.id,
            recorded.user_id,
            recorded.category,
            recorded.is_correct,
            recorded.xp_earned,
            stats.current_level
        );

        Ok(RecordedAttempt {
            attempt: recorded,
            stats,
            new_badges,
            duplicate: false,
        })
    }

    /// Appends the attempt and folds it into every aggregate.
    ///
    /// Opens no transaction. The caller must hold one.
    pub fn apply_attempt(
        &self,
        attempt: &NewAttempt,
        at: DateTime<Utc>,
    ) -> Result<(Attempt, UserStats), LedgerError> {
        self.db.ensure_user(&attempt.user_id)?;
        let recorded = self.db.insert_attempt(attempt, &at.to_rfc3339())?;

        let current = self
            .db
            .get_user_stats(&recorded.user_id)?
            .unwrap_or_else(|| UserStats::empty(&recorded.user_id));
        let stats = fold_user(&current, &recorded);
        self.db.save_user_stats(&stats)?;

        let category = self.db.get_category_stats(&recorded.user_id, &recorded.category)?;
        self.db
            .save_category_stats(&fold_category(category.as_ref(), &recorded))?;

        let date = day_of(&recorded.attempted_at);
        let daily = self.db.get_daily_stats(&recorded.user_id, &date)?;
        self.db.save_daily_stats(&fold_daily(daily.as_ref(), &recorded))?;

        Ok((recorded, stats))
    }

    /// Adds badge XP without touching question counters. No transaction of its own.
    pub fn grant_bonus_xp(&self, user_id: &str, xp: i64) -> Result<UserStats, LedgerError> {
        let current = self
            .db
            .get_user_stats(user_id)?
            .unwrap_or_else(|| UserStats::empty(user_id));
        let stats = fold_bonus_xp(&current, xp, &Utc::now().to_rfc3339());
        self.db.save_user_stats(&stats)?;
        debug!("Granted {} bonus XP to {}", xp, user_id);
        Ok(stats)
    }

    pub fn user_stats(&self, user_id: &str) -> Result<UserStats, LedgerError> {
        if self.db.get_user(user_id)?.is_none() {
            return Err(LedgerError::not_found(format!("User '{user_id}'")));
        }
        Ok(self
            .db
            .get_user_stats(user_id)?
            .unwrap_or_else(|| UserStats::empty(user_id)))
    }

    /// Rebuilds every aggregate for one user from the attempt log and badge rewards.
    pub fn replay(&self, user_id: &str) -> Result<ReplayReport, LedgerError> {
        if self.db.get_user(user_id)?.is_none() {
            return Err(LedgerError::not_found(format!("User '{user_id}'")));
        }

        let tx = self.db.begin_immediate()?;

        let log = self.db.attempt_log(user_id)?;
        let mut stats = UserStats::empty(user_id);
        let mut categories: BTreeMap<String, CategoryStats> = BTreeMap::new();
        let mut days: BTreeMap<String, DailyStats> = BTreeMap::new();

        for attempt in &log {
            stats = fold_user(&stats, attempt);

            let category = fold_category(categories.get(&attempt.category), attempt);
            categories.insert(attempt.category.clone(), category);

            let date = day_of(&attempt.attempted_at);
            let daily = fold_daily(days.get(&date), attempt);
            days.insert(date, daily);
        }

        let badge_xp = self.db.badge_xp_total(user_id)?;
        let now = Utc::now().to_rfc3339();
        stats = fold_bonus_xp(&stats, badge_xp, &now);

        let previous = self.db.get_user_stats(user_id)?;
        let mut stored_categories = self.db.list_category_stats(user_id)?;
        stored_categories.sort_by(|a, b| a.category.cmp(&b.category));
        let mut stored_days = self.db.list_daily_stats(user_id, "")?;
        stored_days.sort_by(|a, b| a.date.cmp(&b.date));

        let rebuilt_categories: Vec<CategoryStats> = categories.into_values().collect();
        let rebuilt_days: Vec<DailyStats> = days.into_values().collect();

        let baseline = previous
            .clone()
            .unwrap_or_else(|| UserStats::empty(user_id));
        let drifted = !baseline.same_aggregates(&stats)
            || stored_categories != rebuilt_categories
            || stored_days != rebuilt_days;

        stats.rank = baseline.rank;
        self.db.save_user_stats(&stats)?;
        self.db.delete_category_stats(user_id)?;
        for category in &rebuilt_categories {
            self.db.save_category_stats(category)?;
        }
        self.db.delete_daily_stats(user_id)?;
        for daily in &rebuilt_days {
            self.db.save_daily_stats(daily)?;
        }

        tx.commit()?;

        if drifted {
            warn!(
                "Aggregates for {} drifted from the attempt log and were rebuilt",
                user_id
            );
        } else {
            info!("Replayed {} attempts for {}, no drift", log.len(), user_id);
        }

        Ok(ReplayReport {
            user_id: user_id.to_string(),
            attempts_replayed: log.len(),
            badge_xp,
            drifted,
            previous,
            stats,
            categories: rebuilt_categories,
            days: rebuilt_days.len(),
        })
    }
}
