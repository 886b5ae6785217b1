use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result, Row, Transaction, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use crate::badges::{BadgeDefinition, FAST_COMPLETION_SECS, HIGH_ACCURACY_PERCENT};
use crate::models::{
    Attempt, Badge, BadgeTier, CategoryStats, CustomExam, DailyStats, Difficulty, ExamGenerationRecord,
    ExamScore, ExamStem, ExamType, GenerationStatus, LeaderboardEntry, Lecture, LectureNotes,
    LectureStatus, LectureTranscript, NewAttempt, ProcessingLog, ProcessingStep, QuizCounters,
    QuizItem, RequirementType, StemOption, User, UserBadge, UserStats,
};

// Storage key for the global board
const GLOBAL_BOARD: &str = "";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE,
                full_name TEXT,
                created_at TEXT NOT NULL
            );

            -- Append-only answer log, the source of truth for every aggregate
            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                category TEXT NOT NULL CHECK(length(trim(category)) > 0),
                selected_answer TEXT NOT NULL,
                correct_answer TEXT NOT NULL,
                is_correct INTEGER NOT NULL,
                time_spent_seconds INTEGER NOT NULL CHECK(time_spent_seconds >= 0),
                difficulty TEXT NOT NULL CHECK(difficulty IN ('easy', 'medium', 'hard')),
                xp_earned INTEGER NOT NULL CHECK(xp_earned >= 0),
                attempted_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TRIGGER IF NOT EXISTS attempts_no_update BEFORE UPDATE ON attempts
            BEGIN
                SELECT RAISE(ABORT, 'attempts are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS attempts_no_delete BEFORE DELETE ON attempts
            BEGIN
                SELECT RAISE(ABORT, 'attempts are append-only');
            END;

            CREATE TABLE IF NOT EXISTS user_stats (
                user_id TEXT PRIMARY KEY,
                total_questions INTEGER NOT NULL DEFAULT 0,
                correct_answers INTEGER NOT NULL DEFAULT 0,
                average_score INTEGER NOT NULL DEFAULT 0,
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                total_xp INTEGER NOT NULL DEFAULT 0 CHECK(total_xp >= 0),
                current_level INTEGER NOT NULL DEFAULT 1,
                total_study_time INTEGER NOT NULL DEFAULT 0,
                rank INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                CHECK (correct_answers <= total_questions),
                CHECK (current_streak <= longest_streak),
                CHECK (current_level = total_xp / 1000 + 1),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS category_stats (
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                questions_attempted INTEGER NOT NULL DEFAULT 0,
                correct_answers INTEGER NOT NULL DEFAULT 0,
                average_score INTEGER NOT NULL DEFAULT 0,
                average_time INTEGER NOT NULL DEFAULT 0,
                xp_earned INTEGER NOT NULL DEFAULT 0,
                mastery INTEGER NOT NULL DEFAULT 0 CHECK(mastery BETWEEN 0 AND 100),
                last_attempted TEXT NOT NULL,
                PRIMARY KEY (user_id, category),
                CHECK (correct_answers <= questions_attempted),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                questions_answered INTEGER NOT NULL DEFAULT 0,
                correct_answers INTEGER NOT NULL DEFAULT 0,
                xp_earned INTEGER NOT NULL DEFAULT 0,
                study_time INTEGER NOT NULL DEFAULT 0,
                categories_studied TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (user_id, date),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS badges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                tier TEXT NOT NULL CHECK(tier IN ('bronze', 'silver', 'gold', 'platinum')),
                requirement_type TEXT NOT NULL,
                requirement INTEGER NOT NULL,
                xp_reward INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS user_badges (
                user_id TEXT NOT NULL,
                badge_id INTEGER NOT NULL,
                earned_at TEXT NOT NULL,
                progress INTEGER NOT NULL,
                xp_reward INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, badge_id),
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (badge_id) REFERENCES badges(id)
            );

            -- Materialized ranking, fully rewritten on refresh ('' = global board)
            CREATE TABLE IF NOT EXISTS leaderboard (
                category TEXT NOT NULL DEFAULT '',
                user_id TEXT NOT NULL,
                rank INTEGER NOT NULL CHECK(rank >= 1),
                total_xp INTEGER NOT NULL,
                average_score INTEGER NOT NULL,
                total_questions INTEGER NOT NULL,
                current_level INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (category, user_id),
                UNIQUE (category, rank),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS custom_exams (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                exam_type TEXT NOT NULL CHECK(exam_type IN ('anatomy', 'physiology')),
                title TEXT NOT NULL,
                topics TEXT NOT NULL,
                stem_count INTEGER NOT NULL,
                duration_seconds INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS exam_stems (
                id TEXT PRIMARY KEY,
                exam_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                stem_text TEXT NOT NULL,
                topic TEXT,
                UNIQUE (exam_id, order_index),
                FOREIGN KEY (exam_id) REFERENCES custom_exams(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS stem_options (
                id TEXT PRIMARY KEY,
                stem_id TEXT NOT NULL,
                letter TEXT NOT NULL CHECK(letter IN ('A', 'B')),
                statement TEXT NOT NULL,
                is_correct INTEGER NOT NULL,
                explanation TEXT,
                UNIQUE (stem_id, letter),
                FOREIGN KEY (stem_id) REFERENCES exam_stems(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS exam_generation_history (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                exam_type TEXT NOT NULL,
                topics TEXT NOT NULL,
                requested_stem_count INTEGER NOT NULL,
                actual_stem_count INTEGER,
                status TEXT NOT NULL CHECK(status IN ('success', 'failed')),
                provider TEXT NOT NULL DEFAULT 'deepseek',
                duration_ms INTEGER NOT NULL,
                error_message TEXT,
                custom_exam_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (custom_exam_id) REFERENCES custom_exams(id)
            );

            CREATE TRIGGER IF NOT EXISTS generation_history_no_update
            BEFORE UPDATE ON exam_generation_history
            BEGIN
                SELECT RAISE(ABORT, 'generation history is append-only');
            END;

            CREATE TABLE IF NOT EXISTS exam_submissions (
                id TEXT PRIMARY KEY,
                exam_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                time_spent_seconds INTEGER NOT NULL,
                total_stems INTEGER NOT NULL,
                correct INTEGER NOT NULL,
                incorrect INTEGER NOT NULL,
                unanswered INTEGER NOT NULL,
                score_percentage INTEGER NOT NULL CHECK(score_percentage BETWEEN 0 AND 100),
                xp_earned INTEGER NOT NULL,
                completed_at TEXT NOT NULL,
                CHECK (correct + incorrect + unanswered = total_stems),
                FOREIGN KEY (exam_id) REFERENCES custom_exams(id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS lectures (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                module TEXT NOT NULL,
                topic TEXT,
                status TEXT NOT NULL CHECK(status IN ('processing', 'completed', 'failed')),
                processing_progress INTEGER NOT NULL DEFAULT 0
                    CHECK(processing_progress BETWEEN 0 AND 100),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS lecture_transcripts (
                lecture_id TEXT PRIMARY KEY,
                raw_transcript TEXT NOT NULL,
                unified_transcript TEXT NOT NULL,
                language_detected TEXT NOT NULL,
                confidence REAL NOT NULL,
                FOREIGN KEY (lecture_id) REFERENCES lectures(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS lecture_notes (
                lecture_id TEXT PRIMARY KEY,
                notes TEXT NOT NULL,
                summary TEXT NOT NULL,
                key_points TEXT NOT NULL DEFAULT '[]',
                medical_terms TEXT NOT NULL DEFAULT '[]',
                questions TEXT NOT NULL DEFAULT '[]',
                FOREIGN KEY (lecture_id) REFERENCES lectures(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS lecture_processing_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lecture_id TEXT NOT NULL,
                step TEXT NOT NULL
                    CHECK(step IN ('transcription', 'note_generation', 'question_generation')),
                status TEXT NOT NULL CHECK(status IN ('success', 'failed')),
                duration_ms INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (lecture_id) REFERENCES lectures(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_user ON attempts(user_id, id);
            CREATE INDEX IF NOT EXISTS idx_category_stats_user ON category_stats(user_id);
            CREATE INDEX IF NOT EXISTS idx_daily_stats_user ON daily_stats(user_id, date);
            CREATE INDEX IF NOT EXISTS idx_user_stats_xp ON user_stats(total_xp);
            CREATE INDEX IF NOT EXISTS idx_exam_stems_exam ON exam_stems(exam_id);
            CREATE INDEX IF NOT EXISTS idx_generation_history_user ON exam_generation_history(user_id);
            CREATE INDEX IF NOT EXISTS idx_submissions_user ON exam_submissions(user_id);
            CREATE INDEX IF NOT EXISTS idx_processing_logs_lecture ON lecture_processing_logs(lecture_id);
            "#,
        )?;

        // Run migrations for existing databases
        self.migrate()?;

        // Index on migrated column (after migration ensures it exists)
        self.conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_idempotency ON attempts(user_id, idempotency_key);",
        )?;

        self.seed_badges(&crate::badges::default_catalog())?;

        Ok(())
    }

    // Handle schema migrations for existing databases
    fn migrate(&self) -> Result<()> {
        let has_idempotency_key: bool = self
            .conn
            .prepare("SELECT idempotency_key FROM attempts LIMIT 1")
            .is_ok();

        if !has_idempotency_key {
            self.conn
                .execute_batch("ALTER TABLE attempts ADD COLUMN idempotency_key TEXT;")?;
        }

        Ok(())
    }

    /// Opens a write transaction that takes the database lock at BEGIN.
    ///
    /// Every gateway call made while the returned guard is alive runs inside
    /// it; dropping the guard without `commit()` rolls everything back.
    pub fn begin_immediate(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // User operations
    pub fn create_user(&self, id: &str, email: Option<&str>, full_name: Option<&str>) -> Result<User> {
        self.conn.execute(
            r#"
            INSERT INTO users (id, email, full_name, created_at) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![id, email, full_name, Utc::now().to_rfc3339()],
        )?;
        self.get_user(id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn ensure_user(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, created_at) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, full_name, created_at FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        full_name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
    }

    // Attempt log
    pub fn insert_attempt(&self, attempt: &NewAttempt, attempted_at: &str) -> Result<Attempt> {
        self.conn.execute(
            r#"
            INSERT INTO attempts (user_id, category, selected_answer, correct_answer, is_correct,
                                  time_spent_seconds, difficulty, xp_earned, attempted_at, idempotency_key)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                attempt.user_id,
                attempt.category,
                attempt.selected_answer,
                attempt.correct_answer,
                attempt.is_correct,
                attempt.time_spent_seconds,
                attempt.difficulty.as_str(),
                attempt.xp_earned,
                attempted_at,
                attempt.idempotency_key,
            ],
        )?;

        Ok(Attempt {
            id: self.conn.last_insert_rowid(),
            user_id: attempt.user_id.clone(),
            category: attempt.category.clone(),
            selected_answer: attempt.selected_answer.clone(),
            correct_answer: attempt.correct_answer.clone(),
            is_correct: attempt.is_correct,
            time_spent_seconds: attempt.time_spent_seconds,
            difficulty: attempt.difficulty,
            xp_earned: attempt.xp_earned,
            attempted_at: attempted_at.to_string(),
            idempotency_key: attempt.idempotency_key.clone(),
        })
    }

    pub fn find_attempt_by_key(&self, user_id: &str, key: &str) -> Result<Option<Attempt>> {
        self.conn
            .query_row(
                &format!("{ATTEMPT_COLUMNS} WHERE user_id = ?1 AND idempotency_key = ?2"),
                params![user_id, key],
                attempt_from_row,
            )
            .optional()
    }

    /// Most recent attempts first.
    pub fn list_attempts(&self, user_id: &str, limit: i64) -> Result<Vec<Attempt>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ATTEMPT_COLUMNS} WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit], attempt_from_row)?;
        rows.collect()
    }

    /// The full log for one user in write order.
    pub fn attempt_log(&self, user_id: &str) -> Result<Vec<Attempt>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ATTEMPT_COLUMNS} WHERE user_id = ?1 ORDER BY id ASC"))?;
        let rows = stmt.query_map(params![user_id], attempt_from_row)?;
        rows.collect()
    }

    // Aggregates
    pub fn get_user_stats(&self, user_id: &str) -> Result<Option<UserStats>> {
        self.conn
            .query_row(
                r#"
                SELECT user_id, total_questions, correct_answers, average_score, current_streak,
                       longest_streak, total_xp, current_level, total_study_time, rank, updated_at
                FROM user_stats
                WHERE user_id = ?1
                "#,
                params![user_id],
                user_stats_from_row,
            )
            .optional()
    }

    pub fn save_user_stats(&self, stats: &UserStats) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO user_stats (user_id, total_questions, correct_answers, average_score,
                                    current_streak, longest_streak, total_xp, current_level,
                                    total_study_time, rank, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(user_id) DO UPDATE SET
                total_questions = excluded.total_questions,
                correct_answers = excluded.correct_answers,
                average_score = excluded.average_score,
                current_streak = excluded.current_streak,
                longest_streak = excluded.longest_streak,
                total_xp = excluded.total_xp,
                current_level = excluded.current_level,
                total_study_time = excluded.total_study_time,
                rank = excluded.rank,
                updated_at = excluded.updated_at
            "#,
            params![
                stats.user_id,
                stats.total_questions,
                stats.correct_answers,
                stats.average_score,
                stats.current_streak,
                stats.longest_streak,
                stats.total_xp,
                stats.current_level,
                stats.total_study_time,
                stats.rank,
                stats.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_category_stats(&self, user_id: &str, category: &str) -> Result<Option<CategoryStats>> {
        self.conn
            .query_row(
                &format!("{CATEGORY_COLUMNS} WHERE user_id = ?1 AND category = ?2"),
                params![user_id, category],
                category_stats_from_row,
            )
            .optional()
    }

    /// Most recently attempted first.
    pub fn list_category_stats(&self, user_id: &str) -> Result<Vec<CategoryStats>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CATEGORY_COLUMNS} WHERE user_id = ?1 ORDER BY last_attempted DESC, category ASC"
        ))?;
        let rows = stmt.query_map(params![user_id], category_stats_from_row)?;
        rows.collect()
    }

    pub fn save_category_stats(&self, stats: &CategoryStats) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO category_stats (user_id, category, questions_attempted, correct_answers,
                                        average_score, average_time, xp_earned, mastery, last_attempted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(user_id, category) DO UPDATE SET
                questions_attempted = excluded.questions_attempted,
                correct_answers = excluded.correct_answers,
                average_score = excluded.average_score,
                average_time = excluded.average_time,
                xp_earned = excluded.xp_earned,
                mastery = excluded.mastery,
                last_attempted = excluded.last_attempted
            "#,
            params![
                stats.user_id,
                stats.category,
                stats.questions_attempted,
                stats.correct_answers,
                stats.average_score,
                stats.average_time,
                stats.xp_earned,
                stats.mastery,
                stats.last_attempted,
            ],
        )?;
        Ok(())
    }

    pub fn delete_category_stats(&self, user_id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM category_stats WHERE user_id = ?1", params![user_id])
    }

    pub fn get_daily_stats(&self, user_id: &str, date: &str) -> Result<Option<DailyStats>> {
        self.conn
            .query_row(
                &format!("{DAILY_COLUMNS} WHERE user_id = ?1 AND date = ?2"),
                params![user_id, date],
                daily_stats_from_row,
            )
            .optional()
    }

    /// Days on or after `since` (YYYY-MM-DD), newest first.
    pub fn list_daily_stats(&self, user_id: &str, since: &str) -> Result<Vec<DailyStats>> {
        let mut stmt = self.conn.prepare(&format!(
            "{DAILY_COLUMNS} WHERE user_id = ?1 AND date >= ?2 ORDER BY date DESC"
        ))?;
        let rows = stmt.query_map(params![user_id, since], daily_stats_from_row)?;
        rows.collect()
    }

    pub fn save_daily_stats(&self, stats: &DailyStats) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO daily_stats (user_id, date, questions_answered, correct_answers,
                                     xp_earned, study_time, categories_studied)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(user_id, date) DO UPDATE SET
                questions_answered = excluded.questions_answered,
                correct_answers = excluded.correct_answers,
                xp_earned = excluded.xp_earned,
                study_time = excluded.study_time,
                categories_studied = excluded.categories_studied
            "#,
            params![
                stats.user_id,
                stats.date,
                stats.questions_answered,
                stats.correct_answers,
                stats.xp_earned,
                stats.study_time,
                to_json(&stats.categories_studied)?,
            ],
        )?;
        Ok(())
    }

    pub fn delete_daily_stats(&self, user_id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM daily_stats WHERE user_id = ?1", params![user_id])
    }

    // Badge operations
    pub fn seed_badges(&self, catalog: &[BadgeDefinition]) -> Result<usize> {
        let mut inserted = 0;
        for def in catalog {
            inserted += self.conn.execute(
                r#"
                INSERT OR IGNORE INTO badges (name, description, tier, requirement_type, requirement, xp_reward)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    def.name,
                    def.description,
                    def.tier.as_str(),
                    def.requirement_type.as_str(),
                    def.requirement,
                    def.xp_reward,
                ],
            )?;
        }
        Ok(inserted)
    }

    pub fn list_badges(&self) -> Result<Vec<Badge>> {
        let mut stmt = self.conn.prepare(&format!("{BADGE_COLUMNS} ORDER BY id"))?;
        let rows = stmt.query_map([], badge_from_row)?;
        let badges = rows.collect::<Result<Vec<_>>>()?;
        Ok(badges.into_iter().flatten().collect())
    }

    pub fn list_user_badges(&self, user_id: &str) -> Result<Vec<UserBadge>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ub.user_id, ub.badge_id, b.name, ub.earned_at, ub.progress, ub.xp_reward
            FROM user_badges ub
            JOIN badges b ON b.id = ub.badge_id
            WHERE ub.user_id = ?1
            ORDER BY ub.earned_at, ub.badge_id
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(UserBadge {
                user_id: row.get(0)?,
                badge_id: row.get(1)?,
                name: row.get(2)?,
                earned_at: row.get(3)?,
                progress: row.get(4)?,
                xp_reward: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    /// Returns false when the user already holds the badge.
    pub fn insert_user_badge(&self, badge: &UserBadge) -> Result<bool> {
        let rows = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO user_badges (user_id, badge_id, earned_at, progress, xp_reward)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                badge.user_id,
                badge.badge_id,
                badge.earned_at,
                badge.progress,
                badge.xp_reward
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn badge_xp_total(&self, user_id: &str) -> Result<i64> {
        self.conn.query_row(
            "SELECT COALESCE(SUM(xp_reward), 0) FROM user_badges WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
    }

    pub fn quiz_counters(&self, user_id: &str) -> Result<QuizCounters> {
        self.conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN score_percentage >= ?2 THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN score_percentage = 100 THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN time_spent_seconds < ?3 THEN 1 ELSE 0 END), 0)
            FROM exam_submissions
            WHERE user_id = ?1
            "#,
            params![user_id, HIGH_ACCURACY_PERCENT, FAST_COMPLETION_SECS],
            |row| {
                Ok(QuizCounters {
                    completed: row.get(0)?,
                    high_accuracy: row.get(1)?,
                    perfect: row.get(2)?,
                    fast: row.get(3)?,
                })
            },
        )
    }

    // Leaderboard operations
    /// Every user with XP, unordered.
    pub fn global_standings(&self) -> Result<Vec<LeaderboardEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT s.user_id, u.full_name, s.total_xp, s.average_score, s.total_questions,
                   s.current_level
            FROM user_stats s
            LEFT JOIN users u ON u.id = s.user_id
            WHERE s.total_xp > 0
            "#,
        )?;
        let now = Utc::now().to_rfc3339();
        let rows = stmt.query_map([], |row| {
            Ok(LeaderboardEntry {
                rank: 0,
                user_id: row.get(0)?,
                full_name: row.get(1)?,
                total_xp: row.get(2)?,
                average_score: row.get(3)?,
                total_questions: row.get(4)?,
                current_level: row.get(5)?,
                category: None,
                updated_at: now.clone(),
            })
        })?;
        rows.collect()
    }

    /// Per-category XP for every (user, category) pair with XP, unordered.
    pub fn category_standings(&self) -> Result<Vec<LeaderboardEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.user_id, u.full_name, c.xp_earned, c.average_score, c.questions_attempted,
                   COALESCE(s.current_level, 1), c.category
            FROM category_stats c
            LEFT JOIN users u ON u.id = c.user_id
            LEFT JOIN user_stats s ON s.user_id = c.user_id
            WHERE c.xp_earned > 0
            "#,
        )?;
        let now = Utc::now().to_rfc3339();
        let rows = stmt.query_map([], |row| {
            Ok(LeaderboardEntry {
                rank: 0,
                user_id: row.get(0)?,
                full_name: row.get(1)?,
                total_xp: row.get(2)?,
                average_score: row.get(3)?,
                total_questions: row.get(4)?,
                current_level: row.get(5)?,
                category: Some(row.get(6)?),
                updated_at: now.clone(),
            })
        })?;
        rows.collect()
    }

    /// Drops every board and resets the rank cache on user stats.
    pub fn clear_leaderboard(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            DELETE FROM leaderboard;
            UPDATE user_stats SET rank = 0 WHERE rank <> 0;
            "#,
        )
    }

    pub fn insert_leaderboard_entry(&self, entry: &LeaderboardEntry) -> Result<()> {
        let category = entry.category.as_deref().unwrap_or(GLOBAL_BOARD);
        self.conn.execute(
            r#"
            INSERT INTO leaderboard (category, user_id, rank, total_xp, average_score,
                                     total_questions, current_level, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                category,
                entry.user_id,
                entry.rank,
                entry.total_xp,
                entry.average_score,
                entry.total_questions,
                entry.current_level,
                entry.updated_at,
            ],
        )?;

        if entry.category.is_none() {
            self.conn.execute(
                "UPDATE user_stats SET rank = ?1 WHERE user_id = ?2",
                params![entry.rank, entry.user_id],
            )?;
        }
        Ok(())
    }

    pub fn leaderboard_page(&self, category: Option<&str>, limit: i64) -> Result<Vec<LeaderboardEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT l.rank, l.user_id, u.full_name, l.total_xp, l.average_score, l.total_questions,
                   l.current_level, l.category, l.updated_at
            FROM leaderboard l
            LEFT JOIN users u ON u.id = l.user_id
            WHERE l.category = ?1
            ORDER BY l.rank ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![category.unwrap_or(GLOBAL_BOARD), limit], |row| {
            let category: String = row.get(7)?;
            Ok(LeaderboardEntry {
                rank: row.get(0)?,
                user_id: row.get(1)?,
                full_name: row.get(2)?,
                total_xp: row.get(3)?,
                average_score: row.get(4)?,
                total_questions: row.get(5)?,
                current_level: row.get(6)?,
                category: if category.is_empty() { None } else { Some(category) },
                updated_at: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    /// Counts users ordered strictly ahead of `stats` on the global board.
    pub fn count_ranked_ahead(&self, stats: &UserStats) -> Result<i64> {
        self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM user_stats o
            WHERE o.total_xp > 0
              AND o.user_id <> ?5
              AND (o.total_xp > ?1
                   OR (o.total_xp = ?1 AND o.average_score > ?2)
                   OR (o.total_xp = ?1 AND o.average_score = ?2 AND o.total_questions > ?3)
                   OR (o.total_xp = ?1 AND o.average_score = ?2 AND o.total_questions = ?3
                       AND o.user_id < ?4))
            "#,
            params![
                stats.total_xp,
                stats.average_score,
                stats.total_questions,
                stats.user_id,
                stats.user_id,
            ],
            |row| row.get(0),
        )
    }

    // Custom exams
    pub fn insert_exam(&self, exam: &CustomExam) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO custom_exams (id, user_id, exam_type, title, topics, stem_count,
                                      duration_seconds, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                exam.id,
                exam.user_id,
                exam.exam_type.as_str(),
                exam.title,
                to_json(&exam.topics)?,
                exam.stem_count,
                exam.duration_seconds,
                exam.created_at,
            ],
        )?;

        for stem in &exam.stems {
            self.conn.execute(
                "INSERT INTO exam_stems (id, exam_id, order_index, stem_text, topic) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![stem.id, exam.id, stem.order_index, stem.stem_text, stem.topic],
            )?;
            for option in &stem.options {
                self.conn.execute(
                    r#"
                    INSERT INTO stem_options (id, stem_id, letter, statement, is_correct, explanation)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![
                        option.id,
                        stem.id,
                        option.letter,
                        option.statement,
                        option.is_correct,
                        option.explanation,
                    ],
                )?;
            }
        }

        Ok(())
    }

    pub fn get_exam(&self, id: &str) -> Result<Option<CustomExam>> {
        let exam = self
            .conn
            .query_row(
                r#"
                SELECT id, user_id, exam_type, title, topics, stem_count, duration_seconds, created_at
                FROM custom_exams
                WHERE id = ?1
                "#,
                params![id],
                |row| {
                    let exam_type: String = row.get(2)?;
                    Ok(CustomExam {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        exam_type: ExamType::from_str(&exam_type).ok_or_else(|| {
                            invalid_column(2, format!("unknown exam type '{exam_type}'"))
                        })?,
                        title: row.get(3)?,
                        topics: json_column(row, 4)?,
                        stem_count: row.get(5)?,
                        duration_seconds: row.get(6)?,
                        created_at: row.get(7)?,
                        stems: vec![],
                    })
                },
            )
            .optional()?;

        match exam {
            Some(mut e) => {
                e.stems = self.get_exam_stems(&e.id)?;
                Ok(Some(e))
            }
            None => Ok(None),
        }
    }

    fn get_exam_stems(&self, exam_id: &str) -> Result<Vec<ExamStem>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, exam_id, order_index, stem_text, topic
            FROM exam_stems
            WHERE exam_id = ?1
            ORDER BY order_index
            "#,
        )?;
        let rows = stmt.query_map(params![exam_id], |row| {
            Ok(ExamStem {
                id: row.get(0)?,
                exam_id: row.get(1)?,
                order_index: row.get(2)?,
                stem_text: row.get(3)?,
                topic: row.get(4)?,
                options: vec![],
            })
        })?;
        let mut stems = rows.collect::<Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, stem_id, letter, statement, is_correct, explanation
            FROM stem_options
            WHERE stem_id = ?1
            ORDER BY letter
            "#,
        )?;
        for stem in &mut stems {
            let rows = stmt.query_map(params![stem.id], |row| {
                Ok(StemOption {
                    id: row.get(0)?,
                    stem_id: row.get(1)?,
                    letter: row.get(2)?,
                    statement: row.get(3)?,
                    is_correct: row.get(4)?,
                    explanation: row.get(5)?,
                })
            })?;
            stem.options = rows.collect::<Result<Vec<_>>>()?;
        }

        Ok(stems)
    }

    pub fn insert_generation_record(&self, record: &ExamGenerationRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO exam_generation_history (id, user_id, exam_type, topics, requested_stem_count,
                                                 actual_stem_count, status, provider, duration_ms,
                                                 error_message, custom_exam_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.id,
                record.user_id,
                record.exam_type,
                to_json(&record.topics)?,
                record.requested_stem_count,
                record.actual_stem_count,
                record.status.as_str(),
                record.provider,
                record.duration_ms,
                record.error_message,
                record.exam_id,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn list_generation_history(&self, user_id: &str, limit: i64) -> Result<Vec<ExamGenerationRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, exam_type, topics, requested_stem_count, actual_stem_count, status,
                   provider, duration_ms, error_message, custom_exam_id, created_at
            FROM exam_generation_history
            WHERE user_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![user_id, limit], |row| {
            let status: String = row.get(6)?;
            Ok(ExamGenerationRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                exam_type: row.get(2)?,
                topics: json_column(row, 3)?,
                requested_stem_count: row.get(4)?,
                actual_stem_count: row.get(5)?,
                status: GenerationStatus::from_str(&status),
                provider: row.get(7)?,
                duration_ms: row.get(8)?,
                error_message: row.get(9)?,
                exam_id: row.get(10)?,
                created_at: row.get(11)?,
            })
        })?;
        rows.collect()
    }

    pub fn insert_exam_submission(&self, score: &ExamScore) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO exam_submissions (id, exam_id, user_id, time_spent_seconds, total_stems,
                                          correct, incorrect, unanswered, score_percentage,
                                          xp_earned, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                score.submission_id,
                score.exam_id,
                score.user_id,
                score.time_spent_seconds,
                score.total_stems,
                score.correct,
                score.incorrect,
                score.unanswered,
                score.score_percentage,
                score.xp_earned,
                score.completed_at,
            ],
        )?;
        Ok(())
    }

    // Lecture operations
    pub fn insert_lecture(&self, lecture: &Lecture) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO lectures (id, user_id, title, module, topic, status, processing_progress,
                                  created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                lecture.id,
                lecture.user_id,
                lecture.title,
                lecture.module,
                lecture.topic,
                lecture.status.as_str(),
                lecture.processing_progress,
                lecture.created_at,
                lecture.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_lecture(&self, id: &str) -> Result<Option<Lecture>> {
        self.conn
            .query_row(
                r#"
                SELECT id, user_id, title, module, topic, status, processing_progress,
                       created_at, updated_at
                FROM lectures
                WHERE id = ?1
                "#,
                params![id],
                |row| {
                    let status: String = row.get(5)?;
                    Ok(Lecture {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        title: row.get(2)?,
                        module: row.get(3)?,
                        topic: row.get(4)?,
                        status: LectureStatus::from_str(&status).ok_or_else(|| {
                            invalid_column(5, format!("unknown lecture status '{status}'"))
                        })?,
                        processing_progress: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
    }

    pub fn update_lecture_status(&self, id: &str, status: LectureStatus, progress: i64) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE lectures
            SET status = ?1, processing_progress = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![status.as_str(), progress, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn save_transcript(&self, transcript: &LectureTranscript) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO lecture_transcripts
                (lecture_id, raw_transcript, unified_transcript, language_detected, confidence)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                transcript.lecture_id,
                transcript.raw_transcript,
                transcript.unified_transcript,
                transcript.language_detected,
                transcript.confidence,
            ],
        )?;
        Ok(())
    }

    pub fn get_transcript(&self, lecture_id: &str) -> Result<Option<LectureTranscript>> {
        self.conn
            .query_row(
                r#"
                SELECT lecture_id, raw_transcript, unified_transcript, language_detected, confidence
                FROM lecture_transcripts
                WHERE lecture_id = ?1
                "#,
                params![lecture_id],
                |row| {
                    Ok(LectureTranscript {
                        lecture_id: row.get(0)?,
                        raw_transcript: row.get(1)?,
                        unified_transcript: row.get(2)?,
                        language_detected: row.get(3)?,
                        confidence: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    pub fn save_notes(&self, notes: &LectureNotes) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO lecture_notes
                (lecture_id, notes, summary, key_points, medical_terms, questions)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                notes.lecture_id,
                notes.notes,
                notes.summary,
                to_json(&notes.key_points)?,
                to_json(&notes.medical_terms)?,
                to_json(&notes.questions)?,
            ],
        )?;
        Ok(())
    }

    pub fn set_lecture_questions(&self, lecture_id: &str, questions: &[QuizItem]) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE lecture_notes SET questions = ?1 WHERE lecture_id = ?2",
            params![to_json(&questions)?, lecture_id],
        )?;
        Ok(rows > 0)
    }

    pub fn get_notes(&self, lecture_id: &str) -> Result<Option<LectureNotes>> {
        self.conn
            .query_row(
                r#"
                SELECT lecture_id, notes, summary, key_points, medical_terms, questions
                FROM lecture_notes
                WHERE lecture_id = ?1
                "#,
                params![lecture_id],
                |row| {
                    Ok(LectureNotes {
                        lecture_id: row.get(0)?,
                        notes: row.get(1)?,
                        summary: row.get(2)?,
                        key_points: json_column(row, 3)?,
                        medical_terms: json_column(row, 4)?,
                        questions: json_column(row, 5)?,
                    })
                },
            )
            .optional()
    }

    pub fn insert_processing_log(
        &self,
        lecture_id: &str,
        step: ProcessingStep,
        succeeded: bool,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO lecture_processing_logs (lecture_id, step, status, duration_ms, error_message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                lecture_id,
                step.as_str(),
                if succeeded { "success" } else { "failed" },
                duration_ms,
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_processing_logs(&self, lecture_id: &str) -> Result<Vec<ProcessingLog>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, lecture_id, step, status, duration_ms, error_message, created_at
            FROM lecture_processing_logs
            WHERE lecture_id = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![lecture_id], |row| {
            let step: String = row.get(2)?;
            let status: String = row.get(3)?;
            Ok(ProcessingLog {
                id: row.get(0)?,
                lecture_id: row.get(1)?,
                step: ProcessingStep::from_str(&step)
                    .ok_or_else(|| invalid_column(2, format!("unknown step '{step}'")))?,
                succeeded: status == "success",
                duration_ms: row.get(4)?,
                error_message: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}

const ATTEMPT_COLUMNS: &str = r#"
    SELECT id, user_id, category, selected_answer, correct_answer, is_correct,
           time_spent_seconds, difficulty, xp_earned, attempted_at, idempotency_key
    FROM attempts"#;

const CATEGORY_COLUMNS: &str = r#"
    SELECT user_id, category, questions_attempted, correct_answers, average_score,
           average_time, xp_earned, mastery, last_attempted
    FROM category_stats"#;

const DAILY_COLUMNS: &str = r#"
    SELECT user_id, date, questions_answered, correct_answers, xp_earned, study_time,
           categories_studied
    FROM daily_stats"#;

const BADGE_COLUMNS: &str = r#"
    SELECT id, name, description, tier, requirement_type, requirement, xp_reward
    FROM badges"#;

fn attempt_from_row(row: &Row) -> Result<Attempt> {
    let difficulty: String = row.get(7)?;
    Ok(Attempt {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category: row.get(2)?,
        selected_answer: row.get(3)?,
        correct_answer: row.get(4)?,
        is_correct: row.get(5)?,
        time_spent_seconds: row.get(6)?,
        difficulty: Difficulty::from_str(&difficulty).unwrap_or_default(),
        xp_earned: row.get(8)?,
        attempted_at: row.get(9)?,
        idempotency_key: row.get(10)?,
    })
}

fn user_stats_from_row(row: &Row) -> Result<UserStats> {
    Ok(UserStats {
        user_id: row.get(0)?,
        total_questions: row.get(1)?,
        correct_answers: row.get(2)?,
        average_score: row.get(3)?,
        current_streak: row.get(4)?,
        longest_streak: row.get(5)?,
        total_xp: row.get(6)?,
        current_level: row.get(7)?,
        total_study_time: row.get(8)?,
        rank: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn category_stats_from_row(row: &Row) -> Result<CategoryStats> {
    Ok(CategoryStats {
        user_id: row.get(0)?,
        category: row.get(1)?,
        questions_attempted: row.get(2)?,
        correct_answers: row.get(3)?,
        average_score: row.get(4)?,
        average_time: row.get(5)?,
        xp_earned: row.get(6)?,
        mastery: row.get(7)?,
        last_attempted: row.get(8)?,
    })
}

fn daily_stats_from_row(row: &Row) -> Result<DailyStats> {
    Ok(DailyStats {
        user_id: row.get(0)?,
        date: row.get(1)?,
        questions_answered: row.get(2)?,
        correct_answers: row.get(3)?,
        xp_earned: row.get(4)?,
        study_time: row.get(5)?,
        categories_studied: json_column(row, 6)?,
    })
}

// Rows with a requirement type this build doesn't know are skipped
fn badge_from_row(row: &Row) -> Result<Option<Badge>> {
    let tier: String = row.get(3)?;
    let requirement_type: String = row.get(4)?;
    let Some(requirement_type) = RequirementType::from_str(&requirement_type) else {
        return Ok(None);
    };
    Ok(Some(Badge {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        tier: BadgeTier::from_str(&tier),
        requirement_type,
        requirement: row.get(5)?,
        xp_reward: row.get(6)?,
    }))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}
