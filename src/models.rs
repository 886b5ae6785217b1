use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

// Question difficulty, also scales the default XP reward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" | "e" => Some(Difficulty::Easy),
            "medium" | "m" | "intermediate" => Some(Difficulty::Medium),
            "hard" | "h" => Some(Difficulty::Hard),
            _ => None,
        }
    }

    // Percentage applied to the base reward
    pub fn xp_multiplier(&self) -> i64 {
        match self {
            Difficulty::Easy => 50,
            Difficulty::Medium => 100,
            Difficulty::Hard => 150,
        }
    }
}

// One immutable answer event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: i64,
    pub user_id: String,
    pub category: String,
    pub selected_answer: String,
    pub correct_answer: String,
    pub is_correct: bool,
    pub time_spent_seconds: i64,
    pub difficulty: Difficulty,
    pub xp_earned: i64,
    pub attempted_at: String,
    pub idempotency_key: Option<String>,
}

// Validated attempt ready to be appended to the log
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub user_id: String,
    pub category: String,
    pub selected_answer: String,
    pub correct_answer: String,
    pub is_correct: bool,
    pub time_spent_seconds: i64,
    pub difficulty: Difficulty,
    pub xp_earned: i64,
    pub idempotency_key: Option<String>,
}

// Raw attempt payload as submitted by a client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptInput {
    pub user_id: String,
    pub category: String,
    #[serde(default)]
    pub selected_answer: String,
    #[serde(default)]
    pub correct_answer: String,
    pub is_correct: Option<bool>,
    #[serde(alias = "timeSpent")]
    pub time_spent_seconds: Option<i64>,
    pub difficulty: Option<String>,
    pub xp_earned: Option<i64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub total_questions: i64,
    pub correct_answers: i64,
    pub average_score: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    #[serde(rename = "totalXP")]
    pub total_xp: i64,
    pub current_level: i64,
    pub total_study_time: i64,
    pub rank: i64,
    pub updated_at: String,
}

impl UserStats {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_questions: 0,
            correct_answers: 0,
            average_score: 0,
            current_streak: 0,
            longest_streak: 0,
            total_xp: 0,
            current_level: 1,
            total_study_time: 0,
            rank: 0,
            updated_at: String::new(),
        }
    }

    // Compares the derived fields only; rank and timestamps are caches
    pub fn same_aggregates(&self, other: &UserStats) -> bool {
        self.total_questions == other.total_questions
            && self.correct_answers == other.correct_answers
            && self.average_score == other.average_score
            && self.current_streak == other.current_streak
            && self.longest_streak == other.longest_streak
            && self.total_xp == other.total_xp
            && self.current_level == other.current_level
            && self.total_study_time == other.total_study_time
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub user_id: String,
    pub category: String,
    pub questions_attempted: i64,
    pub correct_answers: i64,
    pub average_score: i64,
    pub average_time: i64,
    pub xp_earned: i64,
    pub mastery: i64,
    pub last_attempted: String,
}

impl CategoryStats {
    pub fn mastery_label(&self) -> &'static str {
        match self.mastery {
            0..=19 => "New",
            20..=39 => "Learning",
            40..=59 => "Familiar",
            60..=79 => "Comfortable",
            80..=94 => "Proficient",
            95..=100 => "Mastered",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub user_id: String,
    pub date: String,
    pub questions_answered: i64,
    pub correct_answers: i64,
    pub xp_earned: i64,
    pub study_time: i64,
    pub categories_studied: Vec<String>,
}

// === Badges ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementType {
    QuizzesCompleted,
    HighAccuracyQuizzes,
    PerfectScores,
    FastCompletions,
    ConsecutiveDays,
    QuestionsAnswered,
    Streak,
    Xp,
}

impl RequirementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementType::QuizzesCompleted => "quizzes_completed",
            RequirementType::HighAccuracyQuizzes => "high_accuracy_quizzes",
            RequirementType::PerfectScores => "perfect_scores",
            RequirementType::FastCompletions => "fast_completions",
            RequirementType::ConsecutiveDays => "consecutive_days",
            RequirementType::QuestionsAnswered => "questions_answered",
            RequirementType::Streak => "streak",
            RequirementType::Xp => "xp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "quizzes_completed" => Some(RequirementType::QuizzesCompleted),
            "high_accuracy_quizzes" => Some(RequirementType::HighAccuracyQuizzes),
            "perfect_scores" => Some(RequirementType::PerfectScores),
            "fast_completions" => Some(RequirementType::FastCompletions),
            "consecutive_days" => Some(RequirementType::ConsecutiveDays),
            "questions_answered" | "questions" => Some(RequirementType::QuestionsAnswered),
            "streak" => Some(RequirementType::Streak),
            "xp" => Some(RequirementType::Xp),
            _ => None,
        }
    }

    // Consecutive study days has no agreed day-window definition yet
    pub fn is_supported(&self) -> bool {
        !matches!(self, RequirementType::ConsecutiveDays)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl BadgeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeTier::Bronze => "bronze",
            BadgeTier::Silver => "silver",
            BadgeTier::Gold => "gold",
            BadgeTier::Platinum => "platinum",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "silver" => BadgeTier::Silver,
            "gold" => BadgeTier::Gold,
            "platinum" => BadgeTier::Platinum,
            _ => BadgeTier::Bronze,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub tier: BadgeTier,
    pub requirement_type: RequirementType,
    pub requirement: i64,
    pub xp_reward: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBadge {
    pub user_id: String,
    pub badge_id: i64,
    pub name: String,
    pub earned_at: String,
    pub progress: i64,
    pub xp_reward: i64,
}

// Badge not yet earned, with the user's current progress (None when unsupported)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeProgress {
    pub badge: Badge,
    pub progress: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeOverview {
    pub earned: Vec<UserBadge>,
    pub available: Vec<BadgeProgress>,
}

#[derive(Debug, Clone)]
pub enum AwardOutcome {
    Awarded(UserBadge),
    AlreadyEarned,
}

// Completed-exam counters the badge rules read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuizCounters {
    pub completed: i64,
    pub high_accuracy: i64,
    pub perfect: i64,
    pub fast: i64,
}

// === Leaderboard ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub user_id: String,
    pub full_name: Option<String>,
    #[serde(rename = "totalXP")]
    pub total_xp: i64,
    pub average_score: i64,
    pub total_questions: i64,
    pub current_level: i64,
    pub category: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRank {
    pub user_id: String,
    // None while the user has no XP
    pub rank: Option<i64>,
    #[serde(rename = "totalXP")]
    pub total_xp: i64,
    pub average_accuracy: i64,
}

// === Custom exams ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamType {
    Anatomy,
    Physiology,
}

impl ExamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamType::Anatomy => "anatomy",
            ExamType::Physiology => "physiology",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "anatomy" => Some(ExamType::Anatomy),
            "physiology" => Some(ExamType::Physiology),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExamType::Anatomy => "Anatomy",
            ExamType::Physiology => "Physiology",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomExam {
    pub id: String,
    pub user_id: String,
    pub exam_type: ExamType,
    pub title: String,
    pub topics: Vec<String>,
    pub stem_count: i64,
    pub duration_seconds: i64,
    pub created_at: String,
    pub stems: Vec<ExamStem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamStem {
    pub id: String,
    pub exam_id: String,
    pub order_index: i64,
    pub stem_text: String,
    pub topic: Option<String>,
    pub options: Vec<StemOption>,
}

impl ExamStem {
    pub fn correct_option(&self) -> Option<&StemOption> {
        self.options.iter().find(|o| o.is_correct)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StemOption {
    pub id: String,
    pub stem_id: String,
    pub letter: String,
    pub statement: String,
    pub is_correct: bool,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Success => "success",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => GenerationStatus::Success,
            _ => GenerationStatus::Failed,
        }
    }
}

// Append-only audit row, one per generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamGenerationRecord {
    pub id: String,
    pub user_id: String,
    pub exam_type: String,
    pub topics: Vec<String>,
    pub requested_stem_count: i64,
    pub actual_stem_count: Option<i64>,
    pub status: GenerationStatus,
    pub provider: String,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub exam_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StemResult {
    pub stem_id: String,
    pub selected: Option<String>,
    pub correct_letter: String,
    pub is_correct: bool,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamScore {
    pub submission_id: String,
    pub exam_id: String,
    pub user_id: String,
    pub total_stems: i64,
    pub correct: i64,
    pub incorrect: i64,
    pub unanswered: i64,
    pub score_percentage: i64,
    pub xp_earned: i64,
    pub time_spent_seconds: i64,
    pub completed_at: String,
    pub results: Vec<StemResult>,
}

// === Lectures ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LectureStatus {
    Processing,
    Completed,
    Failed,
}

impl LectureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LectureStatus::Processing => "processing",
            LectureStatus::Completed => "completed",
            LectureStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(LectureStatus::Processing),
            "completed" => Some(LectureStatus::Completed),
            "failed" => Some(LectureStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lecture {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub module: String,
    pub topic: Option<String>,
    pub status: LectureStatus,
    pub processing_progress: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LectureTranscript {
    pub lecture_id: String,
    pub raw_transcript: String,
    pub unified_transcript: String,
    pub language_detected: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizItem {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LectureNotes {
    pub lecture_id: String,
    pub notes: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub medical_terms: Vec<String>,
    pub questions: Vec<QuizItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    Transcription,
    NoteGeneration,
    QuestionGeneration,
}

impl ProcessingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStep::Transcription => "transcription",
            ProcessingStep::NoteGeneration => "note_generation",
            ProcessingStep::QuestionGeneration => "question_generation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transcription" => Some(ProcessingStep::Transcription),
            "note_generation" => Some(ProcessingStep::NoteGeneration),
            "question_generation" => Some(ProcessingStep::QuestionGeneration),
            _ => None,
        }
    }

    // Progress reported once this step completes
    pub fn progress_after(&self) -> i64 {
        match self {
            ProcessingStep::Transcription => 33,
            ProcessingStep::NoteGeneration => 66,
            ProcessingStep::QuestionGeneration => 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingLog {
    pub id: i64,
    pub lecture_id: String,
    pub step: ProcessingStep,
    pub succeeded: bool,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LectureDetail {
    pub lecture: Lecture,
    pub transcript: Option<LectureTranscript>,
    pub notes: Option<LectureNotes>,
    pub logs: Vec<ProcessingLog>,
}

// JSON envelope shared by the CLI and the HTTP surface
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            field: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            field: None,
        }
    }

    pub fn with_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }
}
