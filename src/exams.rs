use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::badges::BadgeEvaluator;
use crate::db::Database;
use crate::error::LedgerError;
use crate::models::{
    CustomExam, Difficulty, ExamGenerationRecord, ExamScore, ExamStem, ExamType, GenerationStatus,
    NewAttempt, StemOption, StemResult, UserBadge,
};
use crate::oracle::{extract_json, OracleError, Prompt, RetryPolicy, TextOracle};
use crate::progression::{default_xp, percentage, ProgressionEngine};

pub const MIN_STEMS: i64 = 5;
pub const MAX_STEMS: i64 = 50;
pub const SECONDS_PER_STEM: i64 = 90;
pub const OPTION_LETTERS: [&str; 2] = ["A", "B"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateExamRequest {
    pub user_id: String,
    pub exam_type: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub stem_count: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitExamRequest {
    pub user_id: String,
    #[serde(default)]
    pub answers: HashMap<String, String>,
    #[serde(alias = "timeSpent")]
    pub time_spent_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub score: ExamScore,
    pub new_badges: Vec<UserBadge>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamPlan {
    pub user_id: String,
    pub exam_type: ExamType,
    pub topics: Vec<String>,
    pub stem_count: i64,
    pub title: String,
}

pub fn validate_request(req: &GenerateExamRequest) -> Result<ExamPlan, LedgerError> {
    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return Err(LedgerError::validation("userId", "must not be empty"));
    }

    let exam_type = ExamType::from_str(&req.exam_type)
        .ok_or_else(|| LedgerError::validation("examType", "must be anatomy or physiology"))?;

    if !(MIN_STEMS..=MAX_STEMS).contains(&req.stem_count) {
        return Err(LedgerError::validation(
            "stemCount",
            format!("must be between {MIN_STEMS} and {MAX_STEMS}"),
        ));
    }

    let mut topics: Vec<String> = Vec::new();
    for topic in req.topics.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !topics.iter().any(|t| t.eq_ignore_ascii_case(topic)) {
            topics.push(topic.to_string());
        }
    }
    if topics.is_empty() {
        return Err(LedgerError::validation("topics", "at least one topic is required"));
    }

    let title = req
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("{} Practice Exam: {}", exam_type.label(), topics.join(", ")));

    Ok(ExamPlan {
        user_id: user_id.to_string(),
        exam_type,
        topics,
        stem_count: req.stem_count,
        title,
    })
}

pub fn build_prompt(plan: &ExamPlan) -> Prompt {
    let system = format!(
        r#"You are an expert medical educator writing board-style {subject} exam stems.
Each stem is a clinical or conceptual statement followed by exactly two options, A and B.
Exactly one option is correct. Every option carries its own explanation.

Return ONLY a valid JSON array with this exact format:
[
  {{
    "stemText": "Statement or scenario",
    "topic": "One of the requested topics",
    "options": [
      {{"letter": "A", "statement": "...", "isCorrect": true, "explanation": "..."}},
      {{"letter": "B", "statement": "...", "isCorrect": false, "explanation": "..."}}
    ]
  }}
]"#,
        subject = plan.exam_type.as_str()
    );
    let user = format!(
        "Generate exactly {} {} exam stems covering: {}",
        plan.stem_count,
        plan.exam_type.as_str(),
        plan.topics.join(", ")
    );

    Prompt::new(system, user)
        .temperature(0.3)
        .max_tokens((plan.stem_count as u32 * 300).clamp(2000, 8000))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StemReply {
    #[serde(alias = "stem", alias = "stem_text")]
    stem_text: String,
    #[serde(default)]
    topic: Option<String>,
    options: Vec<OptionReply>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionReply {
    letter: String,
    statement: String,
    #[serde(alias = "is_correct")]
    is_correct: bool,
    #[serde(default)]
    explanation: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StemsReply {
    List(Vec<StemReply>),
    Wrapped { stems: Vec<StemReply> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOption {
    pub statement: String,
    pub is_correct: bool,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStem {
    pub stem_text: String,
    pub topic: Option<String>,
    pub options: Vec<ParsedOption>,
}

/// Parses and validates the oracle's reply. Any defect fails the whole batch.
pub fn parse_stems(text: &str, expected: i64) -> Result<Vec<ParsedStem>, OracleError> {
    let reply: StemsReply = serde_json::from_str(extract_json(text))
        .map_err(|e| OracleError::Malformed(format!("exam stems: {e}")))?;
    let stems = match reply {
        StemsReply::List(stems) | StemsReply::Wrapped { stems } => stems,
    };

    if stems.len() as i64 != expected {
        return Err(OracleError::Malformed(format!(
            "expected {expected} stems, got {}",
            stems.len()
        )));
    }

    stems
        .into_iter()
        .enumerate()
        .map(|(i, stem)| validate_stem(i + 1, stem))
        .collect()
}

fn validate_stem(number: usize, stem: StemReply) -> Result<ParsedStem, OracleError> {
    let malformed = |msg: &str| OracleError::Malformed(format!("stem {number}: {msg}"));

    if stem.stem_text.trim().is_empty() {
        return Err(malformed("empty stem text"));
    }
    if stem.options.len() != OPTION_LETTERS.len() {
        return Err(malformed("must have exactly two options"));
    }

    let mut letters: Vec<String> = stem
        .options
        .iter()
        .map(|o| o.letter.trim().to_uppercase())
        .collect();
    letters.sort();
    if letters != OPTION_LETTERS {
        return Err(malformed("option letters must be A and B"));
    }
    if stem.options.iter().filter(|o| o.is_correct).count() != 1 {
        return Err(malformed("exactly one option must be correct"));
    }
    if stem.options.iter().any(|o| o.statement.trim().is_empty()) {
        return Err(malformed("empty option statement"));
    }

    let mut options = stem.options;
    options.sort_by_key(|o| o.letter.trim().to_uppercase());

    Ok(ParsedStem {
        stem_text: stem.stem_text.trim().to_string(),
        topic: stem
            .topic
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        options: options
            .into_iter()
            .map(|o| ParsedOption {
                statement: o.statement.trim().to_string(),
                is_correct: o.is_correct,
                explanation: o.explanation.filter(|e| !e.trim().is_empty()),
            })
            .collect(),
    })
}

/// Assigns ids and letters. Option order is shuffled so the correct answer isn't always A.
pub fn build_exam<R: rand::Rng + ?Sized>(plan: &ExamPlan, stems: Vec<ParsedStem>, rng: &mut R) -> CustomExam {
    let exam_id = Uuid::new_v4().to_string();

    let stems: Vec<ExamStem> = stems
        .into_iter()
        .enumerate()
        .map(|(i, mut parsed)| {
            let stem_id = Uuid::new_v4().to_string();
            parsed.options.shuffle(rng);
            let options = parsed
                .options
                .into_iter()
                .zip(OPTION_LETTERS)
                .map(|(o, letter)| StemOption {
                    id: Uuid::new_v4().to_string(),
                    stem_id: stem_id.clone(),
                    letter: letter.to_string(),
                    statement: o.statement,
                    is_correct: o.is_correct,
                    explanation: o.explanation,
                })
                .collect();
            ExamStem {
                id: stem_id,
                exam_id: exam_id.clone(),
                order_index: i as i64,
                stem_text: parsed.stem_text,
                topic: parsed.topic,
                options,
            }
        })
        .collect();

    CustomExam {
        id: exam_id,
        user_id: plan.user_id.clone(),
        exam_type: plan.exam_type,
        title: plan.title.clone(),
        topics: plan.topics.clone(),
        stem_count: stems.len() as i64,
        duration_seconds: stems.len() as i64 * SECONDS_PER_STEM,
        created_at: Utc::now().to_rfc3339(),
        stems,
    }
}

#[derive(Clone)]
pub struct ExamOrchestrator {
    db: Arc<Mutex<Database>>,
    oracle: Arc<dyn TextOracle>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ExamOrchestrator {
    pub fn new(db: Arc<Mutex<Database>>, oracle: Arc<dyn TextOracle>, timeout: Duration) -> Self {
        Self {
            db,
            oracle,
            policy: RetryPolicy::default(),
            timeout,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Generates and stores an exam. Writes exactly one history row for every
    /// request that passes validation.
    pub async fn generate(&self, req: &GenerateExamRequest) -> Result<CustomExam, LedgerError> {
        let plan = validate_request(req)?;
        let started = Instant::now();
        info!(
            "Generating {} {} stems for {} on [{}]",
            plan.stem_count,
            plan.exam_type.as_str(),
            plan.user_id,
            plan.topics.join(", ")
        );

        // The store lock is not held while the oracle works
        let parsed = self.call_oracle(&plan).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let db = self.db.lock().await;
        let result = match parsed {
            Ok(stems) => {
                let exam = build_exam(&plan, stems, &mut rand::thread_rng());
                self.persist(&db, &plan, &exam, duration_ms).map(|_| exam)
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(exam) => info!(
                "Generated exam {} ({} stems) in {}ms",
                exam.id, exam.stem_count, duration_ms
            ),
            Err(e) => {
                warn!("Exam generation for {} failed: {}", plan.user_id, e);
                let record = self.history_record(&plan, duration_ms, Err(e));
                if let Err(log_err) = db.insert_generation_record(&record) {
                    error!("Failed to record generation failure: {}", log_err);
                }
            }
        }

        result
    }

    async fn call_oracle(&self, plan: &ExamPlan) -> Result<Vec<ParsedStem>, LedgerError> {
        let prompt = build_prompt(plan);
        let text = self.policy.complete(&*self.oracle, &prompt, self.timeout).await?;
        Ok(parse_stems(&text, plan.stem_count)?)
    }

    fn persist(&self, db: &Database, plan: &ExamPlan, exam: &CustomExam, duration_ms: i64) -> Result<(), LedgerError> {
        let tx = db.begin_immediate()?;
        db.ensure_user(&plan.user_id)?;
        db.insert_exam(exam)?;
        db.insert_generation_record(&self.history_record(plan, duration_ms, Ok(exam)))?;
        tx.commit()?;
        Ok(())
    }

    fn history_record(
        &self,
        plan: &ExamPlan,
        duration_ms: i64,
        outcome: Result<&CustomExam, &LedgerError>,
    ) -> ExamGenerationRecord {
        let (status, actual, error_message, exam_id) = match outcome {
            Ok(exam) => (
                GenerationStatus::Success,
                Some(exam.stem_count),
                None,
                Some(exam.id.clone()),
            ),
            Err(e) => (GenerationStatus::Failed, None, Some(e.to_string()), None),
        };

        ExamGenerationRecord {
            id: Uuid::new_v4().to_string(),
            user_id: plan.user_id.clone(),
            exam_type: plan.exam_type.as_str().to_string(),
            topics: plan.topics.clone(),
            requested_stem_count: plan.stem_count,
            actual_stem_count: actual,
            status,
            provider: self.oracle.provider().to_string(),
            duration_ms,
            error_message,
            exam_id,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

pub fn get_exam(db: &Database, exam_id: &str) -> Result<CustomExam, LedgerError> {
    db.get_exam(exam_id)?
        .ok_or_else(|| LedgerError::not_found(format!("Exam '{exam_id}'")))
}

/// Scores a submission, records each answered stem as an attempt, then runs
/// the badge evaluator.
pub fn submit_exam(db: &Database, exam_id: &str, req: &SubmitExamRequest) -> Result<SubmissionOutcome, LedgerError> {
    let exam = get_exam(db, exam_id)?;

    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return Err(LedgerError::validation("userId", "must not be empty"));
    }

    let mut answers: HashMap<&str, String> = HashMap::new();
    for (stem_id, letter) in &req.answers {
        if !exam.stems.iter().any(|s| &s.id == stem_id) {
            return Err(LedgerError::validation(
                "answers",
                format!("stem '{stem_id}' is not part of this exam"),
            ));
        }
        let letter = letter.trim().to_uppercase();
        if letter.is_empty() {
            continue;
        }
        if !OPTION_LETTERS.contains(&letter.as_str()) {
            return Err(LedgerError::validation("answers", "answers must be A or B"));
        }
        answers.insert(stem_id.as_str(), letter);
    }

    let total_stems = exam.stems.len() as i64;
    let time_spent_seconds = req.time_spent_seconds.unwrap_or(0).max(0);
    let per_stem_seconds = if total_stems > 0 {
        time_spent_seconds / total_stems
    } else {
        0
    };

    let now = Utc::now();
    let tx = db.begin_immediate()?;
    db.ensure_user(user_id)?;
    let engine = ProgressionEngine::new(db);

    let mut results = Vec::with_capacity(exam.stems.len());
    let mut correct = 0;
    let mut incorrect = 0;
    let mut xp_earned = 0;

    for stem in &exam.stems {
        let Some(correct_option) = stem.correct_option() else {
            return Err(LedgerError::Conflict(format!(
                "stem '{}' has no correct option",
                stem.id
            )));
        };
        let selected = answers.get(stem.id.as_str()).cloned();
        let is_correct = selected.as_deref() == Some(correct_option.letter.as_str());

        if let Some(letter) = &selected {
            let xp = default_xp(is_correct, Difficulty::Medium);
            engine.apply_attempt(
                &NewAttempt {
                    user_id: user_id.to_string(),
                    category: stem
                        .topic
                        .clone()
                        .unwrap_or_else(|| exam.exam_type.label().to_string()),
                    selected_answer: letter.clone(),
                    correct_answer: correct_option.letter.clone(),
                    is_correct,
                    time_spent_seconds: per_stem_seconds,
                    difficulty: Difficulty::Medium,
                    xp_earned: xp,
                    idempotency_key: None,
                },
                now,
            )?;
            xp_earned += xp;
            if is_correct {
                correct += 1;
            } else {
                incorrect += 1;
            }
        }

        results.push(StemResult {
            stem_id: stem.id.clone(),
            selected,
            correct_letter: correct_option.letter.clone(),
            is_correct,
            explanation: correct_option.explanation.clone(),
        });
    }

    let score = ExamScore {
        submission_id: Uuid::new_v4().to_string(),
        exam_id: exam.id.clone(),
        user_id: user_id.to_string(),
        total_stems,
        correct,
        incorrect,
        unanswered: total_stems - correct - incorrect,
        score_percentage: percentage(correct, total_stems),
        xp_earned,
        time_spent_seconds,
        completed_at: now.to_rfc3339(),
        results,
    };
    db.insert_exam_submission(&score)?;
    let new_badges = BadgeEvaluator::new(db).evaluate(user_id)?;
    tx.commit()?;

    info!(
        "{} scored {}% on exam {} ({} correct, {} unanswered)",
        user_id, score.score_percentage, exam.id, score.correct, score.unanswered
    );

    Ok(SubmissionOutcome { score, new_badges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::fakes::ScriptedOracle;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup_db() -> Arc<Mutex<Database>> {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        Arc::new(Mutex::new(db))
    }

    fn request(stem_count: i64) -> GenerateExamRequest {
        GenerateExamRequest {
            user_id: "u1".to_string(),
            exam_type: "anatomy".to_string(),
            topics: vec!["Heart".to_string(), "Lungs".to_string()],
            stem_count,
            title: None,
        }
    }

    fn stems_json(n: usize) -> String {
        let stems: Vec<serde_json::Value> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "stemText": format!("Stem number {i}"),
                    "topic": if i % 2 == 0 { "Heart" } else { "Lungs" },
                    "options": [
                        {"letter": "A", "statement": "Correct statement", "isCorrect": true, "explanation": "Right"},
                        {"letter": "B", "statement": "Wrong statement", "isCorrect": false, "explanation": "Wrong"}
                    ]
                })
            })
            .collect();
        serde_json::to_string(&stems).unwrap()
    }

    fn orchestrator(db: &Arc<Mutex<Database>>, oracle: ScriptedOracle) -> ExamOrchestrator {
        ExamOrchestrator::new(db.clone(), Arc::new(oracle), Duration::from_secs(5))
    }

    async fn history(db: &Arc<Mutex<Database>>) -> Vec<ExamGenerationRecord> {
        db.lock().await.list_generation_history("u1", 100).unwrap()
    }

    async fn exam_rows(db: &Arc<Mutex<Database>>) -> i64 {
        db.lock()
            .await
            .conn()
            .query_row("SELECT COUNT(*) FROM custom_exams", [], |row| row.get(0))
            .unwrap()
    }

    mod validation_tests {
        use super::*;

        fn field_of(err: LedgerError) -> String {
            match err {
                LedgerError::Validation { field, .. } => field,
                other => panic!("expected validation error, got {other:?}"),
            }
        }

        #[test]
        fn stem_count_bounds() {
            assert_eq!(field_of(validate_request(&request(4)).unwrap_err()), "stemCount");
            assert_eq!(field_of(validate_request(&request(51)).unwrap_err()), "stemCount");
            assert!(validate_request(&request(5)).is_ok());
            assert!(validate_request(&request(50)).is_ok());
        }

        #[test]
        fn exam_type_must_be_known() {
            let mut req = request(5);
            req.exam_type = "pharmacology".to_string();
            assert_eq!(field_of(validate_request(&req).unwrap_err()), "examType");
        }

        #[test]
        fn topics_are_required_and_deduplicated() {
            let mut req = request(5);
            req.topics = vec!["  ".to_string()];
            assert_eq!(field_of(validate_request(&req).unwrap_err()), "topics");

            req.topics = vec!["Heart".to_string(), "heart".to_string(), " Lungs ".to_string()];
            let plan = validate_request(&req).unwrap();
            assert_eq!(plan.topics, vec!["Heart", "Lungs"]);
        }

        #[test]
        fn default_title_names_subject_and_topics() {
            let plan = validate_request(&request(5)).unwrap();
            assert_eq!(plan.title, "Anatomy Practice Exam: Heart, Lungs");
        }
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn parses_exact_count() {
            let stems = parse_stems(&stems_json(5), 5).unwrap();
            assert_eq!(stems.len(), 5);
            assert!(stems[0].options[0].is_correct);
        }

        #[test]
        fn accepts_wrapped_and_fenced_reply() {
            let text = format!("```json\n{{\"stems\": {}}}\n```", stems_json(5));
            assert_eq!(parse_stems(&text, 5).unwrap().len(), 5);
        }

        #[test]
        fn wrong_count_is_malformed() {
            assert!(matches!(
                parse_stems(&stems_json(4), 5),
                Err(OracleError::Malformed(_))
            ));
        }

        #[test]
        fn two_correct_options_is_malformed() {
            let text = stems_json(5).replace("\"isCorrect\":false", "\"isCorrect\":true");
            assert!(matches!(parse_stems(&text, 5), Err(OracleError::Malformed(_))));
        }

        #[test]
        fn bad_letters_are_malformed() {
            let text = stems_json(5).replacen("\"letter\":\"B\"", "\"letter\":\"C\"", 1);
            assert!(matches!(parse_stems(&text, 5), Err(OracleError::Malformed(_))));
        }

        #[test]
        fn prose_is_malformed() {
            assert!(matches!(
                parse_stems("Sorry, I can't help with that.", 5),
                Err(OracleError::Malformed(_))
            ));
        }
    }

    mod build_tests {
        use super::*;

        #[test]
        fn build_exam_keeps_one_correct_option_per_stem() {
            let plan = validate_request(&request(5)).unwrap();
            let parsed = parse_stems(&stems_json(5), 5).unwrap();
            let mut rng = StdRng::seed_from_u64(7);
            let exam = build_exam(&plan, parsed, &mut rng);

            assert_eq!(exam.stem_count, 5);
            assert_eq!(exam.duration_seconds, 450);
            for (i, stem) in exam.stems.iter().enumerate() {
                assert_eq!(stem.order_index, i as i64);
                let letters: Vec<_> = stem.options.iter().map(|o| o.letter.as_str()).collect();
                assert_eq!(letters, vec!["A", "B"]);
                assert_eq!(stem.options.iter().filter(|o| o.is_correct).count(), 1);
            }
        }
    }

    mod generate_tests {
        use super::*;

        #[tokio::test]
        async fn success_persists_exam_and_one_history_row() {
            let db = setup_db();
            let orch = orchestrator(&db, ScriptedOracle::replying(stems_json(5)));

            let exam = orch.generate(&request(5)).await.unwrap();
            let stored = get_exam(&*db.lock().await, &exam.id).unwrap();
            assert_eq!(stored.stems.len(), 5);
            assert!(stored.stems.iter().all(|s| s.options.len() == 2));

            let rows = history(&db).await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, GenerationStatus::Success);
            assert_eq!(rows[0].actual_stem_count, Some(5));
            assert_eq!(rows[0].exam_id.as_deref(), Some(exam.id.as_str()));
            assert_eq!(rows[0].provider, "scripted");
        }

        #[tokio::test]
        async fn malformed_output_stores_nothing_but_history() {
            let db = setup_db();
            let orch = orchestrator(&db, ScriptedOracle::replying("not json at all"));

            let err = orch.generate(&request(5)).await.unwrap_err();
            assert!(matches!(err, LedgerError::Oracle(OracleError::Malformed(_))));
            assert_eq!(exam_rows(&db).await, 0);

            let rows = history(&db).await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, GenerationStatus::Failed);
            assert!(rows[0].error_message.is_some());
        }

        #[tokio::test]
        async fn slow_oracle_times_out() {
            let db = setup_db();
            let oracle = ScriptedOracle::replying(stems_json(5)).with_delay(Duration::from_millis(200));
            let orch = ExamOrchestrator::new(db.clone(), Arc::new(oracle), Duration::from_millis(20));

            let err = orch.generate(&request(5)).await.unwrap_err();
            assert!(matches!(err, LedgerError::Oracle(OracleError::Timeout(_))));
            assert_eq!(exam_rows(&db).await, 0);
            assert_eq!(history(&db).await[0].status, GenerationStatus::Failed);
        }

        #[tokio::test]
        async fn validation_failure_writes_no_history() {
            let db = setup_db();
            let oracle = Arc::new(ScriptedOracle::replying(stems_json(5)));
            let orch = ExamOrchestrator::new(db.clone(), oracle.clone(), Duration::from_secs(5));

            assert!(orch.generate(&request(3)).await.is_err());
            assert!(history(&db).await.is_empty());
            assert_eq!(oracle.calls(), 0);
        }

        #[tokio::test]
        async fn rate_limit_fails_without_retry_policy() {
            let db = setup_db();
            let oracle = Arc::new(ScriptedOracle::new(vec![
                Err(OracleError::RateLimited),
                Ok(stems_json(5)),
            ]));
            let orch = ExamOrchestrator::new(db.clone(), oracle.clone(), Duration::from_secs(5));

            let err = orch.generate(&request(5)).await.unwrap_err();
            assert!(matches!(err, LedgerError::Oracle(OracleError::RateLimited)));
            assert_eq!(oracle.calls(), 1);
        }

        #[tokio::test]
        async fn explicit_policy_retries_rate_limit() {
            let db = setup_db();
            let oracle = Arc::new(ScriptedOracle::new(vec![
                Err(OracleError::RateLimited),
                Ok(stems_json(5)),
            ]));
            let orch = ExamOrchestrator::new(db.clone(), oracle.clone(), Duration::from_secs(5))
                .with_policy(RetryPolicy {
                    max_attempts: 2,
                    backoff: Duration::from_millis(1),
                });

            orch.generate(&request(5)).await.unwrap();
            assert_eq!(oracle.calls(), 2);
            let rows = history(&db).await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, GenerationStatus::Success);
        }

        #[tokio::test]
        async fn timed_out_call_is_retried_within_its_own_budget() {
            let db = setup_db();
            let oracle = Arc::new(
                ScriptedOracle::new(vec![Ok(stems_json(5)), Ok(stems_json(5))])
                    .with_leading_delays(vec![Duration::from_millis(300)]),
            );
            let orch = ExamOrchestrator::new(db.clone(), oracle.clone(), Duration::from_millis(50))
                .with_policy(RetryPolicy {
                    max_attempts: 2,
                    backoff: Duration::from_millis(1),
                });

            let exam = orch.generate(&request(5)).await.unwrap();
            assert_eq!(exam.stems.len(), 5);
            assert_eq!(oracle.calls(), 2);
            assert_eq!(history(&db).await[0].status, GenerationStatus::Success);
        }

        #[tokio::test]
        async fn storage_failure_rolls_back_and_records_failure() {
            let db = setup_db();
            db.lock()
                .await
                .conn()
                .execute_batch(
                    r#"
                    CREATE TRIGGER fail_options BEFORE INSERT ON stem_options
                    WHEN NEW.statement = 'Wrong statement'
                    BEGIN SELECT RAISE(ABORT, 'injected'); END;
                    "#,
                )
                .unwrap();
            let orch = orchestrator(&db, ScriptedOracle::replying(stems_json(5)));

            assert!(orch.generate(&request(5)).await.is_err());
            assert_eq!(exam_rows(&db).await, 0);
            let rows = history(&db).await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, GenerationStatus::Failed);
        }

        #[tokio::test]
        async fn store_is_not_locked_during_oracle_call() {
            let db = setup_db();
            let oracle = ScriptedOracle::replying(stems_json(5)).with_delay(Duration::from_millis(100));
            let orch = orchestrator(&db, oracle);

            let handle = tokio::spawn({
                let orch = orch.clone();
                async move { orch.generate(&request(5)).await }
            });
            tokio::time::sleep(Duration::from_millis(10)).await;

            let guard = tokio::time::timeout(Duration::from_millis(50), db.lock()).await;
            assert!(guard.is_ok(), "store lock held across oracle call");
            drop(guard);

            assert!(handle.await.unwrap().is_ok());
        }
    }

    mod submit_tests {
        use super::*;

        async fn generated_exam(db: &Arc<Mutex<Database>>) -> CustomExam {
            orchestrator(db, ScriptedOracle::replying(stems_json(5)))
                .generate(&request(5))
                .await
                .unwrap()
        }

        fn correct_letter(stem: &ExamStem) -> String {
            stem.correct_option().unwrap().letter.clone()
        }

        fn wrong_letter(stem: &ExamStem) -> String {
            let letter = if correct_letter(stem) == "A" { "B" } else { "A" };
            letter.to_string()
        }

        #[tokio::test]
        async fn scores_and_records_answered_stems() {
            let db = setup_db();
            let exam = generated_exam(&db).await;

            let mut answers = HashMap::new();
            answers.insert(exam.stems[0].id.clone(), correct_letter(&exam.stems[0]));
            answers.insert(exam.stems[1].id.clone(), correct_letter(&exam.stems[1]).to_lowercase());
            answers.insert(exam.stems[2].id.clone(), wrong_letter(&exam.stems[2]));

            let guard = db.lock().await;
            let outcome = submit_exam(
                &guard,
                &exam.id,
                &SubmitExamRequest {
                    user_id: "u1".to_string(),
                    answers,
                    time_spent_seconds: Some(300),
                },
            )
            .unwrap();

            let score = &outcome.score;
            assert_eq!((score.correct, score.incorrect, score.unanswered), (2, 1, 2));
            assert_eq!(score.score_percentage, 40);
            assert_eq!(score.xp_earned, 22);
            assert_eq!(score.results.len(), 5);

            let stats = guard.get_user_stats("u1").unwrap().unwrap();
            assert_eq!(stats.total_questions, 3);
            assert_eq!(guard.attempt_log("u1").unwrap().len(), 3);
            assert!(guard.get_category_stats("u1", "Heart").unwrap().is_some());

            let names: Vec<_> = outcome.new_badges.iter().map(|b| b.name.as_str()).collect();
            assert_eq!(names, vec!["First Steps"]);
        }

        #[tokio::test]
        async fn failed_award_rolls_back_the_submission() {
            let db = setup_db();
            let exam = generated_exam(&db).await;
            let guard = db.lock().await;
            guard
                .conn()
                .execute_batch(
                    r#"
                    CREATE TRIGGER fail_awards BEFORE INSERT ON user_badges
                    BEGIN SELECT RAISE(ABORT, 'injected'); END;
                    "#,
                )
                .unwrap();

            let mut answers = HashMap::new();
            answers.insert(exam.stems[0].id.clone(), correct_letter(&exam.stems[0]));
            let result = submit_exam(
                &guard,
                &exam.id,
                &SubmitExamRequest {
                    user_id: "u1".to_string(),
                    answers,
                    time_spent_seconds: Some(60),
                },
            );

            assert!(result.is_err());
            assert!(guard.attempt_log("u1").unwrap().is_empty());
            assert_eq!(guard.quiz_counters("u1").unwrap().completed, 0);
        }

        #[tokio::test]
        async fn perfect_fast_submission() {
            let db = setup_db();
            let exam = generated_exam(&db).await;
            let answers = exam
                .stems
                .iter()
                .map(|s| (s.id.clone(), correct_letter(s)))
                .collect();

            let guard = db.lock().await;
            let outcome = submit_exam(
                &guard,
                &exam.id,
                &SubmitExamRequest {
                    user_id: "u2".to_string(),
                    answers,
                    time_spent_seconds: Some(60),
                },
            )
            .unwrap();
            assert_eq!(outcome.score.score_percentage, 100);
            assert!(outcome.new_badges.iter().any(|b| b.name == "Perfectionist"));
        }

        #[tokio::test]
        async fn unknown_stem_is_rejected_without_writes() {
            let db = setup_db();
            let exam = generated_exam(&db).await;
            let mut answers = HashMap::new();
            answers.insert("bogus".to_string(), "A".to_string());

            let guard = db.lock().await;
            let err = submit_exam(
                &guard,
                &exam.id,
                &SubmitExamRequest {
                    user_id: "u1".to_string(),
                    answers,
                    time_spent_seconds: None,
                },
            )
            .unwrap_err();
            assert!(matches!(err, LedgerError::Validation { .. }));
            assert!(guard.attempt_log("u1").unwrap().is_empty());
        }

        #[tokio::test]
        async fn invalid_letter_is_rejected() {
            let db = setup_db();
            let exam = generated_exam(&db).await;
            let mut answers = HashMap::new();
            answers.insert(exam.stems[0].id.clone(), "C".to_string());

            let guard = db.lock().await;
            let result = submit_exam(
                &guard,
                &exam.id,
                &SubmitExamRequest {
                    user_id: "u1".to_string(),
                    answers,
                    time_spent_seconds: None,
                },
            );
            assert!(matches!(result, Err(LedgerError::Validation { .. })));
        }

        #[test]
        fn unknown_exam_is_not_found() {
            let db = Database::open(":memory:").unwrap();
            db.init().unwrap();
            let result = submit_exam(
                &db,
                "missing",
                &SubmitExamRequest {
                    user_id: "u1".to_string(),
                    answers: HashMap::new(),
                    time_spent_seconds: None,
                },
            );
            assert!(matches!(result, Err(LedgerError::NotFound(_))));
        }
    }
}
