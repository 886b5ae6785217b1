use chrono::Utc;
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::LedgerError;
use crate::models::{
    Lecture, LectureDetail, LectureNotes, LectureStatus, LectureTranscript, ProcessingStep, QuizItem,
};
use crate::oracle::{
    extract_json, Document, DocumentRenderer, OracleError, Prompt, RetryPolicy, Section, SpeechOracle,
    TextOracle, Translation,
};

pub const QUESTIONS_PER_LECTURE: usize = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLectureRequest {
    pub user_id: String,
    pub title: String,
    pub module: String,
    pub topic: Option<String>,
    #[serde(alias = "rawTranscript")]
    pub transcript: String,
}

fn required<'r>(field: &str, value: &'r str) -> Result<&'r str, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::validation(field, "must not be empty"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesReply {
    pub notes: String,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub medical_terms: Vec<String>,
}

pub fn parse_notes(text: &str) -> Result<NotesReply, OracleError> {
    let reply: NotesReply = serde_json::from_str(extract_json(text))
        .map_err(|e| OracleError::Malformed(format!("lecture notes: {e}")))?;
    if reply.summary.trim().is_empty() || reply.notes.trim().is_empty() {
        return Err(OracleError::Malformed("lecture notes: empty notes or summary".to_string()));
    }
    Ok(reply)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionReply {
    question: String,
    options: Vec<String>,
    correct_answer: serde_json::Value,
    #[serde(default)]
    explanation: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionsReply {
    List(Vec<QuestionReply>),
    Wrapped { questions: Vec<QuestionReply> },
}

/// Parses quiz items. The correct answer may arrive as an option index, a
/// letter or the option text; it is stored as the option text.
pub fn parse_questions(text: &str) -> Result<Vec<QuizItem>, OracleError> {
    let reply: QuestionsReply = serde_json::from_str(extract_json(text))
        .map_err(|e| OracleError::Malformed(format!("quiz items: {e}")))?;
    let items = match reply {
        QuestionsReply::List(items) | QuestionsReply::Wrapped { questions: items } => items,
    };
    if items.is_empty() {
        return Err(OracleError::Malformed("quiz items: empty list".to_string()));
    }

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let malformed = |msg: &str| OracleError::Malformed(format!("quiz item {}: {msg}", i + 1));
            if item.question.trim().is_empty() {
                return Err(malformed("empty question"));
            }
            if item.options.len() < 2 || item.options.iter().any(|o| o.trim().is_empty()) {
                return Err(malformed("needs at least two non-empty options"));
            }
            let correct = resolve_answer(&item.options, &item.correct_answer)
                .ok_or_else(|| malformed("correct answer does not match an option"))?;
            Ok(QuizItem {
                question: item.question.trim().to_string(),
                options: item.options.iter().map(|o| o.trim().to_string()).collect(),
                correct_answer: correct,
                explanation: item.explanation.trim().to_string(),
            })
        })
        .collect()
}

fn resolve_answer(options: &[String], answer: &serde_json::Value) -> Option<String> {
    match answer {
        serde_json::Value::Number(n) => {
            let index = usize::try_from(n.as_u64()?).ok()?;
            options.get(index).map(|o| o.trim().to_string())
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Some(option) = options.iter().find(|o| o.trim().eq_ignore_ascii_case(s)) {
                return Some(option.trim().to_string());
            }
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(letter), None) if letter.is_ascii_alphabetic() => {
                    let index = (letter.to_ascii_uppercase() as u8 - b'A') as usize;
                    options.get(index).map(|o| o.trim().to_string())
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn notes_prompt(lecture: &Lecture, transcript: &str) -> Prompt {
    Prompt::new(
        r#"You are an assistant helping medical students review lectures.
Write structured study notes for the lecture below: a detailed summary, 8-12 exam-relevant key points and the important medical terminology.

Return ONLY JSON:
{"notes": "...", "summary": "...", "keyPoints": ["..."], "medicalTerms": ["..."]}"#,
        format!(
            "Module: {}\nTopic: {}\n\nTranscript:\n{}",
            lecture.module,
            lecture.topic.as_deref().unwrap_or("General"),
            transcript
        ),
    )
    .temperature(0.4)
    .max_tokens(4000)
}

fn questions_prompt(lecture: &Lecture, notes: &NotesReply) -> Prompt {
    Prompt::new(
        format!(
            r#"Generate {QUESTIONS_PER_LECTURE} exam-style multiple choice questions for medical students.
Test core concepts, clinical applications, terminology and relationships between concepts.

Return ONLY a JSON array:
[{{"question": "...", "options": ["...", "...", "...", "..."], "correctAnswer": 0, "explanation": "..."}}]"#
        ),
        format!(
            "Module: {}\nSummary: {}\nKey points: {}",
            lecture.module,
            notes.summary,
            notes.key_points.join("; ")
        ),
    )
    .temperature(0.5)
    .max_tokens(3000)
}

fn progress_before(step: ProcessingStep) -> i64 {
    match step {
        ProcessingStep::Transcription => 0,
        ProcessingStep::NoteGeneration => ProcessingStep::Transcription.progress_after(),
        ProcessingStep::QuestionGeneration => ProcessingStep::NoteGeneration.progress_after(),
    }
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, OracleError>>,
) -> Result<T, OracleError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(OracleError::Timeout(timeout)))
}

#[derive(Clone)]
pub struct LecturePipeline {
    db: Arc<Mutex<Database>>,
    speech: Arc<dyn SpeechOracle>,
    oracle: Arc<dyn TextOracle>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl LecturePipeline {
    pub fn new(
        db: Arc<Mutex<Database>>,
        speech: Arc<dyn SpeechOracle>,
        oracle: Arc<dyn TextOracle>,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            speech,
            oracle,
            policy: RetryPolicy::default(),
            timeout,
        }
    }

    pub async fn create(&self, req: &CreateLectureRequest) -> Result<Lecture, LedgerError> {
        let user_id = required("userId", &req.user_id)?;
        let title = required("title", &req.title)?;
        let module = required("module", &req.module)?;
        required("transcript", &req.transcript)?;

        let now = Utc::now().to_rfc3339();
        let lecture = Lecture {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            module: module.to_string(),
            topic: req
                .topic
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from),
            status: LectureStatus::Processing,
            processing_progress: 0,
            created_at: now.clone(),
            updated_at: now,
        };

        let db = self.db.lock().await;
        let tx = db.begin_immediate()?;
        db.ensure_user(&lecture.user_id)?;
        db.insert_lecture(&lecture)?;
        tx.commit()?;

        info!("Created lecture {} '{}' for {}", lecture.id, lecture.title, lecture.user_id);
        Ok(lecture)
    }

    /// Creates the lecture and processes it in a detached task.
    pub async fn start(&self, req: &CreateLectureRequest) -> Result<(Lecture, JoinHandle<()>), LedgerError> {
        let lecture = self.create(req).await?;
        let pipeline = self.clone();
        let lecture_id = lecture.id.clone();
        let raw = req.transcript.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = pipeline.run(&lecture_id, &raw).await {
                warn!("Lecture {} stopped: {}", lecture_id, e);
            }
        });
        Ok((lecture, handle))
    }

    /// Runs every stage in order. The first failure marks the lecture failed.
    pub async fn run(&self, lecture_id: &str, raw: &str) -> Result<(), LedgerError> {
        let lecture = self
            .db
            .lock()
            .await
            .get_lecture(lecture_id)?
            .ok_or_else(|| LedgerError::not_found(format!("Lecture '{lecture_id}'")))?;

        let translation: Translation = self
            .stage(
                lecture_id,
                ProcessingStep::Transcription,
                bounded(self.timeout, self.speech.detect_and_translate(raw)),
                |db, t: &Translation| {
                    db.save_transcript(&LectureTranscript {
                        lecture_id: lecture_id.to_string(),
                        raw_transcript: raw.to_string(),
                        unified_transcript: t.unified_text.clone(),
                        language_detected: t.language_tag.clone(),
                        confidence: t.confidence,
                    })
                },
            )
            .await?;

        let notes = self
            .stage(
                lecture_id,
                ProcessingStep::NoteGeneration,
                async {
                    let prompt = notes_prompt(&lecture, &translation.unified_text);
                    let text = self.policy.complete(&*self.oracle, &prompt, self.timeout).await?;
                    parse_notes(&text)
                },
                |db, n: &NotesReply| {
                    db.save_notes(&LectureNotes {
                        lecture_id: lecture_id.to_string(),
                        notes: n.notes.clone(),
                        summary: n.summary.clone(),
                        key_points: n.key_points.clone(),
                        medical_terms: n.medical_terms.clone(),
                        questions: Vec::new(),
                    })
                },
            )
            .await?;

        self.stage(
            lecture_id,
            ProcessingStep::QuestionGeneration,
            async {
                let prompt = questions_prompt(&lecture, &notes);
                let text = self.policy.complete(&*self.oracle, &prompt, self.timeout).await?;
                parse_questions(&text)
            },
            |db, questions: &Vec<QuizItem>| db.set_lecture_questions(lecture_id, questions).map(|_| ()),
        )
        .await?;

        info!("Lecture {} processed", lecture_id);
        Ok(())
    }

    async fn stage<T, W, P>(
        &self,
        lecture_id: &str,
        step: ProcessingStep,
        work: W,
        persist: P,
    ) -> Result<T, LedgerError>
    where
        W: Future<Output = Result<T, OracleError>>,
        P: FnOnce(&Database, &T) -> rusqlite::Result<()>,
    {
        info!("Lecture {}: {} started", lecture_id, step.as_str());
        let started = Instant::now();
        let outcome = work.await.map_err(LedgerError::from);
        let duration_ms = started.elapsed().as_millis() as i64;

        // The store lock is only taken once the oracle has answered
        let db = self.db.lock().await;
        let outcome = outcome.and_then(|value| {
            let tx = db.begin_immediate()?;
            persist(&*db, &value)?;
            db.insert_processing_log(lecture_id, step, true, duration_ms, None)?;
            let status = match step {
                ProcessingStep::QuestionGeneration => LectureStatus::Completed,
                _ => LectureStatus::Processing,
            };
            db.update_lecture_status(lecture_id, status, step.progress_after())?;
            tx.commit()?;
            Ok(value)
        });

        match &outcome {
            Ok(_) => info!(
                "Lecture {}: {} done in {}ms ({}%)",
                lecture_id,
                step.as_str(),
                duration_ms,
                step.progress_after()
            ),
            Err(e) => {
                warn!("Lecture {}: {} failed: {}", lecture_id, step.as_str(), e);
                let message = e.to_string();
                let recorded = db
                    .insert_processing_log(lecture_id, step, false, duration_ms, Some(&message))
                    .and_then(|_| {
                        db.update_lecture_status(lecture_id, LectureStatus::Failed, progress_before(step))
                    });
                if let Err(log_err) = recorded {
                    error!("Failed to record failure of lecture {}: {}", lecture_id, log_err);
                }
            }
        }

        outcome
    }
}

pub fn detail(db: &Database, lecture_id: &str) -> Result<LectureDetail, LedgerError> {
    let lecture = db
        .get_lecture(lecture_id)?
        .ok_or_else(|| LedgerError::not_found(format!("Lecture '{lecture_id}'")))?;
    Ok(LectureDetail {
        transcript: db.get_transcript(lecture_id)?,
        notes: db.get_notes(lecture_id)?,
        logs: db.list_processing_logs(lecture_id)?,
        lecture,
    })
}

pub fn notes_document(lecture: &Lecture, notes: &LectureNotes) -> Document {
    let mut sections = vec![
        Section {
            heading: "Summary".to_string(),
            paragraphs: vec![notes.summary.clone()],
            ..Default::default()
        },
        Section {
            heading: "Notes".to_string(),
            paragraphs: notes
                .notes
                .split("\n\n")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            ..Default::default()
        },
    ];
    if !notes.key_points.is_empty() {
        sections.push(Section {
            heading: "Key Points".to_string(),
            bullets: notes.key_points.clone(),
            ..Default::default()
        });
    }
    if !notes.medical_terms.is_empty() {
        sections.push(Section {
            heading: "Medical Terms".to_string(),
            bullets: notes.medical_terms.clone(),
            ..Default::default()
        });
    }
    if !notes.questions.is_empty() {
        sections.push(Section {
            heading: "Practice Questions".to_string(),
            bullets: notes
                .questions
                .iter()
                .map(|q| format!("{} (Answer: {})", q.question, q.correct_answer))
                .collect(),
            ..Default::default()
        });
    }

    Document {
        title: lecture.title.clone(),
        subtitle: Some(match &lecture.topic {
            Some(topic) => format!("{}: {}", lecture.module, topic),
            None => lecture.module.clone(),
        }),
        sections,
    }
}

/// Renders a lecture's notes. Fails with a conflict until notes exist.
pub fn export_notes(
    db: &Database,
    renderer: &dyn DocumentRenderer,
    lecture_id: &str,
) -> Result<PathBuf, LedgerError> {
    let lecture = db
        .get_lecture(lecture_id)?
        .ok_or_else(|| LedgerError::not_found(format!("Lecture '{lecture_id}'")))?;
    let notes = db.get_notes(lecture_id)?.ok_or_else(|| {
        LedgerError::Conflict(format!("notes for lecture '{lecture_id}' are not ready"))
    })?;

    Ok(renderer.render_to_file(&notes_document(&lecture, &notes))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::fakes::{FixedTranslator, ScriptedOracle};
    use crate::oracle::HtmlRenderer;

    const NOTES: &str = r#"{"notes": "The heart has four chambers.\n\nValves prevent backflow.",
        "summary": "Cardiac anatomy overview", "keyPoints": ["Four chambers"], "medicalTerms": ["Myocardium"]}"#;
    const QUESTIONS: &str = r#"[{"question": "How many chambers?", "options": ["Two", "Four"],
        "correctAnswer": 1, "explanation": "Two atria, two ventricles"}]"#;

    fn setup_db() -> Arc<Mutex<Database>> {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        Arc::new(Mutex::new(db))
    }

    fn translation() -> Translation {
        Translation {
            unified_text: "The heart has four chambers".to_string(),
            language_tag: "en-sh".to_string(),
            confidence: 0.9,
        }
    }

    fn pipeline(
        db: &Arc<Mutex<Database>>,
        speech: Result<Translation, OracleError>,
        replies: Vec<Result<String, OracleError>>,
    ) -> LecturePipeline {
        LecturePipeline::new(
            db.clone(),
            Arc::new(FixedTranslator(speech)),
            Arc::new(ScriptedOracle::new(replies)),
            Duration::from_secs(5),
        )
    }

    fn request() -> CreateLectureRequest {
        CreateLectureRequest {
            user_id: "u1".to_string(),
            title: "Cardiac Anatomy".to_string(),
            module: "Anatomy".to_string(),
            topic: Some("Heart".to_string()),
            transcript: "srce has four chambers".to_string(),
        }
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn questions_accept_index_letter_and_text() {
            let text = r#"{"questions": [
                {"question": "Q1", "options": ["a", "b"], "correctAnswer": 0},
                {"question": "Q2", "options": ["a", "b"], "correctAnswer": "B"},
                {"question": "Q3", "options": ["left", "right"], "correctAnswer": "Right"}
            ]}"#;
            let items = parse_questions(text).unwrap();
            let answers: Vec<_> = items.iter().map(|q| q.correct_answer.as_str()).collect();
            assert_eq!(answers, vec!["a", "b", "right"]);
        }

        #[test]
        fn out_of_range_answer_is_malformed() {
            let text = r#"[{"question": "Q", "options": ["a", "b"], "correctAnswer": 3}]"#;
            assert!(matches!(parse_questions(text), Err(OracleError::Malformed(_))));
        }

        #[test]
        fn empty_question_list_is_malformed() {
            assert!(matches!(parse_questions("[]"), Err(OracleError::Malformed(_))));
        }

        #[test]
        fn notes_require_summary() {
            assert!(parse_notes(NOTES).is_ok());
            let empty = r#"{"notes": "x", "summary": " "}"#;
            assert!(matches!(parse_notes(empty), Err(OracleError::Malformed(_))));
        }
    }

    mod pipeline_tests {
        use super::*;

        #[tokio::test]
        async fn completes_all_stages() {
            let db = setup_db();
            let p = pipeline(
                &db,
                Ok(translation()),
                vec![Ok(NOTES.to_string()), Ok(QUESTIONS.to_string())],
            );

            let (lecture, handle) = p.start(&request()).await.unwrap();
            assert_eq!(lecture.status, LectureStatus::Processing);
            handle.await.unwrap();

            let detail = detail(&*db.lock().await, &lecture.id).unwrap();
            assert_eq!(detail.lecture.status, LectureStatus::Completed);
            assert_eq!(detail.lecture.processing_progress, 100);
            assert_eq!(detail.transcript.unwrap().language_detected, "en-sh");

            let notes = detail.notes.unwrap();
            assert_eq!(notes.key_points, vec!["Four chambers"]);
            assert_eq!(notes.questions.len(), 1);
            assert_eq!(notes.questions[0].correct_answer, "Four");

            let steps: Vec<_> = detail.logs.iter().map(|l| (l.step, l.succeeded)).collect();
            assert_eq!(
                steps,
                vec![
                    (ProcessingStep::Transcription, true),
                    (ProcessingStep::NoteGeneration, true),
                    (ProcessingStep::QuestionGeneration, true),
                ]
            );
        }

        #[tokio::test]
        async fn transcription_failure_halts() {
            let db = setup_db();
            let p = pipeline(
                &db,
                Err(OracleError::Unavailable("no speech service".to_string())),
                vec![Ok(NOTES.to_string())],
            );
            let lecture = p.create(&request()).await.unwrap();

            let err = p.run(&lecture.id, "raw").await.unwrap_err();
            assert!(matches!(err, LedgerError::Oracle(OracleError::Unavailable(_))));

            let detail = detail(&*db.lock().await, &lecture.id).unwrap();
            assert_eq!(detail.lecture.status, LectureStatus::Failed);
            assert_eq!(detail.lecture.processing_progress, 0);
            assert!(detail.transcript.is_none());
            assert_eq!(detail.logs.len(), 1);
            assert!(!detail.logs[0].succeeded);
            assert!(detail.logs[0].error_message.is_some());
        }

        #[tokio::test]
        async fn malformed_notes_keep_transcript_and_fail() {
            let db = setup_db();
            let p = pipeline(&db, Ok(translation()), vec![Ok("no json here".to_string())]);
            let lecture = p.create(&request()).await.unwrap();

            assert!(p.run(&lecture.id, "raw").await.is_err());

            let detail = detail(&*db.lock().await, &lecture.id).unwrap();
            assert_eq!(detail.lecture.status, LectureStatus::Failed);
            assert_eq!(detail.lecture.processing_progress, 33);
            assert!(detail.transcript.is_some());
            assert!(detail.notes.is_none());
            assert_eq!(detail.logs.len(), 2);
        }

        #[tokio::test]
        async fn question_failure_keeps_notes() {
            let db = setup_db();
            let p = pipeline(
                &db,
                Ok(translation()),
                vec![Ok(NOTES.to_string()), Err(OracleError::RateLimited)],
            );
            let lecture = p.create(&request()).await.unwrap();
            assert!(p.run(&lecture.id, "raw").await.is_err());

            let detail = detail(&*db.lock().await, &lecture.id).unwrap();
            assert_eq!(detail.lecture.status, LectureStatus::Failed);
            assert_eq!(detail.lecture.processing_progress, 66);
            assert!(detail.notes.unwrap().questions.is_empty());
        }

        #[tokio::test]
        async fn create_validates_fields() {
            let db = setup_db();
            let p = pipeline(&db, Ok(translation()), vec![]);
            let mut req = request();
            req.transcript = "   ".to_string();
            assert!(matches!(
                p.create(&req).await,
                Err(LedgerError::Validation { field, .. }) if field == "transcript"
            ));
        }

        #[test]
        fn unknown_lecture_is_not_found() {
            let db = Database::open(":memory:").unwrap();
            db.init().unwrap();
            assert!(matches!(detail(&db, "nope"), Err(LedgerError::NotFound(_))));
        }
    }

    mod export_tests {
        use super::*;

        #[tokio::test]
        async fn export_requires_notes() {
            let db = setup_db();
            let p = pipeline(&db, Ok(translation()), vec![]);
            let lecture = p.create(&request()).await.unwrap();
            let dir = tempfile::tempdir().unwrap();

            let err = export_notes(&*db.lock().await, &HtmlRenderer::new(dir.path()), &lecture.id)
                .unwrap_err();
            assert!(matches!(err, LedgerError::Conflict(_)));
        }

        #[tokio::test]
        async fn export_writes_html() {
            let db = setup_db();
            let p = pipeline(
                &db,
                Ok(translation()),
                vec![Ok(NOTES.to_string()), Ok(QUESTIONS.to_string())],
            );
            let lecture = p.create(&request()).await.unwrap();
            p.run(&lecture.id, "raw").await.unwrap();

            let dir = tempfile::tempdir().unwrap();
            let path = export_notes(&*db.lock().await, &HtmlRenderer::new(dir.path()), &lecture.id)
                .unwrap();
            let html = std::fs::read_to_string(&path).unwrap();
            assert!(path.starts_with(dir.path()));
            assert!(html.contains("Cardiac Anatomy"));
            assert!(html.contains("Anatomy: Heart"));
            assert!(html.contains("<li>Myocardium</li>"));
            assert!(html.contains("How many chambers? (Answer: Four)"));
        }
    }
}
