use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{Days, Utc};
use serde::{Deserialize, Serialize};

use crate::badges::BadgeEvaluator;
use crate::db::Database;
use crate::error::LedgerError;
use crate::exams::{self, GenerateExamRequest, SubmissionOutcome, SubmitExamRequest};
use crate::leaderboard::{LeaderboardRanker, RefreshSummary};
use crate::lectures::{self, CreateLectureRequest};
use crate::models::{
    Attempt, AttemptInput, BadgeOverview, CategoryStats, CreateUserRequest, CustomExam, DailyStats,
    ExamGenerationRecord, JsonOutput, LeaderboardEntry, Lecture, LectureDetail, User, UserBadge,
    UserRank, UserStats,
};
use crate::progression::{ProgressionEngine, ReplayReport};
use crate::server::{spawn_leaderboard_refresh, AppState};

type ApiResult<T> = Result<Json<JsonOutput<T>>, LedgerError>;
type AppStateRef = State<Arc<AppState>>;

const DEFAULT_DAYS: i64 = 7;
const MAX_DAYS: i64 = 365;
const DEFAULT_ATTEMPTS: i64 = 10;
const DEFAULT_HISTORY: i64 = 20;
const MAX_LIST: i64 = 100;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(JsonOutput::ok(data)))
}

fn require_user(db: &Database, user_id: &str) -> Result<User, LedgerError> {
    db.get_user(user_id)?
        .ok_or_else(|| LedgerError::not_found(format!("User '{user_id}'")))
}

fn list_limit(limit: Option<i64>, default: i64) -> Result<i64, LedgerError> {
    match limit {
        None => Ok(default),
        Some(n) if n < 1 => Err(LedgerError::validation("limit", "must be at least 1")),
        Some(n) => Ok(n.min(MAX_LIST)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DaysQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<i64>,
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResponse {
    pub attempt: Attempt,
    pub stats: UserStats,
    pub new_badges: Vec<UserBadge>,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub path: String,
}

pub async fn health() -> ApiResult<Health> {
    ok(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn create_user(
    State(state): AppStateRef,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> ApiResult<User> {
    let Json(req) = payload?;
    let id = req.id.trim();
    if id.is_empty() {
        return Err(LedgerError::validation("id", "must not be empty"));
    }
    let email = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    if email.is_some_and(|e| !e.contains('@')) {
        return Err(LedgerError::validation("email", "must be an email address"));
    }

    let db = state.db.lock().await;
    ok(db.create_user(id, email, req.full_name.as_deref())?)
}

pub async fn record_attempt(
    State(state): AppStateRef,
    payload: Result<Json<AttemptInput>, JsonRejection>,
) -> ApiResult<AttemptResponse> {
    let Json(input) = payload?;

    let response = {
        let db = state.db.lock().await;
        let recorded = ProgressionEngine::new(&db).record_attempt_with_badges(&input)?;
        AttemptResponse {
            attempt: recorded.attempt,
            stats: recorded.stats,
            new_badges: recorded.new_badges,
            duplicate: recorded.duplicate,
        }
    };

    if !response.duplicate {
        spawn_leaderboard_refresh(state.db.clone());
    }
    ok(response)
}

pub async fn user_stats(State(state): AppStateRef, Path(user_id): Path<String>) -> ApiResult<UserStats> {
    let db = state.db.lock().await;
    ok(ProgressionEngine::new(&db).user_stats(&user_id)?)
}

pub async fn category_stats(
    State(state): AppStateRef,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<CategoryStats>> {
    let db = state.db.lock().await;
    require_user(&db, &user_id)?;
    ok(db.list_category_stats(&user_id)?)
}

pub async fn daily_stats(
    State(state): AppStateRef,
    Path(user_id): Path<String>,
    query: Result<Query<DaysQuery>, QueryRejection>,
) -> ApiResult<Vec<DailyStats>> {
    let Query(query) = query?;
    let days = query.days.unwrap_or(DEFAULT_DAYS);
    if !(1..=MAX_DAYS).contains(&days) {
        return Err(LedgerError::validation(
            "days",
            format!("must be between 1 and {MAX_DAYS}"),
        ));
    }
    let since = Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(days as u64 - 1))
        .ok_or_else(|| LedgerError::validation("days", "out of range"))?
        .format("%Y-%m-%d")
        .to_string();

    let db = state.db.lock().await;
    require_user(&db, &user_id)?;
    ok(db.list_daily_stats(&user_id, &since)?)
}

pub async fn recent_attempts(
    State(state): AppStateRef,
    Path(user_id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<Attempt>> {
    let Query(query) = query?;
    let limit = list_limit(query.limit, DEFAULT_ATTEMPTS)?;

    let db = state.db.lock().await;
    require_user(&db, &user_id)?;
    ok(db.list_attempts(&user_id, limit)?)
}

pub async fn user_rank(State(state): AppStateRef, Path(user_id): Path<String>) -> ApiResult<UserRank> {
    let db = state.db.lock().await;
    ok(LeaderboardRanker::new(&db).get_user_rank(&user_id)?)
}

pub async fn badges(State(state): AppStateRef, Path(user_id): Path<String>) -> ApiResult<BadgeOverview> {
    let db = state.db.lock().await;
    ok(BadgeEvaluator::new(&db).overview(&user_id)?)
}

pub async fn check_badges(
    State(state): AppStateRef,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<UserBadge>> {
    let db = state.db.lock().await;
    ok(BadgeEvaluator::new(&db).check_and_award(&user_id)?)
}

pub async fn replay(State(state): AppStateRef, Path(user_id): Path<String>) -> ApiResult<ReplayReport> {
    let db = state.db.lock().await;
    ok(ProgressionEngine::new(&db).replay(&user_id)?)
}

pub async fn exam_history(
    State(state): AppStateRef,
    Path(user_id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<ExamGenerationRecord>> {
    let Query(query) = query?;
    let limit = list_limit(query.limit, DEFAULT_HISTORY)?;

    let db = state.db.lock().await;
    ok(db.list_generation_history(&user_id, limit)?)
}

pub async fn leaderboard(
    State(state): AppStateRef,
    query: Result<Query<LeaderboardQuery>, QueryRejection>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    let Query(query) = query?;
    let db = state.db.lock().await;
    ok(LeaderboardRanker::new(&db).get_page(query.limit, query.category.as_deref())?)
}

pub async fn refresh_leaderboard(State(state): AppStateRef) -> ApiResult<RefreshSummary> {
    let db = state.db.lock().await;
    ok(LeaderboardRanker::new(&db).refresh()?)
}

pub async fn generate_exam(
    State(state): AppStateRef,
    payload: Result<Json<GenerateExamRequest>, JsonRejection>,
) -> ApiResult<CustomExam> {
    let Json(req) = payload?;
    ok(state.exams.generate(&req).await?)
}

pub async fn get_exam(State(state): AppStateRef, Path(exam_id): Path<String>) -> ApiResult<CustomExam> {
    let db = state.db.lock().await;
    ok(exams::get_exam(&db, &exam_id)?)
}

pub async fn submit_exam(
    State(state): AppStateRef,
    Path(exam_id): Path<String>,
    payload: Result<Json<SubmitExamRequest>, JsonRejection>,
) -> ApiResult<SubmissionOutcome> {
    let Json(req) = payload?;
    let outcome = {
        let db = state.db.lock().await;
        exams::submit_exam(&db, &exam_id, &req)?
    };
    spawn_leaderboard_refresh(state.db.clone());
    ok(outcome)
}

pub async fn create_lecture(
    State(state): AppStateRef,
    payload: Result<Json<CreateLectureRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JsonOutput<Lecture>>), LedgerError> {
    let Json(req) = payload?;
    // Processing continues after the response
    let (lecture, _) = state.lectures.start(&req).await?;
    Ok((StatusCode::ACCEPTED, Json(JsonOutput::ok(lecture))))
}

pub async fn lecture_detail(
    State(state): AppStateRef,
    Path(lecture_id): Path<String>,
) -> ApiResult<LectureDetail> {
    let db = state.db.lock().await;
    ok(lectures::detail(&db, &lecture_id)?)
}

pub async fn export_lecture(
    State(state): AppStateRef,
    Path(lecture_id): Path<String>,
) -> ApiResult<ExportResponse> {
    let db = state.db.lock().await;
    let path = lectures::export_notes(&db, state.renderer.as_ref(), &lecture_id)?;
    ok(ExportResponse {
        path: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::fakes::{FixedTranslator, ScriptedOracle};
    use crate::oracle::{HtmlRenderer, OracleError, Translation};
    use crate::server::router;
    use axum::{
        body::Body,
        http::{header::CONTENT_TYPE, Method, Request},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        state: Arc<AppState>,
        _exports: tempfile::TempDir,
    }

    impl TestApp {
        fn new(replies: Vec<Result<String, OracleError>>) -> Self {
            let db = Database::open(":memory:").expect("Failed to create in-memory database");
            db.init().expect("Failed to initialize database");
            let exports = tempfile::tempdir().unwrap();
            let state = AppState::with_oracles(
                db,
                Arc::new(ScriptedOracle::new(replies)),
                Arc::new(FixedTranslator(Ok(Translation {
                    unified_text: "Lecture text".to_string(),
                    language_tag: "en".to_string(),
                    confidence: 1.0,
                }))),
                Arc::new(HtmlRenderer::new(exports.path())),
                Duration::from_secs(5),
            );
            Self {
                state,
                _exports: exports,
            }
        }

        fn router(&self) -> Router {
            router(self.state.clone())
        }

        async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let builder = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string())),
                None => builder.body(Body::empty()),
            }
            .unwrap();

            let response = self.router().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn get(&self, uri: &str) -> (StatusCode, Value) {
            self.send(Method::GET, uri, None).await
        }

        async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            self.send(Method::POST, uri, Some(body)).await
        }
    }

    fn attempt(user_id: &str, correct: bool) -> Value {
        json!({
            "userId": user_id,
            "category": "Anatomy",
            "selectedAnswer": if correct { "A" } else { "B" },
            "correctAnswer": "A",
            "timeSpent": 20,
            "difficulty": "medium"
        })
    }

    fn stems_reply(n: usize) -> String {
        let stems: Vec<Value> = (0..n)
            .map(|i| {
                json!({
                    "stemText": format!("Stem {i}"),
                    "topic": "Heart",
                    "options": [
                        {"letter": "A", "statement": "True", "isCorrect": true, "explanation": "Yes"},
                        {"letter": "B", "statement": "False", "isCorrect": false, "explanation": "No"}
                    ]
                })
            })
            .collect();
        Value::Array(stems).to_string()
    }

    mod basic_tests {
        use super::*;

        #[tokio::test]
        async fn health_reports_ok() {
            let app = TestApp::new(vec![]);
            let (status, body) = app.get("/health").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], true);
            assert_eq!(body["data"]["status"], "ok");
        }

        #[tokio::test]
        async fn create_user_is_idempotent_on_id() {
            let app = TestApp::new(vec![]);
            let body = json!({"id": "u1", "email": "u1@example.com", "fullName": "Student One"});
            assert_eq!(app.post("/users", body.clone()).await.0, StatusCode::OK);
            let (status, again) = app.post("/users", body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(again["data"]["id"], "u1");
        }

        #[tokio::test]
        async fn duplicate_email_conflicts() {
            let app = TestApp::new(vec![]);
            app.post("/users", json!({"id": "a", "email": "same@example.com"})).await;
            let (status, body) = app
                .post("/users", json!({"id": "b", "email": "same@example.com"}))
                .await;
            assert_eq!(status, StatusCode::CONFLICT);
            assert_eq!(body["success"], false);
        }
    }

    mod attempt_tests {
        use super::*;

        #[tokio::test]
        async fn attempt_returns_updated_stats() {
            let app = TestApp::new(vec![]);
            let (status, body) = app.post("/attempts", attempt("u1", true)).await;
            assert_eq!(status, StatusCode::OK);
            let stats = &body["data"]["stats"];
            assert_eq!(stats["totalQuestions"], 1);
            assert_eq!(stats["correctAnswers"], 1);
            assert_eq!(stats["averageScore"], 100);
            assert_eq!(stats["totalXP"], 10);
            assert_eq!(stats["currentLevel"], 1);
            assert_eq!(body["data"]["newBadges"], json!([]));

            let (_, body) = app.post("/attempts", attempt("u1", false)).await;
            let stats = &body["data"]["stats"];
            assert_eq!(stats["totalQuestions"], 2);
            assert_eq!(stats["averageScore"], 50);
            assert_eq!(stats["currentStreak"], 0);
            assert_eq!(stats["longestStreak"], 1);
            assert_eq!(stats["totalXP"], 12);

            let (status, body) = app.get("/users/u1/stats").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["totalXP"], 12);
        }

        #[tokio::test]
        async fn missing_category_is_bad_request_with_field() {
            let app = TestApp::new(vec![]);
            let mut body = attempt("u1", true);
            body["category"] = json!("  ");
            let (status, body) = app.post("/attempts", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["field"], "category");
        }

        #[tokio::test]
        async fn unparseable_body_is_bad_request() {
            let app = TestApp::new(vec![]);
            let request = Request::builder()
                .method(Method::POST)
                .uri("/attempts")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap();
            let response = app.router().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn idempotency_key_prevents_double_recording() {
            let app = TestApp::new(vec![]);
            let mut body = attempt("u1", true);
            body["idempotencyKey"] = json!("retry-1");
            app.post("/attempts", body.clone()).await;
            let (status, again) = app.post("/attempts", body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(again["data"]["duplicate"], true);
            assert_eq!(again["data"]["stats"]["totalQuestions"], 1);

            let (_, attempts) = app.get("/users/u1/attempts?limit=5").await;
            assert_eq!(attempts["data"].as_array().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn failed_badge_award_leaves_nothing_to_double_record() {
            let app = TestApp::new(vec![]);
            app.state
                .db
                .lock()
                .await
                .conn()
                .execute_batch(
                    r#"
                    CREATE TRIGGER fail_awards BEFORE INSERT ON user_badges
                    BEGIN SELECT RAISE(ABORT, 'award rejected'); END;
                    "#,
                )
                .unwrap();
            let mut body = attempt("u1", true);
            body["xpEarned"] = json!(2000);

            for _ in 0..2 {
                let (status, response) = app.post("/attempts", body.clone()).await;
                assert_ne!(status, StatusCode::OK);
                assert_eq!(response["success"], false);
            }
            let logged: i64 = app
                .state
                .db
                .lock()
                .await
                .conn()
                .query_row("SELECT COUNT(*) FROM attempts", [], |row| row.get(0))
                .unwrap();
            assert_eq!(logged, 0);

            app.state
                .db
                .lock()
                .await
                .conn()
                .execute_batch("DROP TRIGGER fail_awards;")
                .unwrap();
            let (status, response) = app.post("/attempts", body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(response["data"]["newBadges"][0]["name"], "Rising Star");
            assert_eq!(response["data"]["stats"]["totalQuestions"], 1);
            assert_eq!(response["data"]["stats"]["totalXP"], 2200);
        }

        #[tokio::test]
        async fn unknown_user_is_not_found() {
            let app = TestApp::new(vec![]);
            assert_eq!(app.get("/users/ghost/stats").await.0, StatusCode::NOT_FOUND);
            assert_eq!(app.get("/users/ghost/category-stats").await.0, StatusCode::NOT_FOUND);
            assert_eq!(app.get("/users/ghost/rank").await.0, StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn per_user_views() {
            let app = TestApp::new(vec![]);
            app.post("/attempts", attempt("u1", true)).await;

            let (_, categories) = app.get("/users/u1/category-stats").await;
            assert_eq!(categories["data"][0]["category"], "Anatomy");

            let (_, daily) = app.get("/users/u1/daily-stats?days=7").await;
            assert_eq!(daily["data"].as_array().unwrap().len(), 1);

            let (status, _) = app.get("/users/u1/daily-stats?days=0").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);

            let (_, badges) = app.get("/users/u1/badges").await;
            assert!(!badges["data"]["available"].as_array().unwrap().is_empty());

            let (status, replay) = app.post("/users/u1/replay", json!({})).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(replay["data"]["drifted"], false);
        }
    }

    mod leaderboard_tests {
        use super::*;

        #[tokio::test]
        async fn refresh_then_page() {
            let app = TestApp::new(vec![]);
            for user in ["alice", "bob", "carol"] {
                app.post("/attempts", attempt(user, true)).await;
            }
            app.post("/attempts", attempt("dave", false)).await;

            let (status, summary) = app.post("/leaderboard/refresh", json!({})).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(summary["data"]["rankedUsers"], 4);

            let (_, page) = app.get("/leaderboard?limit=10").await;
            let ranks: Vec<i64> = page["data"]
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["rank"].as_i64().unwrap())
                .collect();
            assert_eq!(ranks, vec![1, 2, 3, 4]);

            let (_, rank) = app.get("/users/alice/rank").await;
            assert_eq!(rank["data"]["rank"], 1);
        }

        #[tokio::test]
        async fn zero_limit_is_rejected() {
            let app = TestApp::new(vec![]);
            let (status, body) = app.get("/leaderboard?limit=0").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["field"], "limit");
        }
    }

    mod exam_tests {
        use super::*;

        fn generate_body() -> Value {
            json!({"userId": "u1", "examType": "anatomy", "topics": ["Heart"], "stemCount": 5})
        }

        #[tokio::test]
        async fn malformed_generation_is_bad_gateway_and_logged() {
            let app = TestApp::new(vec![Ok("garbage".to_string())]);
            let (status, body) = app.post("/exams/generate", generate_body()).await;
            assert_eq!(status, StatusCode::BAD_GATEWAY);
            assert_eq!(body["success"], false);

            let (_, history) = app.get("/users/u1/exam-history").await;
            let rows = history["data"].as_array().unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["status"], "failed");
        }

        #[tokio::test]
        async fn unavailable_oracle_is_service_unavailable() {
            let app = TestApp::new(vec![Err(OracleError::Unavailable("down".to_string()))]);
            let (status, _) = app.post("/exams/generate", generate_body()).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        }

        #[tokio::test]
        async fn generate_fetch_and_submit() {
            let app = TestApp::new(vec![Ok(stems_reply(5))]);
            let (status, body) = app.post("/exams/generate", generate_body()).await;
            assert_eq!(status, StatusCode::OK);
            let exam_id = body["data"]["id"].as_str().unwrap().to_string();

            let (status, exam) = app.get(&format!("/exams/{exam_id}")).await;
            assert_eq!(status, StatusCode::OK);
            let stems = exam["data"]["stems"].as_array().unwrap();
            assert_eq!(stems.len(), 5);

            let mut answers = serde_json::Map::new();
            for stem in stems {
                let correct = stem["options"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .find(|o| o["isCorrect"] == true)
                    .unwrap();
                answers.insert(stem["id"].as_str().unwrap().to_string(), correct["letter"].clone());
            }

            let (status, result) = app
                .post(
                    &format!("/exams/{exam_id}/submit"),
                    json!({"userId": "u1", "answers": answers, "timeSpentSeconds": 100}),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(result["data"]["score"]["scorePercentage"], 100);
            assert_eq!(result["data"]["score"]["correct"], 5);
        }

        #[tokio::test]
        async fn unknown_exam_is_not_found() {
            let app = TestApp::new(vec![]);
            assert_eq!(app.get("/exams/missing").await.0, StatusCode::NOT_FOUND);
        }
    }

    mod lecture_tests {
        use super::*;

        #[tokio::test]
        async fn create_lecture_is_accepted() {
            let app = TestApp::new(vec![]);
            let (status, body) = app
                .post(
                    "/lectures",
                    json!({"userId": "u1", "title": "Heart", "module": "Anatomy", "transcript": "raw text"}),
                )
                .await;
            assert_eq!(status, StatusCode::ACCEPTED);
            let id = body["data"]["id"].as_str().unwrap().to_string();

            let (status, detail) = app.get(&format!("/lectures/{id}")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(detail["data"]["lecture"]["title"], "Heart");
        }

        #[tokio::test]
        async fn export_before_notes_conflicts() {
            let app = TestApp::new(vec![]);
            let lecture = {
                let (_, body) = app
                    .post(
                        "/lectures",
                        json!({"userId": "u1", "title": "Heart", "module": "Anatomy", "transcript": "raw"}),
                    )
                    .await;
                body["data"]["id"].as_str().unwrap().to_string()
            };
            // Oracle script is empty, so notes never arrive
            let (status, _) = app.post(&format!("/lectures/{lecture}/export"), json!({})).await;
            assert_eq!(status, StatusCode::CONFLICT);
        }

        #[tokio::test]
        async fn missing_lecture_fields_are_rejected() {
            let app = TestApp::new(vec![]);
            let (status, body) = app
                .post(
                    "/lectures",
                    json!({"userId": "u1", "title": "", "module": "Anatomy", "transcript": "raw"}),
                )
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["field"], "title");
        }
    }
}
