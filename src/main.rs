mod badges;
mod config;
mod db;
mod error;
mod exams;
mod leaderboard;
mod lectures;
mod models;
mod oracle;
mod progression;
mod routes;
mod server;
mod tui;

use chrono::{Days, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use badges::BadgeEvaluator;
use config::Config;
use db::Database;
use error::LedgerError;
use exams::{ExamOrchestrator, GenerateExamRequest};
use leaderboard::LeaderboardRanker;
use models::{AttemptInput, JsonOutput};
use oracle::DeepSeekClient;
use progression::ProgressionEngine;

#[derive(Parser)]
#[command(name = "docdot")]
#[command(about = "Progress tracking, badges, leaderboards and exam generation for medical students")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Database path (overrides DOCDOT_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and seed the badge catalog
    Init,

    /// Run the HTTP API
    Serve,

    /// Record a question attempt
    Attempt {
        /// User ID
        user: String,

        /// Category (e.g. "Upper Limb")
        #[arg(long, short)]
        category: String,

        /// Answer the user selected
        #[arg(long, short)]
        selected: String,

        /// Correct answer
        #[arg(long = "answer", short = 'a')]
        correct: String,

        /// Seconds spent on the question
        #[arg(long, short)]
        time: Option<i64>,

        /// Difficulty: easy/medium/hard
        #[arg(long, short)]
        difficulty: Option<String>,

        /// Override the default XP award
        #[arg(long)]
        xp: Option<i64>,

        /// Idempotency key, a retry with the same key is not recorded twice
        #[arg(long, short)]
        key: Option<String>,
    },

    /// Show a user's aggregate statistics
    Stats {
        /// User ID
        user: String,
    },

    /// Show per-category mastery
    Categories {
        /// User ID
        user: String,
    },

    /// Show daily rollups
    Daily {
        /// User ID
        user: String,

        /// Number of days back, including today
        #[arg(long, short, default_value_t = 7)]
        days: u64,
    },

    /// Show a leaderboard page
    Leaderboard {
        /// Category board instead of the global one
        #[arg(long, short)]
        category: Option<String>,

        /// Page size
        #[arg(long, short)]
        limit: Option<i64>,
    },

    /// Recompute every leaderboard
    Refresh,

    /// Show a user's live rank
    Rank {
        /// User ID
        user: String,
    },

    /// Show earned badges and progress, or award pending ones
    Badges {
        /// User ID
        user: String,

        /// Evaluate and award any newly qualified badges
        #[arg(long)]
        check: bool,
    },

    /// Rebuild a user's aggregates from the attempt log
    Replay {
        /// User ID
        user: String,
    },

    /// Generate and inspect practice exams
    #[command(subcommand)]
    Exam(ExamCommands),

    /// Launch interactive terminal dashboard
    Tui {
        /// User ID
        user: String,
    },
}

#[derive(Subcommand)]
enum ExamCommands {
    /// Generate a practice exam with the text oracle
    Generate {
        /// User ID
        user: String,

        /// Exam type: anatomy/physiology
        #[arg(long = "type", short = 't')]
        exam_type: String,

        /// Comma-separated topics
        #[arg(long, short = 'T')]
        topics: Option<String>,

        /// Number of stems
        #[arg(long, short = 'n', default_value_t = 10)]
        stems: i64,

        /// Exam title
        #[arg(long)]
        title: Option<String>,
    },

    /// Show an exam with its stems
    Show {
        /// Exam ID
        id: String,
    },

    /// Show a user's generation history
    History {
        /// User ID
        user: String,

        /// Maximum records
        #[arg(long, short, default_value_t = 20)]
        limit: i64,
    },
}

fn print_json<T: Serialize>(data: T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("docdot=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli).await {
        if json {
            let mut output = JsonOutput::<()>::err(e.to_string());
            if let Some(LedgerError::Validation { field, .. }) = e.downcast_ref::<LedgerError>() {
                output = output.with_field(field);
            }
            match serde_json::to_string(&output) {
                Ok(line) => println!("{}", line),
                Err(_) => eprintln!("Error: {}", e),
            }
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load().with_db_path(cli.db);
    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            if cli.json {
                print_json(())?;
            } else {
                println!("Database initialized at: {}", config.db_path.display());
            }
        }

        Commands::Serve => {
            db.init()?;
            server::serve(config, db).await?;
        }

        Commands::Attempt {
            user,
            category,
            selected,
            correct,
            time,
            difficulty,
            xp,
            key,
        } => {
            let input = AttemptInput {
                user_id: user,
                category,
                selected_answer: selected,
                correct_answer: correct,
                is_correct: None,
                time_spent_seconds: time,
                difficulty,
                xp_earned: xp,
                idempotency_key: key,
            };

            let engine = ProgressionEngine::new(&db);
            let recorded = engine.record_attempt_with_badges(&input)?;
            let user_id = recorded.attempt.user_id.clone();
            let new_badges = recorded.new_badges;
            if !recorded.duplicate {
                LeaderboardRanker::new(&db).refresh()?;
            }
            let stats = engine.user_stats(&user_id)?;

            if cli.json {
                print_json(serde_json::json!({
                    "attempt": recorded.attempt,
                    "stats": stats,
                    "newBadges": new_badges,
                    "duplicate": recorded.duplicate
                }))?;
            } else {
                let attempt = &recorded.attempt;
                if recorded.duplicate {
                    println!("Attempt already recorded (ID: {}).", attempt.id);
                } else {
                    println!(
                        "Recorded attempt {}: {} (+{} XP)",
                        attempt.id,
                        if attempt.is_correct { "correct" } else { "incorrect" },
                        attempt.xp_earned
                    );
                }
                println!(
                    "Total XP: {} | Level {} | Streak {}",
                    stats.total_xp, stats.current_level, stats.current_streak
                );
                for badge in &new_badges {
                    println!("Badge earned: {} (+{} XP)", badge.name, badge.xp_reward);
                }
            }
        }

        Commands::Stats { user } => {
            let stats = ProgressionEngine::new(&db).user_stats(&user)?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("=== Statistics for {} ===", stats.user_id);
                println!("Level: {} ({} XP)", stats.current_level, stats.total_xp);
                println!(
                    "Questions: {} ({} correct, {}%)",
                    stats.total_questions, stats.correct_answers, stats.average_score
                );
                println!(
                    "Streak: {} (longest {})",
                    stats.current_streak, stats.longest_streak
                );
                println!("Study time: {} min", stats.total_study_time);
                if stats.rank > 0 {
                    println!("Rank: #{}", stats.rank);
                }
            }
        }

        Commands::Categories { user } => {
            let categories = db.list_category_stats(&user)?;
            if cli.json {
                print_json(&categories)?;
            } else if categories.is_empty() {
                println!("No categories studied yet.");
            } else {
                println!(
                    "{:<30} {:>9} {:>8} {:>8} {:>8}  LEVEL",
                    "CATEGORY", "QUESTIONS", "SCORE", "AVG", "MASTERY"
                );
                println!("{}", "-".repeat(84));
                for cat in categories {
                    println!(
                        "{:<30} {:>9} {:>7}% {:>7}s {:>7}%  {}",
                        truncate(&cat.category, 28),
                        cat.questions_attempted,
                        cat.average_score,
                        cat.average_time,
                        cat.mastery,
                        cat.mastery_label()
                    );
                }
            }
        }

        Commands::Daily { user, days } => {
            if !(1..=365).contains(&days) {
                return Err(LedgerError::validation("days", "must be between 1 and 365").into());
            }
            let today = Utc::now().date_naive();
            let since = today
                .checked_sub_days(Days::new(days - 1))
                .unwrap_or(today)
                .format("%Y-%m-%d")
                .to_string();
            let daily = db.list_daily_stats(&user, &since)?;

            if cli.json {
                print_json(&daily)?;
            } else if daily.is_empty() {
                println!("No activity in the last {} days.", days);
            } else {
                println!(
                    "{:<12} {:>9} {:>8} {:>6} {:>6}  CATEGORIES",
                    "DATE", "QUESTIONS", "CORRECT", "XP", "MIN"
                );
                println!("{}", "-".repeat(70));
                for day in daily {
                    println!(
                        "{:<12} {:>9} {:>8} {:>6} {:>6}  {}",
                        day.date,
                        day.questions_answered,
                        day.correct_answers,
                        day.xp_earned,
                        day.study_time,
                        day.categories_studied.join(", ")
                    );
                }
            }
        }

        Commands::Leaderboard { category, limit } => {
            let page = LeaderboardRanker::new(&db).get_page(limit, category.as_deref())?;
            if cli.json {
                print_json(&page)?;
            } else if page.is_empty() {
                println!("Leaderboard is empty. Run `docdot refresh` after recording attempts.");
            } else {
                println!(
                    "{:<6} {:<30} {:>8} {:>9} {:>6}",
                    "RANK", "USER", "XP", "ACCURACY", "LEVEL"
                );
                println!("{}", "-".repeat(64));
                for entry in page {
                    let name = entry.full_name.as_deref().unwrap_or(&entry.user_id);
                    println!(
                        "{:<6} {:<30} {:>8} {:>8}% {:>6}",
                        entry.rank,
                        truncate(name, 28),
                        entry.total_xp,
                        entry.average_score,
                        entry.current_level
                    );
                }
            }
        }

        Commands::Refresh => {
            let summary = LeaderboardRanker::new(&db).refresh()?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "Ranked {} users across {} category boards.",
                    summary.ranked_users, summary.category_boards
                );
            }
        }

        Commands::Rank { user } => {
            let rank = LeaderboardRanker::new(&db).get_user_rank(&user)?;
            if cli.json {
                print_json(&rank)?;
            } else {
                match rank.rank {
                    Some(r) => println!("{} is ranked #{} with {} XP.", rank.user_id, r, rank.total_xp),
                    None => println!("{} is not ranked yet.", rank.user_id),
                }
            }
        }

        Commands::Badges { user, check } => {
            let evaluator = BadgeEvaluator::new(&db);
            if check {
                let awarded = evaluator.check_and_award(&user)?;
                if cli.json {
                    print_json(&awarded)?;
                } else if awarded.is_empty() {
                    println!("No new badges.");
                } else {
                    for badge in awarded {
                        println!("Awarded: {} (+{} XP)", badge.name, badge.xp_reward);
                    }
                }
            } else {
                let overview = evaluator.overview(&user)?;
                if cli.json {
                    print_json(&overview)?;
                } else {
                    println!("=== Earned ({}) ===", overview.earned.len());
                    for badge in &overview.earned {
                        println!("  {} (+{} XP) on {}", badge.name, badge.xp_reward, badge.earned_at);
                    }
                    println!();
                    println!("=== Available ({}) ===", overview.available.len());
                    for entry in &overview.available {
                        let progress = entry
                            .progress
                            .map(|p| format!("{}/{}", p, entry.badge.requirement))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  {:<24} {:<9} {:>10}  {}",
                            truncate(&entry.badge.name, 22),
                            entry.badge.tier.as_str(),
                            progress,
                            entry.badge.description
                        );
                    }
                }
            }
        }

        Commands::Replay { user } => {
            let report = ProgressionEngine::new(&db).replay(&user)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "Replayed {} attempts for {} ({} categories, {} days).",
                    report.attempts_replayed,
                    report.user_id,
                    report.categories.len(),
                    report.days
                );
                if report.drifted {
                    println!("Stored aggregates had drifted and were rewritten.");
                } else {
                    println!("Stored aggregates already matched the log.");
                }
                println!(
                    "Total XP: {} (including {} from badges)",
                    report.stats.total_xp, report.badge_xp
                );
            }
        }

        Commands::Exam(exam_cmd) => match exam_cmd {
            ExamCommands::Generate {
                user,
                exam_type,
                topics,
                stems,
                title,
            } => {
                let request = GenerateExamRequest {
                    user_id: user,
                    exam_type,
                    topics: split_list(topics.as_deref()),
                    stem_count: stems,
                    title,
                };
                let oracle = Arc::new(DeepSeekClient::new(config.oracle.clone())?);
                let orchestrator =
                    ExamOrchestrator::new(Arc::new(Mutex::new(db)), oracle, config.oracle.timeout)
                        .with_policy(config.oracle.retry_policy());
                let exam = orchestrator.generate(&request).await?;

                if cli.json {
                    print_json(&exam)?;
                } else {
                    println!("Generated exam '{}' (ID: {})", exam.title, exam.id);
                    println!(
                        "{} stems, {} minutes",
                        exam.stem_count,
                        exam.duration_seconds / 60
                    );
                    println!("Show it with: docdot exam show {}", exam.id);
                }
            }

            ExamCommands::Show { id } => {
                let exam = exams::get_exam(&db, &id)?;
                if cli.json {
                    print_json(&exam)?;
                } else {
                    println!("{} ({})", exam.title, exam.exam_type.label());
                    println!("Topics: {}", exam.topics.join(", "));
                    println!("Created: {}", exam.created_at);
                    for stem in &exam.stems {
                        println!();
                        println!("{}. {}", stem.order_index + 1, stem.stem_text);
                        for option in &stem.options {
                            println!("   {}) {}", option.letter, option.statement);
                        }
                    }
                }
            }

            ExamCommands::History { user, limit } => {
                let history = db.list_generation_history(&user, limit.clamp(1, 100))?;
                if cli.json {
                    print_json(&history)?;
                } else if history.is_empty() {
                    println!("No exams generated yet.");
                } else {
                    println!(
                        "{:<26} {:<11} {:>6} {:<10} {:>8}  ERROR",
                        "CREATED", "TYPE", "STEMS", "STATUS", "MS"
                    );
                    println!("{}", "-".repeat(80));
                    for record in history {
                        println!(
                            "{:<26} {:<11} {:>6} {:<10} {:>8}  {}",
                            truncate(&record.created_at, 25),
                            record.exam_type,
                            record.requested_stem_count,
                            record.status.as_str(),
                            record.duration_ms,
                            record.error_message.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        },

        Commands::Tui { user } => {
            tui::run(db, &user)?;
        }
    }

    Ok(())
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    mod truncate_tests {
        use super::*;

        #[test]
        fn truncate_short_string() {
            assert_eq!(truncate("Thorax", 10), "Thorax");
        }

        #[test]
        fn truncate_exact_length() {
            assert_eq!(truncate("Thorax", 6), "Thorax");
        }

        #[test]
        fn truncate_long_string() {
            assert_eq!(truncate("Upper Limb Muscles", 8), "Upper...");
        }

        #[test]
        fn truncate_empty_string() {
            assert_eq!(truncate("", 10), "");
        }

        #[test]
        fn truncate_multibyte_does_not_split_chars() {
            assert_eq!(truncate("Srčani mišić", 6), "Srč...");
        }
    }

    mod split_list_tests {
        use super::*;

        #[test]
        fn splits_and_trims() {
            assert_eq!(
                split_list(Some("Heart, Lungs ,,Kidney")),
                vec!["Heart", "Lungs", "Kidney"]
            );
        }

        #[test]
        fn none_is_empty() {
            assert!(split_list(None).is_empty());
        }
    }

    mod cli_parsing_tests {
        use super::*;

        #[test]
        fn parse_init_command() {
            let cli = Cli::try_parse_from(["docdot", "init"]).unwrap();
            assert!(!cli.json);
            assert!(cli.db.is_none());
            assert!(matches!(cli.command, Commands::Init));
        }

        #[test]
        fn parse_init_with_json_and_db() {
            let cli =
                Cli::try_parse_from(["docdot", "--json", "--db", "/tmp/x.db", "init"]).unwrap();
            assert!(cli.json);
            assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        }

        #[test]
        fn parse_attempt_full() {
            let cli = Cli::try_parse_from([
                "docdot",
                "attempt",
                "u1",
                "-c",
                "Thorax",
                "-s",
                "B",
                "-a",
                "B",
                "-t",
                "12",
                "-d",
                "hard",
                "--key",
                "k-1",
            ])
            .unwrap();
            match cli.command {
                Commands::Attempt {
                    user,
                    category,
                    selected,
                    correct,
                    time,
                    difficulty,
                    xp,
                    key,
                } => {
                    assert_eq!(user, "u1");
                    assert_eq!(category, "Thorax");
                    assert_eq!(selected, "B");
                    assert_eq!(correct, "B");
                    assert_eq!(time, Some(12));
                    assert_eq!(difficulty, Some("hard".to_string()));
                    assert!(xp.is_none());
                    assert_eq!(key, Some("k-1".to_string()));
                }
                _ => panic!("Expected Attempt command"),
            }
        }

        #[test]
        fn parse_daily_default_days() {
            let cli = Cli::try_parse_from(["docdot", "daily", "u1"]).unwrap();
            match cli.command {
                Commands::Daily { user, days } => {
                    assert_eq!(user, "u1");
                    assert_eq!(days, 7);
                }
                _ => panic!("Expected Daily command"),
            }
        }

        #[test]
        fn parse_leaderboard_with_category() {
            let cli =
                Cli::try_parse_from(["docdot", "leaderboard", "--category", "Physiology", "-l", "5"])
                    .unwrap();
            match cli.command {
                Commands::Leaderboard { category, limit } => {
                    assert_eq!(category, Some("Physiology".to_string()));
                    assert_eq!(limit, Some(5));
                }
                _ => panic!("Expected Leaderboard command"),
            }
        }

        #[test]
        fn parse_badges_check() {
            let cli = Cli::try_parse_from(["docdot", "badges", "u1", "--check"]).unwrap();
            match cli.command {
                Commands::Badges { user, check } => {
                    assert_eq!(user, "u1");
                    assert!(check);
                }
                _ => panic!("Expected Badges command"),
            }
        }

        #[test]
        fn parse_exam_generate() {
            let cli = Cli::try_parse_from([
                "docdot",
                "exam",
                "generate",
                "u1",
                "--type",
                "anatomy",
                "-T",
                "Heart,Lungs",
                "-n",
                "20",
            ])
            .unwrap();
            match cli.command {
                Commands::Exam(ExamCommands::Generate {
                    user,
                    exam_type,
                    topics,
                    stems,
                    title,
                }) => {
                    assert_eq!(user, "u1");
                    assert_eq!(exam_type, "anatomy");
                    assert_eq!(topics, Some("Heart,Lungs".to_string()));
                    assert_eq!(stems, 20);
                    assert!(title.is_none());
                }
                _ => panic!("Expected Exam Generate command"),
            }
        }

        #[test]
        fn parse_exam_history_default_limit() {
            let cli = Cli::try_parse_from(["docdot", "exam", "history", "u1"]).unwrap();
            match cli.command {
                Commands::Exam(ExamCommands::History { user, limit }) => {
                    assert_eq!(user, "u1");
                    assert_eq!(limit, 20);
                }
                _ => panic!("Expected Exam History command"),
            }
        }

        #[test]
        fn parse_json_flag_global() {
            let cli1 = Cli::try_parse_from(["docdot", "--json", "refresh"]).unwrap();
            assert!(cli1.json);

            let cli2 = Cli::try_parse_from(["docdot", "rank", "u1", "--json"]).unwrap();
            assert!(cli2.json);
        }

        #[test]
        fn parse_invalid_command_fails() {
            assert!(Cli::try_parse_from(["docdot", "invalid"]).is_err());
        }

        #[test]
        fn parse_missing_required_arg_fails() {
            assert!(Cli::try_parse_from(["docdot", "stats"]).is_err());
            assert!(Cli::try_parse_from(["docdot", "tui"]).is_err());
            assert!(Cli::try_parse_from(["docdot", "attempt", "u1", "-s", "A", "-a", "B"]).is_err());
            assert!(Cli::try_parse_from(["docdot", "exam", "generate", "u1"]).is_err());
        }
    }
}
