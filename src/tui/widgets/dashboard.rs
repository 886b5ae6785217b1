use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame,
};

use super::{format_date, truncate};
use crate::progression::XP_PER_LEVEL;
use crate::tui::App;

pub fn draw(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(11), // Stats + daily row
            Constraint::Min(0),     // Recent attempts
        ])
        .split(area);

    let top_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[0]);

    draw_stats(f, app, top_chunks[0]);
    draw_daily(f, app, top_chunks[1]);
    draw_recent_attempts(f, app, chunks[1]);
}

fn stat_line(label: &str, value: String, color: Color) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        Span::styled(value, Style::default().fg(color)),
    ])
}

fn draw_stats(f: &mut Frame, app: &App, area: Rect) {
    let stats = &app.stats;
    let into_level = stats.total_xp % XP_PER_LEVEL;

    let text = vec![
        Line::from(vec![
            Span::styled("Level: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{}", stats.current_level),
                Style::default()
                    .fg(Color::White)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("  ({into_level}/{XP_PER_LEVEL} XP)"),
                Style::default().fg(Color::DarkGray),
            ),
        ]),
        stat_line("Total XP", stats.total_xp.to_string(), Color::Cyan),
        stat_line(
            "Rank",
            app.rank
                .rank
                .map(|r| format!("#{r}"))
                .unwrap_or_else(|| "unranked".to_string()),
            Color::Yellow,
        ),
        stat_line(
            "Questions",
            format!("{} ({} correct)", stats.total_questions, stats.correct_answers),
            Color::White,
        ),
        stat_line(
            "Accuracy",
            format!("{}%", stats.average_score),
            if stats.average_score >= 70 {
                Color::Green
            } else {
                Color::Yellow
            },
        ),
        stat_line(
            "Streak",
            format!("{} (best {})", stats.current_streak, stats.longest_streak),
            Color::Magenta,
        ),
        stat_line("Study time", format!("{} min", stats.total_study_time), Color::White),
    ];

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Progress ")
        .title_style(Style::default().fg(Color::Cyan));

    f.render_widget(Paragraph::new(text).block(block), area);
}

fn draw_daily(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .daily
        .iter()
        .map(|day| {
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<12}", day.date), Style::default().fg(Color::DarkGray)),
                Span::styled(
                    format!("{:>3} q ", day.questions_answered),
                    Style::default().fg(Color::White),
                ),
                Span::styled(
                    format!("{:>3} ok ", day.correct_answers),
                    Style::default().fg(Color::Green),
                ),
                Span::styled(format!("{:>4} xp ", day.xp_earned), Style::default().fg(Color::Cyan)),
                Span::styled(
                    truncate(&day.categories_studied.join(", "), 20),
                    Style::default().fg(Color::Gray),
                ),
            ]))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Last 7 Days ")
        .title_style(Style::default().fg(Color::Yellow));

    f.render_widget(List::new(items).block(block), area);
}

fn draw_recent_attempts(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .recent_attempts
        .iter()
        .map(|attempt| {
            let (outcome, color) = if attempt.is_correct {
                ("correct", Color::Green)
            } else {
                ("wrong", Color::Red)
            };

            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:<14}", format_date(&attempt.attempted_at)),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(
                    format!("{:<24}", truncate(&attempt.category, 22)),
                    Style::default().fg(Color::White),
                ),
                Span::styled(
                    format!("{:<8}", attempt.difficulty.as_str()),
                    Style::default().fg(Color::Cyan),
                ),
                Span::styled(format!("{outcome:<9}"), Style::default().fg(color)),
                Span::styled(
                    format!("+{} xp  {}s", attempt.xp_earned, attempt.time_spent_seconds),
                    Style::default().fg(Color::Gray),
                ),
            ]))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Recent Attempts ")
        .title_style(Style::default().fg(Color::Magenta));

    f.render_widget(List::new(items).block(block), area);
}
