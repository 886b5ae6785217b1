use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs},
    Frame,
};

use super::widgets::{badges, categories, dashboard, leaderboard};
use super::{App, View};

pub fn draw(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Tab bar
            Constraint::Min(0),    // Content
            Constraint::Length(1), // Help bar
        ])
        .split(f.area());

    draw_tabs(f, app, chunks[0]);
    draw_content(f, app, chunks[1]);
    draw_help_bar(f, app, chunks[2]);
}

fn draw_tabs(f: &mut Frame, app: &App, area: Rect) {
    let tab_titles = vec!["Dashboard", "Categories", "Leaderboard", "Badges"];
    let selected = match app.view {
        View::Dashboard => 0,
        View::Categories => 1,
        View::Leaderboard => 2,
        View::Badges => 3,
    };

    let tabs = Tabs::new(tab_titles)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Docdot: {} ", app.user_id)),
        )
        .select(selected)
        .style(Style::default().fg(Color::White))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        );

    f.render_widget(tabs, area);
}

fn draw_content(f: &mut Frame, app: &App, area: Rect) {
    match app.view {
        View::Dashboard => dashboard::draw(f, app, area),
        View::Categories => categories::draw(f, app, area),
        View::Leaderboard => leaderboard::draw(f, app, area),
        View::Badges => badges::draw(f, app, area),
    }
}

fn key(label: &'static str) -> Span<'static> {
    Span::styled(label, Style::default().fg(Color::Cyan))
}

fn draw_help_bar(f: &mut Frame, app: &App, area: Rect) {
    let help_text = if app.filter_mode {
        vec![
            Span::styled("category /", Style::default().fg(Color::Yellow)),
            Span::raw(&app.filter_input),
            Span::styled("█", Style::default().fg(Color::Yellow)),
            Span::raw(" | "),
            key("<CR>"),
            Span::raw(" Apply  "),
            key("<Esc>"),
            Span::raw(" Cancel"),
        ]
    } else {
        let mut spans = vec![key("h/l"), Span::raw(" Views  ")];

        match app.view {
            View::Dashboard => {}
            View::Categories | View::Badges => {
                spans.extend(vec![
                    key("j/k"),
                    Span::raw(" Nav  "),
                    key("g/G"),
                    Span::raw(" Top/Bot  "),
                ]);
            }
            View::Leaderboard => {
                spans.extend(vec![
                    key("j/k"),
                    Span::raw(" Nav  "),
                    key("/"),
                    Span::raw(" Category  "),
                    key("R"),
                    Span::raw(" Re-rank  "),
                ]);
                if app.board_category.is_some() {
                    spans.extend(vec![key("<Esc>"), Span::raw(" Global  ")]);
                }
            }
        }

        spans.extend(vec![
            key("^r"),
            Span::raw(" Refresh  "),
            key("q"),
            Span::raw(" Quit"),
        ]);

        if let Some(status) = &app.status {
            spans.push(Span::styled(
                format!("  | {status}"),
                Style::default().fg(Color::Green),
            ));
        }

        spans
    };

    let help = Paragraph::new(Line::from(help_text)).style(Style::default().bg(Color::DarkGray));

    f.render_widget(help, area);
}
