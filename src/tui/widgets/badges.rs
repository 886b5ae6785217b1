use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState},
    Frame,
};

use super::{format_date, percent_bar, truncate};
use crate::models::{BadgeProgress, BadgeTier};
use crate::tui::App;

fn tier_color(tier: &BadgeTier) -> Color {
    match tier {
        BadgeTier::Bronze => Color::LightRed,
        BadgeTier::Silver => Color::Gray,
        BadgeTier::Gold => Color::Yellow,
        BadgeTier::Platinum => Color::Cyan,
    }
}

pub fn draw(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    draw_earned(f, app, chunks[0]);
    draw_available(f, app, chunks[1]);
}

fn draw_earned(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .earned
        .iter()
        .map(|badge| {
            ListItem::new(Line::from(vec![
                Span::styled("★ ", Style::default().fg(Color::Yellow)),
                Span::styled(
                    format!("{:<22}", truncate(&badge.name, 20)),
                    Style::default().fg(Color::White),
                ),
                Span::styled(
                    format!("+{:<5}", badge.xp_reward),
                    Style::default().fg(Color::Cyan),
                ),
                Span::styled(
                    format_date(&badge.earned_at),
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Earned ({}) ", app.earned.len()))
        .title_style(Style::default().fg(Color::Yellow));

    f.render_widget(List::new(items).block(block), area);
}

/// Progress toward the requirement as a 0-100 value.
fn completion(entry: &BadgeProgress) -> Option<i64> {
    let progress = entry.progress?;
    if entry.badge.requirement <= 0 {
        return Some(100);
    }
    Some((progress * 100 / entry.badge.requirement).min(100))
}

fn draw_available(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .available
        .items
        .iter()
        .map(|entry| {
            let progress = match (entry.progress, completion(entry)) {
                (Some(current), Some(pct)) => Span::styled(
                    format!("{} {}/{}", percent_bar(pct), current, entry.badge.requirement),
                    Style::default().fg(Color::Green),
                ),
                _ => Span::styled("untracked", Style::default().fg(Color::DarkGray)),
            };

            ListItem::new(vec![
                Line::from(vec![
                    Span::styled(
                        format!("{:<9}", entry.badge.tier.as_str()),
                        Style::default().fg(tier_color(&entry.badge.tier)),
                    ),
                    Span::styled(
                        format!("{:<22}", truncate(&entry.badge.name, 20)),
                        Style::default().fg(Color::White),
                    ),
                    progress,
                ]),
                Line::from(Span::styled(
                    format!("         {}", entry.badge.description),
                    Style::default().fg(Color::DarkGray),
                )),
            ])
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Available ({}) ", app.available.items.len()))
        .title_style(Style::default().fg(Color::Cyan));

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(app.available.selected);

    f.render_stateful_widget(list, area, &mut state);
}
