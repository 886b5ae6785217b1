use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame,
};

use super::{draw_header, truncate};
use crate::tui::App;

pub fn draw(f: &mut Frame, app: &App, area: Rect) {
    let title = match &app.board_category {
        Some(category) => format!(" Leaderboard: {category} "),
        None => " Leaderboard ".to_string(),
    };

    let items: Vec<ListItem> = app
        .leaderboard
        .items
        .iter()
        .map(|entry| {
            let is_me = entry.user_id == app.user_id;
            let name_style = if is_me {
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::White)
            };
            let rank_color = match entry.rank {
                1 => Color::Yellow,
                2 => Color::White,
                3 => Color::LightRed,
                _ => Color::DarkGray,
            };
            let name = entry.full_name.as_deref().unwrap_or(&entry.user_id);

            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<6}", format!("#{}", entry.rank)), Style::default().fg(rank_color)),
                Span::styled(format!("{:<26}", truncate(name, 24)), name_style),
                Span::styled(format!("{:<10}", entry.total_xp), Style::default().fg(Color::Cyan)),
                Span::styled(
                    format!("{:<10}", format!("{}%", entry.average_score)),
                    Style::default().fg(Color::Green),
                ),
                Span::styled(format!("{:<10}", entry.total_questions), Style::default().fg(Color::White)),
                Span::styled(entry.current_level.to_string(), Style::default().fg(Color::Magenta)),
            ]))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .title_style(Style::default().fg(Color::Yellow));

    if items.is_empty() {
        let empty = Paragraph::new("No ranked users yet. Press R to re-rank.")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        f.render_widget(empty, area);
        return;
    }

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(app.leaderboard.selected);

    let list_area = draw_header(
        f,
        area,
        &[
            ("Rank", 6),
            ("User", 26),
            ("XP", 10),
            ("Accuracy", 10),
            ("Questions", 10),
            ("Level", 6),
        ],
    );

    f.render_stateful_widget(list, list_area, &mut state);
}
