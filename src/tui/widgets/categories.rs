use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState},
    Frame,
};

use super::{draw_header, format_date, percent_bar, truncate};
use crate::tui::App;

fn mastery_color(mastery: i64) -> Color {
    match mastery {
        m if m >= 80 => Color::Green,
        m if m >= 50 => Color::Yellow,
        _ => Color::Red,
    }
}

pub fn draw(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .categories
        .items
        .iter()
        .map(|cat| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:<28}", truncate(&cat.category, 26)),
                    Style::default().fg(Color::White),
                ),
                Span::styled(
                    percent_bar(cat.mastery),
                    Style::default().fg(mastery_color(cat.mastery)),
                ),
                Span::styled(
                    format!(" {:>3}%  ", cat.mastery),
                    Style::default().fg(Color::Yellow),
                ),
                Span::styled(
                    format!("{:<10}", format!("{}/{}", cat.correct_answers, cat.questions_attempted)),
                    Style::default().fg(Color::White),
                ),
                Span::styled(
                    format!("{:<8}", format!("{}s", cat.average_time)),
                    Style::default().fg(Color::Gray),
                ),
                Span::styled(
                    format!("{:<8}", cat.xp_earned),
                    Style::default().fg(Color::Cyan),
                ),
                Span::styled(
                    format_date(&cat.last_attempted),
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Categories ({}) ", app.categories.items.len()))
        .title_style(Style::default().fg(Color::Cyan));

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(app.categories.selected);

    let list_area = draw_header(
        f,
        area,
        &[
            ("Category", 28),
            ("Mastery", 17),
            ("Correct", 10),
            ("Avg", 8),
            ("XP", 8),
            ("Last", 12),
        ],
    );

    f.render_stateful_widget(list, list_area, &mut state);
}
