pub mod badges;
pub mod categories;
pub mod dashboard;
pub mod leaderboard;

use chrono::DateTime;
use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

/// Draws a bold column header on the first row inside `area`'s border and
/// returns the area left for the list below it.
pub fn draw_header(f: &mut Frame, area: Rect, columns: &[(&str, usize)]) -> Rect {
    let style = Style::default()
        .fg(Color::DarkGray)
        .add_modifier(Modifier::BOLD);
    // Leading pad lines up with the "> " highlight symbol
    let mut spans = vec![Span::raw("  ")];
    spans.extend(
        columns
            .iter()
            .map(|(label, width)| Span::styled(format!("{label:<width$}"), style)),
    );

    let header_area = Rect {
        x: area.x + 1,
        y: area.y + 1,
        width: area.width.saturating_sub(2),
        height: 1,
    };
    f.render_widget(Paragraph::new(Line::from(spans)), header_area);

    Rect {
        x: area.x,
        y: area.y + 1,
        width: area.width,
        height: area.height.saturating_sub(1),
    }
}

/// Ten-cell bar for a 0-100 value.
pub fn percent_bar(value: i64) -> String {
    let filled = (value.clamp(0, 100) / 10) as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

pub fn format_date(date_str: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        dt.format("%b %d %H:%M").to_string()
    } else {
        date_str.chars().take(10).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_bar_clamps() {
        assert_eq!(percent_bar(0), "░░░░░░░░░░");
        assert_eq!(percent_bar(55), "█████░░░░░");
        assert_eq!(percent_bar(250), "██████████");
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("Anatomy", 10), "Anatomy");
        assert_eq!(truncate("Cardiovascular system", 10), "Cardiov...");
        assert_eq!(truncate("Žučna kesa i jetra", 8), "Žučna...");
    }

    #[test]
    fn format_date_falls_back_to_prefix() {
        assert_eq!(format_date("2024-03-05T10:20:00+00:00"), "Mar 05 10:20");
        assert_eq!(format_date("2024-03-05 junk"), "2024-03-05");
    }
}
