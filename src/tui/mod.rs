mod ui;
mod widgets;

use std::io;
use std::time::Duration;

use chrono::{Days, Utc};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::badges::BadgeEvaluator;
use crate::db::Database;
use crate::leaderboard::{LeaderboardRanker, MAX_PAGE_SIZE};
use crate::models::{
    Attempt, BadgeProgress, CategoryStats, DailyStats, LeaderboardEntry, UserBadge, UserRank, UserStats,
};
use crate::progression::ProgressionEngine;

const RECENT_ATTEMPTS: i64 = 8;
const DAILY_WINDOW_DAYS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Dashboard,
    Categories,
    Leaderboard,
    Badges,
}

impl View {
    fn next(&self) -> Self {
        match self {
            View::Dashboard => View::Categories,
            View::Categories => View::Leaderboard,
            View::Leaderboard => View::Badges,
            View::Badges => View::Dashboard,
        }
    }

    fn prev(&self) -> Self {
        match self {
            View::Dashboard => View::Badges,
            View::Categories => View::Dashboard,
            View::Leaderboard => View::Categories,
            View::Badges => View::Leaderboard,
        }
    }
}

pub struct StatefulList<T> {
    pub items: Vec<T>,
    pub selected: Option<usize>,
}

impl<T> StatefulList<T> {
    fn with_items(items: Vec<T>) -> Self {
        let selected = if items.is_empty() { None } else { Some(0) };
        Self { items, selected }
    }

    fn next(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let i = match self.selected {
            Some(i) if i + 1 < self.items.len() => i + 1,
            _ => 0,
        };
        self.selected = Some(i);
    }

    fn previous(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let i = match self.selected {
            Some(0) | None => self.items.len() - 1,
            Some(i) => i - 1,
        };
        self.selected = Some(i);
    }

    fn first(&mut self) {
        if !self.items.is_empty() {
            self.selected = Some(0);
        }
    }

    fn last(&mut self) {
        if !self.items.is_empty() {
            self.selected = Some(self.items.len() - 1);
        }
    }
}

pub struct App {
    db: Database,
    pub user_id: String,
    pub view: View,
    pub stats: UserStats,
    pub rank: UserRank,
    pub daily: Vec<DailyStats>,
    pub recent_attempts: Vec<Attempt>,
    pub categories: StatefulList<CategoryStats>,
    pub leaderboard: StatefulList<LeaderboardEntry>,
    pub earned: Vec<UserBadge>,
    pub available: StatefulList<BadgeProgress>,
    pub board_category: Option<String>,
    pub filter_input: String,
    pub filter_mode: bool,
    pub status: Option<String>,
    pub should_quit: bool,
}

impl App {
    pub fn new(db: Database, user_id: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut app = Self {
            db,
            user_id: user_id.to_string(),
            view: View::Dashboard,
            stats: UserStats::empty(user_id),
            rank: UserRank {
                user_id: user_id.to_string(),
                rank: None,
                total_xp: 0,
                average_accuracy: 0,
            },
            daily: Vec::new(),
            recent_attempts: Vec::new(),
            categories: StatefulList::with_items(Vec::new()),
            leaderboard: StatefulList::with_items(Vec::new()),
            earned: Vec::new(),
            available: StatefulList::with_items(Vec::new()),
            board_category: None,
            filter_input: String::new(),
            filter_mode: false,
            status: None,
            should_quit: false,
        };
        app.refresh_data()?;
        Ok(app)
    }

    pub fn refresh_data(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let since = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(DAILY_WINDOW_DAYS - 1))
            .unwrap_or_else(|| Utc::now().date_naive())
            .format("%Y-%m-%d")
            .to_string();

        self.stats = ProgressionEngine::new(&self.db).user_stats(&self.user_id)?;
        self.rank = LeaderboardRanker::new(&self.db).get_user_rank(&self.user_id)?;
        self.daily = self.db.list_daily_stats(&self.user_id, &since)?;
        self.recent_attempts = self.db.list_attempts(&self.user_id, RECENT_ATTEMPTS)?;
        self.categories = StatefulList::with_items(self.db.list_category_stats(&self.user_id)?);

        let overview = BadgeEvaluator::new(&self.db).overview(&self.user_id)?;
        self.earned = overview.earned;
        self.available = StatefulList::with_items(overview.available);

        self.load_board()
    }

    fn load_board(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let page = LeaderboardRanker::new(&self.db)
            .get_page(Some(MAX_PAGE_SIZE), self.board_category.as_deref())?;
        self.leaderboard = StatefulList::with_items(page);
        // Start on the user's own row when it is on the page
        if let Some(i) = self.leaderboard.items.iter().position(|e| e.user_id == self.user_id) {
            self.leaderboard.selected = Some(i);
        }
        Ok(())
    }

    fn apply_filter(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let input = self.filter_input.trim();
        self.board_category = if input.is_empty() {
            None
        } else {
            Some(input.to_string())
        };
        self.load_board()
    }

    fn rerank(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let summary = LeaderboardRanker::new(&self.db).refresh()?;
        self.status = Some(format!(
            "Re-ranked {} users across {} category boards",
            summary.ranked_users, summary.category_boards
        ));
        self.refresh_data()
    }

    fn current_list_next(&mut self) {
        match self.view {
            View::Categories => self.categories.next(),
            View::Leaderboard => self.leaderboard.next(),
            View::Badges => self.available.next(),
            View::Dashboard => {}
        }
    }

    fn current_list_previous(&mut self) {
        match self.view {
            View::Categories => self.categories.previous(),
            View::Leaderboard => self.leaderboard.previous(),
            View::Badges => self.available.previous(),
            View::Dashboard => {}
        }
    }

    fn handle_key(
        &mut self,
        key: KeyCode,
        modifiers: KeyModifiers,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if self.filter_mode {
            match key {
                KeyCode::Esc => {
                    self.filter_mode = false;
                    self.filter_input.clear();
                }
                KeyCode::Enter => {
                    self.filter_mode = false;
                    self.apply_filter()?;
                }
                KeyCode::Backspace => {
                    self.filter_input.pop();
                }
                KeyCode::Char(c) => {
                    self.filter_input.push(c);
                }
                _ => {}
            }
            return Ok(());
        }

        match key {
            KeyCode::Char('q') => self.should_quit = true,

            KeyCode::Char('r') if modifiers.contains(KeyModifiers::CONTROL) => {
                self.refresh_data()?;
                self.status = Some("Refreshed".to_string());
            }

            // Full re-rank of every board
            KeyCode::Char('R') if self.view == View::Leaderboard => self.rerank()?,

            KeyCode::Char('/') if self.view == View::Leaderboard => {
                self.filter_mode = true;
                self.filter_input.clear();
            }

            KeyCode::Esc if self.view == View::Leaderboard && self.board_category.is_some() => {
                self.filter_input.clear();
                self.apply_filter()?;
            }

            KeyCode::Char('h') | KeyCode::Left | KeyCode::BackTab => self.view = self.view.prev(),
            KeyCode::Char('l') | KeyCode::Right => self.view = self.view.next(),
            KeyCode::Tab => {
                if modifiers.contains(KeyModifiers::SHIFT) {
                    self.view = self.view.prev();
                } else {
                    self.view = self.view.next();
                }
            }

            KeyCode::Char('j') | KeyCode::Down => self.current_list_next(),
            KeyCode::Char('k') | KeyCode::Up => self.current_list_previous(),

            KeyCode::Char('g') => match self.view {
                View::Categories => self.categories.first(),
                View::Leaderboard => self.leaderboard.first(),
                View::Badges => self.available.first(),
                View::Dashboard => {}
            },
            KeyCode::Char('G') => match self.view {
                View::Categories => self.categories.last(),
                View::Leaderboard => self.leaderboard.last(),
                View::Badges => self.available.last(),
                View::Dashboard => {}
            },

            _ => {}
        }
        Ok(())
    }
}

pub fn run(db: Database, user_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Load before touching the terminal so lookup errors print normally
    let mut app = App::new(db, user_id)?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                app.handle_key(key.code, key.modifiers)?;
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
