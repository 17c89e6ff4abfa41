//! Terminal dashboard of per-site results.

use std::io::{self, Stdout};
use std::time::Duration;

use ate_tm::console::{CommandError, Console};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::{Frame, Terminal};

const HELP: &str = "r: run  b: background judge  q: quit";

/// Takes over the terminal until the operator quits.
pub fn run(console: &mut Console) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = event_loop(&mut terminal, console);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    console: &mut Console,
) -> io::Result<()> {
    let mut status = String::from(HELP);
    loop {
        terminal.draw(|frame| draw(frame, console, &status))?;

        if !event::poll(Duration::from_millis(250))? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                KeyCode::Char('r') => status = describe(console.process_command("<RUN>")),
                KeyCode::Char('b') => status = describe(console.process_command("<BGJ>")),
                _ => {}
            }
        }
    }
}

fn describe(result: Result<Option<String>, CommandError>) -> String {
    match result {
        Ok(Some(response)) => format!("{}   ({})", response, HELP),
        Ok(None) => String::from(HELP),
        Err(e) => format!("error: {}   ({})", e, HELP),
    }
}

fn verdict_cell(passed: bool) -> Cell<'static> {
    if passed {
        Cell::from("PASS").style(Style::default().fg(Color::Green))
    } else {
        Cell::from("FAIL").style(Style::default().fg(Color::Red))
    }
}

fn draw(frame: &mut Frame, console: &Console, status: &str) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(3),
        ])
        .split(frame.size());

    let executor = console.executor();
    let limits = executor
        .resolved()
        .map(|resolved| resolved.limits.to_string())
        .unwrap_or_else(|| String::from("not configured"));
    let header = Paragraph::new(format!(
        "suite {}   phase {:?}   generation {}   pending background {}   limits {}",
        console.tester().test_suite,
        executor.phase(),
        console.last_generation(),
        executor.pending_background(),
        limits
    ))
    .block(Block::default().borders(Borders::ALL).title("Test method"));
    frame.render_widget(header, chunks[0]);

    let rows: Vec<Row> = console
        .last_verdicts()
        .iter()
        .map(|verdict| {
            Row::new(vec![
                Cell::from(verdict.site.to_string()),
                verdict_cell(verdict.functional),
                verdict_cell(verdict.parametric),
                Cell::from(format!("{:.6}", verdict.value)),
                verdict_cell(verdict.passed()),
            ])
        })
        .collect();
    let widths = [
        Constraint::Length(6),
        Constraint::Length(12),
        Constraint::Length(12),
        Constraint::Length(14),
        Constraint::Length(8),
    ];
    let table = Table::new(rows, widths)
        .header(
            Row::new(vec!["Site", "Functional", "Parametric", "Value", "Result"])
                .style(Style::default().add_modifier(Modifier::BOLD)),
        )
        .block(Block::default().borders(Borders::ALL).title("Sites"));
    frame.render_widget(table, chunks[1]);

    let footer = Paragraph::new(status.to_string()).block(Block::default().borders(Borders::ALL));
    frame.render_widget(footer, chunks[2]);
}
