//! Interactive terminal debugger.
//!
//! [`TerminalDebugger`] plugs into the VM's step hook. While stepping it
//! stops before every instruction and shows the listing, the operand and
//! context stacks and the current stack trace.
//!
//! Keys: `s`/Enter step, `c` continue to the next breakpoint, `b` toggle a
//! breakpoint on the current line, `t` toggle the stack panes, `q`/Esc halt.

use std::collections::HashSet;
use std::io::{self, Stdout};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use tracing::warn;

use crate::vm::debug::current_trace;
use crate::vm::{DebugCommand, DebugState, Debugger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Step,
    Continue,
}

/// What the debugger saw at the last stop.
#[derive(Debug, Default)]
struct Snapshot {
    pc: usize,
    line: Option<u32>,
    stack: Vec<String>,
    contexts: Vec<String>,
    trace: Vec<String>,
    status: String,
}

/// Debugger state, independent of the terminal.
#[derive(Debug)]
pub struct Session {
    bytecode: String,
    listing: Vec<String>,
    mode: Mode,
    breakpoints: HashSet<u32>,
    show_stack: bool,
    status: String,
    snapshot: Snapshot,
    list_state: ListState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            bytecode: String::new(),
            listing: Vec::new(),
            mode: Mode::Step,
            breakpoints: HashSet::new(),
            show_stack: true,
            status: "s: step  c: continue  b: breakpoint  t: stacks  q: quit".to_string(),
            snapshot: Snapshot::default(),
            list_state: ListState::default(),
        }
    }

    pub fn toggle_breakpoint(&mut self, line: u32) {
        if !self.breakpoints.remove(&line) {
            self.breakpoints.insert(line);
        }
    }

    pub fn is_stepping(&self) -> bool {
        self.mode == Mode::Step
    }

    /// Whether to stop before the instruction in `state`.
    pub fn should_pause(&self, state: &DebugState<'_>) -> bool {
        self.mode == Mode::Step
            || state
                .instruction
                .line
                .is_some_and(|line| self.breakpoints.contains(&line))
    }

    /// Record the VM state for display.
    pub fn observe(&mut self, state: &DebugState<'_>) {
        if self.bytecode != state.bytecode.name() || self.listing.len() != state.bytecode.len() {
            self.bytecode = state.bytecode.name().to_string();
            self.listing = state
                .bytecode
                .instructions()
                .iter()
                .map(|i| i.to_string().replace('\n', " "))
                .collect();
        }
        let line = state
            .bytecode
            .instructions()
            .iter()
            .take(state.pc + 1)
            .rev()
            .find_map(|i| i.line);
        self.snapshot = Snapshot {
            pc: state.pc,
            line,
            stack: state.stack.iter().rev().map(|v| format!("{:?}", v)).collect(),
            contexts: state.contexts.iter().rev().map(|c| c.to_string()).collect(),
            trace: current_trace().frames.iter().rev().map(|f| f.to_string()).collect(),
            status: state.status.to_string(),
        };
        self.list_state.select(Some(state.pc));
    }

    /// React to a key. `Some` ends the pause.
    pub fn handle_key(&mut self, key: KeyCode) -> Option<DebugCommand> {
        match key {
            KeyCode::Char('s') | KeyCode::Enter => {
                self.mode = Mode::Step;
                Some(DebugCommand::Proceed)
            }
            KeyCode::Char('c') => {
                self.mode = Mode::Continue;
                Some(DebugCommand::Proceed)
            }
            KeyCode::Char('q') | KeyCode::Esc => Some(DebugCommand::Halt),
            KeyCode::Char('t') => {
                self.show_stack = !self.show_stack;
                None
            }
            KeyCode::Char('b') => {
                match self.snapshot.line {
                    Some(line) => {
                        self.toggle_breakpoint(line);
                        self.status = format!("Breakpoints: {:?}", self.sorted_breakpoints());
                    }
                    None => self.status = "No line information here".to_string(),
                }
                None
            }
            KeyCode::Char(c) => {
                self.status = format!("Unknown key '{}'", c);
                None
            }
            _ => None,
        }
    }

    fn sorted_breakpoints(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self.breakpoints.iter().copied().collect();
        lines.sort_unstable();
        lines
    }

    fn ui(&mut self, frame: &mut Frame) {
        let constraints = if self.show_stack {
            vec![Constraint::Min(8), Constraint::Length(10), Constraint::Length(3)]
        } else {
            vec![Constraint::Min(8), Constraint::Length(3)]
        };
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(frame.area());

        let items: Vec<ListItem> = self
            .listing
            .iter()
            .enumerate()
            .map(|(ix, text)| {
                let marker = if ix == self.snapshot.pc { "▶" } else { " " };
                ListItem::new(format!("{}{:4} {}", marker, ix, text))
            })
            .collect();
        let title = format!("Bytecode: {} [{}]", self.bytecode, self.snapshot.status);
        let listing = List::new(items)
            .block(Block::default().title(title).borders(Borders::ALL))
            .highlight_style(Style::default().bg(Color::DarkGray));
        frame.render_stateful_widget(listing, chunks[0], &mut self.list_state);

        if self.show_stack {
            let panes = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([
                    Constraint::Percentage(40),
                    Constraint::Percentage(25),
                    Constraint::Percentage(35),
                ])
                .split(chunks[1]);
            let pane = |title: &str, lines: &[String]| {
                Paragraph::new(lines.join("\n"))
                    .block(Block::default().title(title.to_string()).borders(Borders::ALL))
            };
            frame.render_widget(pane("Stack", &self.snapshot.stack), panes[0]);
            frame.render_widget(pane("Contexts", &self.snapshot.contexts), panes[1]);
            frame.render_widget(pane("Trace", &self.snapshot.trace), panes[2]);
        }

        let status = Paragraph::new(self.status.clone())
            .block(Block::default().title("Status").borders(Borders::ALL));
        frame.render_widget(status, chunks[chunks.len() - 1]);
    }
}

/// Full-screen stepping debugger. The terminal is restored on drop.
pub struct TerminalDebugger {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    session: Session,
}

impl TerminalDebugger {
    pub fn new() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        stdout.execute(EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        Ok(Self {
            terminal,
            session: Session::new(),
        })
    }

    fn pause(&mut self) -> io::Result<DebugCommand> {
        let Self { terminal, session } = self;
        loop {
            terminal.draw(|frame| session.ui(frame))?;
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if let Some(command) = session.handle_key(key.code) {
                    return Ok(command);
                }
            }
        }
    }
}

impl Debugger for TerminalDebugger {
    fn step_before(&mut self, state: &DebugState<'_>) -> DebugCommand {
        if !self.session.should_pause(state) {
            return DebugCommand::Proceed;
        }
        self.session.observe(state);
        match self.pause() {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "debugger terminal failed, halting");
                DebugCommand::Halt
            }
        }
    }
}

impl Drop for TerminalDebugger {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = self.terminal.backend_mut().execute(LeaveAlternateScreen);
    }
}
