//! Live run progress.
//!
//! The scheduler and attempts report through [`ProgressSink`]; rendering is
//! the sink's problem. The terminal sink keeps one status line per active
//! group with a spinner and a short log tail, collapses queued groups into
//! a single count, and repaints in place on stderr. The plain sink prints
//! one line per state change for logs and CI.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crossterm::{
    cursor::{Hide, MoveToColumn, MoveUp, Show},
    execute,
    terminal::{Clear, ClearType},
};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const TAIL_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Waiting,
    Running,
    Passed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Passed => "passed",
            TaskStatus::Failed => "failed",
        }
    }

    // Display order: finished groups float to the top, queue stays at the
    // bottom.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Failed => 0,
            TaskStatus::Passed => 1,
            TaskStatus::Running => 2,
            TaskStatus::Waiting => 3,
        }
    }
}

/// Where attempts report progress.
pub trait ProgressSink: Send + Sync {
    fn add_task(&self, name: &str);
    fn set_status(&self, name: &str, status: TaskStatus);
    fn set_message(&self, name: &str, message: &str);
    fn log_line(&self, name: &str, line: &str);
    /// Periodic repaint hook; driven by the scheduler, no-op by default.
    fn tick(&self) {}
    /// Final repaint once the run is over.
    fn finish(&self);
}

/// A sink handle bound to one task name.
#[derive(Clone)]
pub struct TaskProgress {
    sink: Arc<dyn ProgressSink>,
    name: String,
}

impl TaskProgress {
    pub fn new(sink: Arc<dyn ProgressSink>, name: impl Into<String>) -> Self {
        TaskProgress {
            sink,
            name: name.into(),
        }
    }

    pub fn status(&self, status: TaskStatus) {
        self.sink.set_status(&self.name, status);
    }

    pub fn message(&self, message: &str) {
        self.sink.set_message(&self.name, message);
    }

    pub fn log(&self, line: &str) {
        self.sink.log_line(&self.name, line);
    }
}

/// One line per state change, no repainting. For non-tty runs.
pub struct PlainProgress;

impl ProgressSink for PlainProgress {
    fn add_task(&self, _name: &str) {}

    fn set_status(&self, name: &str, status: TaskStatus) {
        eprintln!("{name}: {}", status.as_str());
    }

    fn set_message(&self, _name: &str, _message: &str) {}

    fn log_line(&self, _name: &str, _line: &str) {}

    fn finish(&self) {}
}

struct Bar {
    name: String,
    status: TaskStatus,
    message: String,
    tail: VecDeque<String>,
}

struct Board {
    bars: Vec<Bar>,
    frame: usize,
    last_render_lines: u16,
    cursor_hidden: bool,
    done: bool,
}

/// In-place terminal board on stderr.
pub struct TermProgress {
    board: Mutex<Board>,
}

impl TermProgress {
    pub fn new() -> Self {
        TermProgress {
            board: Mutex::new(Board {
                bars: Vec::new(),
                frame: 0,
                last_render_lines: 0,
                cursor_hidden: false,
                done: false,
            }),
        }
    }

    fn render(&self, advance_frame: bool) {
        let Ok(mut board) = self.board.lock() else {
            return;
        };
        if board.done {
            return;
        }
        if !board.cursor_hidden {
            let _ = execute!(io::stderr(), Hide);
            board.cursor_hidden = true;
        }
        if advance_frame {
            board.frame = board.frame.wrapping_add(1);
        }
        Self::paint(&mut board);
    }

    fn paint(board: &mut Board) {
        let cols = crossterm::terminal::size()
            .map(|(w, _)| w as usize)
            .unwrap_or(80);

        let mut order: Vec<usize> = (0..board.bars.len()).collect();
        order.sort_by_key(|&i| (board.bars[i].status.rank(), board.bars[i].name.clone()));

        let mut lines: Vec<String> = Vec::new();
        let mut waiting = 0usize;
        for &i in &order {
            let bar = &board.bars[i];
            if bar.status == TaskStatus::Waiting {
                waiting += 1;
                continue;
            }
            lines.push(render_bar_line(bar, board.frame, cols));
            if bar.status == TaskStatus::Running {
                for tail_line in &bar.tail {
                    lines.push(clip_to_width(&format!("    {tail_line}"), cols));
                }
            }
        }
        if waiting > 0 {
            lines.push(format!("{waiting} more in queue..."));
        }

        let mut err = io::stderr();
        if board.last_render_lines > 0 {
            let _ = execute!(
                err,
                MoveToColumn(0),
                MoveUp(board.last_render_lines),
                Clear(ClearType::FromCursorDown)
            );
        }
        let mut frame_buf = String::new();
        for line in &lines {
            frame_buf.push_str(line);
            frame_buf.push('\n');
        }
        let _ = err.write_all(frame_buf.as_bytes());
        let _ = err.flush();
        board.last_render_lines = u16::try_from(lines.len()).unwrap_or(u16::MAX);
    }

    fn with_bar(&self, name: &str, f: impl FnOnce(&mut Bar)) {
        let Ok(mut board) = self.board.lock() else {
            return;
        };
        if let Some(bar) = board.bars.iter_mut().find(|b| b.name == name) {
            f(bar);
        }
    }
}

impl Default for TermProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TermProgress {
    fn add_task(&self, name: &str) {
        if let Ok(mut board) = self.board.lock() {
            board.bars.push(Bar {
                name: name.to_string(),
                status: TaskStatus::Waiting,
                message: String::new(),
                tail: VecDeque::new(),
            });
        }
    }

    fn set_status(&self, name: &str, status: TaskStatus) {
        self.with_bar(name, |bar| bar.status = status);
        self.render(false);
    }

    fn set_message(&self, name: &str, message: &str) {
        self.with_bar(name, |bar| bar.message = message.to_string());
        self.render(false);
    }

    fn log_line(&self, name: &str, line: &str) {
        self.with_bar(name, |bar| {
            for piece in line.lines() {
                bar.tail.push_back(piece.to_string());
                while bar.tail.len() > TAIL_LINES {
                    bar.tail.pop_front();
                }
            }
        });
    }

    fn tick(&self) {
        self.render(true);
    }

    fn finish(&self) {
        {
            let Ok(mut board) = self.board.lock() else {
                return;
            };
            if board.done {
                return;
            }
            // Last paint shows final states; tails are dropped with the
            // spinner.
            Self::paint(&mut board);
            board.done = true;
            if board.cursor_hidden {
                let _ = execute!(io::stderr(), Show);
                board.cursor_hidden = false;
            }
        }
    }
}

fn render_bar_line(bar: &Bar, frame: usize, cols: usize) -> String {
    let symbol = match bar.status {
        TaskStatus::Passed => "✓",
        TaskStatus::Failed => "✗",
        _ => SPINNER_FRAMES[frame % SPINNER_FRAMES.len()],
    };
    let right = if bar.message.is_empty() {
        symbol.to_string()
    } else {
        format!("{symbol} - {}", bar.message)
    };
    let name_part = format!("{}: ", bar.name);
    let padding = cols.saturating_sub(name_part.width() + right.width());
    clip_to_width(&format!("{name_part}{}{right}", " ".repeat(padding)), cols)
}

/// Truncate to a display width, not a char count.
fn clip_to_width(s: &str, max_cols: usize) -> String {
    let mut used = 0usize;
    let mut out = String::new();
    for ch in s.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > max_cols {
            break;
        }
        used += w;
        out.push(ch);
    }
    out
}

/// Event log sink for tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
impl ProgressSink for RecordingProgress {
    fn add_task(&self, name: &str) {
        self.push(format!("add {name}"));
    }

    fn set_status(&self, name: &str, status: TaskStatus) {
        self.push(format!("status {name} {}", status.as_str()));
    }

    fn set_message(&self, name: &str, message: &str) {
        self.push(format!("message {name} {message}"));
    }

    fn log_line(&self, name: &str, line: &str) {
        self.push(format!("log {name} {line}"));
    }

    fn finish(&self) {
        self.push("finish".to_string());
    }
}
