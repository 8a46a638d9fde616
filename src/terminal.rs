//! Headless terminal binding for one session.
//!
//! Wraps `alacritty_terminal::Term`. The supervisor only pushes bytes in and
//! reads a few things out; nothing is rendered here.
//!
//! ```text
//! process output ──► Emulator::feed ──► vte Processor ──► Term
//!                                                          │ Event (listener)
//!                                                          ▼
//!                    Vec<EngineEvent> ◄── translate ◄── std mpsc
//! ```
//!
//! `PtyWrite` and color-query answers come back as [`EngineEvent::Reply`];
//! the caller writes them to the process.

use std::sync::mpsc;

use alacritty_terminal::Term;
use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line};
use alacritty_terminal::term::Config;
use alacritty_terminal::term::color::{COUNT as COLOR_COUNT, Colors};
use alacritty_terminal::vte::ansi::{NamedColor, Processor, Rgb};

/// What a chunk of output did to the terminal, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TitleChanged(String),
    Bell,
    ClipboardText(String),
    ColorsChanged,
    /// Bytes the terminal wants sent back to the process.
    Reply(String),
}

struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl TermSize {
    fn new(columns: usize, screen_lines: usize) -> Self {
        Self {
            columns: columns.max(2),
            screen_lines: screen_lines.max(1),
        }
    }
}

impl Dimensions for TermSize {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }
    fn screen_lines(&self) -> usize {
        self.screen_lines
    }
    fn columns(&self) -> usize {
        self.columns
    }
}

// --- Event listener ----------------------------------------------------------

/// Queues engine events until `feed` drains them.
struct EngineListener(mpsc::Sender<Event>);

impl EventListener for EngineListener {
    fn send_event(&self, event: Event) {
        let _ = self.0.send(event);
    }
}

// --- Emulator ----------------------------------------------------------------

pub struct Emulator {
    term: Term<EngineListener>,
    processor: Processor,
    events: mpsc::Receiver<Event>,
    title: String,
}

impl Emulator {
    pub fn new(columns: usize, rows: usize, scrollback: usize) -> Self {
        let (tx, events) = mpsc::channel();
        let config = Config {
            scrolling_history: scrollback,
            ..Config::default()
        };
        let term = Term::new(config, &TermSize::new(columns, rows), EngineListener(tx));
        Self {
            term,
            processor: Processor::new(),
            events,
            title: String::new(),
        }
    }

    /// Advance the terminal with process output.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<EngineEvent> {
        let colors_before = palette(self.term.colors());
        self.processor.advance(&mut self.term, bytes);

        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                Event::Title(title) => {
                    self.title = title.clone();
                    out.push(EngineEvent::TitleChanged(title));
                }
                Event::ResetTitle => {
                    self.title.clear();
                    out.push(EngineEvent::TitleChanged(String::new()));
                }
                Event::Bell => out.push(EngineEvent::Bell),
                Event::ClipboardStore(_, text) => out.push(EngineEvent::ClipboardText(text)),
                Event::PtyWrite(reply) => out.push(EngineEvent::Reply(reply)),
                Event::ColorRequest(index, format) => {
                    let rgb = color_or_default(self.term.colors(), index);
                    out.push(EngineEvent::Reply(format(rgb)));
                }
                _ => {}
            }
        }

        if palette(self.term.colors()) != colors_before {
            out.push(EngineEvent::ColorsChanged);
        }
        out
    }

    /// Latest title set by the program, empty if none.
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn resize(&mut self, columns: usize, rows: usize) {
        self.term.resize(TermSize::new(columns, rows));
    }

    pub fn columns(&self) -> usize {
        self.term.columns()
    }

    pub fn rows(&self) -> usize {
        self.term.screen_lines()
    }

    /// Visible screen as text, trailing blanks trimmed.
    pub fn screen_text(&self) -> String {
        let grid = self.term.grid();
        let mut lines: Vec<String> = (0..self.term.screen_lines())
            .map(|row| {
                let line = &grid[Line(row as i32)];
                let text: String = (0..self.term.columns())
                    .map(|col| line[Column(col)].c)
                    .collect();
                text.trim_end().to_string()
            })
            .collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    /// Palette entry as currently set, `None` if the program never set it.
    pub fn color(&self, index: usize) -> Option<Rgb> {
        (index < COLOR_COUNT).then(|| self.term.colors()[index]).flatten()
    }
}

// --- Palette defaults (xterm) -------------------------------------------------

fn palette(colors: &Colors) -> Vec<Option<Rgb>> {
    (0..COLOR_COUNT).map(|i| colors[i]).collect()
}

fn color_or_default(colors: &Colors, index: usize) -> Rgb {
    if index >= COLOR_COUNT {
        return DEFAULT_FG;
    }
    colors[index].unwrap_or_else(|| default_color(index))
}

const DEFAULT_FG: Rgb = Rgb { r: 0xe5, g: 0xe5, b: 0xe5 };
const DEFAULT_BG: Rgb = Rgb { r: 0, g: 0, b: 0 };

const ANSI_16: [Rgb; 16] = [
    Rgb { r: 0x00, g: 0x00, b: 0x00 },
    Rgb { r: 0xcd, g: 0x00, b: 0x00 },
    Rgb { r: 0x00, g: 0xcd, b: 0x00 },
    Rgb { r: 0xcd, g: 0xcd, b: 0x00 },
    Rgb { r: 0x00, g: 0x00, b: 0xee },
    Rgb { r: 0xcd, g: 0x00, b: 0xcd },
    Rgb { r: 0x00, g: 0xcd, b: 0xcd },
    Rgb { r: 0xe5, g: 0xe5, b: 0xe5 },
    Rgb { r: 0x7f, g: 0x7f, b: 0x7f },
    Rgb { r: 0xff, g: 0x00, b: 0x00 },
    Rgb { r: 0x00, g: 0xff, b: 0x00 },
    Rgb { r: 0xff, g: 0xff, b: 0x00 },
    Rgb { r: 0x5c, g: 0x5c, b: 0xff },
    Rgb { r: 0xff, g: 0x00, b: 0xff },
    Rgb { r: 0x00, g: 0xff, b: 0xff },
    Rgb { r: 0xff, g: 0xff, b: 0xff },
];

fn default_color(index: usize) -> Rgb {
    match index {
        0..16 => ANSI_16[index],
        // 6x6x6 cube
        16..232 => {
            let i = (index - 16) as u8;
            let level = |v: u8| if v == 0 { 0 } else { 55 + v * 40 };
            Rgb {
                r: level(i / 36),
                g: level((i / 6) % 6),
                b: level(i % 6),
            }
        }
        // Grayscale ramp
        232..256 => {
            let v = 8 + (index - 232) as u8 * 10;
            Rgb { r: v, g: v, b: v }
        }
        i if i == NamedColor::Background as usize => DEFAULT_BG,
        _ => DEFAULT_FG,
    }
}
