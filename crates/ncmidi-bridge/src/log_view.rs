/// UI-side scrollback for the message log.
///
/// The UI polls on a timer (~20 Hz) and calls `tick`, which drains the shared
/// `LogQueue` into a bounded local history. Appends per tick are capped so a
/// burst of MIDI traffic cannot stall the UI thread; trimming runs every third
/// tick.

use std::collections::VecDeque;

use ncmidi_protocol::log_queue::LogQueue;

use crate::config::LogSection;

pub const MIN_MAX_LINES: usize = 10;
pub const MAX_MAX_LINES: usize = 1000;
/// Granularity of the scrollback setting
pub const MAX_LINES_STEP: usize = 10;

const TRIM_EVERY_TICKS: u64 = 3;

#[derive(Debug)]
pub struct LogView {
    lines: VecDeque<String>,
    max_lines: usize,
    max_per_tick: usize,
    ticks: u64,
}

impl LogView {
    pub fn new(max_lines: usize, max_per_tick: usize) -> Self {
        let mut view = Self {
            lines: VecDeque::new(),
            max_lines: MIN_MAX_LINES,
            max_per_tick: max_per_tick.max(1),
            ticks: 0,
        };
        view.set_max_lines(max_lines);
        view
    }

    pub fn from_config(log: &LogSection) -> Self {
        Self::new(log.max_lines, log.max_per_tick)
    }

    /// Pull pending lines from `queue`. Returns the lines appended by this
    /// tick, including any the trim removed again from the scrollback.
    ///
    /// Does nothing while logging is disabled. Lines beyond `max_per_tick`
    /// in one drain are discarded.
    pub fn tick(&mut self, queue: &LogQueue) -> Vec<String> {
        if !queue.is_enabled() {
            return Vec::new();
        }

        let mut appended = queue.drain();
        appended.truncate(self.max_per_tick);
        self.lines.extend(appended.iter().cloned());

        self.ticks += 1;
        if self.ticks % TRIM_EVERY_TICKS == 0 {
            self.trim();
        }
        appended
    }

    fn trim(&mut self) {
        let excess = self.lines.len().saturating_sub(self.max_lines);
        self.lines.drain(..excess);
    }

    /// Set the scrollback, clamped to 10..=1000 and rounded to a multiple of 10.
    pub fn set_max_lines(&mut self, max_lines: usize) {
        let rounded = max_lines.saturating_add(MAX_LINES_STEP / 2);
        let stepped = rounded / MAX_LINES_STEP * MAX_LINES_STEP;
        self.max_lines = stepped.clamp(MIN_MAX_LINES, MAX_MAX_LINES);
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Newline-joined contents, oldest first.
    pub fn text(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

impl Default for LogView {
    fn default() -> Self {
        Self::from_config(&LogSection::default())
    }
}
