//! Console progress bar for file transfers.

use fsync_core::TransferProgress;
use std::io::Write;
use std::time::{Duration, Instant};

const BAR_WIDTH: usize = 30;

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// One line: `name [#####-----]  50% 1.0 KiB/2.0 KiB 00:03`.
pub fn render_line(name: &str, done: u64, total: u64, elapsed: Duration) -> String {
    let ratio = if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    };
    let filled = ((ratio * BAR_WIDTH as f64) as usize).min(BAR_WIDTH);
    format!(
        "{name} [{}{}] {:>3}% {}/{} {}",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        (ratio * 100.0) as u32,
        format_bytes(done),
        format_bytes(total),
        format_elapsed(elapsed),
    )
}

/// Redraws a single status line on a writer (stderr by default).
pub struct ConsoleProgress<W: Write + Send> {
    out: W,
    started: Instant,
    last_percent: Option<u32>,
}

impl ConsoleProgress<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> ConsoleProgress<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            started: Instant::now(),
            last_percent: None,
        }
    }

    fn draw(&mut self, name: &str, done: u64, total: u64) {
        let line = render_line(name, done, total, self.started.elapsed());
        // Progress output is best effort
        let _ = write!(self.out, "\r{line}");
        let _ = self.out.flush();
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> TransferProgress for ConsoleProgress<W> {
    fn on_start(&mut self, name: &str, total: u64) {
        self.started = Instant::now();
        self.last_percent = None;
        self.draw(name, 0, total);
    }

    fn on_progress(&mut self, name: &str, done: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (done * 100 / total) as u32
        };
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            self.draw(name, done, total);
        }
    }

    fn on_finish(&mut self, name: &str, total: u64) {
        self.draw(name, total, total);
        let _ = writeln!(self.out);
    }
}
