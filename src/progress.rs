//! Console output for the interactive client
//!
//! Server lines are coloured by status prefix; a progress bar tracks chunk
//! transfers in either direction and keeps lines printed while it is live
//! above it.

use crossterm::{
    cursor,
    style::{Color, Stylize},
    terminal::{self, ClearType},
    ExecutableCommand,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::time::Instant;

use crate::protocol::reply;

pub const PROMPT: &str = "ftp> ";

pub struct TransferBar {
    bar: ProgressBar,
    start_time: Instant,
}

impl TransferBar {
    pub fn new(label: &str, total_chunks: u64) -> Self {
        let bar = ProgressBar::new(total_chunks);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:30.green/white}] {pos}/{len} chunks ({percent}%) {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    pub fn set_length(&self, total_chunks: u64) {
        self.bar.set_length(total_chunks);
    }

    pub fn set_position(&self, done: u64) {
        self.bar.set_position(done);
    }

    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }

    /// Print a line above the bar.
    pub fn println(&self, line: &str) {
        self.bar.println(line);
    }

    pub fn finish_success(&self, what: &str, bytes: u64) {
        let secs = self.start_time.elapsed().as_secs_f64();
        let rate = if secs > 0.0 {
            bytes as f64 / secs / 1_048_576.0
        } else {
            0.0
        };
        self.bar.finish_and_clear();
        println!(
            "{} {} ({:.2} MB in {:.1}s, {:.1} MB/s)",
            "Completed".with(Color::Green).bold(),
            what,
            bytes as f64 / 1_048_576.0,
            secs,
            rate
        );
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar.abandon();
        println!("{} {}", "Failed".with(Color::Red).bold(), msg);
    }
}

/// Colour a server line by its status prefix.
pub fn status_line(line: &str) -> String {
    if line.starts_with(reply::ERROR) {
        line.with(Color::Red).to_string()
    } else if line.starts_with(reply::SUCCESS) || line.starts_with(reply::OK) {
        line.with(Color::Green).to_string()
    } else {
        line.to_string()
    }
}

pub fn prompt() {
    print!("{PROMPT}");
    let _ = io::stdout().flush();
}

pub fn info(msg: &str) {
    println!("{}", msg.with(Color::Blue));
}

pub fn success(msg: &str) {
    println!("{}", msg.with(Color::Green));
}

pub fn error(msg: &str) {
    println!("{}", msg.with(Color::Red));
}

pub fn clear_screen() {
    let mut out = io::stdout();
    let _ = out.execute(terminal::Clear(ClearType::All));
    let _ = out.execute(cursor::MoveTo(0, 0));
}

pub fn print_help() {
    println!("{}", "Available commands:".with(Color::Yellow));
    for (cmd, what) in [
        ("get <filename>", "Download a file from the server"),
        ("send <filename>", "Upload a file to the server"),
        ("list", "List files on the server"),
        ("pwd", "Print current working directory on the server"),
        ("cd <directory>", "Change directory on the server"),
        ("delete <filename>", "Delete a file on the server"),
        ("rename <old> <new>", "Rename a file on the server"),
        ("health", "Show server health information"),
        ("help", "Show this help message"),
        ("clear", "Clear the console"),
        ("exit", "Exit the client"),
    ] {
        println!("  {} - {}", cmd.with(Color::Cyan), what);
    }
}
