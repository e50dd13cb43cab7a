//! Console feedback for the `recorder` binary.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::status::SessionStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: Option<&str>) -> Self {
        match flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    fn spinner(&self, message: String) -> Option<ProgressBar> {
        if !self.pretty() {
            return None;
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template("{spinner} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message);
        Some(spinner)
    }

    /// A named step; reports its duration when dropped.
    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = self.spinner(format!("{name}…"));
        if spinner.is_none() {
            eprintln!("==> {}", name);
        }
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
        }
    }

    /// Live session status for `view` and `record`.
    pub fn monitor(&self, title: &str) -> StatusMonitor {
        StatusMonitor {
            spinner: self.spinner(title.to_string()),
            title: title.to_string(),
            last_plain: None,
            plain_every: Duration::from_secs(1),
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub struct StatusMonitor {
    spinner: Option<ProgressBar>,
    title: String,
    last_plain: Option<Instant>,
    plain_every: Duration,
}

impl StatusMonitor {
    pub fn update(&mut self, status: &SessionStatus) {
        let mut line = format!("{} [{}]", self.title, status.state);
        for cam in status.lines() {
            line.push_str(" | ");
            line.push_str(&cam);
        }
        if let Some(fault) = &status.fault {
            line.push_str(&format!(" | error: {fault}"));
        }
        match &self.spinner {
            Some(spinner) => spinner.set_message(line),
            None => {
                // Plain output is rate limited so logs stay readable.
                if self.last_plain.map_or(true, |t| t.elapsed() >= self.plain_every) {
                    eprintln!("{line}");
                    self.last_plain = Some(Instant::now());
                }
            }
        }
    }

    pub fn finish(self, message: &str) {
        match self.spinner {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mode_never_spins() {
        assert_eq!(UiMode::parse(Some("plain")), UiMode::Plain);
        assert_eq!(UiMode::parse(None), UiMode::Auto);
        let ui = Ui::new(UiMode::Pretty, false);
        assert!(ui.spinner("x".into()).is_none());
        let ui = Ui::new(UiMode::Plain, true);
        assert!(ui.spinner("x".into()).is_none());
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
