//! Estimated-time-remaining calculation for container task subtitles.

use std::time::Instant;

#[derive(Debug)]
pub(crate) struct Progress {
    started: Instant,
    initial: usize,
    completed: usize,
    total: usize,
}

impl Progress {
    pub(crate) fn new(initial: usize, total: usize) -> Progress {
        Progress {
            started: Instant::now(),
            initial,
            completed: initial,
            total,
        }
    }

    pub(crate) fn update(&mut self, n: usize) {
        self.completed += n;
    }

    pub(crate) fn grow_total(&mut self, n: usize) {
        self.total += n;
    }

    /// `"2m 5s remaining (1.3s/item)"`, or a placeholder until at least one
    /// item has completed since tracking started.
    pub(crate) fn remaining_phrase(&self) -> String {
        let done_here = self.completed.saturating_sub(self.initial);
        if done_here == 0 {
            return "estimating time remaining".to_string();
        }
        let per_item = self.started.elapsed().as_secs_f64() / done_here as f64;
        let remaining = self.total.saturating_sub(self.completed) as f64 * per_item;
        format!(
            "{} remaining ({:.1}s/item)",
            format_duration(remaining),
            per_item
        )
    }
}

fn format_duration(secs: f64) -> String {
    let secs = secs.round() as u64;
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_until_first_completion() {
        let p = Progress::new(0, 10);
        assert_eq!(p.remaining_phrase(), "estimating time remaining");
    }

    #[test]
    fn estimates_after_progress() {
        let mut p = Progress::new(0, 10);
        p.update(5);
        assert!(p.remaining_phrase().contains("remaining"));
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3725.0), "1h 2m");
    }
}
