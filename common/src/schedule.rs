use crate::types::{Task, TimeOfDay};

/// Half-open `[start, end)` range of minutes since midnight.
///
/// Windows do not wrap past midnight: an inverted window such as
/// `22:00`-`02:00` never contains anything, and neither does `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    pub fn of(task: &Task) -> Self {
        Self::new(task.start, task.end)
    }

    pub fn contains(&self, now: TimeOfDay) -> bool {
        let now = now.minutes_since_midnight();
        self.start.minutes_since_midnight() <= now && now < self.end.minutes_since_midnight()
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

pub fn window_contains(start: &str, end: &str, now: &str) -> bool {
    match (
        TimeOfDay::parse(start),
        TimeOfDay::parse(end),
        TimeOfDay::parse(now),
    ) {
        (Some(start), Some(end), Some(now)) => TimeWindow::new(start, end).contains(now),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub device: String,
    pub high: bool,
}

pub fn evaluate(tasks: &[Task], now: TimeOfDay) -> Vec<Drive> {
    tasks
        .iter()
        .map(|task| Drive {
            device: task.device.clone(),
            high: TimeWindow::of(task).contains(now),
        })
        .collect()
}
