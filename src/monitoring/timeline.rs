//! Execution Timeline
//!
//! Records when each job across the hierarchy was submitted and when it
//! finished, keyed by the job's hierarchy path (`root > subwf1 > k1`).

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Handed to the execution collaborator (or, for a sub-workflow job,
    /// its nested level started planning)
    Submitted,
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    fn is_end(self) -> bool {
        !matches!(self, Self::Submitted)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub job: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Event log of one planning run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, job: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            job: job.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Jobs whose last recorded event is `event_type`.
    pub fn jobs_ending_with(&self, event_type: EventType) -> Vec<&str> {
        let mut last: BTreeMap<&str, EventType> = BTreeMap::new();
        for event in &self.events {
            last.insert(&event.job, event.event_type);
        }
        last.into_iter()
            .filter(|(_, t)| *t == event_type)
            .map(|(job, _)| job)
            .collect()
    }

    /// Start/end offsets in milliseconds for every job that finished.
    fn spans(&self) -> Vec<(String, u128, u128)> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.is_end() {
                if let Some(start) = starts.remove(event.job.as_str()) {
                    spans.push((event.job.clone(), start, elapsed));
                }
            } else {
                starts.insert(&event.job, elapsed);
            }
        }

        spans.sort_by_key(|(_, start, _)| *start);
        spans
    }

    /// Job durations in milliseconds.
    pub fn durations(&self) -> BTreeMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(job, start, end)| (job, end - start))
            .collect()
    }

    /// Generates an ASCII Gantt chart, 50 columns wide.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        let scale = 50.0 / total_time as f64;
        let spans = self.spans();
        let width = spans
            .iter()
            .map(|(job, _, _)| job.chars().count())
            .max()
            .unwrap_or(0)
            .clamp(8, 32);

        for (job, start, end) in spans {
            let start_pos = (start as f64 * scale) as usize;
            let duration = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(duration));

            output.push_str(&format!(
                "{} |{}| ({} ms)\n",
                truncate(&job, width),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or cuts `s` to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
