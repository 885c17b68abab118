//! Execution Timeline
//!
//! Records scheduler events per step (dispatch, relaunch, termination) so a
//! run can be summarized as a lane chart after it finishes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// First launch of a step
    Dispatched,
    /// A launch of a background step returned
    Finished,
    /// A launch returned an error
    Failed,
    /// A background step was launched again
    Relaunched,
    /// A step started waiting on a live dependency
    Waiting,
    /// Foreground step returned normally
    Completed,
    /// Step reached `max_time_out`
    TimeoutTerminated,
    /// Step stopped relaunching
    EndOfLife,
    /// A leftover handle was cancelled
    Cancelled,
}

impl EventType {
    /// Events after which a step no longer changes state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::Completed | EventType::TimeoutTerminated | EventType::EndOfLife
        )
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Ordered log of scheduler events.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, step_id: &str, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.to_string(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Events of one step, in order.
    pub fn events_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a TimelineEvent> {
        self.events.iter().filter(move |e| e.step_id == step_id)
    }

    /// Number of events of a type recorded for a step.
    pub fn count(&self, step_id: &str, event_type: EventType) -> usize {
        self.events_for(step_id)
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Lifetime of each step, from its dispatch to its terminal event.
    ///
    /// Steps still without a terminal event are omitted.
    pub fn get_durations(&self) -> HashMap<String, Duration> {
        self.lanes()
            .into_iter()
            .filter_map(|lane| lane.end.map(|end| (lane.step_id, end.saturating_sub(lane.start))))
            .collect()
    }

    fn lanes(&self) -> Vec<Lane> {
        let mut lanes: Vec<Lane> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        for event in &self.events {
            let offset = event.timestamp.saturating_duration_since(self.start_time);
            match event.event_type {
                EventType::Dispatched => {
                    index.entry(event.step_id.as_str()).or_insert_with(|| {
                        lanes.push(Lane {
                            step_id: event.step_id.clone(),
                            start: offset,
                            end: None,
                            relaunches: 0,
                            failures: 0,
                        });
                        lanes.len() - 1
                    });
                }
                other => {
                    let Some(&i) = index.get(event.step_id.as_str()) else {
                        continue;
                    };
                    let lane = &mut lanes[i];
                    match other {
                        EventType::Relaunched => lane.relaunches += 1,
                        EventType::Failed => lane.failures += 1,
                        t if t.is_terminal() && lane.end.is_none() => lane.end = Some(offset),
                        _ => {}
                    }
                }
            }
        }

        lanes
    }

    /// Renders an ASCII lane chart, one row per step in dispatch order.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.elapsed();
        if total.is_zero() {
            return output;
        }

        let scale = 50.0 / total.as_secs_f64();
        for lane in self.lanes() {
            let end = lane.end.unwrap_or(total);
            let start_pos = (lane.start.as_secs_f64() * scale) as usize;
            let width = ((end.saturating_sub(lane.start)).as_secs_f64() * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| {} ms, {} relaunches, {} failures\n",
                truncate(&lane.step_id, 12),
                bar,
                end.saturating_sub(lane.start).as_millis(),
                lane.relaunches,
                lane.failures
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total.as_millis()));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

struct Lane {
    step_id: String,
    start: Duration,
    end: Option<Duration>,
    relaunches: usize,
    failures: usize,
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::default();
        assert!(timeline.get_events().is_empty());
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_count_and_events_for() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("bg", EventType::Dispatched);
        timeline.add_event("fg", EventType::Dispatched);
        timeline.add_event("bg", EventType::Relaunched);
        timeline.add_event("bg", EventType::Relaunched);
        timeline.add_event("fg", EventType::Completed);

        assert_eq!(timeline.count("bg", EventType::Relaunched), 2);
        assert_eq!(timeline.count("fg", EventType::Relaunched), 0);
        assert_eq!(timeline.events_for("bg").count(), 3);
    }

    #[test]
    fn test_durations_span_dispatch_to_terminal() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("bg", EventType::Dispatched);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("bg", EventType::Relaunched);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("bg", EventType::TimeoutTerminated);
        timeline.add_event("bg", EventType::Cancelled);

        let durations = timeline.get_durations();
        assert!(durations["bg"] >= Duration::from_millis(60));
    }

    #[test]
    fn test_durations_skip_unfinished() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("bg", EventType::Dispatched);
        timeline.add_event("bg", EventType::Finished);

        assert!(!timeline.get_durations().contains_key("bg"));
    }

    #[test]
    fn test_events_before_dispatch_are_ignored() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("ghost", EventType::EndOfLife);
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("boot", EventType::Dispatched);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("boot", EventType::Completed);
        timeline.add_event("stress", EventType::Dispatched);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("stress", EventType::Relaunched);
        timeline.add_event("stress", EventType::Failed);
        timeline.add_event("stress", EventType::EndOfLife);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("boot"));
        assert!(chart.contains("stress"));
        assert!(chart.contains("1 relaunches, 1 failures"));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate_long_ids() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a_very_long_step_id", 8), "a_ver...");
    }

    #[test]
    fn test_terminal_event_types() {
        assert!(EventType::Completed.is_terminal());
        assert!(EventType::TimeoutTerminated.is_terminal());
        assert!(EventType::EndOfLife.is_terminal());
        assert!(!EventType::Relaunched.is_terminal());
        assert!(!EventType::Cancelled.is_terminal());
    }
}
