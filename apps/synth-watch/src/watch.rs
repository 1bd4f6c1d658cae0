//! Turns successive snapshots into terminal lines.

use std::collections::HashSet;

use job_sync::{Health, JobEvent, JobStatus, Snapshot, StreamState};

#[derive(Debug, Default)]
pub struct Printer {
    job_count: Option<usize>,
    selected: Option<String>,
    status: Option<JobStatus>,
    health: Option<Health>,
    stream_state: Option<StreamState>,
    printed: HashSet<u64>,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines describing what changed since the previous snapshot.
    pub fn render(&mut self, snapshot: &Snapshot) -> Vec<String> {
        let mut lines = Vec::new();

        if self.job_count != Some(snapshot.jobs.len()) {
            self.job_count = Some(snapshot.jobs.len());
            lines.push(format!("jobs: {} listed", snapshot.jobs.len()));
        }

        if self.selected != snapshot.selected {
            self.selected = snapshot.selected.clone();
            self.status = None;
            self.stream_state = None;
            self.printed.clear();
            match &self.selected {
                Some(job_id) => lines.push(format!("watching {job_id}")),
                None => lines.push("no job selected".to_string()),
            }
        }

        let status = snapshot.job.as_ref().map(|job| job.status);
        if status.is_some() && self.status != status {
            self.status = status;
            if let Some(job) = &snapshot.job {
                let reward = job
                    .best_reward
                    .map(|reward| format!(" best_reward={reward:.4}"))
                    .unwrap_or_default();
                lines.push(format!("{} status: {}{reward}", job.job_id, job.status));
            }
        }

        if self.health != Some(snapshot.health) || self.stream_state != Some(snapshot.stream_state)
        {
            self.health = Some(snapshot.health);
            self.stream_state = Some(snapshot.stream_state);
            let error = snapshot
                .last_error
                .as_deref()
                .map(|err| format!(" ({err})"))
                .unwrap_or_default();
            lines.push(format!(
                "health: {} stream: {}{error}",
                snapshot.health, snapshot.stream_state
            ));
        }

        // late events can fill gaps below the newest printed seq
        for event in snapshot.events.iter() {
            if self.printed.insert(event.seq) {
                lines.push(event_line(event));
            }
        }
        if let Some(oldest) = snapshot.events.first() {
            self.printed.retain(|seq| *seq >= oldest.seq);
        }
        lines
    }
}

fn event_line(event: &JobEvent) -> String {
    let level = event.level.as_deref().unwrap_or("info");
    let kind = if event.event_type.is_empty() {
        "event"
    } else {
        event.event_type.as_str()
    };
    format!("[{:>6}] {kind} {level}: {}", event.seq, event.message)
}
