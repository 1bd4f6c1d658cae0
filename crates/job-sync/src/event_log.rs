//! Ordered, deduplicated event buffer for the selected job.

use std::ops::Range;

use crate::JobEvent;

/// Visible slice of the log plus the clamped selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventWindow {
    pub start: usize,
    pub end: usize,
    pub selected_index: usize,
}

impl EventWindow {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone)]
pub struct EventLog {
    events: Vec<JobEvent>,
    capacity: usize,
    // highest seq evicted for capacity; anything at or below it is stale
    evicted_through: Option<u64>,
    selected_index: usize,
    window_start: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity: capacity.max(1),
            evicted_through: None,
            selected_index: 0,
            window_start: 0,
        }
    }

    /// Inserts `event` in `seq` order. An already present `seq` keeps the
    /// existing entry; returns whether the log changed.
    pub fn ingest(&mut self, event: JobEvent) -> bool {
        if self
            .evicted_through
            .map(|floor| event.seq <= floor)
            .unwrap_or(false)
        {
            return false;
        }
        let appended = match self.events.last() {
            None => true,
            Some(last) if event.seq > last.seq => true,
            Some(_) => false,
        };
        if appended {
            self.events.push(event);
        } else {
            match self.events.binary_search_by_key(&event.seq, |e| e.seq) {
                Ok(_) => return false,
                Err(pos) => self.events.insert(pos, event),
            }
        }
        self.enforce_capacity();
        true
    }

    /// Ingests a batch; returns how many events were new.
    pub fn ingest_batch<I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = JobEvent>,
    {
        events
            .into_iter()
            .map(|event| self.ingest(event))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn reset(&mut self) {
        self.events.clear();
        self.evicted_through = None;
        self.selected_index = 0;
        self.window_start = 0;
    }

    /// Returns a slice of at most `visible_count` events that contains
    /// `selected_index`, scrolling the previous window as little as possible.
    pub fn window(&mut self, selected_index: usize, visible_count: usize) -> EventWindow {
        let len = self.events.len();
        if len == 0 || visible_count == 0 {
            self.selected_index = 0;
            self.window_start = 0;
            return EventWindow::default();
        }
        let selected = selected_index.min(len - 1);
        let max_start = len.saturating_sub(visible_count);
        let mut start = self.window_start.min(max_start);
        if selected < start {
            start = selected;
        } else if selected >= start + visible_count {
            start = selected + 1 - visible_count;
        }
        let start = start.min(max_start);
        self.selected_index = selected;
        self.window_start = start;
        EventWindow {
            start,
            end: (start + visible_count).min(len),
            selected_index: selected,
        }
    }

    pub fn slice(&self, window: &EventWindow) -> &[JobEvent] {
        let end = window.end.min(self.events.len());
        let start = window.start.min(end);
        &self.events[start..end]
    }

    pub fn max_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }

    pub fn events(&self) -> &[JobEvent] {
        &self.events
    }

    pub fn get(&self, index: usize) -> Option<&JobEvent> {
        self.events.get(index)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn selected_index(&self) -> usize {
        self.selected_index
    }

    pub fn window_start(&self) -> usize {
        self.window_start
    }

    fn enforce_capacity(&mut self) {
        if self.events.len() <= self.capacity {
            return;
        }
        let overflow = self.events.len() - self.capacity;
        let floor = self.events[overflow - 1].seq;
        self.events.drain(..overflow);
        self.evicted_through = Some(floor);
        self.selected_index = self.selected_index.saturating_sub(overflow);
        self.window_start = self.window_start.saturating_sub(overflow);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(5_000)
    }
}
