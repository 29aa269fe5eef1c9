use std::{borrow::Cow, fmt, sync::Arc, thread};

use backtrace::Backtrace;
use refguard_common::rand::back_off;

use super::config::DEFAULT_TRACE_COUNT;

/// One recorded use of a tracked object.
pub(crate) struct TraceRecord {
    message: Option<String>,
    thread: Option<String>,
    backtrace: Backtrace,
}

impl TraceRecord {
    /// Symbols are resolved only if the record is ever rendered.
    #[inline(never)]
    pub(crate) fn capture(message: Option<String>) -> Self {
        Self {
            message,
            thread: thread::current().name().map(str::to_owned),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub(crate) fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, suppressed: &[Cow<'static, str>]) -> fmt::Result {
        if let Some(message) = &self.message {
            writeln!(f, "\tHint: {message}")?;
        }
        if let Some(thread) = &self.thread {
            writeln!(f, "\tThread: {thread}")?;
        }
        let mut backtrace = self.backtrace.clone();
        backtrace.resolve();
        for symbol in backtrace.frames().iter().flat_map(|frame| frame.symbols()) {
            let name = match symbol.name() {
                Some(name) => name.to_string(),
                None => continue,
            };
            if suppressed.iter().any(|s| name.contains(s.as_ref())) {
                continue;
            }
            match (symbol.filename(), symbol.lineno()) {
                (Some(file), Some(line)) => writeln!(f, "\tat {name} ({}:{line})", file.display())?,
                _ => writeln!(f, "\tat {name}")?,
            }
        }
        Ok(())
    }
}

/// Bounded history of a tracked object's allocation and use sites.
///
/// Index 0 is always the allocation record. Once the log is full the newest
/// record overwrites the most recent one, except that with a chance halving on
/// every further record the oldest use record is evicted instead, so earlier
/// history occasionally survives next to the latest call.
pub(crate) struct TraceLog {
    records: Vec<TraceRecord>,
    capacity: usize,
    seen: usize,
    suppressed: Arc<[Cow<'static, str>]>,
}

impl TraceLog {
    pub(crate) fn new(capacity: usize, suppressed: Arc<[Cow<'static, str>]>) -> Self {
        debug_assert!(capacity >= 1);
        Self {
            // grow on demand, capacity may be huge
            records: Vec::with_capacity(capacity.min(DEFAULT_TRACE_COUNT)),
            capacity,
            seen: 0,
            suppressed,
        }
    }

    pub(crate) fn record(&mut self, record: TraceRecord) {
        self.seen += 1;
        if self.records.len() < self.capacity {
            self.records.push(record);
            return;
        }
        if self.capacity == 1 {
            return;
        }
        let overflow = self.seen - 1 - self.capacity;
        if back_off(u32::try_from(overflow).unwrap_or(u32::MAX)) {
            self.records.remove(1);
            self.records.push(record);
        } else if let Some(last) = self.records.last_mut() {
            *last = record;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn records(&self) -> &[TraceRecord] {
        &self.records
    }
}

impl fmt::Display for TraceLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((created, uses)) = self.records.split_first() else {
            return Ok(());
        };
        writeln!(f)?;
        if !uses.is_empty() {
            writeln!(f, "Recent access records:")?;
            for (i, record) in uses.iter().rev().enumerate() {
                writeln!(f, "#{}:", i + 1)?;
                record.render(f, &self.suppressed)?;
            }
        }
        writeln!(f, "Created at:")?;
        created.render(f, &self.suppressed)?;
        let discarded = self.seen - self.records.len();
        if discarded > 0 {
            write!(
                f,
                "\t{discarded} access records were discarded because at most {} are kept.",
                self.capacity
            )?;
        }
        Ok(())
    }
}
