use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Accumulated wall-clock time per tag.
///
/// A tag may be started and paused several times; its total keeps growing.
#[derive(Debug, Default, Clone)]
pub struct Stopwatch {
    totals: BTreeMap<String, Duration>,
    running: BTreeMap<String, Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, tag: &str) {
        self.running.entry(tag.to_string()).or_insert_with(Instant::now);
    }

    /// Stop `tag` and return its accumulated seconds.
    pub fn pause(&mut self, tag: &str) -> f64 {
        if let Some(started) = self.running.remove(tag) {
            *self.totals.entry(tag.to_string()).or_default() += started.elapsed();
        }
        self.seconds(tag)
    }

    /// Accumulated seconds, including a currently running lap.
    pub fn seconds(&self, tag: &str) -> f64 {
        let done = self.totals.get(tag).copied().unwrap_or_default();
        let live = self
            .running
            .get(tag)
            .map(Instant::elapsed)
            .unwrap_or_default();
        (done + live).as_secs_f64()
    }
}

impl fmt::Display for Stopwatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: std::collections::BTreeSet<&String> =
            self.totals.keys().chain(self.running.keys()).collect();
        for (i, tag) in tags.into_iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{tag}={:.4}s", self.seconds(tag))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laps_accumulate_per_tag() {
        let mut watch = Stopwatch::new();
        watch.start("search");
        std::thread::sleep(Duration::from_millis(5));
        let first = watch.pause("search");
        assert!(first > 0.0);

        watch.start("search");
        let second = watch.pause("search");
        assert!(second >= first);

        assert_eq!(watch.pause("never_started"), 0.0);
        assert!(watch.to_string().contains("search="));
    }
}
