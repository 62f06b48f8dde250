//! Stop-sequence filtering shared by buffered and streamed generation
//!
//! Text that might still turn into a stop sequence is held back until it
//! either completes the match or diverges. Both delivery paths run through the
//! same filter, so concatenated stream deltas equal the buffered text.

#[derive(Debug, Clone, Default)]
pub struct StopSequenceFilter {
    stops: Vec<String>,
    pending: String,
    matched: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutput {
    /// Text that can be released downstream
    pub ready: String,
    /// A stop sequence matched; generation should end
    pub stopped: bool,
}

impl StopSequenceFilter {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
            matched: None,
        }
    }

    pub fn push(&mut self, text: &str) -> FilterOutput {
        if self.matched.is_some() {
            return FilterOutput {
                ready: String::new(),
                stopped: true,
            };
        }
        self.pending.push_str(text);
        if self.stops.is_empty() {
            return FilterOutput {
                ready: std::mem::take(&mut self.pending),
                stopped: false,
            };
        }

        let earliest = self
            .stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()).map(|idx| (idx, stop)))
            .min_by_key(|(idx, _)| *idx);

        if let Some((idx, stop)) = earliest {
            let ready = self.pending[..idx].to_owned();
            self.matched = Some(stop.clone());
            self.pending.clear();
            return FilterOutput {
                ready,
                stopped: true,
            };
        }

        let hold = self.partial_match_len();
        let split = self.pending.len() - hold;
        let ready: String = self.pending.drain(..split).collect();
        FilterOutput {
            ready,
            stopped: false,
        }
    }

    /// Longest suffix of the pending text that is a proper prefix of a stop
    fn partial_match_len(&self) -> usize {
        self.stops
            .iter()
            .map(|stop| {
                let max = (stop.len().saturating_sub(1)).min(self.pending.len());
                (1..=max)
                    .rev()
                    .find(|&k| stop.is_char_boundary(k) && self.pending.ends_with(&stop[..k]))
                    .unwrap_or(0)
            })
            .max()
            .unwrap_or(0)
    }

    /// Release held-back text once generation has ended without a match.
    pub fn finish(&mut self) -> String {
        if self.matched.is_some() {
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }

    pub fn matched(&self) -> Option<&str> {
        self.matched.as_deref()
    }
}
