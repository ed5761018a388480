//! Turns the ordered recognition stream into subtitle cues.
//!
//! Three layers, all fed incrementally by [`SubtitleMerger::push`]:
//!
//! 1. consecutive results with similar text form a run,
//! 2. a finished run becomes a segment; short interruptions between two
//!    similar text segments are absorbed as flicker,
//! 3. a segment that can no longer grow is finalized into a cue, subject to
//!    the minimum duration and the no-overlap rule.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SubtitleGeneratorConfig;
use crate::recognition::RecognitionResult;
use crate::similarity::is_similar;
use crate::video::FrameClock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtitleCue {
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

impl SubtitleCue {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub results: usize,
    pub runs: usize,
    pub bridged_gaps: usize,
    pub dropped_short: usize,
    pub overlaps: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeOutput {
    pub cues: Vec<SubtitleCue>,
    pub warnings: Vec<String>,
    pub stats: MergeStats,
}

/// Texts seen in a run or segment, in first-seen order, weighted by frames.
#[derive(Debug, Clone, Default)]
struct Tally(Vec<(String, usize)>);

impl Tally {
    fn add(&mut self, text: &str, frames: usize) {
        match self.0.iter_mut().find(|(seen, _)| seen == text) {
            Some((_, count)) => *count += frames,
            None => self.0.push((text.to_string(), frames)),
        }
    }

    fn absorb(&mut self, other: Tally) {
        for (text, count) in other.0 {
            self.add(&text, count);
        }
    }

    /// Most frequent text; ties go to the one seen first.
    fn representative(&self) -> &str {
        let mut best: Option<&(String, usize)> = None;
        for entry in &self.0 {
            if best.is_none_or(|b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(text, _)| text.as_str()).unwrap_or("")
    }
}

#[derive(Debug)]
struct Run {
    first: u64,
    last: u64,
    tally: Tally,
}

#[derive(Debug)]
struct Segment {
    tally: Tally,
    start: Duration,
    end: Duration,
}

impl Segment {
    fn text(&self) -> &str {
        self.tally.representative()
    }

    fn is_empty(&self) -> bool {
        self.text().is_empty()
    }
}

pub struct SubtitleMerger {
    threshold: f64,
    max_gap: Duration,
    max_gap_segments: usize,
    min_duration: Duration,
    clock: FrameClock,
    run: Option<Run>,
    pending: Option<Segment>,
    gap: Vec<Segment>,
    last_end: Option<Duration>,
    ready: Vec<SubtitleCue>,
    output: MergeOutput,
}

impl SubtitleMerger {
    pub fn new(config: &SubtitleGeneratorConfig, clock: FrameClock) -> Self {
        Self {
            threshold: config.similarity_threshold,
            max_gap: millis(config.min_consecutive_sub_dur_ms),
            max_gap_segments: config.max_consecutive_short_durs,
            min_duration: millis(config.min_sub_duration_ms),
            clock,
            run: None,
            pending: None,
            gap: Vec::new(),
            last_end: None,
            ready: Vec::new(),
            output: MergeOutput::default(),
        }
    }

    /// Feeds the next result. Results must arrive in frame order.
    pub fn push(&mut self, result: &RecognitionResult) {
        self.output.stats.results += 1;
        let text = result.text.trim();
        if let Some(run) = &mut self.run
            && same_cue(run.tally.representative(), text, self.threshold)
        {
            run.last = result.frame_index;
            run.tally.add(text, 1);
            return;
        }
        self.close_run();
        let mut tally = Tally::default();
        tally.add(text, 1);
        self.run = Some(Run {
            first: result.frame_index,
            last: result.frame_index,
            tally,
        });
    }

    /// Cues finalized so far; they will not change any more.
    pub fn take_ready(&mut self) -> Vec<SubtitleCue> {
        std::mem::take(&mut self.ready)
    }

    /// Flushes everything still open and returns every cue not yet taken.
    pub fn finish(mut self) -> MergeOutput {
        self.close_run();
        while let Some(pending) = self.pending.take() {
            self.finalize(pending);
            for segment in std::mem::take(&mut self.gap) {
                self.process(segment);
            }
        }
        self.gap.clear();
        let mut output = std::mem::take(&mut self.output);
        output.cues = std::mem::take(&mut self.ready);
        output
    }

    fn close_run(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        self.output.stats.runs += 1;
        let segment = Segment {
            start: self.clock.timestamp(run.first),
            end: self.clock.end_after(run.last),
            tally: run.tally,
        };
        self.process(segment);
    }

    fn process(&mut self, segment: Segment) {
        if self.pending.is_none() {
            // Nothing to bridge to: leading empties vanish, text starts a cue.
            if !segment.is_empty() {
                self.pending = Some(segment);
            }
            return;
        }
        let Some(pending) = self.pending.as_mut() else {
            return;
        };

        if !segment.is_empty() && is_similar(pending.text(), segment.text(), self.threshold) {
            if !self.gap.is_empty() {
                self.output.stats.bridged_gaps += 1;
                debug!(
                    text = pending.text(),
                    interruptions = self.gap.len(),
                    "Bridging flicker"
                );
            }
            self.gap.clear();
            pending.end = segment.end;
            pending.tally.absorb(segment.tally);
            return;
        }

        self.gap.push(segment);
        if self.gap_within_limits() {
            return;
        }
        if let Some(pending) = self.pending.take() {
            self.finalize(pending);
        }
        for segment in std::mem::take(&mut self.gap) {
            self.process(segment);
        }
    }

    fn gap_within_limits(&self) -> bool {
        let (Some(first), Some(last)) = (self.gap.first(), self.gap.last()) else {
            return true;
        };
        self.gap.len() <= self.max_gap_segments
            && last.end.saturating_sub(first.start) <= self.max_gap
    }

    fn finalize(&mut self, segment: Segment) {
        let text = segment.text().to_string();
        let mut start = segment.start;
        let end = segment.end;

        if let Some(previous_end) = self.last_end
            && start < previous_end
        {
            self.output.stats.overlaps += 1;
            let message = format!(
                "cue '{text}' started at {start:?}, before the previous cue ended at {previous_end:?}; start moved"
            );
            warn!("{message}");
            self.output.warnings.push(message);
            start = previous_end;
        }

        if end <= start || end - start < self.min_duration {
            self.output.stats.dropped_short += 1;
            debug!(text = %text, ?start, ?end, "Dropping short cue");
            return;
        }

        self.last_end = Some(end);
        self.ready.push(SubtitleCue { start, end, text });
    }
}

fn same_cue(current: &str, next: &str, threshold: f64) -> bool {
    match (current.is_empty(), next.is_empty()) {
        (true, true) => true,
        (false, false) => is_similar(current, next, threshold),
        _ => false,
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_nanos((ms.max(0.0) * 1_000_000.0).round() as u64)
}

/// Merges a complete, ordered result sequence in one call.
pub fn merge_results(
    results: &[RecognitionResult],
    config: &SubtitleGeneratorConfig,
    clock: FrameClock,
) -> MergeOutput {
    let mut merger = SubtitleMerger::new(config, clock);
    let mut cues = Vec::new();
    for result in results {
        merger.push(result);
        cues.extend(merger.take_ready());
    }
    let mut output = merger.finish();
    cues.append(&mut output.cues);
    output.cues = cues;
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(texts: &[&str]) -> Vec<RecognitionResult> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| RecognitionResult::new(i as u64, *text, 0.9))
            .collect()
    }

    fn clock(frames: usize) -> FrameClock {
        FrameClock::new(10.0, 1, frames as u64)
    }

    #[test]
    fn representative_is_most_frequent_then_earliest() {
        let mut tally = Tally::default();
        tally.add("Hel1o", 1);
        tally.add("Hello", 2);
        tally.add("Hel1o", 1);
        assert_eq!(tally.representative(), "Hel1o");
        tally.add("Hello", 1);
        assert_eq!(tally.representative(), "Hello");
    }

    #[test]
    fn similar_ocr_variants_share_one_cue() {
        let input = results(&["", "", "Hello world", "Hello wor1d", "Hello world", "", "", "", "", "", "", ""]);
        let output = merge_results(&input, &SubtitleGeneratorConfig::default(), clock(input.len()));
        assert_eq!(
            output.cues,
            vec![SubtitleCue {
                start: Duration::from_millis(200),
                end: Duration::from_millis(500),
                text: "Hello world".into(),
            }]
        );
    }

    #[test]
    fn long_gap_splits_cues() {
        let mut texts = vec!["Hello"; 5];
        texts.extend(vec![""; 8]);
        texts.extend(vec!["Hello"; 5]);
        let input = results(&texts);
        let output = merge_results(&input, &SubtitleGeneratorConfig::default(), clock(input.len()));
        assert_eq!(output.cues.len(), 2);
        assert_eq!(output.cues[0].end, Duration::from_millis(500));
        assert_eq!(output.cues[1].start, Duration::from_millis(1300));
    }

    #[test]
    fn short_cues_are_dropped() {
        let input = results(&["", "Blip", "", "", "", "", "", "", "Stays", "Stays", "Stays"]);
        let output = merge_results(&input, &SubtitleGeneratorConfig::default(), clock(input.len()));
        assert_eq!(output.cues.len(), 1);
        assert_eq!(output.cues[0].text, "Stays");
        assert_eq!(output.stats.dropped_short, 1);
    }

    #[test]
    fn short_dissimilar_interruption_is_bridged() {
        let mut texts = vec!["Hello there"; 6];
        texts.push("Noise");
        texts.extend(vec!["Hello there"; 6]);
        let input = results(&texts);
        let output = merge_results(&input, &SubtitleGeneratorConfig::default(), clock(input.len()));
        assert_eq!(output.cues.len(), 1);
        assert_eq!(output.cues[0].duration(), Duration::from_millis(1300));
        assert_eq!(output.stats.bridged_gaps, 1);
    }

    #[test]
    fn streaming_releases_finished_cues_early() {
        let config = SubtitleGeneratorConfig::default();
        let mut merger = SubtitleMerger::new(&config, clock(30));
        let mut released = Vec::new();
        for (i, text) in ["First"; 5]
            .iter()
            .chain(["Second"; 10].iter())
            .chain(["Third"].iter())
            .enumerate()
        {
            merger.push(&RecognitionResult::new(i as u64, *text, 0.9));
            released.extend(merger.take_ready());
        }
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].text, "First");
        // "Third" is a single 100 ms frame and falls under the minimum.
        let output = merger.finish();
        assert_eq!(output.cues.len(), 1);
        assert_eq!(output.cues[0].text, "Second");
        assert_eq!(output.stats.dropped_short, 1);
    }
}
