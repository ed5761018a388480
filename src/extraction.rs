//! Frame Extraction Pool: decode, crop and store sampled frames.

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::area::SubtitleArea;
use crate::cache::FrameStore;
use crate::error::{DecodeError, FailureRecord};
use crate::progress::{CancellationToken, ProgressHandle, Stage};
use crate::video::VideoSource;

/// Indices `start, start + step, …` below `stop`.
pub fn frame_indices(start: u64, stop: u64, step: u64) -> Vec<u64> {
    (start..stop).step_by(step.max(1) as usize).collect()
}

/// Splits ordered indices into ordered batches of at most `batch_size`.
pub fn partition(indices: &[u64], batch_size: usize) -> Vec<FrameBatch> {
    indices
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(ordinal, frames)| FrameBatch {
            ordinal,
            frames: frames.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub ordinal: usize,
    pub frames: Vec<u64>,
}

/// A fully processed extraction batch. Every index of the input batch is in
/// exactly one of `stored` or `failed`.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBatch {
    pub ordinal: usize,
    pub stored: Vec<u64>,
    pub failed: Vec<u64>,
    pub failures: Vec<FailureRecord>,
}

impl ExtractedBatch {
    /// All frames of the batch in ascending order, flagged by availability.
    pub fn frames(&self) -> Vec<(u64, bool)> {
        let mut frames: Vec<(u64, bool)> = self
            .stored
            .iter()
            .map(|&i| (i, true))
            .chain(self.failed.iter().map(|&i| (i, false)))
            .collect();
        frames.sort_unstable_by_key(|(index, _)| *index);
        frames
    }
}

/// Decodes, crops and stores every frame of `batch`. A frame that fails is
/// recorded and skipped; siblings are unaffected.
pub fn extract_batch(
    source: &dyn VideoSource,
    area: &SubtitleArea,
    store: &FrameStore,
    batch: &FrameBatch,
) -> ExtractedBatch {
    let mut extracted = ExtractedBatch {
        ordinal: batch.ordinal,
        ..Default::default()
    };
    for &index in &batch.frames {
        let stored = source
            .get_frame(index)
            .and_then(|frame| {
                store
                    .put(index, &area.crop(&frame))
                    .map_err(|err| DecodeError::new(index, err.to_string()))
            });
        match stored {
            Ok(_) => extracted.stored.push(index),
            Err(err) => {
                warn!(frame = index, error = %err, "Frame skipped");
                extracted.failures.push(FailureRecord::decode(&err));
                extracted.failed.push(index);
            }
        }
    }
    trace!(
        batch = batch.ordinal,
        stored = extracted.stored.len(),
        failed = extracted.failed.len(),
        "Extraction batch done"
    );
    extracted
}

pub struct ExtractionWorker<'a> {
    pub id: usize,
    pub source: &'a dyn VideoSource,
    pub area: SubtitleArea,
    pub store: FrameStore,
    pub cancel: CancellationToken,
    pub progress: ProgressHandle,
}

impl ExtractionWorker<'_> {
    /// Pulls batches until the queue is drained, the run is cancelled, or
    /// the consumer hangs up.
    pub fn run(self, queue: Receiver<FrameBatch>, output: Sender<ExtractedBatch>) {
        let mut processed = 0usize;
        while let Ok(batch) = queue.recv() {
            if self.cancel.is_cancelled() {
                debug!(worker = self.id, "Extraction worker cancelled");
                break;
            }
            let extracted = extract_batch(self.source, &self.area, &self.store, &batch);
            self.progress.batch_completed(Stage::FrameExtraction);
            processed += 1;
            if output.send(extracted).is_err() {
                break;
            }
        }
        debug!(worker = self.id, batches = processed, "Extraction worker finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_step_and_range() {
        assert_eq!(frame_indices(3, 12, 4), vec![3, 7, 11]);
        assert_eq!(frame_indices(0, 5, 0), vec![0, 1, 2, 3, 4]);
        assert!(frame_indices(5, 5, 2).is_empty());
    }

    #[test]
    fn partition_keeps_order() {
        let batches = partition(&[0, 2, 4, 6, 8], 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], FrameBatch { ordinal: 2, frames: vec![8] });
        assert_eq!(batches[1].frames, vec![4, 6]);
    }

    #[test]
    fn frames_are_merged_in_index_order() {
        let extracted = ExtractedBatch {
            ordinal: 0,
            stored: vec![10, 14],
            failed: vec![12],
            failures: Vec::new(),
        };
        assert_eq!(extracted.frames(), vec![(10, true), (12, false), (14, true)]);
    }
}
