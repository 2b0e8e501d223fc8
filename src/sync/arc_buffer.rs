//! Word arcs streamed from one search pass to the next.
//!
//! A producer appends arcs in start-frame order and commits each start frame
//! once no further arc can start there. Consumers iterate by start frame and
//! block until the frame they need is committed or the producer finalizes.

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::model::lm::LanguageModel;
use crate::sync::sync_array::{SyncArray, SyncReader};
use crate::types::WordId;

/// One word hypothesis spanning `[src_frame, dest_frame]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WordArc {
    /// First frame of the word.
    pub src_frame: usize,
    /// Last frame of the word (inclusive).
    pub dest_frame: usize,
    /// The word.
    pub word: WordId,
    /// Acoustic score, or 0 when the buffer does not keep scores.
    pub score: i32,
}

/// Arc stream between two passes, plus the producer's metadata.
pub struct ArcBuffer {
    name: String,
    arcs: Arc<SyncArray<WordArc>>,
    frame_ends: Arc<SyncArray<usize>>,
    lm: Option<Arc<dyn LanguageModel>>,
    keep_scores: bool,
}

impl std::fmt::Debug for ArcBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcBuffer")
            .field("name", &self.name)
            .field("arcs", &self.arcs)
            .field("frames", &self.frame_ends)
            .field("keep_scores", &self.keep_scores)
            .finish()
    }
}

impl ArcBuffer {
    /// Create a buffer. `lm` is the model the producer scored with, if any.
    pub fn new(name: &str, lm: Option<Arc<dyn LanguageModel>>, keep_scores: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            arcs: SyncArray::new(format!("{}.arcs", name)),
            frame_ends: SyncArray::new(format!("{}.frames", name)),
            lm,
            keep_scores,
        })
    }

    /// Buffer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Language model retained from the producer.
    pub fn lm(&self) -> Option<&Arc<dyn LanguageModel>> {
        self.lm.as_ref()
    }

    /// Whether arcs carry acoustic scores.
    pub fn keep_scores(&self) -> bool {
        self.keep_scores
    }

    /// Append an arc whose start frame is not yet committed.
    pub fn push(&self, arc: WordArc) -> Result<usize> {
        let arc = if self.keep_scores {
            arc
        } else {
            WordArc { score: 0, ..arc }
        };
        self.arcs.append(arc)
    }

    /// Commit the next start frame: every arc starting there has been pushed.
    /// Returns the committed frame.
    pub fn commit_frame(&self) -> Result<usize> {
        let end = self.arcs.next_idx();
        self.frame_ends.append(end)
    }

    /// Number of committed start frames.
    pub fn committed_frames(&self) -> usize {
        self.frame_ends.next_idx()
    }

    /// Total arcs pushed.
    pub fn n_arcs(&self) -> usize {
        self.arcs.next_idx()
    }

    /// End of stream. Arcs first, so readers never see committed frames
    /// beyond the final arc count.
    pub fn finalize(&self) -> Result<()> {
        self.arcs.finalize()?;
        let frames = self.frame_ends.finalize()?;
        debug!(buffer = %self.name, arcs = self.arcs.next_idx(), frames, "Arc buffer finalized");
        Ok(())
    }

    /// Whether the producer has finalized.
    pub fn is_finalized(&self) -> bool {
        self.frame_ends.is_finalized()
    }

    /// Register a consumer.
    pub fn reader(self: &Arc<Self>) -> Result<ArcReader> {
        Ok(ArcReader {
            buffer: Arc::clone(self),
            arcs: self.arcs.retain()?,
            frames: self.frame_ends.retain()?,
            ends: Vec::new(),
        })
    }
}

/// A consumer's view of an [`ArcBuffer`], iterating by start frame.
#[derive(Debug)]
pub struct ArcReader {
    buffer: Arc<ArcBuffer>,
    arcs: SyncReader<WordArc>,
    frames: SyncReader<usize>,
    ends: Vec<usize>,
}

impl ArcReader {
    /// The buffer being read.
    pub fn buffer(&self) -> &Arc<ArcBuffer> {
        &self.buffer
    }

    /// Block until `frame` is committed. `false` means the stream ended first.
    pub fn wait_frame(&mut self, frame: usize) -> Result<bool> {
        while self.ends.len() <= frame {
            let next = self.ends.len();
            match self.buffer.frame_ends.wait_get(next)? {
                Some(end) => {
                    self.ends.push(end);
                    self.frames.release_to(next + 1)?;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Start frames known to be committed so far (without blocking).
    pub fn known_frames(&self) -> usize {
        self.ends.len()
    }

    /// Arc index range of a committed frame.
    pub fn frame_range(&self, frame: usize) -> Option<Range<usize>> {
        let end = *self.ends.get(frame)?;
        let start = if frame == 0 { 0 } else { self.ends[frame - 1] };
        Some(start..end)
    }

    /// Arcs starting at `frame`, blocking until it is committed.
    /// `None` once the stream has ended before `frame`.
    pub fn frame_arcs(&mut self, frame: usize) -> Result<Option<Vec<WordArc>>> {
        if !self.wait_frame(frame)? {
            return Ok(None);
        }
        let Some(range) = self.frame_range(frame) else {
            return Ok(None);
        };
        let mut arcs = Vec::with_capacity(range.len());
        for idx in range {
            if let Some(arc) = self.buffer.arcs.get(idx)? {
                arcs.push(arc);
            }
        }
        Ok(Some(arcs))
    }

    /// Let the buffer collect arcs starting before `frame`.
    pub fn release_before(&mut self, frame: usize) -> Result<()> {
        if frame == 0 {
            return Ok(());
        }
        let frame = frame.min(self.ends.len());
        if frame == 0 {
            return Ok(());
        }
        let end = self.ends[frame - 1];
        self.arcs.release_to(end)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn arc(sf: usize, ef: usize, w: u32) -> WordArc {
        WordArc {
            src_frame: sf,
            dest_frame: ef,
            word: WordId(w),
            score: -10,
        }
    }

    #[test]
    fn test_frame_iteration() {
        let buffer = ArcBuffer::new("test", None, true);
        let mut reader = buffer.reader().unwrap();
        buffer.push(arc(0, 3, 1)).unwrap();
        buffer.push(arc(0, 4, 2)).unwrap();
        assert_eq!(buffer.commit_frame().unwrap(), 0);
        assert_eq!(buffer.commit_frame().unwrap(), 1);
        buffer.push(arc(2, 5, 3)).unwrap();
        buffer.commit_frame().unwrap();
        buffer.finalize().unwrap();

        assert_eq!(reader.frame_arcs(0).unwrap().unwrap().len(), 2);
        assert!(reader.frame_arcs(1).unwrap().unwrap().is_empty());
        assert_eq!(reader.frame_arcs(2).unwrap().unwrap(), vec![arc(2, 5, 3)]);
        assert_eq!(reader.frame_arcs(3).unwrap(), None);

        reader.release_before(3).unwrap();
        assert!(buffer.arcs.is_empty());
    }

    #[test]
    fn test_scores_dropped_when_not_kept() {
        let buffer = ArcBuffer::new("noscore", None, false);
        let mut reader = buffer.reader().unwrap();
        buffer.push(arc(0, 1, 1)).unwrap();
        buffer.commit_frame().unwrap();
        let arcs = reader.frame_arcs(0).unwrap().unwrap();
        assert_eq!(arcs[0].score, 0);
    }

    #[test]
    fn test_consumer_blocks_until_commit() {
        let buffer = ArcBuffer::new("threaded", None, true);
        let mut reader = buffer.reader().unwrap();
        let consumer = thread::spawn(move || {
            let mut total = 0;
            let mut frame = 0;
            while let Some(arcs) = reader.frame_arcs(frame).unwrap() {
                total += arcs.len();
                reader.release_before(frame + 1).unwrap();
                frame += 1;
            }
            (frame, total)
        });
        for f in 0..20 {
            buffer.push(arc(f, f + 2, 1)).unwrap();
            buffer.commit_frame().unwrap();
        }
        buffer.finalize().unwrap();
        assert_eq!(consumer.join().unwrap(), (20, 20));
        assert!(buffer.finalize().is_err());
    }
}
