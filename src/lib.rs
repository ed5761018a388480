pub mod area;
pub mod cache;
pub mod config;
pub mod error;
pub mod extraction;
pub mod merge;
pub mod observability;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod recognition;
pub mod reorder;
pub mod scheduler;
pub mod similarity;
pub mod validation;
pub mod video;
pub mod writer;

pub use area::SubtitleArea;
pub use config::RunConfig;
pub use error::{DecodeError, EngineError, ExtractError};
pub use merge::{SubtitleCue, SubtitleMerger};
pub use ocr::{ExternalOcrEngine, OcrEngine, OcrOutput};
pub use pipeline::{ExtractionReport, SubtitleExtractor};
pub use progress::{CancellationToken, ProgressEvent, ProgressSink};
pub use recognition::RecognitionResult;
pub use video::{ImageSequenceSource, VideoSource};
pub use writer::{SrtWriter, SubtitleWriter};
