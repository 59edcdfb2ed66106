pub mod config;
pub mod error;
pub mod job;
pub mod ffprobe;
pub mod select;
pub mod ffmpeg;
pub mod progress;
pub mod registry;
pub mod commit;
pub mod controller;
pub mod sweep;

pub use config::{EncodingParams, MissingAudioPolicy, TranscodeConfig};
pub use controller::JobController;
pub use error::JobError;
pub use job::{CancelReason, JobKey, JobRequest, JobResult, JobState, ProgressSink};
pub use registry::{ActiveJob, JobHandle, JobRegistry};
pub use select::{AudioTrack, StreamSelector};
pub use sweep::sweep_orphaned_temp_files;
