//! Entity types shared by every kaizen crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub type DatasetId = i64;
pub type BlobId = i64;
pub type PatchId = i64;
pub type PatchSpecId = i64;
pub type KeywordId = i64;
pub type SeedId = i64;
pub type ClassifierId = i64;
pub type RoundId = i64;
pub type ExampleId = i64;
pub type QueryId = i64;
pub type ResponseId = i64;
pub type PredictionId = i64;
pub type FeatureSpecId = i64;
pub type DetectionId = i64;

// =============================================================================
// DATASETS AND IMAGES
// =============================================================================

/// A collection of images plus the features computed over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    /// Grid used to generate candidate patches for every blob, if any.
    pub patch_spec_id: Option<PatchSpecId>,
}

/// One source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub id: BlobId,
    pub dataset_id: DatasetId,
    /// Path of the image, relative to the blob root.
    pub location: String,
}

/// Geometric identity of a patch. Two patches with equal keys are the same
/// patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchKey {
    pub blob_id: BlobId,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub fliplr: bool,
    /// Clockwise rotation in degrees; a multiple of 90.
    pub rotation: i32,
}

impl PatchKey {
    /// An unflipped, unrotated crop.
    pub fn new(blob_id: BlobId, x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            blob_id,
            x,
            y,
            width,
            height,
            fliplr: false,
            rotation: 0,
        }
    }

    /// The same crop mirrored left-right.
    pub fn mirrored(self) -> Self {
        Self {
            fliplr: !self.fliplr,
            ..self
        }
    }
}

/// A rectangular, optionally transformed crop of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: PatchId,
    pub key: PatchKey,
}

impl Patch {
    pub fn blob_id(&self) -> BlobId {
        self.key.blob_id
    }
}

/// Rule for a dense grid of candidate patches over a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSpec {
    pub id: PatchSpecId,
    pub name: String,
    pub width: i32,
    pub height: i32,
    /// Fraction of the window shared by horizontally adjacent patches, in [0, 1).
    pub x_overlap: f32,
    /// Fraction of the window shared by vertically adjacent patches, in [0, 1).
    pub y_overlap: f32,
    /// Also emit a mirrored copy of every window.
    pub fliplr: bool,
}

/// Fields of a patch spec that is about to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPatchSpec {
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub x_overlap: f32,
    pub y_overlap: f32,
    pub fliplr: bool,
}

// =============================================================================
// FEATURES
// =============================================================================

/// Feature extraction algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// Joint RGB color histogram
    ColorHist,
    /// Histogram of oriented gradients
    Hog,
    /// Downsampled pixel vector
    TinyImage,
    /// Layer activation of a pretrained network
    Cnn,
}

impl ExtractorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ColorHist => "color_hist",
            Self::Hog => "hog",
            Self::TinyImage => "tiny_image",
            Self::Cnn => "cnn",
        }
    }
}

impl std::fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtractorKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "color_hist" | "colorhist" => Ok(Self::ColorHist),
            "hog" | "hogdalal" => Ok(Self::Hog),
            "tiny_image" | "tinyimage" => Ok(Self::TinyImage),
            "cnn" => Ok(Self::Cnn),
            _ => Err(format!("Invalid extractor kind: {}", s)),
        }
    }
}

/// An extractor plus its configuration. Distinct configurations are distinct
/// specs and therefore distinct cache identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub id: FeatureSpecId,
    pub dataset_id: DatasetId,
    pub kind: ExtractorKind,
    pub params: JsonValue,
}

/// Cached vector for one (patch, spec) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub patch_id: PatchId,
    pub spec_id: FeatureSpecId,
    pub vector: Vec<f32>,
}

// =============================================================================
// KEYWORDS AND CLASSIFIERS
// =============================================================================

/// A label concept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: KeywordId,
    pub dataset_id: DatasetId,
    pub name: String,
    /// CSV of `blob_name,x,y,w,h,value` rows seeding the keyword.
    pub definition_file: Option<String>,
}

/// A curated example that bootstraps classifiers of a keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub id: SeedId,
    pub keyword_id: KeywordId,
    pub patch_id: PatchId,
    pub value: bool,
}

/// Binds a keyword to a dataset and owns the rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classifier {
    pub id: ClassifierId,
    pub keyword_id: KeywordId,
    pub dataset_id: DatasetId,
}

/// One iteration of label → train → query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub classifier_id: ClassifierId,
    pub number: i32,
}

/// A labeled patch a round trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub id: ExampleId,
    pub round_id: RoundId,
    pub patch_id: PatchId,
    pub value: bool,
}

/// An example about to be added to a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewExample {
    pub patch_id: PatchId,
    pub value: bool,
}

/// A model score for a candidate patch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub round_id: RoundId,
    pub patch_id: PatchId,
    pub score: f32,
}

/// A prediction about to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewPrediction {
    pub patch_id: PatchId,
    pub score: f32,
}

/// A patch selected for human labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuery {
    pub id: QueryId,
    pub round_id: RoundId,
    pub patch_id: PatchId,
}

/// A human answer to a pending query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: ResponseId,
    pub query_id: QueryId,
    pub value: bool,
}

/// A request to run every classifier of a blob's dataset over the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub id: DetectionId,
    pub blob_id: BlobId,
}

// =============================================================================
// TASKS
// =============================================================================

/// Unit of asynchronous work, addressable by name from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    /// Analyze every blob, then seed every keyword
    Dataset,
    /// Compute features for the patches of one blob
    AnalyzeBlob,
    /// Load and materialize the seeds of one keyword
    Keyword,
    /// Initialize round 0 of a classifier
    Classifier,
    /// Move a classifier to its next round
    AdvanceClassifier,
    /// Materialize the query patches of a round
    PrecropRoundResults,
    /// Run every classifier over a blob
    Detect,
    /// No-op
    Done,
}

impl TaskName {
    /// Every task, in CLI help order.
    pub const ALL: [TaskName; 8] = [
        TaskName::Dataset,
        TaskName::AnalyzeBlob,
        TaskName::Keyword,
        TaskName::Classifier,
        TaskName::AdvanceClassifier,
        TaskName::PrecropRoundResults,
        TaskName::Detect,
        TaskName::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::AnalyzeBlob => "analyze_blob",
            Self::Keyword => "keyword",
            Self::Classifier => "classifier",
            Self::AdvanceClassifier => "advance_classifier",
            Self::PrecropRoundResults => "precrop_round_results",
            Self::Detect => "detect",
            Self::Done => "done",
        }
    }

    /// Number of integer arguments the task expects.
    pub fn arity(&self) -> usize {
        match self {
            Self::AnalyzeBlob => 2,
            Self::Done => 0,
            _ => 1,
        }
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskName {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Accept the legacy "tasks." prefix
        let name = s.strip_prefix("tasks.").unwrap_or(s);
        TaskName::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| format!("Unknown task: {}", s))
    }
}

/// A task plus its arguments. This is the whole payload that crosses the
/// queue; only integer ids travel between tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task: TaskName,
    pub args: Vec<i64>,
}

impl TaskSpec {
    pub fn new(task: TaskName, args: Vec<i64>) -> Self {
        Self { task, args }
    }

    /// Payload as stored in the queue.
    pub fn payload(&self) -> JsonValue {
        JsonValue::from(self.args.clone())
    }
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: TaskSpec,
    pub status: JobStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Barrier this job reports to when it finishes.
    pub barrier_id: Option<Uuid>,
    /// The job is not claimable before this instant.
    pub not_before: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Stages still to run once a barrier opens. Each stage is a group of tasks
/// executed in parallel.
pub type Continuation = Vec<Vec<TaskSpec>>;

/// Split stages into the first non-empty one and the non-empty stages after
/// it. `None` when every stage is empty.
pub fn next_stage(stages: &[Vec<TaskSpec>]) -> Option<(&[TaskSpec], Continuation)> {
    let first = stages.iter().position(|stage| !stage.is_empty())?;
    let rest = stages[first + 1..]
        .iter()
        .filter(|stage| !stage.is_empty())
        .cloned()
        .collect();
    Some((&stages[first], rest))
}
