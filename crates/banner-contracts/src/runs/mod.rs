pub mod history;
pub mod manifest;
pub mod progress;
pub mod receipts;
pub mod report;

pub use history::{IterationRecord, OptimizationHistory};
pub use manifest::{artifact_dir_for, FileManifest, ManifestEntry};
pub use progress::{ProgressEntry, ProgressLog, ProgressStatus};
pub use receipts::{receipt_path, MaterialReceipt, MaterialRequest, ResolvedMaterial};
pub use report::{write_final_report, FinalReport};
