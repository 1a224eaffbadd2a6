pub mod grade;
pub mod guide;
pub mod loaders;
pub mod record;
pub mod work_item;

pub use grade::{percentage, GradeRecord, GradeScale, GradingSummary, LetterGrade};
pub use guide::{GuideQuestion, MarkingGuide};
pub use loaders::{list_submission_files, load_guide};
pub use record::{LogicalKey, PersistedRecord, RecordKind};
pub use work_item::{MappedAnswer, WorkItem};
