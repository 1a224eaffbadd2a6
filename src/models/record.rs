//! 持久化记录

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::models::grade::{GradeRecord, GradingSummary};
use crate::models::work_item::MappedAnswer;

/// 记录类型，对应关系存储中的一张表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Mapping,
    Grade,
    Summary,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Mapping => "mapping",
            RecordKind::Grade => "grade",
            RecordKind::Summary => "summary",
        }
    }
}

/// 逻辑键：同一逻辑键下的行在每次写入时整体替换
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalKey {
    pub kind: RecordKind,
    pub submission_id: String,
}

impl LogicalKey {
    pub fn new(kind: RecordKind, submission_id: impl Into<String>) -> Self {
        Self {
            kind,
            submission_id: submission_id.into(),
        }
    }
}

impl Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.submission_id)
    }
}

/// 最终写入存储的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedRecord {
    Mapping(MappedAnswer),
    Grade(GradeRecord),
    Summary(GradingSummary),
}

impl PersistedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            PersistedRecord::Mapping(_) => RecordKind::Mapping,
            PersistedRecord::Grade(_) => RecordKind::Grade,
            PersistedRecord::Summary(_) => RecordKind::Summary,
        }
    }

    /// 行标识（题号或提交 ID）
    pub fn row_id(&self) -> &str {
        match self {
            PersistedRecord::Mapping(m) => &m.question_id,
            PersistedRecord::Grade(g) => &g.question_id,
            PersistedRecord::Summary(s) => &s.submission_id,
        }
    }
}
