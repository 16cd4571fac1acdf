use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A mood check-in as submitted by the diary screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodCheckIn {
    /// 1 (worst) to 5 (best)
    pub mood: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MoodCheckIn {
    pub fn new(mood: u8) -> Self {
        Self {
            mood,
            note: None,
            tags: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        (1..=5).contains(&self.mood)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodEntry {
    pub id: i64,
    #[serde(flatten)]
    pub check_in: MoodCheckIn,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoodStats {
    pub average: f32,
    pub count: u32,
    #[serde(default)]
    pub streak_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteToggle {
    pub coach_id: String,
    pub favorite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Favorite {
    pub coach_id: String,
    pub created_at: DateTime<Utc>,
}

/// Fields of a task the client is allowed to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub completed: bool,
}

impl TaskDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            project_id: None,
            due_date: None,
            completed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    #[serde(flatten)]
    pub draft: TaskDraft,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    #[serde(flatten)]
    pub draft: ProjectDraft,
    pub updated_at: DateTime<Utc>,
}

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
