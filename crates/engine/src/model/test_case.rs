use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Unit,
    Integration,
    #[default]
    InputOutput,
    Performance,
    Memory,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

/// Instructor-authored check for an exercise. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCase {
    pub id: Uuid,
    pub exercise_id: Uuid,
    pub name: String,
    pub test_type: TestType,
    pub description: String,
    /// Fed to the derived run's standard input.
    pub input_data: String,
    pub expected_output: String,
    pub expected_error: String,
    pub setup_code: String,
    pub test_code: String,
    pub teardown_code: String,
    /// Seconds.
    pub timeout: u32,
    /// MB.
    pub max_memory: u32,
    pub points: u32,
    pub is_hidden: bool,
    pub is_required: bool,
    pub order: u32,
    pub weight: f64,
    pub difficulty: Difficulty,
    /// Seconds; an otherwise passing run slower than this fails.
    pub max_execution_time: Option<f64>,
    /// MB; an otherwise passing run heavier than this fails.
    pub max_memory_usage: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Default for TestCase {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            exercise_id: Uuid::nil(),
            name: String::new(),
            test_type: TestType::default(),
            description: String::new(),
            input_data: String::new(),
            expected_output: String::new(),
            expected_error: String::new(),
            setup_code: String::new(),
            test_code: String::new(),
            teardown_code: String::new(),
            timeout: 10,
            max_memory: 64,
            points: 1,
            is_hidden: false,
            is_required: true,
            order: 0,
            weight: 1.0,
            difficulty: Difficulty::default(),
            max_execution_time: None,
            max_memory_usage: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Timeout,
    MemoryExceeded,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::MemoryExceeded => "memory_exceeded",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one test case against one submission; unique per pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub test_case_id: Uuid,
    pub status: TestStatus,
    pub actual_output: String,
    pub error_message: String,
    pub stack_trace: String,
    pub execution_time: Option<f64>,
    pub memory_used: Option<u32>,
    pub points_earned: u32,
    pub points_possible: u32,
    pub output_diff: String,
    pub similarity_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl TestResult {
    /// A result with no output attached yet.
    pub fn new(execution_id: Uuid, test_case: &TestCase, status: TestStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            test_case_id: test_case.id,
            status,
            actual_output: String::new(),
            error_message: String::new(),
            stack_trace: String::new(),
            execution_time: None,
            memory_used: None,
            points_earned: 0,
            points_possible: test_case.points,
            output_diff: String::new(),
            similarity_score: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}
