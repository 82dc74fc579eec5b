use crate::types::{RunStatus, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named collection of test cases, identified by an external string id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
    pub format: String,
    pub version: u32,
    pub version_string: String,
    pub is_final: bool,
}

/// A single test definition. `id` is the internal storage id, `case_id` the
/// external identifier used by uploaded documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub case_id: String,
    pub title: String,
    pub version: u32,
    pub version_string: String,
    pub test_suite_id: String,
    pub applies_to: Option<String>,
    pub description: Option<String>,
    pub steps: Option<String>,
    pub precondition: Option<String>,
    pub area: Option<String>,
    pub automatability: Option<String>,
    pub author: Option<String>,
    pub material: Option<String>,
    pub is_challenged: bool,
    pub challenge_issue_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTestCase {
    pub case_id: String,
    pub title: String,
    pub version: u32,
    pub version_string: String,
    pub test_suite_id: String,
    pub applies_to: Option<String>,
    pub description: Option<String>,
    pub steps: Option<String>,
    pub precondition: Option<String>,
    pub area: Option<String>,
    pub automatability: Option<String>,
    pub author: Option<String>,
    pub material: Option<String>,
    pub is_challenged: bool,
    pub challenge_issue_url: Option<String>,
}

impl NewTestCase {
    /// A minimal case with the defaults applied to sparse import records.
    pub fn with_defaults(case_id: String, title: String, test_suite_id: String) -> Self {
        Self {
            case_id,
            title,
            version: 1,
            version_string: "1.0".to_string(),
            test_suite_id,
            applies_to: None,
            description: None,
            steps: None,
            precondition: None,
            area: None,
            automatability: None,
            author: None,
            material: None,
            is_challenged: false,
            challenge_issue_url: None,
        }
    }
}

/// One import or execution session producing zero or more results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: i64,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The outcome of running one case within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub id: i64,
    pub test_case_id: i64,
    pub test_run_id: i64,
    pub result: String,
    pub comment: Option<String>,
    pub logs: Option<String>,
    pub artifacts: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTestCaseResult {
    pub test_case_id: i64,
    pub test_run_id: i64,
    pub result: String,
    pub comment: Option<String>,
    pub logs: Option<String>,
    pub artifacts: Option<String>,
}

/// Persistence seam consumed by the import pipeline and the HTTP surface.
///
/// Implementations provide their own isolation per operation; callers treat
/// each call as an independent unit of work.
#[async_trait]
pub trait TestDataStore: Send + Sync {
    async fn find_suite(&self, suite_id: &str) -> Result<Option<TestSuite>, StoreError>;

    /// Create or replace a suite, keyed by its external id.
    async fn save_suite(&self, suite: TestSuite) -> Result<TestSuite, StoreError>;

    /// Look up a case by its external identifier.
    async fn find_case(&self, case_id: &str) -> Result<Option<TestCase>, StoreError>;

    /// Look up a case by its internal storage id.
    async fn find_case_by_id(&self, id: i64) -> Result<Option<TestCase>, StoreError>;

    async fn create_case(&self, case: NewTestCase) -> Result<TestCase, StoreError>;

    async fn create_run(&self, status: RunStatus) -> Result<TestRun, StoreError>;

    async fn get_run(&self, run_id: i64) -> Result<Option<TestRun>, StoreError>;

    async fn update_run_status(&self, run_id: i64, status: RunStatus)
        -> Result<TestRun, StoreError>;

    /// Insert a batch of result rows in one write. Returns the inserted count.
    async fn bulk_insert_results(
        &self,
        rows: Vec<NewTestCaseResult>,
    ) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct Tables {
    suites: HashMap<String, TestSuite>,
    cases: Vec<TestCase>,
    runs: HashMap<i64, TestRun>,
    results: Vec<TestCaseResult>,
    next_case_id: i64,
    next_run_id: i64,
    next_result_id: i64,
}

/// In-memory [`TestDataStore`] backing the process.
///
/// A relational implementation would satisfy the same trait; the tables here
/// mirror that schema closely enough for the import pipeline and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suites(&self) -> Vec<TestSuite> {
        self.tables.read().suites.values().cloned().collect()
    }

    pub fn cases(&self) -> Vec<TestCase> {
        self.tables.read().cases.clone()
    }

    pub fn runs(&self) -> Vec<TestRun> {
        self.tables.read().runs.values().cloned().collect()
    }

    pub fn results_for_run(&self, run_id: i64) -> Vec<TestCaseResult> {
        self.tables
            .read()
            .results
            .iter()
            .filter(|r| r.test_run_id == run_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TestDataStore for MemoryStore {
    async fn find_suite(&self, suite_id: &str) -> Result<Option<TestSuite>, StoreError> {
        Ok(self.tables.read().suites.get(suite_id).cloned())
    }

    async fn save_suite(&self, suite: TestSuite) -> Result<TestSuite, StoreError> {
        self.tables
            .write()
            .suites
            .insert(suite.id.clone(), suite.clone());
        Ok(suite)
    }

    async fn find_case(&self, case_id: &str) -> Result<Option<TestCase>, StoreError> {
        Ok(self
            .tables
            .read()
            .cases
            .iter()
            .find(|c| c.case_id == case_id)
            .cloned())
    }

    async fn find_case_by_id(&self, id: i64) -> Result<Option<TestCase>, StoreError> {
        Ok(self.tables.read().cases.iter().find(|c| c.id == id).cloned())
    }

    async fn create_case(&self, case: NewTestCase) -> Result<TestCase, StoreError> {
        let mut tables = self.tables.write();
        tables.next_case_id += 1;
        let case = TestCase {
            id: tables.next_case_id,
            case_id: case.case_id,
            title: case.title,
            version: case.version,
            version_string: case.version_string,
            test_suite_id: case.test_suite_id,
            applies_to: case.applies_to,
            description: case.description,
            steps: case.steps,
            precondition: case.precondition,
            area: case.area,
            automatability: case.automatability,
            author: case.author,
            material: case.material,
            is_challenged: case.is_challenged,
            challenge_issue_url: case.challenge_issue_url,
        };
        tables.cases.push(case.clone());
        Ok(case)
    }

    async fn create_run(&self, status: RunStatus) -> Result<TestRun, StoreError> {
        let mut tables = self.tables.write();
        tables.next_run_id += 1;
        let now = Utc::now();
        let run = TestRun {
            id: tables.next_run_id,
            status,
            created_at: now,
            updated_at: now,
        };
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<TestRun>, StoreError> {
        Ok(self.tables.read().runs.get(&run_id).cloned())
    }

    async fn update_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
    ) -> Result<TestRun, StoreError> {
        let mut tables = self.tables.write();
        let run = tables.runs.get_mut(&run_id).ok_or(StoreError::NotFound {
            entity: "test run",
            id: run_id.to_string(),
        })?;
        run.status = status;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn bulk_insert_results(
        &self,
        rows: Vec<NewTestCaseResult>,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let inserted = rows.len();
        for row in rows {
            tables.next_result_id += 1;
            let result = TestCaseResult {
                id: tables.next_result_id,
                test_case_id: row.test_case_id,
                test_run_id: row.test_run_id,
                result: row.result,
                comment: row.comment,
                logs: row.logs,
                artifacts: row.artifacts,
            };
            tables.results.push(result);
        }
        Ok(inserted)
    }
}
