use crate::notifications::NotificationHub;
use crate::store::{NewTestCase, NewTestCaseResult, TestDataStore, TestRun, TestSuite};
use crate::types::{ImportError, RunStatus, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

/// Progress notification cadence, in result records.
const PROGRESS_INTERVAL: usize = 10;

/// Sentinel suite assigned to cases imported without a parent suite.
pub const DEFAULT_SUITE_ID: &str = "default";

/// Uploaded document shape. Either a full document with suites, cases and
/// results, or a bare array of result records.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ImportPayload {
    Document(ImportDocument),
    Results(Vec<ResultInput>),
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportDocument {
    #[serde(default)]
    pub test_suites: Vec<SuiteInput>,
    #[serde(default)]
    pub test_cases: Vec<CaseInput>,
    #[serde(default, alias = "results")]
    pub test_case_results: Vec<ResultInput>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SuiteInput {
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub format: Option<String>,
    pub version: Option<u32>,
    pub version_string: Option<String>,
    pub is_final: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CaseInput {
    pub case_id: Option<String>,
    pub title: Option<String>,
    pub version: Option<u32>,
    pub version_string: Option<String>,
    pub test_suite_id: Option<String>,
    pub applies_to: Option<String>,
    pub description: Option<String>,
    pub steps: Option<String>,
    pub precondition: Option<String>,
    pub area: Option<String>,
    pub automatability: Option<String>,
    pub author: Option<String>,
    pub material: Option<String>,
    pub is_challenged: Option<bool>,
    pub challenge_issue_url: Option<String>,
}

/// One uploaded result record. The case reference may be an internal numeric
/// id or an external case id, under either of two keys; the outcome may come
/// from `result` or a fallback `status` field.
#[derive(Debug, Default, Deserialize)]
pub struct ResultInput {
    pub test_case_id: Option<Value>,
    pub id: Option<Value>,
    pub result: Option<String>,
    pub status: Option<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub logs: Option<String>,
    pub artifacts: Option<String>,
}

/// Outcome of reconciling one input record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    Unchanged,
    Skipped,
    Failed(String),
}

/// Per-batch tally aggregated from the individual record outcomes.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub suites_created: usize,
    pub suites_updated: usize,
    pub cases_created: usize,
    pub results_imported: usize,
    pub records_skipped: usize,
    pub record_errors: usize,
}

impl BatchReport {
    fn tally_suite(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Created => self.suites_created += 1,
            RecordOutcome::Updated => self.suites_updated += 1,
            RecordOutcome::Unchanged => {}
            RecordOutcome::Skipped => self.records_skipped += 1,
            RecordOutcome::Failed(_) => self.record_errors += 1,
        }
    }

    fn tally_case(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Created => self.cases_created += 1,
            RecordOutcome::Updated | RecordOutcome::Unchanged => {}
            RecordOutcome::Skipped => self.records_skipped += 1,
            RecordOutcome::Failed(_) => self.record_errors += 1,
        }
    }
}

/// Result payload of a finished import task.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub test_run_id: i64,
    #[serde(flatten)]
    pub report: BatchReport,
}

/// Parses an uploaded test-result file and materializes suites, cases and
/// result rows, reporting progress to the uploading client.
///
/// Runs as a task-queue job: a fatal error here fails the run and surfaces to
/// the task record; a single bad record only fails that record.
pub struct ImportPipeline {
    store: Arc<dyn TestDataStore>,
    hub: Arc<NotificationHub>,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn TestDataStore>, hub: Arc<NotificationHub>) -> Self {
        Self { store, hub }
    }

    /// Whether the filename has an importable extension. Callers check this
    /// before queueing an import.
    pub fn supported_file(filename: &str) -> bool {
        filename.to_lowercase().ends_with(".json")
    }

    /// Execute the full import for one uploaded file.
    pub async fn run(
        &self,
        content: &[u8],
        filename: &str,
        client_id: Option<&str>,
    ) -> Result<ImportSummary, ImportError> {
        let payload = match Self::parse(content, filename) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not parse upload {}: {}", filename, e);
                self.notify_failure(client_id, &e);
                return Err(e);
            }
        };

        let run = match self.store.create_run(RunStatus::Processing).await {
            Ok(run) => run,
            Err(e) => {
                error!("Could not create test run: {}", e);
                let e = ImportError::from(e);
                self.notify_failure(client_id, &e);
                return Err(e);
            }
        };
        info!("Test run {} created for upload {}", run.id, filename);
        self.notify(
            client_id,
            "started",
            "Started processing test results file",
            Some(json!({ "test_run_id": run.id })),
        );

        let processed = self.process(&run, payload, client_id).await;
        let finished = match processed {
            Ok(report) => match self.store.update_run_status(run.id, RunStatus::Completed).await {
                Ok(_) => Ok(report),
                Err(e) => Err(ImportError::from(e)),
            },
            Err(e) => Err(e),
        };

        match finished {
            Ok(report) => {
                info!(
                    "Test run {} completed: {} results, {} suites created, {} cases created",
                    run.id, report.results_imported, report.suites_created, report.cases_created
                );
                self.notify(
                    client_id,
                    "completed",
                    "Completed processing test results file",
                    Some(json!({ "test_run_id": run.id })),
                );
                Ok(ImportSummary {
                    test_run_id: run.id,
                    report,
                })
            }
            Err(e) => {
                error!("Test run {} failed: {}", run.id, e);
                if let Err(store_err) = self
                    .store
                    .update_run_status(run.id, RunStatus::Failed)
                    .await
                {
                    error!("Could not mark test run {} as failed: {}", run.id, store_err);
                }
                self.notify_failure(client_id, &e);
                Err(e)
            }
        }
    }

    fn parse(content: &[u8], filename: &str) -> Result<ImportPayload, ImportError> {
        if !Self::supported_file(filename) {
            return Err(ImportError::UnsupportedFile(filename.to_string()));
        }
        let text = std::str::from_utf8(content)?;
        Ok(serde_json::from_str(text)?)
    }

    async fn process(
        &self,
        run: &TestRun,
        payload: ImportPayload,
        client_id: Option<&str>,
    ) -> Result<BatchReport, ImportError> {
        let (suites, cases, results) = match payload {
            ImportPayload::Document(doc) => {
                (doc.test_suites, doc.test_cases, doc.test_case_results)
            }
            ImportPayload::Results(results) => (Vec::new(), Vec::new(), results),
        };

        let mut report = BatchReport::default();

        for suite in suites {
            let outcome = self.reconcile_suite(suite, client_id).await;
            report.tally_suite(&outcome);
        }

        for case in cases {
            let outcome = self.reconcile_case(case, client_id).await;
            report.tally_case(&outcome);
        }

        self.import_results(run, results, client_id, &mut report)
            .await?;

        Ok(report)
    }

    /// Create the suite if it is new, otherwise update only the supplied
    /// fields that differ, writing only when something actually changed.
    async fn reconcile_suite(&self, input: SuiteInput, client_id: Option<&str>) -> RecordOutcome {
        let suite_id = match input.id.clone() {
            Some(id) if !id.is_empty() => id,
            _ => return RecordOutcome::Skipped,
        };

        match self.store.find_suite(&suite_id).await {
            Ok(None) => {
                let suite = TestSuite {
                    id: suite_id.clone(),
                    name: input.name.unwrap_or_else(|| format!("Suite {}", suite_id)),
                    url: input.url,
                    format: input.format.unwrap_or_else(|| "json".to_string()),
                    version: input.version.unwrap_or(1),
                    version_string: input.version_string.unwrap_or_else(|| "1.0".to_string()),
                    is_final: input.is_final.unwrap_or(false),
                };
                match self.store.save_suite(suite).await {
                    Ok(_) => {
                        self.notify(
                            client_id,
                            "test_suite_created",
                            &format!("Created test suite: {}", suite_id),
                            Some(json!({ "suite_id": suite_id })),
                        );
                        RecordOutcome::Created
                    }
                    Err(e) => self.suite_error(&suite_id, client_id, e),
                }
            }
            Ok(Some(mut existing)) => {
                let mut changed = false;
                if let Some(name) = input.name {
                    if existing.name != name {
                        existing.name = name;
                        changed = true;
                    }
                }
                if input.url.is_some() && existing.url != input.url {
                    existing.url = input.url;
                    changed = true;
                }
                if let Some(format) = input.format {
                    if existing.format != format {
                        existing.format = format;
                        changed = true;
                    }
                }
                if let Some(version) = input.version {
                    if existing.version != version {
                        existing.version = version;
                        changed = true;
                    }
                }
                if let Some(version_string) = input.version_string {
                    if existing.version_string != version_string {
                        existing.version_string = version_string;
                        changed = true;
                    }
                }
                if let Some(is_final) = input.is_final {
                    if existing.is_final != is_final {
                        existing.is_final = is_final;
                        changed = true;
                    }
                }

                if !changed {
                    return RecordOutcome::Unchanged;
                }
                match self.store.save_suite(existing).await {
                    Ok(_) => {
                        self.notify(
                            client_id,
                            "test_suite_updated",
                            &format!("Updated test suite: {}", suite_id),
                            Some(json!({ "suite_id": suite_id })),
                        );
                        RecordOutcome::Updated
                    }
                    Err(e) => self.suite_error(&suite_id, client_id, e),
                }
            }
            Err(e) => self.suite_error(&suite_id, client_id, e),
        }
    }

    /// Create the case if it is new. Existing cases are never updated by an
    /// import; only suites are.
    async fn reconcile_case(&self, input: CaseInput, client_id: Option<&str>) -> RecordOutcome {
        let case_id = match input.case_id.clone() {
            Some(id) if !id.is_empty() => id,
            _ => return RecordOutcome::Skipped,
        };

        match self.store.find_case(&case_id).await {
            Ok(Some(_)) => RecordOutcome::Unchanged,
            Ok(None) => {
                let case = NewTestCase {
                    case_id: case_id.clone(),
                    title: input
                        .title
                        .unwrap_or_else(|| format!("Test Case {}", case_id)),
                    version: input.version.unwrap_or(1),
                    version_string: input.version_string.unwrap_or_else(|| "1.0".to_string()),
                    test_suite_id: input
                        .test_suite_id
                        .unwrap_or_else(|| DEFAULT_SUITE_ID.to_string()),
                    applies_to: input.applies_to,
                    description: input.description,
                    steps: input.steps,
                    precondition: input.precondition,
                    area: input.area,
                    automatability: input.automatability,
                    author: input.author,
                    material: input.material,
                    is_challenged: input.is_challenged.unwrap_or(false),
                    challenge_issue_url: input.challenge_issue_url,
                };
                match self.store.create_case(case).await {
                    Ok(_) => {
                        self.notify(
                            client_id,
                            "test_case_created",
                            &format!("Created test case: {}", case_id),
                            Some(json!({ "case_id": case_id })),
                        );
                        RecordOutcome::Created
                    }
                    Err(e) => self.case_error(&case_id, client_id, e),
                }
            }
            Err(e) => self.case_error(&case_id, client_id, e),
        }
    }

    /// Resolve each record's case, collect result rows, and insert them in a
    /// single bulk write. Emits a progress notification every
    /// [`PROGRESS_INTERVAL`] successfully processed records.
    async fn import_results(
        &self,
        run: &TestRun,
        results: Vec<ResultInput>,
        client_id: Option<&str>,
        report: &mut BatchReport,
    ) -> Result<(), ImportError> {
        let total = results.len();
        let mut rows: Vec<NewTestCaseResult> = Vec::with_capacity(total);
        let mut processed = 0usize;

        for item in results {
            let case_ref = match item.test_case_id.clone().or_else(|| item.id.clone()) {
                Some(value) if !value.is_null() => value,
                _ => {
                    report.records_skipped += 1;
                    continue;
                }
            };

            match self.resolve_case(&case_ref, item.title.as_deref()).await {
                Ok(case) => {
                    let result = item
                        .result
                        .or(item.status)
                        .unwrap_or_else(|| "Unknown".to_string());
                    rows.push(NewTestCaseResult {
                        test_case_id: case.id,
                        test_run_id: run.id,
                        result,
                        comment: item.comment,
                        logs: item.logs,
                        artifacts: item.artifacts,
                    });

                    processed += 1;
                    if processed % PROGRESS_INTERVAL == 0 {
                        let percentage = (processed as f64 / total as f64) * 100.0;
                        self.notify(
                            client_id,
                            "progress",
                            &format!("Processing test results: {}/{}", processed, total),
                            Some(json!({
                                "processed": processed,
                                "total": total,
                                "percentage": percentage,
                            })),
                        );
                    }
                }
                Err(e) => {
                    let reference = reference_string(&case_ref);
                    error!(
                        "Error processing test result for case {}: {}",
                        reference, e
                    );
                    self.notify(
                        client_id,
                        "error",
                        &format!("Error processing test result for case {}", reference),
                        Some(json!({ "error": e.to_string() })),
                    );
                    report.record_errors += 1;
                }
            }
        }

        if !rows.is_empty() {
            let inserted = self.store.bulk_insert_results(rows).await?;
            report.results_imported = inserted;
            self.notify(
                client_id,
                "complete",
                &format!("Completed processing {} test results", inserted),
                Some(json!({ "total_results": inserted })),
            );
        }

        Ok(())
    }

    /// Internal id first, then external case id, then create on the fly.
    async fn resolve_case(
        &self,
        case_ref: &Value,
        title: Option<&str>,
    ) -> Result<crate::store::TestCase, StoreError> {
        if let Some(internal_id) = case_ref.as_i64() {
            if let Some(case) = self.store.find_case_by_id(internal_id).await? {
                return Ok(case);
            }
        }

        let external_id = reference_string(case_ref);
        if let Some(case) = self.store.find_case(&external_id).await? {
            return Ok(case);
        }

        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| format!("Test Case {}", external_id));
        self.store
            .create_case(NewTestCase::with_defaults(
                external_id,
                title,
                DEFAULT_SUITE_ID.to_string(),
            ))
            .await
    }

    fn suite_error(
        &self,
        suite_id: &str,
        client_id: Option<&str>,
        e: StoreError,
    ) -> RecordOutcome {
        error!("Error processing test suite {}: {}", suite_id, e);
        self.notify(
            client_id,
            "error",
            &format!("Error processing test suite {}", suite_id),
            Some(json!({ "error": e.to_string() })),
        );
        RecordOutcome::Failed(e.to_string())
    }

    fn case_error(&self, case_id: &str, client_id: Option<&str>, e: StoreError) -> RecordOutcome {
        error!("Error processing test case {}: {}", case_id, e);
        self.notify(
            client_id,
            "error",
            &format!("Error processing test case {}", case_id),
            Some(json!({ "error": e.to_string() })),
        );
        RecordOutcome::Failed(e.to_string())
    }

    fn notify_failure(&self, client_id: Option<&str>, e: &ImportError) {
        self.notify(
            client_id,
            "error",
            "Failed to process test results file",
            Some(json!({ "error": e.to_string() })),
        );
    }

    fn notify(&self, client_id: Option<&str>, kind: &str, message: &str, data: Option<Value>) {
        if let Some(client_id) = client_id {
            self.hub.send(client_id, kind, message, data);
        }
    }
}

fn reference_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Notification;
    use async_trait::async_trait;

    fn pipeline_with(store: Arc<MemoryStore>) -> (ImportPipeline, Arc<NotificationHub>) {
        let hub = Arc::new(NotificationHub::new());
        let pipeline = ImportPipeline::new(store, Arc::clone(&hub));
        (pipeline, hub)
    }

    fn kinds(notifications: &[Notification]) -> Vec<&str> {
        notifications.iter().map(|n| n.kind.as_str()).collect()
    }

    #[test]
    fn test_supported_file() {
        assert!(ImportPipeline::supported_file("results.json"));
        assert!(ImportPipeline::supported_file("RESULTS.JSON"));
        assert!(!ImportPipeline::supported_file("results.xlsx"));
        assert!(!ImportPipeline::supported_file("results"));
    }

    #[tokio::test]
    async fn test_full_document_import() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, hub) = pipeline_with(Arc::clone(&store));

        let content = serde_json::to_vec(&json!({
            "test_suites": [{"id": "S1", "name": "Suite One"}],
            "test_cases": [{"case_id": "C1", "title": "Case One", "test_suite_id": "S1"}],
            "test_case_results": [{"test_case_id": "C1", "result": "Pass"}],
        }))
        .unwrap();

        let summary = pipeline
            .run(&content, "results.json", Some("client-1"))
            .await
            .unwrap();

        assert_eq!(summary.report.suites_created, 1);
        assert_eq!(summary.report.cases_created, 1);
        assert_eq!(summary.report.results_imported, 1);

        let suites = store.suites();
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].name, "Suite One");

        let cases = store.cases();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].case_id, "C1");
        assert_eq!(cases[0].test_suite_id, "S1");

        let results = store.results_for_run(summary.test_run_id);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result, "Pass");
        assert_eq!(results[0].test_case_id, cases[0].id);

        let run = store
            .get_run(summary.test_run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let notifications = hub.list("client-1", false);
        let kinds = kinds(&notifications);
        assert!(kinds.contains(&"started"));
        assert!(kinds.contains(&"test_suite_created"));
        assert!(kinds.contains(&"test_case_created"));
        assert!(kinds.contains(&"complete"));
        assert_eq!(kinds.last(), Some(&"completed"));
    }

    #[tokio::test]
    async fn test_progress_notifications_every_ten_records() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, hub) = pipeline_with(store);

        let results: Vec<Value> = (0..25)
            .map(|i| json!({"test_case_id": format!("C{}", i), "result": "Pass"}))
            .collect();
        let content =
            serde_json::to_vec(&json!({ "test_case_results": results })).unwrap();

        let summary = pipeline
            .run(&content, "many.json", Some("client-2"))
            .await
            .unwrap();
        assert_eq!(summary.report.results_imported, 25);

        let progress: Vec<Notification> = hub
            .list("client-2", false)
            .into_iter()
            .filter(|n| n.kind == "progress")
            .collect();
        assert_eq!(progress.len(), 2);

        let first = progress[0].data.as_ref().unwrap();
        assert_eq!(first["processed"], 10);
        assert_eq!(first["total"], 25);
        assert_eq!(first["percentage"], 40.0);

        let second = progress[1].data.as_ref().unwrap();
        assert_eq!(second["processed"], 20);
        assert_eq!(second["percentage"], 80.0);
    }

    #[tokio::test]
    async fn test_bare_results_array_payload() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _hub) = pipeline_with(Arc::clone(&store));

        let content = serde_json::to_vec(&json!([
            {"test_case_id": "C1", "result": "Pass"},
            {"id": "C2", "status": "Fail"},
        ]))
        .unwrap();

        let summary = pipeline.run(&content, "flat.json", None).await.unwrap();
        assert_eq!(summary.report.results_imported, 2);

        // Unknown cases were created on the fly under the default suite.
        let cases = store.cases();
        assert_eq!(cases.len(), 2);
        assert!(cases.iter().all(|c| c.test_suite_id == DEFAULT_SUITE_ID));

        let results = store.results_for_run(summary.test_run_id);
        let outcomes: Vec<&str> = results.iter().map(|r| r.result.as_str()).collect();
        assert!(outcomes.contains(&"Pass"));
        assert!(outcomes.contains(&"Fail")); // taken from the status fallback
    }

    #[tokio::test]
    async fn test_records_without_identifiers_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _hub) = pipeline_with(Arc::clone(&store));

        let content = serde_json::to_vec(&json!({
            "test_suites": [{"name": "no id"}],
            "test_cases": [{"title": "no case id"}],
            "test_case_results": [
                {"result": "Pass"},
                {"test_case_id": "C1", "result": "Pass"},
            ],
        }))
        .unwrap();

        let summary = pipeline.run(&content, "sparse.json", None).await.unwrap();
        assert_eq!(summary.report.records_skipped, 3);
        assert_eq!(summary.report.results_imported, 1);
        assert!(store.suites().is_empty());
        assert_eq!(store.cases().len(), 1);
    }

    #[tokio::test]
    async fn test_suite_update_only_when_changed() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, hub) = pipeline_with(Arc::clone(&store));

        let first = serde_json::to_vec(&json!({
            "test_suites": [{"id": "S1", "name": "Suite One"}],
        }))
        .unwrap();
        pipeline
            .run(&first, "a.json", Some("client-3"))
            .await
            .unwrap();

        // Identical data: no update write, no update notification.
        pipeline
            .run(&first, "a.json", Some("client-3"))
            .await
            .unwrap();
        let notifications = hub.list("client-3", false);
        assert!(!kinds(&notifications).contains(&"test_suite_updated"));

        // Changed name: one update.
        let changed = serde_json::to_vec(&json!({
            "test_suites": [{"id": "S1", "name": "Suite One Renamed"}],
        }))
        .unwrap();
        let summary = pipeline
            .run(&changed, "a.json", Some("client-3"))
            .await
            .unwrap();
        assert_eq!(summary.report.suites_updated, 1);
        assert_eq!(
            store.find_suite("S1").await.unwrap().unwrap().name,
            "Suite One Renamed"
        );
    }

    #[tokio::test]
    async fn test_existing_cases_are_not_updated() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _hub) = pipeline_with(Arc::clone(&store));

        let first = serde_json::to_vec(&json!({
            "test_cases": [{"case_id": "C1", "title": "Original Title"}],
        }))
        .unwrap();
        pipeline.run(&first, "a.json", None).await.unwrap();

        let second = serde_json::to_vec(&json!({
            "test_cases": [{"case_id": "C1", "title": "New Title"}],
        }))
        .unwrap();
        let summary = pipeline.run(&second, "a.json", None).await.unwrap();

        assert_eq!(summary.report.cases_created, 0);
        let cases = store.cases();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].title, "Original Title");
    }

    #[tokio::test]
    async fn test_result_resolves_case_by_internal_id() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _hub) = pipeline_with(Arc::clone(&store));

        let created = store
            .create_case(NewTestCase::with_defaults(
                "C1".to_string(),
                "Case One".to_string(),
                "S1".to_string(),
            ))
            .await
            .unwrap();

        let content = serde_json::to_vec(&json!({
            "test_case_results": [{"test_case_id": created.id, "result": "Pass"}],
        }))
        .unwrap();
        let summary = pipeline.run(&content, "byid.json", None).await.unwrap();

        // No new case was created; the numeric reference hit the internal id.
        assert_eq!(store.cases().len(), 1);
        let results = store.results_for_run(summary.test_run_id);
        assert_eq!(results[0].test_case_id, created.id);
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, hub) = pipeline_with(Arc::clone(&store));

        let outcome = pipeline
            .run(b"whatever", "results.xlsx", Some("client-4"))
            .await;
        assert!(matches!(outcome, Err(ImportError::UnsupportedFile(_))));

        // No run was created, and the client was told about the failure.
        assert!(store.runs().is_empty());
        let notifications = hub.list("client-4", false);
        assert_eq!(kinds(&notifications), vec!["error"]);
    }

    #[tokio::test]
    async fn test_invalid_json_fails_before_run_creation() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _hub) = pipeline_with(Arc::clone(&store));

        let outcome = pipeline.run(b"{not json", "bad.json", None).await;
        assert!(matches!(outcome, Err(ImportError::Parse(_))));
        assert!(store.runs().is_empty());
    }

    /// Store wrapper that fails `create_case` for one marked external id,
    /// exercising the continue-on-record-error path.
    struct FailingCaseStore {
        inner: MemoryStore,
        poison_case_id: String,
    }

    #[async_trait]
    impl TestDataStore for FailingCaseStore {
        async fn find_suite(&self, suite_id: &str) -> Result<Option<TestSuite>, StoreError> {
            self.inner.find_suite(suite_id).await
        }

        async fn save_suite(&self, suite: TestSuite) -> Result<TestSuite, StoreError> {
            self.inner.save_suite(suite).await
        }

        async fn find_case(
            &self,
            case_id: &str,
        ) -> Result<Option<crate::store::TestCase>, StoreError> {
            self.inner.find_case(case_id).await
        }

        async fn find_case_by_id(
            &self,
            id: i64,
        ) -> Result<Option<crate::store::TestCase>, StoreError> {
            self.inner.find_case_by_id(id).await
        }

        async fn create_case(
            &self,
            case: NewTestCase,
        ) -> Result<crate::store::TestCase, StoreError> {
            if case.case_id == self.poison_case_id {
                return Err(StoreError::Backend("simulated insert failure".to_string()));
            }
            self.inner.create_case(case).await
        }

        async fn create_run(&self, status: RunStatus) -> Result<TestRun, StoreError> {
            self.inner.create_run(status).await
        }

        async fn get_run(&self, run_id: i64) -> Result<Option<TestRun>, StoreError> {
            self.inner.get_run(run_id).await
        }

        async fn update_run_status(
            &self,
            run_id: i64,
            status: RunStatus,
        ) -> Result<TestRun, StoreError> {
            self.inner.update_run_status(run_id, status).await
        }

        async fn bulk_insert_results(
            &self,
            rows: Vec<NewTestCaseResult>,
        ) -> Result<usize, StoreError> {
            self.inner.bulk_insert_results(rows).await
        }
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_the_batch() {
        let store = Arc::new(FailingCaseStore {
            inner: MemoryStore::new(),
            poison_case_id: "C_BAD".to_string(),
        });
        let hub = Arc::new(NotificationHub::new());
        let pipeline = ImportPipeline::new(store, Arc::clone(&hub));

        let content = serde_json::to_vec(&json!({
            "test_case_results": [
                {"test_case_id": "C_OK_1", "result": "Pass"},
                {"test_case_id": "C_BAD", "result": "Fail"},
                {"test_case_id": "C_OK_2", "result": "Pass"},
            ],
        }))
        .unwrap();

        let summary = pipeline
            .run(&content, "mixed.json", Some("client-5"))
            .await
            .unwrap();

        // The poisoned record was reported and the rest of the batch landed.
        assert_eq!(summary.report.results_imported, 2);
        assert_eq!(summary.report.record_errors, 1);

        let notifications = hub.list("client-5", false);
        let kinds = kinds(&notifications);
        assert!(kinds.contains(&"error"));
        assert_eq!(kinds.last(), Some(&"completed"));
    }
}
