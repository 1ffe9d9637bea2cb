//! HTTP API tests over the axum router with a scripted pipeline.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use tabula_api::catalog::{SchemaCatalog, SchemaDefinition};
use tabula_api::config::AppConfig;
use tabula_api::datasource::{DataSourceInfo, Datasource, DatasourceManager, QueryResult};
use tabula_api::llm::{CallUsage, CompletionRequest, LlmClient, LlmError, StructuredRequest};
use tabula_api::pipeline::orchestrator::Orchestrator;
use tabula_api::prompts::{ModelTier, PromptRegistry, PromptTemplate};
use tabula_api::store::{MemoryStore, SessionStore};
use tabula_api::AppState;

struct ScriptedLlm {
    responses: Mutex<VecDeque<Value>>,
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _req: CompletionRequest) -> Result<(String, CallUsage), LlmError> {
        unimplemented!()
    }

    async fn complete_structured(
        &self,
        _req: StructuredRequest,
    ) -> Result<(Value, CallUsage), LlmError> {
        let value = self
            .responses
            .lock()
            .pop_front()
            .expect("scripted LLM ran out of responses");
        Ok((
            value,
            CallUsage {
                input_tokens: 50,
                output_tokens: 10,
                elapsed_ms: 1,
                model: None,
            },
        ))
    }
}

struct ScriptedSource {
    results: Mutex<VecDeque<QueryResult>>,
}

#[async_trait::async_trait]
impl Datasource for ScriptedSource {
    fn name(&self) -> &str {
        "core_banking"
    }
    fn database(&self) -> &str {
        "customer_db"
    }
    async fn execute(&self, _sql: &str) -> QueryResult {
        self.results
            .lock()
            .pop_front()
            .expect("scripted datasource ran out of results")
    }
    async fn ping(&self) -> bool {
        true
    }
    async fn close(&self) {}
}

fn state(
    llm_responses: Vec<Value>,
    query_results: Vec<QueryResult>,
) -> (axum::Router, Arc<MemoryStore>) {
    let definition: SchemaDefinition = serde_yaml::from_str(
        r#"
database: customer_db
tables:
  - name: customers
    columns:
      - name: id
        type: integer
"#,
    )
    .unwrap();
    let catalog = Arc::new(SchemaCatalog::from_definitions(vec![definition]).unwrap());

    let template = |name: &str, tier: ModelTier| PromptTemplate {
        name: name.to_string(),
        description: String::new(),
        model: tier,
        temperature: 0.0,
        system_prompt: String::new(),
        user_prompt: "${question}${original_question}".to_string(),
        structured_output: None,
    };
    let prompts = Arc::new(PromptRegistry::from_templates(vec![
        template("validate_question", ModelTier::Weak),
        template("decide_action", ModelTier::Planning),
        template("create_plan", ModelTier::Planning),
        template("generate_sql", ModelTier::Developer),
        template("analyze_error", ModelTier::Developer),
        template("write_summary", ModelTier::Planning),
    ]));

    let source: Arc<dyn Datasource> = Arc::new(ScriptedSource {
        results: Mutex::new(query_results.into()),
    });
    let datasources = Arc::new(
        DatasourceManager::from_parts(
            vec![source],
            vec![DataSourceInfo {
                id: "customer_db".into(),
                name: "Customer Database".into(),
                description: "Customer master data".into(),
                datasource: "core_banking".into(),
            }],
        )
        .unwrap(),
    );

    let store = Arc::new(MemoryStore::new());
    let config = AppConfig::default();
    let llm = Arc::new(ScriptedLlm {
        responses: Mutex::new(llm_responses.into()),
    });
    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        prompts.clone(),
        catalog.clone(),
        datasources.clone(),
        store.clone(),
        &config,
    ));

    let app_state = AppState {
        config: Arc::new(config),
        store: store.clone(),
        catalog,
        prompts,
        datasources,
        orchestrator,
    };

    (
        tabula_api::api::create_router().with_state(app_state),
        store,
    )
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_unknown_thread_returns_404() {
    let (app, _store) = state(Vec::new(), Vec::new());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/threads/nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Thread not found");
}

#[tokio::test]
async fn test_create_thread_generates_a_name() {
    let (app, _store) = state(Vec::new(), Vec::new());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/threads")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert!(!body["name"].as_str().unwrap().is_empty());
    assert!(!body["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_message_without_content_is_a_bad_request() {
    let (app, store) = state(Vec::new(), Vec::new());
    let thread = store.create_thread("t").await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/threads/{}/messages", thread.id))
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_posting_a_question_returns_both_messages_with_metadata() {
    let (app, store) = state(
        vec![
            json!({
                "is_relevant": true,
                "reasoning": "on topic",
                "language": "en",
                "relevant_databases": ["customer_db"]
            }),
            json!({"action": "create_plan", "reasoning": "needs a query"}),
            json!({
                "summary": "Count customers",
                "language": "en",
                "steps": [{
                    "step_number": 1,
                    "description": "count",
                    "databases": ["customer_db"],
                    "tables": ["customers"],
                    "operation": "aggregation"
                }]
            }),
            json!({"sql": "SELECT COUNT(*) FROM customers", "database": "customer_db"}),
            json!({
                "answer": "We have 9 customers.",
                "confidence": "high",
                "data_sources_used": ["customer_db"]
            }),
        ],
        vec![{
            let mut row = serde_json::Map::new();
            row.insert("count".to_string(), json!(9));
            QueryResult::ok(vec![row], vec!["count".to_string()], 1)
        }],
    );
    let thread = store.create_thread("t").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/threads/{}/messages", thread.id))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"content": "How many customers do we have?"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;

    assert_eq!(body["user_message"]["sender"], "user");
    assert_eq!(body["server_message"]["sender"], "server");
    assert_eq!(body["server_message"]["content"], "We have 9 customers.");

    let metadata = &body["server_message"]["metadata"];
    assert_eq!(metadata["result"]["type"], "answer");
    assert_eq!(metadata["result"]["confidence"], "high");
    assert_eq!(metadata["plan"]["steps"][0]["databases"][0], "customer_db");
    assert!(metadata["pipeline_time_ms"].is_u64());

    // Token and database accounting are visible through the API.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/threads/{}/tokens", thread.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let tokens = body_json(response).await;
    assert_eq!(tokens["calls"], 5);
    assert_eq!(tokens["total_tokens"], 300);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/threads/{}/databases", thread.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let databases = body_json(response).await;
    assert_eq!(databases["databases"], json!(["customer_db"]));
}

#[tokio::test]
async fn test_data_sources_are_listed_without_datasource_refs() {
    let (app, _store) = state(Vec::new(), Vec::new());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/data-sources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body[0]["id"], "customer_db");
    assert_eq!(body[0]["name"], "Customer Database");
    assert!(body[0].get("datasource").is_none());
}
