//! HTTP surface: one symmetric route set per entity.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::coordinator::{Coordinator, FundDeletion};
use crate::error::{DependentStep, KbError};
use crate::model::{
    Faq, FaqDraft, Fund, FundDraft, FundQuery, ManualStep, Scenario, ScenarioDraft,
    ScenarioQuery, StepDraft, StepQuery, Term, TermDraft, TermListing,
};

/// Warning attached to a blocked fund deletion.
pub const FUND_IN_USE_WARNING: &str = "Fund is used in manual steps.";

type AppState = Arc<Coordinator>;
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Builds the application router.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/funds",
            get(list_funds)
                .post(create_fund)
                .put(update_fund)
                .delete(delete_fund),
        )
        .route(
            "/api/manuals",
            get(list_steps)
                .post(create_step)
                .put(update_step)
                .delete(delete_step),
        )
        .route(
            "/api/scenarios",
            get(list_scenarios)
                .post(create_scenario)
                .put(update_scenario)
                .delete(delete_scenario),
        )
        .route(
            "/api/terms",
            get(list_terms)
                .post(create_term)
                .put(update_term)
                .delete(delete_term),
        )
        .route(
            "/api/faqs",
            get(list_faqs)
                .post(create_faq)
                .put(update_faq)
                .delete(delete_faq),
        )
        .with_state(coordinator)
}

/// Error body shared by every failure except conflicts.
#[derive(Debug, Serialize)]
struct ErrorBody {
    /// Human-readable message.
    error: String,
}

/// Body of a blocked fund deletion.
#[derive(Debug, Serialize)]
struct ConflictBody {
    /// Fixed warning text.
    warning: &'static str,
    /// Live dependents at the time of the request.
    steps: Vec<DependentStep>,
    /// Abbreviation of the fund.
    fund_abbr: String,
}

/// Acknowledgement for deletes.
#[derive(Debug, Serialize)]
struct Success {
    /// Always `true`.
    success: bool,
}

/// Fund deletion acknowledgement.
#[derive(Debug, Serialize)]
struct FundDeleted {
    /// Always `true`.
    success: bool,
    /// Cascade summary.
    #[serde(flatten)]
    deletion: FundDeletion,
}

/// [`KbError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub KbError);

impl From<KbError> for ApiError {
    fn from(err: KbError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        match self.0 {
            KbError::NotFound { .. } => error(StatusCode::NOT_FOUND, message),
            KbError::Validation(_) => error(StatusCode::BAD_REQUEST, message),
            KbError::DuplicateKey { .. } => error(StatusCode::CONFLICT, message),
            KbError::Conflict(conflict) => (
                StatusCode::CONFLICT,
                Json(ConflictBody {
                    warning: FUND_IN_USE_WARNING,
                    steps: conflict.steps,
                    fund_abbr: conflict.fund_abbr,
                }),
            )
                .into_response(),
            KbError::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        }
    }
}

fn error(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

fn success() -> Json<Success> {
    Json(Success { success: true })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// `GET /api/funds` parameters.
#[derive(Debug, Default, Deserialize)]
struct FundParams {
    search: Option<String>,
    filter: Option<String>,
}

/// `DELETE /api/funds` body.
#[derive(Debug, Default, Deserialize)]
struct FundDeleteRequest {
    #[serde(default)]
    fund_id: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn list_funds(
    State(coordinator): State<AppState>,
    Query(params): Query<FundParams>,
) -> ApiResult<Vec<Fund>> {
    let query = FundQuery::from_params(params.search.as_deref(), params.filter.as_deref());
    Ok(Json(coordinator.list_funds(&query).await?))
}

async fn create_fund(
    State(coordinator): State<AppState>,
    Json(draft): Json<FundDraft>,
) -> ApiResult<Fund> {
    Ok(Json(coordinator.create_fund(draft).await?))
}

async fn update_fund(
    State(coordinator): State<AppState>,
    Json(fund): Json<Fund>,
) -> ApiResult<Fund> {
    Ok(Json(coordinator.update_fund(fund).await?))
}

async fn delete_fund(
    State(coordinator): State<AppState>,
    Json(request): Json<FundDeleteRequest>,
) -> ApiResult<FundDeleted> {
    let Some(fund_id) = non_blank(request.fund_id) else {
        return Err(KbError::validation("missing or invalid fund_id").into());
    };
    let deletion = coordinator.delete_fund(&fund_id, request.force).await?;
    Ok(Json(FundDeleted {
        success: true,
        deletion,
    }))
}

/// `GET /api/manuals` parameters.
#[derive(Debug, Default, Deserialize)]
struct StepParams {
    search: Option<String>,
    document_title: Option<String>,
}

/// `DELETE /api/manuals` body.
#[derive(Debug, Deserialize)]
struct StepDeleteRequest {
    chunk_id: i32,
}

async fn list_steps(
    State(coordinator): State<AppState>,
    Query(params): Query<StepParams>,
) -> ApiResult<Vec<ManualStep>> {
    let query = StepQuery {
        search: non_blank(params.search),
        document_title: non_blank(params.document_title),
    };
    Ok(Json(coordinator.list_steps(&query).await?))
}

async fn create_step(
    State(coordinator): State<AppState>,
    Json(draft): Json<StepDraft>,
) -> ApiResult<ManualStep> {
    Ok(Json(coordinator.create_step(draft).await?))
}

async fn update_step(
    State(coordinator): State<AppState>,
    Json(step): Json<ManualStep>,
) -> ApiResult<ManualStep> {
    Ok(Json(coordinator.update_step(step).await?))
}

async fn delete_step(
    State(coordinator): State<AppState>,
    Json(request): Json<StepDeleteRequest>,
) -> ApiResult<Success> {
    coordinator.delete_step(request.chunk_id).await?;
    Ok(success())
}

/// `GET /api/scenarios` parameters.
#[derive(Debug, Default, Deserialize)]
struct ScenarioParams {
    search: Option<String>,
    tag: Option<String>,
}

/// `DELETE /api/scenarios` and `/api/faqs` body.
#[derive(Debug, Deserialize)]
struct IdRequest {
    id: i32,
}

async fn list_scenarios(
    State(coordinator): State<AppState>,
    Query(params): Query<ScenarioParams>,
) -> ApiResult<Vec<Scenario>> {
    let query = ScenarioQuery {
        search: non_blank(params.search),
        tag: non_blank(params.tag),
    };
    Ok(Json(coordinator.list_scenarios(&query).await?))
}

async fn create_scenario(
    State(coordinator): State<AppState>,
    Json(draft): Json<ScenarioDraft>,
) -> ApiResult<Scenario> {
    Ok(Json(coordinator.create_scenario(draft).await?))
}

async fn update_scenario(
    State(coordinator): State<AppState>,
    Json(scenario): Json<Scenario>,
) -> ApiResult<Scenario> {
    Ok(Json(coordinator.update_scenario(scenario).await?))
}

async fn delete_scenario(
    State(coordinator): State<AppState>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Success> {
    coordinator.delete_scenario(request.id).await?;
    Ok(success())
}

/// `GET /api/terms` parameters.
#[derive(Debug, Default, Deserialize)]
struct TermParams {
    search: Option<String>,
}

/// `DELETE /api/terms` body.
#[derive(Debug, Deserialize)]
struct TermDeleteRequest {
    word_id: String,
}

async fn list_terms(
    State(coordinator): State<AppState>,
    Query(params): Query<TermParams>,
) -> ApiResult<TermListing> {
    Ok(Json(coordinator.list_terms(params.search.as_deref()).await?))
}

async fn create_term(
    State(coordinator): State<AppState>,
    Json(draft): Json<TermDraft>,
) -> ApiResult<Term> {
    Ok(Json(coordinator.create_term(draft).await?))
}

async fn update_term(
    State(coordinator): State<AppState>,
    Json(term): Json<Term>,
) -> ApiResult<Term> {
    Ok(Json(coordinator.update_term(term).await?))
}

async fn delete_term(
    State(coordinator): State<AppState>,
    Json(request): Json<TermDeleteRequest>,
) -> ApiResult<Success> {
    coordinator.delete_term(&request.word_id).await?;
    Ok(success())
}

async fn list_faqs(State(coordinator): State<AppState>) -> ApiResult<Vec<Faq>> {
    Ok(Json(coordinator.list_faqs().await?))
}

async fn create_faq(
    State(coordinator): State<AppState>,
    Json(draft): Json<FaqDraft>,
) -> ApiResult<Faq> {
    Ok(Json(coordinator.create_faq(draft).await?))
}

async fn update_faq(State(coordinator): State<AppState>, Json(faq): Json<Faq>) -> ApiResult<Faq> {
    Ok(Json(coordinator.update_faq(faq).await?))
}

async fn delete_faq(
    State(coordinator): State<AppState>,
    Json(request): Json<IdRequest>,
) -> ApiResult<Success> {
    coordinator.delete_faq(request.id).await?;
    Ok(success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingIndex;
    use crate::regen::DisabledDispatcher;
    use crate::store::{MemoryStore, RecordStore};
    use axum::body::to_bytes;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    async fn state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .seed_fund(Fund {
                fund_id: "F-007".into(),
                fund_abbr: "ABC".into(),
                fund_name_th: Some("ทุน".into()),
                fund_name_en: None,
                fiscal_year: None,
                source_agency: None,
                start_period: None,
                end_period: None,
                status: Default::default(),
            })
            .await;
        store
            .seed_step(
                StepDraft {
                    topic: Some("ยื่นเอกสาร".into()),
                    fund_abbr: Some("ABC XYZ".into()),
                    ..StepDraft::default()
                }
                .into_step(42),
            )
            .await;
        let coordinator = Coordinator::new(
            store.clone(),
            EmbeddingIndex::default(),
            Arc::new(DisabledDispatcher),
        );
        (Arc::new(coordinator), store)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn blocked_delete_returns_conflict_payload() {
        let (state, store) = state().await;
        let request = FundDeleteRequest {
            fund_id: Some("F-007".into()),
            force: false,
        };
        let response = delete_fund(State(state), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["warning"], json!(FUND_IN_USE_WARNING));
        assert_eq!(body["fund_abbr"], json!("ABC"));
        assert_eq!(body["steps"][0]["chunk_id"], json!(42));
        assert!(store.fund("F-007").await.expect("read").is_some());
    }

    #[tokio::test]
    async fn forced_delete_reports_cascade() {
        let (state, _store) = state().await;
        let request = FundDeleteRequest {
            fund_id: Some("F-007".into()),
            force: true,
        };
        let response = delete_fund(State(state), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body,
            json!({
                "success": true,
                "fund_id": "F-007",
                "deleted_steps": [],
                "updated_steps": [42]
            })
        );
    }

    #[tokio::test]
    async fn missing_fund_id_is_bad_request() {
        let (state, _store) = state().await;
        let response = delete_fund(State(state), Json(FundDeleteRequest::default()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_records_are_not_found() {
        let (state, _store) = state().await;
        let response = delete_step(State(state.clone()), Json(StepDeleteRequest { chunk_id: 7 }))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = delete_fund(
            State(state),
            Json(FundDeleteRequest {
                fund_id: Some("F-999".into()),
                force: true,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_payload_is_bad_request() {
        let (state, _store) = state().await;
        let response = create_scenario(State(state), Json(ScenarioDraft::default()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .is_some_and(|message| message.contains("scenario_name")));
    }

    #[tokio::test]
    async fn term_listing_carries_types() {
        let (state, _store) = state().await;
        let created = create_term(
            State(state.clone()),
            Json(TermDraft {
                word: Some("ทุน".into()),
                meaning: Some("เงิน".into()),
                word_type: Some("noun".into()),
            }),
        )
        .await
        .into_response();
        assert_eq!(created.status(), StatusCode::OK);
        let listing = list_terms(State(state), Query(TermParams::default()))
            .await
            .into_response();
        let body = body_json(listing).await;
        assert_eq!(body["types"], json!(["noun"]));
        assert_eq!(body["terms"][0]["word_id"], json!("W-001"));
    }

    #[test]
    fn blank_params_are_dropped() {
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some(" x ".into())), Some("x".to_string()));
    }
}
