//! HTTP API of the node.
//!
//! Client endpoints live under `/api/v1`. Peers post envelopes to
//! [`PEER_MESSAGE_PATH`], which is what [`HttpTransport`](crate::transport::HttpTransport)
//! talks to.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use osp_channel::ChannelSummary;
use osp_core::types::amount_str;
use osp_core::{Address, Amount, ChannelId, Envelope, PayId, PayRecord, PeerReply, TokenInfo};
use osp_settlement::Receipt;
use osp_store::{HistoryOrder, HistoryQuery, PayCursor};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ErrorKind, NodeError};
use crate::node::{Node, NodeStatus, PeerStatusView};
use crate::pay_engine::SendRequest;
use crate::transport::{PeerHandler, PEER_MESSAGE_PATH};

const MAX_HISTORY_PAGE: usize = 500;

// --- Request / response types ---

#[derive(Deserialize)]
pub struct OpenChannelBody {
    pub peer: Address,
    #[serde(default = "TokenInfo::native")]
    pub token: TokenInfo,
    #[serde(with = "amount_str")]
    pub my_deposit: Amount,
    #[serde(with = "amount_str")]
    pub peer_deposit: Amount,
}

#[derive(Serialize)]
pub struct OpenChannelResponse {
    pub channel_id: ChannelId,
}

#[derive(Deserialize)]
pub struct AmountBody {
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

#[derive(Deserialize)]
pub struct WithdrawBody {
    #[serde(with = "amount_str")]
    pub amount: Amount,
    /// Return a job id right away instead of waiting for the receipt.
    #[serde(default)]
    pub nonblocking: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum WithdrawResponse {
    Done(Receipt),
    Started { job_id: Uuid },
}

#[derive(Serialize)]
pub struct SyncedResponse {
    pub synced: usize,
}

#[derive(Serialize)]
pub struct SendPaymentResponse {
    pub pay_id: PayId,
}

#[derive(Serialize)]
pub struct SettledResponse {
    pub pay_ids: Vec<PayId>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub cursor: Option<PayCursor>,
    pub order: Option<HistoryOrder>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub pays: Vec<PayRecord>,
    pub next_cursor: Option<PayCursor>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn api_error(e: NodeError) -> (StatusCode, Json<ErrorResponse>) {
    let kind = e.kind();
    let status = match (&e, kind) {
        (NodeError::UnknownPay(_) | NodeError::UnknownChannel(_), _) => StatusCode::NOT_FOUND,
        (_, ErrorKind::Protocol) => StatusCode::BAD_REQUEST,
        (_, ErrorKind::Capacity) | (_, ErrorKind::Consistency) => StatusCode::CONFLICT,
        (_, ErrorKind::Liveness) => StatusCode::SERVICE_UNAVAILABLE,
        (_, ErrorKind::Fatal) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            kind,
        }),
    )
}

// --- Handlers ---

async fn handle_status(State(node): State<Arc<Node>>) -> Json<NodeStatus> {
    Json(node.status())
}

async fn handle_channels(State(node): State<Arc<Node>>) -> Json<Vec<ChannelSummary>> {
    Json(node.channels())
}

async fn handle_channel(State(node): State<Arc<Node>>, Path(id): Path<ChannelId>) -> ApiResult<ChannelSummary> {
    node.channel(&id).map(Json).map_err(api_error)
}

async fn handle_open_channel(
    State(node): State<Arc<Node>>,
    Json(body): Json<OpenChannelBody>,
) -> ApiResult<OpenChannelResponse> {
    let channel_id = node
        .open_channel(body.peer, body.token, body.my_deposit, body.peer_deposit)
        .await
        .map_err(api_error)?;
    Ok(Json(OpenChannelResponse { channel_id }))
}

async fn handle_deposit(
    State(node): State<Arc<Node>>,
    Path(id): Path<ChannelId>,
    Json(body): Json<AmountBody>,
) -> ApiResult<Receipt> {
    node.deposit(id, body.amount).await.map(Json).map_err(api_error)
}

async fn handle_withdraw(
    State(node): State<Arc<Node>>,
    Path(id): Path<ChannelId>,
    Json(body): Json<WithdrawBody>,
) -> ApiResult<WithdrawResponse> {
    let response = if body.nonblocking {
        let job_id = node
            .cooperative_withdraw_nonblocking(id, body.amount)
            .await
            .map_err(api_error)?;
        WithdrawResponse::Started { job_id }
    } else {
        WithdrawResponse::Done(node.cooperative_withdraw(id, body.amount).await.map_err(api_error)?)
    };
    Ok(Json(response))
}

async fn handle_withdraw_job(
    State(node): State<Arc<Node>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<osp_core::WithdrawJob> {
    node.monitor_withdraw_job(&job_id).await.map(Json).map_err(api_error)
}

async fn handle_intend_withdraw(
    State(node): State<Arc<Node>>,
    Path(id): Path<ChannelId>,
    Json(body): Json<AmountBody>,
) -> ApiResult<Receipt> {
    node.intend_withdraw(id, body.amount).await.map(Json).map_err(api_error)
}

async fn handle_confirm_withdraw(State(node): State<Arc<Node>>, Path(id): Path<ChannelId>) -> ApiResult<Receipt> {
    node.confirm_withdraw(id).await.map(Json).map_err(api_error)
}

async fn handle_intend_settle(State(node): State<Arc<Node>>, Path(id): Path<ChannelId>) -> ApiResult<Receipt> {
    node.intend_settle(id).await.map(Json).map_err(api_error)
}

async fn handle_confirm_settle(State(node): State<Arc<Node>>, Path(id): Path<ChannelId>) -> ApiResult<Receipt> {
    node.confirm_settle(id).await.map(Json).map_err(api_error)
}

async fn handle_migrate(State(node): State<Arc<Node>>, Path(id): Path<ChannelId>) -> ApiResult<Receipt> {
    node.migrate_channel(id).await.map(Json).map_err(api_error)
}

async fn handle_sync_onchain(State(node): State<Arc<Node>>) -> ApiResult<SyncedResponse> {
    let synced = node.sync_onchain_channel_states().await.map_err(api_error)?;
    Ok(Json(SyncedResponse { synced }))
}

async fn handle_peer(State(node): State<Arc<Node>>, Path(peer): Path<Address>) -> Json<PeerStatusView> {
    Json(node.get_peer_status(&peer))
}

async fn handle_send_payment(
    State(node): State<Arc<Node>>,
    Json(req): Json<SendRequest>,
) -> ApiResult<SendPaymentResponse> {
    let pay_id = node.send_payment(req).await.map_err(api_error)?;
    Ok(Json(SendPaymentResponse { pay_id }))
}

async fn handle_pay_history(
    State(node): State<Arc<Node>>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<HistoryResponse> {
    let defaults = HistoryQuery::default();
    let query = HistoryQuery {
        cursor: params.cursor,
        order: params.order.unwrap_or(defaults.order),
        limit: params.limit.unwrap_or(defaults.limit).clamp(1, MAX_HISTORY_PAGE),
    };
    let page = node.get_pay_history(&query).map_err(api_error)?;
    Ok(Json(HistoryResponse {
        pays: page.pays,
        next_cursor: page.next_cursor,
    }))
}

async fn handle_pay_status(State(node): State<Arc<Node>>, Path(id): Path<PayId>) -> ApiResult<PayRecord> {
    node.get_pay_status(&id).map(Json).map_err(api_error)
}

async fn handle_confirm_pay(State(node): State<Arc<Node>>, Path(id): Path<PayId>) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    node.confirm_pay(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_reject_pay(State(node): State<Arc<Node>>, Path(id): Path<PayId>) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    node.reject_pay(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_settle_expired(State(node): State<Arc<Node>>) -> ApiResult<SettledResponse> {
    let pay_ids = node.settle_expired_pays().await.map_err(api_error)?;
    Ok(Json(SettledResponse { pay_ids }))
}

async fn handle_peer_message(State(node): State<Arc<Node>>, Json(envelope): Json<Envelope>) -> Json<PeerReply> {
    Json(node.handle_envelope(envelope).await)
}

// --- Server ---

pub fn build_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/channels", get(handle_channels).post(handle_open_channel))
        .route("/api/v1/channels/sync-onchain", post(handle_sync_onchain))
        .route("/api/v1/channels/{id}", get(handle_channel))
        .route("/api/v1/channels/{id}/deposit", post(handle_deposit))
        .route("/api/v1/channels/{id}/withdraw", post(handle_withdraw))
        .route("/api/v1/channels/{id}/intend-withdraw", post(handle_intend_withdraw))
        .route("/api/v1/channels/{id}/confirm-withdraw", post(handle_confirm_withdraw))
        .route("/api/v1/channels/{id}/intend-settle", post(handle_intend_settle))
        .route("/api/v1/channels/{id}/confirm-settle", post(handle_confirm_settle))
        .route("/api/v1/channels/{id}/migrate", post(handle_migrate))
        .route("/api/v1/withdraw-jobs/{job_id}", get(handle_withdraw_job))
        .route("/api/v1/peers/{address}", get(handle_peer))
        .route("/api/v1/payments", get(handle_pay_history).post(handle_send_payment))
        .route("/api/v1/payments/settle-expired", post(handle_settle_expired))
        .route("/api/v1/payments/{id}", get(handle_pay_status))
        .route("/api/v1/payments/{id}/confirm", post(handle_confirm_pay))
        .route("/api/v1/payments/{id}/reject", post(handle_reject_pay))
        .route(PEER_MESSAGE_PATH, post(handle_peer_message))
        .with_state(node)
}

pub async fn start_api_server<S>(listen_addr: SocketAddr, node: Arc<Node>, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app = build_router(node);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP API server started");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use osp_core::RejectCode;

    #[test]
    fn test_error_statuses() {
        let (status, body) = api_error(NodeError::UnknownPay(PayId([1; 32])));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.0.kind, ErrorKind::Protocol);

        let (status, _) = api_error(NodeError::PeerRejected {
            code: RejectCode::InsufficientBalance,
            reason: "low".into(),
        });
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = api_error(NodeError::Busy("sync".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_withdraw_body_defaults_to_blocking() {
        let body: WithdrawBody = serde_json::from_str(r#"{"amount":"25"}"#).unwrap();
        assert_eq!(body.amount, 25);
        assert!(!body.nonblocking);
    }
}
