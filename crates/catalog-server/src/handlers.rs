use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use catalog_cache::{ListParams, SortOrder, keys::DEFAULT_LIMIT};

use crate::error::ApiError;
use crate::server::AppState;
use crate::store::{NewOrder, NewProduct, NewUser, Product, ProductPage, Tag};

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("invalid id `{raw}`")))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub sort: Option<String>,
    pub name: Option<String>,
}

impl ListQuery {
    fn into_params(self) -> ApiResult<ListParams> {
        let limit = match self.limit.as_deref() {
            None | Some("") => DEFAULT_LIMIT,
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| ApiError::bad_request("limit must be an integer between 1 and 100"))?,
        };
        let offset = match self.offset.as_deref() {
            None | Some("") => 0,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ApiError::bad_request("offset must be a non-negative integer"))?,
        };
        let sort = match self.sort.as_deref() {
            None | Some("") => SortOrder::default(),
            Some(raw) => raw
                .parse::<SortOrder>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
        };
        ListParams::new(limit, offset, sort, self.name.as_deref())
            .map_err(|e| ApiError::bad_request(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct ProductBody {
    pub name: String,
    pub price_cents: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagIdsBody {
    pub tag_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct TagBody {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ProductResponse {
    pub product: Product,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct ProductListResponse {
    #[serde(flatten)]
    pub page: ProductPage,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct TagsResponse {
    pub tags: Vec<Tag>,
    pub cached: bool,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let checks = state.service.health().await;
    let healthy = checks.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "checks": checks,
            "cacheMode": state.service.cache_mode(),
        })),
    )
}

pub async fn invalidate_cache(State(state): State<AppState>) -> ApiResult<StatusCode> {
    if state.service.clear_cache().await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::unavailable("cache clear failed"))
    }
}

pub async fn list_products(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<ProductListResponse>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let params = query.into_params()?;
    let page = state.service.list_products(params).await?;
    Ok(Json(ProductListResponse {
        page: page.value,
        cached: page.cached,
    }))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProductResponse>> {
    let product = state.service.get_product(parse_id(&id)?).await?;
    Ok(Json(ProductResponse {
        product: product.value,
        cached: product.cached,
    }))
}

pub async fn create_product(
    State(state): State<AppState>,
    body: Result<Json<ProductBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let body = json_body(body)?;
    let product = state
        .service
        .create_product(NewProduct {
            name: body.name,
            price_cents: body.price_cents,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "product": product }))))
}

pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ProductBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_id(&id)?;
    let body = json_body(body)?;
    let product = state
        .service
        .update_product(
            id,
            NewProduct {
                name: body.name,
                price_cents: body.price_cents,
            },
        )
        .await?;
    Ok(Json(json!({ "product": product })))
}

pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_product(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_product_tags(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TagsResponse>> {
    let tags = state.service.product_tags(parse_id(&id)?).await?;
    Ok(Json(TagsResponse {
        tags: tags.value,
        cached: tags.cached,
    }))
}

pub async fn attach_product_tags(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<TagIdsBody>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    let body = json_body(body)?;
    state.service.attach_tags(id, &body.tag_ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn replace_product_tags(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<TagIdsBody>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    let body = json_body(body)?;
    state.service.replace_tags(id, &body.tag_ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_tags(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let tags = state.service.list_tags().await?;
    Ok(Json(json!({ "tags": tags })))
}

pub async fn create_tag(
    State(state): State<AppState>,
    body: Result<Json<TagBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let body = json_body(body)?;
    let tag = state.service.create_tag(&body.name).await?;
    Ok((StatusCode::CREATED, Json(json!({ "tag": tag }))))
}

pub async fn list_users(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let users = state.service.list_users().await?;
    Ok(Json(json!({ "users": users })))
}

pub async fn create_user(
    State(state): State<AppState>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let user = state.service.create_user(json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(json!({ "user": user }))))
}

pub async fn get_user_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let orders = state.service.user_orders(parse_id(&user_id)?).await?;
    Ok(Json(json!({ "orders": orders })))
}

pub async fn create_order(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    body: Result<Json<NewOrder>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let user_id = parse_id(&user_id)?;
    let order = state.service.create_order(user_id, json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(json!({ "order": order }))))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let order = state.service.get_order(parse_id(&id)?).await?;
    Ok(Json(json!({ "order": order })))
}

pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => ApiError::unavailable("metrics recorder not installed").into_response(),
    }
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("Route not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_defaults() {
        let params = ListQuery::default().into_params().unwrap();
        assert_eq!(params, ListParams::default());
    }

    #[test]
    fn list_query_rejects_bad_values() {
        let query = ListQuery {
            limit: Some("0".into()),
            ..ListQuery::default()
        };
        assert!(query.into_params().is_err());

        let query = ListQuery {
            sort: Some("random".into()),
            ..ListQuery::default()
        };
        assert!(query.into_params().is_err());

        let query = ListQuery {
            offset: Some("-1".into()),
            ..ListQuery::default()
        };
        assert!(query.into_params().is_err());
    }

    #[test]
    fn list_query_normalizes_name() {
        let query = ListQuery {
            limit: Some("5".into()),
            sort: Some("price_asc".into()),
            name: Some("  Lamp ".into()),
            ..ListQuery::default()
        };
        let params = query.into_params().unwrap();
        assert_eq!(params.limit, 5);
        assert_eq!(params.sort, SortOrder::PriceAsc);
        assert_eq!(params.name.as_deref(), Some("lamp"));
    }
}
