use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::{
    require_auth, require_role, AuthenticatedUser, ITEM_DELETE_ROLES, ITEM_WRITE_ROLES,
};
use crate::models::{AuditAction, InventoryItem};
use crate::services::{audit_service, Pagination};
use crate::AppState;

const ITEM_COLUMNS: &str = "id, name, sku, description, quantity, unit_price, category, \
     location, created_by, created_at, updated_at";

const NAME_MAX_LEN: usize = 255;
const SKU_MAX_LEN: usize = 100;

/// Items with a quantity below this count as low stock.
const LOW_STOCK_THRESHOLD: i32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateItemRequest {
    pub name: String,
    pub sku: String,
    #[serde(default)]
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl CreateItemRequest {
    fn validate(&self) -> AppResult<()> {
        validate_name(&self.name)?;
        validate_sku(&self.sku)?;
        validate_quantity(self.quantity)?;
        validate_unit_price(self.unit_price)
    }
}

/// Absent fields are left untouched; there is no way to null a field out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateItemRequest {
    pub name: Option<String>,
    pub sku: Option<String>,
    pub description: Option<String>,
    pub quantity: Option<i32>,
    pub unit_price: Option<f64>,
    pub category: Option<String>,
    pub location: Option<String>,
}

impl UpdateItemRequest {
    fn validate(&self) -> AppResult<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(sku) = &self.sku {
            validate_sku(sku)?;
        }
        if let Some(quantity) = self.quantity {
            validate_quantity(quantity)?;
        }
        if let Some(unit_price) = self.unit_price {
            validate_unit_price(unit_price)?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.chars().count() > NAME_MAX_LEN {
        return Err(AppError::Validation(format!(
            "Name must be between 1 and {} characters",
            NAME_MAX_LEN
        )));
    }
    Ok(())
}

fn validate_sku(sku: &str) -> AppResult<()> {
    if sku.is_empty() || sku.chars().count() > SKU_MAX_LEN {
        return Err(AppError::Validation(format!(
            "SKU must be between 1 and {} characters",
            SKU_MAX_LEN
        )));
    }
    Ok(())
}

fn validate_quantity(quantity: i32) -> AppResult<()> {
    if quantity < 0 {
        return Err(AppError::Validation(
            "Quantity must be non-negative".to_string(),
        ));
    }
    Ok(())
}

fn validate_unit_price(unit_price: f64) -> AppResult<()> {
    if !unit_price.is_finite() || unit_price < 0.0 {
        return Err(AppError::Validation(
            "Unit price must be non-negative".to_string(),
        ));
    }
    Ok(())
}

/// Field-level diff between the stored item and an update request. Returns
/// the `{field: {old, new}}` map and the item with the changes applied;
/// unchanged or absent fields do not participate.
fn compute_changes(
    current: &InventoryItem,
    update: &UpdateItemRequest,
) -> (Map<String, Value>, InventoryItem) {
    let mut changes = Map::new();
    let mut updated = current.clone();

    if let Some(name) = &update.name {
        if *name != current.name {
            changes.insert("name".to_string(), json!({ "old": current.name, "new": name }));
            updated.name = name.clone();
        }
    }
    if let Some(sku) = &update.sku {
        if *sku != current.sku {
            changes.insert("sku".to_string(), json!({ "old": current.sku, "new": sku }));
            updated.sku = sku.clone();
        }
    }
    if let Some(description) = &update.description {
        if current.description.as_deref() != Some(description.as_str()) {
            changes.insert(
                "description".to_string(),
                json!({ "old": current.description, "new": description }),
            );
            updated.description = Some(description.clone());
        }
    }
    if let Some(quantity) = update.quantity {
        if quantity != current.quantity {
            changes.insert(
                "quantity".to_string(),
                json!({ "old": current.quantity, "new": quantity }),
            );
            updated.quantity = quantity;
        }
    }
    if let Some(unit_price) = update.unit_price {
        if unit_price != current.unit_price {
            changes.insert(
                "unit_price".to_string(),
                json!({ "old": current.unit_price, "new": unit_price }),
            );
            updated.unit_price = unit_price;
        }
    }
    if let Some(category) = &update.category {
        if current.category.as_deref() != Some(category.as_str()) {
            changes.insert(
                "category".to_string(),
                json!({ "old": current.category, "new": category }),
            );
            updated.category = Some(category.clone());
        }
    }
    if let Some(location) = &update.location {
        if current.location.as_deref() != Some(location.as_str()) {
            changes.insert(
                "location".to_string(),
                json!({ "old": current.location, "new": location }),
            );
            updated.location = Some(location.clone());
        }
    }

    (changes, updated)
}

fn sku_conflict(e: sqlx::Error, sku: &str) -> AppError {
    if e.to_string().contains("unique") || e.to_string().contains("duplicate") {
        AppError::Conflict(format!("Item with SKU '{}' already exists", sku))
    } else {
        AppError::from(e)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Deserialize)]
struct ListItemsFilter {
    search: Option<String>,
    category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InventoryStats {
    pub total_items: i64,
    pub total_value: f64,
    pub low_stock_items: i64,
    pub categories_count: i64,
}

async fn list_items(
    State(state): State<AppState>,
    Query(filter): Query<ListItemsFilter>,
    Query(page): Query<Pagination>,
) -> AppResult<Json<Vec<InventoryItem>>> {
    let (skip, limit) = page.clamp();

    // Build the WHERE clause dynamically; OFFSET/LIMIT params follow the
    // filter params.
    let mut conditions = Vec::new();
    let mut param_idx = 1u32;

    let search_pattern = filter
        .search
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s));
    if search_pattern.is_some() {
        conditions.push(format!(
            "(name ILIKE ${i} OR sku ILIKE ${i} OR description ILIKE ${i})",
            i = param_idx
        ));
        param_idx += 1;
    }

    let category_filter = filter.category.as_deref().filter(|s| !s.is_empty());
    if category_filter.is_some() {
        conditions.push(format!("category = ${}", param_idx));
        param_idx += 1;
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT {} FROM inventory_items {} ORDER BY created_at DESC OFFSET ${} LIMIT ${}",
        ITEM_COLUMNS,
        where_clause,
        param_idx,
        param_idx + 1
    );

    let mut query = sqlx::query_as::<_, InventoryItem>(&sql);
    if let Some(ref pattern) = search_pattern {
        query = query.bind(pattern);
    }
    if let Some(category) = category_filter {
        query = query.bind(category);
    }

    let items = query
        .bind(skip)
        .bind(limit)
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(items))
}

async fn get_stats(State(state): State<AppState>) -> AppResult<Json<InventoryStats>> {
    #[derive(sqlx::FromRow)]
    struct StatsRow {
        total_items: i64,
        total_value: Option<f64>,
        low_stock_items: i64,
        categories_count: i64,
    }

    let row: StatsRow = sqlx::query_as(
        "SELECT COUNT(*) AS total_items, \
         SUM(quantity * unit_price) AS total_value, \
         COUNT(*) FILTER (WHERE quantity < $1) AS low_stock_items, \
         COUNT(DISTINCT category) AS categories_count \
         FROM inventory_items",
    )
    .bind(LOW_STOCK_THRESHOLD)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(InventoryStats {
        total_items: row.total_items,
        total_value: round2(row.total_value.unwrap_or(0.0)),
        low_stock_items: row.low_stock_items,
        categories_count: row.categories_count,
    }))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<InventoryItem>> {
    let item: Option<InventoryItem> = sqlx::query_as(&format!(
        "SELECT {} FROM inventory_items WHERE id = $1",
        ITEM_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&state.pool)
    .await?;

    match item {
        Some(item) => Ok(Json(item)),
        None => Err(AppError::NotFound(format!(
            "Inventory item with id {} not found",
            id
        ))),
    }
}

async fn create_item(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(actor)): Extension<AuthenticatedUser>,
    Json(req): Json<CreateItemRequest>,
) -> AppResult<(StatusCode, Json<InventoryItem>)> {
    require_role(&actor, ITEM_WRITE_ROLES)?;
    req.validate()?;

    let mut tx = state.pool.begin().await?;

    // Pre-check gives the friendly error; the unique constraint on sku is
    // what actually guards against concurrent creates.
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM inventory_items WHERE sku = $1)")
            .bind(&req.sku)
            .fetch_one(&mut *tx)
            .await?;
    if exists {
        return Err(AppError::Conflict(format!(
            "Item with SKU '{}' already exists",
            req.sku
        )));
    }

    let item: InventoryItem = sqlx::query_as(&format!(
        "INSERT INTO inventory_items \
         (name, sku, description, quantity, unit_price, category, location, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {}",
        ITEM_COLUMNS
    ))
    .bind(&req.name)
    .bind(&req.sku)
    .bind(&req.description)
    .bind(req.quantity)
    .bind(req.unit_price)
    .bind(&req.category)
    .bind(&req.location)
    .bind(actor.id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| sku_conflict(e, &req.sku))?;

    let snapshot = serde_json::to_value(&req)
        .map_err(|e| AppError::Internal(format!("Failed to serialize snapshot: {}", e)))?;
    audit_service::record(
        &mut tx,
        AuditAction::Create,
        Some(item.id),
        actor.id,
        Some(&snapshot),
    )
    .await?;

    tx.commit().await?;

    tracing::info!("Item {} created by {}", item.sku, actor.username);
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update_item(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(actor)): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateItemRequest>,
) -> AppResult<Json<InventoryItem>> {
    require_role(&actor, ITEM_WRITE_ROLES)?;
    req.validate()?;

    let mut tx = state.pool.begin().await?;

    let current: Option<InventoryItem> = sqlx::query_as(&format!(
        "SELECT {} FROM inventory_items WHERE id = $1",
        ITEM_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let current = current.ok_or_else(|| {
        AppError::NotFound(format!("Inventory item with id {} not found", id))
    })?;

    let (changes, updated) = compute_changes(&current, &req);
    if changes.is_empty() {
        // Idempotent no-op: the row is untouched and nothing is audited.
        return Ok(Json(current));
    }

    let item: InventoryItem = sqlx::query_as(&format!(
        "UPDATE inventory_items SET name = $1, sku = $2, description = $3, quantity = $4, \
         unit_price = $5, category = $6, location = $7, updated_at = NOW() \
         WHERE id = $8 \
         RETURNING {}",
        ITEM_COLUMNS
    ))
    .bind(&updated.name)
    .bind(&updated.sku)
    .bind(&updated.description)
    .bind(updated.quantity)
    .bind(updated.unit_price)
    .bind(&updated.category)
    .bind(&updated.location)
    .bind(id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| sku_conflict(e, &updated.sku))?;

    audit_service::record(
        &mut tx,
        AuditAction::Update,
        Some(id),
        actor.id,
        Some(&Value::Object(changes)),
    )
    .await?;

    tx.commit().await?;
    Ok(Json(item))
}

async fn delete_item(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(actor)): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    require_role(&actor, ITEM_DELETE_ROLES)?;

    let mut tx = state.pool.begin().await?;

    let current: Option<InventoryItem> = sqlx::query_as(&format!(
        "SELECT {} FROM inventory_items WHERE id = $1",
        ITEM_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let current = current.ok_or_else(|| {
        AppError::NotFound(format!("Inventory item with id {} not found", id))
    })?;

    // Audit first: item_id carries no FK, so the entry keeps referencing
    // the item after the row is gone.
    audit_service::record(
        &mut tx,
        AuditAction::Delete,
        Some(id),
        actor.id,
        Some(&json!({ "deleted_item": current.name })),
    )
    .await?;

    sqlx::query("DELETE FROM inventory_items WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!("Item {} deleted by {}", current.sku, actor.username);
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/inventory", get(list_items).post(create_item))
        .route("/inventory/stats", get(get_stats))
        .route(
            "/inventory/:id",
            get(get_item).put(update_item).delete(delete_item),
        )
        .route_layer(from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_item() -> InventoryItem {
        InventoryItem {
            id: Uuid::new_v4(),
            name: "Widget".to_string(),
            sku: "SKU-1".to_string(),
            description: Some("A widget".to_string()),
            quantity: 5,
            unit_price: 10.0,
            category: None,
            location: Some("A1".to_string()),
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_identical_update_produces_empty_diff() {
        let item = sample_item();
        let update = UpdateItemRequest {
            name: Some("Widget".to_string()),
            quantity: Some(5),
            unit_price: Some(10.0),
            ..Default::default()
        };
        let (changes, updated) = compute_changes(&item, &update);
        assert!(changes.is_empty());
        assert_eq!(updated.quantity, item.quantity);
    }

    #[test]
    fn test_diff_contains_exactly_the_changed_fields() {
        let item = sample_item();
        let update = UpdateItemRequest {
            name: Some("Widget".to_string()),
            quantity: Some(8),
            ..Default::default()
        };
        let (changes, updated) = compute_changes(&item, &update);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes["quantity"], json!({ "old": 5, "new": 8 }));
        assert_eq!(updated.quantity, 8);
        assert_eq!(updated.name, "Widget");
    }

    #[test]
    fn test_diff_records_old_null_for_unset_optional_field() {
        let item = sample_item();
        let update = UpdateItemRequest {
            category: Some("tools".to_string()),
            ..Default::default()
        };
        let (changes, updated) = compute_changes(&item, &update);

        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes["category"],
            json!({ "old": Value::Null, "new": "tools" })
        );
        assert_eq!(updated.category.as_deref(), Some("tools"));
    }

    #[test]
    fn test_absent_fields_do_not_participate() {
        let item = sample_item();
        let (changes, updated) = compute_changes(&item, &UpdateItemRequest::default());
        assert!(changes.is_empty());
        assert_eq!(updated.location.as_deref(), Some("A1"));
    }

    #[test]
    fn test_create_validation_bounds() {
        let valid = CreateItemRequest {
            name: "Widget".to_string(),
            sku: "SKU-1".to_string(),
            description: None,
            quantity: 0,
            unit_price: 0.0,
            category: None,
            location: None,
        };
        assert!(valid.validate().is_ok());

        let mut empty_name = valid.clone();
        empty_name.name = String::new();
        assert!(empty_name.validate().is_err());

        let mut long_sku = valid.clone();
        long_sku.sku = "x".repeat(SKU_MAX_LEN + 1);
        assert!(long_sku.validate().is_err());

        let mut negative_quantity = valid.clone();
        negative_quantity.quantity = -1;
        assert!(negative_quantity.validate().is_err());

        let mut negative_price = valid.clone();
        negative_price.unit_price = -0.01;
        assert!(negative_price.validate().is_err());

        let mut nan_price = valid.clone();
        nan_price.unit_price = f64::NAN;
        assert!(nan_price.validate().is_err());
    }

    #[test]
    fn test_update_validation_checks_present_fields_only() {
        assert!(UpdateItemRequest::default().validate().is_ok());

        let bad = UpdateItemRequest {
            quantity: Some(-3),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_create_snapshot_serializes_every_field() {
        let req = CreateItemRequest {
            name: "Widget".to_string(),
            sku: "SKU-1".to_string(),
            description: None,
            quantity: 5,
            unit_price: 10.0,
            category: Some("tools".to_string()),
            location: None,
        };
        let snapshot = serde_json::to_value(&req).unwrap();
        assert_eq!(snapshot["name"], "Widget");
        assert_eq!(snapshot["quantity"], 5);
        assert_eq!(snapshot["description"], Value::Null);
        assert_eq!(snapshot.as_object().unwrap().len(), 7);
    }

    #[test]
    fn test_total_value_rounding() {
        // (qty=5, price=10) + (qty=20, price=2) => 90.00
        assert_eq!(round2(5.0 * 10.0 + 20.0 * 2.0), 90.0);
        assert_eq!(round2(16.666), 16.67);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn test_low_stock_threshold() {
        assert_eq!(LOW_STOCK_THRESHOLD, 10);
    }
}
