//! Admin API handlers for module management.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header to match the
//! configured admin token. Tokens are compared in constant time.
//!
//! # Endpoints
//!
//! - `POST /admin/modules` - Upload and register a module
//! - `GET /admin/modules` - List registered modules (detailed)
//! - `GET /admin/modules/:id` - Get module info
//! - `DELETE /admin/modules/:id` - Deregister a module

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::Multipart;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use capsule_core::module_ref::DEFAULT_VERSION;
use capsule_core::{Engine, ModuleRef};

use crate::response::ErrorBody;
use crate::state::AppState;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    /// Application state.
    pub app_state: AppState,
    /// Expected admin token.
    pub admin_token: String,
}

/// Module information for API responses.
#[derive(Debug, Serialize)]
pub struct ModuleInfo {
    /// Job type the module is registered under.
    pub id: String,
    /// Module name.
    pub name: String,
    /// Module version.
    pub version: String,
    /// Hash of the module bytes.
    pub content_hash: String,
    /// Module size in bytes.
    pub size: usize,
}

impl ModuleInfo {
    fn new(id: String, module_ref: &ModuleRef) -> Self {
        Self {
            id,
            name: module_ref.name().to_string(),
            version: module_ref.version().to_string(),
            content_hash: module_ref.content_hash(),
            size: module_ref.len(),
        }
    }
}

/// A module pulled out of an upload form.
#[derive(Debug)]
struct Upload {
    id: String,
    version: Option<String>,
    bytes: Vec<u8>,
}

/// Build the Admin API router.
///
/// The admin state travels as an [`Extension`] so the router can be nested
/// into the main router regardless of its state type.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/modules", get(list_modules_admin).post(upload_module))
        .route("/modules/:id", get(get_module_info).delete(delete_module))
        .layer(Extension(admin_state))
}

fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), ErrorBody> {
    let Some(token) = headers.get(ADMIN_TOKEN_HEADER) else {
        return Err(ErrorBody::new(
            StatusCode::UNAUTHORIZED,
            "Missing X-Admin-Token header",
        ));
    };

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ErrorBody::new(StatusCode::UNAUTHORIZED, "Invalid admin token"))
    }
}

fn require_engine(state: &AdminState) -> Result<&Engine, ErrorBody> {
    state.app_state.engine().ok_or_else(|| {
        ErrorBody::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "executor not fully configured",
        )
    })
}

fn not_found(id: &str) -> ErrorBody {
    ErrorBody::new(StatusCode::NOT_FOUND, format!("Module not found: {id}"))
}

/// Upload a module and register it under its id.
///
/// # Request
///
/// `POST /admin/modules`, `multipart/form-data` with fields:
/// - `id` (optional): Job type (defaults to the file stem)
/// - `version` (optional): Module version
/// - `file` or `wasm` or `module`: The WebAssembly binary
///
/// The module is compiled and initialized before it replaces any module
/// registered under the same id, so a broken upload leaves the previous one
/// serving.
#[instrument(skip(admin_state, headers, multipart))]
pub async fn upload_module(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }
    let options = match require_engine(&admin_state) {
        Ok(engine) => engine.default_options().with_pre_warm(true),
        Err(e) => return e.into_response(),
    };

    let upload = match extract_module_from_multipart(multipart).await {
        Ok(upload) => upload,
        Err(msg) => {
            warn!(error = msg, "Failed to extract module from request");
            return ErrorBody::new(StatusCode::BAD_REQUEST, msg).into_response();
        }
    };

    let version = upload.version.as_deref().unwrap_or(DEFAULT_VERSION);
    let module_ref = ModuleRef::new(upload.id.clone(), version, upload.bytes);
    let info = ModuleInfo::new(upload.id.clone(), &module_ref);

    let state = admin_state.app_state.clone();
    let id = upload.id;
    let registered = tokio::task::spawn_blocking(move || {
        state.executor().register(&id, module_ref, options)
    })
    .await;

    match registered {
        Ok(Ok(())) => {
            info!(id = %info.id, version = %info.version, hash = %info.content_hash, "Module uploaded");
            (StatusCode::CREATED, Json(info)).into_response()
        }
        Ok(Err(e)) => {
            warn!(id = %info.id, error = %e, "Module registration failed");
            ErrorBody::new(StatusCode::BAD_REQUEST, format!("Registration failed: {e}"))
                .into_response()
        }
        Err(e) => {
            warn!(id = %info.id, error = %e, "Registration task failed");
            ErrorBody::unknown().into_response()
        }
    }
}

/// Deregister a module.
#[instrument(skip(admin_state, headers))]
pub async fn delete_module(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(module_id): Path<String>,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }
    let engine = match require_engine(&admin_state) {
        Ok(engine) => engine,
        Err(e) => return e.into_response(),
    };

    if engine.deregister(&module_id) {
        info!(id = %module_id, "Module deleted");
        Json(serde_json::json!({
            "id": module_id,
            "message": "Module deleted successfully"
        }))
        .into_response()
    } else {
        not_found(&module_id).into_response()
    }
}

/// Get module information.
#[instrument(skip(admin_state, headers))]
pub async fn get_module_info(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(module_id): Path<String>,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }
    let engine = match require_engine(&admin_state) {
        Ok(engine) => engine,
        Err(e) => return e.into_response(),
    };

    match engine.module_ref(&module_id) {
        Some(module_ref) => Json(ModuleInfo::new(module_id, &module_ref)).into_response(),
        None => not_found(&module_id).into_response(),
    }
}

/// List registered modules with their details.
#[instrument(skip(admin_state, headers))]
pub async fn list_modules_admin(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }
    let engine = match require_engine(&admin_state) {
        Ok(engine) => engine,
        Err(e) => return e.into_response(),
    };

    let modules: Vec<ModuleInfo> = engine
        .registered()
        .into_iter()
        .filter_map(|id| {
            let module_ref = engine.module_ref(&id)?;
            Some(ModuleInfo::new(id, &module_ref))
        })
        .collect();
    let count = modules.len();

    Json(serde_json::json!({
        "modules": modules,
        "count": count
    }))
    .into_response()
}

async fn extract_module_from_multipart(mut multipart: Multipart) -> Result<Upload, &'static str> {
    let mut id: Option<String> = None;
    let mut version: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| "Malformed multipart body")?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "id" | "module_id" => {
                id = Some(field.text().await.map_err(|_| "Invalid id field")?);
            }
            "version" => {
                version = Some(field.text().await.map_err(|_| "Invalid version field")?);
            }
            "file" | "wasm" | "module" => {
                if id.is_none() {
                    id = field
                        .file_name()
                        .and_then(|f| std::path::Path::new(f).file_stem())
                        .and_then(|s| s.to_str())
                        .map(ToString::to_string);
                }
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|_| "Failed to read file")?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let id = id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty());
    match (id, bytes) {
        (Some(id), Some(bytes)) => Ok(Upload { id, version, bytes }),
        (None, Some(_)) => Err("Missing module id"),
        (_, None) => Err("Missing wasm file"),
    }
}
