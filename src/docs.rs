use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::{models, routes};

#[derive(OpenApi)]
#[openapi(
	paths(
		routes::health::health,
		routes::authz::my_permissions,
		routes::authz::check_permission,
		routes::departments::department_tree,
		routes::departments::get_department,
		routes::departments::department_ancestors,
		routes::departments::department_members,
		routes::departments::create_department,
		routes::departments::update_department,
		routes::departments::delete_department,
		routes::permissions::page_tree,
		routes::permissions::page_ancestors,
		routes::permissions::create_page,
		routes::permissions::set_page_active,
		routes::permissions::get_target_permissions,
		routes::permissions::update_target_permissions,
		routes::permissions::seed_target_permissions,
		routes::permissions::list_audit_logs,
		routes::permissions::verify_audit_logs,
	),
	components(
		schemas(
			routes::health::HealthResponse,
			models::user::Role,
			models::user::Member,
			models::department::Department,
			models::department::DepartmentNode,
			models::department::DepartmentCreateRequest,
			models::department::DepartmentUpdateRequest,
			models::page::PageType,
			models::page::Page,
			models::page::PageNode,
			models::page::PageCreateRequest,
			models::page::PageActiveRequest,
			models::permission::TargetType,
			models::permission::TargetPermissions,
			models::permission::UpdateTargetPermissionsRequest,
			models::permission::UpdateTargetPermissionsResponse,
			models::permission::SeedPermissionsResponse,
			models::permission::EffectivePermissions,
			models::permission::CheckResponse,
			models::audit::AuditAction,
			models::audit::AuditChange,
			models::audit::AuditChanges,
			models::audit::AuditEntry,
			models::audit::AuditLogPage,
			models::audit::ChainReport
		)
	),
	modifiers(&BearerAuth),
	tags(
		(name = "Health", description = "Liveness"),
		(name = "Authz", description = "Permission checks for the current user"),
		(name = "Departments", description = "Organization tree"),
		(name = "Permissions", description = "Page permission administration (super_admin)")
	)
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
	fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
		if let Some(components) = openapi.components.as_mut() {
			components.add_security_scheme(
				"bearerAuth",
				SecurityScheme::Http(
					HttpBuilder::new()
						.scheme(HttpAuthScheme::Bearer)
						.bearer_format("JWT")
						.build(),
				),
			);
		}
	}
}

pub fn build_openapi(port: u16) -> anyhow::Result<utoipa::openapi::OpenApi> {
	let mut doc = serde_json::to_value(ApiDoc::openapi())?;
	ensure_servers(&mut doc, port);
	Ok(serde_json::from_value(doc)?)
}

/// Swagger UI at `/docs`, backed by the JSON document at `/api-docs/openapi.json`.
pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> anyhow::Result<Router> {
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.persist_authorization(true);

	let doc_json = Arc::new(serde_json::to_value(&doc)?);

	let json_route = {
		let doc_json = Arc::clone(&doc_json);
		get(move || {
			let doc_json = Arc::clone(&doc_json);
			async move { Json((*doc_json).clone()) }
		})
	};

	Ok(Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config)))
}

fn ensure_servers(doc: &mut Value, port: u16) {
	let server_url = format!("http://localhost:{port}");

	match doc.get_mut("servers") {
		Some(Value::Array(arr)) => {
			let has = arr.iter().any(|v| v.get("url").and_then(Value::as_str) == Some(server_url.as_str()));
			if !has {
				arr.push(json!({ "url": server_url }));
			}
		}
		_ => {
			doc["servers"] = json!([{ "url": server_url }]);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn document_lists_every_route_and_bearer_scheme() {
		let doc = serde_json::to_value(build_openapi(8000).unwrap()).unwrap();

		let paths = doc["paths"].as_object().unwrap();
		assert!(paths.contains_key("/permissions/target/{target_type}/{target_id}"));
		assert!(paths.contains_key("/departments/{id}/members"));
		assert!(paths.contains_key("/authz/check/{code}"));
		assert_eq!(doc["components"]["securitySchemes"]["bearerAuth"]["scheme"], "bearer");
		assert_eq!(doc["servers"][0]["url"], "http://localhost:8000");
	}
}
