//! Routes under the resource prefix: results endpoint and viewer assets.
//!
//! The results endpoint is what the viewer calls for each profile id it
//! learns about. The first fetch marks the profile as viewed and records any
//! browser timings posted with it, then re-stores the profile so later
//! fetches see the same state.

use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Query, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use http::{Method, StatusCode, Uri, header};
use miniprof_core::{ClientTimingsExt, MiniProfiler, RESOURCE_PATH, RequestInfo};
use miniprof_schemas::ClientTimings;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::WebError;
use crate::html::{INCLUDES_CSS, INCLUDES_JS, render_share};

/// Cache policy for the viewer assets. Asset URLs carry the version, so a
/// new release is fetched regardless.
const ASSET_CACHE_CONTROL: &str = "public, max-age=3600";

/// Builds the router serving everything under the resource prefix.
///
/// Merge it into the host application's router; it carries its own state.
pub fn resources_router(mp: MiniProfiler) -> Router {
    let state = Arc::new(mp);
    Router::new()
        .route(
            &format!("{RESOURCE_PATH}results"),
            get(results_handler).post(results_handler),
        )
        .route(&format!("{RESOURCE_PATH}includes.js"), get(js_handler))
        .route(&format!("{RESOURCE_PATH}includes.css"), get(css_handler))
        .route(&format!("{RESOURCE_PATH}{{*rest}}"), get(not_found))
        .with_state(state)
}

/// Serves one stored profile as JSON (`popup=1`) or as the share page.
///
/// Parameters come from the query string and, for POST, from a form body;
/// body values are looked up first. Answers 404 for a missing, malformed or
/// unknown id.
#[instrument(level = "debug", skip_all, fields(uri = %uri))]
async fn results_handler(
    State(mp): State<Arc<MiniProfiler>>,
    method: Method,
    uri: Uri,
    body: Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Result<Response, WebError> {
    let mut pairs = match body {
        Ok(Form(pairs)) if method == Method::POST => pairs,
        _ => Vec::new(),
    };
    if let Ok(Query(query)) = Query::<Vec<(String, String)>>::try_from_uri(&uri) {
        pairs.extend(query);
    }
    let value = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let Some(id) = value("id").and_then(|id| Uuid::parse_str(id).ok()) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let popup = value("popup") == Some("1");

    let request = RequestInfo::new(method.as_str(), uri.to_string());
    let store = Arc::clone(&mp);
    let lookup = request.clone();
    let loaded = tokio::task::spawn_blocking(move || store.load(&lookup, id))
        .await
        .map_err(WebError::task)?
        .map_err(WebError::storage)?;
    let Some(mut profile) = loaded else {
        debug!(%id, "no such profile");
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    let mut changed = false;
    if profile.client_timings.is_none() {
        profile.client_timings =
            ClientTimings::from_form(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        changed |= profile.client_timings.is_some();
    }
    if !profile.has_user_viewed {
        profile.has_user_viewed = true;
        changed = true;
    }
    if changed {
        let store = Arc::clone(&mp);
        let updated = profile.clone();
        tokio::task::spawn_blocking(move || store.store(&request, &updated))
            .await
            .map_err(WebError::task)?;
    }

    if popup {
        let json = profile.to_json().map_err(WebError::serialize)?;
        return Ok(([(header::CONTENT_TYPE, "application/json")], json).into_response());
    }
    let page = render_share(&profile, mp.render_options())?;
    Ok(Html(page).into_response())
}

/// Serves the viewer script with the correct content type.
async fn js_handler() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/javascript; charset=utf-8"),
            (header::CACHE_CONTROL, ASSET_CACHE_CONTROL),
        ],
        INCLUDES_JS,
    )
}

/// Serves the viewer stylesheet with the correct content type.
async fn css_handler() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/css; charset=utf-8"),
            (header::CACHE_CONTROL, ASSET_CACHE_CONTROL),
        ],
        INCLUDES_CSS,
    )
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::Request;
    use http_body_util::BodyExt;
    use miniprof_core::{MemoryStorage, Storage};
    use miniprof_schemas::{Profile, Timing};
    use tower::ServiceExt;

    use super::*;

    fn stored_profile() -> (Arc<MemoryStorage>, MiniProfiler, Profile) {
        let storage = Arc::new(MemoryStorage::new());
        let mp = MiniProfiler::with_shared_storage(storage.clone());
        let profile = Profile {
            id: Uuid::new_v4(),
            name: "GET /orders".into(),
            root: Timing::new("GET /orders"),
            duration_milliseconds: 8.0,
            ..Profile::default()
        };
        storage
            .save(&RequestInfo::default(), &profile)
            .unwrap();
        (storage, mp, profile)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>, Option<String>) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec(), content_type)
    }

    #[tokio::test]
    async fn popup_returns_json_and_marks_viewed() {
        let (storage, mp, profile) = stored_profile();
        let uri = format!("{RESOURCE_PATH}results?id={}&popup=1", profile.id);

        let (status, body, content_type) = get(resources_router(mp), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));

        let returned: Profile = serde_json::from_slice(&body).unwrap();
        assert_eq!(returned.id, profile.id);
        assert!(returned.has_user_viewed);

        let stored = storage
            .load(&RequestInfo::default(), profile.id)
            .unwrap()
            .unwrap();
        assert!(stored.has_user_viewed);
    }

    #[tokio::test]
    async fn client_timings_are_recorded_once() {
        let (storage, mp, profile) = stored_profile();
        let uri = format!(
            "{RESOURCE_PATH}results?id={}&popup=1\
             &clientPerformance%5Btiming%5D%5BnavigationStart%5D=1000\
             &clientPerformance%5Btiming%5D%5BloadEventStart%5D=1200\
             &clientPerformance%5Btiming%5D%5BloadEventEnd%5D=1250",
            profile.id
        );

        let (status, _, _) = get(resources_router(mp.clone()), &uri).await;
        assert_eq!(status, StatusCode::OK);
        let stored = storage
            .load(&RequestInfo::default(), profile.id)
            .unwrap()
            .unwrap();
        let timings = stored.client_timings.expect("client timings stored");
        assert_eq!(timings.timings[0].name, "Load Event");
        assert_eq!((timings.timings[0].start, timings.timings[0].duration), (200, 50));

        // A later report does not replace the first.
        let later = uri.replace("=1250", "=1900");
        get(resources_router(mp), &later).await;
        let stored = storage
            .load(&RequestInfo::default(), profile.id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.client_timings.unwrap().timings[0].duration, 50);
    }

    #[tokio::test]
    async fn post_merges_query_and_form_body() {
        let (storage, mp, profile) = stored_profile();
        let request = Request::builder()
            .method("POST")
            .uri(format!("{RESOURCE_PATH}results?id={}&popup=1", profile.id))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(
                "clientPerformance%5Btiming%5D%5BnavigationStart%5D=1000\
                 &clientPerformance%5Btiming%5D%5BfetchStart%5D=1004",
            ))
            .unwrap();

        let resp = resources_router(mp).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let stored = storage
            .load(&RequestInfo::default(), profile.id)
            .unwrap()
            .unwrap();
        let timings = stored.client_timings.expect("client timings stored");
        assert_eq!(timings.timings[0].name, "Fetch");
        assert_eq!(timings.timings[0].start, 4);
    }

    #[tokio::test]
    async fn post_without_form_body_uses_query() {
        let (_storage, mp, profile) = stored_profile();
        let request = Request::builder()
            .method("POST")
            .uri(format!("{RESOURCE_PATH}results?id={}&popup=1", profile.id))
            .body(Body::empty())
            .unwrap();

        let resp = resources_router(mp).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn share_page_is_html() {
        let (_storage, mp, profile) = stored_profile();
        let uri = format!("{RESOURCE_PATH}results?id={}", profile.id);

        let (status, body, content_type) = get(resources_router(mp), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        let html = String::from_utf8(body).unwrap();
        assert!(html.contains("GET /orders (8 ms)"));
        assert!(html.contains(&format!("data-current-id=\"{}\"", profile.id)));
    }

    #[tokio::test]
    async fn unknown_or_malformed_id_is_404() {
        let (_storage, mp, _profile) = stored_profile();
        let unknown = format!("{RESOURCE_PATH}results?id={}", Uuid::new_v4());
        let (status, _, _) = get(resources_router(mp.clone()), &unknown).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let malformed = format!("{RESOURCE_PATH}results?id=not-a-uuid");
        let (status, _, _) = get(resources_router(mp.clone()), &malformed).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let missing = format!("{RESOURCE_PATH}results");
        let (status, _, _) = get(resources_router(mp), &missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn assets_have_content_types() {
        let (_storage, mp, _profile) = stored_profile();
        let (status, body, content_type) =
            get(resources_router(mp.clone()), &format!("{RESOURCE_PATH}includes.js")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/javascript"));
        assert!(!body.is_empty());

        let (status, _, content_type) =
            get(resources_router(mp), &format!("{RESOURCE_PATH}includes.css")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/css"));
    }

    #[tokio::test]
    async fn other_resource_paths_are_404() {
        let (_storage, mp, _profile) = stored_profile();
        let (status, _, _) =
            get(resources_router(mp), &format!("{RESOURCE_PATH}jquery.js")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
