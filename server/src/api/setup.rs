// Setup endpoints
//
// GET/POST /setup render the wizard or redirect to the settings page once installed.
// GET /setup/first is the post-install finalizer.

use axum::extract::State;
use axum::http::header::{COOKIE, HOST, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Form, Json};
use log::{info, warn};

use crate::auth::{cookie_value, session_cookie, SignedIn};
use crate::config_store::keys;
use crate::error::SetupResult;
use crate::models::requests::ConfigureForm;
use crate::models::responses::SetupPage;
use crate::models::state::AppState;
use crate::setup::configure::RequestContext;
use crate::setup::IndexOutcome;

fn request_context(state: &AppState, headers: &HeaderMap) -> RequestContext {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", state.settings.server.host, state.settings.server.port));

    RequestContext::new(
        state.settings.server.scheme.clone(),
        host,
        state.settings.web_root(),
    )
}

async fn cookie_name(state: &AppState) -> String {
    state
        .workflow
        .services()
        .config
        .get_text(keys::COOKIE_NAME, &state.settings.setup.session_cookie)
        .await
}

async fn with_session_cookie(state: &AppState, mut response: Response, signed_in: Option<&SignedIn>) -> Response {
    let Some(signed_in) = signed_in else {
        return response;
    };

    let name = cookie_name(state).await;
    let domain = state
        .workflow
        .services()
        .config
        .get_text(keys::COOKIE_DOMAIN, "")
        .await;
    let cookie = session_cookie(&name, signed_in, &domain, &state.settings.web_root());

    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(SET_COOKIE, value);
        }
        Err(e) => warn!(
            "[PHASE: http] [STEP: cookie] Could not encode session cookie: {}",
            e
        ),
    }
    response
}

async fn render(state: &AppState, outcome: IndexOutcome) -> Response {
    match outcome {
        IndexOutcome::PrerequisitesFailed(errors) => {
            Json(SetupPage::prerequisites(errors)).into_response()
        }
        IndexOutcome::Form(result) => {
            let response =
                Json(SetupPage::configure(result.form, result.posted, result.errors)).into_response();
            with_session_cookie(state, response, result.signed_in.as_ref()).await
        }
        IndexOutcome::Installed {
            redirect_to,
            signed_in,
        } => {
            let response = Redirect::to(redirect_to).into_response();
            with_session_cookie(state, response, signed_in.as_ref()).await
        }
    }
}

pub async fn show_setup(State(state): State<AppState>, headers: HeaderMap) -> SetupResult<Response> {
    let ctx = request_context(&state, &headers);
    let outcome = state.workflow.index(None, &ctx).await?;
    Ok(render(&state, outcome).await)
}

pub async fn submit_setup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ConfigureForm>,
) -> SetupResult<Response> {
    let ctx = request_context(&state, &headers);
    info!(
        "[PHASE: http] [STEP: setup] Setup form posted (host={})",
        ctx.host
    );
    let outcome = state.workflow.index(Some(form), &ctx).await?;
    Ok(render(&state, outcome).await)
}

pub async fn first(State(state): State<AppState>, headers: HeaderMap) -> SetupResult<Redirect> {
    let name = cookie_name(&state).await;
    let token = headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| cookie_value(h, &name));

    let target = state.workflow.first(token.as_deref()).await?;
    Ok(Redirect::to(target))
}
