// Configuration collector
//
// Display state returns the defaulted form. Submit state validates, then runs the
// install sequence: save config, install structure, create and sign in the admin,
// detect capabilities, save the final settings. The first failing step stops the
// sequence and its issues are returned with the form.

use log::{error, info, warn};
use std::collections::BTreeMap;

use super::rewrite::detect_rewrite_support;
use super::validation::{IssueKind, ValidationResults};
use super::SetupServices;
use crate::auth::{AuthError, Credentials, SignedIn};
use crate::config_store::{keys, ConfigValue, ConfigValues};
use crate::database::users::{validate_admin_fields, SaveUserError};
use crate::extensions::{ExtensionInfo, DASHBOARD};
use crate::models::requests::ConfigureForm;
use crate::security::crypto::random_string;
use crate::utils::validation::{is_blank, strip_tags};

pub const COOKIE_SALT_LENGTH: usize = 10;
pub const UNKNOWN_VERSION: &str = "Undefined";

/// The parts of the incoming request the collector needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub scheme: String,
    /// `Host` header value, possibly with a port.
    pub host: String,
    /// Normalized with leading and trailing `/`.
    pub web_root: String,
}

impl RequestContext {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, web_root: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            web_root: web_root.into(),
        }
    }

    /// Host without the port.
    pub fn host_name(&self) -> &str {
        let host = self.host.trim();
        if host.starts_with('[') {
            return match host.find(']') {
                Some(end) => &host[..=end],
                None => host,
            };
        }
        host.split(':').next().unwrap_or(host)
    }

    /// `scheme://host[:port]`
    pub fn domain(&self) -> String {
        format!("{}://{}", self.scheme, self.host.trim())
    }
}

/// Cookies get no domain attribute for single-label hosts (`localhost`), which
/// browsers would otherwise reject.
pub fn cookie_domain(host_name: &str) -> String {
    if host_name.contains('.') {
        host_name.to_string()
    } else {
        String::new()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigureResult {
    pub posted: bool,
    pub form: ConfigureForm,
    pub errors: ValidationResults,
    pub signed_in: Option<SignedIn>,
}

impl ConfigureResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn display() -> Self {
        Self {
            posted: false,
            form: ConfigureForm::with_defaults(),
            errors: ValidationResults::default(),
            signed_in: None,
        }
    }

    fn failed(form: ConfigureForm, errors: ValidationResults) -> Self {
        Self {
            posted: true,
            form,
            errors,
            signed_in: None,
        }
    }
}

/// Title, database name and admin account rules. Nothing here touches the outside world.
pub fn validate_form(form: &ConfigureForm) -> ValidationResults {
    let mut errors = ValidationResults::default();

    if is_blank(&form.title) {
        errors.add_field(
            IssueKind::Validation,
            keys::TITLE,
            "You must specify a title for your forum.",
        );
    }
    if is_blank(&form.database_name) {
        errors.add_field(
            IssueKind::Validation,
            keys::DATABASE_NAME,
            "You must specify the name of the database in which you want to set up the forum.",
        );
    }

    errors.extend(validate_admin_fields(&form.admin_fields()));
    errors
}

fn installation_issue(errors: &mut ValidationResults, step: &str, err: &anyhow::Error) {
    error!(
        "[PHASE: setup] [STEP: {}] Step failed: {:#}",
        step, err
    );
    errors.add_error(IssueKind::Installation, strip_tags(&format!("{:#}", err)));
}

pub async fn run(
    services: &SetupServices,
    applications: &BTreeMap<String, ExtensionInfo>,
    submission: Option<ConfigureForm>,
    ctx: &RequestContext,
) -> ConfigureResult {
    let Some(form) = submission else {
        return ConfigureResult::display();
    };

    info!(
        "[PHASE: setup] [STEP: validate] Configuration submitted (form={:?})",
        form
    );

    // 1. Field rules
    let mut errors = validate_form(&form);

    // 2. Live connection test with the submitted credentials
    let db_settings = form.database_settings();
    if let Err(e) = services.connector.connect(&db_settings).await {
        warn!(
            "[PHASE: setup] [STEP: db_connect] Connection test failed (code={:?})",
            e.code
        );
        errors.add_error(IssueKind::Driver, e.user_message());
    }

    // 3. Nothing has been changed yet; bail out with the issues
    if !errors.is_empty() {
        info!(
            "[PHASE: setup] [STEP: validate] Submission rejected ({} issue(s))",
            errors.error_count()
        );
        return ConfigureResult::failed(form, errors);
    }

    // 4. Computed values
    let salt = match random_string(COOKIE_SALT_LENGTH) {
        Ok(s) => s,
        Err(e) => {
            installation_issue(&mut errors, "cookie_salt", &e);
            return ConfigureResult::failed(form, errors);
        }
    };
    let host_name = ctx.host_name().to_string();
    let domain = ctx.domain();

    // 5. Persist the configuration and point the live handle at the new database
    let mut values = ConfigValues::new();
    values.insert(keys::TITLE.into(), form.title.trim().into());
    values.insert(keys::LOCALE.into(), form.locale_or_default().into());
    values.insert(keys::REWRITE_URLS.into(), false.into());
    values.insert(keys::WEB_ROOT.into(), ctx.web_root.clone().into());
    values.insert(keys::COOKIE_SALT.into(), salt.into());
    values.insert(keys::COOKIE_DOMAIN.into(), cookie_domain(&host_name).into());
    values.insert(keys::DATABASE_HOST.into(), db_settings.host.clone().into());
    values.insert(keys::DATABASE_NAME.into(), db_settings.name.clone().into());
    values.insert(keys::DATABASE_USER.into(), db_settings.user.clone().into());
    values.insert(keys::DATABASE_PASSWORD.into(), db_settings.password.clone().into());

    if let Err(e) = services.config.save(values).await {
        installation_issue(&mut errors, "save_config", &e);
        return ConfigureResult::failed(form, errors);
    }

    for (key, value) in [
        (keys::DATABASE_HOST, &db_settings.host),
        (keys::DATABASE_NAME, &db_settings.name),
        (keys::DATABASE_USER, &db_settings.user),
        (keys::DATABASE_PASSWORD, &db_settings.password),
    ] {
        services
            .config
            .set_runtime(key, ConfigValue::from(value.as_str()))
            .await;
    }
    services.config.clear_pending_writes().await;
    services.database.reconfigure(&db_settings).await;

    // 6. Structure and seed data, never dropping existing tables
    match services.schema.install(false, false).await {
        Ok(report) => info!(
            "[PHASE: setup] [STEP: structure] Structure ready (created={}, unchanged={})",
            report.created.len(),
            report.unchanged.len()
        ),
        Err(e) => {
            installation_issue(&mut errors, "structure", &e);
            return ConfigureResult::failed(form, errors);
        }
    }

    // 7. Admin account
    if let Err(e) = services.users.define_schema().await {
        installation_issue(&mut errors, "admin_user", &e);
        return ConfigureResult::failed(form, errors);
    }
    match services.users.save_admin_user(&form.admin_fields()).await {
        Ok(_) => {}
        Err(SaveUserError::Validation(issues)) => {
            errors.extend(issues);
            return ConfigureResult::failed(form, errors);
        }
        Err(SaveUserError::Storage(e)) => {
            installation_issue(&mut errors, "admin_user", &e);
            return ConfigureResult::failed(form, errors);
        }
    }

    // 8. Sign the admin in with a persistent session
    let credentials = Credentials {
        email: form.email.trim().to_string(),
        password: form.password.clone(),
        remember_me: true,
    };
    let signed_in = match services.auth.authenticate(&credentials).await {
        Ok(s) => s,
        Err(AuthError::InvalidCredentials) => {
            errors.add_error(
                IssueKind::Validation,
                AuthError::InvalidCredentials.to_string(),
            );
            return ConfigureResult::failed(form, errors);
        }
        Err(AuthError::Storage(e)) => {
            installation_issue(&mut errors, "sign_in", &e);
            return ConfigureResult::failed(form, errors);
        }
    };

    // 9. Product version from the dashboard's metadata
    let version = applications
        .iter()
        .find(|(folder, _)| folder.eq_ignore_ascii_case(DASHBOARD))
        .and_then(|(_, info)| info.version.clone())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string());

    // 10. Rewrite support
    let can_rewrite = detect_rewrite_support(
        services.probe.as_ref(),
        services.modules.as_ref(),
        &domain,
        &ctx.web_root,
    )
    .await;

    // 11. Final settings
    let mut finals = ConfigValues::new();
    finals.insert(keys::VERSION.into(), version.into());
    finals.insert(keys::WEB_ROOT.into(), ctx.web_root.clone().into());
    finals.insert(keys::REWRITE_URLS.into(), can_rewrite.into());
    finals.insert(keys::DOMAIN.into(), domain.into());
    finals.insert(
        keys::CAN_PROCESS_IMAGES.into(),
        services.runtime.can_process_images().into(),
    );
    finals.insert(
        format!("{}.GettingStarted", keys::ENABLED_PLUGINS),
        "GettingStarted".into(),
    );
    finals.insert(
        format!("{}.HTMLPurifier", keys::ENABLED_PLUGINS),
        "HtmlPurifier".into(),
    );

    if let Err(e) = services.config.save(finals).await {
        installation_issue(&mut errors, "final_settings", &e);
        return ConfigureResult::failed(form, errors);
    }

    info!(
        "[PHASE: setup] [STEP: configure] Configuration complete (user_id={}, rewrite={})",
        signed_in.user_id, can_rewrite
    );

    ConfigureResult {
        posted: true,
        form,
        errors,
        signed_in: Some(signed_in),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_strips_port() {
        let ctx = RequestContext::new("http", "forum.example.com:8080", "/");
        assert_eq!(ctx.host_name(), "forum.example.com");
        assert_eq!(ctx.domain(), "http://forum.example.com:8080");

        let v6 = RequestContext::new("http", "[::1]:8080", "/");
        assert_eq!(v6.host_name(), "[::1]");
    }

    #[test]
    fn cookie_domain_needs_a_dot() {
        assert_eq!(cookie_domain("localhost"), "");
        assert_eq!(cookie_domain("forum.example.com"), "forum.example.com");
    }

    #[test]
    fn validate_form_collects_every_missing_field() {
        let form = ConfigureForm::with_defaults();
        let errors = validate_form(&form);
        assert_eq!(errors.messages_for("Garden.Title").len(), 1);
        assert_eq!(errors.messages_for("Database.Name").len(), 1);
        assert_eq!(errors.messages_for("Name").len(), 1);
        assert_eq!(errors.messages_for("Email").len(), 1);
        assert_eq!(errors.messages_for("Password").len(), 1);
    }
}
