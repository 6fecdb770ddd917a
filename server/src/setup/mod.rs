// Setup workflow
//
// Entry points for the installation wizard. `index` checks prerequisites, runs the
// configuration collector and, once it succeeds, enables the applications and flips
// `Garden.Installed`. `first` re-enables plugins for the signed-in superuser.

pub mod configure;
pub mod prerequisites;
pub mod rewrite;
pub mod validation;

use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::auth::{Authenticator, SignedIn};
use crate::config_store::{keys, ConfigStore, ConfigValues};
use crate::database::connection::{Database, DbConnector};
use crate::database::structure::SchemaInstaller;
use crate::database::users::UserStore;
use crate::error::{SetupError, SetupResult};
use crate::extensions::{ExtensionRegistry, DASHBOARD};
use crate::models::requests::ConfigureForm;
use crate::utils::validation::strip_tags;
use configure::{ConfigureResult, RequestContext};
use prerequisites::{PrerequisiteChecker, PrerequisiteReport, RuntimeProbe};
use rewrite::{HttpProbe, ServerModules};
use validation::{IssueKind, ValidationResults};

pub const SETTINGS_URL: &str = "/settings";
/// Granted to no role, so only the superuser flag passes.
pub const FIRST_PERMISSION: &str = "Garden.First";
pub const INSTALLED_ERROR_VIEW: &str = "error.master";

/// Collaborators the wizard drives.
#[derive(Clone)]
pub struct SetupServices {
    pub config: Arc<ConfigStore>,
    pub database: Arc<Database>,
    pub connector: Arc<dyn DbConnector>,
    pub schema: Arc<dyn SchemaInstaller>,
    pub users: Arc<dyn UserStore>,
    pub auth: Arc<dyn Authenticator>,
    pub extensions: Arc<dyn ExtensionRegistry>,
    pub probe: Arc<dyn HttpProbe>,
    pub modules: Arc<dyn ServerModules>,
    pub runtime: Arc<dyn RuntimeProbe>,
}

#[derive(Debug, Clone)]
pub enum IndexOutcome {
    PrerequisitesFailed(ValidationResults),
    Form(ConfigureResult),
    Installed {
        redirect_to: &'static str,
        signed_in: Option<SignedIn>,
    },
}

/// Holds the in-progress flag for one install run; released on drop.
struct InstallGuard<'a>(&'a AtomicBool);

impl<'a> InstallGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SetupWorkflow {
    services: SetupServices,
    checker: PrerequisiteChecker,
    installing: AtomicBool,
}

impl SetupWorkflow {
    pub fn new(services: SetupServices, checker: PrerequisiteChecker) -> Self {
        Self {
            services,
            checker,
            installing: AtomicBool::new(false),
        }
    }

    pub fn services(&self) -> &SetupServices {
        &self.services
    }

    pub async fn check_prerequisites(&self) -> PrerequisiteReport {
        self.checker.check().await
    }

    /// `GET /setup` when `submission` is `None`, `POST /setup` otherwise.
    pub async fn index(
        &self,
        submission: Option<ConfigureForm>,
        ctx: &RequestContext,
    ) -> SetupResult<IndexOutcome> {
        if self.services.config.is_installed().await {
            warn!("[PHASE: setup] [STEP: index] Setup requested but the forum is already installed");
            return Err(SetupError::AlreadyInstalled);
        }

        let report = self.check_prerequisites().await;
        if !report.ok() {
            return Ok(IndexOutcome::PrerequisitesFailed(report.errors));
        }

        let applications = self.services.extensions.available_applications().await?;

        let Some(form) = submission else {
            let result = configure::run(&self.services, &applications, None, ctx).await;
            return Ok(IndexOutcome::Form(result));
        };

        let Some(_guard) = InstallGuard::try_acquire(&self.installing) else {
            warn!("[PHASE: setup] [STEP: index] Rejected submission; another installation is running");
            let mut errors = ValidationResults::default();
            errors.add_error(
                IssueKind::Installation,
                "An installation is already in progress. Please wait for it to finish.",
            );
            return Ok(IndexOutcome::Form(ConfigureResult {
                posted: true,
                form,
                errors,
                signed_in: None,
            }));
        };

        let mut result = configure::run(&self.services, &applications, Some(form), ctx).await;
        if !result.ok() {
            return Ok(IndexOutcome::Form(result));
        }

        for folder in applications.keys() {
            if folder.eq_ignore_ascii_case(DASHBOARD) {
                continue;
            }
            let enabled = match self.services.extensions.register_permissions(folder).await {
                Ok(()) => self.services.extensions.enable_application(folder).await,
                Err(e) => Err(e),
            };
            if let Err(e) = enabled {
                error!(
                    "[PHASE: setup] [STEP: enable_applications] Failed to enable '{}': {:#}",
                    folder, e
                );
                result
                    .errors
                    .add_error(IssueKind::Installation, strip_tags(&format!("{:#}", e)));
                break;
            }
        }

        if !result.ok() {
            return Ok(IndexOutcome::Form(result));
        }

        let mut finals = ConfigValues::new();
        finals.insert(keys::ERRORS_MASTER_VIEW.into(), INSTALLED_ERROR_VIEW.into());
        self.services.config.mark_installed(finals).await?;

        info!("[PHASE: setup] [STEP: index] Installation complete");
        Ok(IndexOutcome::Installed {
            redirect_to: SETTINGS_URL,
            signed_in: result.signed_in,
        })
    }

    /// `GET /setup/first`: re-enable every recorded plugin for a superuser.
    pub async fn first(&self, session_token: Option<&str>) -> SetupResult<&'static str> {
        let user = match session_token {
            Some(token) => match self.services.auth.session_user(token).await {
                Ok(user) => user,
                Err(e) => {
                    warn!(
                        "[PHASE: setup] [STEP: first] Session lookup failed: {:#}",
                        e
                    );
                    None
                }
            },
            None => None,
        };

        let Some(user) = user.filter(|u| u.check_permission(FIRST_PERMISSION)) else {
            warn!("[PHASE: setup] [STEP: first] Permission denied");
            return Err(SetupError::PermissionDenied);
        };

        let plugins = self.services.extensions.enabled_plugins().await?;
        info!(
            "[PHASE: setup] [STEP: first] Re-enabling {} plugin(s) (user_id={})",
            plugins.len(),
            user.user_id
        );
        for (name, folder) in &plugins {
            if let Err(e) = self.services.extensions.enable_plugin(name, folder).await {
                warn!(
                    "[PHASE: setup] [STEP: first] Skipping plugin '{}': {:#}",
                    name, e
                );
            }
        }

        Ok(SETTINGS_URL)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::auth::{AuthError, Credentials, SessionUser};
    use crate::database::connection::{DatabaseSettings, DriverError};
    use crate::database::structure::StructureReport;
    use crate::database::users::{
        plan_admin_save, validate_admin_fields, AdminSave, AdminUserFields, ExistingUser,
        SaveUserError, UserId,
    };
    use crate::extensions::ExtensionInfo;
    use crate::settings::SetupPaths;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use rewrite::{ProbeError, ProbeResponse};
    use std::collections::{BTreeMap, HashMap};
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    pub struct StubConnector {
        pub error: Option<DriverError>,
        pub calls: AtomicU32,
    }

    #[async_trait]
    impl DbConnector for StubConnector {
        async fn connect(&self, _settings: &DatabaseSettings) -> Result<(), DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    pub struct StubSchema {
        pub failure: Option<String>,
        pub calls: Mutex<Vec<(bool, bool)>>,
    }

    #[async_trait]
    impl SchemaInstaller for StubSchema {
        async fn install(&self, drop_existing: bool, explicit: bool) -> Result<StructureReport> {
            self.calls.lock().unwrap().push((drop_existing, explicit));
            match &self.failure {
                Some(msg) => Err(anyhow::anyhow!(msg.clone())),
                None => Ok(StructureReport {
                    created: vec!["GDN_User".into()],
                    ..Default::default()
                }),
            }
        }
    }

    #[derive(Default)]
    pub struct StubUsers {
        pub saved: Mutex<Vec<AdminUserFields>>,
        pub taken_names: Vec<String>,
    }

    #[async_trait]
    impl UserStore for StubUsers {
        async fn define_schema(&self) -> Result<()> {
            Ok(())
        }

        async fn save_admin_user(&self, fields: &AdminUserFields) -> Result<UserId, SaveUserError> {
            let issues = validate_admin_fields(fields);
            if !issues.is_empty() {
                return Err(SaveUserError::Validation(issues));
            }
            let mut saved = self.saved.lock().unwrap();
            // Saved rows are admins; taken names belong to ordinary members.
            let existing: Vec<ExistingUser> = saved
                .iter()
                .enumerate()
                .map(|(i, u)| ExistingUser {
                    user_id: i as UserId + 1,
                    name: u.name.trim().to_string(),
                    email: u.email.trim().to_string(),
                    admin: true,
                })
                .chain(self.taken_names.iter().map(|n| ExistingUser {
                    user_id: 0,
                    name: n.clone(),
                    email: String::new(),
                    admin: false,
                }))
                .collect();
            match plan_admin_save(&fields.name, &fields.email, &existing) {
                AdminSave::Conflict(issues) => Err(SaveUserError::Validation(issues)),
                AdminSave::Reuse(user_id) => {
                    saved[user_id as usize - 1] = fields.clone();
                    Ok(user_id)
                }
                AdminSave::Insert => {
                    saved.push(fields.clone());
                    Ok(saved.len() as UserId)
                }
            }
        }
    }

    #[derive(Default)]
    pub struct StubAuth {
        pub reject: bool,
        pub sessions: Mutex<HashMap<String, SessionUser>>,
    }

    #[async_trait]
    impl Authenticator for StubAuth {
        async fn authenticate(&self, credentials: &Credentials) -> Result<SignedIn, AuthError> {
            if self.reject {
                return Err(AuthError::InvalidCredentials);
            }
            Ok(SignedIn {
                user_id: 1,
                token: format!("token-for-{}", credentials.email),
                expires_at: Utc::now() + Duration::days(30),
                persistent: credentials.remember_me,
            })
        }

        async fn session_user(&self, token: &str) -> Result<Option<SessionUser>> {
            Ok(self.sessions.lock().unwrap().get(token).cloned())
        }
    }

    #[derive(Default)]
    pub struct StubExtensions {
        pub applications: BTreeMap<String, ExtensionInfo>,
        pub plugins: BTreeMap<String, String>,
        pub fail_application: Mutex<Option<String>>,
        pub enabled_applications: Mutex<Vec<String>>,
        pub enabled_plugin_calls: Mutex<Vec<String>>,
    }

    impl StubExtensions {
        pub fn with_applications(folders: &[(&str, Option<&str>)]) -> Self {
            let applications = folders
                .iter()
                .map(|(folder, version)| {
                    (
                        folder.to_string(),
                        ExtensionInfo {
                            name: folder.to_string(),
                            version: version.map(str::to_string),
                            description: String::new(),
                            permissions: Vec::new(),
                            folder: folder.to_string(),
                        },
                    )
                })
                .collect();
            Self {
                applications,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ExtensionRegistry for StubExtensions {
        async fn available_applications(&self) -> Result<BTreeMap<String, ExtensionInfo>> {
            Ok(self.applications.clone())
        }

        async fn enabled_plugins(&self) -> Result<BTreeMap<String, String>> {
            Ok(self.plugins.clone())
        }

        async fn enable_plugin(&self, name: &str, _folder: &str) -> Result<()> {
            self.enabled_plugin_calls.lock().unwrap().push(name.to_string());
            if name == "Broken" {
                anyhow::bail!("<b>Broken</b> plugin");
            }
            Ok(())
        }

        async fn register_permissions(&self, _application: &str) -> Result<()> {
            Ok(())
        }

        async fn enable_application(&self, application: &str) -> Result<()> {
            if self.fail_application.lock().unwrap().as_deref() == Some(application) {
                anyhow::bail!("<p>Could not enable <code>{}</code></p>", application);
            }
            self.enabled_applications
                .lock()
                .unwrap()
                .push(application.to_string());
            Ok(())
        }
    }

    pub enum StubProbe {
        Respond(u16, bool),
        Unsupported,
    }

    #[async_trait]
    impl HttpProbe for StubProbe {
        async fn head(&self, _url: &str) -> Result<ProbeResponse, ProbeError> {
            match self {
                StubProbe::Respond(status, with_header) => {
                    let mut headers = BTreeMap::new();
                    if *with_header {
                        headers.insert("x-garden-version".to_string(), "test".to_string());
                    }
                    Ok(ProbeResponse {
                        status: *status,
                        headers,
                    })
                }
                StubProbe::Unsupported => Err(ProbeError::Unsupported("stub".into())),
            }
        }
    }

    pub struct StubModules(pub Option<Vec<String>>);

    #[async_trait]
    impl ServerModules for StubModules {
        async fn loaded_modules(&self) -> Option<Vec<String>> {
            self.0.clone()
        }
    }

    pub struct StubRuntime;

    impl RuntimeProbe for StubRuntime {
        fn runtime_version(&self) -> String {
            "1.80.0".to_string()
        }
        fn has_database_driver(&self) -> bool {
            true
        }
        fn has_driver_feature(&self) -> bool {
            true
        }
        fn can_process_images(&self) -> bool {
            true
        }
    }

    /// Stubs with the happy-path defaults; tests tweak fields before `build`.
    pub struct Fixture {
        pub connector: Arc<StubConnector>,
        pub schema: Arc<StubSchema>,
        pub users: Arc<StubUsers>,
        pub auth: Arc<StubAuth>,
        pub extensions: Arc<StubExtensions>,
        pub probe: Arc<StubProbe>,
        pub modules: Arc<StubModules>,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                connector: Arc::new(StubConnector {
                    error: None,
                    calls: AtomicU32::new(0),
                }),
                schema: Arc::new(StubSchema {
                    failure: None,
                    calls: Mutex::new(Vec::new()),
                }),
                users: Arc::new(StubUsers::default()),
                auth: Arc::new(StubAuth::default()),
                extensions: Arc::new(StubExtensions::with_applications(&[
                    ("dashboard", Some("2.0.18")),
                    ("vanilla", Some("2.0.18")),
                    ("conversations", None),
                ])),
                probe: Arc::new(StubProbe::Respond(200, true)),
                modules: Arc::new(StubModules(None)),
            }
        }
    }

    /// Forum root with conf/, cache/ and uploads/ in place.
    pub fn prepared_root() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        for d in ["conf", "cache", "uploads"] {
            std::fs::create_dir_all(tmp.path().join(d)).unwrap();
        }
        tmp
    }

    impl Fixture {
        pub async fn build(&self, root: &Path) -> (SetupWorkflow, Arc<ConfigStore>) {
            let paths = SetupPaths::under(root);
            let config = Arc::new(ConfigStore::open(&paths.config_file).await.unwrap());
            let runtime: Arc<dyn RuntimeProbe> = Arc::new(StubRuntime);
            let services = SetupServices {
                config: config.clone(),
                database: Arc::new(Database::new()),
                connector: self.connector.clone(),
                schema: self.schema.clone(),
                users: self.users.clone(),
                auth: self.auth.clone(),
                extensions: self.extensions.clone(),
                probe: self.probe.clone(),
                modules: self.modules.clone(),
                runtime: runtime.clone(),
            };
            let checker = PrerequisiteChecker::new(paths, "1.78.0", runtime);
            (SetupWorkflow::new(services, checker), config)
        }
    }

    pub fn valid_form() -> ConfigureForm {
        ConfigureForm {
            title: "My Forum".into(),
            locale: "en-CA".into(),
            database_host: "localhost".into(),
            database_name: "forum".into(),
            database_user: "forum".into(),
            database_password: "dbpass".into(),
            email: "admin@example.com".into(),
            name: "admin1".into(),
            password: "Passw0rd!".into(),
            password_match: "Passw0rd!".into(),
        }
    }

    pub fn ctx() -> RequestContext {
        RequestContext::new("http", "forum.example.com", "/")
    }
}
