// Request models
//
// The setup form posts dotted field names (`Database.Host`), matching the keys they are
// saved under in the forum configuration.

use serde::{Deserialize, Serialize};

use crate::database::connection::DatabaseSettings;
use crate::database::users::AdminUserFields;

pub const DEFAULT_DATABASE_HOST: &str = "localhost";
pub const DEFAULT_LOCALE: &str = "en-CA";

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureForm {
    #[serde(rename = "Garden.Title")]
    pub title: String,
    #[serde(rename = "Garden.Locale")]
    pub locale: String,
    #[serde(rename = "Database.Host")]
    pub database_host: String,
    #[serde(rename = "Database.Name")]
    pub database_name: String,
    #[serde(rename = "Database.User")]
    pub database_user: String,
    #[serde(rename = "Database.Password", skip_serializing)]
    pub database_password: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Password", skip_serializing)]
    pub password: String,
    #[serde(rename = "PasswordMatch", skip_serializing)]
    pub password_match: String,
}

impl std::fmt::Debug for ConfigureForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigureForm")
            .field("title", &self.title)
            .field("locale", &self.locale)
            .field("database", &self.database_settings())
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ConfigureForm {
    /// Values shown on a fresh form.
    pub fn with_defaults() -> Self {
        Self {
            database_host: DEFAULT_DATABASE_HOST.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
            ..Default::default()
        }
    }

    /// Locale as submitted, or the default when left blank.
    pub fn locale_or_default(&self) -> String {
        let locale = self.locale.trim();
        if locale.is_empty() {
            DEFAULT_LOCALE.to_string()
        } else {
            locale.to_string()
        }
    }

    pub fn database_settings(&self) -> DatabaseSettings {
        DatabaseSettings::new(
            self.database_host.trim(),
            self.database_name.trim(),
            self.database_user.trim(),
            self.database_password.clone(),
        )
    }

    pub fn admin_fields(&self) -> AdminUserFields {
        AdminUserFields {
            name: self.name.clone(),
            email: self.email.clone(),
            password: self.password.clone(),
            password_match: self.password_match.clone(),
        }
    }
}
