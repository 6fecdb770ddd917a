// Response view models
//
// Pages are rendered as JSON: the view name, the form values to show and any issues.

use serde::Serialize;

use super::requests::ConfigureForm;
use crate::setup::validation::ValidationResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SetupView {
    /// The server is not ready; only the problems are shown.
    Prerequisites,
    Configure,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPage {
    pub view: SetupView,
    pub posted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<ConfigureForm>,
    pub errors: ValidationResults,
}

impl SetupPage {
    pub fn prerequisites(errors: ValidationResults) -> Self {
        Self {
            view: SetupView::Prerequisites,
            posted: false,
            form: None,
            errors,
        }
    }

    pub fn configure(form: ConfigureForm, posted: bool, errors: ValidationResults) -> Self {
        Self {
            view: SetupView::Configure,
            posted,
            form: Some(form),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::validation::IssueKind;

    #[test]
    fn prerequisites_page_has_no_form() {
        let mut errors = ValidationResults::default();
        errors.add_error(IssueKind::Environment, "upgrade");
        let json = serde_json::to_value(SetupPage::prerequisites(errors)).unwrap();
        assert_eq!(json["view"], "prerequisites");
        assert!(json.get("form").is_none());
        assert_eq!(json["errors"][0]["message"], "upgrade");
    }

    #[test]
    fn configure_page_echoes_form_without_passwords() {
        let form = ConfigureForm {
            password: "secret".into(),
            ..ConfigureForm::with_defaults()
        };
        let json = serde_json::to_value(SetupPage::configure(form, true, ValidationResults::default())).unwrap();
        assert_eq!(json["view"], "configure");
        assert_eq!(json["posted"], true);
        assert_eq!(json["form"]["Database.Host"], "localhost");
        assert!(json["form"].get("Password").is_none());
    }
}
