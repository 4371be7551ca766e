use std::fmt;

use crate::error::{AppError, Result};

/// How an element was (or will be) found.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Id(String),
    AccessibilityId(String),
    ClassName(String),
    XPath(String),
    UiAutomator(String),
}

/// W3C/Appium strategies this server knows by name but does not serve.
const UNSUPPORTED_STRATEGIES: &[&str] = &[
    "css selector",
    "link text",
    "partial link text",
    "tag name",
    "-android viewtag",
    "-android datamatcher",
    "-android viewmatcher",
];

impl Locator {
    pub fn from_strategy(using: &str, value: &str) -> Result<Locator> {
        let locator = match using {
            "id" => Locator::Id(value.to_string()),
            "accessibility id" => Locator::AccessibilityId(value.to_string()),
            "class name" => Locator::ClassName(value.to_string()),
            "xpath" => Locator::XPath(value.to_string()),
            "-android uiautomator" => Locator::UiAutomator(value.to_string()),
            other if UNSUPPORTED_STRATEGIES.contains(&other) => {
                return Err(AppError::NotImplemented(format!(
                    "locator strategy '{other}' is not supported"
                )));
            }
            other => {
                return Err(AppError::InvalidSelector(format!(
                    "unknown locator strategy '{other}'"
                )));
            }
        };
        if locator.value().is_empty() {
            return Err(AppError::InvalidSelector(format!(
                "empty selector for strategy '{using}'"
            )));
        }
        Ok(locator)
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Locator::Id(_) => "id",
            Locator::AccessibilityId(_) => "accessibility id",
            Locator::ClassName(_) => "class name",
            Locator::XPath(_) => "xpath",
            Locator::UiAutomator(_) => "-android uiautomator",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Locator::Id(v)
            | Locator::AccessibilityId(v)
            | Locator::ClassName(v)
            | Locator::XPath(v)
            | Locator::UiAutomator(v) => v,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.strategy(), self.value())
    }
}

/// Qualifies a bare resource id with the app package: `foo` -> `com.example:id/foo`.
pub fn rewrite_id_locator(id: &str, app_package: Option<&str>, autocompletion_disabled: bool) -> String {
    if autocompletion_disabled || id.contains(":id/") {
        return id.to_string();
    }
    match app_package.filter(|p| !p.is_empty()) {
        Some(package) => {
            let rewritten = format!("{package}:id/{id}");
            tracing::info!(from = id, to = %rewritten, "qualified id locator with app package");
            rewritten
        }
        None => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ids_get_the_app_package() {
        assert_eq!(
            rewrite_id_locator("foo", Some("com.example"), false),
            "com.example:id/foo"
        );
        assert_eq!(rewrite_id_locator("foo", Some("com.example"), true), "foo");
        assert_eq!(
            rewrite_id_locator("com.other:id/bar", Some("com.example"), false),
            "com.other:id/bar"
        );
        assert_eq!(
            rewrite_id_locator("com.other:id/bar", Some("com.example"), true),
            "com.other:id/bar"
        );
        assert_eq!(rewrite_id_locator("foo", None, false), "foo");
    }

    #[test]
    fn strategies_are_classified() {
        assert_eq!(
            Locator::from_strategy("id", "foo").unwrap(),
            Locator::Id("foo".into())
        );
        assert_eq!(
            Locator::from_strategy("-android uiautomator", "text(\"x\")")
                .unwrap()
                .strategy(),
            "-android uiautomator"
        );
        assert!(matches!(
            Locator::from_strategy("css selector", "div"),
            Err(AppError::NotImplemented(_))
        ));
        assert!(matches!(
            Locator::from_strategy("by magic", "x"),
            Err(AppError::InvalidSelector(_))
        ));
        assert!(matches!(
            Locator::from_strategy("xpath", ""),
            Err(AppError::InvalidSelector(_))
        ));
    }
}
