//! Placeholder expansion for profile template strings.
//!
//! Template strings may reference attributes of the artifact they are being
//! rendered against as `%{key}`. Any key outside the recognized set rejects
//! the containing string.

use std::collections::BTreeMap;

use lazy_regex::{regex, Captures};

use crate::registry::AvailablePackage;

/// Errors raised while expanding placeholders.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaceholderError {
    /// The string referenced a placeholder that is not in the recognized set.
    #[error("unknown placeholder %{{{0}}}")]
    Unknown(String),
}

/// Expand every `%{key}` in `input` against `ctx`.
pub fn expand(input: &str, ctx: &AvailablePackage) -> Result<String, PlaceholderError> {
    let pattern = regex!(r"%\{([^}]*)\}");

    let mut unknown: Option<String> = None;
    let result = pattern.replace_all(input, |caps: &Captures| match &caps[1] {
        "install_base" => ctx.install_base.clone(),
        "install_prefix" => ctx.install_prefix.clone(),
        "version" => ctx.version.clone(),
        "display_version" => ctx.display_version.clone(),
        key => {
            if unknown.is_none() {
                unknown = Some(key.to_owned());
            }
            String::new()
        }
    });

    match unknown {
        Some(key) => Err(PlaceholderError::Unknown(key)),
        None => Ok(result.into_owned()),
    }
}

/// Expand each element of a string list.
pub fn expand_list(
    input: &[String],
    ctx: &AvailablePackage,
) -> Result<Vec<String>, PlaceholderError> {
    input.iter().map(|s| expand(s, ctx)).collect()
}

/// Expand each element of a nested string list.
pub fn expand_nested_list(
    input: &[Vec<String>],
    ctx: &AvailablePackage,
) -> Result<Vec<Vec<String>>, PlaceholderError> {
    input.iter().map(|inner| expand_list(inner, ctx)).collect()
}

/// Expand the values of a string map. Keys are kept literal.
pub fn expand_map(
    input: &BTreeMap<String, String>,
    ctx: &AvailablePackage,
) -> Result<BTreeMap<String, String>, PlaceholderError> {
    input
        .iter()
        .map(|(k, v)| Ok((k.clone(), expand(v, ctx)?)))
        .collect()
}

/// Expand the value lists of a string-list map. Keys are kept literal.
pub fn expand_list_map(
    input: &BTreeMap<String, Vec<String>>,
    ctx: &AvailablePackage,
) -> Result<BTreeMap<String, Vec<String>>, PlaceholderError> {
    input
        .iter()
        .map(|(k, v)| Ok((k.clone(), expand_list(v, ctx)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn context() -> AvailablePackage {
        AvailablePackage {
            name: "gcc".to_owned(),
            version: "7.3.0".to_owned(),
            display_version: "7.3.0p1".to_owned(),
            install_base: "/usr/local/torigoya".to_owned(),
            install_prefix: "/usr/local/torigoya/gcc.7.3.0".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn expands_every_recognized_key() {
        let out = expand(
            "%{install_base}:%{install_prefix}:%{version}:%{display_version}",
            &context(),
        )
        .unwrap();
        assert_eq!(
            out,
            "/usr/local/torigoya:/usr/local/torigoya/gcc.7.3.0:7.3.0:7.3.0p1"
        );
    }

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(expand("g++ $src", &context()).unwrap(), "g++ $src");
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert_eq!(
            expand("-I%{include_dir}", &context()),
            Err(PlaceholderError::Unknown("include_dir".to_owned()))
        );
    }

    #[test]
    fn first_unknown_key_is_reported() {
        assert_eq!(
            expand("%{version} %{bogus} %{worse}", &context()),
            Err(PlaceholderError::Unknown("bogus".to_owned()))
        );
    }

    #[test]
    fn list_expansion_propagates_errors() {
        let input = vec!["ok".to_owned(), "%{nope}".to_owned()];
        assert!(expand_list(&input, &context()).is_err());
    }

    #[test]
    fn map_keys_stay_literal() {
        let input = btreemap! {
            "%{version}".to_owned() => "%{version}".to_owned(),
        };
        let out = expand_map(&input, &context()).unwrap();
        assert_eq!(out.get("%{version}").map(String::as_str), Some("7.3.0"));
    }

    #[test]
    fn list_map_values_are_expanded() {
        let input = btreemap! {
            "opt".to_owned() => vec!["-L%{install_prefix}/lib".to_owned()],
        };
        let out = expand_list_map(&input, &context()).unwrap();
        assert_eq!(
            out["opt"],
            vec!["-L/usr/local/torigoya/gcc.7.3.0/lib".to_owned()]
        );
    }

    #[test]
    fn nested_lists_are_expanded() {
        let input = vec![vec!["%{version}".to_owned()], vec!["x".to_owned()]];
        let out = expand_nested_list(&input, &context()).unwrap();
        assert_eq!(out, vec![vec!["7.3.0".to_owned()], vec!["x".to_owned()]]);
    }
}
