//! Per-fleet launch user-data templates.
//!
//! A fleet may ship a `configuration-<fleet>.txt` template in the configured
//! template directory. The template is a format string with positional
//! directives: `%s` takes the next argument, `%N$s` takes argument `N`
//! (1-based), `%n` is a newline and `%%` a literal percent sign. Arguments
//! are supplied by the caller, typically API key, secret and region.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while loading or rendering a user-data template.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum UserDataError {
    /// Raised when the template exists but cannot be read.
    #[error("failed to read user-data template `{path}`: {message}")]
    FileRead {
        /// Template path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a directive refers to an argument that was not supplied.
    #[error("user-data template refers to argument {index} but only {available} were supplied")]
    MissingArgument {
        /// 1-based argument index requested by the template.
        index: usize,
        /// Number of arguments supplied.
        available: usize,
    },
    /// Raised for directives other than `%s`, `%N$s`, `%n` and `%%`.
    #[error("unsupported user-data directive `%{directive}`")]
    UnsupportedDirective {
        /// Directive text following the percent sign.
        directive: String,
    },
}

/// Returns the template file name for `fleet`.
#[must_use]
pub fn template_file_name(fleet: &str) -> String {
    format!("configuration-{fleet}.txt")
}

/// Loads the template for `fleet` from `dir`. A missing template is not an
/// error and yields `None`. Surrounding whitespace is trimmed.
///
/// # Errors
///
/// Returns [`UserDataError::FileRead`] when the directory or an existing
/// template cannot be read.
pub fn load_template(dir: &Utf8Path, fleet: &str) -> Result<Option<String>, UserDataError> {
    let file_name = template_file_name(fleet);
    let read_error = |message: String| UserDataError::FileRead {
        path: dir.join(&file_name).into_string(),
        message,
    };

    let handle = Dir::open_ambient_dir(dir, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    if !handle.exists(&file_name) {
        return Ok(None);
    }
    let content = handle
        .read_to_string(&file_name)
        .map_err(|err| read_error(err.to_string()))?;
    Ok(Some(content.trim().to_owned()))
}

/// Substitutes `args` into `template`.
///
/// # Errors
///
/// Returns [`UserDataError::MissingArgument`] when a directive refers past
/// the supplied arguments and [`UserDataError::UnsupportedDirective`] for
/// unknown directives, including a trailing lone `%`.
pub fn render(template: &str, args: &[String]) -> Result<String, UserDataError> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_sequential = 0_usize;

    while let Some(ch) = chars.next() {
        if ch != '%' {
            rendered.push(ch);
            continue;
        }

        let mut digits = String::new();
        while let Some(digit) = chars.next_if(char::is_ascii_digit) {
            digits.push(digit);
        }

        let index = if digits.is_empty() {
            match chars.next() {
                Some('%') => {
                    rendered.push('%');
                    continue;
                }
                Some('n') => {
                    rendered.push('\n');
                    continue;
                }
                Some('s') => {
                    next_sequential += 1;
                    next_sequential
                }
                other => {
                    return Err(UserDataError::UnsupportedDirective {
                        directive: other.map(String::from).unwrap_or_default(),
                    });
                }
            }
        } else {
            match (chars.next(), chars.next()) {
                (Some('$'), Some('s')) => digits.parse::<usize>().unwrap_or(0),
                (first, second) => {
                    let mut directive = digits;
                    directive.extend(first);
                    directive.extend(second);
                    return Err(UserDataError::UnsupportedDirective { directive });
                }
            }
        };

        let value = index
            .checked_sub(1)
            .and_then(|position| args.get(position))
            .ok_or(UserDataError::MissingArgument {
                index,
                available: args.len(),
            })?;
        rendered.push_str(value);
    }

    Ok(rendered)
}

/// Loads and renders the user-data for `fleet`. Any failure is logged and
/// treated as "no user-data" so that provisioning can proceed.
#[must_use]
pub fn resolve_user_data(
    template_dir: Option<&Utf8Path>,
    fleet: &str,
    args: &[String],
) -> Option<String> {
    let dir = template_dir?;
    let template = match load_template(dir, fleet) {
        Ok(Some(template)) => template,
        Ok(None) => {
            debug!(fleet, dir = %dir, "no user-data template for fleet");
            return None;
        }
        Err(err) => {
            warn!(fleet, error = %err, "ignoring unreadable user-data template");
            return None;
        }
    };

    match render(&template, args) {
        Ok(user_data) => {
            debug!(fleet, bytes = user_data.len(), "rendered user-data");
            Some(user_data)
        }
        Err(err) => {
            warn!(fleet, error = %err, "launching without user-data");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    fn args() -> Vec<String> {
        ["AKIA", "s3cr3t", "eu-west-1"].map(String::from).to_vec()
    }

    #[rstest]
    #[case("key=%s secret=%s region=%s", "key=AKIA secret=s3cr3t region=eu-west-1")]
    #[case("region=%3$s key=%1$s", "region=eu-west-1 key=AKIA")]
    #[case("100%% done%n", "100% done\n")]
    #[case("no directives", "no directives")]
    fn renders_directives(#[case] template: &str, #[case] expected: &str) {
        assert_eq!(render(template, &args()).as_deref(), Ok(expected));
    }

    #[test]
    fn missing_argument_is_reported() {
        assert_eq!(
            render("%4$s", &args()),
            Err(UserDataError::MissingArgument {
                index: 4,
                available: 3
            })
        );
    }

    #[rstest]
    #[case("%d", "d")]
    #[case("trailing %", "")]
    #[case("%2x", "2x")]
    fn unsupported_directives_are_rejected(#[case] template: &str, #[case] directive: &str) {
        assert_eq!(
            render(template, &args()),
            Err(UserDataError::UnsupportedDirective {
                directive: directive.to_owned()
            })
        );
    }

    #[test]
    fn resolves_template_from_directory() {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        std::fs::write(
            path.join("configuration-web.txt"),
            "\n#!/bin/sh\nexport REGION=%3$s\n\n",
        )
        .expect("write template");

        assert_eq!(
            resolve_user_data(Some(&path), "web", &args()),
            Some(String::from("#!/bin/sh\nexport REGION=eu-west-1"))
        );
        assert_eq!(resolve_user_data(Some(&path), "db", &args()), None);
        assert_eq!(resolve_user_data(None, "web", &args()), None);
    }

    #[test]
    fn render_failure_is_not_fatal() {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        std::fs::write(path.join("configuration-web.txt"), "%9$s").expect("write template");

        assert_eq!(resolve_user_data(Some(&path), "web", &args()), None);
    }
}
