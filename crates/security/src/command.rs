//! Command validation: verb allowlisting with per-verb flag restrictions.
//!
//! A command line is admitted only when its verb is listed and every flag
//! token is one the verb permits. Shell metacharacters are refused on the
//! raw string before tokenization, so nothing smuggled inside a quoted
//! argument reaches a process.

use std::collections::{BTreeMap, BTreeSet};

use toolgate_core::GateError;

/// Substrings that are never allowed anywhere in a command line.
pub const DANGEROUS_PATTERNS: &[&str] = &["|", "&", ";", "`", "$(", ">", "<", "*", "\n", "\r"];

/// Error returned when command validation fails.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandValidationError {
    #[error("Command line is empty")]
    Empty,

    #[error("Command line could not be tokenized: {0}")]
    Unparseable(String),

    #[error("Command contains forbidden character sequence '{}'", pattern.escape_default())]
    DangerousCharacter { pattern: String },

    #[error("Command '{verb}' is not in the allowlist")]
    VerbNotAllowed { verb: String },

    #[error("Flag '{flag}' is not permitted for '{verb}'")]
    FlagNotAllowed { verb: String, flag: String },
}

impl From<CommandValidationError> for GateError {
    fn from(err: CommandValidationError) -> Self {
        match err {
            CommandValidationError::Empty | CommandValidationError::Unparseable(_) => {
                GateError::InvalidInput(err.to_string())
            }
            _ => GateError::AccessDenied(err.to_string()),
        }
    }
}

/// A command line that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub verb: String,
    pub args: Vec<String>,
}

/// Verb allowlist with per-verb permitted flags.
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    allowlist: BTreeMap<String, BTreeSet<String>>,
}

impl CommandValidator {
    pub fn new(allowed: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            allowlist: allowed
                .iter()
                .map(|(verb, flags)| (verb.clone(), flags.iter().cloned().collect()))
                .collect(),
        }
    }

    /// Validate a raw command line and split it into verb and arguments.
    pub fn validate(&self, command_line: &str) -> Result<ValidatedCommand, CommandValidationError> {
        if command_line.trim().is_empty() {
            return Err(CommandValidationError::Empty);
        }

        if let Some(pattern) = DANGEROUS_PATTERNS
            .iter()
            .find(|p| command_line.contains(*p))
        {
            return Err(CommandValidationError::DangerousCharacter {
                pattern: (*pattern).to_string(),
            });
        }

        let mut tokens = shlex::split(command_line)
            .ok_or_else(|| CommandValidationError::Unparseable("unbalanced quotes or trailing escape".into()))?
            .into_iter();

        let verb = tokens.next().ok_or(CommandValidationError::Empty)?;
        let permitted = self
            .allowlist
            .get(&verb)
            .ok_or_else(|| CommandValidationError::VerbNotAllowed { verb: verb.clone() })?;

        let args: Vec<String> = tokens.collect();

        if !permitted.is_empty() {
            for token in args.iter().filter(|t| is_flag(t)) {
                let name = token.split_once('=').map_or(token.as_str(), |(name, _)| name);
                if !permitted.contains(token) && !permitted.contains(name) {
                    return Err(CommandValidationError::FlagNotAllowed {
                        verb,
                        flag: token.clone(),
                    });
                }
            }
        }

        Ok(ValidatedCommand { verb, args })
    }
}

/// `-` alone is a positional (stdin); anything else starting with `-` is a flag.
fn is_flag(token: &str) -> bool {
    token.starts_with('-') && token != "-"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CommandValidator {
        let mut allowed = BTreeMap::new();
        allowed.insert("git".to_string(), vec!["--oneline".to_string(), "-n".to_string()]);
        allowed.insert("ls".to_string(), vec!["-l".to_string(), "-a".to_string()]);
        allowed.insert("echo".to_string(), vec![]);
        CommandValidator::new(&allowed)
    }

    #[test]
    fn allowed_command_splits_args() {
        let cmd = validator().validate("git log --oneline -n 5").unwrap();
        assert_eq!(cmd.verb, "git");
        assert_eq!(cmd.args, vec!["log", "--oneline", "-n", "5"]);
    }

    #[test]
    fn quoted_arguments_stay_together() {
        let cmd = validator().validate(r#"echo "hello world" 'and more'"#).unwrap();
        assert_eq!(cmd.args, vec!["hello world", "and more"]);
    }

    #[test]
    fn unknown_verb_rejected() {
        let err = validator().validate("rm -rf /").unwrap_err();
        assert_eq!(err, CommandValidationError::VerbNotAllowed { verb: "rm".into() });
        assert!(matches!(GateError::from(err), GateError::AccessDenied(_)));
    }

    #[test]
    fn absolute_verb_path_rejected() {
        assert!(matches!(
            validator().validate("/bin/ls -l"),
            Err(CommandValidationError::VerbNotAllowed { .. })
        ));
    }

    #[test]
    fn every_dangerous_pattern_rejected_regardless_of_verb() {
        let v = validator();
        for line in [
            "ls | sh",
            "ls & whoami",
            "ls; rm -rf /",
            "echo `id`",
            "echo $(id)",
            "echo hi > /tmp/x",
            "cat < /etc/passwd",
            "ls *",
            "ls\nrm -rf /",
            "nonexistent | true",
        ] {
            assert!(
                matches!(
                    v.validate(line),
                    Err(CommandValidationError::DangerousCharacter { .. })
                ),
                "expected rejection for {line:?}"
            );
        }
    }

    #[test]
    fn metacharacters_inside_quotes_still_rejected() {
        let err = validator().validate(r#"echo "a;b""#).unwrap_err();
        assert_eq!(
            err,
            CommandValidationError::DangerousCharacter { pattern: ";".into() }
        );
    }

    #[test]
    fn unlisted_flag_rejected() {
        let err = validator().validate("ls -R /").unwrap_err();
        assert_eq!(
            err,
            CommandValidationError::FlagNotAllowed {
                verb: "ls".into(),
                flag: "-R".into()
            }
        );
    }

    #[test]
    fn flag_with_value_matches_by_name() {
        let mut allowed = BTreeMap::new();
        allowed.insert("git".to_string(), vec!["--format".to_string()]);
        let v = CommandValidator::new(&allowed);
        assert!(v.validate("git log --format=oneline").is_ok());
        assert!(v.validate("git log --exec-path=/tmp").is_err());
    }

    #[test]
    fn double_dash_does_not_end_flag_checks() {
        let mut allowed = BTreeMap::new();
        allowed.insert("ls".to_string(), vec!["-l".to_string(), "--".to_string()]);
        let v = CommandValidator::new(&allowed);
        assert!(v.validate("ls -l -- src").is_ok());
        assert_eq!(
            v.validate("ls -- -R").unwrap_err(),
            CommandValidationError::FlagNotAllowed {
                verb: "ls".into(),
                flag: "-R".into()
            }
        );
    }

    #[test]
    fn empty_flag_set_allows_any_flag() {
        assert!(validator().validate("echo -e -n hi").is_ok());
    }

    #[test]
    fn positional_args_are_not_restricted() {
        let cmd = validator().validate("ls -l src ../other -").unwrap();
        assert_eq!(cmd.args, vec!["-l", "src", "../other", "-"]);
    }

    #[test]
    fn empty_and_unbalanced_input_is_invalid() {
        let v = validator();
        assert_eq!(v.validate("   ").unwrap_err(), CommandValidationError::Empty);
        let err = v.validate(r#"echo "unterminated"#).unwrap_err();
        assert!(matches!(err, CommandValidationError::Unparseable(_)));
        assert!(matches!(GateError::from(err), GateError::InvalidInput(_)));
    }
}
